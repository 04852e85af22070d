//! In-memory thread storage.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use chrono::Utc;

use crate::error::{ServiceError, ServiceResult};
use crate::models::{Thread, ThreadStatus};

/// Thread-safe in-memory store of conversation threads.
///
/// Reads return copies; all mutation goes through [`ThreadStore::update`]
/// so every change happens under the lock. Nothing outside this type ever
/// holds a reference into the map.
pub struct ThreadStore {
    threads: Mutex<HashMap<String, Thread>>,
}

impl ThreadStore {
    pub fn new() -> Self {
        Self {
            threads: Mutex::new(HashMap::new()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Thread>> {
        match self.threads.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Create a new thread in PROCESSING state and return a copy of it.
    pub fn create(&self, user_prompt: &str, model_id: &str, max_iterations: u32) -> Thread {
        let mut thread = Thread::new(user_prompt, model_id);
        thread.max_iterations = max_iterations;
        self.lock().insert(thread.thread_id.clone(), thread.clone());
        thread
    }

    pub fn get(&self, thread_id: &str) -> ServiceResult<Thread> {
        self.lock()
            .get(thread_id)
            .cloned()
            .ok_or_else(|| ServiceError::ThreadNotFound(thread_id.to_string()))
    }

    /// Copies of all threads, newest first.
    pub fn list(&self) -> Vec<Thread> {
        let mut threads: Vec<Thread> = self.lock().values().cloned().collect();
        threads.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        threads
    }

    /// Mutate a thread under the lock and return a copy of the result.
    pub fn update<F>(&self, thread_id: &str, f: F) -> ServiceResult<Thread>
    where
        F: FnOnce(&mut Thread),
    {
        let mut threads = self.lock();
        let thread = threads
            .get_mut(thread_id)
            .ok_or_else(|| ServiceError::ThreadNotFound(thread_id.to_string()))?;
        f(thread);
        Ok(thread.clone())
    }

    /// Set the status and keep the timestamp bookkeeping consistent.
    pub fn set_status(&self, thread_id: &str, status: ThreadStatus) -> ServiceResult<Thread> {
        self.update(thread_id, |thread| {
            apply_status(thread, status);
        })
    }

    /// Atomically claim an AWAITING_USER_INPUT thread for resumption.
    ///
    /// Flips the status to PROCESSING in the same critical section as the
    /// check, so two concurrent resume attempts cannot both win.
    pub fn begin_resume(&self, thread_id: &str) -> ServiceResult<Thread> {
        let mut threads = self.lock();
        let thread = threads
            .get_mut(thread_id)
            .ok_or_else(|| ServiceError::ThreadNotFound(thread_id.to_string()))?;
        if thread.status != ThreadStatus::AwaitingUserInput {
            return Err(ServiceError::InvalidRequest(format!(
                "thread {} is not awaiting user input (status: {:?})",
                thread_id, thread.status
            )));
        }
        apply_status(thread, ThreadStatus::Processing);
        Ok(thread.clone())
    }

    /// IDs of threads that have been awaiting user input longer than `timeout`.
    pub fn stale_awaiting(&self, timeout: Duration) -> Vec<String> {
        let now = Utc::now();
        let timeout = chrono::Duration::from_std(timeout).unwrap_or(chrono::Duration::MAX);
        self.lock()
            .values()
            .filter(|t| t.status == ThreadStatus::AwaitingUserInput)
            .filter(|t| {
                t.awaiting_input_since
                    .map(|since| now - since > timeout)
                    .unwrap_or(false)
            })
            .map(|t| t.thread_id.clone())
            .collect()
    }
}

impl Default for ThreadStore {
    fn default() -> Self {
        Self::new()
    }
}

fn apply_status(thread: &mut Thread, status: ThreadStatus) {
    thread.status = status;
    match status {
        ThreadStatus::AwaitingUserInput => {
            thread.awaiting_input_since = Some(Utc::now());
        }
        ThreadStatus::Processing => {
            thread.awaiting_input_since = None;
        }
        ThreadStatus::Completed | ThreadStatus::Error => {
            thread.awaiting_input_since = None;
            thread.completed_at = Some(Utc::now());
        }
    }
}

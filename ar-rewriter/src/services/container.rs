//! Wiring of the service graph and the public operation surface.

use std::sync::{Arc, Mutex, RwLock};

use tracing::info;

use crate::config::{AppConfig, ConfigUpdate};
use crate::error::{ServiceError, ServiceResult};
use crate::models::{ArPolicy, Thread};
use crate::retry::RetryPolicy;
use crate::services::audit::AuditLogger;
use crate::services::llm::{LlmService, ModelClient};
use crate::services::policy::{PolicyClient, PolicyService};
use crate::services::processor::ThreadProcessor;
use crate::services::store::ThreadStore;
use crate::services::timeout::TimeoutSweeper;
use crate::services::validation::{GuardrailClient, ValidationService};

/// Owns every service and exposes the operations callers use.
///
/// Thread processing runs on spawned tasks; the operations here return as
/// soon as the thread is created or claimed, and callers poll
/// [`ServiceContainer::get_thread`] for progress.
pub struct ServiceContainer {
    config: Arc<RwLock<AppConfig>>,
    store: Arc<ThreadStore>,
    processor: Arc<ThreadProcessor>,
    policy: PolicyService,
    sweeper: Mutex<Option<TimeoutSweeper>>,
}

impl ServiceContainer {
    pub fn new(
        config: AppConfig,
        guardrail_client: Arc<dyn GuardrailClient>,
        model_client: Arc<dyn ModelClient>,
        policy_client: Arc<dyn PolicyClient>,
    ) -> ServiceResult<Self> {
        config.validate()?;
        let retry = RetryPolicy {
            max_attempts: config.retry_max_attempts,
            base_delay: config.retry_base_delay(),
        };

        let store = Arc::new(ThreadStore::new());
        let llm = Arc::new(LlmService::new(
            model_client,
            &config.policy_definition,
            retry,
        ));
        let validation = Arc::new(ValidationService::new(
            guardrail_client,
            config.guardrail_id.clone(),
            config.guardrail_version.clone(),
            config.policy_definition.clone(),
            retry,
        ));
        let audit = Arc::new(AuditLogger::new(&config.audit_log_path));
        let processor = Arc::new(ThreadProcessor::new(
            store.clone(),
            llm,
            validation,
            audit,
        ));
        let policy = PolicyService::new(policy_client, retry);

        Ok(Self {
            config: Arc::new(RwLock::new(config)),
            store,
            processor,
            policy,
            sweeper: Mutex::new(None),
        })
    }

    /// Create a thread for a prompt and start processing it in the
    /// background. Returns the thread in its initial PROCESSING state.
    pub fn submit_prompt(&self, user_prompt: &str) -> ServiceResult<Thread> {
        if user_prompt.trim().is_empty() {
            return Err(ServiceError::InvalidRequest("prompt must not be empty".into()));
        }
        let (model_id, max_iterations) = {
            let config = self.read_config();
            (config.model_id, config.max_iterations)
        };
        let thread = self.store.create(user_prompt, &model_id, max_iterations);
        info!(thread_id = %thread.thread_id, "thread created");

        let processor = self.processor.clone();
        let thread_id = thread.thread_id.clone();
        tokio::spawn(async move {
            processor.run_new(&thread_id).await;
        });
        Ok(thread)
    }

    pub fn get_thread(&self, thread_id: &str) -> ServiceResult<Thread> {
        self.store.get(thread_id)
    }

    pub fn list_threads(&self) -> Vec<Thread> {
        self.store.list()
    }

    /// Answer the pending clarification questions and resume processing.
    ///
    /// Fails without touching the thread when the answers do not match the
    /// pending questions or the thread is not awaiting input.
    pub fn submit_answers(&self, thread_id: &str, answers: Vec<String>) -> ServiceResult<Thread> {
        self.processor.prepare_resume(thread_id, Some(answers))?;
        let processor = self.processor.clone();
        let id = thread_id.to_string();
        tokio::spawn(async move {
            processor.run_resume(&id).await;
        });
        self.store.get(thread_id)
    }

    pub async fn list_policies(&self) -> ServiceResult<Vec<ArPolicy>> {
        self.policy.list_policies().await
    }

    pub fn get_config(&self) -> AppConfig {
        self.read_config()
    }

    pub fn update_config(&self, update: ConfigUpdate) -> ServiceResult<AppConfig> {
        let mut config = match self.config.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        config.apply_update(update)?;
        info!(
            model_id = %config.model_id,
            max_iterations = config.max_iterations,
            timeout_minutes = config.timeout_minutes,
            "configuration updated"
        );
        Ok(config.clone())
    }

    /// Start the background sweeper for timed-out clarifications. Idempotent.
    pub fn start_sweeper(&self) {
        let mut slot = self.lock_sweeper();
        if slot.is_none() {
            *slot = Some(TimeoutSweeper::spawn(
                self.store.clone(),
                self.processor.clone(),
                self.config.clone(),
            ));
        }
    }

    /// Stop the sweeper if it is running.
    pub async fn shutdown(&self) {
        let sweeper = self.lock_sweeper().take();
        if let Some(sweeper) = sweeper {
            sweeper.shutdown().await;
        }
    }

    fn read_config(&self) -> AppConfig {
        match self.config.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    fn lock_sweeper(&self) -> std::sync::MutexGuard<'_, Option<TimeoutSweeper>> {
        match self.sweeper.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

//! Background sweeper for threads stuck waiting on user input.

use std::sync::{Arc, RwLock};
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{info, warn};

use crate::config::AppConfig;
use crate::services::processor::ThreadProcessor;
use crate::services::store::ThreadStore;

const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Periodically finds threads that have sat in AWAITING_USER_INPUT past the
/// configured timeout and resumes them with the exchange marked skipped.
///
/// The timeout is re-read from config on every sweep, so runtime config
/// updates apply without a restart.
pub struct TimeoutSweeper {
    shutdown: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

impl TimeoutSweeper {
    pub fn spawn(
        store: Arc<ThreadStore>,
        processor: Arc<ThreadProcessor>,
        config: Arc<RwLock<AppConfig>>,
    ) -> Self {
        let check_interval = Duration::from_secs(read_config(&config).check_interval_seconds);
        let (shutdown, mut shutdown_rx) = watch::channel(false);
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(check_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let timeout =
                            Duration::from_secs(read_config(&config).timeout_minutes * 60);
                        sweep(&store, &processor, timeout).await;
                    }
                    changed = shutdown_rx.changed() => {
                        if changed.is_err() || *shutdown_rx.borrow() {
                            break;
                        }
                    }
                }
            }
        });
        Self { shutdown, handle }
    }

    /// Stop the sweeper and wait briefly for the current sweep to finish.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        if tokio::time::timeout(SHUTDOWN_GRACE, self.handle).await.is_err() {
            warn!("timeout sweeper did not stop within grace period");
        }
    }
}

fn read_config(config: &RwLock<AppConfig>) -> AppConfig {
    match config.read() {
        Ok(guard) => guard.clone(),
        Err(poisoned) => poisoned.into_inner().clone(),
    }
}

async fn sweep(store: &ThreadStore, processor: &ThreadProcessor, input_timeout: Duration) {
    let stale = store.stale_awaiting(input_timeout);
    for thread_id in stale {
        info!(thread_id, "input timed out, skipping clarification");
        // A user answer can still win the race; prepare_resume fails
        // cleanly when the thread is no longer awaiting input.
        match processor.prepare_resume(&thread_id, None) {
            Ok(()) => processor.run_resume(&thread_id).await,
            Err(err) => {
                warn!(thread_id, error = %err, "could not claim timed-out thread");
            }
        }
    }
}

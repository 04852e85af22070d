//! Retry wrapper for backend API calls.

use std::future::Future;
use std::time::Duration;

use tracing::warn;

use crate::error::{ServiceError, ServiceResult};

/// How a failed API call is retried.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// Total attempts, including the first one.
    pub max_attempts: u32,
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(1),
        }
    }
}

impl RetryPolicy {
    /// Delay before re-attempting after the given zero-based attempt failed.
    fn delay_after(&self, attempt: u32) -> Duration {
        self.base_delay * 2u32.saturating_pow(attempt)
    }
}

/// Run `f`, retrying transient failures with exponential backoff.
///
/// Permanent errors fail immediately. Every failure surfaces as one
/// normalized [`ServiceError::Operation`] naming the operation, wrapping
/// the original cause.
pub async fn retry_api_call<T, F, Fut>(
    operation: &str,
    policy: RetryPolicy,
    mut f: F,
) -> ServiceResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = ServiceResult<T>>,
{
    let mut last_err: Option<ServiceError> = None;
    for attempt in 0..policy.max_attempts {
        match f().await {
            Ok(value) => return Ok(value),
            Err(err) if err.is_transient() => {
                warn!(
                    operation,
                    attempt = attempt + 1,
                    max_attempts = policy.max_attempts,
                    error = %err,
                    "transient error, will retry"
                );
                let is_last = attempt + 1 == policy.max_attempts;
                last_err = Some(err);
                if !is_last {
                    tokio::time::sleep(policy.delay_after(attempt)).await;
                }
            }
            Err(err) => {
                return Err(ServiceError::operation(operation, anyhow::Error::new(err)))
            }
        }
    }
    let cause = match last_err {
        Some(err) => anyhow::Error::new(err),
        None => anyhow::anyhow!("retry loop ran zero attempts"),
    };
    Err(ServiceError::operation(operation, cause))
}

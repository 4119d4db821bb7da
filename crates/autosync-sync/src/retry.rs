//! Deadlines and exponential backoff for remote calls
//!
//! Every remote call runs under [`RetryPolicy::call_timeout`]; an elapsed
//! deadline counts as a transient [`StoreError::Timeout`]. Only transient
//! failures are retried, waiting `base_delay * 2^attempt` between attempts.

use std::future::Future;
use std::time::Duration;

use tracing::{info, warn};

use autosync_core::config::SyncConfig;
use autosync_core::domain::StoreError;

use crate::SyncError;

/// Upper bound on the backoff exponent
const MAX_BACKOFF_EXPONENT: u32 = 16;

/// Retry and deadline settings for remote calls
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay: Duration,
    pub call_timeout: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&SyncConfig::default())
    }
}

impl RetryPolicy {
    pub fn from_config(config: &SyncConfig) -> Self {
        Self {
            max_retries: config.max_retries,
            base_delay: config.retry_base_delay(),
            call_timeout: config.remote_timeout(),
        }
    }

    /// Delay before retry number `attempt + 1`
    pub fn delay_for(&self, attempt: u32) -> Duration {
        self.base_delay
            .saturating_mul(1u32 << attempt.min(MAX_BACKOFF_EXPONENT))
    }
}

/// Runs `f` under the policy's deadline, retrying transient failures
pub async fn with_retry<T, E, F, Fut>(
    operation_name: &str,
    policy: &RetryPolicy,
    mut f: F,
) -> Result<T, SyncError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: Into<SyncError>,
{
    let mut attempt = 0u32;
    loop {
        let result = match tokio::time::timeout(policy.call_timeout, f()).await {
            Ok(result) => result.map_err(Into::into),
            Err(_) => Err(SyncError::Store(StoreError::Timeout(
                u64::try_from(policy.call_timeout.as_millis()).unwrap_or(u64::MAX),
            ))),
        };

        match result {
            Ok(value) => {
                if attempt > 0 {
                    info!(
                        operation = operation_name,
                        attempt, "Operation succeeded after retry"
                    );
                }
                return Ok(value);
            }
            Err(err) if attempt < policy.max_retries && err.is_transient() => {
                let delay = policy.delay_for(attempt);
                warn!(
                    operation = operation_name,
                    attempt,
                    delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                    error = %err,
                    "Transient error, retrying"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(err) => return Err(err),
        }
    }
}

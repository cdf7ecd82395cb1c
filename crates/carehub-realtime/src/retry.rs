//! Bounded exponential-backoff retry for subscription setup.
//!
//! The health manager has its own reconnect schedule; this helper only
//! wraps one-shot operations such as a channel join.

use std::future::Future;
use std::time::Duration;

use tracing::{debug, warn};

use carehub_core::config::SubscribeRetryConfig;
use carehub_core::error::{AppError, ErrorKind};
use carehub_core::result::AppResult;

/// Attempt budget and sleep schedule for [`retry`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts, including the first one.
    pub max_attempts: u32,
    /// Sleep after the first failure.
    pub delay: Duration,
    /// Growth factor for each further sleep.
    pub backoff_multiplier: f64,
}

impl RetryPolicy {
    /// Creates a policy.
    pub fn new(max_attempts: u32, delay: Duration, backoff_multiplier: f64) -> Self {
        Self {
            max_attempts,
            delay,
            backoff_multiplier,
        }
    }

    /// Sleep that follows failed attempt number `attempt` (1-based):
    /// `delay * multiplier^(attempt - 1)`.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
        let factor = self.backoff_multiplier.powi(exponent);
        Duration::try_from_secs_f64(self.delay.as_secs_f64() * factor).unwrap_or(Duration::MAX)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from(&SubscribeRetryConfig::default())
    }
}

impl From<&SubscribeRetryConfig> for RetryPolicy {
    fn from(config: &SubscribeRetryConfig) -> Self {
        Self::new(
            config.max_attempts,
            Duration::from_millis(config.delay_ms),
            config.backoff_multiplier,
        )
    }
}

/// Runs `f` until it succeeds or `policy.max_attempts` attempts have failed.
///
/// Only transient failures ([`AppError::is_transient`]) are retried; any
/// other failure is returned as is. After exhaustion the returned error is
/// `ServiceUnavailable` and carries the last failure as its `source`.
pub async fn retry<T, F, Fut>(policy: &RetryPolicy, operation: &str, mut f: F) -> AppResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = AppResult<T>>,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 1;

    loop {
        match f().await {
            Ok(value) => return Ok(value),
            Err(e) if !e.is_transient() => {
                debug!(operation = %operation, attempt, error = %e, "Permanent failure, not retrying");
                return Err(e);
            }
            Err(e) if attempt >= max_attempts => {
                return Err(AppError::with_source(
                    ErrorKind::ServiceUnavailable,
                    format!("{operation} failed after {max_attempts} attempts: {}", e.message),
                    e,
                ));
            }
            Err(e) => {
                let delay = policy.delay_for(attempt);
                warn!(
                    operation = %operation,
                    attempt,
                    max_attempts,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "Operation failed, retrying"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
        }
    }
}

//! Retry with exponential backoff and full jitter.
//!
//! Model requests are the only operation the service retries: the endpoint
//! is remote, shared, and occasionally shedding load. Backoff doubles per
//! attempt and the actual delay is drawn uniformly from `[0, capped_delay)`
//! (full jitter), so concurrent sessions hitting the same outage do not
//! retry in lockstep.
//!
//! Everything else (SQL, storage) either succeeds, fails into the tool
//! result path, or is fatal to the turn; retrying those would hide bugs.

use std::future::Future;
use std::time::Duration;

use tokio::time::sleep;

use crate::{Error, Result};

/// Configuration for retry behavior
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Maximum number of attempts, including the first
    pub max_attempts: u32,

    /// Backoff base before the first retry
    pub initial_delay: Duration,

    /// Upper bound for the backoff base
    pub max_delay: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(8),
        }
    }
}

impl RetryConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts.max(1);
        self
    }

    pub fn with_initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    /// Delay before retry number `attempt` (0-based): uniform over
    /// `[0, min(initial * 2^attempt, max))`.
    fn calculate_delay(&self, attempt: u32) -> Duration {
        let base_ms = self.initial_delay.as_millis() as f64;
        let exponential = base_ms * 2f64.powi(attempt as i32);
        let capped = exponential.min(self.max_delay.as_millis() as f64);
        let jittered = rand::random::<f64>() * capped;
        Duration::from_millis(jittered as u64)
    }
}

/// Whether an error class is worth retrying.
///
/// Transport failures, per-attempt timeouts, stream interruptions and 5xx
/// responses are transient. Policy and input errors are not: repeating the
/// identical request would fail identically.
pub fn is_retryable_error(error: &Error) -> bool {
    match error {
        Error::Http(_) => true,
        Error::Timeout => true,
        Error::Stream(_) => true,
        Error::Api(msg) => {
            msg.contains("500") || msg.contains("502") || msg.contains("503") || msg.contains("504")
        }
        _ => false,
    }
}

/// Retry an async operation, backing off between attempts.
///
/// Non-retryable errors propagate immediately; retryable ones are retried
/// until `max_attempts` is exhausted, then the last error is returned.
pub async fn retry_with_backoff<F, Fut, T>(config: &RetryConfig, mut operation: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut last_error = None;

    for attempt in 0..config.max_attempts {
        match operation().await {
            Ok(result) => return Ok(result),
            Err(err) => {
                if !is_retryable_error(&err) {
                    return Err(err);
                }
                tracing::warn!(attempt, error = %err, "model request failed, will retry");
                last_error = Some(err);

                // No sleep after the final attempt
                if attempt + 1 < config.max_attempts {
                    sleep(config.calculate_delay(attempt)).await;
                }
            }
        }
    }

    Err(last_error.unwrap_or_else(|| Error::other("retry failed with no error")))
}

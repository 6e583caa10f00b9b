//! Bounded retry with exponential backoff for catalog calls

use std::future::Future;
use std::time::Duration;
use tokio::time::sleep;

/// How often and how patiently a transient failure is retried
#[derive(Debug, Clone, PartialEq)]
pub struct RetryConfig {
    /// Total attempts including the first one
    pub max_attempts: u32,
    /// Delay before the second attempt
    pub initial_delay: Duration,
    /// Upper bound for any single delay
    pub max_delay: Duration,
    /// Growth factor between consecutive delays
    pub exponential_base: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 4,
            initial_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(10),
            exponential_base: 2.0,
        }
    }
}

impl RetryConfig {
    /// Single attempt, never retried
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            initial_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            exponential_base: 1.0,
        }
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    /// Delay slept after failed attempt number `attempt` (1-based)
    pub fn delay_after(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1) as i32;
        let secs = self.initial_delay.as_secs_f64() * self.exponential_base.powi(exponent);
        Duration::from_secs_f64(secs.min(self.max_delay.as_secs_f64()))
    }
}

/// Run `f` until it succeeds, fails with an error `is_retryable` rejects, or
/// `max_attempts` is reached. Returns the final result and the number of
/// attempts made.
pub async fn with_retry_if<F, Fut, T, E, P>(
    config: &RetryConfig,
    mut f: F,
    mut is_retryable: P,
) -> (Result<T, E>, u32)
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
    P: FnMut(&E) -> bool,
{
    let max_attempts = config.max_attempts.max(1);
    let mut attempt = 0;

    loop {
        attempt += 1;

        match f(attempt).await {
            Ok(value) => {
                if attempt > 1 {
                    tracing::info!(attempts = attempt, "call succeeded after retry");
                }
                return (Ok(value), attempt);
            }
            Err(e) if !is_retryable(&e) => {
                tracing::debug!(error = %e, "error is not retryable");
                return (Err(e), attempt);
            }
            Err(e) if attempt >= max_attempts => {
                tracing::error!(attempts = attempt, error = %e, "retry attempts exhausted");
                return (Err(e), attempt);
            }
            Err(e) => {
                let delay = config.delay_after(attempt);
                tracing::warn!(
                    attempt,
                    max_attempts,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "attempt failed, retrying"
                );
                sleep(delay).await;
            }
        }
    }
}

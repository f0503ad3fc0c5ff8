//! Bounded retry with exponential backoff
//!
//! Consumers and the relay retry transient failures a fixed number of times
//! before handing the event to the dead-letter store. Terminal failures
//! (invalid envelope, unsupported type) skip the remaining attempts.

use std::future::Future;
use std::time::Duration;

use tokio::time::sleep;
use tracing::{debug, warn};

/// Retry schedule
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Total attempts, including the first one
    pub max_attempts: u32,
    /// Delay before the second attempt; doubles on each retry
    pub initial_backoff: Duration,
    /// Upper bound on the delay between attempts
    pub max_backoff: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(30),
        }
    }
}

impl RetryConfig {
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    /// Delay before attempt `attempt + 1`, given `attempt` attempts already made.
    pub fn backoff_for(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.initial_backoff
            .checked_mul(factor)
            .map(|d| d.min(self.max_backoff))
            .unwrap_or(self.max_backoff)
    }
}

/// Last error of an exhausted (or terminally failed) retry loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryFailure<E> {
    pub error: E,
    pub attempts: u32,
}

/// Retry `operation` until it succeeds or `config.max_attempts` is reached.
///
/// ```rust
/// use event_bus::consumer_retry::{retry_with_backoff, RetryConfig};
///
/// # async fn example() -> Result<(), String> {
/// let config = RetryConfig::default();
/// let value = retry_with_backoff(|| async { Ok::<_, String>(42) }, &config, "example").await?;
/// assert_eq!(value, 42);
/// # Ok(())
/// # }
/// ```
pub async fn retry_with_backoff<F, Fut, T, E>(
    operation: F,
    config: &RetryConfig,
    context: &str,
) -> Result<T, E>
where
    F: Fn() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display + Send,
{
    retry_classified(operation, config, context, |_| true)
        .await
        .map_err(|failure| failure.error)
}

/// Like [`retry_with_backoff`], but stops immediately when `is_retriable`
/// returns false, and reports how many attempts were made.
pub async fn retry_classified<F, Fut, T, E, C>(
    operation: F,
    config: &RetryConfig,
    context: &str,
    is_retriable: C,
) -> Result<T, RetryFailure<E>>
where
    F: Fn() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display + Send,
    C: Fn(&E) -> bool,
{
    let max_attempts = config.max_attempts.max(1);
    let mut attempt = 0;

    loop {
        attempt += 1;

        match operation().await {
            Ok(result) => {
                if attempt > 1 {
                    debug!(context = %context, attempt, "operation succeeded after retry");
                }
                return Ok(result);
            }
            Err(e) if !is_retriable(&e) => {
                warn!(context = %context, attempt, error = %e, "terminal failure, not retrying");
                return Err(RetryFailure { error: e, attempts: attempt });
            }
            Err(e) => {
                if attempt >= max_attempts {
                    warn!(
                        context = %context,
                        attempts = attempt,
                        error = %e,
                        "operation failed after max retries"
                    );
                    return Err(RetryFailure { error: e, attempts: attempt });
                }

                let backoff = config.backoff_for(attempt);
                warn!(
                    context = %context,
                    attempt,
                    max_attempts,
                    backoff_ms = backoff.as_millis() as u64,
                    error = %e,
                    "operation failed, retrying with backoff"
                );
                sleep(backoff).await;
            }
        }
    }
}

//! Resilience utilities: retry logic and backoff.
//!
//! - [`RetryConfig`]: Exponential backoff for transient failures
//! - [`retry`]: Run an async operation under a `RetryConfig`
//!
//! Only errors for which [`RelayError::is_retryable`] holds are retried;
//! everything else is returned on the first failure.
//!
//! # Example
//!
//! ```rust,no_run
//! # async fn example() -> changefeed_relay::Result<()> {
//! use changefeed_relay::resilience::{retry, RetryConfig};
//!
//! let config = RetryConfig::testing();
//! let value = retry("fetch_answer", &config, || async { Ok(42) }).await?;
//! assert_eq!(value, 42);
//! # Ok(())
//! # }
//! ```

use crate::error::{RelayError, Result};
use std::future::Future;
use std::time::Duration;
use tracing::{debug, warn};

/// Configuration for retry behavior.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Maximum number of attempts (including the first).
    /// Set to `usize::MAX` for infinite retries.
    pub max_attempts: usize,

    /// Initial delay before first retry.
    pub initial_delay: Duration,

    /// Maximum delay between retries (ceiling for exponential backoff).
    pub max_delay: Duration,

    /// Backoff multiplier (e.g., 2.0 = double delay each retry).
    pub backoff_factor: f64,

    /// Timeout for each individual connection attempt.
    pub connection_timeout: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(10),
            backoff_factor: 2.0,
            connection_timeout: Duration::from_secs(5),
        }
    }
}

impl RetryConfig {
    /// Fast-fail retry for initial store connections.
    ///
    /// A relay that can't reach its stores at startup is most likely
    /// misconfigured, so give up after roughly half a minute.
    ///
    /// # Backoff Schedule
    ///
    /// ```text
    /// Attempt  Delay     Cumulative
    /// -------  -----     ----------
    /// 1        500ms     500ms
    /// 2        750ms     1.25s
    /// 3        1.12s     2.37s
    /// ...
    /// 10       ~19s      ~56s (total)
    /// ```
    pub fn startup() -> Self {
        Self {
            max_attempts: 10,
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
            backoff_factor: 1.5,
            connection_timeout: Duration::from_secs(10),
        }
    }

    /// Retry for per-event work (applies, checkpoint saves).
    ///
    /// Bounded so a persistently failing destination surfaces as a
    /// failed event instead of stalling the loop forever.
    pub fn per_event() -> Self {
        Self {
            max_attempts: 5,
            initial_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(5),
            backoff_factor: 2.0,
            connection_timeout: Duration::from_secs(5),
        }
    }

    /// Fast-fail retry for tests.
    pub fn testing() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_millis(10),
            max_delay: Duration::from_millis(100),
            backoff_factor: 2.0,
            connection_timeout: Duration::from_millis(500),
        }
    }

    /// No retries at all: the first failure is final.
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            ..Self::testing()
        }
    }

    /// Calculate delay for a given attempt number (1-indexed).
    pub fn delay_for_attempt(&self, attempt: usize) -> Duration {
        if attempt == 0 {
            return self.initial_delay;
        }

        let multiplier = self.backoff_factor.powi((attempt - 1) as i32);
        let delay_secs = self.initial_delay.as_secs_f64() * multiplier;
        let delay = Duration::from_secs_f64(delay_secs.min(self.max_delay.as_secs_f64()));

        std::cmp::min(delay, self.max_delay)
    }
}

/// Run `f` until it succeeds, fails with a non-retryable error, or runs out
/// of attempts.
///
/// Returns the last error when attempts are exhausted.
pub async fn retry<F, Fut, T>(operation: &str, config: &RetryConfig, mut f: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempt = 0usize;

    loop {
        attempt += 1;
        match f().await {
            Ok(value) => {
                if attempt > 1 {
                    debug!(operation, attempts = attempt, "Operation succeeded after retry");
                }
                return Ok(value);
            }
            Err(e) if e.is_retryable() && attempt < config.max_attempts => {
                let delay = config.delay_for_attempt(attempt);
                warn!(
                    operation,
                    attempt,
                    max_attempts = config.max_attempts,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "Retryable failure, backing off"
                );
                crate::metrics::record_retry(operation);
                tokio::time::sleep(delay).await;
            }
            Err(e) => {
                if e.is_retryable() {
                    warn!(operation, attempts = attempt, error = %e, "Retries exhausted");
                }
                return Err(e);
            }
        }
    }
}

/// Map a timeout into a connection error for `store`.
pub(crate) fn timeout_error(store: &str, after: Duration) -> RelayError {
    RelayError::connection(store, format!("timed out after {:?}", after))
}

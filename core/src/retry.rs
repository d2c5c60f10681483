//! Caller-side retry for lock contention.
//!
//! Business-rule errors are deterministic and are returned immediately. Only
//! [`Contention`](crate::error::DomainError::Contention) is
//! retried, and by default only once. The engine itself never calls this;
//! it is for the layer that invokes [`crate::service::LotService`].
//!
//! # Example
//!
//! ```no_run
//! use lotes_core::retry::{retry_transient, RetryPolicy};
//! # use lotes_core::error::Result;
//! # async fn example(op: impl Fn() -> std::future::Ready<Result<u32>>) -> Result<u32> {
//! let value = retry_transient(RetryPolicy::default(), || op()).await?;
//! # Ok(value)
//! # }
//! ```

use crate::error::Result;
use std::future::Future;
use std::time::Duration;
use tokio::time::sleep;

/// How many times and how fast to retry a contended operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Retries after the first attempt
    pub max_retries: usize,
    /// Delay before the first retry
    pub initial_delay: Duration,
    /// Upper bound for any delay
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 1,
            initial_delay: Duration::from_millis(20),
            max_delay: Duration::from_millis(500),
        }
    }
}

impl RetryPolicy {
    /// Policy that never retries
    #[must_use]
    pub const fn none() -> Self {
        Self {
            max_retries: 0,
            initial_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
        }
    }

    /// Replace the retry count
    #[must_use]
    pub const fn with_max_retries(mut self, max_retries: usize) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Delay before retry number `attempt` (0-based), doubling each time.
    #[must_use]
    pub fn delay_for_attempt(&self, attempt: usize) -> Duration {
        let factor = 1u32 << attempt.min(16);
        self.initial_delay
            .saturating_mul(factor)
            .min(self.max_delay)
    }
}

/// Run `operation`, retrying only on transient errors.
///
/// # Errors
///
/// Returns the first non-transient error, or the last transient error once
/// retries are exhausted.
pub async fn retry_transient<F, Fut, T>(policy: RetryPolicy, mut operation: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempt = 0;

    loop {
        match operation().await {
            Ok(result) => {
                if attempt > 0 {
                    tracing::info!(attempt, "Operation succeeded after retry");
                }
                return Ok(result);
            }
            Err(err) if !err.is_transient() => return Err(err),
            Err(err) => {
                if attempt >= policy.max_retries {
                    tracing::error!(attempt, error = %err, "Operation failed after max retries");
                    return Err(err);
                }

                let delay = policy.delay_for_attempt(attempt);
                tracing::warn!(
                    attempt,
                    delay_ms = delay.as_millis(),
                    error = %err,
                    "Lock contention, retrying"
                );
                metrics::counter!("lots.retry").increment(1);
                sleep(delay).await;
                attempt += 1;
            }
        }
    }
}

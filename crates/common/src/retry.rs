//! Bounded retry with exponential backoff.
//!
//! One combinator covers every retried operation in the platform (DNS
//! record calls, proxy configuration calls), replacing per-call-site retry
//! loops. Retries apply only to errors the error type itself classifies as
//! retryable; protocol rejections pass through on the first attempt.

use std::future::Future;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::sleep;
use tracing::{trace, warn};

/// Classification hook consulted by [`RetryPolicy::run`].
pub trait Retryable {
    /// Whether a retry could plausibly succeed
    fn is_retryable(&self) -> bool;
}

/// Retry policy configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub backoff_base_ms: u64,
    pub backoff_max_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff_base_ms: 100,
            backoff_max_ms: 10_000,
        }
    }
}

impl RetryPolicy {
    /// Policy with the given attempt bound and default backoff
    pub fn with_max_attempts(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            ..Self::default()
        }
    }

    /// Exponential backoff for a 1-based attempt number, capped
    pub fn backoff_for(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(16);
        let ms = self
            .backoff_base_ms
            .saturating_mul(2_u64.pow(exp))
            .min(self.backoff_max_ms);
        Duration::from_millis(ms)
    }

    /// Run `operation`, retrying retryable failures up to `max_attempts`.
    ///
    /// The final error is returned unchanged once attempts are exhausted or
    /// a non-retryable error occurs.
    pub async fn run<T, E, F, Fut>(&self, operation: &str, mut f: F) -> Result<T, E>
    where
        E: Retryable + std::fmt::Display,
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let max_attempts = self.max_attempts.max(1);
        let mut last_error: Option<E> = None;

        for attempt in 1..=max_attempts {
            match f().await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_retryable() && attempt < max_attempts => {
                    let backoff = self.backoff_for(attempt);
                    warn!(
                        operation = %operation,
                        attempt,
                        max_attempts,
                        error = %e,
                        "Retryable failure, backing off"
                    );
                    trace!(backoff_ms = backoff.as_millis() as u64, "Backing off before retry");
                    last_error = Some(e);
                    sleep(backoff).await;
                }
                Err(e) => return Err(e),
            }
        }

        // Unreachable unless max_attempts was 0 and clamped; the loop above
        // always returns on the last attempt.
        match last_error {
            Some(e) => Err(e),
            None => unreachable!("retry loop exited without running the operation"),
        }
    }
}

//! Exponential backoff.
//!
//! Two uses share one shape, `min(base * 2^(attempt - 1), max)`:
//!
//! - [`with_backoff`] retries transient store errors at the call site, with
//!   jitter, a bounded number of times
//! - [`RetryPolicy::delay_for`] gives the delay before a failed job's next
//!   attempt, which decides whether the retry is scheduled or re-enqueued

use std::future::Future;
use std::time::Duration;

use rand::RngExt;
use tracing::warn;

use crate::config::{RetryConfig, WorkerConfig};
use crate::error::StoreError;

/// Bounded exponential backoff.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Retries after the first try. Zero disables retrying.
    pub max_retries: u32,
    pub base: Duration,
    pub max: Duration,
}

impl RetryPolicy {
    pub fn new(max_retries: u32, base: Duration, max: Duration) -> Self {
        Self {
            max_retries,
            base,
            max,
        }
    }

    /// Policy for transient store errors.
    pub fn for_store(config: &RetryConfig) -> Self {
        Self::new(
            config.max_retries,
            Duration::from_millis(config.base_ms),
            Duration::from_millis(config.max_ms),
        )
    }

    /// Policy for failed handler attempts. Only `delay_for` is used.
    pub fn for_jobs(config: &WorkerConfig) -> Self {
        Self::new(
            u32::MAX,
            Duration::from_millis(config.backoff_base_ms),
            Duration::from_millis(config.backoff_max_ms),
        )
    }

    /// Delay before attempt number `attempt` (1-based) is retried.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        if attempt == 0 || self.base.is_zero() {
            return Duration::ZERO;
        }
        let exponent = (attempt - 1).min(31);
        self.base
            .checked_mul(1u32 << exponent)
            .unwrap_or(self.max)
            .min(self.max)
    }

    /// `delay_for` with up to 25% random jitter added, still capped at `max`.
    pub fn jittered_delay_for(&self, attempt: u32) -> Duration {
        let delay = self.delay_for(attempt);
        let quarter = delay.as_millis() as u64 / 4;
        if quarter == 0 {
            return delay;
        }
        let extra = rand::rng().random_range(0..=quarter);
        (delay + Duration::from_millis(extra)).min(self.max)
    }
}

/// Runs `op`, retrying transient store errors with jittered backoff.
///
/// Non-transient errors and the last transient error are returned as-is.
pub async fn with_backoff<T, F, Fut>(
    policy: &RetryPolicy,
    operation: &str,
    mut op: F,
) -> Result<T, StoreError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, StoreError>>,
{
    let mut attempt = 0u32;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) if e.is_transient() && attempt < policy.max_retries => {
                attempt += 1;
                let delay = policy.jittered_delay_for(attempt);
                warn!(
                    operation = operation,
                    attempt = attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "Transient store error, retrying"
                );
                tokio::time::sleep(delay).await;
            }
            Err(e) => return Err(e),
        }
    }
}

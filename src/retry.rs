//! Retry-with-backoff for calls whose failures may be transient.

use std::future::Future;
use std::time::Duration;

use rand::Rng as _;
use serde::{Deserialize, Serialize};
use tracing::warn;

/// Exponential backoff policy. `max_retries` counts retries after the first attempt.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RetryConfig {
    pub max_retries: u32,
    pub base_delay_secs: u64,
    pub max_delay_secs: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 2,
            base_delay_secs: 5,
            max_delay_secs: 60,
        }
    }
}

impl RetryConfig {
    /// No waiting between attempts; used by tests and the step binary.
    pub fn immediate(max_retries: u32) -> Self {
        Self {
            max_retries,
            base_delay_secs: 0,
            max_delay_secs: 0,
        }
    }

    /// `min(base * 2^retry, max)` plus up to `min(base, max)` of jitter.
    pub fn delay_for_retry(&self, retry: u32) -> Duration {
        let factor = 1u64.checked_shl(retry).unwrap_or(u64::MAX);
        let capped = self.base_delay_secs.saturating_mul(factor).min(self.max_delay_secs);
        let jitter_secs = self.base_delay_secs.min(self.max_delay_secs);
        let jitter_ms = if jitter_secs > 0 {
            rand::thread_rng().gen_range(0..jitter_secs.saturating_mul(1000))
        } else {
            0
        };
        Duration::from_secs(capped) + Duration::from_millis(jitter_ms)
    }
}

/// Run `operation` until it succeeds, `is_retryable` rejects the error, or
/// the attempts run out. The last error is returned unchanged.
pub async fn retry_with_backoff<T, E, F, Fut, P>(
    config: &RetryConfig,
    what: &str,
    is_retryable: P,
    mut operation: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    P: Fn(&E) -> bool,
    E: std::fmt::Display,
{
    let attempts = config.max_retries.saturating_add(1);
    let mut retry = 0;
    loop {
        match operation().await {
            Ok(value) => return Ok(value),
            Err(err) => {
                if retry + 1 >= attempts || !is_retryable(&err) {
                    return Err(err);
                }
                let delay = config.delay_for_retry(retry);
                warn!(
                    what,
                    attempt = retry + 1,
                    attempts,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "retryable failure; backing off"
                );
                tokio::time::sleep(delay).await;
                retry += 1;
            }
        }
    }
}

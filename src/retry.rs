//! Exponential backoff for GitHub API calls.
//!
//! Only throttling and transient server failures are retried. Rejected
//! credentials and malformed responses fail on the first attempt.

use std::future::Future;
use std::time::Duration;

use crate::config::RetryConfig;
use crate::error::ExportError;

/// Result of one attempt, as classified by the caller
#[derive(Debug)]
pub enum Attempt {
    /// Permanent failure, returned without further attempts
    Fatal(ExportError),
    /// Transient failure; `wait_hint` is the server-requested delay, if any
    Retry {
        error: ExportError,
        wait_hint: Option<Duration>,
    },
}

impl RetryConfig {
    /// Delay before retry number `retry` (0-based): `base * 2^retry`, capped
    pub fn delay_for_retry(&self, retry: u32) -> Duration {
        let factor = 2u64.saturating_pow(retry);
        let delay_ms = self.base_delay_ms.saturating_mul(factor);
        Duration::from_millis(delay_ms.min(self.max_delay_ms))
    }

    /// Backoff delay raised to the server's hint, never above the cap
    pub fn effective_delay(&self, retry: u32, wait_hint: Option<Duration>) -> Duration {
        let backoff = self.delay_for_retry(retry);
        let cap = Duration::from_millis(self.max_delay_ms);
        match wait_hint {
            Some(hint) => backoff.max(hint).min(cap),
            None => backoff,
        }
    }
}

/// Run `operation` until it succeeds, fails fatally, or `max_attempts` is spent.
///
/// The closure receives the 1-based attempt number. When attempts run out the
/// error of the last attempt is returned.
pub async fn with_backoff<T, F, Fut>(policy: &RetryConfig, mut operation: F) -> Result<T, ExportError>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, Attempt>>,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 1;

    loop {
        match operation(attempt).await {
            Ok(value) => {
                if attempt > 1 {
                    tracing::info!("Request succeeded on attempt {}", attempt);
                }
                return Ok(value);
            }
            Err(Attempt::Fatal(error)) => return Err(error),
            Err(Attempt::Retry { error, wait_hint }) => {
                if attempt >= max_attempts {
                    tracing::error!("All {} attempts exhausted: {}", max_attempts, error);
                    return Err(error);
                }

                let delay = policy.effective_delay(attempt - 1, wait_hint);
                tracing::warn!(
                    "Attempt {} of {} failed ({}), retrying in {:?}",
                    attempt,
                    max_attempts,
                    error,
                    delay
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
        }
    }
}

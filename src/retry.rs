//! Retry logic for transient failures
//!
//! Only errors that report themselves as retryable via `IsRetryable` are
//! re-attempted; everything else aborts on the first failure.
//!
//! Delays use decorrelated jitter: each sleep is drawn uniformly from
//! `[base, 3 x previous]`, clamped to the cap. Compared to a fixed
//! exponential curve this spreads concurrent retriers apart instead of
//! re-synchronizing them on every doubling, which matters when dozens of
//! instance polls hit the same recovering provider.

use crate::config::ProviderCommon;
use crate::error::{IsRetryable, OrchestratorError, Result};
use std::future::Future;
use std::time::Duration;
use tracing::{debug, warn};

const BASE_DELAY_MS: u64 = 250;
const DEFAULT_CAP_MS: u64 = 20_000;
const DEFAULT_MAX_ATTEMPTS: u32 = 3;

/// Decorrelated-jitter retry policy
#[derive(Debug, Clone)]
pub struct ExponentialBackoffPolicy {
    max_attempts: u32,
    base_delay: Duration,
    cap: Duration,
}

impl ExponentialBackoffPolicy {
    pub fn new(max_attempts: u32) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay: Duration::from_millis(BASE_DELAY_MS),
            cap: Duration::from_millis(DEFAULT_CAP_MS),
        }
    }

    /// Default policy (3 attempts).
    pub fn default_policy() -> Self {
        Self::new(DEFAULT_MAX_ATTEMPTS)
    }

    /// Policy shaped by a provider's configured retry budget and backoff
    /// ceiling.
    pub fn for_provider(common: &ProviderCommon) -> Self {
        let cap_ms = common.backoff_ceiling_ms.max(1);
        Self {
            max_attempts: common.max_retries.max(1),
            base_delay: Duration::from_millis(BASE_DELAY_MS.min(cap_ms)),
            cap: Duration::from_millis(cap_ms),
        }
    }

    /// Draw the next sleep from `[base, 3 x previous]`, capped. The draw
    /// depends on the previous sleep, not the attempt number, so two
    /// retriers that failed together drift apart over successive rounds.
    fn next_delay(&self, previous: Duration) -> Duration {
        let base = self.base_delay.as_millis() as u64;
        let cap = self.cap.as_millis() as u64;
        let spread = (previous.as_millis() as u64)
            .saturating_mul(3)
            .clamp(base, cap);
        Duration::from_millis(if spread > base {
            fastrand::u64(base..=spread)
        } else {
            base
        })
    }

    /// Execute `f` with retry. Non-retryable errors abort immediately;
    /// exhausting the budget wraps the last error in `RetriesExhausted`.
    pub async fn execute<F, Fut, T>(&self, f: F) -> Result<T>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut delay = self.base_delay;
        for attempt in 0..self.max_attempts {
            match f().await {
                Ok(result) => {
                    if attempt > 0 {
                        debug!(retries = attempt, "operation succeeded after retries");
                    }
                    return Ok(result);
                }
                Err(e) if !e.is_retryable() => {
                    warn!(error = %e, "non-retryable error, aborting");
                    return Err(e);
                }
                Err(e) => {
                    if attempt == self.max_attempts - 1 {
                        warn!(max_attempts = self.max_attempts, "retry budget exhausted");
                        return Err(OrchestratorError::RetriesExhausted {
                            attempts: self.max_attempts,
                            reason: e.to_string(),
                            source: Some(Box::new(e)),
                        });
                    }
                    delay = self.next_delay(delay);
                    warn!(
                        attempt = attempt + 1,
                        max_attempts = self.max_attempts,
                        backoff_ms = delay.as_millis() as u64,
                        error = %e,
                        "retryable error, backing off"
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
        unreachable!("retry loop returns on the final attempt")
    }
}

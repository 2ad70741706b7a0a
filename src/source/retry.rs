// =============================================================================
// Bounded retry with exponential backoff and jitter
// =============================================================================
//
// delay(n) = min(max_delay, base_delay * 2^(n-1)), then "equal jitter":
// the actual sleep is drawn uniformly from [delay/2, delay].
//
// Network errors and rate-limit errors have separate budgets. A Retry-After
// hint from the provider is a floor for the next sleep; a hint longer than
// max_delay surfaces the RateLimited error at once. Non-transient errors are
// returned on the first occurrence.
// =============================================================================

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total attempts allowed while the provider keeps failing at the
    /// network level (1 = never retry).
    pub max_network_attempts: u32,
    /// Total attempts allowed while the provider keeps answering 429.
    pub max_rate_limit_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_network_attempts: 3,
            max_rate_limit_attempts: 5,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    /// Un-jittered delay before retry number `attempt` (1-based).
    pub fn base_backoff(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }

    /// Jittered delay before retry number `attempt`.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let full = self.base_backoff(attempt);
        let half = full / 2;
        let spread = (full - half).as_millis() as u64;
        let jitter = if spread == 0 {
            0
        } else {
            rand::thread_rng().gen_range(0..=spread)
        };
        half + Duration::from_millis(jitter)
    }

    /// Run `op` until it succeeds, fails permanently, or a budget runs out.
    pub async fn run<T, F, Fut>(&self, label: &str, mut op: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut network_failures = 0u32;
        let mut rate_limited = 0u32;

        loop {
            let err = match op().await {
                Ok(value) => return Ok(value),
                Err(err) => err,
            };

            if !err.is_transient() {
                return Err(err);
            }

            let (failures, budget, floor) = match &err {
                Error::RateLimited { retry_after } => {
                    rate_limited += 1;
                    (rate_limited, self.max_rate_limit_attempts, *retry_after)
                }
                _ => {
                    network_failures += 1;
                    (network_failures, self.max_network_attempts, None)
                }
            };

            if failures >= budget {
                warn!(label, attempts = failures, error = %err, "retry budget exhausted");
                return Err(err);
            }

            let mut delay = self.backoff(failures);
            if let Some(floor) = floor {
                if floor > self.max_delay {
                    warn!(
                        label,
                        retry_after_ms = floor.as_millis() as u64,
                        max_delay_ms = self.max_delay.as_millis() as u64,
                        "provider asked to wait longer than the backoff cap"
                    );
                    return Err(err);
                }
                delay = delay.max(floor);
            }
            debug!(label, attempt = failures, delay_ms = delay.as_millis() as u64, error = %err, "retrying after backoff");
            tokio::time::sleep(delay).await;
        }
    }
}

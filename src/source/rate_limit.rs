// =============================================================================
// Rate-Limit Tracker: pacing and provider usage bookkeeping
// =============================================================================
//
// Two concerns live here:
//   - Pacing: a minimum spacing between outbound requests. Free-tier public
//     APIs (CoinGecko: ~2.5 s) throttle aggressively, so callers queue behind
//     each other instead of racing into a 429.
//   - Usage: Binance reports consumed request weight in the
//     `X-MBX-USED-WEIGHT-1M` header. We keep the latest value in an atomic
//     and wait out the minute when the hard ceiling is reached.
// =============================================================================

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, warn};

/// Weight at which we stop sending until the minute window rolls over.
const WEIGHT_HARD_LIMIT: u32 = 1000;
/// Soft warning threshold.
const WEIGHT_WARN_THRESHOLD: u32 = 800;
/// Binance weight window.
const WEIGHT_WINDOW: Duration = Duration::from_secs(60);

pub struct RateLimitTracker {
    min_spacing: Duration,
    last_request: Mutex<Option<Instant>>,
    used_weight_1m: AtomicU32,
    requests_sent: AtomicU64,
    throttled: AtomicU64,
}

/// Serialisable view of the tracker for the health endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimitSnapshot {
    pub min_spacing_ms: u64,
    pub used_weight_1m: u32,
    pub requests_sent: u64,
    pub throttled: u64,
}

impl RateLimitTracker {
    pub fn new(min_spacing: Duration) -> Self {
        Self {
            min_spacing,
            last_request: Mutex::new(None),
            used_weight_1m: AtomicU32::new(0),
            requests_sent: AtomicU64::new(0),
            throttled: AtomicU64::new(0),
        }
    }

    // -------------------------------------------------------------------------
    // Pre-flight
    // -------------------------------------------------------------------------

    /// Wait until this client may send its next request.
    ///
    /// The lock is held across the sleep so concurrent callers are released
    /// one at a time, each `min_spacing` after the previous one.
    pub async fn acquire(&self) {
        let mut last = self.last_request.lock().await;

        if self.used_weight_1m.load(Ordering::Relaxed) >= WEIGHT_HARD_LIMIT {
            warn!(
                hard_limit = WEIGHT_HARD_LIMIT,
                "request weight exhausted, waiting for the window to reset"
            );
            tokio::time::sleep(WEIGHT_WINDOW).await;
            self.used_weight_1m.store(0, Ordering::Relaxed);
        }

        if let Some(prev) = *last {
            let elapsed = prev.elapsed();
            if elapsed < self.min_spacing {
                let wait = self.min_spacing - elapsed;
                debug!(wait_ms = wait.as_millis() as u64, "pacing outbound request");
                tokio::time::sleep(wait).await;
            }
        }

        *last = Some(Instant::now());
        self.requests_sent.fetch_add(1, Ordering::Relaxed);
    }

    // -------------------------------------------------------------------------
    // Header-based updates
    // -------------------------------------------------------------------------

    /// Update usage counters from provider response headers.
    pub fn update_from_headers(&self, headers: &reqwest::header::HeaderMap) {
        let Some(weight) = headers
            .get("X-MBX-USED-WEIGHT-1M")
            .and_then(|v| v.to_str().ok())
            .and_then(|s| s.parse::<u32>().ok())
        else {
            return;
        };

        let prev = self.used_weight_1m.swap(weight, Ordering::Relaxed);
        if weight >= WEIGHT_WARN_THRESHOLD && prev < WEIGHT_WARN_THRESHOLD {
            warn!(
                used_weight = weight,
                hard_limit = WEIGHT_HARD_LIMIT,
                "rate-limit weight crossed warning threshold"
            );
        }
        debug!(used_weight_1m = weight, "rate-limit weight updated from header");
    }

    /// Record a 429/418 answer.
    pub fn record_throttled(&self) {
        self.throttled.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> RateLimitSnapshot {
        RateLimitSnapshot {
            min_spacing_ms: self.min_spacing.as_millis() as u64,
            used_weight_1m: self.used_weight_1m.load(Ordering::Relaxed),
            requests_sent: self.requests_sent.load(Ordering::Relaxed),
            throttled: self.throttled.load(Ordering::Relaxed),
        }
    }
}

impl std::fmt::Debug for RateLimitTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimitTracker")
            .field("min_spacing", &self.min_spacing)
            .field("used_weight_1m", &self.used_weight_1m.load(Ordering::Relaxed))
            .field("requests_sent", &self.requests_sent.load(Ordering::Relaxed))
            .finish()
    }
}

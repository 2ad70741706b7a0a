// =============================================================================
// Central Application State
// =============================================================================
//
// Ties the pipeline and its configuration together for the API handlers.
// The pipeline manages its own interior mutability (cache lock, rate-limit
// atomics); the state only adds request bookkeeping for the health endpoint.
//
// Thread safety:
//   - Atomic counter for requests served.
//   - parking_lot::RwLock for the recent-error ring.
// =============================================================================

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;

use crate::error::Error;
use crate::pipeline::Pipeline;
use crate::runtime_config::RuntimeConfig;

// =============================================================================
// Error Record
// =============================================================================

/// A recorded request failure for the health endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct ErrorRecord {
    /// Stable error code (`rate_limited`, `network_error`, ...).
    pub code: &'static str,
    /// Internal detail, not the user-facing message.
    pub message: String,
    /// ISO 8601 timestamp.
    pub at: String,
}

/// Maximum number of recent errors to retain.
const MAX_RECENT_ERRORS: usize = 50;

/// Shared across all handlers via `Arc<AppState>`.
pub struct AppState {
    pub pipeline: Pipeline,
    pub runtime_config: RuntimeConfig,
    pub started_at: DateTime<Utc>,
    requests_served: AtomicU64,
    recent_errors: RwLock<VecDeque<ErrorRecord>>,
}

impl AppState {
    pub fn new(pipeline: Pipeline, runtime_config: RuntimeConfig) -> Self {
        Self {
            pipeline,
            runtime_config,
            started_at: Utc::now(),
            requests_served: AtomicU64::new(0),
            recent_errors: RwLock::new(VecDeque::with_capacity(MAX_RECENT_ERRORS)),
        }
    }

    pub fn record_request(&self) {
        self.requests_served.fetch_add(1, Ordering::Relaxed);
    }

    pub fn requests_served(&self) -> u64 {
        self.requests_served.load(Ordering::Relaxed)
    }

    /// Remember a failure, dropping the oldest once the ring is full.
    pub fn record_error(&self, err: &Error) {
        let mut ring = self.recent_errors.write();
        if ring.len() >= MAX_RECENT_ERRORS {
            ring.pop_front();
        }
        ring.push_back(ErrorRecord {
            code: err.code(),
            message: err.to_string(),
            at: Utc::now().to_rfc3339(),
        });
    }

    /// Most recent first.
    pub fn recent_errors(&self, limit: usize) -> Vec<ErrorRecord> {
        self.recent_errors.read().iter().rev().take(limit).cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::tests::CountingSource;

    fn state() -> AppState {
        let config = RuntimeConfig::default();
        AppState::new(Pipeline::new(CountingSource::ok(), &config), config)
    }

    #[test]
    fn error_ring_is_bounded_and_newest_first() {
        let state = state();
        for i in 0..(MAX_RECENT_ERRORS + 5) {
            state.record_error(&Error::InvalidSymbol(format!("S{i}")));
        }
        let errors = state.recent_errors(100);
        assert_eq!(errors.len(), MAX_RECENT_ERRORS);
        assert!(errors[0].message.contains(&format!("S{}", MAX_RECENT_ERRORS + 4)));
        assert_eq!(errors[0].code, "invalid_symbol");
    }

    #[test]
    fn request_counter() {
        let state = state();
        state.record_request();
        state.record_request();
        assert_eq!(state.requests_served(), 2);
    }
}

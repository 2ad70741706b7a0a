// =============================================================================
// Pipeline error taxonomy
// =============================================================================
//
// Transient errors (Network, RateLimited) are retried inside the source layer
// before they ever reach a caller. Everything else is surfaced immediately.
// The type is `Clone` because a single in-flight computation hands the same
// outcome to every caller that joined it.
// =============================================================================

use std::time::Duration;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum Error {
    /// Timeout, connection failure, 5xx, or an unreadable response body.
    #[error("network error: {0}")]
    Network(String),

    /// The provider throttled us and the retry budget is spent.
    #[error("rate limited by provider (retry after {retry_after:?})")]
    RateLimited { retry_after: Option<Duration> },

    #[error("unknown symbol '{0}'")]
    InvalidSymbol(String),

    /// Request parameters the provider can never satisfy (empty range,
    /// unsupported interval).
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("malformed provider data: {0}")]
    MalformedData(String),

    #[error("invalid indicator spec '{spec}': {reason}")]
    InvalidIndicatorSpec { spec: String, reason: String },

    /// Cache storage failed. Never fatal: callers fall back to fetch+compute.
    #[error("cache unavailable: {0}")]
    CacheUnavailable(String),
}

impl Error {
    /// Whether the source layer may retry after this error.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Network(_) | Self::RateLimited { .. })
    }

    /// Stable machine-readable code for API consumers.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Network(_) => "network_error",
            Self::RateLimited { .. } => "rate_limited",
            Self::InvalidSymbol(_) => "invalid_symbol",
            Self::InvalidRequest(_) => "invalid_request",
            Self::MalformedData(_) => "malformed_data",
            Self::InvalidIndicatorSpec { .. } => "invalid_indicator_spec",
            Self::CacheUnavailable(_) => "cache_unavailable",
        }
    }

    /// Message that is safe to show to an end user as-is.
    pub fn user_message(&self) -> String {
        match self {
            Self::Network(_) => {
                "The market data provider could not be reached. Please try again shortly."
                    .to_string()
            }
            Self::RateLimited { .. } => {
                "The market data provider is rate limiting requests. Please wait a moment and try again."
                    .to_string()
            }
            Self::InvalidSymbol(symbol) => format!("'{symbol}' is not a symbol known to the provider."),
            Self::InvalidRequest(reason) => format!("The request is not valid: {reason}."),
            Self::MalformedData(_) => {
                "The provider returned data that could not be used for analysis.".to_string()
            }
            Self::InvalidIndicatorSpec { spec, reason } => {
                format!("Indicator '{spec}' could not be computed: {reason}.")
            }
            Self::CacheUnavailable(_) => "The result cache is temporarily unavailable.".to_string(),
        }
    }
}

impl From<reqwest::Error> for Error {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            Self::Network(format!("request timed out: {err}"))
        } else if err.is_decode() {
            Self::Network(format!("could not read response body: {err}"))
        } else {
            Self::Network(err.to_string())
        }
    }
}

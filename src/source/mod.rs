//! Remote market-data sources.
//!
//! A [`SourceClient`] fetches the raw, provider-defined payload for one
//! (symbol, interval, range) request. It does not parse bars: the payload is
//! handed as-is to the [`Normalizer`](crate::market_data::Normalizer), which
//! knows each [`RawFormat`].
//!
//! Transient failures are retried inside the client according to its
//! [`RetryPolicy`]; whatever escapes `fetch` is final.

pub mod binance;
pub mod coingecko;
pub mod rate_limit;
pub mod retry;

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::runtime_config::RuntimeConfig;
use crate::types::{Interval, ProviderKind};

pub use binance::BinanceClient;
pub use coingecko::CoinGeckoClient;
pub use rate_limit::{RateLimitSnapshot, RateLimitTracker};
pub use retry::RetryPolicy;

/// Parameters of one historical fetch. `start` is inclusive, `end` exclusive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchRequest {
    pub symbol: String,
    pub interval: Interval,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    /// Quote currency for providers that price a coin in one (CoinGecko's
    /// `vs_currency`). `None` uses the client's configured default.
    pub quote: Option<String>,
}

impl FetchRequest {
    pub fn new(
        symbol: impl Into<String>,
        interval: Interval,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Self {
        Self {
            symbol: symbol.into(),
            interval,
            start,
            end,
            quote: None,
        }
    }

    pub fn with_quote(mut self, quote: Option<String>) -> Self {
        self.quote = quote;
        self
    }

    /// Reject requests no provider could ever satisfy.
    pub fn validate(&self) -> Result<()> {
        if self.symbol.trim().is_empty() {
            return Err(Error::InvalidRequest("symbol must not be empty".into()));
        }
        if self.start >= self.end {
            return Err(Error::InvalidRequest(format!(
                "start ({}) must be before end ({})",
                self.start, self.end
            )));
        }
        Ok(())
    }
}

/// Shape of a raw payload, so the normalizer knows how to read it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RawFormat {
    /// Binance-style klines: `[[openTime, "o", "h", "l", "c", "v", ...], ...]`.
    Klines,
    /// Price points plus volume points:
    /// `{"prices": [[ms, p], ...], "total_volumes": [[ms, v], ...]}`.
    MarketChart,
}

/// Opaque provider response plus the request context it answers.
#[derive(Debug, Clone)]
pub struct RawResponse {
    pub symbol: String,
    pub interval: Interval,
    pub format: RawFormat,
    pub body: serde_json::Value,
}

/// A tradable symbol as listed by the provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SymbolInfo {
    /// Identifier to pass back into `fetch` (e.g. `BTCUSDT`, `bitcoin`).
    pub id: String,
    pub symbol: String,
    pub name: String,
}

#[async_trait]
pub trait SourceClient: Send + Sync {
    /// Provider name for logs and health output.
    fn name(&self) -> &'static str;

    /// Fetch raw OHLCV data. Fails with `Network`, `RateLimited`,
    /// `InvalidSymbol` or `InvalidRequest`; never returns partial data.
    async fn fetch(&self, request: &FetchRequest) -> Result<RawResponse>;

    /// List the symbols the provider serves.
    async fn list_symbols(&self) -> Result<Vec<SymbolInfo>>;

    /// Current rate-limit bookkeeping, if the client keeps any.
    fn rate_limit(&self) -> Option<RateLimitSnapshot> {
        None
    }
}

/// Build the configured provider client.
pub fn from_config(config: &RuntimeConfig) -> anyhow::Result<Box<dyn SourceClient>> {
    let timeout = Duration::from_secs(config.request_timeout_secs);
    let spacing = config.request_spacing();
    let retry = config.retry_policy();

    let client: Box<dyn SourceClient> = match config.provider {
        ProviderKind::Binance => Box::new(BinanceClient::new(
            config.base_url_or_default(),
            timeout,
            spacing,
            retry,
        )?),
        ProviderKind::CoinGecko => Box::new(CoinGeckoClient::new(
            config.base_url_or_default(),
            config.vs_currency.clone(),
            timeout,
            spacing,
            retry,
        )?),
    };
    Ok(client)
}

/// Map a non-success HTTP status to the pipeline taxonomy. 404/400 handling
/// is provider specific and done by the caller first.
pub(crate) fn classify_status(
    status: reqwest::StatusCode,
    headers: &reqwest::header::HeaderMap,
    body: &str,
) -> Error {
    if status == reqwest::StatusCode::TOO_MANY_REQUESTS || status.as_u16() == 418 {
        let retry_after = headers
            .get(reqwest::header::RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .and_then(|s| s.trim().parse::<u64>().ok())
            .map(Duration::from_secs);
        return Error::RateLimited { retry_after };
    }
    if status.is_server_error() {
        return Error::Network(format!("provider returned {status}"));
    }
    Error::InvalidRequest(format!("provider returned {status}: {}", truncate(body, 200)))
}

fn truncate(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use reqwest::header::{HeaderMap, HeaderValue, RETRY_AFTER};
    use reqwest::StatusCode;

    #[test]
    fn request_with_empty_range_is_invalid() {
        let t = Utc.timestamp_opt(1_700_000_000, 0).unwrap();
        let req = FetchRequest::new("BTCUSDT", Interval::H1, t, t);
        assert!(matches!(req.validate(), Err(Error::InvalidRequest(_))));
    }

    #[test]
    fn request_with_blank_symbol_is_invalid() {
        let t = Utc.timestamp_opt(1_700_000_000, 0).unwrap();
        let req = FetchRequest::new("  ", Interval::H1, t, t + chrono::Duration::hours(1));
        assert!(req.validate().is_err());
    }

    #[test]
    fn too_many_requests_carries_retry_after() {
        let mut headers = HeaderMap::new();
        headers.insert(RETRY_AFTER, HeaderValue::from_static("7"));
        let err = classify_status(StatusCode::TOO_MANY_REQUESTS, &headers, "");
        assert_eq!(
            err,
            Error::RateLimited {
                retry_after: Some(Duration::from_secs(7))
            }
        );
    }

    #[test]
    fn server_errors_are_network_errors() {
        let err = classify_status(StatusCode::BAD_GATEWAY, &HeaderMap::new(), "oops");
        assert!(matches!(err, Error::Network(_)));
    }

    #[test]
    fn client_errors_are_not_retried() {
        let err = classify_status(StatusCode::FORBIDDEN, &HeaderMap::new(), "nope");
        assert!(!err.is_transient());
    }
}

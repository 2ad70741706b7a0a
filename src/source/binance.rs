// =============================================================================
// Binance REST client: public kline history
// =============================================================================
//
// Only public market-data endpoints are used, so no request signing and no
// API key. Klines come back as an array of arrays; pages are stitched
// together here and the combined array is handed to the normalizer untouched.
//
// Kline array indices:
//   [0] openTime, [1] open, [2] high, [3] low, [4] close, [5] volume,
//   [6] closeTime, [7] quoteAssetVolume, [8] numberOfTrades, ...
// =============================================================================

use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use tracing::{debug, info, instrument};

use crate::error::{Error, Result};
use crate::source::{
    classify_status, FetchRequest, RateLimitSnapshot, RateLimitTracker, RawFormat, RawResponse,
    RetryPolicy, SourceClient, SymbolInfo,
};

pub const DEFAULT_BASE_URL: &str = "https://api.binance.com";

/// Binance's maximum klines per request.
const MAX_PAGE_LIMIT: usize = 1000;

/// Binance error code for an unknown trading pair.
const INVALID_SYMBOL_CODE: i64 = -1121;

pub struct BinanceClient {
    base_url: String,
    client: reqwest::Client,
    limiter: RateLimitTracker,
    retry: RetryPolicy,
    page_limit: usize,
}

impl BinanceClient {
    // -------------------------------------------------------------------------
    // Construction
    // -------------------------------------------------------------------------

    pub fn new(
        base_url: impl Into<String>,
        timeout: Duration,
        min_spacing: Duration,
        retry: RetryPolicy,
    ) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("failed to build reqwest client")?;

        let base_url = base_url.into().trim_end_matches('/').to_string();
        debug!(base_url = %base_url, "BinanceClient initialised");

        Ok(Self {
            base_url,
            client,
            limiter: RateLimitTracker::new(min_spacing),
            retry,
            page_limit: MAX_PAGE_LIMIT,
        })
    }

    /// Override the page size (capped at Binance's maximum).
    #[cfg(test)]
    pub fn with_page_limit(mut self, limit: usize) -> Self {
        self.page_limit = limit.clamp(1, MAX_PAGE_LIMIT);
        self
    }

    // -------------------------------------------------------------------------
    // Single requests (retried by the callers below)
    // -------------------------------------------------------------------------

    /// GET /api/v3/klines for one page.
    async fn klines_page(
        &self,
        symbol: &str,
        interval: &str,
        start_ms: i64,
        end_ms: i64,
    ) -> Result<Vec<serde_json::Value>> {
        self.limiter.acquire().await;

        let url = format!("{}/api/v3/klines", self.base_url);
        let resp = self
            .client
            .get(&url)
            .query(&[
                ("symbol", symbol.to_string()),
                ("interval", interval.to_string()),
                ("startTime", start_ms.to_string()),
                ("endTime", end_ms.to_string()),
                ("limit", self.page_limit.to_string()),
            ])
            .send()
            .await?;

        let body = self.read_json(resp, symbol).await?;
        match body {
            serde_json::Value::Array(rows) => Ok(rows),
            other => Err(Error::MalformedData(format!(
                "klines response is not an array: {}",
                truncate_json(&other)
            ))),
        }
    }

    /// Check status and decode the JSON body, mapping Binance's error shapes.
    async fn read_json(&self, resp: reqwest::Response, symbol: &str) -> Result<serde_json::Value> {
        self.limiter.update_from_headers(resp.headers());
        let status = resp.status();
        let headers = resp.headers().clone();

        if status.is_success() {
            return Ok(resp.json().await?);
        }

        let text = resp.text().await.unwrap_or_default();
        if status == reqwest::StatusCode::BAD_REQUEST {
            let code = serde_json::from_str::<serde_json::Value>(&text)
                .ok()
                .and_then(|v| v["code"].as_i64());
            if code == Some(INVALID_SYMBOL_CODE) {
                return Err(Error::InvalidSymbol(symbol.to_string()));
            }
        }

        let err = classify_status(status, &headers, &text);
        if matches!(err, Error::RateLimited { .. }) {
            self.limiter.record_throttled();
        }
        Err(err)
    }
}

#[async_trait]
impl SourceClient for BinanceClient {
    fn name(&self) -> &'static str {
        "binance"
    }

    /// Fetch every kline in `[start, end)`, following pages until the range is
    /// exhausted or a short page comes back.
    #[instrument(skip(self), name = "binance::fetch", fields(symbol = %request.symbol, interval = %request.interval))]
    async fn fetch(&self, request: &FetchRequest) -> Result<RawResponse> {
        request.validate()?;
        if let Some(quote) = &request.quote {
            return Err(Error::InvalidRequest(format!(
                "binance symbols already name their quote asset; drop vs_currency={quote}"
            )));
        }

        let symbol = request.symbol.trim().to_uppercase();
        let interval = request.interval.as_str();
        let step = request.interval.millis();
        let end_ms = request.end.timestamp_millis() - 1;
        let mut cursor = request.start.timestamp_millis();
        let mut rows: Vec<serde_json::Value> = Vec::new();

        while cursor <= end_ms {
            let symbol = symbol.as_str();
            let page = self
                .retry
                .run("binance::klines", move || {
                    self.klines_page(symbol, interval, cursor, end_ms)
                })
                .await?;

            let page_len = page.len();
            let last_open = page
                .last()
                .and_then(|row| row.get(0))
                .and_then(|t| t.as_i64());
            rows.extend(page);

            let Some(last_open) = last_open else { break };
            if page_len < self.page_limit {
                break;
            }
            let next = last_open + step;
            if next <= cursor {
                break;
            }
            cursor = next;
        }

        info!(symbol = %symbol, interval, rows = rows.len(), "klines fetched");
        Ok(RawResponse {
            symbol,
            interval: request.interval,
            format: RawFormat::Klines,
            body: serde_json::Value::Array(rows),
        })
    }

    /// GET /api/v3/exchangeInfo, keeping pairs currently trading.
    #[instrument(skip(self), name = "binance::list_symbols")]
    async fn list_symbols(&self) -> Result<Vec<SymbolInfo>> {
        let body = self
            .retry
            .run("binance::exchange_info", move || async move {
                self.limiter.acquire().await;
                let url = format!("{}/api/v3/exchangeInfo", self.base_url);
                let resp = self.client.get(&url).send().await?;
                self.read_json(resp, "").await
            })
            .await?;

        let entries = body["symbols"]
            .as_array()
            .ok_or_else(|| Error::MalformedData("exchangeInfo has no 'symbols' array".into()))?;

        let symbols: Vec<SymbolInfo> = entries
            .iter()
            .filter(|s| s["status"].as_str() == Some("TRADING"))
            .filter_map(|s| {
                let id = s["symbol"].as_str()?;
                let base = s["baseAsset"].as_str().unwrap_or(id);
                let quote = s["quoteAsset"].as_str().unwrap_or("");
                Some(SymbolInfo {
                    id: id.to_string(),
                    symbol: id.to_string(),
                    name: format!("{base}/{quote}"),
                })
            })
            .collect();

        debug!(count = symbols.len(), "symbols listed");
        Ok(symbols)
    }

    fn rate_limit(&self) -> Option<RateLimitSnapshot> {
        Some(self.limiter.snapshot())
    }
}

impl std::fmt::Debug for BinanceClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BinanceClient")
            .field("base_url", &self.base_url)
            .field("page_limit", &self.page_limit)
            .finish()
    }
}

fn truncate_json(value: &serde_json::Value) -> String {
    let mut s = value.to_string();
    if s.len() > 120 {
        s.truncate(120);
        s.push_str("...");
    }
    s
}

// ---------------------------------------------------------------------------
// Tests: against an in-process fake exchange
// ---------------------------------------------------------------------------

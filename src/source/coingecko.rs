// =============================================================================
// CoinGecko REST client: market-chart history
// =============================================================================
//
// CoinGecko serves price *points* rather than OHLC bars:
//   GET /api/v3/coins/{id}/market_chart/range?vs_currency=usd&from=..&to=..
//   => { "prices": [[ms, p], ..], "market_caps": [..], "total_volumes": [[ms, v], ..] }
//
// Granularity is chosen by CoinGecko from the range length (5-minutely up to
// one day, hourly up to 90 days, daily beyond), so only 1h / 4h / 1d bars
// can be built reliably. The normalizer buckets the points onto the grid.
// The free tier allows roughly one call every 2.5 s; pacing is configured
// through the shared rate-limit tracker.
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
use crate::types::Interval;

pub const DEFAULT_BASE_URL: &str = "https://api.coingecko.com";

const SUPPORTED_INTERVALS: &[Interval] = &[Interval::H1, Interval::H4, Interval::D1];

/// Coin ids are path segments: lower-case letters, digits and dashes only.
fn is_coin_id(id: &str) -> bool {
    !id.is_empty()
        && id
            .bytes()
            .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || b == b'-')
}

pub struct CoinGeckoClient {
    base_url: String,
    vs_currency: String,
    client: reqwest::Client,
    limiter: RateLimitTracker,
    retry: RetryPolicy,
}

impl CoinGeckoClient {
    pub fn new(
        base_url: impl Into<String>,
        vs_currency: impl Into<String>,
        timeout: Duration,
        min_spacing: Duration,
        retry: RetryPolicy,
    ) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("failed to build reqwest client")?;

        let base_url = base_url.into().trim_end_matches('/').to_string();
        let vs_currency = vs_currency.into().to_lowercase();
        debug!(base_url = %base_url, vs_currency = %vs_currency, "CoinGeckoClient initialised");

        Ok(Self {
            base_url,
            vs_currency,
            client,
            limiter: RateLimitTracker::new(min_spacing),
            retry,
        })
    }

    async fn get_json(
        &self,
        url: &str,
        query: &[(&str, String)],
        coin_id: &str,
    ) -> Result<serde_json::Value> {
        self.limiter.acquire().await;

        let resp = self.client.get(url).query(query).send().await?;
        let status = resp.status();
        if status.is_success() {
            return Ok(resp.json().await?);
        }
        if status == reqwest::StatusCode::NOT_FOUND {
            return Err(Error::InvalidSymbol(coin_id.to_string()));
        }

        let headers = resp.headers().clone();
        let text = resp.text().await.unwrap_or_default();
        let err = classify_status(status, &headers, &text);
        if matches!(err, Error::RateLimited { .. }) {
            self.limiter.record_throttled();
        }
        Err(err)
    }
}

#[async_trait]
impl SourceClient for CoinGeckoClient {
    fn name(&self) -> &'static str {
        "coingecko"
    }

    #[instrument(skip(self), name = "coingecko::fetch", fields(symbol = %request.symbol, interval = %request.interval))]
    async fn fetch(&self, request: &FetchRequest) -> Result<RawResponse> {
        request.validate()?;
        if !SUPPORTED_INTERVALS.contains(&request.interval) {
            return Err(Error::InvalidRequest(format!(
                "coingecko cannot serve {} bars (supported: 1h, 4h, 1d)",
                request.interval
            )));
        }

        let coin_id = request.symbol.trim().to_lowercase();
        if !is_coin_id(&coin_id) {
            return Err(Error::InvalidSymbol(request.symbol.trim().to_string()));
        }
        let vs_currency = match &request.quote {
            Some(quote) => quote.to_lowercase(),
            None => self.vs_currency.clone(),
        };
        let url = format!("{}/api/v3/coins/{}/market_chart/range", self.base_url, coin_id);
        let query = [
            ("vs_currency", vs_currency),
            ("from", request.start.timestamp().to_string()),
            ("to", request.end.timestamp().to_string()),
        ];

        let (url, query, id) = (url.as_str(), &query[..], coin_id.as_str());
        let body = self
            .retry
            .run("coingecko::market_chart", move || self.get_json(url, query, id))
            .await?;

        let points = body["prices"].as_array().map_or(0, Vec::len);
        info!(coin = %coin_id, points, "market chart fetched");

        Ok(RawResponse {
            symbol: coin_id,
            interval: request.interval,
            format: RawFormat::MarketChart,
            body,
        })
    }

    /// GET /api/v3/coins/list: the coin picker list.
    #[instrument(skip(self), name = "coingecko::list_symbols")]
    async fn list_symbols(&self) -> Result<Vec<SymbolInfo>> {
        let url = format!("{}/api/v3/coins/list", self.base_url);
        let url = url.as_str();
        let body = self
            .retry
            .run("coingecko::coins_list", move || self.get_json(url, &[], ""))
            .await?;

        let symbols: Vec<SymbolInfo> = serde_json::from_value(body)
            .map_err(|e| Error::MalformedData(format!("unexpected coins list shape: {e}")))?;
        debug!(count = symbols.len(), "coins listed");
        Ok(symbols)
    }

    fn rate_limit(&self) -> Option<RateLimitSnapshot> {
        Some(self.limiter.snapshot())
    }
}

impl std::fmt::Debug for CoinGeckoClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CoinGeckoClient")
            .field("base_url", &self.base_url)
            .field("vs_currency", &self.vs_currency)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::extract::{Path, Query};
    use axum::http::StatusCode;
    use axum::response::IntoResponse;
    use axum::routing::get;
    use axum::{Json, Router};
    use chrono::{TimeZone, Utc};
    use std::collections::HashMap;

    async fn serve(app: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{addr}")
    }

    fn client(base: String) -> CoinGeckoClient {
        let retry = RetryPolicy {
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(5),
            ..RetryPolicy::default()
        };
        CoinGeckoClient::new(base, "USD", Duration::from_secs(5), Duration::ZERO, retry).unwrap()
    }

    fn request(symbol: &str, interval: Interval) -> FetchRequest {
        let start = Utc.timestamp_opt(1_700_006_400, 0).unwrap();
        FetchRequest::new(symbol, interval, start, start + chrono::Duration::days(2))
    }

    async fn market_chart(
        Path(id): Path<String>,
        Query(q): Query<HashMap<String, String>>,
    ) -> impl IntoResponse {
        if id != "bitcoin" {
            return (StatusCode::NOT_FOUND, Json(serde_json::json!({"error": "coin not found"})))
                .into_response();
        }
        assert_eq!(q["vs_currency"], "usd");
        assert_eq!(q["from"], "1700006400");
        Json(serde_json::json!({
            "prices": [[1_700_006_400_000i64, 37000.0], [1_700_010_000_000i64, 37100.0]],
            "market_caps": [],
            "total_volumes": [[1_700_006_400_000i64, 1.0e9], [1_700_010_000_000i64, 1.1e9]]
        }))
        .into_response()
    }

    #[tokio::test]
    async fn fetch_returns_market_chart_payload() {
        let app = Router::new().route("/api/v3/coins/:id/market_chart/range", get(market_chart));
        let base = serve(app).await;
        let raw = client(base).fetch(&request("Bitcoin", Interval::H1)).await.unwrap();
        assert_eq!(raw.format, RawFormat::MarketChart);
        assert_eq!(raw.symbol, "bitcoin");
        assert_eq!(raw.body["prices"].as_array().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn unknown_coin_maps_to_invalid_symbol() {
        let app = Router::new().route("/api/v3/coins/:id/market_chart/range", get(market_chart));
        let base = serve(app).await;
        let err = client(base).fetch(&request("notacoin", Interval::D1)).await.unwrap_err();
        assert_eq!(err, Error::InvalidSymbol("notacoin".into()));
    }

    #[tokio::test]
    async fn minute_bars_are_not_supported() {
        let c = client("http://127.0.0.1:9".into());
        let err = c.fetch(&request("bitcoin", Interval::M5)).await.unwrap_err();
        assert!(matches!(err, Error::InvalidRequest(_)));
        assert_eq!(c.rate_limit().unwrap().requests_sent, 0);
    }

    #[tokio::test]
    async fn request_quote_overrides_configured_currency() {
        let app = Router::new().route(
            "/api/v3/coins/:id/market_chart/range",
            get(|Query(q): Query<HashMap<String, String>>| async move {
                Json(serde_json::json!({
                    "prices": [],
                    "total_volumes": [],
                    "vs_currency": q["vs_currency"]
                }))
            }),
        );
        let base = serve(app).await;
        let c = client(base);

        let raw = c
            .fetch(&request("bitcoin", Interval::H1).with_quote(Some("EUR".into())))
            .await
            .unwrap();
        assert_eq!(raw.body["vs_currency"], "eur");

        let raw = c.fetch(&request("bitcoin", Interval::H1)).await.unwrap();
        assert_eq!(raw.body["vs_currency"], "usd");
    }

    #[tokio::test]
    async fn ids_that_would_rewrite_the_path_are_rejected() {
        let c = client("http://127.0.0.1:9".into());
        for id in ["bitcoin?x=", "../coins/list", "bit coin", "bitcoin/ohlc", "bitcoin#"] {
            let err = c.fetch(&request(id, Interval::H1)).await.unwrap_err();
            assert_eq!(err, Error::InvalidSymbol(id.to_string()), "{id}");
        }
        assert_eq!(c.rate_limit().unwrap().requests_sent, 0);
    }

    #[test]
    fn coin_ids_allow_dashes_and_digits() {
        assert!(is_coin_id("wrapped-bitcoin"));
        assert!(is_coin_id("1inch"));
        assert!(!is_coin_id(""));
        assert!(!is_coin_id("Bitcoin"));
        assert!(!is_coin_id("btc%2f"));
    }

    #[tokio::test]
    async fn coins_list_is_decoded() {
        let app = Router::new().route(
            "/api/v3/coins/list",
            get(|| async {
                Json(serde_json::json!([
                    {"id": "bitcoin", "symbol": "btc", "name": "Bitcoin"},
                    {"id": "ethereum", "symbol": "eth", "name": "Ethereum"}
                ]))
            }),
        );
        let base = serve(app).await;
        let coins = client(base).list_symbols().await.unwrap();
        assert_eq!(coins.len(), 2);
        assert_eq!(coins[1].name, "Ethereum");
    }
}

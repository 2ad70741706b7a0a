// =============================================================================
// REST API Endpoints: Axum 0.7
// =============================================================================
//
// All endpoints live under `/api/v1/` and are read-only.
//
//   GET /health        status, provider, rate-limit snapshot, cache stats
//   GET /dataset       bars + indicators for symbol / interval / indicators
//   GET /summary       dataset with the default set + market summary
//
// Both dataset routes also take `bars` (history length) and `vs_currency`
// (quote currency, CoinGecko only); left out, the configured values apply.
//   GET /symbols       provider symbol list (cached for a day)
//   GET /cache/stats   cache counters
//
// Errors are JSON `{ "error": code, "message": user_message }` with a status
// derived from the error kind. CORS is permissive; every request is traced.
// =============================================================================

use std::collections::BTreeSet;
use std::sync::Arc;

use axum::{
    extract::{Json, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use serde::{Deserialize, Serialize};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{error, warn};

use crate::analysis::{self, MarketSummary, SUMMARY_INDICATORS};
use crate::app_state::{AppState, ErrorRecord};
use crate::cache::CacheStats;
use crate::error::Error;
use crate::indicators::{self, IndicatorFailure, IndicatorSpec};
use crate::pipeline::{Dataset, DatasetOptions};
use crate::source::RateLimitSnapshot;
use crate::types::Interval;

const DEFAULT_INTERVAL: Interval = Interval::H1;

// =============================================================================
// Router construction
// =============================================================================

/// Build the full REST API router with CORS and tracing middleware.
pub fn router(state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/api/v1/health", get(health))
        .route("/api/v1/dataset", get(dataset))
        .route("/api/v1/summary", get(summary))
        .route("/api/v1/symbols", get(symbols))
        .route("/api/v1/cache/stats", get(cache_stats))
        // ── Middleware & State ───────────────────────────────────────
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

// =============================================================================
// Error mapping
// =============================================================================

pub struct ApiError(Error);

#[derive(Serialize)]
struct ErrorBody {
    error: &'static str,
    message: String,
}

pub fn status_for(err: &Error) -> StatusCode {
    match err {
        Error::Network(_) | Error::MalformedData(_) => StatusCode::BAD_GATEWAY,
        Error::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
        Error::InvalidSymbol(_) => StatusCode::NOT_FOUND,
        Error::InvalidRequest(_) | Error::InvalidIndicatorSpec { .. } => StatusCode::BAD_REQUEST,
        Error::CacheUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = status_for(&self.0);
        if status.is_server_error() {
            error!(code = self.0.code(), error = %self.0, "request failed");
        } else {
            warn!(code = self.0.code(), error = %self.0, "request rejected");
        }
        let body = ErrorBody {
            error: self.0.code(),
            message: self.0.user_message(),
        };
        (status, Json(body)).into_response()
    }
}

/// Record a failure on the shared state before it becomes a response.
fn fail(state: &AppState, err: Error) -> ApiError {
    state.record_error(&err);
    ApiError(err)
}

// =============================================================================
// Health
// =============================================================================

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    provider: &'static str,
    server_time: i64,
    uptime_secs: i64,
    requests_served: u64,
    lookback_bars: u32,
    rate_limit: Option<RateLimitSnapshot>,
    cache: CacheStats,
    indicators: Vec<&'static str>,
    recent_errors: Vec<ErrorRecord>,
}

async fn health(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let now = chrono::Utc::now();
    let resp = HealthResponse {
        status: "ok",
        provider: state.pipeline.source_name(),
        server_time: now.timestamp_millis(),
        uptime_secs: (now - state.started_at).num_seconds(),
        requests_served: state.requests_served(),
        lookback_bars: state.runtime_config.lookback(),
        rate_limit: state.pipeline.rate_limit(),
        cache: state.pipeline.cache_stats(),
        indicators: indicators::available().collect(),
        recent_errors: state.recent_errors(10),
    };
    Json(resp)
}

// =============================================================================
// Dataset
// =============================================================================

#[derive(Debug, Default, Deserialize)]
struct DatasetQuery {
    symbol: Option<String>,
    interval: Option<String>,
    indicators: Option<String>,
    bars: Option<String>,
    vs_currency: Option<String>,
}

struct ParsedQuery {
    symbol: String,
    interval: Interval,
    specs: BTreeSet<IndicatorSpec>,
    failures: Vec<IndicatorFailure>,
    options: DatasetOptions,
}

impl DatasetQuery {
    fn parse(self) -> Result<ParsedQuery, Error> {
        let symbol = self
            .symbol
            .filter(|s| !s.trim().is_empty())
            .ok_or_else(|| Error::InvalidRequest("missing 'symbol' parameter".into()))?;

        let interval = match self.interval.as_deref().map(str::trim) {
            None | Some("") => DEFAULT_INTERVAL,
            Some(raw) => raw.parse::<Interval>().map_err(Error::InvalidRequest)?,
        };

        let list = self
            .indicators
            .filter(|s| !s.trim().is_empty())
            .unwrap_or_else(|| SUMMARY_INDICATORS.to_string());
        let (specs, failures) = IndicatorSpec::parse_list(&list);

        let lookback_bars = match self.bars.as_deref().map(str::trim) {
            None | Some("") => None,
            Some(raw) => Some(raw.parse::<u32>().map_err(|_| {
                Error::InvalidRequest(format!(
                    "'bars' must be a positive whole number, got '{raw}'"
                ))
            })?),
        };
        let vs_currency = self.vs_currency.filter(|s| !s.trim().is_empty());

        Ok(ParsedQuery {
            symbol,
            interval,
            specs,
            failures,
            options: DatasetOptions {
                lookback_bars,
                vs_currency,
            },
        })
    }
}

async fn dataset(
    State(state): State<Arc<AppState>>,
    Query(query): Query<DatasetQuery>,
) -> Result<Response, ApiError> {
    state.record_request();
    let query = query.parse().map_err(|e| fail(&state, e))?;

    let dataset = state
        .pipeline
        .get_dataset(&query.symbol, query.interval, &query.specs, &query.options)
        .await
        .map_err(|e| fail(&state, e))?;

    if query.failures.is_empty() {
        return Ok(Json(dataset.as_ref()).into_response());
    }
    // Tokens that did not even parse are reported like any other bad spec.
    let mut body = Dataset::clone(&dataset);
    body.failures.extend(query.failures);
    Ok(Json(body).into_response())
}

// =============================================================================
// Summary
// =============================================================================

#[derive(Serialize)]
struct SummaryResponse<'a> {
    summary: MarketSummary,
    dataset: &'a Dataset,
}

#[derive(Debug, Deserialize)]
struct SummaryQuery {
    symbol: Option<String>,
    interval: Option<String>,
    bars: Option<String>,
    vs_currency: Option<String>,
}

async fn summary(
    State(state): State<Arc<AppState>>,
    Query(query): Query<SummaryQuery>,
) -> Result<Response, ApiError> {
    state.record_request();
    let query = DatasetQuery {
        symbol: query.symbol,
        interval: query.interval,
        bars: query.bars,
        vs_currency: query.vs_currency,
        ..DatasetQuery::default()
    }
    .parse()
    .map_err(|e| fail(&state, e))?;

    let dataset = state
        .pipeline
        .get_dataset(&query.symbol, query.interval, &query.specs, &query.options)
        .await
        .map_err(|e| fail(&state, e))?;

    let summary = analysis::summarize(&dataset).ok_or_else(|| {
        fail(
            &state,
            Error::MalformedData(format!("no bars to summarise for {}", dataset.symbol)),
        )
    })?;

    Ok(Json(SummaryResponse {
        summary,
        dataset: dataset.as_ref(),
    })
    .into_response())
}

// =============================================================================
// Symbols & cache
// =============================================================================

async fn symbols(State(state): State<Arc<AppState>>) -> Result<Response, ApiError> {
    state.record_request();
    let list = state
        .pipeline
        .list_symbols()
        .await
        .map_err(|e| fail(&state, e))?;
    Ok(Json(list.as_slice()).into_response())
}

async fn cache_stats(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.pipeline.cache_stats())
}

// =============================================================================
// Pipeline: fetch, normalise, compute, cache
// =============================================================================
//
// `get_dataset(symbol, interval, specs, options)` is the one inbound
// operation. The whole fetch + normalise + compute chain runs inside the
// result cache's producer, so concurrent requests for the same dataset share a
// single provider round trip.
//
// Cache key: provider | symbol (lower-cased) | interval | lookback bars |
// quote currency | as-of bar bucket | sorted spec list. The bucket is the
// index of the bar that contains "now", so the first request after a bar
// boundary never reuses a dataset built before it.
//
// The disk layer, when configured, is consulted inside the producer before
// the provider and written after a successful computation. A disk hit only
// lives in memory for what is left of its TTL.
// =============================================================================

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::cache::{CacheStats, DiskStore, ResultCache};
use crate::error::{Error, Result};
use crate::indicators::{self, IndicatorFailure, IndicatorSeries, IndicatorSpec};
use crate::market_data::{NormalizeReport, Normalizer, PriceSeries};
use crate::runtime_config::{RuntimeConfig, MAX_LOOKBACK_BARS};
use crate::source::{FetchRequest, RateLimitSnapshot, SourceClient, SymbolInfo};
use crate::types::{Interval, ProviderKind};

/// Provider symbol lists change rarely.
const SYMBOLS_TTL: Duration = Duration::from_secs(24 * 60 * 60);

pub type Clock = Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>;

/// Normalised bars plus every requested indicator, aligned bar for bar.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Dataset {
    pub source: String,
    pub symbol: String,
    pub interval: Interval,
    pub series: PriceSeries,
    pub indicators: BTreeMap<IndicatorSpec, IndicatorSeries>,
    pub failures: Vec<IndicatorFailure>,
    pub report: NormalizeReport,
    pub generated_at: DateTime<Utc>,
}

impl Dataset {
    pub fn indicator(&self, spec: &IndicatorSpec) -> Option<&IndicatorSeries> {
        self.indicators.get(spec)
    }
}

/// Per-request overrides of the configured history window and quote currency.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DatasetOptions {
    /// Bars of history ending now; the configured lookback when `None`.
    pub lookback_bars: Option<u32>,
    /// Quote currency for providers that price in one (CoinGecko).
    pub vs_currency: Option<String>,
}

pub struct Pipeline {
    source: Arc<dyn SourceClient>,
    normalizer: Normalizer,
    datasets: ResultCache<String, Arc<Dataset>>,
    symbols: ResultCache<String, Arc<Vec<SymbolInfo>>>,
    disk: Option<DiskStore>,
    lookback_bars: u32,
    default_quote: Option<String>,
    fixed_ttl: Option<Duration>,
    clock: Clock,
}

impl Pipeline {
    pub fn new(source: Arc<dyn SourceClient>, config: &RuntimeConfig) -> Self {
        let fixed_ttl = config.cache_ttl_secs.map(Duration::from_secs);
        let default_quote = match config.provider {
            ProviderKind::CoinGecko => Some(config.vs_currency.to_lowercase()),
            ProviderKind::Binance => None,
        };
        Self {
            source,
            normalizer: Normalizer::new(config.max_invalid_fraction),
            datasets: ResultCache::new(
                config.cache_capacity,
                fixed_ttl.unwrap_or_else(|| Interval::H1.duration()),
            ),
            symbols: ResultCache::new(1, SYMBOLS_TTL),
            disk: config.cache_dir.clone().map(DiskStore::new),
            lookback_bars: config.lookback(),
            default_quote,
            fixed_ttl,
            clock: Arc::new(Utc::now),
        }
    }

    /// Replace the wall clock used for request ranges and timestamps.
    #[cfg(test)]
    pub fn with_clock(mut self, clock: Clock) -> Self {
        self.clock = clock;
        self
    }

    pub fn source_name(&self) -> &'static str {
        self.source.name()
    }

    pub fn rate_limit(&self) -> Option<RateLimitSnapshot> {
        self.source.rate_limit()
    }

    pub fn cache_stats(&self) -> CacheStats {
        self.datasets.stats()
    }

    fn ttl_for(&self, interval: Interval) -> Duration {
        self.fixed_ttl.unwrap_or_else(|| interval.duration())
    }

    fn lookback_for(&self, options: &DatasetOptions) -> Result<u32> {
        match options.lookback_bars {
            None => Ok(self.lookback_bars),
            Some(bars) if (1..=MAX_LOOKBACK_BARS).contains(&bars) => Ok(bars),
            Some(bars) => Err(Error::InvalidRequest(format!(
                "bars must be between 1 and {MAX_LOOKBACK_BARS}, got {bars}"
            ))),
        }
    }

    fn quote_for(&self, options: &DatasetOptions) -> Result<Option<String>> {
        let Some(raw) = &options.vs_currency else {
            return Ok(self.default_quote.clone());
        };
        let quote = raw.trim().to_lowercase();
        let valid = (2..=10).contains(&quote.len())
            && quote.bytes().all(|b| b.is_ascii_lowercase() || b.is_ascii_digit());
        if !valid {
            return Err(Error::InvalidRequest(format!("'{raw}' is not a currency code")));
        }
        Ok(Some(quote))
    }

    /// Dataset for the last `lookback` bars of `symbol` ending now.
    ///
    /// Indicator specs that cannot be computed are listed in
    /// `Dataset::failures`; every other error fails the whole call.
    pub async fn get_dataset(
        &self,
        symbol: &str,
        interval: Interval,
        specs: &BTreeSet<IndicatorSpec>,
        options: &DatasetOptions,
    ) -> Result<Arc<Dataset>> {
        let symbol = symbol.trim();
        if symbol.is_empty() {
            return Err(Error::InvalidRequest("symbol must not be empty".into()));
        }
        let lookback = self.lookback_for(options)?;
        let quote = self.quote_for(options)?;

        let as_of = (self.clock)();
        let start = lookback_start(as_of, interval, lookback)?;
        let spec_list: Vec<String> = specs.iter().map(ToString::to_string).collect();
        let key = format!(
            "{}|{}|{}|{}|{}|{}|{}",
            self.source.name(),
            symbol.to_lowercase(),
            interval,
            lookback,
            quote.as_deref().unwrap_or("-"),
            as_of.timestamp_millis().div_euclid(interval.millis()),
            spec_list.join(";")
        );
        let ttl = self.ttl_for(interval);

        let source = Arc::clone(&self.source);
        let clock = Arc::clone(&self.clock);
        let disk = self.disk.clone();
        let normalizer = self.normalizer;
        let specs = specs.clone();
        let request = FetchRequest::new(symbol, interval, start, as_of).with_quote(quote);
        let producer_key = key.clone();

        self.datasets
            .get_or_compute_expiring(key, move || async move {
                if let Some(disk) = &disk {
                    match disk.load::<Dataset>(&producer_key, ttl, clock()).await {
                        Ok(Some((dataset, remaining))) => {
                            info!(
                                key = %producer_key,
                                remaining_secs = remaining.as_secs(),
                                "dataset served from disk cache"
                            );
                            return Ok((Arc::new(dataset), remaining));
                        }
                        Ok(None) => {}
                        Err(e) => warn!(error = %e, "disk cache read failed, fetching instead"),
                    }
                }

                let raw = source.fetch(&request).await?;
                let normalized = normalizer.normalize(&raw)?;
                let computed = indicators::compute(&normalized.series, &specs);

                let dataset = Arc::new(Dataset {
                    source: source.name().to_string(),
                    symbol: normalized.series.symbol().to_string(),
                    interval: normalized.series.interval(),
                    series: normalized.series,
                    indicators: computed.series,
                    failures: computed.failures,
                    report: normalized.report,
                    generated_at: clock(),
                });
                info!(
                    symbol = %dataset.symbol,
                    interval = %interval,
                    bars = dataset.series.len(),
                    indicators = dataset.indicators.len(),
                    failures = dataset.failures.len(),
                    "dataset computed"
                );

                if let Some(disk) = &disk {
                    if let Err(e) = disk.store(&producer_key, dataset.as_ref(), clock()).await {
                        warn!(error = %e, "disk cache write failed");
                    }
                }
                Ok((dataset, ttl))
            })
            .await
    }

    /// Provider symbol list, cached for a day.
    pub async fn list_symbols(&self) -> Result<Arc<Vec<SymbolInfo>>> {
        let source = Arc::clone(&self.source);
        self.symbols
            .get_or_compute(self.source.name().to_string(), move || async move {
                let symbols = source.list_symbols().await?;
                info!(count = symbols.len(), "symbol list refreshed");
                Ok(Arc::new(symbols))
            })
            .await
    }
}

/// Start of a window of `bars` bars ending at `end`.
fn lookback_start(end: DateTime<Utc>, interval: Interval, bars: u32) -> Result<DateTime<Utc>> {
    let span = chrono::Duration::milliseconds(interval.millis().saturating_mul(i64::from(bars)));
    end.checked_sub_signed(span).ok_or_else(|| {
        Error::InvalidRequest(format!(
            "{bars} bars of {interval} reach before the earliest supported date"
        ))
    })
}

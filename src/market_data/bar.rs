use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::types::Interval;

// ---------------------------------------------------------------------------
// PriceBar
// ---------------------------------------------------------------------------

/// One OHLCV record. `timestamp` is the start of the interval in UTC.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PriceBar {
    pub timestamp: DateTime<Utc>,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
}

impl PriceBar {
    /// Return the first OHLCV invariant this bar breaks, if any.
    ///
    /// Prices must be finite and positive, volume finite and non-negative,
    /// `high >= max(open, close)` and `low <= min(open, close)`.
    pub fn violation(&self) -> Option<&'static str> {
        let prices = [self.open, self.high, self.low, self.close];
        if prices.iter().any(|p| !p.is_finite()) || !self.volume.is_finite() {
            return Some("non-finite value");
        }
        if prices.iter().any(|&p| p <= 0.0) {
            return Some("non-positive price");
        }
        if self.volume < 0.0 {
            return Some("negative volume");
        }
        if self.high < self.open.max(self.close) {
            return Some("high below open/close");
        }
        if self.low > self.open.min(self.close) {
            return Some("low above open/close");
        }
        None
    }
}

// ---------------------------------------------------------------------------
// PriceSeries
// ---------------------------------------------------------------------------

/// Bars for exactly one (symbol, interval), strictly increasing by timestamp.
///
/// There is no mutating API: once built the series is read-only, so every
/// indicator derived from it stays aligned with it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "SeriesParts")]
pub struct PriceSeries {
    symbol: String,
    interval: Interval,
    bars: Vec<PriceBar>,
}

#[derive(Deserialize)]
struct SeriesParts {
    symbol: String,
    interval: Interval,
    bars: Vec<PriceBar>,
}

impl TryFrom<SeriesParts> for PriceSeries {
    type Error = Error;

    fn try_from(parts: SeriesParts) -> Result<Self> {
        Self::new(parts.symbol, parts.interval, parts.bars)
    }
}

impl PriceSeries {
    /// Build a series, rejecting duplicate or out-of-order timestamps.
    pub fn new(symbol: impl Into<String>, interval: Interval, bars: Vec<PriceBar>) -> Result<Self> {
        if let Some(pair) = bars.windows(2).find(|w| w[1].timestamp <= w[0].timestamp) {
            return Err(Error::MalformedData(format!(
                "timestamps not strictly increasing at {}",
                pair[1].timestamp
            )));
        }
        Ok(Self {
            symbol: symbol.into(),
            interval,
            bars,
        })
    }

    pub fn symbol(&self) -> &str {
        &self.symbol
    }

    pub fn interval(&self) -> Interval {
        self.interval
    }

    pub fn bars(&self) -> &[PriceBar] {
        &self.bars
    }

    pub fn len(&self) -> usize {
        self.bars.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bars.is_empty()
    }

    pub fn closes(&self) -> Vec<f64> {
        self.bars.iter().map(|b| b.close).collect()
    }

    pub fn volumes(&self) -> Vec<f64> {
        self.bars.iter().map(|b| b.volume).collect()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

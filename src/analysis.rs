// =============================================================================
// Market Summary: descriptive statistics and rule-based labels
// =============================================================================
//
// Built from a Dataset:
//   - price / volume descriptive stats (count, mean, std, min, quartiles, max)
//   - per-bar return volatility (std of roc(1), in percent)
//   - lag-1 autocorrelation of returns
//   - labels for trend (SMA 10 vs SMA 30 vs price), RSI zone, MACD state,
//     volume vs average, and volatility class
//
// Labels are `None` when the series is too short for the underlying
// indicator, never a guess.
// =============================================================================

use serde::{Deserialize, Serialize};

use crate::indicators::{self, roc::roc, IndicatorSpec};
use crate::pipeline::Dataset;
use crate::types::Interval;

const RSI_OVERBOUGHT: f64 = 70.0;
const RSI_OVERSOLD: f64 = 30.0;
const HIGH_VOLUME_RATIO: f64 = 1.5;
const LOW_VOLUME_RATIO: f64 = 0.5;
const HIGH_VOLATILITY_PCT: f64 = 0.5;
const MODERATE_VOLATILITY_PCT: f64 = 0.2;
const AUTOCORR_NOISE_BAND: f64 = 0.05;

/// Indicator set the summary reads, also the API's default request.
pub const SUMMARY_INDICATORS: &str = "sma:10,sma:30,macd,rsi";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DescriptiveStats {
    pub count: usize,
    pub mean: f64,
    /// Sample standard deviation; `None` below two values.
    pub std: Option<f64>,
    pub min: f64,
    pub q25: f64,
    pub median: f64,
    pub q75: f64,
    pub max: f64,
}

impl DescriptiveStats {
    pub fn from_values(values: &[f64]) -> Option<Self> {
        if values.is_empty() {
            return None;
        }
        let mut sorted = values.to_vec();
        sorted.sort_by(f64::total_cmp);

        let mean = mean(values);
        Some(Self {
            count: values.len(),
            mean,
            std: sample_std(values, mean),
            min: sorted[0],
            q25: quantile(&sorted, 0.25),
            median: quantile(&sorted, 0.5),
            q75: quantile(&sorted, 0.75),
            max: sorted[sorted.len() - 1],
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Trend {
    Uptrend,
    PotentialUptrend,
    Downtrend,
    PotentialDowntrend,
    Sideways,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RsiZone {
    Overbought,
    Oversold,
    Neutral,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MacdState {
    BullishCrossover,
    BearishCrossover,
    Bullish,
    Bearish,
    Neutral,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VolumeState {
    High,
    Low,
    Normal,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VolatilityClass {
    High,
    Moderate,
    Low,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Autocorrelation {
    /// Within ±0.05: past returns say little about the next one.
    VeryLow,
    /// Momentum.
    Positive,
    /// Mean reversion.
    Negative,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MarketSummary {
    pub symbol: String,
    pub interval: Interval,
    pub last_close: f64,
    pub price: DescriptiveStats,
    pub volume: DescriptiveStats,
    /// Standard deviation of per-bar returns, in percent.
    pub return_volatility: Option<f64>,
    pub return_autocorrelation: Option<f64>,
    pub trend: Option<Trend>,
    pub rsi: Option<f64>,
    pub rsi_zone: Option<RsiZone>,
    pub macd_state: Option<MacdState>,
    pub macd_above_zero: Option<bool>,
    pub volume_state: Option<VolumeState>,
    pub volatility: Option<VolatilityClass>,
    pub autocorrelation: Option<Autocorrelation>,
}

/// Summarise `dataset`. Indicators the dataset does not carry are computed
/// from its series on the fly. `None` only for an empty series.
pub fn summarize(dataset: &Dataset) -> Option<MarketSummary> {
    let series = &dataset.series;
    if series.is_empty() {
        return None;
    }
    let closes = series.closes();
    let volumes = series.volumes();
    let last_close = *closes.last()?;

    let price = DescriptiveStats::from_values(&closes)?;
    let volume = DescriptiveStats::from_values(&volumes)?;

    let returns: Vec<f64> = roc(&closes, 1).into_iter().flatten().collect();
    let return_volatility = sample_std(&returns, mean(&returns));
    let return_autocorrelation = lag1_autocorrelation(&returns);

    let line = |spec: &str, name: &str| -> Vec<Option<f64>> {
        let Ok(spec) = spec.parse::<IndicatorSpec>() else {
            return Vec::new();
        };
        match dataset.indicator(&spec) {
            Some(out) => out.line(name).map(<[_]>::to_vec).unwrap_or_default(),
            None => indicators::compute_one(series, &spec)
                .ok()
                .and_then(|out| out.line(name).map(<[_]>::to_vec))
                .unwrap_or_default(),
        }
    };

    let sma_fast = last_defined(&line("sma:10", "value"));
    let sma_slow = last_defined(&line("sma:30", "value"));
    let trend = match (sma_fast, sma_slow) {
        (Some(fast), Some(slow)) => Some(classify_trend(last_close, fast, slow)),
        _ => None,
    };

    let rsi = last_defined(&line("rsi:14", "value"));
    let macd = line("macd", "macd");
    let signal = line("macd", "signal");

    Some(MarketSummary {
        symbol: dataset.symbol.clone(),
        interval: dataset.interval,
        last_close,
        return_volatility,
        return_autocorrelation,
        trend,
        rsi,
        rsi_zone: rsi.map(classify_rsi),
        macd_state: classify_macd(&macd, &signal),
        macd_above_zero: last_defined(&macd).filter(|m| *m != 0.0).map(|m| m > 0.0),
        volume_state: classify_volume(volume.mean, volumes.last().copied()),
        volatility: return_volatility.map(classify_volatility),
        autocorrelation: return_autocorrelation.map(classify_autocorrelation),
        price,
        volume,
    })
}

// ---------------------------------------------------------------------------
// Labels
// ---------------------------------------------------------------------------

fn classify_trend(price: f64, fast: f64, slow: f64) -> Trend {
    if fast > slow {
        if price > fast {
            Trend::Uptrend
        } else {
            Trend::PotentialUptrend
        }
    } else if fast < slow {
        if price < fast {
            Trend::Downtrend
        } else {
            Trend::PotentialDowntrend
        }
    } else {
        Trend::Sideways
    }
}

fn classify_rsi(rsi: f64) -> RsiZone {
    if rsi >= RSI_OVERBOUGHT {
        RsiZone::Overbought
    } else if rsi <= RSI_OVERSOLD {
        RsiZone::Oversold
    } else {
        RsiZone::Neutral
    }
}

/// A crossover needs both the last and the previous bar defined.
fn classify_macd(macd: &[Option<f64>], signal: &[Option<f64>]) -> Option<MacdState> {
    let n = macd.len().min(signal.len());
    let (m, s) = (macd.get(n.checked_sub(1)?)?.as_ref()?, signal[n - 1].as_ref()?);
    let prev = n
        .checked_sub(2)
        .and_then(|i| Some((macd[i]?, signal[i]?)));

    let state = match prev {
        Some((pm, ps)) if m > s && pm <= ps => MacdState::BullishCrossover,
        Some((pm, ps)) if m < s && pm >= ps => MacdState::BearishCrossover,
        _ if m > s => MacdState::Bullish,
        _ if m < s => MacdState::Bearish,
        _ => MacdState::Neutral,
    };
    Some(state)
}

fn classify_volume(mean_volume: f64, last: Option<f64>) -> Option<VolumeState> {
    let last = last?;
    Some(if last > mean_volume * HIGH_VOLUME_RATIO {
        VolumeState::High
    } else if last < mean_volume * LOW_VOLUME_RATIO {
        VolumeState::Low
    } else {
        VolumeState::Normal
    })
}

fn classify_volatility(std_pct: f64) -> VolatilityClass {
    if std_pct > HIGH_VOLATILITY_PCT {
        VolatilityClass::High
    } else if std_pct > MODERATE_VOLATILITY_PCT {
        VolatilityClass::Moderate
    } else {
        VolatilityClass::Low
    }
}

fn classify_autocorrelation(ac: f64) -> Autocorrelation {
    if ac.abs() < AUTOCORR_NOISE_BAND {
        Autocorrelation::VeryLow
    } else if ac > 0.0 {
        Autocorrelation::Positive
    } else {
        Autocorrelation::Negative
    }
}

// ---------------------------------------------------------------------------
// Statistics helpers
// ---------------------------------------------------------------------------

fn last_defined(values: &[Option<f64>]) -> Option<f64> {
    values.last().copied().flatten()
}

fn mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        return f64::NAN;
    }
    values.iter().sum::<f64>() / values.len() as f64
}

fn sample_std(values: &[f64], mean: f64) -> Option<f64> {
    if values.len() < 2 {
        return None;
    }
    let var = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / (values.len() - 1) as f64;
    let std = var.sqrt();
    std.is_finite().then_some(std)
}

/// Linear interpolation between closest ranks over sorted input.
fn quantile(sorted: &[f64], q: f64) -> f64 {
    let pos = q * (sorted.len() - 1) as f64;
    let lo = pos.floor() as usize;
    let hi = pos.ceil() as usize;
    sorted[lo] + (sorted[hi] - sorted[lo]) * (pos - lo as f64)
}

/// Pearson correlation of `r[1..]` against `r[..n-1]`.
fn lag1_autocorrelation(returns: &[f64]) -> Option<f64> {
    if returns.len() < 3 {
        return None;
    }
    let (a, b) = (&returns[1..], &returns[..returns.len() - 1]);
    let (ma, mb) = (mean(a), mean(b));
    let mut cov = 0.0;
    let mut va = 0.0;
    let mut vb = 0.0;
    for (x, y) in a.iter().zip(b) {
        cov += (x - ma) * (y - mb);
        va += (x - ma).powi(2);
        vb += (y - mb).powi(2);
    }
    let r = cov / (va * vb).sqrt();
    r.is_finite().then_some(r)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::market_data::bar::tests::daily_series;
    use crate::market_data::NormalizeReport;
    use approx::assert_abs_diff_eq;
    use chrono::Utc;
    use std::collections::BTreeMap;

    fn dataset(closes: &[f64]) -> Dataset {
        let series = daily_series(closes);
        Dataset {
            source: "test".into(),
            symbol: series.symbol().to_string(),
            interval: series.interval(),
            series,
            indicators: BTreeMap::new(),
            failures: Vec::new(),
            report: NormalizeReport::default(),
            generated_at: Utc::now(),
        }
    }

    #[test]
    fn describe_matches_reference_quartiles() {
        let stats = DescriptiveStats::from_values(&[4.0, 1.0, 3.0, 2.0]).unwrap();
        assert_eq!(stats.count, 4);
        assert_abs_diff_eq!(stats.mean, 2.5);
        assert_abs_diff_eq!(stats.q25, 1.75);
        assert_abs_diff_eq!(stats.median, 2.5);
        assert_abs_diff_eq!(stats.q75, 3.25);
        assert_abs_diff_eq!(stats.std.unwrap(), 1.2909944487, epsilon = 1e-9);
        assert_eq!((stats.min, stats.max), (1.0, 4.0));
    }

    #[test]
    fn single_value_has_no_std() {
        let stats = DescriptiveStats::from_values(&[5.0]).unwrap();
        assert!(stats.std.is_none());
        assert_eq!(stats.median, 5.0);
    }

    #[test]
    fn trend_labels() {
        assert_eq!(classify_trend(12.0, 11.0, 10.0), Trend::Uptrend);
        assert_eq!(classify_trend(10.5, 11.0, 10.0), Trend::PotentialUptrend);
        assert_eq!(classify_trend(8.0, 9.0, 10.0), Trend::Downtrend);
        assert_eq!(classify_trend(9.5, 9.0, 10.0), Trend::PotentialDowntrend);
        assert_eq!(classify_trend(10.0, 10.0, 10.0), Trend::Sideways);
    }

    #[test]
    fn rsi_zone_boundaries_are_inclusive() {
        assert_eq!(classify_rsi(70.0), RsiZone::Overbought);
        assert_eq!(classify_rsi(30.0), RsiZone::Oversold);
        assert_eq!(classify_rsi(50.0), RsiZone::Neutral);
    }

    #[test]
    fn macd_crossover_needs_previous_bar() {
        let macd = [Some(-1.0), Some(1.0)];
        let signal = [Some(0.0), Some(0.0)];
        assert_eq!(classify_macd(&macd, &signal), Some(MacdState::BullishCrossover));

        let macd = [None, Some(1.0)];
        assert_eq!(classify_macd(&macd, &signal), Some(MacdState::Bullish));

        let macd = [Some(-1.0), Some(-2.0)];
        assert_eq!(classify_macd(&macd, &signal), Some(MacdState::Bearish));

        assert_eq!(classify_macd(&[Some(1.0), None], &signal), None);
    }

    #[test]
    fn volume_and_volatility_classes() {
        assert_eq!(classify_volume(100.0, Some(151.0)), Some(VolumeState::High));
        assert_eq!(classify_volume(100.0, Some(49.0)), Some(VolumeState::Low));
        assert_eq!(classify_volume(100.0, Some(100.0)), Some(VolumeState::Normal));
        assert_eq!(classify_volatility(0.6), VolatilityClass::High);
        assert_eq!(classify_volatility(0.3), VolatilityClass::Moderate);
        assert_eq!(classify_volatility(0.2), VolatilityClass::Low);
    }

    #[test]
    fn alternating_returns_are_negatively_autocorrelated() {
        let returns: Vec<f64> = (0..20).map(|i| if i % 2 == 0 { 1.0 } else { -1.0 }).collect();
        let ac = lag1_autocorrelation(&returns).unwrap();
        assert_abs_diff_eq!(ac, -1.0, epsilon = 1e-12);
        assert_eq!(classify_autocorrelation(ac), Autocorrelation::Negative);
    }

    #[test]
    fn steady_uptrend_summary() {
        let closes: Vec<f64> = (0..60).map(|i| 100.0 * 1.01f64.powi(i)).collect();
        let summary = summarize(&dataset(&closes)).unwrap();
        assert_eq!(summary.trend, Some(Trend::Uptrend));
        assert_eq!(summary.rsi_zone, Some(RsiZone::Overbought));
        assert_eq!(summary.macd_above_zero, Some(true));
        assert_eq!(summary.volume_state, Some(VolumeState::Normal));
        // Every return is exactly 1 %.
        assert_abs_diff_eq!(summary.return_volatility.unwrap(), 0.0, epsilon = 1e-9);
        assert_eq!(summary.volatility, Some(VolatilityClass::Low));
        assert_eq!(summary.price.count, 60);
    }

    #[test]
    fn short_series_has_no_indicator_labels() {
        let summary = summarize(&dataset(&[100.0, 101.0, 99.0])).unwrap();
        assert!(summary.trend.is_none());
        assert!(summary.rsi_zone.is_none());
        assert!(summary.macd_state.is_none());
        assert!(summary.return_volatility.is_some());
    }
}

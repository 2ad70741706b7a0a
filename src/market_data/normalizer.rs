// =============================================================================
// Normalizer: raw provider payload -> canonical PriceSeries
// =============================================================================
//
// Steps, in order:
//   1. Parse the payload for its declared format. A body that is not the
//      expected shape at all is malformed; single unreadable rows are counted
//      as invalid instead.
//   2. Drop duplicate timestamps, keeping the first occurrence in input order.
//   3. Require every timestamp to sit on the interval grid (relative to the
//      earliest bar), then sort. Off-grid data has no recoverable ordering.
//   4. Validate OHLCV invariants; drop violators. Too many drops => malformed.
//   5. Count missing grid slots. Gaps are kept, never interpolated.
// =============================================================================

use std::collections::{BTreeMap, HashMap, HashSet};

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::market_data::{PriceBar, PriceSeries};
use crate::source::{RawFormat, RawResponse};
use crate::types::Interval;

pub const DEFAULT_MAX_INVALID_FRACTION: f64 = 0.05;

/// Bookkeeping for one normalisation run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NormalizeReport {
    /// Rows (klines) or price points (market chart) in the payload.
    pub received: usize,
    pub duplicates: usize,
    /// Unreadable rows plus bars that broke an OHLCV invariant.
    pub invalid: usize,
    /// Missing grid slots between the first and last bar.
    pub gaps: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Normalized {
    pub series: PriceSeries,
    pub report: NormalizeReport,
}

#[derive(Debug, Clone, Copy)]
pub struct Normalizer {
    max_invalid_fraction: f64,
}

impl Default for Normalizer {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_INVALID_FRACTION)
    }
}

/// Parsed but not yet cleaned rows.
struct Parsed {
    bars: Vec<PriceBar>,
    received: usize,
    unreadable: usize,
    duplicates: usize,
}

impl Normalizer {
    pub fn new(max_invalid_fraction: f64) -> Self {
        Self {
            max_invalid_fraction: max_invalid_fraction.clamp(0.0, 1.0),
        }
    }

    pub fn normalize(&self, raw: &RawResponse) -> Result<Normalized> {
        let parsed = match raw.format {
            RawFormat::Klines => parse_klines(&raw.body)?,
            RawFormat::MarketChart => parse_market_chart(&raw.body, raw.interval)?,
        };
        let Parsed {
            bars,
            received,
            unreadable,
            mut duplicates,
        } = parsed;

        // -- duplicates: first occurrence wins ------------------------------
        let mut seen = HashSet::with_capacity(bars.len());
        let mut unique = Vec::with_capacity(bars.len());
        for bar in bars {
            if seen.insert(bar.timestamp.timestamp_millis()) {
                unique.push(bar);
            } else {
                duplicates += 1;
            }
        }

        // -- grid check + sort ----------------------------------------------
        let step = raw.interval.millis();
        if let Some(anchor) = unique.iter().map(|b| b.timestamp.timestamp_millis()).min() {
            if let Some(off) = unique
                .iter()
                .find(|b| (b.timestamp.timestamp_millis() - anchor).rem_euclid(step) != 0)
            {
                return Err(Error::MalformedData(format!(
                    "timestamp {} is off the {} grid",
                    off.timestamp, raw.interval
                )));
            }
        }
        unique.sort_by_key(|b| b.timestamp);

        // -- OHLCV invariants ------------------------------------------------
        let considered = unique.len() + unreadable;
        let mut invalid = unreadable;
        let mut clean = Vec::with_capacity(unique.len());
        for bar in unique {
            match bar.violation() {
                None => clean.push(bar),
                Some(reason) => {
                    debug!(timestamp = %bar.timestamp, reason, "dropping invalid bar");
                    invalid += 1;
                }
            }
        }

        if considered > 0 {
            let fraction = invalid as f64 / considered as f64;
            if fraction > self.max_invalid_fraction {
                return Err(Error::MalformedData(format!(
                    "{invalid} of {considered} bars invalid ({:.1}% > {:.1}% allowed)",
                    fraction * 100.0,
                    self.max_invalid_fraction * 100.0
                )));
            }
        }
        if clean.is_empty() {
            return Err(Error::MalformedData(format!(
                "no usable bars for {} {}",
                raw.symbol, raw.interval
            )));
        }
        if invalid > 0 {
            warn!(symbol = %raw.symbol, invalid, considered, "invalid bars dropped");
        }

        let gaps = count_gaps(&clean, step);
        let series = PriceSeries::new(raw.symbol.clone(), raw.interval, clean)?;
        let report = NormalizeReport {
            received,
            duplicates,
            invalid,
            gaps,
        };
        info!(
            symbol = %raw.symbol,
            interval = %raw.interval,
            bars = series.len(),
            duplicates,
            invalid,
            gaps,
            "series normalised"
        );

        Ok(Normalized { series, report })
    }
}

fn count_gaps(bars: &[PriceBar], step: i64) -> usize {
    bars.windows(2)
        .map(|w| {
            let delta = w[1].timestamp.timestamp_millis() - w[0].timestamp.timestamp_millis();
            (delta / step - 1).max(0) as usize
        })
        .sum()
}

// ---------------------------------------------------------------------------
// Klines: [[openTime, "open", "high", "low", "close", "volume", ...], ...]
// ---------------------------------------------------------------------------

fn parse_klines(body: &Value) -> Result<Parsed> {
    let rows = body
        .as_array()
        .ok_or_else(|| Error::MalformedData("klines payload is not an array".into()))?;

    let mut bars = Vec::with_capacity(rows.len());
    let mut unreadable = 0;
    for row in rows {
        match parse_kline_row(row) {
            Some(bar) => bars.push(bar),
            None => unreadable += 1,
        }
    }

    Ok(Parsed {
        bars,
        received: rows.len(),
        unreadable,
        duplicates: 0,
    })
}

fn parse_kline_row(row: &Value) -> Option<PriceBar> {
    let fields = row.as_array()?;
    if fields.len() < 6 {
        return None;
    }
    Some(PriceBar {
        timestamp: parse_millis(&fields[0])?,
        open: parse_str_f64(&fields[1])?,
        high: parse_str_f64(&fields[2])?,
        low: parse_str_f64(&fields[3])?,
        close: parse_str_f64(&fields[4])?,
        volume: parse_str_f64(&fields[5])?,
    })
}

// ---------------------------------------------------------------------------
// Market chart: {"prices": [[ms, p], ...], "total_volumes": [[ms, v], ...]}
// ---------------------------------------------------------------------------

fn parse_market_chart(body: &Value, interval: Interval) -> Result<Parsed> {
    let prices = body["prices"]
        .as_array()
        .ok_or_else(|| Error::MalformedData("market chart has no 'prices' array".into()))?;
    let volumes = body["total_volumes"]
        .as_array()
        .ok_or_else(|| Error::MalformedData("market chart has no 'total_volumes' array".into()))?;

    let mut volume_at: HashMap<i64, f64> = HashMap::with_capacity(volumes.len());
    for point in volumes {
        if let Some((ts, v)) = parse_point(point) {
            volume_at.entry(ts).or_insert(v);
        }
    }

    // Points in time order; the stable sort keeps first-seen duplicates first.
    let mut unreadable = 0;
    let mut points: Vec<(i64, f64)> = Vec::with_capacity(prices.len());
    for point in prices {
        match parse_point(point) {
            Some(p) => points.push(p),
            None => unreadable += 1,
        }
    }
    points.sort_by_key(|&(ts, _)| ts);

    let mut duplicates = 0;
    let mut last_ts = None;
    let step = interval.millis();
    let mut buckets: BTreeMap<i64, PriceBar> = BTreeMap::new();
    for (ts, price) in points {
        if last_ts == Some(ts) {
            duplicates += 1;
            continue;
        }
        last_ts = Some(ts);

        // Inner join: a price without a volume point at the same instant is skipped.
        let Some(&volume) = volume_at.get(&ts) else {
            continue;
        };
        let start = ts - ts.rem_euclid(step);
        let Some(timestamp) = Utc.timestamp_millis_opt(start).single() else {
            unreadable += 1;
            continue;
        };
        buckets
            .entry(start)
            .and_modify(|bar| {
                bar.high = bar.high.max(price);
                bar.low = bar.low.min(price);
                bar.close = price;
                bar.volume = volume;
            })
            .or_insert(PriceBar {
                timestamp,
                open: price,
                high: price,
                low: price,
                close: price,
                volume,
            });
    }

    debug!(points = prices.len(), bars = buckets.len(), "market chart bucketed");
    Ok(Parsed {
        bars: buckets.into_values().collect(),
        received: prices.len(),
        unreadable,
        duplicates,
    })
}

fn parse_point(point: &Value) -> Option<(i64, f64)> {
    let pair = point.as_array()?;
    if pair.len() < 2 {
        return None;
    }
    let ts = parse_millis(&pair[0])?.timestamp_millis();
    Some((ts, parse_str_f64(&pair[1])?))
}

// ---------------------------------------------------------------------------
// Scalar helpers
// ---------------------------------------------------------------------------

/// Numbers arrive either as JSON numbers or as decimal strings.
fn parse_str_f64(val: &Value) -> Option<f64> {
    match val {
        Value::String(s) => s.trim().parse::<f64>().ok(),
        Value::Number(n) => n.as_f64(),
        _ => None,
    }
}

fn parse_millis(val: &Value) -> Option<DateTime<Utc>> {
    let ms = match val {
        Value::Number(n) => n.as_i64().or_else(|| {
            n.as_f64()
                .filter(|f| f.fract() == 0.0 && f.is_finite())
                .map(|f| f as i64)
        })?,
        Value::String(s) => s.trim().parse::<i64>().ok()?,
        _ => return None,
    };
    Utc.timestamp_millis_opt(ms).single()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const T0: i64 = 1_700_006_400_000;
    const HOUR: i64 = 3_600_000;

    fn kline(ts: i64, o: f64, h: f64, l: f64, c: f64, v: f64) -> Value {
        json!([
            ts,
            o.to_string(),
            h.to_string(),
            l.to_string(),
            c.to_string(),
            v.to_string(),
            ts + HOUR - 1,
            "0",
            10,
            "0",
            "0",
            "0"
        ])
    }

    fn good(i: i64) -> Value {
        let c = 100.0 + i as f64;
        kline(T0 + i * HOUR, c, c + 2.0, c - 2.0, c + 1.0, 10.0)
    }

    fn raw(rows: Vec<Value>) -> RawResponse {
        RawResponse {
            symbol: "BTCUSDT".into(),
            interval: Interval::H1,
            format: RawFormat::Klines,
            body: Value::Array(rows),
        }
    }

    fn timestamps(n: &Normalized) -> Vec<i64> {
        n.series.bars().iter().map(|b| b.timestamp.timestamp_millis()).collect()
    }

    #[test]
    fn one_bad_bar_in_a_hundred_is_dropped() {
        let mut rows: Vec<Value> = (0..100).map(good).collect();
        // high below close
        rows[42] = kline(T0 + 42 * HOUR, 100.0, 101.0, 99.0, 105.0, 1.0);

        let out = Normalizer::default().normalize(&raw(rows)).unwrap();
        assert_eq!(out.series.len(), 99);
        assert_eq!(out.report.invalid, 1);
        assert_eq!(out.report.received, 100);
        // Dropped bar leaves a gap, not an interpolated value.
        assert_eq!(out.report.gaps, 1);
    }

    #[test]
    fn too_many_bad_bars_is_malformed() {
        let mut rows: Vec<Value> = (0..100).map(good).collect();
        for i in 0..6 {
            rows[i] = kline(T0 + i as i64 * HOUR, 100.0, 90.0, 99.0, 105.0, 1.0);
        }
        let err = Normalizer::default().normalize(&raw(rows)).unwrap_err();
        assert!(matches!(err, Error::MalformedData(_)));
    }

    #[test]
    fn exactly_at_threshold_still_succeeds() {
        let mut rows: Vec<Value> = (0..100).map(good).collect();
        for i in 0..5 {
            rows[i] = kline(T0 + i as i64 * HOUR, 100.0, 101.0, 99.0, 100.0, -1.0);
        }
        let out = Normalizer::default().normalize(&raw(rows)).unwrap();
        assert_eq!(out.series.len(), 95);
        assert_eq!(out.report.invalid, 5);
    }

    #[test]
    fn unreadable_rows_count_as_invalid() {
        let mut rows: Vec<Value> = (0..50).map(good).collect();
        rows.push(json!(["not", "a", "kline"]));
        rows.push(json!([T0 + 60 * HOUR, "abc", "1", "1", "1", "1"]));
        let out = Normalizer::default().normalize(&raw(rows)).unwrap();
        assert_eq!(out.series.len(), 50);
        assert_eq!(out.report.invalid, 2);
    }

    #[test]
    fn duplicates_keep_first_occurrence() {
        let rows = vec![
            good(0),
            kline(T0 + HOUR, 200.0, 210.0, 190.0, 205.0, 1.0),
            kline(T0 + HOUR, 300.0, 310.0, 290.0, 305.0, 1.0),
            good(2),
        ];
        let out = Normalizer::default().normalize(&raw(rows)).unwrap();
        assert_eq!(out.series.len(), 3);
        assert_eq!(out.report.duplicates, 1);
        assert_eq!(out.series.bars()[1].close, 205.0);
    }

    #[test]
    fn out_of_order_rows_on_the_grid_are_sorted() {
        let rows = vec![good(3), good(0), good(2), good(1)];
        let out = Normalizer::default().normalize(&raw(rows)).unwrap();
        assert_eq!(
            timestamps(&out),
            vec![T0, T0 + HOUR, T0 + 2 * HOUR, T0 + 3 * HOUR]
        );
    }

    #[test]
    fn off_grid_timestamp_is_malformed() {
        let rows = vec![good(0), good(1), kline(T0 + 90 * 60_000, 1.0, 2.0, 0.5, 1.5, 1.0)];
        let err = Normalizer::default().normalize(&raw(rows)).unwrap_err();
        assert!(matches!(err, Error::MalformedData(msg) if msg.contains("off the 1h grid")));
    }

    #[test]
    fn gaps_are_preserved_and_counted() {
        let rows = vec![good(0), good(1), good(5), good(6)];
        let out = Normalizer::default().normalize(&raw(rows)).unwrap();
        assert_eq!(out.series.len(), 4);
        assert_eq!(out.report.gaps, 3);
    }

    #[test]
    fn empty_payload_is_malformed() {
        let err = Normalizer::default().normalize(&raw(vec![])).unwrap_err();
        assert!(matches!(err, Error::MalformedData(_)));
    }

    #[test]
    fn non_array_body_is_malformed() {
        let mut r = raw(vec![]);
        r.body = json!({"code": -1100, "msg": "bad"});
        assert!(matches!(
            Normalizer::default().normalize(&r),
            Err(Error::MalformedData(_))
        ));
    }

    #[test]
    fn market_chart_points_are_bucketed() {
        let min = 60_000;
        let body = json!({
            "prices": [
                [T0, 100.0],
                [T0 + 20 * min, 104.0],
                [T0 + 40 * min, 98.0],
                [T0 + 59 * min, 101.0],
                [T0 + HOUR, 110.0],
                [T0 + HOUR + 30 * min, 111.0],
                [T0 + HOUR + 30 * min, 999.0],
                [T0 + 2 * HOUR, 120.0]
            ],
            "market_caps": [],
            "total_volumes": [
                [T0, 1.0],
                [T0 + 20 * min, 2.0],
                [T0 + 40 * min, 3.0],
                [T0 + 59 * min, 4.0],
                [T0 + HOUR, 5.0],
                [T0 + HOUR + 30 * min, 6.0]
            ]
        });
        let r = RawResponse {
            symbol: "bitcoin".into(),
            interval: Interval::H1,
            format: RawFormat::MarketChart,
            body,
        };
        let out = Normalizer::default().normalize(&r).unwrap();
        let bars = out.series.bars();
        // The last price point has no volume and is dropped by the join.
        assert_eq!(bars.len(), 2);
        assert_eq!(out.report.duplicates, 1);

        let first = bars[0];
        assert_eq!(first.timestamp.timestamp_millis(), T0);
        assert_eq!((first.open, first.high, first.low, first.close), (100.0, 104.0, 98.0, 101.0));
        assert_eq!(first.volume, 4.0);

        let second = bars[1];
        assert_eq!((second.open, second.close, second.volume), (110.0, 111.0, 6.0));
    }

    #[test]
    fn market_chart_without_prices_is_malformed() {
        let r = RawResponse {
            symbol: "bitcoin".into(),
            interval: Interval::D1,
            format: RawFormat::MarketChart,
            body: json!({"error": "coin not found"}),
        };
        assert!(Normalizer::default().normalize(&r).is_err());
    }
}

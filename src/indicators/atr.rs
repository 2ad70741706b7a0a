// =============================================================================
// Average True Range (ATR)
// =============================================================================
//
// A bar's true range widens its high/low span to cover any gap from the
// previous close. ATR averages true ranges with Wilder's recurrence, seeded by
// the plain mean of the first `period` of them:
//
//   atr_t = atr_{t-1} + (tr_t - atr_{t-1}) / period
//
// The first bar has no previous close, so index `period` is the first defined
// output.
// =============================================================================

use crate::market_data::PriceBar;

fn true_range(prev: &PriceBar, bar: &PriceBar) -> f64 {
    let span = bar.high - bar.low;
    span.max((bar.high - prev.close).abs())
        .max((bar.low - prev.close).abs())
}

/// ATR aligned with `bars` (oldest first). A zero period or too few bars gives
/// all `None`; a non-finite value ends the series there.
pub fn atr(bars: &[PriceBar], period: usize) -> Vec<Option<f64>> {
    let mut out = vec![None; bars.len()];
    if period == 0 || bars.len() <= period {
        return out;
    }

    let n = period as f64;
    let mut value = 0.0;
    for (i, pair) in bars.windows(2).enumerate() {
        let bar = i + 1;
        let tr = true_range(&pair[0], &pair[1]);
        if bar < period {
            value += tr;
            continue;
        }
        value = if bar == period {
            (value + tr) / n
        } else {
            value + (tr - value) / n
        };
        if !value.is_finite() {
            break;
        }
        out[bar] = Some(value);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::market_data::bar::tests::bar_at;
    use crate::types::Interval;

    fn bar(i: i64, open: f64, high: f64, low: f64, close: f64) -> PriceBar {
        PriceBar {
            open,
            high,
            low,
            close,
            ..bar_at(i, Interval::H1, close)
        }
    }

    #[test]
    fn zero_period_is_undefined() {
        let bars: Vec<PriceBar> = (0..20).map(|i| bar(i, 100.0, 105.0, 95.0, 102.0)).collect();
        assert!(atr(&bars, 0).iter().all(Option::is_none));
    }

    #[test]
    fn first_value_is_mean_of_seed_ranges() {
        // Four bars give three true ranges: one per consecutive pair.
        let bars = vec![
            bar(0, 100.0, 102.0, 98.0, 101.0),
            bar(1, 101.0, 104.0, 99.0, 103.0),
            bar(2, 103.0, 106.0, 100.0, 105.0),
            bar(3, 105.0, 108.0, 102.0, 107.0),
        ];
        let out = atr(&bars, 3);
        assert_eq!(&out[..3], &[None, None, None]);
        // TRs: 5, 6, 6
        approx::assert_abs_diff_eq!(out[3].unwrap(), 17.0 / 3.0, epsilon = 1e-12);
    }

    #[test]
    fn steady_span_converges_to_span() {
        let bars: Vec<PriceBar> = (0..30)
            .map(|i| {
                let base = 100.0 + i as f64 * 0.1;
                bar(i, base, base + 5.0, base - 5.0, base)
            })
            .collect();
        let last = atr(&bars, 14)[29].unwrap();
        assert!((last - 10.0).abs() < 1.0, "expected ATR near 10.0, got {last}");
    }

    #[test]
    fn gap_from_previous_close_counts() {
        // Second bar opens far above the first close.
        let bars = vec![
            bar(0, 100.0, 105.0, 95.0, 95.0),
            bar(1, 110.0, 115.0, 108.0, 112.0),
            bar(2, 112.0, 118.0, 110.0, 115.0),
            bar(3, 115.0, 120.0, 113.0, 118.0),
        ];
        let value = atr(&bars, 3)[3].unwrap();
        assert!(value > 7.0, "ATR should reflect the gap, got {value}");
    }
}

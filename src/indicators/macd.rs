// =============================================================================
// Moving Average Convergence Divergence (MACD)
// =============================================================================
//
//   macd      = EMA(fast) - EMA(slow)
//   signal    = EMA(signal) of the macd line
//   histogram = macd - signal
//
// The macd line is defined from index slow - 1, the signal and histogram
// from index slow + signal - 2.
// =============================================================================

use super::ema::{ema, ema_of_defined};

#[derive(Debug, Clone, PartialEq)]
pub struct MacdLines {
    pub macd: Vec<Option<f64>>,
    pub signal: Vec<Option<f64>>,
    pub histogram: Vec<Option<f64>>,
}

/// Requires `fast < slow`; callers validate parameters first.
pub fn macd(closes: &[f64], fast: usize, slow: usize, signal: usize) -> MacdLines {
    let fast_ema = ema(closes, fast);
    let slow_ema = ema(closes, slow);

    let line: Vec<Option<f64>> = fast_ema
        .iter()
        .zip(&slow_ema)
        .map(|(f, s)| match (f, s) {
            (Some(f), Some(s)) => Some(f - s).filter(|v| v.is_finite()),
            _ => None,
        })
        .collect();

    let signal_line = ema_of_defined(&line, signal);
    let histogram = line
        .iter()
        .zip(&signal_line)
        .map(|(m, s)| Some((*m)? - (*s)?))
        .collect();

    MacdLines {
        macd: line,
        signal: signal_line,
        histogram,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    fn trending(n: usize) -> Vec<f64> {
        (0..n).map(|i| 100.0 + i as f64 * 0.5 + (i as f64 * 0.7).sin()).collect()
    }

    #[test]
    fn warmup_positions_match_parameters() {
        let out = macd(&trending(60), 12, 26, 9);
        assert_eq!(out.macd.iter().position(Option::is_some), Some(25));
        assert_eq!(out.signal.iter().position(Option::is_some), Some(33));
        assert_eq!(out.histogram.iter().position(Option::is_some), Some(33));
        assert!(out.macd[25..].iter().all(Option::is_some));
    }

    #[test]
    fn histogram_is_line_minus_signal() {
        let out = macd(&trending(60), 12, 26, 9);
        for i in 33..60 {
            let expected = out.macd[i].unwrap() - out.signal[i].unwrap();
            assert_abs_diff_eq!(out.histogram[i].unwrap(), expected);
        }
    }

    #[test]
    fn uptrend_has_positive_macd() {
        let closes: Vec<f64> = (0..60).map(|i| 100.0 + i as f64).collect();
        let out = macd(&closes, 12, 26, 9);
        assert!(out.macd[59].unwrap() > 0.0);
    }

    #[test]
    fn short_input_is_undefined() {
        let out = macd(&trending(20), 12, 26, 9);
        assert!(out.macd.iter().all(Option::is_none));
        assert!(out.signal.iter().all(Option::is_none));
    }
}

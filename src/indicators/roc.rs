// =============================================================================
// Rate of Change (ROC)
// =============================================================================
//
//   roc_t = 100 * (x_t - x_{t-period}) / x_{t-period}
//
// roc(1) is the per-bar return in percent. A zero reference close leaves the
// value undefined.

/// ROC aligned with `closes`; the first `period` entries are `None`.
pub fn roc(closes: &[f64], period: usize) -> Vec<Option<f64>> {
    let mut out = vec![None; closes.len()];
    if period == 0 {
        return out;
    }
    for (i, w) in closes.windows(period + 1).enumerate() {
        let (base, last) = (w[0], w[period]);
        if base == 0.0 {
            continue;
        }
        let pct = 100.0 * (last - base) / base;
        out[i + period] = pct.is_finite().then_some(pct);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    #[test]
    fn change_over_fourteen_bars() {
        let closes: Vec<f64> = (1..=20).map(|x| x as f64).collect();
        let out = roc(&closes, 14);
        assert!(out[..14].iter().all(Option::is_none));
        // 1 -> 15 is +1400%.
        assert_abs_diff_eq!(out[14].unwrap(), 1400.0, epsilon = 1e-10);
    }

    #[test]
    fn period_one_is_per_bar_return() {
        let out = roc(&[100.0, 110.0, 99.0], 1);
        assert_eq!(out[0], None);
        assert_abs_diff_eq!(out[1].unwrap(), 10.0, epsilon = 1e-10);
        assert_abs_diff_eq!(out[2].unwrap(), -10.0, epsilon = 1e-10);
    }

    #[test]
    fn short_input_is_undefined() {
        assert!(roc(&[1.0, 2.0, 3.0], 14).iter().all(Option::is_none));
    }
}

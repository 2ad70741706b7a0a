// =============================================================================
// Simple Moving Average (SMA)
// =============================================================================
//
//   SMA_t = (x_{t-w+1} + ... + x_t) / w
//
// Each window is summed on its own rather than with a running total, so the
// value at index t depends only on the w inputs ending at t.
// =============================================================================

/// SMA aligned with `values`: the first `window - 1` entries are `None`.
pub fn sma(values: &[f64], window: usize) -> Vec<Option<f64>> {
    let mut out = vec![None; values.len()];
    if window == 0 {
        return out;
    }
    for (i, w) in values.windows(window).enumerate() {
        let mean = w.iter().sum::<f64>() / window as f64;
        out[i + window - 1] = mean.is_finite().then_some(mean);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    #[test]
    fn sma_three_over_reference_closes() {
        let closes = [10.0, 11.0, 12.0, 11.0, 13.0, 14.0, 13.0, 15.0, 16.0, 17.0];
        let out = sma(&closes, 3);
        let expected = [
            None,
            None,
            Some(11.0),
            Some(11.33),
            Some(12.0),
            Some(12.67),
            Some(13.33),
            Some(14.0),
            Some(14.67),
            Some(16.0),
        ];
        assert_eq!(out.len(), expected.len());
        for (got, want) in out.iter().zip(expected) {
            match (got, want) {
                (None, None) => {}
                (Some(g), Some(w)) => assert_abs_diff_eq!(*g, w, epsilon = 0.005),
                _ => panic!("definedness mismatch: {got:?} vs {want:?}"),
            }
        }
    }

    #[test]
    fn window_longer_than_input_is_all_undefined() {
        assert_eq!(sma(&[1.0, 2.0], 5), vec![None, None]);
    }

    #[test]
    fn window_of_one_is_identity() {
        assert_eq!(sma(&[3.0, 4.0], 1), vec![Some(3.0), Some(4.0)]);
    }
}

// =============================================================================
// Exponential Moving Average (EMA)
// =============================================================================
//
// EMA gives more weight to recent prices, making it more responsive to new
// information than the Simple Moving Average (SMA).
//
// Formula:
//   multiplier = 2 / (period + 1)
//   EMA_t      = close_t * multiplier + EMA_{t-1} * (1 - multiplier)
//
// The very first EMA value is seeded with the SMA of the first `period` values,
// so the first defined output sits at index `period - 1`.
// =============================================================================

/// Compute the EMA aligned with `values`.
///
/// # Edge cases
/// - `period == 0` or `values.len() < period` => all `None`
/// - A non-finite intermediate value ends the series; later entries stay
///   `None` because downstream consumers should not trust a broken average.
pub fn ema(values: &[f64], period: usize) -> Vec<Option<f64>> {
    let mut out = vec![None; values.len()];
    if period == 0 || values.len() < period {
        return out;
    }

    let multiplier = 2.0 / (period + 1) as f64;

    // Seed: SMA of the first `period` values.
    let seed: f64 = values[..period].iter().sum::<f64>() / period as f64;
    if !seed.is_finite() {
        return out;
    }
    out[period - 1] = Some(seed);

    let mut prev = seed;
    for (i, &x) in values.iter().enumerate().skip(period) {
        let next = x * multiplier + prev * (1.0 - multiplier);
        if !next.is_finite() {
            break;
        }
        out[i] = Some(next);
        prev = next;
    }
    out
}

/// EMA over a series that is undefined for a leading warm-up and defined
/// afterwards (e.g. the MACD line). The output keeps the input's alignment.
pub fn ema_of_defined(values: &[Option<f64>], period: usize) -> Vec<Option<f64>> {
    let Some(start) = values.iter().position(Option::is_some) else {
        return vec![None; values.len()];
    };
    let defined: Vec<f64> = values[start..]
        .iter()
        .map_while(|v| *v)
        .collect();

    let mut out = vec![None; start];
    out.extend(ema(&defined, period));
    out.resize(values.len(), None);
    out
}

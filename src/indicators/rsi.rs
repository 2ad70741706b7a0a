// =============================================================================
// Relative Strength Index (RSI)
// =============================================================================
//
// Up and down moves between consecutive closes are averaged separately. The
// first `period` moves seed both averages with a plain mean; after that each
// average follows Wilder's recurrence
//
//   avg_t = avg_{t-1} + (move_t - avg_{t-1}) / period
//
// and the oscillator is 100 * up / (up + down). A window with no movement at
// all reads 50.
//
// `period` moves need `period + 1` closes, so index `period` is the first
// defined output.
// =============================================================================

/// RSI aligned with `closes`. A zero period or too few closes gives all
/// `None`; a non-finite value ends the series there.
pub fn rsi(closes: &[f64], period: usize) -> Vec<Option<f64>> {
    let mut out = vec![None; closes.len()];
    if period == 0 || closes.len() <= period {
        return out;
    }

    let n = period as f64;
    let moves = closes.windows(2).map(|pair| {
        let change = pair[1] - pair[0];
        (change.max(0.0), (-change).max(0.0))
    });

    let mut up = 0.0;
    let mut down = 0.0;
    for (i, (gain, loss)) in moves.enumerate() {
        let bar = i + 1;
        if bar < period {
            up += gain;
            down += loss;
            continue;
        }
        if bar == period {
            up = (up + gain) / n;
            down = (down + loss) / n;
        } else {
            up += (gain - up) / n;
            down += (loss - down) / n;
        }
        match oscillator(up, down) {
            Some(v) => out[bar] = Some(v),
            None => break,
        }
    }
    out
}

fn oscillator(up: f64, down: f64) -> Option<f64> {
    let total = up + down;
    let value = if total == 0.0 { 50.0 } else { 100.0 * up / total };
    value.is_finite().then_some(value)
}

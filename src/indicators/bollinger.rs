// =============================================================================
// Bollinger Bands
// =============================================================================
//
// Bollinger Bands consist of a middle band (SMA), an upper band (SMA + k*σ),
// and a lower band (SMA - k*σ). σ is the population standard deviation of
// the window.

/// One band triple per input value; the first `window - 1` are `None`.
#[derive(Debug, Clone, PartialEq)]
pub struct BollingerBands {
    pub upper: Vec<Option<f64>>,
    pub middle: Vec<Option<f64>>,
    pub lower: Vec<Option<f64>>,
}

#[derive(Debug, Clone, Copy)]
struct Band {
    upper: f64,
    middle: f64,
    lower: f64,
}

pub fn bollinger(closes: &[f64], window: usize, num_std: f64) -> BollingerBands {
    let n = closes.len();
    let mut bands = BollingerBands {
        upper: vec![None; n],
        middle: vec![None; n],
        lower: vec![None; n],
    };
    if window == 0 {
        return bands;
    }

    for (i, w) in closes.windows(window).enumerate() {
        if let Some(band) = band(w, num_std) {
            let at = i + window - 1;
            bands.upper[at] = Some(band.upper);
            bands.middle[at] = Some(band.middle);
            bands.lower[at] = Some(band.lower);
        }
    }
    bands
}

fn band(window: &[f64], num_std: f64) -> Option<Band> {
    let period = window.len() as f64;
    let middle = window.iter().sum::<f64>() / period;
    let variance = window.iter().map(|x| (x - middle).powi(2)).sum::<f64>() / period;
    let std_dev = variance.sqrt();

    let band = Band {
        upper: middle + num_std * std_dev,
        middle,
        lower: middle - num_std * std_dev,
    };
    [band.upper, band.middle, band.lower]
        .iter()
        .all(|v| v.is_finite())
        .then_some(band)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    #[test]
    fn bollinger_basic() {
        let closes: Vec<f64> = (1..=20).map(|x| x as f64).collect();
        let bb = bollinger(&closes, 20, 2.0);
        let (u, m, l) = (bb.upper[19].unwrap(), bb.middle[19].unwrap(), bb.lower[19].unwrap());
        assert!(u > m && l < m);
        assert_abs_diff_eq!(m, 10.5);
        assert_abs_diff_eq!(u - m, m - l, epsilon = 1e-12);
    }

    #[test]
    fn bollinger_warmup() {
        let closes: Vec<f64> = (1..=25).map(|x| x as f64).collect();
        let bb = bollinger(&closes, 20, 2.0);
        assert!(bb.middle[..19].iter().all(Option::is_none));
        assert!(bb.middle[19..].iter().all(Option::is_some));
    }

    #[test]
    fn bollinger_flat() {
        let bb = bollinger(&[100.0; 20], 20, 2.0);
        assert_abs_diff_eq!(bb.upper[19].unwrap(), bb.lower[19].unwrap(), epsilon = 1e-10);
    }
}

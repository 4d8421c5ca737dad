// =============================================================================
// Two-Pole Oscillator (TPO)
// =============================================================================
//
// Pure-function pipeline: price normalization -> two-pole EMA smoothing ->
// lagged reference -> crossover detection, with an optional high-probability
// "extreme zone" flag when the smoothed value is at or beyond +-0.5.
//
// This is the Ehlers-style two-pole filter applied to a price series
// normalized into [-1, 1] over a rolling high/low window.

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum TpoCross {
    Buy,
    Sell,
    None,
}

#[derive(Debug, Clone, Copy)]
pub struct TpoResult {
    pub smoothed: f64,
    pub lagged: f64,
    pub cross: TpoCross,
    pub extreme_zone: bool,
}

/// Normalize closes into [-1, 1] using the rolling high/low range over
/// `period`. Returns one value per input index once `period` bars of
/// history exist; earlier indices are omitted.
fn normalize(closes: &[f64], period: usize) -> Vec<f64> {
    if period == 0 || closes.len() < period {
        return Vec::new();
    }
    let mut out = Vec::with_capacity(closes.len() - period + 1);
    for end in period..=closes.len() {
        let window = &closes[end - period..end];
        let hi = window.iter().cloned().fold(f64::MIN, f64::max);
        let lo = window.iter().cloned().fold(f64::MAX, f64::min);
        let range = hi - lo;
        let value = if range > 0.0 {
            ((closes[end - 1] - lo) / range) * 2.0 - 1.0
        } else {
            0.0
        };
        out.push(value.clamp(-1.0, 1.0));
    }
    out
}

/// Apply the two-pole EMA smoothing filter to a normalized series.
fn two_pole_filter(normalized: &[f64], smoothing_period: usize) -> Vec<f64> {
    if normalized.len() < 2 || smoothing_period == 0 {
        return normalized.to_vec();
    }
    let alpha = 2.0 / (smoothing_period as f64 + 1.0);
    let c1 = alpha * alpha;
    let c2 = 2.0 * (1.0 - alpha);
    let c3 = -(1.0 - alpha) * (1.0 - alpha);

    let mut filt = Vec::with_capacity(normalized.len());
    filt.push(normalized[0]);
    filt.push(normalized[1]);
    for i in 2..normalized.len() {
        let value = c1 * normalized[i] + c2 * filt[i - 1] + c3 * filt[i - 2];
        filt.push(if value.is_finite() { value } else { filt[i - 1] });
    }
    filt
}

/// Run the full TPO pipeline and return the latest reading.
///
/// `period` controls the normalization lookback window (e.g. 20); `lag`
/// controls how many bars back the reference line is taken from (e.g. 3).
pub fn calculate_tpo(closes: &[f64], period: usize, lag: usize) -> Option<TpoResult> {
    let normalized = normalize(closes, period);
    if normalized.len() <= lag + 1 {
        return None;
    }
    let filt = two_pole_filter(&normalized, period);

    let last = *filt.last()?;
    let prev = filt[filt.len() - 2];
    let lagged_last = filt[filt.len() - 1 - lag];
    let lagged_prev = filt[filt.len() - 2 - lag];

    let cross = if prev <= lagged_prev && last > lagged_last {
        TpoCross::Buy
    } else if prev >= lagged_prev && last < lagged_last {
        TpoCross::Sell
    } else {
        TpoCross::None
    };

    Some(TpoResult {
        smoothed: last,
        lagged: lagged_last,
        cross,
        extreme_zone: last.abs() >= 0.5,
    })
}

/// Vote strength in [0, 1] for a TPO reading: distance between smoothed and
/// lagged series, amplified when in the extreme zone.
pub fn tpo_vote_strength(result: &TpoResult) -> f64 {
    let base = (result.smoothed - result.lagged).abs().min(1.0);
    let amplified = if result.extreme_zone {
        (base * 1.5).min(1.0)
    } else {
        base
    };
    amplified.clamp(0.0, 1.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insufficient_data_returns_none() {
        let closes = vec![1.0, 2.0, 3.0];
        assert!(calculate_tpo(&closes, 20, 3).is_none());
    }

    #[test]
    fn rising_series_produces_finite_values() {
        let closes: Vec<f64> = (1..=100).map(|x| x as f64).collect();
        let result = calculate_tpo(&closes, 20, 3).unwrap();
        assert!(result.smoothed.is_finite());
        assert!(result.lagged.is_finite());
    }

    #[test]
    fn flat_series_has_zero_smoothed_value() {
        let closes = vec![100.0; 100];
        let result = calculate_tpo(&closes, 20, 3).unwrap();
        assert!((result.smoothed).abs() < 1e-9);
        assert!(!result.extreme_zone);
    }

    #[test]
    fn vote_strength_is_clamped() {
        let result = TpoResult {
            smoothed: 0.9,
            lagged: -0.9,
            cross: TpoCross::Buy,
            extreme_zone: true,
        };
        assert!(tpo_vote_strength(&result) <= 1.0);
    }
}

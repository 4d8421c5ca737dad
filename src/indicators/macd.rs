// =============================================================================
// MACD — Moving Average Convergence/Divergence
// =============================================================================
//
// line      = EMA(12) - EMA(26)
// signal    = EMA(9) of the line series
// histogram = line - signal
//
// The signal line is a true 9-period EMA of the MACD line, not a one-bar
// approximation (see the open-question decision in SPEC_FULL.md).

use super::ema::calculate_ema;

#[derive(Debug, Clone, Copy)]
pub struct MacdResult {
    pub line: f64,
    pub signal: f64,
    pub histogram: f64,
}

pub fn calculate_macd(closes: &[f64]) -> Option<MacdResult> {
    calculate_macd_with_periods(closes, 12, 26, 9)
}

pub fn calculate_macd_with_periods(
    closes: &[f64],
    fast: usize,
    slow: usize,
    signal_period: usize,
) -> Option<MacdResult> {
    if fast == 0 || slow == 0 || signal_period == 0 || fast >= slow {
        return None;
    }
    let ema_fast = calculate_ema(closes, fast);
    let ema_slow = calculate_ema(closes, slow);
    if ema_fast.is_empty() || ema_slow.is_empty() {
        return None;
    }

    // ema_fast starts at index `fast - 1`, ema_slow at index `slow - 1`, so
    // align both series to the slow series' start before subtracting.
    let offset = ema_fast.len() - ema_slow.len();
    let macd_line: Vec<f64> = ema_slow
        .iter()
        .enumerate()
        .map(|(i, slow_v)| ema_fast[i + offset] - slow_v)
        .collect();

    if macd_line.len() < signal_period {
        return None;
    }
    let signal_series = calculate_ema(&macd_line, signal_period);
    let signal = *signal_series.last()?;
    let line = *macd_line.last()?;
    let histogram = line - signal;

    if !line.is_finite() || !signal.is_finite() || !histogram.is_finite() {
        return None;
    }

    Some(MacdResult {
        line,
        signal,
        histogram,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn macd_insufficient_data() {
        let closes: Vec<f64> = (1..=20).map(|x| x as f64).collect();
        assert!(calculate_macd(&closes).is_none());
    }

    #[test]
    fn macd_uptrend_is_bullish() {
        let closes: Vec<f64> = (1..=100).map(|x| x as f64).collect();
        let result = calculate_macd(&closes).unwrap();
        assert!(result.line > 0.0);
        assert!(result.line.is_finite());
        assert!(result.signal.is_finite());
    }

    #[test]
    fn macd_flat_series_is_zero() {
        let closes = vec![50.0; 100];
        let result = calculate_macd(&closes).unwrap();
        assert!(result.line.abs() < 1e-9);
        assert!(result.histogram.abs() < 1e-9);
    }

    #[test]
    fn macd_rejects_bad_periods() {
        let closes: Vec<f64> = (1..=100).map(|x| x as f64).collect();
        assert!(calculate_macd_with_periods(&closes, 26, 12, 9).is_none());
        assert!(calculate_macd_with_periods(&closes, 0, 26, 9).is_none());
    }
}

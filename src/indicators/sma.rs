// =============================================================================
// Simple Moving Average (SMA)
// =============================================================================

/// Compute the SMA over the trailing `period` closes.
///
/// Returns `None` when `period == 0` or there is insufficient history.
pub fn calculate_sma(closes: &[f64], period: usize) -> Option<f64> {
    if period == 0 || closes.len() < period {
        return None;
    }
    let window = &closes[closes.len() - period..];
    let sum: f64 = window.iter().sum();
    let sma = sum / period as f64;
    if sma.is_finite() {
        Some(sma)
    } else {
        None
    }
}

/// Full SMA series, one value per window ending at each index `>= period - 1`.
pub fn sma_series(closes: &[f64], period: usize) -> Vec<f64> {
    if period == 0 || closes.len() < period {
        return Vec::new();
    }
    (period..=closes.len())
        .filter_map(|end| calculate_sma(&closes[..end], period))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sma_basic() {
        let closes = vec![1.0, 2.0, 3.0, 4.0, 5.0];
        assert_eq!(calculate_sma(&closes, 5), Some(3.0));
    }

    #[test]
    fn sma_insufficient_data() {
        assert_eq!(calculate_sma(&[1.0, 2.0], 5), None);
    }

    #[test]
    fn sma_period_zero() {
        assert_eq!(calculate_sma(&[1.0, 2.0, 3.0], 0), None);
    }

    #[test]
    fn sma_series_length() {
        let closes: Vec<f64> = (1..=10).map(|x| x as f64).collect();
        let series = sma_series(&closes, 3);
        assert_eq!(series.len(), 8);
        assert!((series[0] - 2.0).abs() < 1e-10);
    }
}

// =============================================================================
// Technical Indicators Module
// =============================================================================
//
// Pure, side-effect-free implementations of the core technical indicators used
// by the trading engine.  Every public function returns `Option<T>` so callers
// are forced to handle insufficient-data and numerical-edge-case scenarios.

pub mod ema;
pub mod rsi;
pub mod adx;
pub mod bollinger;
pub mod atr;
pub mod roc;
pub mod sma;
pub mod macd;
pub mod tpo;

use crate::candle::Candle;
use serde::{Deserialize, Serialize};

/// Directional trend classification emitted alongside a snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum Trend {
    Bullish,
    Bearish,
    Neutral,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct MacdSnapshot {
    pub line: f64,
    pub histogram: f64,
    pub bullish: bool,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct BollingerSnapshot {
    pub upper: f64,
    pub mid: f64,
    pub lower: f64,
    pub bandwidth: f64,
}

/// Per-timeframe value bundle. Any field is `None` when the series has not
/// yet reached the timeframe's minimum indicator length.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IndicatorSnapshot {
    pub rsi: Option<f64>,
    pub sma_fast: Option<f64>,
    pub sma_slow: Option<f64>,
    pub ema: Option<f64>,
    pub macd: Option<MacdSnapshot>,
    pub atr: Option<f64>,
    pub bollinger: Option<BollingerSnapshot>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trend: Option<Trend>,
    pub trend_strength: Option<f64>,
    pub volume_ratio: Option<f64>,
}

/// Compute a full snapshot from a candle series. Returns a snapshot with all
/// fields `None` if `candles.len() < min_length`.
pub fn compute_snapshot(candles: &[Candle], min_length: usize) -> IndicatorSnapshot {
    if candles.len() < min_length {
        return IndicatorSnapshot::default();
    }
    let closes: Vec<f64> = candles.iter().map(|c| c.close).collect();

    let rsi = current_rsi_value(&closes, 14);
    let sma_fast = sma::calculate_sma(&closes, 20);
    let sma_slow = sma::calculate_sma(&closes, 50);
    let ema = ema::calculate_ema(&closes, 21).last().copied();
    let macd = macd::calculate_macd(&closes).map(|m| MacdSnapshot {
        line: m.line,
        histogram: m.histogram,
        bullish: m.histogram > 0.0,
    });
    let atr = atr::calculate_atr(candles, 14);
    let bollinger = bollinger::calculate_bollinger(&closes, 20, 2.0).map(|b| BollingerSnapshot {
        upper: b.upper,
        mid: b.middle,
        lower: b.lower,
        bandwidth: b.width,
    });

    let ema9_21 = ema::ema_trend_aligned(&closes);
    let (trend, trend_strength) = match ema9_21 {
        Some((bullish, strength)) => (
            Some(if bullish { Trend::Bullish } else { Trend::Bearish }),
            Some(strength.clamp(0.0, 1.0)),
        ),
        None => (Some(Trend::Neutral), Some(0.0)),
    };

    let volume_ratio = volume_ratio(candles, 20);

    IndicatorSnapshot {
        rsi,
        sma_fast,
        sma_slow,
        ema,
        macd,
        atr,
        bollinger,
        trend,
        trend_strength,
        volume_ratio,
    }
}

fn current_rsi_value(closes: &[f64], period: usize) -> Option<f64> {
    rsi::current_rsi(closes, period).map(|(value, _)| value)
}

/// Current volume divided by the trailing N-period average volume.
pub fn volume_ratio(candles: &[Candle], period: usize) -> Option<f64> {
    if candles.len() < period + 1 || period == 0 {
        return None;
    }
    let last = candles.last()?.volume;
    let window = &candles[candles.len() - 1 - period..candles.len() - 1];
    let avg = window.iter().map(|c| c.volume).sum::<f64>() / period as f64;
    if avg <= 0.0 || !avg.is_finite() {
        return None;
    }
    Some(last / avg)
}

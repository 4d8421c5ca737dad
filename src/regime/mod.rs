// =============================================================================
// Market Regime Detector
// =============================================================================
//
// Classifies the current market condition from a small set of derived
// metrics (volatility, trend strength/direction, volume ratio, price
// position, momentum) and exposes regime-keyed risk parameters. Structural
// shape (Arc-wrapped cache, RwLock<Option<state>>, confidence-gated commit)
// follows the grounding implementation's regime detector; the taxonomy and
// classification cascade are specific to this system.

use std::sync::Arc;
use std::time::Instant;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::candle::Candle;
use crate::indicators;
use crate::vote::{Direction, Vote, Voter};

/// Market condition label. Initial value is always `Ranging`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Regime {
    TrendingUp,
    TrendingDown,
    Ranging,
    Volatile,
    Quiet,
    Breakout,
    Breakdown,
}

impl std::fmt::Display for Regime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Regime::TrendingUp => "trending_up",
            Regime::TrendingDown => "trending_down",
            Regime::Ranging => "ranging",
            Regime::Volatile => "volatile",
            Regime::Quiet => "quiet",
            Regime::Breakout => "breakout",
            Regime::Breakdown => "breakdown",
        };
        write!(f, "{s}")
    }
}

/// Derived metrics feeding the classification cascade.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct RegimeMetrics {
    pub volatility: f64,
    pub trend_strength: f64,
    pub trend_direction: f64,
    pub volume_ratio: f64,
    pub price_position: f64,
    pub momentum: f64,
}

/// Public regime state snapshot, owned exclusively by [`RegimeDetector`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegimeState {
    pub current: Regime,
    pub previous: Regime,
    pub strength: f64,
    pub metrics: RegimeMetrics,
    pub last_update_millis: i64,
}

/// Per-regime constants. Immutable table, indexed by [`Regime`].
#[derive(Debug, Clone, Copy)]
pub struct IndicatorWeights {
    pub trend: f64,
    pub momentum: f64,
    pub volume: f64,
    pub volatility: f64,
}

#[derive(Debug, Clone, Copy)]
pub struct RegimeParameters {
    pub risk_multiplier: f64,
    pub confidence_threshold: f64,
    pub stop_loss_multiplier: f64,
    pub take_profit_multiplier: f64,
    pub indicator_weights: IndicatorWeights,
}

/// Configurable thresholds for classification. Every constant the source
/// treated as "declared configurable but used as a literal" lives here
/// (decision recorded in SPEC_FULL.md open question 4).
#[derive(Debug, Clone, Copy)]
pub struct RegimeConfig {
    /// `trendStrength` above this commits trending_up/trending_down. Default 0.7.
    pub strong_trend_threshold: f64,
    /// `volumeRatio` multiple that counts as "high volume" for breakout. Default 1.5.
    pub high_volume_multiple: f64,
    /// volatility above this commits `volatile`. Default 3.0 (ATR% of price).
    pub volatility_high: f64,
    /// volatility below this commits `quiet`. Default 0.5.
    pub volatility_low: f64,
    /// minimum confidence required to change `current`. Default 0.7.
    pub commit_threshold: f64,
    /// evaluate every N ingested candles. Default 1 (every candle).
    pub update_every_n_candles: u32,
}

impl Default for RegimeConfig {
    fn default() -> Self {
        Self {
            strong_trend_threshold: 0.7,
            high_volume_multiple: 1.5,
            volatility_high: 3.0,
            volatility_low: 0.5,
            commit_threshold: 0.7,
            update_every_n_candles: 1,
        }
    }
}

fn parameters_for(regime: Regime) -> RegimeParameters {
    match regime {
        Regime::TrendingUp => RegimeParameters {
            risk_multiplier: 1.2,
            confidence_threshold: 0.25,
            stop_loss_multiplier: 1.5,
            take_profit_multiplier: 3.0,
            indicator_weights: IndicatorWeights {
                trend: 0.4,
                momentum: 0.3,
                volume: 0.15,
                volatility: 0.15,
            },
        },
        Regime::TrendingDown => RegimeParameters {
            risk_multiplier: 1.0,
            confidence_threshold: 0.3,
            stop_loss_multiplier: 1.5,
            take_profit_multiplier: 2.5,
            indicator_weights: IndicatorWeights {
                trend: 0.4,
                momentum: 0.3,
                volume: 0.15,
                volatility: 0.15,
            },
        },
        Regime::Ranging => RegimeParameters {
            risk_multiplier: 0.7,
            confidence_threshold: 0.4,
            stop_loss_multiplier: 1.2,
            take_profit_multiplier: 1.8,
            indicator_weights: IndicatorWeights {
                trend: 0.15,
                momentum: 0.2,
                volume: 0.25,
                volatility: 0.4,
            },
        },
        Regime::Volatile => RegimeParameters {
            risk_multiplier: 0.5,
            confidence_threshold: 0.5,
            stop_loss_multiplier: 2.0,
            take_profit_multiplier: 2.0,
            indicator_weights: IndicatorWeights {
                trend: 0.2,
                momentum: 0.2,
                volume: 0.2,
                volatility: 0.4,
            },
        },
        Regime::Quiet => RegimeParameters {
            risk_multiplier: 0.6,
            confidence_threshold: 0.45,
            stop_loss_multiplier: 1.0,
            take_profit_multiplier: 1.5,
            indicator_weights: IndicatorWeights {
                trend: 0.2,
                momentum: 0.15,
                volume: 0.25,
                volatility: 0.4,
            },
        },
        Regime::Breakout => RegimeParameters {
            risk_multiplier: 1.3,
            confidence_threshold: 0.3,
            stop_loss_multiplier: 1.8,
            take_profit_multiplier: 3.5,
            indicator_weights: IndicatorWeights {
                trend: 0.3,
                momentum: 0.35,
                volume: 0.25,
                volatility: 0.1,
            },
        },
        Regime::Breakdown => RegimeParameters {
            risk_multiplier: 1.1,
            confidence_threshold: 0.3,
            stop_loss_multiplier: 1.8,
            take_profit_multiplier: 3.0,
            indicator_weights: IndicatorWeights {
                trend: 0.3,
                momentum: 0.35,
                volume: 0.25,
                volatility: 0.1,
            },
        },
    }
}

/// Decision cascade over the derived regime metrics. Returns the winning regime and
/// its confidence, both derived purely from `metrics` and `config`.
pub fn classify(metrics: RegimeMetrics, config: &RegimeConfig) -> (Regime, f64) {
    if metrics.price_position > 0.9
        && metrics.volume_ratio > config.high_volume_multiple
        && metrics.momentum > 0.02
    {
        return (Regime::Breakout, confidence_for(Regime::Breakout, metrics));
    }
    if metrics.price_position < 0.1
        && metrics.volume_ratio > config.high_volume_multiple
        && metrics.momentum < -0.02
    {
        return (Regime::Breakdown, confidence_for(Regime::Breakdown, metrics));
    }
    if metrics.volatility > config.volatility_high {
        return (Regime::Volatile, confidence_for(Regime::Volatile, metrics));
    }
    if metrics.volatility < config.volatility_low {
        return (Regime::Quiet, confidence_for(Regime::Quiet, metrics));
    }
    if metrics.trend_strength > config.strong_trend_threshold {
        let regime = if metrics.trend_direction >= 0.0 {
            Regime::TrendingUp
        } else {
            Regime::TrendingDown
        };
        return (regime, confidence_for(regime, metrics));
    }
    (Regime::Ranging, confidence_for(Regime::Ranging, metrics))
}

/// Regime-specific confidence formula, bounded to `[0, 1]`.
pub fn confidence_for(regime: Regime, metrics: RegimeMetrics) -> f64 {
    let raw = match regime {
        Regime::TrendingUp => metrics.trend_strength * metrics.trend_direction.max(0.0),
        Regime::TrendingDown => metrics.trend_strength * (-metrics.trend_direction).max(0.0),
        Regime::Ranging => 0.3 + (1.0 - metrics.trend_strength) * 0.2,
        Regime::Volatile => (metrics.volatility / (metrics.volatility + 3.0)).min(1.0),
        Regime::Quiet => (1.0 - metrics.volatility / 3.0).clamp(0.0, 1.0),
        Regime::Breakout => metrics.price_position * metrics.momentum.max(0.0).min(1.0) + 0.3,
        Regime::Breakdown => {
            metrics.price_position * (-metrics.momentum).max(0.0).min(1.0) + 0.3
        }
    };
    raw.clamp(0.0, 1.0)
}

/// Compute [`RegimeMetrics`] from a candle series and an optional externally
/// supplied ADX reading (the detector computes its own trend score from
/// MA20/MA50 ordering when no hint is available).
pub fn analyze(candles: &[Candle], adx_hint: Option<f64>) -> RegimeMetrics {
    let closes: Vec<f64> = candles.iter().map(|c| c.close).collect();
    let last_price = closes.last().copied().unwrap_or(0.0);

    let atr = indicators::atr::calculate_atr(candles, 14).unwrap_or(0.0);
    let volatility = if last_price > 0.0 {
        (atr / last_price) * 100.0
    } else {
        0.0
    };

    let ma20 = indicators::sma::calculate_sma(&closes, 20);
    let ma50 = indicators::sma::calculate_sma(&closes, 50);
    let ma_trend_score = match (ma20, ma50) {
        (Some(fast), Some(slow)) if slow != 0.0 => ((fast - slow) / slow).clamp(-1.0, 1.0),
        _ => 0.0,
    };
    let adx_component = adx_hint.unwrap_or(0.0) / 100.0;
    let trend_strength = (ma_trend_score.abs() * 0.5 + adx_component * 0.5).clamp(0.0, 1.0);
    let trend_direction = if ma_trend_score >= 0.0 { 1.0 } else { -1.0 };

    let volume_ratio = indicators::volume_ratio(candles, 20).unwrap_or(1.0);

    let window = candles.iter().rev().take(50).collect::<Vec<_>>();
    let price_position = if window.len() >= 2 {
        let hi = window.iter().map(|c| c.high).fold(f64::MIN, f64::max);
        let lo = window.iter().map(|c| c.low).fold(f64::MAX, f64::min);
        if hi > lo {
            ((last_price - lo) / (hi - lo)).clamp(0.0, 1.0)
        } else {
            0.5
        }
    } else {
        0.5
    };

    let momentum = if closes.len() > 10 {
        let past = closes[closes.len() - 10];
        if past != 0.0 {
            (last_price - past) / past
        } else {
            0.0
        }
    } else {
        0.0
    };

    RegimeMetrics {
        volatility,
        trend_strength,
        trend_direction,
        volume_ratio,
        price_position,
        momentum,
    }
}

/// Owns the current/previous regime and commits changes only when gated by
/// confidence. Cheap to clone-and-share via `Arc`; internal mutability is a
/// single `RwLock`.
pub struct RegimeDetector {
    config: RegimeConfig,
    state: RwLock<RegimeState>,
    last_change: RwLock<Instant>,
    candles_since_update: RwLock<u32>,
}

impl RegimeDetector {
    pub fn new(config: RegimeConfig) -> Arc<Self> {
        Arc::new(Self {
            config,
            state: RwLock::new(RegimeState {
                current: Regime::Ranging,
                previous: Regime::Ranging,
                strength: 0.0,
                metrics: RegimeMetrics::default(),
                last_update_millis: 0,
            }),
            last_change: RwLock::new(Instant::now()),
            candles_since_update: RwLock::new(0),
        })
    }

    /// Run one analysis/classify/commit cycle, gated by the update-frequency
    /// counter. Returns `None` when this tick was skipped.
    pub fn update(&self, candles: &[Candle], adx_hint: Option<f64>, now_millis: i64) -> Option<RegimeState> {
        {
            let mut counter = self.candles_since_update.write();
            *counter += 1;
            if *counter < self.config.update_every_n_candles {
                return None;
            }
            *counter = 0;
        }
        let metrics = analyze(candles, adx_hint);
        let (candidate, confidence) = classify(metrics, &self.config);
        self.commit(candidate, confidence, metrics, now_millis);
        Some(self.state.read().clone())
    }

    pub fn commit(&self, new_regime: Regime, confidence: f64, metrics: RegimeMetrics, now_millis: i64) {
        let mut state = self.state.write();
        let changed = new_regime != state.current;
        if confidence > self.config.commit_threshold || new_regime == state.current {
            if changed {
                state.previous = state.current;
                *self.last_change.write() = Instant::now();
                info!(from = %state.previous, to = %new_regime, confidence, "regime committed");
            }
            state.current = new_regime;
            state.strength = confidence;
            state.metrics = metrics;
            state.last_update_millis = now_millis;
        } else {
            debug!(candidate = %new_regime, confidence, "regime change rejected: below commit threshold");
        }
    }

    pub fn current(&self) -> RegimeState {
        self.state.read().clone()
    }

    pub fn get_parameters(&self, regime: Option<Regime>) -> RegimeParameters {
        parameters_for(regime.unwrap_or_else(|| self.state.read().current))
    }
}

impl Voter for RegimeDetector {
    fn name(&self) -> &str {
        "REGIME"
    }

    fn get_votes(&self) -> Vec<Vote> {
        let state = self.state.read();
        let direction = match state.current {
            Regime::TrendingUp | Regime::Breakout => Direction::Bullish,
            Regime::TrendingDown | Regime::Breakdown => Direction::Bearish,
            Regime::Ranging | Regime::Volatile | Regime::Quiet => Direction::Neutral,
        };
        if direction == Direction::Neutral {
            return Vec::new();
        }
        vec![Vote::new(
            format!("REGIME:{}", state.current),
            direction,
            state.strength,
        )]
    }
}

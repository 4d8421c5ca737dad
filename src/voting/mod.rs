// =============================================================================
// Indicator Ensemble & Voting Brain
// =============================================================================
//
// Fuses heterogeneous per-indicator votes into a single directional
// decision with a size multiplier. Voters are registered explicitly at
// startup; the brain itself holds no state beyond the most recent
// `TradeDecision`.

pub mod ma_cross;
pub mod tpo_voter;

use crate::decision::{TradeDecision, TradeDirection};
use crate::pattern_memory::PatternMemory;
use crate::regime::RegimeParameters;
use crate::vote::{Direction, Vote};

/// Inputs the brain needs beyond the raw vote list: regime parameters gate
/// the confidence threshold and size the initial unit, pattern memory scores
/// the active feature keys, and ATR (when available) derives dynamic stops.
pub struct VotingInputs<'a> {
    pub votes: Vec<Vote>,
    pub regime_parameters: RegimeParameters,
    pub pattern_memory: &'a PatternMemory,
    pub active_pattern_keys: Vec<String>,
    pub entry_price: f64,
    pub atr: Option<f64>,
    /// MACD histogram (line minus 9-period EMA signal line) for the same
    /// close series the votes were computed from, when available.
    pub macd_histogram: Option<f64>,
    /// dynamic stop/target overriding the ATR-derived ones, supplied when a
    /// TPO signal triggered the entry.
    pub tpo_dynamic_stop: Option<f64>,
    pub tpo_dynamic_target: Option<f64>,
    /// fallback percentage stops used when ATR is unavailable.
    pub fallback_stop_pct: f64,
    pub fallback_target_pct: f64,
}

#[derive(Default)]
pub struct VotingBrain {
    last_decision: Option<TradeDecision>,
}

impl VotingBrain {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn last_decision(&self) -> Option<&TradeDecision> {
        self.last_decision.as_ref()
    }

    pub fn evaluate(&mut self, inputs: VotingInputs<'_>) -> TradeDecision {
        let bullish: f64 = inputs
            .votes
            .iter()
            .filter(|v| v.direction == Direction::Bullish)
            .map(|v| v.strength)
            .sum();
        let bearish: f64 = inputs
            .votes
            .iter()
            .filter(|v| v.direction == Direction::Bearish)
            .map(|v| v.strength)
            .sum();

        let raw_direction = if bullish > bearish {
            TradeDirection::Long
        } else if bearish > bullish {
            TradeDirection::Short
        } else {
            TradeDirection::Flat
        };
        let raw_confidence = (bullish - bearish).abs().clamp(0.0, 1.0);

        let mut reason_tags = Vec::new();

        if raw_direction == TradeDirection::Flat {
            reason_tags.push("tie:bullish_equals_bearish".to_string());
            let decision = TradeDecision::flat(reason_tags, inputs.votes);
            self.last_decision = Some(decision.clone());
            return decision;
        }

        if raw_confidence < inputs.regime_parameters.confidence_threshold {
            reason_tags.push(format!(
                "below_confidence_threshold:{:.3}<{:.3}",
                raw_confidence, inputs.regime_parameters.confidence_threshold
            ));
            let decision = TradeDecision::flat(reason_tags, inputs.votes);
            self.last_decision = Some(decision.clone());
            return decision;
        }

        let composite = inputs.pattern_memory.composite(&inputs.active_pattern_keys);
        let pattern_size_multiplier = PatternMemory::size_multiplier(composite);
        let size_multiplier =
            (inputs.regime_parameters.risk_multiplier * pattern_size_multiplier).clamp(0.25, 1.5);

        reason_tags.push(format!("risk_multiplier:{:.2}", inputs.regime_parameters.risk_multiplier));
        reason_tags.push(format!("pattern_composite:{composite:.3}"));

        let (stop_loss_price, take_profit_price) = derive_stops(&inputs, raw_direction);
        if inputs.atr.is_none() && inputs.tpo_dynamic_stop.is_none() {
            reason_tags.push("atr_unavailable:fallback_pct_stops".to_string());
        }
        if inputs.tpo_dynamic_stop.is_some() {
            reason_tags.push("tpo_dynamic_levels".to_string());
        }
        if let Some(histogram) = inputs.macd_histogram {
            let macd_agrees = match raw_direction {
                TradeDirection::Long => histogram > 0.0,
                TradeDirection::Short => histogram < 0.0,
                TradeDirection::Flat => false,
            };
            if macd_agrees {
                reason_tags.push("macd:ema9-signal".to_string());
            }
        }

        let decision = TradeDecision {
            direction: raw_direction,
            confidence: raw_confidence,
            size_multiplier,
            stop_loss_price,
            take_profit_price,
            reason_tags,
            source_votes: inputs.votes,
        };
        self.last_decision = Some(decision.clone());
        decision
    }
}

fn derive_stops(inputs: &VotingInputs<'_>, direction: TradeDirection) -> (Option<f64>, Option<f64>) {
    if let (Some(stop), Some(target)) = (inputs.tpo_dynamic_stop, inputs.tpo_dynamic_target) {
        return (Some(stop), Some(target));
    }

    let sign = match direction {
        TradeDirection::Long => 1.0,
        TradeDirection::Short => -1.0,
        TradeDirection::Flat => 0.0,
    };

    if let Some(atr) = inputs.atr {
        let stop = inputs.entry_price - sign * atr * inputs.regime_parameters.stop_loss_multiplier;
        let target = inputs.entry_price + sign * atr * inputs.regime_parameters.take_profit_multiplier;
        (Some(stop), Some(target))
    } else {
        let stop = inputs.entry_price * (1.0 - sign * inputs.fallback_stop_pct / 100.0);
        let target = inputs.entry_price * (1.0 + sign * inputs.fallback_target_pct / 100.0);
        (Some(stop), Some(target))
    }
}

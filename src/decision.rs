// =============================================================================
// TradeDecision & Outcome
// =============================================================================
//
// `Outcome` preserves the source's exception-driven control flow as a tagged
// result per the design notes: safety gates return `Rejected{reason}` rather
// than throwing, and callers match on the tag.

use serde::{Deserialize, Serialize};

use crate::vote::Vote;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TradeDirection {
    Long,
    Short,
    Flat,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradeDecision {
    pub direction: TradeDirection,
    pub confidence: f64,
    pub size_multiplier: f64,
    pub stop_loss_price: Option<f64>,
    pub take_profit_price: Option<f64>,
    pub reason_tags: Vec<String>,
    pub source_votes: Vec<Vote>,
}

impl TradeDecision {
    pub fn flat(reason_tags: Vec<String>, source_votes: Vec<Vote>) -> Self {
        Self {
            direction: TradeDirection::Flat,
            confidence: 0.0,
            size_multiplier: 1.0,
            stop_loss_price: None,
            take_profit_price: None,
            reason_tags,
            source_votes,
        }
    }
}

/// Tagged result used throughout the Safety Fabric in place of thrown
/// exceptions.
#[derive(Debug, Clone)]
pub enum Outcome<A> {
    Accepted(A),
    Rejected { reason: String },
}

impl<A> Outcome<A> {
    pub fn is_accepted(&self) -> bool {
        matches!(self, Outcome::Accepted(_))
    }

    pub fn rejected(reason: impl Into<String>) -> Self {
        Outcome::Rejected {
            reason: reason.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flat_decision_has_neutral_size() {
        let decision = TradeDecision::flat(vec!["tie".into()], vec![]);
        assert_eq!(decision.direction, TradeDirection::Flat);
        assert_eq!(decision.size_multiplier, 1.0);
    }

    #[test]
    fn outcome_rejected_carries_reason() {
        let outcome: Outcome<()> = Outcome::rejected("kill switch active");
        assert!(!outcome.is_accepted());
    }
}

// =============================================================================
// Two-Pole Oscillator Voter
// =============================================================================
//
// Wraps `indicators::tpo`'s pure pipeline and turns a crossover reading into
// a BUY/SELL vote. An optional A/B companion — an older incremental
// oscillator run in parallel — must agree with the primary TPO before a
// vote is emitted when `confluence` is enabled.

use crate::indicators::tpo::{calculate_tpo, tpo_vote_strength, TpoCross};
use crate::vote::{Direction, Vote, Voter};

#[derive(Debug, Clone, Copy)]
pub struct TpoVoterConfig {
    pub period: usize,
    pub lag: usize,
    pub confluence_enabled: bool,
    /// period for the A/B companion oscillator, only used when confluence is enabled.
    pub companion_period: usize,
}

impl Default for TpoVoterConfig {
    fn default() -> Self {
        Self {
            period: 20,
            lag: 3,
            confluence_enabled: false,
            companion_period: 34,
        }
    }
}

pub struct TpoVoter {
    config: TpoVoterConfig,
    last_votes: Vec<Vote>,
}

impl TpoVoter {
    pub fn new(config: TpoVoterConfig) -> Self {
        Self {
            config,
            last_votes: Vec::new(),
        }
    }

    pub fn update(&mut self, closes: &[f64]) -> Vec<Vote> {
        let Some(primary) = calculate_tpo(closes, self.config.period, self.config.lag) else {
            self.last_votes.clear();
            return Vec::new();
        };

        let direction = match primary.cross {
            TpoCross::Buy => Some(Direction::Bullish),
            TpoCross::Sell => Some(Direction::Bearish),
            TpoCross::None => None,
        };

        let Some(direction) = direction else {
            self.last_votes.clear();
            return Vec::new();
        };

        if self.config.confluence_enabled {
            let companion = calculate_tpo(closes, self.config.companion_period, self.config.lag);
            let agrees = matches!(
                (direction, companion.map(|c| c.cross)),
                (Direction::Bullish, Some(TpoCross::Buy)) | (Direction::Bearish, Some(TpoCross::Sell))
            );
            if !agrees {
                self.last_votes.clear();
                return Vec::new();
            }
        }

        let strength = tpo_vote_strength(&primary);
        let votes = vec![Vote::new(
            format!("TPO:{}", if direction == Direction::Bullish { "buy" } else { "sell" }),
            direction,
            strength,
        )];
        self.last_votes = votes.clone();
        votes
    }
}

impl Voter for TpoVoter {
    fn name(&self) -> &str {
        "TPO"
    }

    fn get_votes(&self) -> Vec<Vote> {
        self.last_votes.clone()
    }
}

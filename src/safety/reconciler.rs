// =============================================================================
// Exchange Reconciler
// =============================================================================
//
// Runs on startup (blocking) and every 30s thereafter. Compares local
// position+balance with the broker's reported values and applies a
// graduated drift policy: silent / warn-autocorrect / pause / hard-stop.

use serde::{Deserialize, Serialize};
use tracing::{error, warn};

#[derive(Debug, Clone, Copy)]
pub struct ReconcilerConfig {
    pub warn_threshold: f64,
    pub pause_threshold: f64,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            warn_threshold: 0.001,
            pause_threshold: 0.01,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReconciliationOutcome {
    Silent,
    WarnAutocorrected,
    Paused,
    HardStop,
}

#[derive(Debug, Clone)]
pub struct ReconciliationResult {
    pub outcome: ReconciliationOutcome,
    pub drift: f64,
    pub corrected_local: Option<f64>,
}

pub struct Reconciler {
    config: ReconcilerConfig,
}

impl Reconciler {
    pub fn new(config: ReconcilerConfig) -> Self {
        Self { config }
    }

    /// Compare a locally tracked quantity against the broker's authoritative
    /// value. `remote` is `None` when the broker reports no knowledge of the
    /// position at all — an immediate hard stop per spec.
    pub fn reconcile(&self, local: f64, remote: Option<f64>) -> ReconciliationResult {
        let Some(remote) = remote else {
            error!(local, "broker reports unknown position — hard stop");
            return ReconciliationResult {
                outcome: ReconciliationOutcome::HardStop,
                drift: f64::INFINITY,
                corrected_local: None,
            };
        };

        let drift = (local - remote).abs();
        if drift <= self.config.warn_threshold {
            ReconciliationResult {
                outcome: ReconciliationOutcome::Silent,
                drift,
                corrected_local: None,
            }
        } else if drift <= self.config.pause_threshold {
            warn!(drift, local, remote, "reconciliation drift detected, auto-correcting local state");
            ReconciliationResult {
                outcome: ReconciliationOutcome::WarnAutocorrected,
                drift,
                corrected_local: Some(remote),
            }
        } else {
            error!(drift, local, remote, "reconciliation drift exceeds pause threshold");
            ReconciliationResult {
                outcome: ReconciliationOutcome::Paused,
                drift,
                corrected_local: None,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reconciler() -> Reconciler {
        Reconciler::new(ReconcilerConfig::default())
    }

    #[test]
    fn tiny_drift_is_silent() {
        let result = reconciler().reconcile(1.0000, Some(1.0001));
        assert_eq!(result.outcome, ReconciliationOutcome::Silent);
    }

    #[test]
    fn moderate_drift_autocorrects() {
        let result = reconciler().reconcile(1.0, Some(1.005));
        assert_eq!(result.outcome, ReconciliationOutcome::WarnAutocorrected);
        assert_eq!(result.corrected_local, Some(1.005));
    }

    #[test]
    fn large_drift_pauses() {
        let result = reconciler().reconcile(1.0, Some(1.5));
        assert_eq!(result.outcome, ReconciliationOutcome::Paused);
    }

    #[test]
    fn unknown_remote_is_hard_stop() {
        let result = reconciler().reconcile(1.0, None);
        assert_eq!(result.outcome, ReconciliationOutcome::HardStop);
    }
}

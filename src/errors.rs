// =============================================================================
// Typed Safety-Violation Taxonomy
// =============================================================================
//
// Safety violations produce typed errors that abort the current order path
// without crashing the process. Everything else in the hot path
// either recovers with a documented fallback or propagates via
// `anyhow::Result`.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum SafetyError {
    #[error("kill switch active: {reason}")]
    KillSwitchActive { reason: String },

    #[error("market feed stale for {elapsed_secs}s")]
    FeedStale { elapsed_secs: u64 },

    #[error("reconciliation drift {drift} exceeds pause threshold")]
    ReconciliationDrift { drift: f64 },

    #[error("event loop stalled for {lag_ms}ms")]
    EventLoopStalled { lag_ms: u128 },

    #[error("circuit breaker open for module '{module}'")]
    CircuitBreakerOpen { module: String },

    #[error("another instance holds the singleton lock (pid {pid})")]
    InstanceLockHeld { pid: u32 },
}

#[derive(Debug, Error)]
pub enum ExecutionError {
    #[error(transparent)]
    Safety(#[from] SafetyError),

    #[error("broker rejected order: {reason}")]
    BrokerRejected { reason: String },

    #[error("broker request timed out after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },
}

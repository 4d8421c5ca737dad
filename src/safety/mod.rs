// =============================================================================
// Safety Fabric
// =============================================================================
//
// Seven cooperating mechanisms guarding the order path. `SafetyFabric` is
// the single handle constructed at startup and passed by reference —
// preserving the source's "one process-wide singleton, durable, all
// callers observe the same truth" contract without a mutable global.

pub mod circuit_breaker;
pub mod idempotency;
pub mod kill_switch;
pub mod lock;
pub mod loop_monitor;
pub mod reconciler;
pub mod stale_feed;

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use parking_lot::RwLock;

use crate::errors::SafetyError;
use circuit_breaker::CircuitBreakerRegistry;
use kill_switch::KillSwitch;
use loop_monitor::LoopMonitor;
use reconciler::{Reconciler, ReconciliationOutcome};
use stale_feed::StaleFeedMonitor;

/// Snapshot of the fabric's mutable condition, read by the relay/dashboard.
#[derive(Debug, Clone)]
pub struct SafetyStateSnapshot {
    pub kill_switch_on: bool,
    pub trading_paused: bool,
    pub pause_reason: Option<String>,
    pub feed_stale: bool,
    pub loop_stalled: bool,
    pub reconciliation_drift_units: f64,
}

/// Constructed exactly once at startup. A runtime invariant check forbids a
/// second instance within the same process (see the design notes on global
/// mutable state).
pub struct SafetyFabric {
    kill_switch: KillSwitch,
    breakers: CircuitBreakerRegistry,
    reconciler: Reconciler,
    loop_monitor: RwLock<LoopMonitor>,
    stale_feed: RwLock<StaleFeedMonitor>,
    trading_paused: AtomicBool,
    pause_reason: RwLock<Option<String>>,
    reconciliation_drift_units: RwLock<f64>,
}

static INSTANCE_CONSTRUCTED: AtomicBool = AtomicBool::new(false);

pub struct SafetyFabricConfig {
    pub kill_switch_flag_path: std::path::PathBuf,
    pub kill_switch_log_path: std::path::PathBuf,
    pub breaker_threshold: u32,
    pub breaker_half_open_after: Duration,
    pub reconciler_warn_threshold: f64,
    pub reconciler_pause_threshold: f64,
    pub loop_warn_threshold: Duration,
    pub loop_pause_threshold: Duration,
    pub feed_warn_after: Duration,
    pub feed_pause_after: Duration,
}

impl SafetyFabric {
    /// Panics if a second `SafetyFabric` is constructed in this process —
    /// the runtime invariant check called for in the design notes. Relaxed
    /// under `#[cfg(test)]`: unit tests legitimately construct an isolated
    /// fabric per test case, none of which represent the one-engine-per-
    /// process contract this guard protects in production.
    pub fn new(config: SafetyFabricConfig) -> Self {
        if !cfg!(test) && INSTANCE_CONSTRUCTED.swap(true, Ordering::SeqCst) {
            panic!("SafetyFabric constructed more than once in this process");
        }
        Self {
            kill_switch: KillSwitch::new(config.kill_switch_flag_path, config.kill_switch_log_path),
            breakers: CircuitBreakerRegistry::new(config.breaker_threshold, config.breaker_half_open_after),
            reconciler: Reconciler::new(reconciler::ReconcilerConfig {
                warn_threshold: config.reconciler_warn_threshold,
                pause_threshold: config.reconciler_pause_threshold,
            }),
            loop_monitor: RwLock::new(LoopMonitor::new(config.loop_warn_threshold, config.loop_pause_threshold)),
            stale_feed: RwLock::new(StaleFeedMonitor::new(config.feed_warn_after, config.feed_pause_after)),
            trading_paused: AtomicBool::new(false),
            pause_reason: RwLock::new(None),
            reconciliation_drift_units: RwLock::new(0.0),
        }
    }

    pub fn kill_switch(&self) -> &KillSwitch {
        &self.kill_switch
    }

    pub fn breakers(&self) -> &CircuitBreakerRegistry {
        &self.breakers
    }

    pub fn is_paused(&self) -> bool {
        self.trading_paused.load(Ordering::SeqCst)
    }

    /// One-way latch set by any safety mechanism; cleared only by the
    /// originating mechanism (or an explicit operator `resume`).
    fn pause(&self, reason: &str) {
        self.trading_paused.store(true, Ordering::SeqCst);
        *self.pause_reason.write() = Some(reason.to_string());
    }

    pub fn resume(&self) {
        self.trading_paused.store(false, Ordering::SeqCst);
        *self.pause_reason.write() = None;
    }

    pub fn on_candle_arrival(&self, now: Instant) {
        let cleared = self.stale_feed.write().on_candle(now);
        if cleared {
            self.resume();
        }
    }

    pub fn check_stale_feed(&self, now: Instant) {
        let health = self.stale_feed.write().check(now);
        if health == stale_feed::FeedHealth::Paused {
            self.pause("stale_feed");
        }
    }

    pub fn check_loop_health(&self, now: Instant) {
        let health = self.loop_monitor.write().tick(now);
        if health == loop_monitor::LoopHealth::Stalled {
            self.pause("event_loop_stalled");
        }
    }

    pub fn reconcile(&self, local: f64, remote: Option<f64>) -> ReconciliationOutcome {
        let result = self.reconciler.reconcile(local, remote);
        *self.reconciliation_drift_units.write() = result.drift;
        match result.outcome {
            ReconciliationOutcome::Paused => self.pause("reconciliation_drift"),
            ReconciliationOutcome::HardStop => self.pause("reconciliation_unknown_remote"),
            _ => {}
        }
        result.outcome
    }

    pub fn snapshot(&self) -> SafetyStateSnapshot {
        let pause_reason = self.pause_reason.read().clone();
        SafetyStateSnapshot {
            kill_switch_on: self.kill_switch.is_on(),
            trading_paused: self.is_paused(),
            feed_stale: self.stale_feed.read().is_paused(),
            loop_stalled: pause_reason.as_deref() == Some("event_loop_stalled"),
            pause_reason,
            reconciliation_drift_units: *self.reconciliation_drift_units.read(),
        }
    }

    /// Consult every safety gate in the fixed order: kill
    /// switch -> single-instance lock (verified at startup, not re-checked
    /// here) -> reconciliation pause -> stale-feed pause -> event-loop pause
    /// -> per-module breaker -> idempotency check (performed by the caller
    /// once this returns `Ok`). The first failing gate aborts the path.
    pub fn check_order_path(&self, module: &str) -> Result<(), SafetyError> {
        if self.kill_switch.is_on() {
            return Err(SafetyError::KillSwitchActive {
                reason: self
                    .kill_switch
                    .current_flag()
                    .map(|f| f.reason)
                    .unwrap_or_else(|| "unknown".to_string()),
            });
        }
        if self.is_paused() {
            let reason = self.pause_reason.read().clone().unwrap_or_default();
            if reason == "reconciliation_drift" || reason == "reconciliation_unknown_remote" {
                return Err(SafetyError::ReconciliationDrift {
                    drift: *self.reconciliation_drift_units.read(),
                });
            }
            if reason == "stale_feed" {
                return Err(SafetyError::FeedStale { elapsed_secs: 0 });
            }
            if reason == "event_loop_stalled" {
                return Err(SafetyError::EventLoopStalled { lag_ms: 0 });
            }
        }
        if self.breakers.is_open(module) {
            return Err(SafetyError::CircuitBreakerOpen {
                module: module.to_string(),
            });
        }
        Ok(())
    }
}

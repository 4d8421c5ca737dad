// =============================================================================
// Central Application State
// =============================================================================
//
// The single source of truth tying every subsystem together, grounded on the
// teacher's `AppState` (Arc-wrapped subsystem engines, RwLock-guarded
// mutable collections, a monotonic version counter for the relay's
// push-diffing) generalized to this engine's pipeline: Aggregator -> Regime
// -> Voting Brain -> Safety Fabric -> Execution, with the Relay hub
// receiving every candle/decision/safety event as a side channel.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;

use crate::aggregator::MultiTimeframeAggregator;
use crate::config::RuntimeConfig;
use crate::execution::ExecutionRouter;
use crate::pattern_memory::PatternMemory;
use crate::position::PositionManager;
use crate::regime::RegimeDetector;
use crate::relay::RelayHub;
use crate::safety::idempotency::IntentCache;
use crate::safety::{SafetyFabric, SafetyFabricConfig};
use crate::voting::VotingBrain;

static INSTANCE_CONSTRUCTED: AtomicBool = AtomicBool::new(false);

/// Central wiring struct. Holds every subsystem behind `Arc`/`RwLock` so
/// async tasks can share one `Arc<AppState>`. Like `SafetyFabric`,
/// construction is a runtime-enforced singleton — this process drives
/// exactly one trading engine.
pub struct AppState {
    pub runtime_config: RwLock<RuntimeConfig>,
    pub aggregator: Arc<MultiTimeframeAggregator>,
    pub regime_detector: Arc<RegimeDetector>,
    pub voting_brain: RwLock<VotingBrain>,
    pub pattern_memory: Arc<PatternMemory>,
    pub position_manager: Arc<PositionManager>,
    pub safety: Arc<SafetyFabric>,
    pub intent_cache: Arc<IntentCache>,
    pub execution: Arc<ExecutionRouter>,
    pub relay: Arc<RelayHub>,

    /// Monotonic version counter, bumped on every meaningful mutation;
    /// the relay's push loop diffs against it before fanning out a
    /// refreshed snapshot.
    pub state_version: AtomicU64,
    pub start_time: std::time::Instant,
}

impl AppState {
    /// Panics if a second `AppState` is constructed in this process. Relaxed
    /// under `#[cfg(test)]` for the same reason as `SafetyFabric::new`.
    pub fn new(
        config: RuntimeConfig,
        pattern_memory_path: std::path::PathBuf,
        kill_switch_flag_path: std::path::PathBuf,
        kill_switch_log_path: std::path::PathBuf,
        execution_adapter: Box<dyn crate::execution::ExecutionAdapter>,
    ) -> Arc<Self> {
        if !cfg!(test) && INSTANCE_CONSTRUCTED.swap(true, Ordering::SeqCst) {
            panic!("AppState constructed more than once in this process");
        }

        let pattern_memory = Arc::new(
            PatternMemory::load(&pattern_memory_path).unwrap_or_else(|_| PatternMemory::new(pattern_memory_path)),
        );

        let safety = Arc::new(SafetyFabric::new(SafetyFabricConfig {
            kill_switch_flag_path,
            kill_switch_log_path,
            breaker_threshold: 5,
            breaker_half_open_after: std::time::Duration::from_secs(300),
            reconciler_warn_threshold: 0.001,
            reconciler_pause_threshold: 0.01,
            loop_warn_threshold: std::time::Duration::from_millis(100),
            loop_pause_threshold: std::time::Duration::from_millis(500),
            feed_warn_after: std::time::Duration::from_secs(5),
            feed_pause_after: std::time::Duration::from_secs(30),
        }));

        let relay_token = config.websocket_auth_token.clone().unwrap_or_default();

        Arc::new(Self {
            runtime_config: RwLock::new(config),
            aggregator: Arc::new(MultiTimeframeAggregator::new()),
            regime_detector: RegimeDetector::new(crate::regime::RegimeConfig::default()),
            voting_brain: RwLock::new(VotingBrain::new()),
            pattern_memory,
            position_manager: Arc::new(PositionManager::new()),
            safety: safety.clone(),
            intent_cache: Arc::new(IntentCache::default()),
            execution: Arc::new(ExecutionRouter::new(execution_adapter, safety)),
            relay: RelayHub::new(relay_token),
            state_version: AtomicU64::new(1),
            start_time: std::time::Instant::now(),
        })
    }

    pub fn increment_version(&self) -> u64 {
        self.state_version.fetch_add(1, Ordering::SeqCst)
    }

    pub fn current_state_version(&self) -> u64 {
        self.state_version.load(Ordering::SeqCst)
    }
}

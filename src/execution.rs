// =============================================================================
// Execution Adapter
// =============================================================================
//
// The boundary to out-of-scope broker code. Grounded on the teacher's
// `ExecutionEngine` (risk pre-check -> demo/live dispatch -> position-manager
// update) with the Binance-specific client replaced by a trait object so the
// broker itself is pluggable, and with idempotent submission wired through
// `safety::idempotency::IntentCache` ahead of every dispatch.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::errors::ExecutionError;
use crate::safety::idempotency::{compute_intent_id, IntentCache, IntentRecord, OrderSide};
use crate::safety::SafetyFabric;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderIntent {
    pub symbol: String,
    pub side: OrderSide,
    pub quantity: f64,
    pub price: f64,
    pub timestamp_millis: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubmitResult {
    pub accepted: bool,
    pub order_id: Option<String>,
    pub fill_price: Option<f64>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CancelResult {
    pub ok: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PositionInfo {
    pub symbol: String,
    pub qty: f64,
    pub avg_price: f64,
}

/// Matches the spec's broker boundary exactly: `submit`, `cancel`,
/// `positions`, `balance`. All methods may fail; failures are routed through
/// the circuit breaker and reconciler by the caller, not swallowed here.
#[async_trait]
pub trait ExecutionAdapter: Send + Sync {
    async fn submit(&self, intent: &OrderIntent) -> Result<SubmitResult, ExecutionError>;
    async fn cancel(&self, order_id: &str) -> Result<CancelResult, ExecutionError>;
    async fn positions(&self) -> Result<Vec<PositionInfo>, ExecutionError>;
    async fn balance(&self) -> Result<Vec<crate::types::BalanceInfo>, ExecutionError>;
}

/// A broker-agnostic simulation adapter used in paper/backtest mode. Fills
/// immediately at the requested price.
pub struct PaperAdapter;

#[async_trait]
impl ExecutionAdapter for PaperAdapter {
    async fn submit(&self, intent: &OrderIntent) -> Result<SubmitResult, ExecutionError> {
        info!(symbol = %intent.symbol, quantity = intent.quantity, price = intent.price, "paper fill");
        Ok(SubmitResult {
            accepted: true,
            order_id: Some(uuid::Uuid::new_v4().to_string()),
            fill_price: Some(intent.price),
            error: None,
        })
    }

    async fn cancel(&self, _order_id: &str) -> Result<CancelResult, ExecutionError> {
        Ok(CancelResult { ok: true })
    }

    async fn positions(&self) -> Result<Vec<PositionInfo>, ExecutionError> {
        Ok(Vec::new())
    }

    async fn balance(&self) -> Result<Vec<crate::types::BalanceInfo>, ExecutionError> {
        Ok(Vec::new())
    }
}

/// Wraps a concrete `ExecutionAdapter` with the safety-gate order path and
/// idempotent submission. This is what the rest of the engine calls.
pub struct ExecutionRouter {
    adapter: Box<dyn ExecutionAdapter>,
    safety: std::sync::Arc<SafetyFabric>,
}

const MODULE_NAME: &str = "execution";

impl ExecutionRouter {
    pub fn new(adapter: Box<dyn ExecutionAdapter>, safety: std::sync::Arc<SafetyFabric>) -> Self {
        Self { adapter, safety }
    }

    /// Runs the fixed-order safety gates, then the idempotency check, before
    /// forwarding to the underlying broker adapter. `submit(intent);
    /// submit(intent)` within the intent cache's TTL yields exactly one
    /// broker order — the second call returns the first's record without
    /// calling the adapter again.
    pub async fn submit(&self, intent_cache: &IntentCache, intent: OrderIntent) -> Result<SubmitResult, ExecutionError> {
        self.safety.check_order_path(MODULE_NAME)?;

        let intent_id = compute_intent_id(&intent.symbol, intent.side, intent.quantity, intent.price, intent.timestamp_millis);
        let mut already_submitted = true;
        let record = intent_cache.get_or_insert(&intent_id, || {
            already_submitted = false;
            IntentRecord {
                intent_id: intent_id.clone(),
                client_order_id: format!("cid-{intent_id}"),
                symbol: intent.symbol.clone(),
                side: intent.side,
                quantity: intent.quantity,
                price: intent.price,
                created_at_millis: intent.timestamp_millis,
                status: "pending".to_string(),
                ttl_millis: 300_000,
            }
        });

        if already_submitted {
            info!(intent_id = %record.intent_id, "duplicate order intent absorbed, returning prior record");
            return Ok(SubmitResult {
                accepted: true,
                order_id: Some(record.client_order_id),
                fill_price: None,
                error: None,
            });
        }

        match self.adapter.submit(&intent).await {
            Ok(result) => Ok(result),
            Err(err) => {
                self.safety.breakers().report_critical(MODULE_NAME, &err.to_string());
                warn!(error = %err, "order submission failed");
                Err(err)
            }
        }
    }

    pub async fn cancel(&self, order_id: &str) -> Result<CancelResult, ExecutionError> {
        self.safety.check_order_path(MODULE_NAME)?;
        self.adapter.cancel(order_id).await
    }

    pub async fn positions(&self) -> Result<Vec<PositionInfo>, ExecutionError> {
        self.adapter.positions().await
    }

    pub async fn balance(&self) -> Result<Vec<crate::types::BalanceInfo>, ExecutionError> {
        self.adapter.balance().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::safety::{SafetyFabric, SafetyFabricConfig};
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::time::Duration;

    static COUNTER: AtomicU64 = AtomicU64::new(0);

    fn test_safety() -> std::sync::Arc<SafetyFabric> {
        let n = COUNTER.fetch_add(1, Ordering::Relaxed);
        let mut flag = std::env::temp_dir();
        flag.push(format!("confluence-core-exec-flag-{n}.json"));
        let mut log = std::env::temp_dir();
        log.push(format!("confluence-core-exec-log-{n}.log"));
        std::sync::Arc::new(SafetyFabric::new(SafetyFabricConfig {
            kill_switch_flag_path: flag,
            kill_switch_log_path: log,
            breaker_threshold: 5,
            breaker_half_open_after: Duration::from_secs(60),
            reconciler_warn_threshold: 0.001,
            reconciler_pause_threshold: 0.01,
            loop_warn_threshold: Duration::from_millis(100),
            loop_pause_threshold: Duration::from_millis(500),
            feed_warn_after: Duration::from_secs(5),
            feed_pause_after: Duration::from_secs(30),
        }))
    }

    #[tokio::test]
    async fn duplicate_submission_within_ttl_hits_adapter_once() {
        let router = ExecutionRouter::new(Box::new(PaperAdapter), test_safety());
        let cache = IntentCache::new(Duration::from_secs(300));
        let intent = OrderIntent {
            symbol: "BTC/USD".into(),
            side: OrderSide::Buy,
            quantity: 1.0,
            price: 50000.0,
            timestamp_millis: 0,
        };
        let first = router.submit(&cache, intent.clone()).await.unwrap();
        let second = router.submit(&cache, intent).await.unwrap();
        assert_eq!(first.order_id, second.order_id);
        assert_eq!(cache.len(), 1);
    }

    #[tokio::test]
    async fn kill_switch_blocks_submission() {
        let safety = test_safety();
        safety.kill_switch().activate("halted").unwrap();
        let router = ExecutionRouter::new(Box::new(PaperAdapter), safety);
        let cache = IntentCache::new(Duration::from_secs(300));
        let intent = OrderIntent {
            symbol: "ETH/USD".into(),
            side: OrderSide::Sell,
            quantity: 1.0,
            price: 3000.0,
            timestamp_millis: 0,
        };
        let result = router.submit(&cache, intent).await;
        assert!(matches!(result, Err(ExecutionError::Safety(crate::errors::SafetyError::KillSwitchActive { .. }))));
    }
}

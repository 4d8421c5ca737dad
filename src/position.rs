// =============================================================================
// Position Lifecycle
// =============================================================================
//
// Simplified two-state lifecycle (Open -> Closed) per the single
// `stopLossPrice`/`takeProfitPrice` pair a `TradeDecision` carries — no
// partial take-profit or trailing-stop tiers. Grounded on the teacher's
// `position_engine::PositionManager` (RwLock-guarded open/closed vectors,
// UUID ids, `check_exits` scan-and-report) with the TP1/TP2/trailing-stop
// state machine collapsed to a single stop/target pair.
//
// `close_position` is the ONLY place PnL reaches `PatternMemory` — it is the
// sole caller of `PatternMemory::record`, enforcing the exit-only recording
// rule structurally rather than by convention.

use chrono::Utc;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::info;
use uuid::Uuid;

use crate::decision::TradeDirection;
use crate::pattern_memory::PatternMemory;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PositionStatus {
    Open,
    Closed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Position {
    pub id: String,
    pub symbol: String,
    pub direction: TradeDirection,
    pub entry_price: f64,
    pub quantity: f64,
    #[serde(default)]
    pub current_price: f64,
    #[serde(default)]
    pub unrealized_pnl_pct: f64,
    pub stop_loss_price: Option<f64>,
    pub take_profit_price: Option<f64>,
    /// The pattern-fingerprint key active at entry, carried through to close
    /// so the outcome can be attributed back to the pattern that produced it.
    pub pattern_key: Option<String>,
    pub status: PositionStatus,
    pub opened_at: String,
    #[serde(default)]
    pub closed_at: Option<String>,
    #[serde(default)]
    pub close_reason: Option<String>,
    #[serde(default)]
    pub realized_pnl_pct: f64,
}

pub struct PositionManager {
    open: RwLock<Vec<Position>>,
    closed: RwLock<Vec<Position>>,
}

impl PositionManager {
    pub fn new() -> Self {
        Self {
            open: RwLock::new(Vec::new()),
            closed: RwLock::new(Vec::new()),
        }
    }

    pub fn open_position(
        &self,
        symbol: &str,
        direction: TradeDirection,
        entry_price: f64,
        quantity: f64,
        stop_loss_price: Option<f64>,
        take_profit_price: Option<f64>,
        pattern_key: Option<String>,
    ) -> String {
        let id = Uuid::new_v4().to_string();
        let pos = Position {
            id: id.clone(),
            symbol: symbol.to_string(),
            direction,
            entry_price,
            quantity,
            current_price: entry_price,
            unrealized_pnl_pct: 0.0,
            stop_loss_price,
            take_profit_price,
            pattern_key,
            status: PositionStatus::Open,
            opened_at: Utc::now().to_rfc3339(),
            closed_at: None,
            close_reason: None,
            realized_pnl_pct: 0.0,
        };
        info!(id = %id, symbol, ?direction, entry_price, quantity, "position opened");
        self.open.write().push(pos);
        id
    }

    pub fn update_price(&self, symbol: &str, current_price: f64) {
        let mut positions = self.open.write();
        for pos in positions.iter_mut().filter(|p| p.symbol == symbol) {
            pos.current_price = current_price;
            pos.unrealized_pnl_pct = pnl_pct(pos.direction, pos.entry_price, current_price);
        }
    }

    /// Scan open positions for stop-loss / take-profit hits. Does not mutate
    /// state — the caller decides whether/when to invoke `close_position`.
    pub fn check_exits(&self) -> Vec<(String, &'static str)> {
        let positions = self.open.read();
        let mut exits = Vec::new();
        for pos in positions.iter() {
            let price = pos.current_price;
            let is_long = matches!(pos.direction, TradeDirection::Long);
            if let Some(sl) = pos.stop_loss_price {
                let hit = if is_long { price <= sl } else { price >= sl };
                if hit {
                    exits.push((pos.id.clone(), "stop_loss"));
                    continue;
                }
            }
            if let Some(tp) = pos.take_profit_price {
                let hit = if is_long { price >= tp } else { price <= tp };
                if hit {
                    exits.push((pos.id.clone(), "take_profit"));
                }
            }
        }
        exits
    }

    /// Close a position by id, computing final PnL and — if the position
    /// carries a `pattern_key` — recording the outcome into `pattern_memory`.
    /// This is the single call site for `PatternMemory::record` in the
    /// entire crate.
    pub fn close_position(
        &self,
        id: &str,
        reason: &str,
        close_price: f64,
        now_millis: i64,
        pattern_memory: &PatternMemory,
    ) -> Option<f64> {
        let mut open = self.open.write();
        let idx = open.iter().position(|p| p.id == id)?;
        let mut pos = open.remove(idx);
        drop(open);

        let final_pnl_pct = pnl_pct(pos.direction, pos.entry_price, close_price);
        pos.current_price = close_price;
        pos.unrealized_pnl_pct = 0.0;
        pos.realized_pnl_pct = final_pnl_pct;
        pos.status = PositionStatus::Closed;
        pos.closed_at = Some(Utc::now().to_rfc3339());
        pos.close_reason = Some(reason.to_string());

        if let Some(key) = &pos.pattern_key {
            if let Err(err) = pattern_memory.record(key, final_pnl_pct, now_millis) {
                tracing::warn!(error = %err, key, "failed to persist pattern memory outcome");
            }
        }

        info!(id, reason, close_price, realized_pnl_pct = final_pnl_pct, "position closed");
        self.closed.write().push(pos);
        Some(final_pnl_pct)
    }

    pub fn get_open_positions(&self) -> Vec<Position> {
        self.open.read().clone()
    }

    pub fn get_closed_positions(&self, count: usize) -> Vec<Position> {
        let closed = self.closed.read();
        closed.iter().rev().take(count).cloned().collect()
    }
}

impl Default for PositionManager {
    fn default() -> Self {
        Self::new()
    }
}

fn pnl_pct(direction: TradeDirection, entry_price: f64, current_price: f64) -> f64 {
    if entry_price <= 0.0 {
        return 0.0;
    }
    let sign = match direction {
        TradeDirection::Long => 1.0,
        TradeDirection::Short => -1.0,
        TradeDirection::Flat => 0.0,
    };
    sign * ((current_price - entry_price) / entry_price) * 100.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU64, Ordering};

    static COUNTER: AtomicU64 = AtomicU64::new(0);

    fn temp_pattern_memory() -> PatternMemory {
        let n = COUNTER.fetch_add(1, Ordering::Relaxed);
        let mut path = std::env::temp_dir();
        path.push(format!("confluence-core-position-test-{n}.json"));
        PatternMemory::new(path)
    }

    #[test]
    fn long_position_tracks_unrealized_pnl() {
        let manager = PositionManager::new();
        let id = manager.open_position("BTC/USD", TradeDirection::Long, 100.0, 1.0, Some(95.0), Some(110.0), None);
        manager.update_price("BTC/USD", 105.0);
        let open = manager.get_open_positions();
        let pos = open.iter().find(|p| p.id == id).unwrap();
        assert!((pos.unrealized_pnl_pct - 5.0).abs() < 1e-9);
    }

    #[test]
    fn stop_loss_and_take_profit_detected() {
        let manager = PositionManager::new();
        let id = manager.open_position("BTC/USD", TradeDirection::Long, 100.0, 1.0, Some(95.0), Some(110.0), None);
        manager.update_price("BTC/USD", 94.0);
        let exits = manager.check_exits();
        assert_eq!(exits, vec![(id, "stop_loss")]);
    }

    #[test]
    fn close_position_records_into_pattern_memory_when_key_present() {
        let manager = PositionManager::new();
        let pm = temp_pattern_memory();
        let id = manager.open_position(
            "BTC/USD",
            TradeDirection::Long,
            100.0,
            1.0,
            Some(95.0),
            Some(110.0),
            Some("rsi:mid|trend:up".to_string()),
        );
        manager.update_price("BTC/USD", 110.0);
        let pnl = manager.close_position(&id, "take_profit", 110.0, 0, &pm).unwrap();
        assert!((pnl - 10.0).abs() < 1e-9);
        assert_eq!(manager.get_open_positions().len(), 0);
        assert_eq!(manager.get_closed_positions(10).len(), 1);
    }

    #[test]
    fn short_position_profits_on_price_decline() {
        let manager = PositionManager::new();
        let pm = temp_pattern_memory();
        let id = manager.open_position("ETH/USD", TradeDirection::Short, 100.0, 1.0, Some(105.0), Some(90.0), None);
        manager.update_price("ETH/USD", 90.0);
        let pnl = manager.close_position(&id, "take_profit", 90.0, 0, &pm).unwrap();
        assert!((pnl - 10.0).abs() < 1e-9);
    }
}

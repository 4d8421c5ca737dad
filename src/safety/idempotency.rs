// =============================================================================
// Idempotent Order Submission
// =============================================================================
//
// Every order carries an `intentId` (content-hash over {symbol, side,
// quantity, price-rounded, time-bucket}) and a derived `clientOrderId`. The
// execution layer maintains an intent cache with a 5-minute TTL; a
// submission whose intentId already has an outstanding record returns the
// prior record rather than issuing a new order.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

const DEFAULT_TTL: Duration = Duration::from_secs(300);
/// Orders are bucketed to the minute so retries within the same minute
/// collapse onto the same intentId.
const TIME_BUCKET_MILLIS: i64 = 60_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderSide {
    Buy,
    Sell,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IntentRecord {
    pub intent_id: String,
    pub client_order_id: String,
    pub symbol: String,
    pub side: OrderSide,
    pub quantity: f64,
    pub price: f64,
    pub created_at_millis: i64,
    pub status: String,
    pub ttl_millis: i64,
}

/// Content-hash an order's identity fields into a stable intentId.
pub fn compute_intent_id(symbol: &str, side: OrderSide, quantity: f64, price: f64, timestamp_millis: i64) -> String {
    let price_rounded = (price * 100.0).round() / 100.0;
    let time_bucket = timestamp_millis / TIME_BUCKET_MILLIS;
    let side_tag = match side {
        OrderSide::Buy => "buy",
        OrderSide::Sell => "sell",
    };
    let mut hasher = Sha256::new();
    hasher.update(symbol.as_bytes());
    hasher.update(side_tag.as_bytes());
    hasher.update(quantity.to_bits().to_le_bytes());
    hasher.update(price_rounded.to_bits().to_le_bytes());
    hasher.update(time_bucket.to_le_bytes());
    hex::encode(hasher.finalize())
}

struct CacheEntry {
    record: IntentRecord,
    inserted_at: Instant,
}

pub struct IntentCache {
    ttl: Duration,
    entries: RwLock<HashMap<String, CacheEntry>>,
}

impl Default for IntentCache {
    fn default() -> Self {
        Self::new(DEFAULT_TTL)
    }
}

impl IntentCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: RwLock::new(HashMap::new()),
        }
    }

    /// Returns the existing record if `intent_id` has an outstanding entry
    /// within the TTL, otherwise inserts `record` and returns a clone of it.
    /// This is the sole gate that makes `submit(); submit();` within the TTL
    /// yield exactly one broker order.
    pub fn get_or_insert(&self, intent_id: &str, record_builder: impl FnOnce() -> IntentRecord) -> IntentRecord {
        self.evict_expired();
        let mut entries = self.entries.write();
        if let Some(existing) = entries.get(intent_id) {
            return existing.record.clone();
        }
        let record = record_builder();
        entries.insert(
            intent_id.to_string(),
            CacheEntry {
                record: record.clone(),
                inserted_at: Instant::now(),
            },
        );
        record
    }

    fn evict_expired(&self) {
        let mut entries = self.entries.write();
        entries.retain(|_, entry| entry.inserted_at.elapsed() < self.ttl);
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identical_orders_share_intent_id() {
        let a = compute_intent_id("BTC/USD", OrderSide::Buy, 0.5, 50123.456, 1_000_000);
        let b = compute_intent_id("BTC/USD", OrderSide::Buy, 0.5, 50123.456, 1_000_010);
        assert_eq!(a, b); // same minute bucket
    }

    #[test]
    fn different_minute_bucket_changes_intent_id() {
        let a = compute_intent_id("BTC/USD", OrderSide::Buy, 0.5, 50123.45, 0);
        let b = compute_intent_id("BTC/USD", OrderSide::Buy, 0.5, 50123.45, 120_000);
        assert_ne!(a, b);
    }

    #[test]
    fn duplicate_submission_returns_prior_record() {
        let cache = IntentCache::default();
        let intent_id = compute_intent_id("ETH/USD", OrderSide::Sell, 1.0, 3000.0, 0);
        let mut calls = 0;
        let mut submit = |cache: &IntentCache| {
            cache.get_or_insert(&intent_id, || {
                calls += 1;
                IntentRecord {
                    intent_id: intent_id.clone(),
                    client_order_id: format!("cid-{intent_id}"),
                    symbol: "ETH/USD".into(),
                    side: OrderSide::Sell,
                    quantity: 1.0,
                    price: 3000.0,
                    created_at_millis: 0,
                    status: "accepted".into(),
                    ttl_millis: 300_000,
                }
            })
        };
        let first = submit(&cache);
        let second = submit(&cache);
        assert_eq!(first.client_order_id, second.client_order_id);
        assert_eq!(cache.len(), 1);
    }
}

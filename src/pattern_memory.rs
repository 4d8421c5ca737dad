// =============================================================================
// Pattern Memory & Quality Scorer
// =============================================================================
//
// Learns, indexed by a quantized feature fingerprint, how historical
// patterns resolved and returns a composite score that modulates position
// sizing. Exit-only recording: `observe()` never carries PnL, only
// `record()` does, and `record()` is reachable exclusively from the
// position-close path — see the open-question decision in SPEC_FULL.md
// (the source's entry-time-only recording produced zero-PnL ghosts).

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

const MIN_SAMPLES_FOR_SCORE: u32 = 5;
const ELITE_MIN_SAMPLES: u32 = 10;
const ELITE_MIN_WIN_RATE: f64 = 0.65;
const ELITE_MIN_AVG_PNL_PCT: f64 = 1.5;
const SCORE_CACHE_TTL: Duration = Duration::from_secs(60);
const DEFAULT_MAX_RECORDS: usize = 50_000;

/// One realized exit result contributing to a [`PatternRecord`].
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct PatternResult {
    pub pnl_pct: f64,
    pub timestamp_millis: i64,
}

/// Historical outcome ledger for one feature-fingerprint key.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PatternRecord {
    pub times_seen: u32,
    pub wins: u32,
    pub losses: u32,
    pub total_pnl_pct: f64,
    pub results: Vec<PatternResult>,
}

impl PatternRecord {
    pub fn win_rate(&self) -> Option<f64> {
        let trades = self.wins + self.losses;
        if trades == 0 {
            None
        } else {
            Some(self.wins as f64 / trades as f64)
        }
    }

    pub fn avg_pnl_pct(&self) -> Option<f64> {
        let trades = self.wins + self.losses;
        if trades == 0 {
            None
        } else {
            Some(self.total_pnl_pct / trades as f64)
        }
    }
}

/// The nine quantized buckets that compose a pattern key, rendered as a
/// canonical comma-joined string. Distinct from human-readable pattern
/// names, which are ambiguous and collide.
#[derive(Debug, Clone, Copy)]
pub struct FeatureBuckets {
    pub rsi_bucket: u8,
    pub macd_bucket: i8,
    pub trend_sign: i8,
    pub volatility_bucket: u8,
    pub volume_ratio_bucket: u8,
    pub momentum_bucket: i8,
    pub price_position_bucket: u8,
    pub regime_tag: &'static str,
    pub direction: &'static str,
}

impl FeatureBuckets {
    pub fn key(&self) -> String {
        format!(
            "{},{},{},{},{},{},{},{},{}",
            self.rsi_bucket,
            self.macd_bucket,
            self.trend_sign,
            self.volatility_bucket,
            self.volume_ratio_bucket,
            self.momentum_bucket,
            self.price_position_bucket,
            self.regime_tag,
            self.direction
        )
    }
}

/// Bucket a raw RSI value into deciles [0, 10).
pub fn bucket_rsi(rsi: f64) -> u8 {
    ((rsi.clamp(0.0, 100.0) / 10.0) as u8).min(9)
}

/// Bucket a MACD histogram value into {-1, 0, +1}.
pub fn bucket_macd(histogram: f64) -> i8 {
    if histogram > 0.0 {
        1
    } else if histogram < 0.0 {
        -1
    } else {
        0
    }
}

/// Bucket volatility (ATR % of price) into {0: low, 1: mid, 2: high}.
pub fn bucket_volatility(volatility_pct: f64) -> u8 {
    if volatility_pct < 0.5 {
        0
    } else if volatility_pct < 3.0 {
        1
    } else {
        2
    }
}

/// Bucket volume ratio into {0: below avg, 1: near avg, 2: above avg}.
pub fn bucket_volume_ratio(ratio: f64) -> u8 {
    if ratio < 0.8 {
        0
    } else if ratio < 1.5 {
        1
    } else {
        2
    }
}

/// Bucket momentum into {-1, 0, +1}.
pub fn bucket_momentum(momentum: f64) -> i8 {
    if momentum > 0.005 {
        1
    } else if momentum < -0.005 {
        -1
    } else {
        0
    }
}

/// Bucket price position in [0,1] range into quintiles [0, 5).
pub fn bucket_price_position(position: f64) -> u8 {
    ((position.clamp(0.0, 1.0) * 5.0) as u8).min(4)
}

#[derive(Serialize, Deserialize, Default)]
struct PersistedStore {
    records: HashMap<String, PatternRecord>,
}

struct ScoreCacheEntry {
    value: Option<f64>,
    computed_at: Instant,
}

pub struct PatternMemory {
    path: PathBuf,
    max_records: usize,
    records: RwLock<HashMap<String, PatternRecord>>,
    score_cache: RwLock<HashMap<String, ScoreCacheEntry>>,
}

impl PatternMemory {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            max_records: DEFAULT_MAX_RECORDS,
            records: RwLock::new(HashMap::new()),
            score_cache: RwLock::new(HashMap::new()),
        }
    }

    pub fn load(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let records = if path.exists() {
            let raw = fs::read_to_string(&path)
                .with_context(|| format!("reading pattern memory at {}", path.display()))?;
            let parsed: PersistedStore = serde_json::from_str(&raw)
                .with_context(|| format!("parsing pattern memory at {}", path.display()))?;
            parsed.records
        } else {
            HashMap::new()
        };
        Ok(Self {
            path,
            max_records: DEFAULT_MAX_RECORDS,
            records: RwLock::new(records),
            score_cache: RwLock::new(HashMap::new()),
        })
    }

    /// Increment `timesSeen` with no PnL. Called when a pattern is
    /// evaluated, not when a trade is opened or closed.
    pub fn observe(&self, key: &str) {
        let mut records = self.records.write();
        records.entry(key.to_string()).or_default().times_seen += 1;
    }

    /// Record an exit outcome. The ONLY path that carries PnL into the
    /// store — never called from trade entry.
    pub fn record(&self, key: &str, pnl_pct: f64, timestamp_millis: i64) -> Result<()> {
        {
            let mut records = self.records.write();
            let record = records.entry(key.to_string()).or_default();
            record.results.push(PatternResult {
                pnl_pct,
                timestamp_millis,
            });
            if pnl_pct > 0.0 {
                record.wins += 1;
            } else {
                record.losses += 1;
            }
            record.total_pnl_pct += pnl_pct;
        }
        self.score_cache.write().remove(key);
        self.evict_if_over_cap();
        self.persist()
    }

    pub fn score(&self, key: &str) -> Option<f64> {
        if let Some(entry) = self.score_cache.read().get(key) {
            if entry.computed_at.elapsed() < SCORE_CACHE_TTL {
                return entry.value;
            }
        }
        let value = self.compute_score(key);
        self.score_cache.write().insert(
            key.to_string(),
            ScoreCacheEntry {
                value,
                computed_at: Instant::now(),
            },
        );
        value
    }

    fn compute_score(&self, key: &str) -> Option<f64> {
        let records = self.records.read();
        let record = records.get(key)?;
        if record.times_seen < MIN_SAMPLES_FOR_SCORE {
            return None;
        }
        let win_rate = record.win_rate()?;
        let avg_pnl = record.avg_pnl_pct()?;

        let win_component = if win_rate >= 0.7 {
            0.6
        } else if win_rate >= 0.6 {
            0.3
        } else if win_rate >= 0.5 {
            0.1
        } else if win_rate < 0.4 {
            -0.3
        } else {
            0.0
        };
        let pnl_component = if avg_pnl > 2.0 {
            0.4
        } else if avg_pnl > 1.0 {
            0.2
        } else if avg_pnl > 0.0 {
            0.1
        } else if avg_pnl < -1.0 {
            -0.2
        } else {
            0.0
        };

        Some((win_component + pnl_component).clamp(-1.0, 1.0))
    }

    /// Arithmetic mean of defined per-key scores, clamped to `[-1, 1]`.
    pub fn composite(&self, active_keys: &[String]) -> f64 {
        let scores: Vec<f64> = active_keys.iter().filter_map(|k| self.score(k)).collect();
        if scores.is_empty() {
            return 0.0;
        }
        let mean = scores.iter().sum::<f64>() / scores.len() as f64;
        mean.clamp(-1.0, 1.0)
    }

    /// Piecewise size multiplier from a composite score.
    pub fn size_multiplier(composite: f64) -> f64 {
        if composite <= -0.5 {
            0.25
        } else if composite <= 0.0 {
            0.5
        } else if composite <= 0.5 {
            1.0
        } else {
            1.5
        }
    }

    pub fn is_elite(&self, key: &str) -> bool {
        let records = self.records.read();
        let Some(record) = records.get(key) else {
            return false;
        };
        let win_rate = record.win_rate().unwrap_or(0.0);
        let avg_pnl = record.avg_pnl_pct().unwrap_or(0.0);
        record.times_seen >= ELITE_MIN_SAMPLES
            && win_rate >= ELITE_MIN_WIN_RATE
            && avg_pnl >= ELITE_MIN_AVG_PNL_PCT
    }

    fn evict_if_over_cap(&self) {
        let mut records = self.records.write();
        if records.len() <= self.max_records {
            return;
        }
        // Evict the least-seen keys first; the store never deletes a
        // record except under the configured size cap.
        let mut keys: Vec<(String, u32)> = records.iter().map(|(k, v)| (k.clone(), v.times_seen)).collect();
        keys.sort_by_key(|(_, seen)| *seen);
        let excess = records.len() - self.max_records;
        for (key, _) in keys.into_iter().take(excess) {
            records.remove(&key);
        }
        warn!(evicted = excess, "pattern memory over cap, evicted least-seen records");
    }

    /// Atomic write-to-temp + rename, matching the persistence pattern used
    /// throughout the rest of this crate.
    fn persist(&self) -> Result<()> {
        let records = self.records.read().clone();
        let store = PersistedStore { records };
        let json = serde_json::to_string_pretty(&store).context("serializing pattern memory")?;
        write_atomic(&self.path, &json)
    }
}

fn write_atomic(path: &Path, contents: &str) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).with_context(|| format!("creating directory {}", parent.display()))?;
    }
    let tmp_path = path.with_extension("json.tmp");
    fs::write(&tmp_path, contents).with_context(|| format!("writing {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path).with_context(|| format!("renaming into {}", path.display()))?;
    info!(path = %path.display(), "pattern memory persisted");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile_free::TempPath;

    mod tempfile_free {
        use std::path::PathBuf;
        use std::sync::atomic::{AtomicU64, Ordering};

        static COUNTER: AtomicU64 = AtomicU64::new(0);

        pub struct TempPath(pub PathBuf);

        impl TempPath {
            pub fn new(name: &str) -> Self {
                let n = COUNTER.fetch_add(1, Ordering::Relaxed);
                let mut path = std::env::temp_dir();
                path.push(format!("confluence-core-test-{name}-{n}.json"));
                Self(path)
            }
        }

        impl Drop for TempPath {
            fn drop(&mut self) {
                let _ = std::fs::remove_file(&self.0);
                let _ = std::fs::remove_file(self.0.with_extension("json.tmp"));
            }
        }
    }

    #[test]
    fn observe_does_not_record_pnl() {
        let tmp = TempPath::new("observe");
        let memory = PatternMemory::new(&tmp.0);
        memory.observe("k1");
        memory.observe("k1");
        assert_eq!(memory.records.read().get("k1").unwrap().times_seen, 2);
        assert_eq!(memory.records.read().get("k1").unwrap().wins, 0);
    }

    #[test]
    fn score_is_none_below_min_samples() {
        let tmp = TempPath::new("score-none");
        let memory = PatternMemory::new(&tmp.0);
        for _ in 0..4 {
            memory.record("k1", 1.0, 0).unwrap();
        }
        assert!(memory.score("k1").is_none());
    }

    #[test]
    fn score_reflects_strong_winrate_and_pnl() {
        let tmp = TempPath::new("score-strong");
        let memory = PatternMemory::new(&tmp.0);
        for _ in 0..9 {
            memory.record("k1", 2.5, 0).unwrap();
        }
        for _ in 0..3 {
            memory.record("k1", -1.0, 0).unwrap();
        }
        let score = memory.score("k1").unwrap();
        assert!(score > 0.5, "expected strong positive score, got {score}");
    }

    #[test]
    fn size_multiplier_is_piecewise() {
        assert_eq!(PatternMemory::size_multiplier(-0.9), 0.25);
        assert_eq!(PatternMemory::size_multiplier(-0.1), 0.5);
        assert_eq!(PatternMemory::size_multiplier(0.3), 1.0);
        assert_eq!(PatternMemory::size_multiplier(0.9), 1.5);
    }

    #[test]
    fn elite_requires_all_three_conditions() {
        let tmp = TempPath::new("elite");
        let memory = PatternMemory::new(&tmp.0);
        for _ in 0..9 {
            memory.record("k1", 2.0, 0).unwrap();
        }
        assert!(!memory.is_elite("k1")); // only 9 trades, needs >= 10
        memory.record("k1", 2.0, 0).unwrap();
        assert!(memory.is_elite("k1"));
    }

    #[test]
    fn persisted_store_round_trips() {
        let tmp = TempPath::new("roundtrip");
        {
            let memory = PatternMemory::new(&tmp.0);
            memory.record("k1", 3.0, 1000).unwrap();
            memory.record("k1", -1.0, 2000).unwrap();
        }
        let reloaded = PatternMemory::load(&tmp.0).unwrap();
        let record = reloaded.records.read().get("k1").cloned().unwrap();
        assert_eq!(record.wins, 1);
        assert_eq!(record.losses, 1);
    }

    #[test]
    fn feature_key_is_canonical_and_comma_joined() {
        let buckets = FeatureBuckets {
            rsi_bucket: 7,
            macd_bucket: 1,
            trend_sign: 1,
            volatility_bucket: 2,
            volume_ratio_bucket: 1,
            momentum_bucket: -1,
            price_position_bucket: 4,
            regime_tag: "trending_up",
            direction: "long",
        };
        assert_eq!(buckets.key(), "7,1,1,2,1,-1,4,trending_up,long");
    }
}

// =============================================================================
// Multi-Timeframe Aggregator
// =============================================================================
//
// Builds higher-timeframe candles from a 1m stream and maintains a per-TF
// indicator snapshot. Single writer (this struct), multi-reader via
// copy-on-read snapshots, so readers never block the single writer.

use std::collections::HashMap;
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result};
use parking_lot::RwLock;
use tracing::{debug, warn};

use crate::candle::{Candle, CandleSeries, Timeframe};
use crate::indicators::{self, IndicatorSnapshot};

/// External collaborator supplying historical bars for backfill. The
/// concrete upstream market-data provider is out of scope; this trait is
/// the seam.
pub trait CandleProvider: Send + Sync {
    fn fetch(&self, timeframe: Timeframe, lookback_days: u32) -> Result<Vec<Candle>>;
}

struct TimeframeState {
    series: CandleSeries,
    partial: Option<Candle>,
    snapshot: IndicatorSnapshot,
}

impl TimeframeState {
    fn new(tf: Timeframe) -> Self {
        Self {
            series: CandleSeries::new(tf.ring_capacity()),
            partial: None,
            snapshot: IndicatorSnapshot::default(),
        }
    }

    fn recompute(&mut self, tf: Timeframe) {
        self.snapshot = indicators::compute_snapshot(&self.series.as_vec(), tf.min_indicator_length());
    }
}

/// A point-in-time copy of one timeframe's derived view. Cheap to clone;
/// callers never see the live `CandleSeries`.
#[derive(Debug, Clone)]
pub struct TimeframeSnapshot {
    pub timeframe: Timeframe,
    pub candles: Vec<Candle>,
    pub indicators: IndicatorSnapshot,
}

/// Result of [`MultiTimeframeAggregator::confluence`].
#[derive(Debug, Clone, Default)]
pub struct Confluence {
    pub bias: i32,
    pub score: f64,
    pub confidence: f64,
    pub per_tf: Vec<(Timeframe, f64)>,
}

pub struct MultiTimeframeAggregator {
    states: RwLock<HashMap<Timeframe, TimeframeState>>,
    last_ingested_timestamp: RwLock<Option<i64>>,
}

impl Default for MultiTimeframeAggregator {
    fn default() -> Self {
        Self::new()
    }
}

impl MultiTimeframeAggregator {
    pub fn new() -> Self {
        let mut states = HashMap::new();
        for tf in Timeframe::NATIVE {
            states.insert(tf, TimeframeState::new(tf));
        }
        Self {
            states: RwLock::new(states),
            last_ingested_timestamp: RwLock::new(None),
        }
    }

    /// Ingest one closed 1m candle. Idempotent w.r.t. identical timestamps;
    /// out-of-order candles (earlier than the last ingested timestamp) are
    /// dropped with a warning.
    pub fn ingest(&self, candle1m: Candle) -> bool {
        if !candle1m.is_consistent() {
            warn!(ts = candle1m.timestamp_millis, "dropping malformed 1m candle");
            return false;
        }

        {
            let mut last = self.last_ingested_timestamp.write();
            match *last {
                Some(prev) if candle1m.timestamp_millis == prev => {
                    debug!(ts = candle1m.timestamp_millis, "duplicate 1m candle ignored");
                    return false;
                }
                Some(prev) if candle1m.timestamp_millis < prev => {
                    warn!(ts = candle1m.timestamp_millis, prev, "out-of-order 1m candle dropped");
                    return false;
                }
                _ => *last = Some(candle1m.timestamp_millis),
            }
        }

        let mut states = self.states.write();
        for tf in Timeframe::NATIVE {
            let period = match tf.period_millis() {
                Some(p) => p,
                None => continue, // calendar-aligned TFs are derived during backfill only
            };
            let window_start = (candle1m.timestamp_millis / period) * period;
            let state = states.get_mut(&tf).expect("all native TFs preallocated");

            match state.partial.take() {
                None => {
                    state.partial = Some(window_candle(candle1m, window_start));
                }
                Some(mut partial) if partial.timestamp_millis == window_start => {
                    merge_into(&mut partial, candle1m);
                    state.partial = Some(partial);
                }
                Some(partial) => {
                    state.series.push_committed(partial);
                    state.recompute(tf);
                    state.partial = Some(window_candle(candle1m, window_start));
                }
            }

            if tf == Timeframe::M1 {
                // The 1m series itself has no meaningful "partial" distinct
                // from the committed candle — commit immediately.
                if let Some(partial) = state.partial.take() {
                    state.series.push_committed(partial);
                    state.recompute(tf);
                }
            }
        }
        true
    }

    /// Blocking startup backfill. Fetches native resolutions directly from
    /// `provider`, then derives {5d, 1M, 3M, 6M} from daily bars and {4h}
    /// from hourly bars. A provider error fails only the affected
    /// timeframe; the system proceeds live-only for it.
    pub fn backfill(
        &self,
        provider: &dyn CandleProvider,
        lookback_days: u32,
        inter_request_delay: Duration,
    ) {
        let directly_fetched = [
            Timeframe::M1,
            Timeframe::M5,
            Timeframe::M15,
            Timeframe::M30,
            Timeframe::H1,
            Timeframe::D1,
        ];

        for tf in directly_fetched {
            match provider.fetch(tf, lookback_days).with_context(|| format!("backfill {tf}")) {
                Ok(bars) => self.seed(tf, bars),
                Err(err) => warn!(%tf, error = %err, "backfill failed for timeframe, continuing live-only"),
            }
            thread::sleep(inter_request_delay);
        }

        let daily = self.states.read().get(&Timeframe::D1).map(|s| s.series.as_vec());
        if let Some(daily) = daily {
            self.seed(Timeframe::D5, group_fixed(&daily, 5));
            self.seed(Timeframe::Mo1, group_calendar_months(&daily, 1));
            self.seed(Timeframe::Mo3, group_calendar_months(&daily, 3));
            self.seed(Timeframe::Mo6, group_calendar_months(&daily, 6));
        }

        let hourly = self.states.read().get(&Timeframe::H1).map(|s| s.series.as_vec());
        if let Some(hourly) = hourly {
            self.seed(Timeframe::H4, group_fixed(&hourly, 4));
        }
    }

    fn seed(&self, tf: Timeframe, bars: Vec<Candle>) {
        let mut states = self.states.write();
        let state = states.entry(tf).or_insert_with(|| TimeframeState::new(tf));
        for bar in bars {
            state.series.push_committed(bar);
        }
        state.recompute(tf);
    }

    pub fn snapshot(&self, tf: Timeframe) -> Option<TimeframeSnapshot> {
        let states = self.states.read();
        let state = states.get(&tf)?;
        Some(TimeframeSnapshot {
            timeframe: tf,
            candles: state.series.as_vec(),
            indicators: state.snapshot.clone(),
        })
    }

    /// Weighted multi-timeframe score. Higher timeframes (1h, 4h, 1d) carry
    /// the most weight; 1m carries the least.
    pub fn confluence(&self) -> Confluence {
        let states = self.states.read();
        let mut weighted_sum = 0.0;
        let mut weight_total = 0.0;
        let mut per_tf = Vec::new();

        for tf in Timeframe::NATIVE {
            let Some(state) = states.get(&tf) else { continue };
            let Some(strength) = state.snapshot.trend_strength else { continue };
            let sign = match state.snapshot.trend {
                Some(indicators::Trend::Bullish) => 1.0,
                Some(indicators::Trend::Bearish) => -1.0,
                _ => 0.0,
            };
            let signed = sign * strength;
            let weight = tf.confluence_weight();
            weighted_sum += signed * weight;
            weight_total += weight;
            per_tf.push((tf, signed));
        }

        if weight_total <= 0.0 {
            return Confluence::default();
        }
        let score = (weighted_sum / weight_total).clamp(-1.0, 1.0);
        Confluence {
            bias: score.signum() as i32,
            score,
            confidence: score.abs(),
            per_tf,
        }
    }
}

fn window_candle(source: Candle, window_start: i64) -> Candle {
    Candle {
        timestamp_millis: window_start,
        open: source.open,
        high: source.high,
        low: source.low,
        close: source.close,
        volume: source.volume,
        tick_count: source.tick_count,
    }
}

fn merge_into(partial: &mut Candle, next: Candle) {
    partial.high = partial.high.max(next.high);
    partial.low = partial.low.min(next.low);
    partial.close = next.close;
    partial.volume += next.volume;
    partial.tick_count += next.tick_count;
}

/// Group a series into fixed-size buckets of `n` source candles each.
fn group_fixed(source: &[Candle], n: usize) -> Vec<Candle> {
    if n == 0 {
        return Vec::new();
    }
    source
        .chunks(n)
        .filter(|chunk| !chunk.is_empty())
        .map(|chunk| aggregate_chunk(chunk))
        .collect()
}

/// Group daily bars into calendar-month buckets spanning `months` months
/// each. Approximated by day-of-30 boundaries since only day bars are
/// available here; exact calendar alignment is the provider's concern for
/// the raw daily series itself.
fn group_calendar_months(source: &[Candle], months: u32) -> Vec<Candle> {
    let bucket_days = (months as usize).max(1) * 30;
    group_fixed(source, bucket_days)
}

fn aggregate_chunk(chunk: &[Candle]) -> Candle {
    let first = chunk.first().expect("non-empty chunk");
    let last = chunk.last().expect("non-empty chunk");
    Candle {
        timestamp_millis: first.timestamp_millis,
        open: first.open,
        close: last.close,
        high: chunk.iter().map(|c| c.high).fold(f64::MIN, f64::max),
        low: chunk.iter().map(|c| c.low).fold(f64::MAX, f64::min),
        volume: chunk.iter().map(|c| c.volume).sum(),
        tick_count: chunk.iter().map(|c| c.tick_count).sum(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minute_candle(i: i64, close: f64) -> Candle {
        Candle {
            timestamp_millis: i * 60_000,
            open: close - 0.5,
            high: close + 1.0,
            low: close - 1.0,
            close,
            volume: 10.0,
            tick_count: 5,
        }
    }

    #[test]
    fn ingest_builds_5m_from_five_1m_candles() {
        let agg = MultiTimeframeAggregator::new();
        for i in 0..10 {
            agg.ingest(minute_candle(i, 100.0 + i as f64));
        }
        let snap = agg.snapshot(Timeframe::M5).unwrap();
        // first 5 candles committed once the 6th..10th push the window over;
        // exactly one 5m candle should have closed (indices 0..4).
        assert_eq!(snap.candles.len(), 1);
        assert_eq!(snap.candles[0].open, 99.5);
    }

    #[test]
    fn duplicate_ingest_is_a_no_op() {
        let agg = MultiTimeframeAggregator::new();
        agg.ingest(minute_candle(0, 100.0));
        let applied = agg.ingest(minute_candle(0, 100.0));
        assert!(!applied);
        let snap = agg.snapshot(Timeframe::M1).unwrap();
        assert_eq!(snap.candles.len(), 1);
    }

    #[test]
    fn out_of_order_candle_is_dropped() {
        let agg = MultiTimeframeAggregator::new();
        agg.ingest(minute_candle(5, 100.0));
        let applied = agg.ingest(minute_candle(3, 90.0));
        assert!(!applied);
    }

    #[test]
    fn m1_series_commits_every_candle() {
        let agg = MultiTimeframeAggregator::new();
        for i in 0..5 {
            agg.ingest(minute_candle(i, 100.0 + i as f64));
        }
        let snap = agg.snapshot(Timeframe::M1).unwrap();
        assert_eq!(snap.candles.len(), 5);
    }

    #[test]
    fn aggregation_is_faithful_to_component_bars() {
        let agg = MultiTimeframeAggregator::new();
        for i in 0..6 {
            agg.ingest(minute_candle(i, 100.0 + i as f64));
        }
        let snap = agg.snapshot(Timeframe::M5).unwrap();
        let committed = &snap.candles[0];
        assert_eq!(committed.open, 99.5); // first.open
        assert_eq!(committed.close, 104.0); // last.close of candles 0..4
        assert!((committed.volume - 50.0).abs() < 1e-9); // 5 * 10.0
    }

    #[test]
    fn confluence_defaults_to_zero_with_no_data() {
        let agg = MultiTimeframeAggregator::new();
        let confluence = agg.confluence();
        assert_eq!(confluence.bias, 0);
    }

    #[test]
    fn group_fixed_sums_volume_and_spans_range() {
        let bars: Vec<Candle> = (0..10).map(|i| minute_candle(i, 100.0 + i as f64)).collect();
        let grouped = group_fixed(&bars, 5);
        assert_eq!(grouped.len(), 2);
        assert!((grouped[0].volume - 50.0).abs() < 1e-9);
    }
}

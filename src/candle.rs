// =============================================================================
// Candle & Timeframe — shared market-data value types
// =============================================================================
//
// A Candle is an immutable OHLCV bar. Once committed to a CandleSeries it is
// never mutated; the Aggregator only ever appends new candles or updates the
// still-open partial candle at the tail of a series.
// =============================================================================

use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

/// One fixed-period OHLCV bar.
///
/// Invariant (checked by [`Candle::is_consistent`]):
/// `low <= min(open, close) <= max(open, close) <= high`, `volume >= 0`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Candle {
    pub timestamp_millis: i64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
    pub tick_count: u32,
}

impl Candle {
    pub fn is_consistent(&self) -> bool {
        self.volume >= 0.0
            && self.low <= self.open.min(self.close)
            && self.open.max(self.close) <= self.high
    }
}

/// A named aggregation period. Every variant except the calendar-aligned ones
/// has a fixed period in milliseconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Timeframe {
    M1,
    M5,
    M15,
    M30,
    H1,
    H4,
    D1,
    D5,
    Mo1,
    Mo3,
    Mo6,
    Ytd,
    All,
}

impl Timeframe {
    /// Every natively-aggregated timeframe (everything but YTD/ALL, which are
    /// derived views over the 1d series rather than independently maintained).
    pub const NATIVE: [Timeframe; 11] = [
        Timeframe::M1,
        Timeframe::M5,
        Timeframe::M15,
        Timeframe::M30,
        Timeframe::H1,
        Timeframe::H4,
        Timeframe::D1,
        Timeframe::D5,
        Timeframe::Mo1,
        Timeframe::Mo3,
        Timeframe::Mo6,
    ];

    /// Fixed period in milliseconds, or `None` for calendar-aligned /
    /// derived timeframes (1M, 3M, 6M align to calendar months; YTD/ALL have
    /// no fixed window at all).
    pub fn period_millis(self) -> Option<i64> {
        const MINUTE: i64 = 60_000;
        const HOUR: i64 = 60 * MINUTE;
        const DAY: i64 = 24 * HOUR;
        match self {
            Timeframe::M1 => Some(MINUTE),
            Timeframe::M5 => Some(5 * MINUTE),
            Timeframe::M15 => Some(15 * MINUTE),
            Timeframe::M30 => Some(30 * MINUTE),
            Timeframe::H1 => Some(HOUR),
            Timeframe::H4 => Some(4 * HOUR),
            Timeframe::D1 => Some(DAY),
            Timeframe::D5 => Some(5 * DAY),
            Timeframe::Mo1 | Timeframe::Mo3 | Timeframe::Mo6 | Timeframe::Ytd | Timeframe::All => {
                None
            }
        }
    }

    /// Ring-buffer capacity for this timeframe's series (per-TF cap named in
    /// the data model: 1440 for 1m, 720 for 1h, 365 for 1d, etc).
    pub fn ring_capacity(self) -> usize {
        match self {
            Timeframe::M1 => 1440,
            Timeframe::M5 => 1440,
            Timeframe::M15 => 960,
            Timeframe::M30 => 720,
            Timeframe::H1 => 720,
            Timeframe::H4 => 500,
            Timeframe::D1 => 365,
            Timeframe::D5 => 200,
            Timeframe::Mo1 => 120,
            Timeframe::Mo3 => 60,
            Timeframe::Mo6 => 40,
            Timeframe::Ytd | Timeframe::All => 365,
        }
    }

    /// Minimum series length before an [`crate::indicators`] snapshot is
    /// produced for this timeframe.
    pub fn min_indicator_length(self) -> usize {
        50
    }

    /// Relative weight this timeframe carries in the confluence score.
    /// Higher timeframes dominate; 1m carries the least.
    pub fn confluence_weight(self) -> f64 {
        match self {
            Timeframe::M1 => 0.02,
            Timeframe::M5 => 0.05,
            Timeframe::M15 => 0.08,
            Timeframe::M30 => 0.10,
            Timeframe::H1 => 0.20,
            Timeframe::H4 => 0.25,
            Timeframe::D1 => 0.20,
            Timeframe::D5 => 0.05,
            Timeframe::Mo1 => 0.03,
            Timeframe::Mo3 => 0.01,
            Timeframe::Mo6 => 0.01,
            Timeframe::Ytd | Timeframe::All => 0.0,
        }
    }
}

impl std::fmt::Display for Timeframe {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Timeframe::M1 => "1m",
            Timeframe::M5 => "5m",
            Timeframe::M15 => "15m",
            Timeframe::M30 => "30m",
            Timeframe::H1 => "1h",
            Timeframe::H4 => "4h",
            Timeframe::D1 => "1d",
            Timeframe::D5 => "5d",
            Timeframe::Mo1 => "1M",
            Timeframe::Mo3 => "3M",
            Timeframe::Mo6 => "6M",
            Timeframe::Ytd => "YTD",
            Timeframe::All => "ALL",
        };
        write!(f, "{s}")
    }
}

/// Ordered, length-bounded sequence of candles for one timeframe. Single
/// writer (the Aggregator); readers only ever see [`CandleSeries::snapshot`]
/// copies.
#[derive(Debug, Clone, Default)]
pub struct CandleSeries {
    candles: VecDeque<Candle>,
    capacity: usize,
}

impl CandleSeries {
    pub fn new(capacity: usize) -> Self {
        Self {
            candles: VecDeque::with_capacity(capacity.min(4096)),
            capacity,
        }
    }

    /// Push a freshly-committed candle, trimming the ring if over capacity.
    pub fn push_committed(&mut self, candle: Candle) {
        self.candles.push_back(candle);
        while self.candles.len() > self.capacity {
            self.candles.pop_front();
        }
    }

    pub fn last(&self) -> Option<&Candle> {
        self.candles.back()
    }

    pub fn len(&self) -> usize {
        self.candles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.candles.is_empty()
    }

    pub fn closes(&self) -> Vec<f64> {
        self.candles.iter().map(|c| c.close).collect()
    }

    pub fn as_vec(&self) -> Vec<Candle> {
        self.candles.iter().copied().collect()
    }

    pub fn last_n(&self, n: usize) -> Vec<Candle> {
        let len = self.candles.len();
        let start = len.saturating_sub(n);
        self.candles.iter().skip(start).copied().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn consistent_candle_passes() {
        let c = Candle {
            timestamp_millis: 0,
            open: 10.0,
            high: 12.0,
            low: 9.0,
            close: 11.0,
            volume: 5.0,
            tick_count: 3,
        };
        assert!(c.is_consistent());
    }

    #[test]
    fn inconsistent_candle_fails() {
        let c = Candle {
            timestamp_millis: 0,
            open: 10.0,
            high: 8.0, // high below open — invalid
            low: 9.0,
            close: 11.0,
            volume: 5.0,
            tick_count: 3,
        };
        assert!(!c.is_consistent());
    }

    #[test]
    fn ring_buffer_trims_to_capacity() {
        let mut series = CandleSeries::new(3);
        for i in 0..5 {
            series.push_committed(Candle {
                timestamp_millis: i * 60_000,
                open: i as f64,
                high: i as f64 + 1.0,
                low: i as f64,
                close: i as f64 + 0.5,
                volume: 1.0,
                tick_count: 1,
            });
        }
        assert_eq!(series.len(), 3);
        assert_eq!(series.last().unwrap().timestamp_millis, 4 * 60_000);
    }

    #[test]
    fn timeframe_periods_are_ordered() {
        assert_eq!(Timeframe::M1.period_millis(), Some(60_000));
        assert_eq!(Timeframe::H1.period_millis(), Some(3_600_000));
        assert_eq!(Timeframe::Mo1.period_millis(), None);
    }

    #[test]
    fn confluence_weights_favor_higher_timeframes() {
        assert!(Timeframe::H4.confluence_weight() > Timeframe::M1.confluence_weight());
        assert!(Timeframe::H1.confluence_weight() > Timeframe::M15.confluence_weight());
    }
}

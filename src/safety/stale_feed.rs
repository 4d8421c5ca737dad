// =============================================================================
// Stale-Feed Auto-Pause
// =============================================================================
//
// Tracks `lastCandleAt`. Warn when `now - lastCandleAt > 5s`; pause when
// `> 30s`. On recovery, require 2 consecutive fresh candles before the
// pause clears.

use std::time::{Duration, Instant};

use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FeedHealth {
    Fresh,
    Warn,
    Paused,
}

pub struct StaleFeedMonitor {
    warn_after: Duration,
    pause_after: Duration,
    required_fresh_to_clear: u32,
    last_candle_at: Option<Instant>,
    paused: bool,
    fresh_streak_since_pause: u32,
}

impl StaleFeedMonitor {
    pub fn new(warn_after: Duration, pause_after: Duration) -> Self {
        Self {
            warn_after,
            pause_after,
            required_fresh_to_clear: 2,
            last_candle_at: None,
            paused: false,
            fresh_streak_since_pause: 0,
        }
    }

    /// Call on every candle arrival. Returns whether the pause was cleared
    /// by this candle.
    pub fn on_candle(&mut self, now: Instant) -> bool {
        self.last_candle_at = Some(now);
        if self.paused {
            self.fresh_streak_since_pause += 1;
            if self.fresh_streak_since_pause >= self.required_fresh_to_clear {
                self.paused = false;
                self.fresh_streak_since_pause = 0;
                info!("stale feed recovered, pause cleared");
                return true;
            }
        }
        false
    }

    /// Call on a periodic health check tick (independent of candle arrival).
    pub fn check(&mut self, now: Instant) -> FeedHealth {
        let Some(last) = self.last_candle_at else {
            return FeedHealth::Fresh;
        };
        let elapsed = now.saturating_duration_since(last);
        if elapsed > self.pause_after {
            if !self.paused {
                self.paused = true;
                self.fresh_streak_since_pause = 0;
                warn!(elapsed_s = elapsed.as_secs(), "feed stale beyond pause threshold, pausing trading");
            }
            FeedHealth::Paused
        } else if elapsed > self.warn_after {
            warn!(elapsed_s = elapsed.as_secs(), "feed stale beyond warn threshold");
            FeedHealth::Warn
        } else {
            FeedHealth::Fresh
        }
    }

    pub fn is_paused(&self) -> bool {
        self.paused
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn no_candles_yet_is_fresh() {
        let mut monitor = StaleFeedMonitor::new(Duration::from_secs(5), Duration::from_secs(30));
        assert_eq!(monitor.check(Instant::now()), FeedHealth::Fresh);
    }

    #[test]
    fn warns_after_five_seconds() {
        let mut monitor = StaleFeedMonitor::new(Duration::from_secs(5), Duration::from_secs(30));
        let t0 = Instant::now();
        monitor.on_candle(t0);
        assert_eq!(monitor.check(t0 + Duration::from_secs(6)), FeedHealth::Warn);
    }

    #[test]
    fn pauses_after_thirty_seconds() {
        let mut monitor = StaleFeedMonitor::new(Duration::from_secs(5), Duration::from_secs(30));
        let t0 = Instant::now();
        monitor.on_candle(t0);
        assert_eq!(monitor.check(t0 + Duration::from_secs(35)), FeedHealth::Paused);
        assert!(monitor.is_paused());
    }

    #[test]
    fn requires_two_fresh_candles_to_clear_pause() {
        let mut monitor = StaleFeedMonitor::new(Duration::from_secs(5), Duration::from_secs(30));
        let t0 = Instant::now();
        monitor.on_candle(t0);
        monitor.check(t0 + Duration::from_secs(35));
        assert!(monitor.is_paused());

        let cleared_first = monitor.on_candle(t0 + Duration::from_secs(36));
        assert!(!cleared_first);
        assert!(monitor.is_paused());

        let cleared_second = monitor.on_candle(t0 + Duration::from_secs(37));
        assert!(cleared_second);
        assert!(!monitor.is_paused());
    }
}

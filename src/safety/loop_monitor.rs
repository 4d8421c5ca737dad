// =============================================================================
// Event-Loop Health Monitor
// =============================================================================
//
// Samples the time elapsed between scheduled ticks. Warns when lag exceeds
// 100ms; auto-pauses trading when lag exceeds 500ms. Maintains a rolling
// histogram exposed for diagnostics.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use tracing::warn;

const HISTOGRAM_CAPACITY: usize = 300;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopHealth {
    Healthy,
    Lagging,
    Stalled,
}

pub struct LoopMonitor {
    warn_threshold: Duration,
    pause_threshold: Duration,
    last_tick: Option<Instant>,
    lag_samples_millis: VecDeque<u64>,
}

impl LoopMonitor {
    pub fn new(warn_threshold: Duration, pause_threshold: Duration) -> Self {
        Self {
            warn_threshold,
            pause_threshold,
            last_tick: None,
            lag_samples_millis: VecDeque::with_capacity(HISTOGRAM_CAPACITY),
        }
    }

    /// Record a scheduled tick and return the observed health.
    pub fn tick(&mut self, now: Instant) -> LoopHealth {
        let health = match self.last_tick {
            None => LoopHealth::Healthy,
            Some(prev) => {
                let lag = now.saturating_duration_since(prev);
                self.record_lag(lag);
                if lag > self.pause_threshold {
                    warn!(lag_ms = lag.as_millis(), "event loop stalled — auto-pausing trading");
                    LoopHealth::Stalled
                } else if lag > self.warn_threshold {
                    warn!(lag_ms = lag.as_millis(), "event loop lagging");
                    LoopHealth::Lagging
                } else {
                    LoopHealth::Healthy
                }
            }
        };
        self.last_tick = Some(now);
        health
    }

    fn record_lag(&mut self, lag: Duration) {
        self.lag_samples_millis.push_back(lag.as_millis() as u64);
        if self.lag_samples_millis.len() > HISTOGRAM_CAPACITY {
            self.lag_samples_millis.pop_front();
        }
    }

    pub fn histogram(&self) -> Vec<u64> {
        self.lag_samples_millis.iter().copied().collect()
    }
}

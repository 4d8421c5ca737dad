// =============================================================================
// Error Handler / Circuit Breaker (per module)
// =============================================================================
//
// Keyed by module name: tracks {errorCount, lastError}. `reportCritical`
// increments and, once the count exceeds a configured threshold, opens the
// breaker. An OPEN breaker blocks further operations in that module until
// manual reset or a time-based half-open recovery window elapses.
// `reportWarning` only logs and updates `lastError`.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use parking_lot::RwLock;
use tracing::{error, warn};

#[derive(Debug, Clone)]
pub struct BreakerInfo {
    pub error_count: u32,
    pub last_error: Option<String>,
    pub open: bool,
    pub opened_at: Option<Instant>,
}

impl Default for BreakerInfo {
    fn default() -> Self {
        Self {
            error_count: 0,
            last_error: None,
            open: false,
            opened_at: None,
        }
    }
}

pub struct CircuitBreakerRegistry {
    threshold: u32,
    half_open_after: Duration,
    breakers: RwLock<HashMap<String, BreakerInfo>>,
}

impl CircuitBreakerRegistry {
    pub fn new(threshold: u32, half_open_after: Duration) -> Self {
        Self {
            threshold,
            half_open_after,
            breakers: RwLock::new(HashMap::new()),
        }
    }

    pub fn report_warning(&self, module: &str, err: &str) {
        let mut breakers = self.breakers.write();
        let entry = breakers.entry(module.to_string()).or_default();
        entry.last_error = Some(err.to_string());
        warn!(module, error = err, "module warning reported");
    }

    pub fn report_critical(&self, module: &str, err: &str) {
        let mut breakers = self.breakers.write();
        let entry = breakers.entry(module.to_string()).or_default();
        entry.error_count += 1;
        entry.last_error = Some(err.to_string());
        if entry.error_count > self.threshold && !entry.open {
            entry.open = true;
            entry.opened_at = Some(Instant::now());
            error!(module, error_count = entry.error_count, "circuit breaker OPEN");
        } else {
            error!(module, error_count = entry.error_count, error = err, "module critical error reported");
        }
    }

    /// `true` if the module's breaker currently blocks operations. A breaker
    /// past its half-open recovery window is treated as closed for this
    /// check but remains flagged `open` until `reset` is called explicitly.
    pub fn is_open(&self, module: &str) -> bool {
        let breakers = self.breakers.read();
        let Some(info) = breakers.get(module) else {
            return false;
        };
        if !info.open {
            return false;
        }
        match info.opened_at {
            Some(opened_at) => opened_at.elapsed() < self.half_open_after,
            None => true,
        }
    }

    pub fn reset(&self, module: &str) {
        if let Some(info) = self.breakers.write().get_mut(module) {
            info.error_count = 0;
            info.open = false;
            info.opened_at = None;
        }
    }

    pub fn info(&self, module: &str) -> Option<BreakerInfo> {
        self.breakers.read().get(module).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn breaker_opens_after_threshold_exceeded() {
        let registry = CircuitBreakerRegistry::new(3, Duration::from_secs(60));
        for _ in 0..3 {
            registry.report_critical("relay", "boom");
            assert!(!registry.is_open("relay"));
        }
        registry.report_critical("relay", "boom");
        assert!(registry.is_open("relay"));
    }

    #[test]
    fn warning_does_not_open_breaker() {
        let registry = CircuitBreakerRegistry::new(1, Duration::from_secs(60));
        for _ in 0..10 {
            registry.report_warning("feed", "minor hiccup");
        }
        assert!(!registry.is_open("feed"));
    }

    #[test]
    fn reset_closes_breaker() {
        let registry = CircuitBreakerRegistry::new(1, Duration::from_secs(60));
        registry.report_critical("broker", "a");
        registry.report_critical("broker", "b");
        assert!(registry.is_open("broker"));
        registry.reset("broker");
        assert!(!registry.is_open("broker"));
    }

    #[test]
    fn half_open_window_closes_after_elapsed() {
        let registry = CircuitBreakerRegistry::new(0, Duration::from_millis(10));
        registry.report_critical("fast", "a");
        assert!(registry.is_open("fast"));
        std::thread::sleep(Duration::from_millis(20));
        assert!(!registry.is_open("fast"));
    }
}

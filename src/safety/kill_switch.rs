// =============================================================================
// Kill Switch
// =============================================================================
//
// Durable file flag at a well-known path containing {activatedAt, reason,
// pid}. `is_on()` caches the filesystem check for 1s to avoid hammering.
// Activation writes the flag and appends an audit log line; deactivation
// deletes it and logs. Every order submission path consults this gate first.

use std::fs::{self, OpenOptions};
use std::io::Write as _;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{error, info};

const CACHE_TTL: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KillSwitchFlag {
    pub activated_at: i64,
    pub reason: String,
    pub pid: u32,
}

pub struct KillSwitch {
    flag_path: PathBuf,
    log_path: PathBuf,
    cached_state: AtomicBool,
    cached_at_millis: AtomicI64,
    write_lock: Mutex<()>,
}

impl KillSwitch {
    pub fn new(flag_path: impl Into<PathBuf>, log_path: impl Into<PathBuf>) -> Self {
        Self {
            flag_path: flag_path.into(),
            log_path: log_path.into(),
            cached_state: AtomicBool::new(false),
            cached_at_millis: AtomicI64::new(0),
            write_lock: Mutex::new(()),
        }
    }

    /// Cached for 1s; a fresh filesystem stat only happens once the cache
    /// expires.
    pub fn is_on(&self) -> bool {
        let now = now_millis();
        let cached_at = self.cached_at_millis.load(Ordering::Relaxed);
        if now - cached_at < CACHE_TTL.as_millis() as i64 {
            return self.cached_state.load(Ordering::Relaxed);
        }
        let on = self.flag_path.exists();
        self.cached_state.store(on, Ordering::Relaxed);
        self.cached_at_millis.store(now, Ordering::Relaxed);
        on
    }

    pub fn activate(&self, reason: &str) -> Result<()> {
        let _guard = self.write_lock.lock();
        let flag = KillSwitchFlag {
            activated_at: now_millis(),
            reason: reason.to_string(),
            pid: std::process::id(),
        };
        if let Some(parent) = self.flag_path.parent() {
            fs::create_dir_all(parent).with_context(|| format!("creating {}", parent.display()))?;
        }
        let json = serde_json::to_string_pretty(&flag).context("serializing kill switch flag")?;
        fs::write(&self.flag_path, json).with_context(|| format!("writing {}", self.flag_path.display()))?;
        self.append_audit_log(&format!("ACTIVATED reason={reason} pid={}", flag.pid))?;
        self.cached_state.store(true, Ordering::Relaxed);
        self.cached_at_millis.store(now_millis(), Ordering::Relaxed);
        error!(reason, "KILL SWITCH ACTIVATED — all order submission blocked");
        Ok(())
    }

    pub fn deactivate(&self) -> Result<()> {
        let _guard = self.write_lock.lock();
        match fs::remove_file(&self.flag_path) {
            Ok(()) => {}
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => return Err(err).context("removing kill switch flag"),
        }
        self.append_audit_log("DEACTIVATED")?;
        self.cached_state.store(false, Ordering::Relaxed);
        self.cached_at_millis.store(now_millis(), Ordering::Relaxed);
        info!("kill switch deactivated");
        Ok(())
    }

    pub fn current_flag(&self) -> Option<KillSwitchFlag> {
        let raw = fs::read_to_string(&self.flag_path).ok()?;
        serde_json::from_str(&raw).ok()
    }

    fn append_audit_log(&self, line: &str) -> Result<()> {
        if let Some(parent) = self.log_path.parent() {
            fs::create_dir_all(parent).with_context(|| format!("creating {}", parent.display()))?;
        }
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.log_path)
            .with_context(|| format!("opening {}", self.log_path.display()))?;
        writeln!(file, "{} {}", now_millis(), line).context("writing kill switch audit log")?;
        Ok(())
    }
}

fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU64, Ordering as AtOrdering};

    static COUNTER: AtomicU64 = AtomicU64::new(0);

    fn temp_paths(name: &str) -> (PathBuf, PathBuf) {
        let n = COUNTER.fetch_add(1, AtOrdering::Relaxed);
        let mut flag = std::env::temp_dir();
        flag.push(format!("confluence-core-ks-flag-{name}-{n}.json"));
        let mut log = std::env::temp_dir();
        log.push(format!("confluence-core-ks-log-{name}-{n}.log"));
        (flag, log)
    }

    #[test]
    fn default_is_off() {
        let (flag, log) = temp_paths("default");
        let ks = KillSwitch::new(flag, log);
        assert!(!ks.is_on());
    }

    #[test]
    fn activate_then_deactivate_restores_prior_answer() {
        let (flag, log) = temp_paths("roundtrip");
        let ks = KillSwitch::new(flag, log);
        assert!(!ks.is_on());
        ks.activate("manual test").unwrap();
        assert!(ks.is_on());
        ks.deactivate().unwrap();
        assert!(!ks.is_on());
    }

    #[test]
    fn current_flag_carries_reason_and_pid() {
        let (flag, log) = temp_paths("flag-contents");
        let ks = KillSwitch::new(flag, log);
        ks.activate("drawdown breach").unwrap();
        let current = ks.current_flag().unwrap();
        assert_eq!(current.reason, "drawdown breach");
        assert_eq!(current.pid, std::process::id());
    }
}

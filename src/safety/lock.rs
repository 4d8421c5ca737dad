// =============================================================================
// Singleton Lock
// =============================================================================
//
// File-based flag with the owning process PID recorded on acquisition,
// released on orderly shutdown. A second instance detecting a stale lock
// (owner PID no longer running) may reclaim it; otherwise it aborts.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use tracing::{info, warn};

pub struct InstanceLock {
    path: PathBuf,
}

impl InstanceLock {
    /// Acquire the lock at `path`, reclaiming it if the recorded owner PID
    /// is no longer alive.
    pub fn acquire(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).with_context(|| format!("creating {}", parent.display()))?;
        }

        if path.exists() {
            let contents = fs::read_to_string(&path).with_context(|| format!("reading {}", path.display()))?;
            let owner_pid: u32 = contents.trim().parse().unwrap_or(0);
            if owner_pid != 0 && process_is_alive(owner_pid) {
                bail!("another instance holds the lock (pid {owner_pid})");
            }
            warn!(stale_pid = owner_pid, "reclaiming stale instance lock");
        }

        let pid = std::process::id();
        fs::write(&path, pid.to_string()).with_context(|| format!("writing {}", path.display()))?;
        info!(pid, path = %path.display(), "instance lock acquired");
        Ok(Self { path })
    }

    pub fn release(&self) {
        if let Err(err) = fs::remove_file(&self.path) {
            if err.kind() != std::io::ErrorKind::NotFound {
                warn!(error = %err, "failed to release instance lock");
            }
        } else {
            info!(path = %self.path.display(), "instance lock released");
        }
    }
}

impl Drop for InstanceLock {
    fn drop(&mut self) {
        self.release();
    }
}

#[cfg(unix)]
fn process_is_alive(pid: u32) -> bool {
    // Signal 0 performs existence/permission checks without sending a signal.
    Path::new(&format!("/proc/{pid}")).exists()
}

#[cfg(not(unix))]
fn process_is_alive(_pid: u32) -> bool {
    // Conservative default off Unix: assume alive so we never steal a lock
    // we can't actually verify.
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU64, Ordering};

    static COUNTER: AtomicU64 = AtomicU64::new(0);

    fn temp_path(name: &str) -> PathBuf {
        let n = COUNTER.fetch_add(1, Ordering::Relaxed);
        let mut p = std::env::temp_dir();
        p.push(format!("confluence-core-lock-test-{name}-{n}.lock"));
        p
    }

    #[test]
    fn acquire_writes_current_pid() {
        let path = temp_path("acquire");
        let lock = InstanceLock::acquire(&path).unwrap();
        let contents = fs::read_to_string(&path).unwrap();
        assert_eq!(contents, std::process::id().to_string());
        drop(lock);
        assert!(!path.exists());
    }

    #[test]
    fn second_acquire_fails_while_owner_alive() {
        let path = temp_path("contend");
        let _lock = InstanceLock::acquire(&path).unwrap();
        assert!(InstanceLock::acquire(&path).is_err());
    }

    #[test]
    fn reclaims_stale_lock_from_dead_pid() {
        let path = temp_path("stale");
        fs::write(&path, "999999999").unwrap();
        let lock = InstanceLock::acquire(&path);
        assert!(lock.is_ok());
    }
}

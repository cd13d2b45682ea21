//! Advisory, timeout-bounded mutual exclusion over named resources.
//!
//! Each lock is a file under the lock directory holding a JSON record of the
//! holder's pid and acquisition time. Creation uses `O_EXCL`, so exactly one
//! process wins a contended acquire. A lock whose holder is dead, or whose
//! age exceeds the staleness threshold, is reclaimed rather than honored.
//!
//! Locks are not reentrant: a holder must not re-acquire the same resource.

use crate::config::Config;
use crate::error::{PipelineError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

/// Maximum jitter added to each poll, to keep contending processes from
/// polling in lockstep.
const POLL_JITTER_MS: u64 = 25;

// ---------------------------------------------------------------------------
// LockRecord
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockRecord {
    pub pid: u32,
    #[serde(rename = "acquiredAt")]
    pub acquired_at: DateTime<Utc>,
}

impl LockRecord {
    fn current() -> Self {
        Self {
            pid: std::process::id(),
            acquired_at: Utc::now(),
        }
    }

    /// A record is stale when its holder no longer exists or it has outlived
    /// the staleness threshold.
    fn is_stale(&self, stale_after: Duration) -> bool {
        if !pid_alive(self.pid) {
            return true;
        }
        let age = Utc::now()
            .signed_duration_since(self.acquired_at)
            .to_std()
            .unwrap_or(Duration::ZERO);
        age > stale_after
    }
}

// ---------------------------------------------------------------------------
// LockGuard
// ---------------------------------------------------------------------------

/// Held lock. Dropping the guard releases it; explicit [`LockGuard::release`]
/// is idempotent.
#[derive(Debug)]
pub struct LockGuard {
    path: PathBuf,
    released: bool,
}

impl LockGuard {
    pub fn release(&mut self) {
        if !self.released {
            if let Err(err) = std::fs::remove_file(&self.path) {
                if err.kind() != std::io::ErrorKind::NotFound {
                    tracing::warn!(lock = %self.path.display(), error = %err, "failed to release lock");
                }
            }
            self.released = true;
        }
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        self.release();
    }
}

// ---------------------------------------------------------------------------
// LockManager
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct LockManager {
    lock_dir: PathBuf,
    stale_after: Duration,
    poll_interval: Duration,
}

impl LockManager {
    pub fn new(config: &Config) -> Self {
        Self {
            lock_dir: config.lock_dir.clone(),
            stale_after: config.lock_stale_after,
            poll_interval: config.lock_poll_interval,
        }
    }

    pub fn lock_path(&self, resource: &str) -> PathBuf {
        self.lock_dir.join(format!("{resource}.lock"))
    }

    /// Acquire an exclusive lock on `resource`, waiting up to `timeout`.
    ///
    /// Contended acquires first check the existing holder: a stale lock is
    /// reclaimed and the acquire retried immediately; a live lock is polled
    /// with jitter until it frees up or the timeout elapses.
    pub fn acquire(&self, resource: &str, timeout: Duration) -> Result<LockGuard> {
        crate::io::ensure_dir(&self.lock_dir)?;
        let path = self.lock_path(resource);
        let started = Instant::now();

        loop {
            if self.try_create(&path)? {
                return Ok(LockGuard {
                    path,
                    released: false,
                });
            }
            if self.reclaim_if_stale(&path)? {
                continue;
            }
            if started.elapsed() >= timeout {
                return Err(PipelineError::LockTimeout {
                    resource: resource.to_string(),
                    waited_ms: u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
                });
            }
            let jitter = Duration::from_millis(rand::random::<u64>() % (POLL_JITTER_MS + 1));
            std::thread::sleep(self.poll_interval + jitter);
        }
    }

    /// Release `resource` if this process holds it. Releasing an unheld lock
    /// (or one held by another process) is a no-op; returns whether a lock
    /// was actually removed.
    pub fn release(&self, resource: &str) -> Result<bool> {
        let path = self.lock_path(resource);
        let raw = match std::fs::read_to_string(&path) {
            Ok(raw) => raw,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(false),
            Err(err) => return Err(err.into()),
        };
        let ours = serde_json::from_str::<LockRecord>(&raw)
            .map(|record| record.pid == std::process::id())
            .unwrap_or(false);
        if !ours {
            return Ok(false);
        }
        match std::fs::remove_file(&path) {
            Ok(()) => Ok(true),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(err) => Err(err.into()),
        }
    }

    /// Sweep the lock directory and reclaim every stale lock. Returns how
    /// many were removed. Used by error recovery after a lock timeout.
    pub fn reclaim_stale(&self) -> Result<usize> {
        if !self.lock_dir.exists() {
            return Ok(0);
        }
        let mut reclaimed = 0;
        for entry in std::fs::read_dir(&self.lock_dir)? {
            let entry = entry?;
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("lock") {
                continue;
            }
            if self.reclaim_if_stale(&path)? {
                reclaimed += 1;
            }
        }
        Ok(reclaimed)
    }

    /// Create the lock file exclusively. `Ok(false)` means another holder
    /// beat us to it.
    fn try_create(&self, path: &Path) -> Result<bool> {
        match OpenOptions::new().write(true).create_new(true).open(path) {
            Ok(mut file) => {
                let record = serde_json::to_string(&LockRecord::current())?;
                file.write_all(record.as_bytes())?;
                Ok(true)
            }
            Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => Ok(false),
            Err(err) => Err(err.into()),
        }
    }

    /// Remove the lock at `path` if its record is stale or unreadable.
    /// Returns whether the path is now free for an immediate retry.
    fn reclaim_if_stale(&self, path: &Path) -> Result<bool> {
        let record = match std::fs::read_to_string(path) {
            Ok(raw) => serde_json::from_str::<LockRecord>(&raw).ok(),
            // Holder released between our create attempt and this read.
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(true),
            Err(_) => None,
        };

        let stale = match record {
            Some(record) => record.is_stale(self.stale_after),
            // Unreadable record: the holder cannot be identified, so the lock
            // cannot be honored.
            None => true,
        };
        if !stale {
            return Ok(false);
        }

        tracing::warn!(lock = %path.display(), "reclaiming stale lock");
        match std::fs::remove_file(path) {
            Ok(()) => Ok(true),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(true),
            Err(err) => Err(err.into()),
        }
    }
}

// ---------------------------------------------------------------------------
// PID liveness
// ---------------------------------------------------------------------------

/// `kill(pid, 0)` checks for process existence without signaling. EPERM means
/// the process exists but belongs to someone else; that counts as alive.
#[cfg(unix)]
fn pid_alive(pid: u32) -> bool {
    let Ok(pid) = i32::try_from(pid) else {
        return false;
    };
    if pid <= 0 {
        return false;
    }
    // SAFETY: signal 0 performs only the existence check.
    let result = unsafe { libc::kill(pid, 0) };
    if result == 0 {
        return true;
    }
    std::io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
}

#[cfg(not(unix))]
fn pid_alive(_pid: u32) -> bool {
    // No portable liveness probe; assume alive and let the age threshold
    // handle staleness.
    true
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn manager(dir: &TempDir) -> LockManager {
        LockManager::new(&Config::new(dir.path()))
    }

    fn short_timeout() -> Duration {
        Duration::from_millis(250)
    }

    #[test]
    fn acquire_and_release() {
        let dir = TempDir::new().unwrap();
        let locks = manager(&dir);

        let mut guard = locks.acquire("state", short_timeout()).unwrap();
        assert!(locks.lock_path("state").exists());
        guard.release();
        assert!(!locks.lock_path("state").exists());
    }

    #[test]
    fn guard_release_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let locks = manager(&dir);

        let mut guard = locks.acquire("state", short_timeout()).unwrap();
        guard.release();
        guard.release();
        assert!(!locks.lock_path("state").exists());
    }

    #[test]
    fn release_unheld_lock_is_noop() {
        let dir = TempDir::new().unwrap();
        let locks = manager(&dir);
        assert!(!locks.release("state").unwrap());
    }

    #[test]
    fn release_ignores_foreign_lock() {
        let dir = TempDir::new().unwrap();
        let locks = manager(&dir);

        // A live lock held by a different (fake) process.
        crate::io::ensure_dir(&Config::new(dir.path()).lock_dir).unwrap();
        let record = serde_json::json!({"pid": 1, "acquiredAt": Utc::now()});
        std::fs::write(locks.lock_path("state"), record.to_string()).unwrap();

        assert!(!locks.release("state").unwrap());
        assert!(locks.lock_path("state").exists());
    }

    #[test]
    fn contended_acquire_times_out() {
        let dir = TempDir::new().unwrap();
        let locks = manager(&dir);

        let _guard = locks.acquire("state", short_timeout()).unwrap();
        // Same pid is alive, record is fresh: the second acquire must wait
        // out the full timeout and fail.
        let err = locks.acquire("state", short_timeout()).unwrap_err();
        assert!(matches!(err, PipelineError::LockTimeout { .. }));
        assert_eq!(err.code(), crate::error::ErrorCode::LockTimeout);
    }

    #[test]
    fn dead_holder_is_reclaimed() {
        let dir = TempDir::new().unwrap();
        let locks = manager(&dir);

        crate::io::ensure_dir(&Config::new(dir.path()).lock_dir).unwrap();
        // A pid outside the platform range is as dead as they come.
        let record = serde_json::json!({"pid": u32::MAX, "acquiredAt": Utc::now()});
        std::fs::write(locks.lock_path("state"), record.to_string()).unwrap();

        let guard = locks.acquire("state", short_timeout()).unwrap();
        drop(guard);
    }

    #[test]
    fn aged_out_lock_is_reclaimed() {
        let dir = TempDir::new().unwrap();
        let mut config = Config::new(dir.path());
        config.lock_stale_after = Duration::from_millis(50);
        let locks = LockManager::new(&config);

        crate::io::ensure_dir(&config.lock_dir).unwrap();
        // Held by our own (alive) pid, but past the staleness threshold.
        let record = serde_json::json!({
            "pid": std::process::id(),
            "acquiredAt": Utc::now() - chrono::Duration::seconds(60),
        });
        std::fs::write(locks.lock_path("state"), record.to_string()).unwrap();

        let guard = locks.acquire("state", short_timeout()).unwrap();
        drop(guard);
    }

    #[test]
    fn garbage_record_is_reclaimed() {
        let dir = TempDir::new().unwrap();
        let locks = manager(&dir);

        crate::io::ensure_dir(&Config::new(dir.path()).lock_dir).unwrap();
        std::fs::write(locks.lock_path("state"), b"not json at all").unwrap();

        let guard = locks.acquire("state", short_timeout()).unwrap();
        drop(guard);
    }

    #[test]
    fn reclaim_stale_sweeps_only_stale_locks() {
        let dir = TempDir::new().unwrap();
        let locks = manager(&dir);

        let _held = locks.acquire("state", short_timeout()).unwrap();
        crate::io::ensure_dir(&Config::new(dir.path()).lock_dir).unwrap();
        let dead = serde_json::json!({"pid": u32::MAX, "acquiredAt": Utc::now()});
        std::fs::write(locks.lock_path("worktree-state"), dead.to_string()).unwrap();

        assert_eq!(locks.reclaim_stale().unwrap(), 1);
        assert!(locks.lock_path("state").exists());
        assert!(!locks.lock_path("worktree-state").exists());
    }

    #[test]
    fn distinct_resources_do_not_contend() {
        let dir = TempDir::new().unwrap();
        let locks = manager(&dir);

        let _a = locks.acquire("state", short_timeout()).unwrap();
        let _b = locks.acquire("worktree-state", short_timeout()).unwrap();
    }
}

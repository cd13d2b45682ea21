use crate::error::Result;
use std::path::PathBuf;
use std::time::Duration;

// ---------------------------------------------------------------------------
// Layout constants
// ---------------------------------------------------------------------------

pub const CONTROL_DIR: &str = ".pipeline";
pub const STATE_FILE: &str = ".pipeline/state.json";
pub const BACKUP_DIR: &str = ".pipeline/backups";
pub const LOCK_DIR: &str = ".pipeline/locks";
pub const CHECKPOINT_DIR: &str = ".pipeline/checkpoints";
pub const SIGNAL_DIR: &str = ".pipeline/signals";
pub const WORKTREE_STATE_FILE: &str = ".pipeline/worktree-state.json";
pub const WORKTREE_BASE_DIR: &str = ".worktrees";

// ---------------------------------------------------------------------------
// Config
// ---------------------------------------------------------------------------

/// All paths and tunables in one place, constructed once and passed into each
/// component. Environment overrides are applied only in [`Config::from_env`]
/// so tests and library callers never touch ambient state.
#[derive(Debug, Clone)]
pub struct Config {
    /// Project root; also the git repository the worktree manager operates on.
    pub root: PathBuf,
    pub state_file: PathBuf,
    pub backup_dir: PathBuf,
    pub lock_dir: PathBuf,
    pub checkpoint_dir: PathBuf,
    pub signal_dir: PathBuf,
    pub worktree_base_dir: PathBuf,
    pub worktree_state_file: PathBuf,
    /// Locks older than this are reclaimable even if the holder looks alive.
    pub lock_stale_after: Duration,
    /// How long internal read-modify-write sections wait for the lock.
    pub lock_timeout: Duration,
    pub lock_poll_interval: Duration,
    /// Rotating backups kept per state file.
    pub backup_retention: usize,
    /// Default age cutoff for checkpoint cleanup.
    pub checkpoint_retention_days: i64,
}

impl Config {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        Self {
            state_file: root.join(STATE_FILE),
            backup_dir: root.join(BACKUP_DIR),
            lock_dir: root.join(LOCK_DIR),
            checkpoint_dir: root.join(CHECKPOINT_DIR),
            signal_dir: root.join(SIGNAL_DIR),
            worktree_base_dir: root.join(WORKTREE_BASE_DIR),
            worktree_state_file: root.join(WORKTREE_STATE_FILE),
            lock_stale_after: Duration::from_secs(300),
            lock_timeout: Duration::from_secs(10),
            lock_poll_interval: Duration::from_millis(100),
            backup_retention: 5,
            checkpoint_retention_days: 7,
            root,
        }
    }

    /// Like [`Config::new`], with the documented environment overrides
    /// applied: `STATE_FILE`, `BACKUP_DIR`, `LOCK_DIR`, `CHECKPOINT_DIR`,
    /// `SIGNAL_DIR`, `WORKTREE_BASE_DIR`, `WORKTREE_STATE_FILE`.
    pub fn from_env(root: impl Into<PathBuf>) -> Self {
        let mut config = Self::new(root);
        if let Some(p) = env_path("STATE_FILE") {
            config.state_file = p;
        }
        if let Some(p) = env_path("BACKUP_DIR") {
            config.backup_dir = p;
        }
        if let Some(p) = env_path("LOCK_DIR") {
            config.lock_dir = p;
        }
        if let Some(p) = env_path("CHECKPOINT_DIR") {
            config.checkpoint_dir = p;
        }
        if let Some(p) = env_path("SIGNAL_DIR") {
            config.signal_dir = p;
        }
        if let Some(p) = env_path("WORKTREE_BASE_DIR") {
            config.worktree_base_dir = p;
        }
        if let Some(p) = env_path("WORKTREE_STATE_FILE") {
            config.worktree_state_file = p;
        }
        config
    }

    /// Create the control directory tree. Idempotent.
    pub fn ensure_dirs(&self) -> Result<()> {
        for dir in [
            &self.backup_dir,
            &self.lock_dir,
            &self.checkpoint_dir,
            &self.signal_dir,
        ] {
            crate::io::ensure_dir(dir)?;
        }
        if let Some(parent) = self.state_file.parent() {
            crate::io::ensure_dir(parent)?;
        }
        if let Some(parent) = self.worktree_state_file.parent() {
            crate::io::ensure_dir(parent)?;
        }
        Ok(())
    }
}

fn env_path(key: &str) -> Option<PathBuf> {
    std::env::var_os(key)
        .filter(|v| !v.is_empty())
        .map(PathBuf::from)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

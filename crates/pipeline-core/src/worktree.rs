//! Lifecycle and isolation enforcement for per-phase/task git worktrees.
//!
//! Each worktree is an isolated working directory on its own branch, named
//! `phase-<n>-task-<n>`. The tracking registry is a JSON document guarded by
//! the `worktree-state` lock; git itself runs as an external binary and
//! executes synchronously while the registry lock is held, relying on git's
//! own locking for repository-level safety.

use crate::config::Config;
use crate::error::{PipelineError, Result};
use crate::lock::LockManager;
use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

/// Lock resource guarding the worktree registry.
pub const WORKTREE_LOCK: &str = "worktree-state";

// ---------------------------------------------------------------------------
// WorktreeStatus
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorktreeStatus {
    Active,
    InProgress,
    Completed,
    Merged,
    Removed,
}

impl WorktreeStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            WorktreeStatus::Active => "active",
            WorktreeStatus::InProgress => "in_progress",
            WorktreeStatus::Completed => "completed",
            WorktreeStatus::Merged => "merged",
            WorktreeStatus::Removed => "removed",
        }
    }

    /// Whether a worktree in this status may be removed without force.
    pub fn removable(self) -> bool {
        matches!(self, WorktreeStatus::Completed | WorktreeStatus::Merged)
    }
}

impl fmt::Display for WorktreeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for WorktreeStatus {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "active" => Ok(WorktreeStatus::Active),
            "in_progress" | "in-progress" => Ok(WorktreeStatus::InProgress),
            "completed" => Ok(WorktreeStatus::Completed),
            "merged" => Ok(WorktreeStatus::Merged),
            "removed" => Ok(WorktreeStatus::Removed),
            other => Err(PipelineError::InvalidWorktreeStatus(other.to_string())),
        }
    }
}

// ---------------------------------------------------------------------------
// Registry types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Worktree {
    pub status: WorktreeStatus,
    pub branch: String,
    pub path: PathBuf,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct NamedWorktree {
    pub name: String,
    #[serde(flatten)]
    pub worktree: Worktree,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WorktreeState {
    #[serde(default)]
    pub worktrees: BTreeMap<String, Worktree>,
    #[serde(
        default,
        rename = "activeWorktree",
        skip_serializing_if = "Option::is_none"
    )]
    pub active_worktree: Option<String>,
}

// ---------------------------------------------------------------------------
// Name validation
// ---------------------------------------------------------------------------

static NAME_RE: OnceLock<Regex> = OnceLock::new();

fn name_re() -> &'static Regex {
    NAME_RE.get_or_init(|| Regex::new(r"^phase-\d+-task-\d+$").unwrap())
}

pub fn worktree_name(phase: u32, task: u32) -> String {
    format!("phase-{phase}-task-{task}")
}

pub fn validate_name(name: &str) -> Result<()> {
    if !name_re().is_match(name) {
        return Err(PipelineError::InvalidWorktreeName(name.to_string()));
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// WorktreeManager
// ---------------------------------------------------------------------------

pub struct WorktreeManager {
    config: Config,
    locks: LockManager,
}

impl WorktreeManager {
    pub fn new(config: &Config) -> Self {
        Self {
            config: config.clone(),
            locks: LockManager::new(config),
        }
    }

    /// Create the worktree for a phase/task pair on its own branch and
    /// register it as `active`. Creating an already-registered name returns
    /// the recorded path; the registry never gains a second entry.
    pub fn create(&self, phase: u32, task: u32, from_ref: Option<&str>) -> Result<PathBuf> {
        let name = worktree_name(phase, task);
        validate_name(&name)?;

        let _guard = self.locks.acquire(WORKTREE_LOCK, self.config.lock_timeout)?;
        let mut state = self.load_state()?;
        if let Some(existing) = state.worktrees.get(&name) {
            return Ok(existing.path.clone());
        }

        crate::io::ensure_dir(&self.config.worktree_base_dir)?;
        let path = self.config.worktree_base_dir.join(&name);
        if path.exists() {
            // Directory survived a crashed run; re-register instead of
            // failing the whole phase.
            tracing::warn!(worktree = %name, "directory already present; re-registering");
        } else {
            let path_str = path.to_string_lossy().into_owned();
            let mut args = vec!["worktree", "add", "-b", name.as_str(), path_str.as_str()];
            if let Some(reference) = from_ref {
                args.push(reference);
            }
            git(&self.config.root, &args)?;
        }

        let now = Utc::now();
        state.worktrees.insert(
            name.clone(),
            Worktree {
                status: WorktreeStatus::Active,
                branch: name.clone(),
                path: path.clone(),
                created_at: now,
                updated_at: now,
            },
        );
        state.active_worktree = Some(name);
        self.save_state(&state)?;
        Ok(path)
    }

    /// Fail closed unless the current working directory is physically the
    /// worktree for this phase/task pair.
    ///
    /// The phase/task identity comes from the caller (usually environment
    /// variables), so this is a cooperative contract against accidental
    /// cross-worktree writes, not a security boundary.
    pub fn enforce_isolation(&self, phase: u32, task: u32) -> Result<PathBuf> {
        let cwd = std::env::current_dir().unwrap_or_default();
        self.enforce_isolation_at(phase, task, &cwd)
    }

    fn enforce_isolation_at(&self, phase: u32, task: u32, cwd: &Path) -> Result<PathBuf> {
        let name = worktree_name(phase, task);
        let expected = self.config.worktree_base_dir.join(&name);

        // Canonicalize both sides; any probe failure counts as a violation.
        let matches = match (expected.canonicalize(), cwd.canonicalize()) {
            (Ok(expected_real), Ok(cwd_real)) => expected_real == cwd_real,
            _ => false,
        };
        if matches {
            Ok(expected)
        } else {
            Err(PipelineError::IsolationViolation {
                expected: name,
                actual: cwd.display().to_string(),
            })
        }
    }

    /// Record a lifecycle transition for `name`.
    pub fn update_status(&self, name: &str, status: WorktreeStatus) -> Result<()> {
        validate_name(name)?;
        let _guard = self.locks.acquire(WORKTREE_LOCK, self.config.lock_timeout)?;
        let mut state = self.load_state()?;
        let entry = state
            .worktrees
            .get_mut(name)
            .ok_or_else(|| PipelineError::WorktreeNotFound(name.to_string()))?;
        entry.status = status;
        entry.updated_at = Utc::now();
        self.save_state(&state)
    }

    /// Merge the worktree's branch into `target_branch` inside the main
    /// repository. On conflict the merge is aborted, the pre-merge branch is
    /// checked out again, and the registry entry is left unchanged — the
    /// target tree comes back clean. On success the entry is marked `merged`
    /// and, with `delete_after`, removed entirely.
    pub fn merge(&self, name: &str, target_branch: &str, delete_after: bool) -> Result<()> {
        validate_name(name)?;
        let _guard = self.locks.acquire(WORKTREE_LOCK, self.config.lock_timeout)?;
        let mut state = self.load_state()?;
        let branch = state
            .worktrees
            .get(name)
            .ok_or_else(|| PipelineError::WorktreeNotFound(name.to_string()))?
            .branch
            .clone();

        let repo = self.config.root.clone();
        let previous = git(&repo, &["rev-parse", "--abbrev-ref", "HEAD"])?
            .trim()
            .to_string();
        git(&repo, &["checkout", target_branch])?;

        if let Err(err) = git(&repo, &["merge", "--no-ff", "--no-edit", &branch]) {
            let _ = git(&repo, &["merge", "--abort"]);
            let _ = git(&repo, &["checkout", &previous]);
            let conflicted = matches!(
                &err,
                PipelineError::Git { detail, .. } if detail.to_lowercase().contains("conflict")
            );
            return Err(if conflicted {
                PipelineError::MergeConflict {
                    branch,
                    target: target_branch.to_string(),
                }
            } else {
                err
            });
        }

        if let Some(entry) = state.worktrees.get_mut(name) {
            entry.status = WorktreeStatus::Merged;
            entry.updated_at = Utc::now();
        }
        self.save_state(&state)?;
        tracing::debug!(worktree = %name, target = %target_branch, "merged");

        if delete_after {
            self.remove_entry(&mut state, name, false)?;
            self.save_state(&state)?;
        }
        Ok(())
    }

    /// Remove one worktree: working directory, branch, and registry entry.
    /// Refuses unless the status is `completed` or `merged`, or `force`.
    pub fn cleanup(&self, name: &str, force: bool) -> Result<()> {
        validate_name(name)?;
        let _guard = self.locks.acquire(WORKTREE_LOCK, self.config.lock_timeout)?;
        let mut state = self.load_state()?;
        self.remove_entry(&mut state, name, force)?;
        self.save_state(&state)
    }

    /// Remove every worktree whose status is `completed` or `merged`.
    /// Returns the removed names; per-worktree git failures keep the entry
    /// and move on.
    pub fn cleanup_completed(&self) -> Result<Vec<String>> {
        let _guard = self.locks.acquire(WORKTREE_LOCK, self.config.lock_timeout)?;
        let mut state = self.load_state()?;
        let candidates: Vec<String> = state
            .worktrees
            .iter()
            .filter(|(_, w)| w.status.removable())
            .map(|(name, _)| name.clone())
            .collect();

        let mut removed = Vec::new();
        for name in candidates {
            match self.remove_entry(&mut state, &name, false) {
                Ok(()) => removed.push(name),
                Err(err) => {
                    tracing::warn!(worktree = %name, error = %err, "cleanup failed; keeping entry");
                }
            }
        }
        self.save_state(&state)?;
        Ok(removed)
    }

    /// Read-only enumeration, sorted by name.
    pub fn list(&self) -> Result<Vec<NamedWorktree>> {
        let state = self.load_state()?;
        Ok(state
            .worktrees
            .into_iter()
            .map(|(name, worktree)| NamedWorktree { name, worktree })
            .collect())
    }

    pub fn active_worktree(&self) -> Result<Option<String>> {
        Ok(self.load_state()?.active_worktree)
    }

    // -----------------------------------------------------------------------
    // Internals (caller holds the registry lock)
    // -----------------------------------------------------------------------

    fn remove_entry(&self, state: &mut WorktreeState, name: &str, force: bool) -> Result<()> {
        let entry = state
            .worktrees
            .get(name)
            .ok_or_else(|| PipelineError::WorktreeNotFound(name.to_string()))?
            .clone();
        if !force && !entry.status.removable() {
            return Err(PipelineError::WorktreeBusy {
                name: name.to_string(),
                status: entry.status.to_string(),
            });
        }

        let path_str = entry.path.to_string_lossy().into_owned();
        let mut args: Vec<&str> = vec!["worktree", "remove"];
        if force {
            args.push("--force");
        }
        args.push(&path_str);
        if let Err(err) = git(&self.config.root, &args) {
            if entry.path.exists() {
                return Err(err);
            }
            // Directory already gone; clear git's bookkeeping for it.
            let _ = git(&self.config.root, &["worktree", "prune"]);
        }
        if let Err(err) = git(&self.config.root, &["branch", "-D", &entry.branch]) {
            tracing::warn!(branch = %entry.branch, error = %err, "failed to delete branch");
        }

        state.worktrees.remove(name);
        if state.active_worktree.as_deref() == Some(name) {
            state.active_worktree = None;
        }
        tracing::debug!(worktree = %name, "removed");
        Ok(())
    }

    fn load_state(&self) -> Result<WorktreeState> {
        if !self.config.worktree_state_file.exists() {
            return Ok(WorktreeState::default());
        }
        let raw = std::fs::read_to_string(&self.config.worktree_state_file)?;
        serde_json::from_str(&raw)
            .map_err(|err| PipelineError::StateCorruption(format!("worktree state: {err}")))
    }

    fn save_state(&self, state: &WorktreeState) -> Result<()> {
        crate::io::atomic_write_json(&self.config.worktree_state_file, state)
    }
}

// ---------------------------------------------------------------------------
// Git
// ---------------------------------------------------------------------------

/// Run git in `dir`, capturing stdout. Failure carries stderr (and stdout,
/// where git reports there — merge conflicts do) as the detail.
fn git(dir: &Path, args: &[&str]) -> Result<String> {
    let output = std::process::Command::new("git")
        .args(args)
        .current_dir(dir)
        .output()
        .map_err(|err| {
            if err.kind() == std::io::ErrorKind::NotFound {
                PipelineError::DependencyMissing("git".to_string())
            } else {
                PipelineError::Io(err)
            }
        })?;

    if output.status.success() {
        return Ok(String::from_utf8_lossy(&output.stdout).into_owned());
    }
    let stderr = String::from_utf8_lossy(&output.stderr);
    let stdout = String::from_utf8_lossy(&output.stdout);
    let mut detail = stderr.trim().to_string();
    if detail.is_empty() {
        detail = stdout.trim().to_string();
    } else if !stdout.trim().is_empty() {
        detail.push_str("; ");
        detail.push_str(stdout.trim());
    }
    Err(PipelineError::Git {
        command: format!("git {}", args.join(" ")),
        detail,
    })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn init_repo(dir: &Path) {
        git(dir, &["init", "-b", "main"]).unwrap();
        git(dir, &["config", "user.email", "pipeline@test"]).unwrap();
        git(dir, &["config", "user.name", "Pipeline Test"]).unwrap();
        std::fs::write(dir.join(".gitignore"), ".pipeline/\n.worktrees/\n").unwrap();
        std::fs::write(dir.join("README.md"), "base\n").unwrap();
        git(dir, &["add", "."]).unwrap();
        git(dir, &["commit", "-m", "initial"]).unwrap();
    }

    fn commit_file(dir: &Path, name: &str, content: &str, message: &str) {
        std::fs::write(dir.join(name), content).unwrap();
        git(dir, &["add", name]).unwrap();
        git(dir, &["commit", "-m", message]).unwrap();
    }

    fn setup(dir: &TempDir) -> (Config, WorktreeManager) {
        init_repo(dir.path());
        let config = Config::new(dir.path());
        config.ensure_dirs().unwrap();
        let manager = WorktreeManager::new(&config);
        (config, manager)
    }

    #[test]
    fn name_validation() {
        for name in ["phase-1-task-1", "phase-12-task-0", "phase-0-task-99"] {
            validate_name(name).unwrap_or_else(|_| panic!("expected valid: {name}"));
        }
        for name in [
            "",
            "phase-1-task-",
            "phase--task-1",
            "phase-x-task-1",
            "phase-1-task-1-extra",
            "feature-1-task-1",
            "PHASE-1-TASK-1",
        ] {
            assert!(validate_name(name).is_err(), "expected invalid: {name}");
        }
    }

    #[test]
    fn create_registers_active_entry() {
        let dir = TempDir::new().unwrap();
        let (config, manager) = setup(&dir);

        let path = manager.create(1, 2, None).unwrap();
        assert_eq!(path, config.worktree_base_dir.join("phase-1-task-2"));
        assert!(path.join(".git").exists());

        let listed = manager.list().unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].name, "phase-1-task-2");
        assert_eq!(listed[0].worktree.status, WorktreeStatus::Active);
        assert_eq!(listed[0].worktree.branch, "phase-1-task-2");
        assert_eq!(
            manager.active_worktree().unwrap().as_deref(),
            Some("phase-1-task-2")
        );
    }

    #[test]
    fn duplicate_create_keeps_a_single_entry() {
        let dir = TempDir::new().unwrap();
        let (_config, manager) = setup(&dir);

        let first = manager.create(7, 1, None).unwrap();
        let second = manager.create(7, 1, None).unwrap();
        assert_eq!(first, second);

        let listed = manager.list().unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].name, "phase-7-task-1");
    }

    #[test]
    fn concurrent_creates_for_distinct_names_all_succeed() {
        let dir = TempDir::new().unwrap();
        let (config, _manager) = setup(&dir);

        let handles: Vec<_> = (1..=3u32)
            .map(|task| {
                let config = config.clone();
                std::thread::spawn(move || {
                    WorktreeManager::new(&config).create(5, task, None).unwrap()
                })
            })
            .collect();
        for handle in handles {
            let path = handle.join().unwrap();
            assert!(path.exists());
        }

        let manager = WorktreeManager::new(&config);
        assert_eq!(manager.list().unwrap().len(), 3);
    }

    #[test]
    fn registry_layout_matches_wire_format() {
        let dir = TempDir::new().unwrap();
        let (config, manager) = setup(&dir);
        manager.create(1, 1, None).unwrap();

        let raw = std::fs::read_to_string(&config.worktree_state_file).unwrap();
        let value: serde_json::Value = serde_json::from_str(&raw).unwrap();
        let entry = &value["worktrees"]["phase-1-task-1"];
        for key in ["status", "branch", "path", "created_at", "updated_at"] {
            assert!(entry.get(key).is_some(), "missing key {key}");
        }
        assert_eq!(value["activeWorktree"], "phase-1-task-1");
    }

    #[test]
    fn enforce_isolation_accepts_only_the_named_worktree() {
        let dir = TempDir::new().unwrap();
        let (_config, manager) = setup(&dir);

        let path = manager.create(3, 4, None).unwrap();
        manager.enforce_isolation_at(3, 4, &path).unwrap();

        // Repository root is not the worktree.
        let err = manager.enforce_isolation_at(3, 4, dir.path()).unwrap_err();
        assert!(matches!(err, PipelineError::IsolationViolation { .. }));
        assert_eq!(err.code(), crate::error::ErrorCode::AuthorizationError);

        // A worktree that does not exist fails closed.
        let err = manager.enforce_isolation_at(9, 9, &path).unwrap_err();
        assert!(matches!(err, PipelineError::IsolationViolation { .. }));
    }

    #[test]
    fn update_status_transitions() {
        let dir = TempDir::new().unwrap();
        let (_config, manager) = setup(&dir);

        manager.create(1, 1, None).unwrap();
        manager
            .update_status("phase-1-task-1", WorktreeStatus::InProgress)
            .unwrap();
        assert_eq!(
            manager.list().unwrap()[0].worktree.status,
            WorktreeStatus::InProgress
        );

        assert!(matches!(
            manager.update_status("phase-9-task-9", WorktreeStatus::Completed),
            Err(PipelineError::WorktreeNotFound(_))
        ));
    }

    #[test]
    fn merge_marks_entry_merged() {
        let dir = TempDir::new().unwrap();
        let (_config, manager) = setup(&dir);

        let path = manager.create(1, 1, None).unwrap();
        commit_file(&path, "feature.txt", "work\n", "add feature");

        manager.merge("phase-1-task-1", "main", false).unwrap();
        assert!(dir.path().join("feature.txt").exists());
        assert_eq!(
            manager.list().unwrap()[0].worktree.status,
            WorktreeStatus::Merged
        );
    }

    #[test]
    fn merge_conflict_aborts_and_leaves_target_clean() {
        let dir = TempDir::new().unwrap();
        let (_config, manager) = setup(&dir);

        let path = manager.create(2, 1, None).unwrap();
        commit_file(&path, "README.md", "worktree change\n", "worktree edit");
        commit_file(dir.path(), "README.md", "main change\n", "main edit");

        let err = manager.merge("phase-2-task-1", "main", false).unwrap_err();
        assert!(matches!(err, PipelineError::MergeConflict { .. }));

        // Target tree is clean and the entry is unchanged.
        let status = git(dir.path(), &["status", "--porcelain"]).unwrap();
        assert!(status.trim().is_empty(), "dirty tree: {status}");
        assert_eq!(
            std::fs::read_to_string(dir.path().join("README.md")).unwrap(),
            "main change\n"
        );
        assert_eq!(
            manager.list().unwrap()[0].worktree.status,
            WorktreeStatus::Active
        );
    }

    #[test]
    fn merge_with_delete_after_removes_everything() {
        let dir = TempDir::new().unwrap();
        let (_config, manager) = setup(&dir);

        let path = manager.create(1, 1, None).unwrap();
        commit_file(&path, "done.txt", "done\n", "finish task");

        manager.merge("phase-1-task-1", "main", true).unwrap();
        assert!(manager.list().unwrap().is_empty());
        assert!(!path.exists());
        // The branch is gone too.
        assert!(git(dir.path(), &["rev-parse", "--verify", "phase-1-task-1"]).is_err());
    }

    #[test]
    fn cleanup_refuses_busy_worktrees() {
        let dir = TempDir::new().unwrap();
        let (_config, manager) = setup(&dir);

        let path = manager.create(1, 1, None).unwrap();
        assert!(matches!(
            manager.cleanup("phase-1-task-1", false),
            Err(PipelineError::WorktreeBusy { .. })
        ));
        assert!(path.exists());

        manager.cleanup("phase-1-task-1", true).unwrap();
        assert!(manager.list().unwrap().is_empty());
        assert!(!path.exists());
    }

    #[test]
    fn cleanup_completed_sweeps_only_finished_worktrees() {
        let dir = TempDir::new().unwrap();
        let (_config, manager) = setup(&dir);

        manager.create(1, 1, None).unwrap();
        manager.create(1, 2, None).unwrap();
        manager
            .update_status("phase-1-task-1", WorktreeStatus::Completed)
            .unwrap();

        let removed = manager.cleanup_completed().unwrap();
        assert_eq!(removed, vec!["phase-1-task-1"]);

        let listed = manager.list().unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].name, "phase-1-task-2");
    }
}

//! Rotating, labeled copies of the state file.
//!
//! Backups are named `state-<timestamp>-<label>.json`. The timestamp is
//! fixed-width, so lexicographic order on the filename is chronological
//! order, independent of the label.

use crate::config::Config;
use crate::error::{PipelineError, Result};
use chrono::Utc;
use std::path::PathBuf;

const PREFIX: &str = "state-";
const SUFFIX: &str = ".json";

/// Labels go into filenames; collapse anything risky to `-`.
pub fn sanitize_label(label: &str) -> String {
    let cleaned: String = label
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c.to_ascii_lowercase()
            } else {
                '-'
            }
        })
        .collect();
    if cleaned.is_empty() {
        "backup".to_string()
    } else {
        cleaned
    }
}

/// Copy the current state file into the backup directory and prune beyond
/// the retention count.
pub fn create(config: &Config, label: &str) -> Result<PathBuf> {
    crate::io::ensure_dir(&config.backup_dir)?;
    let timestamp = Utc::now().format("%Y%m%dT%H%M%S%.6f");
    let name = format!("{PREFIX}{timestamp}-{}{SUFFIX}", sanitize_label(label));
    let path = config.backup_dir.join(name);
    std::fs::copy(&config.state_file, &path)?;
    prune(config)?;
    Ok(path)
}

/// All backups, newest first.
pub fn list(config: &Config) -> Result<Vec<PathBuf>> {
    if !config.backup_dir.exists() {
        return Ok(Vec::new());
    }
    let mut names: Vec<String> = Vec::new();
    for entry in std::fs::read_dir(&config.backup_dir)? {
        let entry = entry?;
        let name = entry.file_name().to_string_lossy().into_owned();
        if name.starts_with(PREFIX) && name.ends_with(SUFFIX) {
            names.push(name);
        }
    }
    names.sort();
    names.reverse();
    Ok(names
        .into_iter()
        .map(|name| config.backup_dir.join(name))
        .collect())
}

/// The newest backup carrying `label`.
pub fn find(config: &Config, label: &str) -> Result<PathBuf> {
    let suffix = format!("-{}{SUFFIX}", sanitize_label(label));
    list(config)?
        .into_iter()
        .find(|path| {
            path.file_name()
                .map(|name| name.to_string_lossy().ends_with(&suffix))
                .unwrap_or(false)
        })
        .ok_or_else(|| PipelineError::BackupNotFound(label.to_string()))
}

/// Remove everything beyond the retention count, oldest first. Returns how
/// many were removed.
pub fn prune(config: &Config) -> Result<usize> {
    let backups = list(config)?;
    let mut removed = 0;
    for old in backups.iter().skip(config.backup_retention) {
        std::fs::remove_file(old)?;
        removed += 1;
    }
    Ok(removed)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

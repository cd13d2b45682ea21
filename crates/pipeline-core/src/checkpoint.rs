//! Point-in-time snapshots of the state document, taken before risky
//! operations and restorable afterwards.
//!
//! Each checkpoint is a directory `<id>/` holding `state.json` (the
//! snapshot) and `metadata.json` (operation context). Ids embed the
//! operation name and a fixed-width timestamp, so ids sort chronologically.

use crate::config::Config;
use crate::error::{PipelineError, Result};
use crate::state::{StateDocument, StateStore};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub const SNAPSHOT_FILE: &str = "state.json";
pub const METADATA_FILE: &str = "metadata.json";

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckpointMeta {
    pub operation: String,
    pub phase: String,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pending_operations: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub restored_at: Option<DateTime<Utc>>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

#[derive(Debug, Clone, Serialize)]
pub struct CheckpointInfo {
    pub id: String,
    #[serde(flatten)]
    pub meta: CheckpointMeta,
}

// ---------------------------------------------------------------------------
// CheckpointManager
// ---------------------------------------------------------------------------

pub struct CheckpointManager {
    config: Config,
    store: StateStore,
}

impl CheckpointManager {
    pub fn new(config: &Config) -> Self {
        Self {
            config: config.clone(),
            store: StateStore::new(config),
        }
    }

    /// Snapshot the current state document under a fresh id.
    pub fn create(
        &self,
        operation: &str,
        pending_operations: Option<Vec<String>>,
        extra: serde_json::Map<String, serde_json::Value>,
    ) -> Result<String> {
        let doc = self.store.read()?;
        let now = Utc::now();
        let id = format!(
            "{}-{}",
            sanitize_operation(operation),
            now.format("%Y%m%dT%H%M%S%.6f")
        );
        let dir = self.config.checkpoint_dir.join(&id);
        crate::io::ensure_dir(&dir)?;
        crate::io::atomic_write_json(&dir.join(SNAPSHOT_FILE), &doc)?;

        let meta = CheckpointMeta {
            operation: operation.to_string(),
            phase: doc.phase.clone(),
            created_at: now,
            pending_operations,
            restored_at: None,
            extra,
        };
        crate::io::atomic_write_json(&dir.join(METADATA_FILE), &meta)?;
        tracing::debug!(id = %id, operation, "checkpoint created");
        Ok(id)
    }

    /// Overwrite the live state with the snapshot, with the same
    /// no-partial-write guarantee as a normal state write.
    pub fn restore(&self, id: &str) -> Result<StateDocument> {
        let dir = self.config.checkpoint_dir.join(id);
        if !dir.is_dir() {
            return Err(PipelineError::CheckpointNotFound(id.to_string()));
        }
        let raw = std::fs::read_to_string(dir.join(SNAPSHOT_FILE))?;
        let doc: StateDocument = serde_json::from_str(&raw).map_err(|err| {
            PipelineError::StateCorruption(format!("checkpoint '{id}' snapshot: {err}"))
        })?;
        self.store.write(&doc, &format!("pre-restore-{id}"))?;

        // Promote to "used": stamp restoredAt, best-effort.
        if let Ok(mut meta) = self.read_meta(id) {
            meta.restored_at = Some(Utc::now());
            if let Err(err) = crate::io::atomic_write_json(&dir.join(METADATA_FILE), &meta) {
                tracing::warn!(id = %id, error = %err, "failed to stamp restoredAt");
            }
        }
        tracing::debug!(id = %id, "checkpoint restored");
        Ok(doc)
    }

    /// All checkpoints, newest first. Directories with unreadable metadata
    /// are skipped with a warning.
    pub fn list(&self) -> Result<Vec<CheckpointInfo>> {
        if !self.config.checkpoint_dir.exists() {
            return Ok(Vec::new());
        }
        let mut infos = Vec::new();
        for entry in std::fs::read_dir(&self.config.checkpoint_dir)? {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            let id = entry.file_name().to_string_lossy().into_owned();
            match self.read_meta(&id) {
                Ok(meta) => infos.push(CheckpointInfo { id, meta }),
                Err(err) => {
                    tracing::warn!(id = %id, error = %err, "skipping unreadable checkpoint");
                }
            }
        }
        infos.sort_by(|a, b| b.meta.created_at.cmp(&a.meta.created_at));
        Ok(infos)
    }

    /// Age out checkpoints older than `retention_days`. The most recent
    /// checkpoint is never removed, whatever its age; nothing younger than
    /// the window is ever touched. Returns the removed ids.
    pub fn cleanup(&self, retention_days: i64) -> Result<Vec<String>> {
        let cutoff = Utc::now() - chrono::Duration::days(retention_days);
        let infos = self.list()?;

        let mut removed = Vec::new();
        for info in infos.iter().skip(1) {
            if info.meta.created_at >= cutoff {
                continue;
            }
            std::fs::remove_dir_all(self.config.checkpoint_dir.join(&info.id))?;
            tracing::debug!(id = %info.id, "checkpoint expired");
            removed.push(info.id.clone());
        }
        Ok(removed)
    }

    fn read_meta(&self, id: &str) -> Result<CheckpointMeta> {
        let raw =
            std::fs::read_to_string(self.config.checkpoint_dir.join(id).join(METADATA_FILE))?;
        serde_json::from_str(&raw).map_err(|err| {
            PipelineError::StateCorruption(format!("checkpoint '{id}' metadata: {err}"))
        })
    }
}

/// Operation names become directory-name prefixes.
fn sanitize_operation(operation: &str) -> String {
    let cleaned: String = operation
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
        "checkpoint".to_string()
    } else {
        cleaned
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

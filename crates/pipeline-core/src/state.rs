use crate::backup;
use crate::config::Config;
use crate::error::{PipelineError, Result};
use crate::lock::LockManager;
use crate::migrate;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;

pub const CURRENT_SCHEMA_VERSION: u32 = 2;
pub const DEFAULT_PHASE: &str = "pre-init";

/// Lock resource guarding the state file's read-modify-write sections.
pub const STATE_LOCK: &str = "state";

// ---------------------------------------------------------------------------
// Supporting types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DegradedMode {
    pub enabled: bool,
    pub reason: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub disabled_features: Vec<String>,
}

/// Handoff file dropped into the signal directory by external producers.
#[derive(Debug, Clone, Deserialize)]
pub struct SignalFile {
    pub signal: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub phase: Option<String>,
}

// ---------------------------------------------------------------------------
// StateDocument
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StateDocument {
    pub schema_version: u32,
    pub phase: String,
    pub completed_tasks: Vec<String>,
    pub signals: BTreeMap<String, DateTime<Utc>>,
    pub last_activation: Option<DateTime<Utc>>,
    pub last_signal: Option<String>,
    #[serde(default)]
    pub metadata: serde_json::Map<String, serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub degraded_mode: Option<DegradedMode>,
}

impl Default for StateDocument {
    fn default() -> Self {
        Self::new()
    }
}

impl StateDocument {
    pub fn new() -> Self {
        Self {
            schema_version: CURRENT_SCHEMA_VERSION,
            phase: DEFAULT_PHASE.to_string(),
            completed_tasks: Vec::new(),
            signals: BTreeMap::new(),
            last_activation: None,
            last_signal: None,
            metadata: serde_json::Map::new(),
            degraded_mode: None,
        }
    }

    /// Structural checks a typed document can still get wrong.
    pub fn validate(&self) -> Result<()> {
        if self.phase.trim().is_empty() {
            return Err(PipelineError::ValidationFailed(
                "phase must be a non-empty string".to_string(),
            ));
        }
        if self.schema_version == 0 || self.schema_version > CURRENT_SCHEMA_VERSION {
            return Err(PipelineError::ValidationFailed(format!(
                "schemaVersion {} is outside the supported range 1..={}",
                self.schema_version, CURRENT_SCHEMA_VERSION
            )));
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Mutations
    // -----------------------------------------------------------------------

    pub fn set_phase(&mut self, phase: &str) {
        self.phase = phase.to_string();
    }

    /// Append to the ordered task log; completing the same task twice keeps
    /// the original position.
    pub fn complete_task(&mut self, task: &str) {
        if !self.completed_tasks.iter().any(|t| t == task) {
            self.completed_tasks.push(task.to_string());
        }
    }

    pub fn record_signal(&mut self, name: &str, at: DateTime<Utc>) {
        self.signals.insert(name.to_string(), at);
        self.last_signal = Some(name.to_string());
    }

    pub fn record_activation(&mut self) {
        self.last_activation = Some(Utc::now());
    }

    pub fn enable_degraded_mode(&mut self, reason: &str, disabled_features: &[String]) {
        self.degraded_mode = Some(DegradedMode {
            enabled: true,
            reason: reason.to_string(),
            timestamp: Utc::now(),
            disabled_features: disabled_features.to_vec(),
        });
    }

    pub fn disable_degraded_mode(&mut self) {
        self.degraded_mode = None;
    }

    /// Pure query over the document.
    pub fn is_degraded(&self) -> bool {
        self.degraded_mode
            .as_ref()
            .map(|d| d.enabled)
            .unwrap_or(false)
    }
}

// ---------------------------------------------------------------------------
// Raw validation
// ---------------------------------------------------------------------------

/// Presence and JSON type of every required top-level field. A wrong
/// `schemaVersion` value is not checked here — version handling belongs to
/// the migration table.
pub fn validate_value(value: &serde_json::Value) -> Result<()> {
    let obj = value.as_object().ok_or_else(|| {
        PipelineError::ValidationFailed("state document is not a JSON object".to_string())
    })?;

    let mut problems: Vec<String> = Vec::new();
    match obj.get("phase") {
        Some(v) if v.is_string() => {}
        Some(_) => problems.push("phase is not a string".to_string()),
        None => problems.push("phase is missing".to_string()),
    }
    match obj.get("completedTasks") {
        Some(serde_json::Value::Array(items)) => {
            if items.iter().any(|i| !i.is_string()) {
                problems.push("completedTasks contains a non-string entry".to_string());
            }
        }
        Some(_) => problems.push("completedTasks is not an array".to_string()),
        None => problems.push("completedTasks is missing".to_string()),
    }
    match obj.get("signals") {
        Some(v) if v.is_object() => {}
        Some(_) => problems.push("signals is not an object".to_string()),
        None => problems.push("signals is missing".to_string()),
    }
    match obj.get("metadata") {
        Some(v) if v.is_object() => {}
        Some(_) => problems.push("metadata is not an object".to_string()),
        None => problems.push("metadata is missing".to_string()),
    }
    match obj.get("schemaVersion") {
        Some(v) if v.is_u64() => {}
        Some(_) => problems.push("schemaVersion is not a number".to_string()),
        None => problems.push("schemaVersion is missing".to_string()),
    }

    if problems.is_empty() {
        Ok(())
    } else {
        Err(PipelineError::ValidationFailed(problems.join("; ")))
    }
}

// ---------------------------------------------------------------------------
// StateStore
// ---------------------------------------------------------------------------

pub struct StateStore {
    config: Config,
    locks: LockManager,
}

impl StateStore {
    pub fn new(config: &Config) -> Self {
        Self {
            config: config.clone(),
            locks: LockManager::new(config),
        }
    }

    /// Read, validate, and (if needed) migrate the current document. A
    /// corrupt file triggers recovery from backups instead of surfacing
    /// malformed data. A missing file is the default document.
    pub fn read(&self) -> Result<StateDocument> {
        let _guard = self.locks.acquire(STATE_LOCK, self.config.lock_timeout)?;
        self.read_unlocked()
    }

    /// Validate and persist `doc`. A rejected document never touches the
    /// on-disk file. On success a rotating backup of the freshly written
    /// state is taken, best-effort.
    pub fn write(&self, doc: &StateDocument, label: &str) -> Result<()> {
        let _guard = self.locks.acquire(STATE_LOCK, self.config.lock_timeout)?;
        self.write_unlocked(doc, label)
    }

    /// The lock-protected read-modify-write every mutation goes through.
    pub fn update<F>(&self, label: &str, mutate: F) -> Result<StateDocument>
    where
        F: FnOnce(&mut StateDocument),
    {
        let _guard = self.locks.acquire(STATE_LOCK, self.config.lock_timeout)?;
        let mut doc = self.read_unlocked()?;
        mutate(&mut doc);
        self.write_unlocked(&doc, label)?;
        Ok(doc)
    }

    /// Write a labeled backup of the current state file.
    pub fn backup(&self, label: &str) -> Result<PathBuf> {
        let _guard = self.locks.acquire(STATE_LOCK, self.config.lock_timeout)?;
        if !self.config.state_file.exists() {
            return Err(PipelineError::ValidationFailed(
                "nothing to back up: state file does not exist".to_string(),
            ));
        }
        backup::create(&self.config, label)
    }

    /// Restore from backup. With a label, that backup must validate; without
    /// one, walk backups newest-first until one does, falling back to a
    /// fresh default document if none survive.
    pub fn recover(&self, label: Option<&str>) -> Result<StateDocument> {
        let _guard = self.locks.acquire(STATE_LOCK, self.config.lock_timeout)?;
        self.recover_unlocked(label)
    }

    // -----------------------------------------------------------------------
    // Convenience mutations
    // -----------------------------------------------------------------------

    pub fn set_phase(&self, phase: &str) -> Result<StateDocument> {
        self.update("phase", |doc| doc.set_phase(phase))
    }

    pub fn complete_task(&self, task: &str) -> Result<StateDocument> {
        self.update("task", |doc| doc.complete_task(task))
    }

    pub fn record_signal(&self, name: &str) -> Result<StateDocument> {
        self.update("signal", |doc| doc.record_signal(name, Utc::now()))
    }

    pub fn record_activation(&self) -> Result<StateDocument> {
        self.update("activation", |doc| doc.record_activation())
    }

    /// Consume signal files dropped by external producers, merging them into
    /// the document's signal map. Returns the ingested signal names, in
    /// filename order. Malformed files are skipped and left in place.
    pub fn ingest_signals(&self) -> Result<Vec<String>> {
        let _guard = self.locks.acquire(STATE_LOCK, self.config.lock_timeout)?;

        let mut files: Vec<PathBuf> = Vec::new();
        if self.config.signal_dir.exists() {
            for entry in std::fs::read_dir(&self.config.signal_dir)? {
                let path = entry?.path();
                if path.extension().and_then(|e| e.to_str()) == Some("json") {
                    files.push(path);
                }
            }
        }
        files.sort();

        let mut consumed: Vec<(PathBuf, SignalFile)> = Vec::new();
        for path in files {
            let parsed = std::fs::read_to_string(&path)
                .ok()
                .and_then(|raw| serde_json::from_str::<SignalFile>(&raw).ok());
            match parsed {
                Some(signal) => consumed.push((path, signal)),
                None => {
                    tracing::warn!(file = %path.display(), "skipping malformed signal file");
                }
            }
        }
        if consumed.is_empty() {
            return Ok(Vec::new());
        }

        let mut doc = self.read_unlocked()?;
        let mut names = Vec::new();
        for (_, signal) in &consumed {
            doc.signals.insert(signal.signal.clone(), signal.timestamp);
            doc.last_signal = Some(signal.signal.clone());
            names.push(signal.signal.clone());
        }
        self.write_unlocked(&doc, "signals")?;

        for (path, _) in consumed {
            if let Err(err) = std::fs::remove_file(&path) {
                tracing::warn!(file = %path.display(), error = %err, "failed to remove consumed signal file");
            }
        }
        Ok(names)
    }

    // -----------------------------------------------------------------------
    // Degraded mode
    // -----------------------------------------------------------------------

    pub fn enable_degraded_mode(&self, reason: &str, disabled_features: &[String]) -> Result<()> {
        self.update("degraded", |doc| {
            doc.enable_degraded_mode(reason, disabled_features)
        })?;
        Ok(())
    }

    pub fn disable_degraded_mode(&self) -> Result<()> {
        self.update("degraded", StateDocument::disable_degraded_mode)?;
        Ok(())
    }

    pub fn is_degraded_mode(&self) -> Result<bool> {
        Ok(self.read()?.is_degraded())
    }

    // -----------------------------------------------------------------------
    // Internals (caller holds the state lock)
    // -----------------------------------------------------------------------

    fn read_unlocked(&self) -> Result<StateDocument> {
        if !self.config.state_file.exists() {
            return Ok(StateDocument::new());
        }
        let raw = std::fs::read_to_string(&self.config.state_file)?;
        match Self::parse_document(&raw) {
            Ok(doc) => Ok(doc),
            // A document from a newer binary is not corruption; recovery
            // would clobber it.
            Err(err @ PipelineError::UnsupportedSchema { .. }) => Err(err),
            Err(err) => {
                tracing::warn!(error = %err, "state file invalid; recovering from backup");
                self.recover_unlocked(None)
            }
        }
    }

    fn write_unlocked(&self, doc: &StateDocument, label: &str) -> Result<()> {
        doc.validate()?;
        crate::io::atomic_write_json(&self.config.state_file, doc)?;
        if let Err(err) = backup::create(&self.config, label) {
            tracing::warn!(error = %err, "best-effort backup failed");
        }
        Ok(())
    }

    fn recover_unlocked(&self, label: Option<&str>) -> Result<StateDocument> {
        if let Some(label) = label {
            let path = backup::find(&self.config, label)?;
            let raw = std::fs::read_to_string(&path)?;
            let doc = Self::parse_document(&raw).map_err(|err| {
                PipelineError::StateCorruption(format!(
                    "backup '{label}' does not validate: {err}"
                ))
            })?;
            crate::io::atomic_write_json(&self.config.state_file, &doc)?;
            return Ok(doc);
        }

        for path in backup::list(&self.config)? {
            let Ok(raw) = std::fs::read_to_string(&path) else {
                continue;
            };
            match Self::parse_document(&raw) {
                Ok(doc) => {
                    tracing::warn!(backup = %path.display(), "state restored from backup");
                    crate::io::atomic_write_json(&self.config.state_file, &doc)?;
                    return Ok(doc);
                }
                Err(err) => {
                    tracing::warn!(backup = %path.display(), error = %err, "backup rejected during recovery");
                }
            }
        }

        tracing::warn!("no usable backup; synthesizing default state document");
        let doc = StateDocument::new();
        crate::io::atomic_write_json(&self.config.state_file, &doc)?;
        Ok(doc)
    }

    /// Parse raw file content into a validated, current-schema document.
    fn parse_document(raw: &str) -> Result<StateDocument> {
        let mut value: serde_json::Value = serde_json::from_str(raw)
            .map_err(|err| PipelineError::StateCorruption(err.to_string()))?;
        migrate::run(&mut value)?;
        validate_value(&value)?;
        serde_json::from_value(value)
            .map_err(|err| PipelineError::StateCorruption(err.to_string()))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn store(dir: &TempDir) -> StateStore {
        let config = Config::new(dir.path());
        config.ensure_dirs().unwrap();
        StateStore::new(&config)
    }

    #[test]
    fn first_read_returns_default_document() {
        let dir = TempDir::new().unwrap();
        let doc = store(&dir).read().unwrap();
        assert_eq!(doc.phase, DEFAULT_PHASE);
        assert_eq!(doc.schema_version, CURRENT_SCHEMA_VERSION);
        assert!(doc.completed_tasks.is_empty());
        assert!(!doc.is_degraded());
    }

    #[test]
    fn write_then_read_roundtrip() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);

        let mut doc = StateDocument::new();
        doc.set_phase("implementation");
        doc.complete_task("t1");
        doc.record_signal("phase-start", Utc::now());
        store.write(&doc, "test").unwrap();

        let loaded = store.read().unwrap();
        assert_eq!(loaded.phase, "implementation");
        assert_eq!(loaded.completed_tasks, vec!["t1"]);
        assert_eq!(loaded.last_signal.as_deref(), Some("phase-start"));
        assert!(loaded.signals.contains_key("phase-start"));
    }

    #[test]
    fn persisted_field_names_follow_the_wire_format() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        store.write(&StateDocument::new(), "test").unwrap();

        let raw = std::fs::read_to_string(dir.path().join(".pipeline/state.json")).unwrap();
        let value: serde_json::Value = serde_json::from_str(&raw).unwrap();
        for key in [
            "schemaVersion",
            "phase",
            "completedTasks",
            "signals",
            "lastActivation",
            "lastSignal",
            "metadata",
        ] {
            assert!(value.get(key).is_some(), "missing key {key}");
        }
    }

    #[test]
    fn invalid_write_leaves_file_byte_identical() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);

        let mut doc = StateDocument::new();
        doc.set_phase("p1");
        store.write(&doc, "good").unwrap();
        let before = std::fs::read(dir.path().join(".pipeline/state.json")).unwrap();

        doc.phase = String::new();
        let err = store.write(&doc, "bad").unwrap_err();
        assert!(matches!(err, PipelineError::ValidationFailed(_)));

        let after = std::fs::read(dir.path().join(".pipeline/state.json")).unwrap();
        assert_eq!(before, after);
    }

    #[test]
    fn corruption_recovers_from_backup() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);

        let mut doc = StateDocument::new();
        doc.set_phase("p1");
        store.write(&doc, "checkpointed").unwrap();

        // Garbage over the live file.
        std::fs::write(dir.path().join(".pipeline/state.json"), b"{garbage").unwrap();

        let recovered = store.recover(None).unwrap();
        assert_eq!(recovered.phase, "p1");
        assert_eq!(store.read().unwrap().phase, "p1");
    }

    #[test]
    fn corrupt_read_self_heals() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);

        let mut doc = StateDocument::new();
        doc.set_phase("p2");
        store.write(&doc, "test").unwrap();
        std::fs::write(dir.path().join(".pipeline/state.json"), b"\0\0\0").unwrap();

        // read() itself goes through recovery rather than surfacing garbage.
        assert_eq!(store.read().unwrap().phase, "p2");
    }

    #[test]
    fn recovery_without_backups_synthesizes_default() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);

        std::fs::write(dir.path().join(".pipeline/state.json"), b"not json").unwrap();
        let doc = store.read().unwrap();
        assert_eq!(doc.phase, DEFAULT_PHASE);
    }

    #[test]
    fn recovery_skips_invalid_backups() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);

        let mut doc = StateDocument::new();
        doc.set_phase("good");
        store.write(&doc, "good").unwrap();

        // A newer, corrupt backup shadows the good one lexicographically.
        std::fs::write(
            dir.path().join(".pipeline/backups/state-99999999T999999.999999-bad.json"),
            b"junk",
        )
        .unwrap();
        std::fs::write(dir.path().join(".pipeline/state.json"), b"junk").unwrap();

        assert_eq!(store.recover(None).unwrap().phase, "good");
    }

    #[test]
    fn recover_by_label() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);

        let mut doc = StateDocument::new();
        doc.set_phase("alpha");
        store.write(&doc, "alpha").unwrap();
        doc.set_phase("beta");
        store.write(&doc, "beta").unwrap();

        let restored = store.recover(Some("alpha")).unwrap();
        assert_eq!(restored.phase, "alpha");
        assert_eq!(store.read().unwrap().phase, "alpha");
    }

    #[test]
    fn legacy_document_migrates_on_read() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);

        std::fs::write(
            dir.path().join(".pipeline/state.json"),
            r#"{"phase": "implementation"}"#,
        )
        .unwrap();

        let doc = store.read().unwrap();
        assert_eq!(doc.phase, "implementation");
        assert_eq!(doc.schema_version, CURRENT_SCHEMA_VERSION);
        assert_eq!(doc.metadata.get("migratedFrom"), Some(&serde_json::json!(1)));
    }

    #[test]
    fn future_schema_is_not_clobbered() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);

        let raw = format!(
            r#"{{"schemaVersion": {}, "phase": "x", "completedTasks": [], "signals": {{}}, "metadata": {{}}}}"#,
            CURRENT_SCHEMA_VERSION + 1
        );
        std::fs::write(dir.path().join(".pipeline/state.json"), &raw).unwrap();

        let err = store.read().unwrap_err();
        assert!(matches!(err, PipelineError::UnsupportedSchema { .. }));
        // The file must still hold the future document.
        assert_eq!(
            std::fs::read_to_string(dir.path().join(".pipeline/state.json")).unwrap(),
            raw
        );
    }

    #[test]
    fn concurrent_writers_leave_a_single_intended_payload() {
        let dir = TempDir::new().unwrap();
        let config = Config::new(dir.path());
        config.ensure_dirs().unwrap();

        let handles: Vec<_> = (0..8)
            .map(|i| {
                let config = config.clone();
                std::thread::spawn(move || {
                    let store = StateStore::new(&config);
                    let mut doc = StateDocument::new();
                    doc.set_phase(&format!("writer-{i}"));
                    doc.complete_task(&format!("task-{i}"));
                    store.write(&doc, &format!("writer-{i}")).unwrap();
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        // The final file is one writer's payload in full, not an interleaving.
        let raw = std::fs::read_to_string(config.state_file).unwrap();
        let doc: StateDocument = serde_json::from_str(&raw).unwrap();
        let writer: usize = doc.phase.strip_prefix("writer-").unwrap().parse().unwrap();
        assert!(writer < 8);
        assert_eq!(doc.completed_tasks, vec![format!("task-{writer}")]);
    }

    #[test]
    fn complete_task_preserves_order_and_dedups() {
        let mut doc = StateDocument::new();
        doc.complete_task("a");
        doc.complete_task("b");
        doc.complete_task("a");
        assert_eq!(doc.completed_tasks, vec!["a", "b"]);
    }

    #[test]
    fn ingest_signals_consumes_files() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        let signal_dir = dir.path().join(".pipeline/signals");

        std::fs::write(
            signal_dir.join("001-build-done.json"),
            r#"{"signal": "build-done", "timestamp": "2026-08-06T10:00:00Z", "phase": "build"}"#,
        )
        .unwrap();
        std::fs::write(
            signal_dir.join("002-qa-start.json"),
            r#"{"signal": "qa-start", "timestamp": "2026-08-06T11:00:00Z"}"#,
        )
        .unwrap();
        std::fs::write(signal_dir.join("broken.json"), b"nope").unwrap();

        let ingested = store.ingest_signals().unwrap();
        assert_eq!(ingested, vec!["build-done", "qa-start"]);

        let doc = store.read().unwrap();
        assert!(doc.signals.contains_key("build-done"));
        assert!(doc.signals.contains_key("qa-start"));
        assert_eq!(doc.last_signal.as_deref(), Some("qa-start"));

        // Consumed files are gone; the malformed one is left for inspection.
        assert!(!signal_dir.join("001-build-done.json").exists());
        assert!(!signal_dir.join("002-qa-start.json").exists());
        assert!(signal_dir.join("broken.json").exists());
    }

    #[test]
    fn ingest_with_no_signals_is_a_noop() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        assert!(store.ingest_signals().unwrap().is_empty());
        // No state file was created as a side effect.
        assert!(!dir.path().join(".pipeline/state.json").exists());
    }

    #[test]
    fn degraded_mode_roundtrip() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);

        assert!(!store.is_degraded_mode().unwrap());
        store
            .enable_degraded_mode("disk errors", &["checkpoints".to_string()])
            .unwrap();
        assert!(store.is_degraded_mode().unwrap());

        let doc = store.read().unwrap();
        let degraded = doc.degraded_mode.as_ref().unwrap();
        assert_eq!(degraded.reason, "disk errors");
        assert_eq!(degraded.disabled_features, vec!["checkpoints"]);

        store.disable_degraded_mode().unwrap();
        assert!(!store.is_degraded_mode().unwrap());
        assert!(store.read().unwrap().degraded_mode.is_none());
    }

    #[test]
    fn validate_value_reports_missing_fields() {
        let err = validate_value(&serde_json::json!({"phase": 3})).unwrap_err();
        let message = err.to_string();
        assert!(message.contains("phase is not a string"));
        assert!(message.contains("completedTasks is missing"));
    }
}

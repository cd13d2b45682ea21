//! Versioned schema migrations for the state document.
//!
//! Migrations operate on raw JSON values so that documents too old to
//! deserialize into the current types can still be upgraded. Each step in
//! the table takes the document one version forward; `run` chains them.

use crate::error::{PipelineError, Result};
use crate::state::{CURRENT_SCHEMA_VERSION, DEFAULT_PHASE};
use serde_json::{json, Value};

/// Read the declared schema version. Documents that predate the
/// `schemaVersion` field are version 1.
pub fn schema_version(value: &Value) -> u32 {
    value
        .get("schemaVersion")
        .and_then(Value::as_u64)
        .and_then(|v| u32::try_from(v).ok())
        .unwrap_or(1)
}

pub fn needs_migration(value: &Value) -> bool {
    schema_version(value) < CURRENT_SCHEMA_VERSION
}

/// Upgrade `value` in place to the current schema version. Returns the
/// version the document started at. A document from the future is refused —
/// there is no downgrade path.
pub fn run(value: &mut Value) -> Result<u32> {
    let from = schema_version(value);
    if from > CURRENT_SCHEMA_VERSION {
        return Err(PipelineError::UnsupportedSchema {
            found: from,
            current: CURRENT_SCHEMA_VERSION,
        });
    }

    let mut version = from;
    while version < CURRENT_SCHEMA_VERSION {
        match version {
            1 => v1_to_v2(value)?,
            other => {
                return Err(PipelineError::ValidationFailed(format!(
                    "no migration path from schema version {other}"
                )))
            }
        }
        version += 1;
    }

    if from < CURRENT_SCHEMA_VERSION {
        if let Some(metadata) = value.get_mut("metadata").and_then(Value::as_object_mut) {
            metadata.insert("migratedFrom".to_string(), json!(from));
        }
        if let Some(obj) = value.as_object_mut() {
            obj.insert("schemaVersion".to_string(), json!(CURRENT_SCHEMA_VERSION));
        }
        tracing::debug!(from, to = CURRENT_SCHEMA_VERSION, "migrated state document");
    }
    Ok(from)
}

/// v1 documents tracked only `phase` and an ad hoc set of extra keys. v2
/// requires the full field set, so fill in whatever is missing.
fn v1_to_v2(value: &mut Value) -> Result<()> {
    let obj = value.as_object_mut().ok_or_else(|| {
        PipelineError::StateCorruption("state document is not a JSON object".to_string())
    })?;
    obj.entry("phase").or_insert_with(|| json!(DEFAULT_PHASE));
    obj.entry("completedTasks").or_insert_with(|| json!([]));
    obj.entry("signals").or_insert_with(|| json!({}));
    obj.entry("metadata").or_insert_with(|| json!({}));
    obj.entry("lastActivation").or_insert(Value::Null);
    obj.entry("lastSignal").or_insert(Value::Null);
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn legacy_document_upgrades_to_current() {
        let mut value = json!({"phase": "build"});
        let from = run(&mut value).unwrap();

        assert_eq!(from, 1);
        assert_eq!(schema_version(&value), CURRENT_SCHEMA_VERSION);
        assert_eq!(value["phase"], "build");
        assert_eq!(value["completedTasks"], json!([]));
        assert_eq!(value["signals"], json!({}));
        assert_eq!(value["metadata"]["migratedFrom"], 1);
    }

    #[test]
    fn migration_preserves_existing_fields() {
        let mut value = json!({
            "phase": "qa",
            "completedTasks": ["t1", "t2"],
            "extra": "kept",
        });
        run(&mut value).unwrap();
        assert_eq!(value["completedTasks"], json!(["t1", "t2"]));
        assert_eq!(value["extra"], "kept");
    }

    #[test]
    fn current_document_is_untouched() {
        let mut value = json!({
            "schemaVersion": CURRENT_SCHEMA_VERSION,
            "phase": "build",
            "completedTasks": [],
            "signals": {},
            "lastActivation": null,
            "lastSignal": null,
            "metadata": {},
        });
        let before = value.clone();
        let from = run(&mut value).unwrap();
        assert_eq!(from, CURRENT_SCHEMA_VERSION);
        assert_eq!(value, before);
        assert!(value["metadata"].get("migratedFrom").is_none());
    }

    #[test]
    fn future_schema_is_refused() {
        let mut value = json!({"schemaVersion": CURRENT_SCHEMA_VERSION + 1, "phase": "x"});
        let err = run(&mut value).unwrap_err();
        assert!(matches!(err, PipelineError::UnsupportedSchema { .. }));
    }

    #[test]
    fn non_object_document_is_corruption() {
        let mut value = json!([1, 2, 3]);
        let err = run(&mut value).unwrap_err();
        assert!(matches!(err, PipelineError::StateCorruption(_)));
    }
}

use crate::output::print_json;
use anyhow::Context;
use pipeline_core::state::StateStore;
use pipeline_core::Config;

pub fn run_backup(config: &Config, label: &str, json: bool) -> anyhow::Result<()> {
    let store = StateStore::new(config);
    let path = store
        .backup(label)
        .with_context(|| format!("failed to back up state as '{label}'"))?;

    if json {
        print_json(&serde_json::json!({ "backup": path }))?;
    } else {
        println!("Backed up state to {}", path.display());
    }
    Ok(())
}

pub fn run_recover(config: &Config, label: Option<&str>, json: bool) -> anyhow::Result<()> {
    let store = StateStore::new(config);
    let doc = store.recover(label).context("recovery failed")?;

    if json {
        print_json(&doc)?;
    } else {
        match label {
            Some(label) => println!("Restored backup '{}' (phase: {})", label, doc.phase),
            None => println!("Recovered state (phase: {})", doc.phase),
        }
    }
    Ok(())
}

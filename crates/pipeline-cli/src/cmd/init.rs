use crate::output::print_json;
use anyhow::Context;
use pipeline_core::state::{StateDocument, StateStore};
use pipeline_core::Config;

pub fn run(config: &Config, json: bool) -> anyhow::Result<()> {
    config
        .ensure_dirs()
        .context("failed to create control directories")?;

    let created = if config.state_file.exists() {
        false
    } else {
        let store = StateStore::new(config);
        store
            .write(&StateDocument::new(), "init")
            .context("failed to write initial state")?;
        true
    };

    if json {
        print_json(&serde_json::json!({
            "root": config.root,
            "state_file": config.state_file,
            "created": created,
        }))?;
    } else if created {
        println!("Initialized pipeline state in {}", config.root.display());
    } else {
        println!(
            "Pipeline state already present in {}",
            config.root.display()
        );
    }
    Ok(())
}

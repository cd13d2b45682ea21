use crate::output::print_json;
use anyhow::Context;
use clap::Subcommand;
use pipeline_core::lock::LockManager;
use pipeline_core::Config;

#[derive(Subcommand)]
pub enum LocksSubcommand {
    /// Release a named lock if this process holds it (no-op otherwise)
    Release { resource: String },
    /// Remove every lock whose holder is dead or past the staleness threshold
    ReclaimStale,
}

pub fn run(config: &Config, subcmd: LocksSubcommand, json: bool) -> anyhow::Result<()> {
    let locks = LockManager::new(config);

    match subcmd {
        LocksSubcommand::Release { resource } => {
            let released = locks
                .release(&resource)
                .with_context(|| format!("failed to release lock '{resource}'"))?;
            if json {
                print_json(&serde_json::json!({ "resource": resource, "released": released }))?;
            } else if released {
                println!("Released lock '{resource}'");
            } else {
                println!("Lock '{resource}' was not held by this process");
            }
            Ok(())
        }
        LocksSubcommand::ReclaimStale => {
            let reclaimed = locks
                .reclaim_stale()
                .context("failed to reclaim stale locks")?;
            if json {
                print_json(&serde_json::json!({ "reclaimed": reclaimed }))?;
            } else {
                println!("Reclaimed {reclaimed} stale lock(s)");
            }
            Ok(())
        }
    }
}

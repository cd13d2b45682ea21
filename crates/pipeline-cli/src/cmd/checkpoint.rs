use crate::output::{fmt_time, print_json, print_table};
use anyhow::Context;
use clap::Subcommand;
use pipeline_core::checkpoint::CheckpointManager;
use pipeline_core::Config;

#[derive(Subcommand)]
pub enum CheckpointSubcommand {
    /// Snapshot the current state before a risky operation
    Create {
        /// Name of the operation about to run
        operation: String,
        /// Operations still pending when the snapshot was taken
        #[arg(long = "pending")]
        pending: Vec<String>,
        /// Extra metadata as key=value pairs
        #[arg(long = "meta")]
        meta: Vec<String>,
    },
    /// Overwrite the live state with a snapshot
    Restore { id: String },
    /// List checkpoints, newest first
    List,
    /// Age out old checkpoints (the most recent always survives)
    Cleanup {
        #[arg(long)]
        retention_days: Option<i64>,
    },
}

pub fn run(config: &Config, subcmd: CheckpointSubcommand, json: bool) -> anyhow::Result<()> {
    let manager = CheckpointManager::new(config);

    match subcmd {
        CheckpointSubcommand::Create {
            operation,
            pending,
            meta,
        } => {
            let extra = parse_meta(&meta)?;
            let pending = if pending.is_empty() {
                None
            } else {
                Some(pending)
            };
            let id = manager
                .create(&operation, pending, extra)
                .with_context(|| format!("failed to checkpoint before '{operation}'"))?;
            if json {
                print_json(&serde_json::json!({ "id": id }))?;
            } else {
                println!("Created checkpoint {id}");
            }
            Ok(())
        }
        CheckpointSubcommand::Restore { id } => {
            let doc = manager
                .restore(&id)
                .with_context(|| format!("failed to restore checkpoint '{id}'"))?;
            if json {
                print_json(&doc)?;
            } else {
                println!("Restored checkpoint {} (phase: {})", id, doc.phase);
            }
            Ok(())
        }
        CheckpointSubcommand::List => {
            let checkpoints = manager.list().context("failed to list checkpoints")?;
            if json {
                return print_json(&checkpoints);
            }
            if checkpoints.is_empty() {
                println!("No checkpoints");
                return Ok(());
            }
            let rows: Vec<Vec<String>> = checkpoints
                .iter()
                .map(|c| {
                    vec![
                        c.id.clone(),
                        c.meta.operation.clone(),
                        c.meta.phase.clone(),
                        fmt_time(Some(c.meta.created_at)),
                        fmt_time(c.meta.restored_at),
                    ]
                })
                .collect();
            print_table(&["ID", "OPERATION", "PHASE", "CREATED", "RESTORED"], rows);
            Ok(())
        }
        CheckpointSubcommand::Cleanup { retention_days } => {
            let days = retention_days.unwrap_or(config.checkpoint_retention_days);
            let removed = manager
                .cleanup(days)
                .context("failed to clean up checkpoints")?;
            if json {
                print_json(&serde_json::json!({ "removed": removed }))?;
            } else {
                println!("Removed {} checkpoint(s)", removed.len());
            }
            Ok(())
        }
    }
}

fn parse_meta(pairs: &[String]) -> anyhow::Result<serde_json::Map<String, serde_json::Value>> {
    let mut map = serde_json::Map::new();
    for pair in pairs {
        let (key, value) = pair
            .split_once('=')
            .with_context(|| format!("--meta '{pair}' is not key=value"))?;
        map.insert(key.to_string(), serde_json::json!(value));
    }
    Ok(map)
}

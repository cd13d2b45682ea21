use crate::output::{fmt_time, print_json};
use anyhow::Context;
use clap::Subcommand;
use pipeline_core::state::StateStore;
use pipeline_core::Config;

#[derive(Subcommand)]
pub enum StateSubcommand {
    /// Show the current state document
    Show,
    /// Transition to a new phase
    SetPhase { phase: String },
    /// Append a task to the completed-task log
    CompleteTask { task: String },
    /// Record a named signal with the current timestamp
    RecordSignal { name: String },
    /// Consume signal files dropped by external producers
    IngestSignals,
    /// Stamp the last-activation timestamp
    Activate,
}

pub fn run(config: &Config, subcmd: StateSubcommand, json: bool) -> anyhow::Result<()> {
    let store = StateStore::new(config);

    match subcmd {
        StateSubcommand::Show => show(&store, json),
        StateSubcommand::SetPhase { phase } => {
            let doc = store
                .set_phase(&phase)
                .with_context(|| format!("failed to set phase '{phase}'"))?;
            if json {
                print_json(&doc)?;
            } else {
                println!("Phase set to '{}'", doc.phase);
            }
            Ok(())
        }
        StateSubcommand::CompleteTask { task } => {
            let doc = store
                .complete_task(&task)
                .with_context(|| format!("failed to complete task '{task}'"))?;
            if json {
                print_json(&doc)?;
            } else {
                println!(
                    "Completed task '{}' ({} total)",
                    task,
                    doc.completed_tasks.len()
                );
            }
            Ok(())
        }
        StateSubcommand::RecordSignal { name } => {
            let doc = store
                .record_signal(&name)
                .with_context(|| format!("failed to record signal '{name}'"))?;
            if json {
                print_json(&doc)?;
            } else {
                println!("Recorded signal '{name}'");
            }
            Ok(())
        }
        StateSubcommand::IngestSignals => {
            let ingested = store.ingest_signals().context("failed to ingest signals")?;
            if json {
                print_json(&serde_json::json!({ "ingested": ingested }))?;
            } else if ingested.is_empty() {
                println!("No signal files to ingest");
            } else {
                println!("Ingested {} signal(s): {}", ingested.len(), ingested.join(", "));
            }
            Ok(())
        }
        StateSubcommand::Activate => {
            let doc = store
                .record_activation()
                .context("failed to record activation")?;
            if json {
                print_json(&doc)?;
            } else {
                println!("Activation recorded at {}", fmt_time(doc.last_activation));
            }
            Ok(())
        }
    }
}

fn show(store: &StateStore, json: bool) -> anyhow::Result<()> {
    let doc = store.read().context("failed to read state")?;

    if json {
        return print_json(&doc);
    }

    println!("Phase: {}", doc.phase);
    println!("Schema version: {}", doc.schema_version);
    println!("Completed tasks: {}", doc.completed_tasks.len());
    match &doc.last_signal {
        Some(last) => println!("Signals: {} (last: {})", doc.signals.len(), last),
        None => println!("Signals: {}", doc.signals.len()),
    }
    println!("Last activation: {}", fmt_time(doc.last_activation));
    match &doc.degraded_mode {
        Some(degraded) if degraded.enabled => {
            println!(
                "Degraded: yes — {} (disabled: {})",
                degraded.reason,
                degraded.disabled_features.join(", ")
            );
        }
        _ => println!("Degraded: no"),
    }
    Ok(())
}

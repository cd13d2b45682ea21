use crate::output::{fmt_time, print_json, print_table};
use anyhow::Context;
use pipeline_core::checkpoint::CheckpointManager;
use pipeline_core::state::StateStore;
use pipeline_core::worktree::WorktreeManager;
use pipeline_core::Config;

/// Read-only, one-screen view over all three stores — the CLI rendering of
/// what the monitoring surface shows.
pub fn run(config: &Config, json: bool) -> anyhow::Result<()> {
    let doc = StateStore::new(config)
        .read()
        .context("failed to read state")?;
    let checkpoints = CheckpointManager::new(config)
        .list()
        .context("failed to list checkpoints")?;
    let worktrees = WorktreeManager::new(config)
        .list()
        .unwrap_or_default();

    if json {
        #[derive(serde::Serialize)]
        struct StatusOutput<'a> {
            state: &'a pipeline_core::state::StateDocument,
            checkpoints: &'a [pipeline_core::checkpoint::CheckpointInfo],
            worktrees: &'a [pipeline_core::worktree::NamedWorktree],
        }
        return print_json(&StatusOutput {
            state: &doc,
            checkpoints: &checkpoints,
            worktrees: &worktrees,
        });
    }

    let degraded = if doc.is_degraded() { "yes" } else { "no" };
    println!("Phase: {} (degraded: {})", doc.phase, degraded);
    println!("Completed tasks: {}", doc.completed_tasks.len());
    match &doc.last_signal {
        Some(last) => println!("Signals: {} (last: {})", doc.signals.len(), last),
        None => println!("Signals: {}", doc.signals.len()),
    }
    match checkpoints.first() {
        Some(latest) => println!("Checkpoints: {} (latest: {})", checkpoints.len(), latest.id),
        None => println!("Checkpoints: 0"),
    }

    if worktrees.is_empty() {
        println!("Worktrees: 0");
    } else {
        println!("\nWorktrees:");
        let rows: Vec<Vec<String>> = worktrees
            .iter()
            .map(|w| {
                vec![
                    w.name.clone(),
                    w.worktree.status.to_string(),
                    w.worktree.branch.clone(),
                    fmt_time(Some(w.worktree.updated_at)),
                ]
            })
            .collect();
        print_table(&["NAME", "STATUS", "BRANCH", "UPDATED"], rows);
    }
    Ok(())
}

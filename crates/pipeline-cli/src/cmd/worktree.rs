use crate::output::{fmt_time, print_json, print_table};
use anyhow::Context;
use clap::Subcommand;
use pipeline_core::worktree::{WorktreeManager, WorktreeStatus};
use pipeline_core::Config;

#[derive(Subcommand)]
pub enum WorktreeSubcommand {
    /// Create an isolated worktree and branch for a phase/task pair
    Create {
        phase: u32,
        task: u32,
        /// Ref to branch from (default: current HEAD)
        #[arg(long)]
        from: Option<String>,
    },
    /// List tracked worktrees
    List,
    /// Record a lifecycle transition (active, in_progress, completed, merged)
    Status {
        name: String,
        status: WorktreeStatus,
    },
    /// Merge a worktree's branch into the target branch
    Merge {
        name: String,
        #[arg(long, default_value = "main")]
        target: String,
        /// Remove the worktree after a successful merge
        #[arg(long)]
        delete: bool,
    },
    /// Remove one worktree (refuses unless completed/merged, or --force)
    Cleanup {
        name: String,
        #[arg(long)]
        force: bool,
    },
    /// Remove every completed or merged worktree
    CleanupCompleted,
    /// Fail unless the current directory is the worktree for this phase/task
    Enforce {
        #[arg(long, env = "CLAUDE_CURRENT_PHASE")]
        phase: u32,
        #[arg(long, env = "CLAUDE_CURRENT_TASK")]
        task: u32,
    },
}

pub fn run(config: &Config, subcmd: WorktreeSubcommand, json: bool) -> anyhow::Result<()> {
    let manager = WorktreeManager::new(config);

    match subcmd {
        WorktreeSubcommand::Create { phase, task, from } => {
            let path = manager
                .create(phase, task, from.as_deref())
                .with_context(|| format!("failed to create worktree for phase {phase} task {task}"))?;
            if json {
                print_json(&serde_json::json!({ "path": path }))?;
            } else {
                println!("Worktree ready at {}", path.display());
            }
            Ok(())
        }
        WorktreeSubcommand::List => {
            let worktrees = manager.list().context("failed to list worktrees")?;
            if json {
                return print_json(&worktrees);
            }
            if worktrees.is_empty() {
                println!("No worktrees");
                return Ok(());
            }
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
            Ok(())
        }
        WorktreeSubcommand::Status { name, status } => {
            manager
                .update_status(&name, status)
                .with_context(|| format!("failed to update status of '{name}'"))?;
            if json {
                print_json(&serde_json::json!({ "name": name, "status": status }))?;
            } else {
                println!("Worktree '{name}' marked {status}");
            }
            Ok(())
        }
        WorktreeSubcommand::Merge {
            name,
            target,
            delete,
        } => {
            manager
                .merge(&name, &target, delete)
                .with_context(|| format!("failed to merge '{name}' into '{target}'"))?;
            if json {
                print_json(&serde_json::json!({
                    "name": name,
                    "target": target,
                    "deleted": delete,
                }))?;
            } else if delete {
                println!("Merged '{name}' into '{target}' and removed the worktree");
            } else {
                println!("Merged '{name}' into '{target}'");
            }
            Ok(())
        }
        WorktreeSubcommand::Cleanup { name, force } => {
            manager
                .cleanup(&name, force)
                .with_context(|| format!("failed to clean up '{name}'"))?;
            if json {
                print_json(&serde_json::json!({ "removed": [name] }))?;
            } else {
                println!("Removed worktree '{name}'");
            }
            Ok(())
        }
        WorktreeSubcommand::CleanupCompleted => {
            let removed = manager
                .cleanup_completed()
                .context("failed to clean up completed worktrees")?;
            if json {
                print_json(&serde_json::json!({ "removed": removed }))?;
            } else {
                println!("Removed {} worktree(s)", removed.len());
            }
            Ok(())
        }
        WorktreeSubcommand::Enforce { phase, task } => {
            let path = manager
                .enforce_isolation(phase, task)
                .context("isolation check failed")?;
            if json {
                print_json(&serde_json::json!({ "worktree": path }))?;
            } else {
                println!("OK: running inside {}", path.display());
            }
            Ok(())
        }
    }
}

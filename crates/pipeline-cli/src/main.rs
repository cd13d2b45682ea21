mod cmd;
mod output;
mod root;

use clap::{Parser, Subcommand};
use cmd::{
    checkpoint::CheckpointSubcommand, degraded::DegradedSubcommand, locks::LocksSubcommand,
    state::StateSubcommand, worktree::WorktreeSubcommand,
};
use pipeline_core::{Config, ErrorCode, PipelineError};
use std::path::PathBuf;

#[derive(Parser)]
#[command(
    name = "pipeline",
    about = "Crash-consistent state, checkpoints, and worktree isolation for multi-phase pipelines",
    version,
    propagate_version = true
)]
struct Cli {
    /// Project root (default: auto-detect from .pipeline/ or .git/)
    #[arg(long, global = true, env = "PIPELINE_ROOT")]
    root: Option<PathBuf>,

    /// Output as JSON
    #[arg(long, global = true, short = 'j')]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the .pipeline control tree in the current project
    Init,

    /// Read and mutate the state document
    State {
        #[command(subcommand)]
        subcommand: StateSubcommand,
    },

    /// Write a labeled backup of the state file
    Backup {
        /// Label embedded in the backup filename
        #[arg(long, default_value = "manual")]
        label: String,
    },

    /// Restore state from backup (newest valid one unless --label is given)
    Recover {
        #[arg(long)]
        label: Option<String>,
    },

    /// Snapshot and restore the state document around risky operations
    Checkpoint {
        #[command(subcommand)]
        subcommand: CheckpointSubcommand,
    },

    /// Manage per-phase/task git worktrees
    Worktree {
        #[command(subcommand)]
        subcommand: WorktreeSubcommand,
    },

    /// Inspect and toggle degraded mode
    Degraded {
        #[command(subcommand)]
        subcommand: DegradedSubcommand,
    },

    /// Attempt local recovery for a failed step's error code
    HandleError {
        /// Numeric error code the failing step exited with
        code: u8,
        /// Description of the failure
        #[arg(required = true)]
        message: Vec<String>,
        /// Name of the operation that failed
        #[arg(long, default_value = "unknown")]
        operation: String,
        /// Report only; skip recovery attempts
        #[arg(long)]
        no_recover: bool,
    },

    /// Operator escape hatches for advisory locks
    Locks {
        #[command(subcommand)]
        subcommand: LocksSubcommand,
    },

    /// One-screen summary of state, checkpoints, and worktrees
    Status,
}

fn main() {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::WARN.into()),
        )
        .with_target(false)
        .init();

    let root = root::resolve_root(cli.root.as_deref());
    let config = Config::from_env(&root);

    let result = match cli.command {
        Commands::Init => cmd::init::run(&config, cli.json),
        Commands::State { subcommand } => cmd::state::run(&config, subcommand, cli.json),
        Commands::Backup { label } => cmd::backup::run_backup(&config, &label, cli.json),
        Commands::Recover { label } => cmd::backup::run_recover(&config, label.as_deref(), cli.json),
        Commands::Checkpoint { subcommand } => cmd::checkpoint::run(&config, subcommand, cli.json),
        Commands::Worktree { subcommand } => cmd::worktree::run(&config, subcommand, cli.json),
        Commands::Degraded { subcommand } => cmd::degraded::run(&config, subcommand, cli.json),
        Commands::HandleError {
            code,
            message,
            operation,
            no_recover,
        } => cmd::handle_error::run(
            &config,
            code,
            &message.join(" "),
            &operation,
            !no_recover,
            cli.json,
        ),
        Commands::Locks { subcommand } => cmd::locks::run(&config, subcommand, cli.json),
        Commands::Status => cmd::status::run(&config, cli.json),
    };

    if let Err(e) = result {
        // Full error chain, then the kind-specific remediation hint. The
        // numeric error code becomes the process exit code.
        eprintln!("error: {e:#}");
        let code = e
            .downcast_ref::<PipelineError>()
            .map(PipelineError::code)
            .unwrap_or(ErrorCode::GeneralError);
        eprintln!("hint: {}", code.remediation());
        std::process::exit(i32::from(code.code()));
    }
}

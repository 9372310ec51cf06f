use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

mod cmd;

#[derive(Parser)]
#[command(name = "agent-manager")]
#[command(version, about = "Supervises coding-agent runs: execution, recovery and review")]
pub struct Cli {
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Print machine-readable JSON instead of tables
    #[arg(long, global = true)]
    pub json: bool,

    #[arg(long, global = true)]
    pub project_dir: Option<PathBuf>,

    /// Config file. Defaults to .agent-manager/config.toml in the project.
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the orchestrator with its reconciler and recommendation worker until Ctrl-C
    Serve {
        /// Skip the stale/orphan reconciliation loop
        #[arg(long)]
        no_reconciler: bool,
        /// Skip the recommendation extraction loop
        #[arg(long)]
        no_worker: bool,
    },
    /// Manage agent profiles
    Profile {
        #[command(subcommand)]
        command: ProfileCommands,
    },
    /// Manage tasks
    Task {
        #[command(subcommand)]
        command: TaskCommands,
    },
    /// Start and inspect runs
    Run {
        #[command(subcommand)]
        command: RunCommands,
    },
    /// List running runs whose heartbeat has gone stale
    Stale {
        /// Staleness threshold in seconds (defaults to executor.stale_threshold_secs)
        #[arg(long)]
        threshold_secs: Option<u64>,
    },
    /// Run one reconciliation cycle and print its statistics
    Reconcile,
    /// Terminate every process carrying a run tag
    Terminate {
        #[arg(long)]
        tag: String,
        /// Runner kind, enables the resource CLI fallback
        #[arg(long)]
        kind: Option<String>,
    },
    /// View or validate configuration
    Config {
        #[command(subcommand)]
        command: Option<ConfigCommands>,
    },
}

#[derive(Subcommand, Clone)]
pub enum ProfileCommands {
    Add {
        #[arg(long)]
        name: String,
        /// claude, codex or opencode
        #[arg(long, default_value = "claude")]
        runner: String,
        #[arg(long, default_value = "sonnet")]
        model: String,
        #[arg(long, default_value = "50")]
        max_turns: u32,
        /// Always run this profile in a sandbox
        #[arg(long)]
        sandbox: bool,
    },
    List,
}

#[derive(Subcommand, Clone)]
pub enum TaskCommands {
    Add {
        #[arg(long)]
        title: String,
        /// Prompt given to the agent (defaults to the title)
        #[arg(long, default_value = "")]
        description: String,
        /// Path inside the project the agent may touch
        #[arg(long, default_value = ".")]
        scope: String,
        /// Project root (defaults to the project directory)
        #[arg(long)]
        root: Option<PathBuf>,
    },
    List,
}

#[derive(Clone, Copy, ValueEnum)]
pub enum ModeArg {
    Sandboxed,
    InPlace,
}

#[derive(Subcommand, Clone)]
pub enum RunCommands {
    /// Create a run and execute it in this process
    Start {
        #[arg(long)]
        task: String,
        #[arg(long)]
        profile: String,
        /// Prompt override (defaults to the task description)
        #[arg(long)]
        prompt: Option<String>,
        #[arg(long, value_enum)]
        mode: Option<ModeArg>,
        /// Run in the project directly, skipping the sandbox
        #[arg(long)]
        in_place: bool,
        /// Repeat-safe request key
        #[arg(long)]
        idempotency_key: Option<String>,
    },
    List {
        /// Filter by status (repeatable)
        #[arg(long)]
        status: Vec<String>,
        #[arg(long)]
        task: Option<String>,
        #[arg(long)]
        limit: Option<usize>,
    },
    Stop {
        id: String,
        /// Escalate to process termination after asking the runner
        #[arg(long)]
        terminate: bool,
    },
    /// Resume a failed or stalled run from its checkpoint
    Resume { id: String },
    Progress { id: String },
    Events {
        id: String,
        #[arg(long)]
        after: Option<i64>,
        #[arg(long)]
        limit: Option<usize>,
    },
    Approve {
        id: String,
        /// Apply only these files (repeatable)
        #[arg(long = "path")]
        paths: Vec<String>,
    },
    Reject {
        id: String,
        #[arg(long)]
        reason: Option<String>,
    },
    Diff { id: String },
}

#[derive(Subcommand, Clone)]
pub enum ConfigCommands {
    /// Show the effective configuration
    Show,
    /// Validate configuration and show any warnings
    Validate,
    /// Write a default config.toml
    Init,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let project_dir = match cli.project_dir.clone() {
        Some(dir) => dir,
        None => std::env::current_dir().context("Failed to get current directory")?,
    };

    match &cli.command {
        Commands::Config { command } => {
            cmd::cmd_config(&project_dir, cli.config.as_deref(), command.clone())?
        }
        Commands::Serve {
            no_reconciler,
            no_worker,
        } => {
            let ctx = cmd::AppContext::open(&cli, &project_dir)?;
            cmd::cmd_serve(ctx, !*no_reconciler, !*no_worker).await?;
        }
        Commands::Profile { command } => {
            let ctx = cmd::AppContext::open(&cli, &project_dir)?;
            cmd::cmd_profile(&ctx, command.clone()).await?;
        }
        Commands::Task { command } => {
            let ctx = cmd::AppContext::open(&cli, &project_dir)?;
            cmd::cmd_task(&ctx, command.clone()).await?;
        }
        Commands::Run { command } => {
            let ctx = cmd::AppContext::open(&cli, &project_dir)?;
            cmd::cmd_run(&ctx, command.clone()).await?;
        }
        Commands::Stale { threshold_secs } => {
            let ctx = cmd::AppContext::open(&cli, &project_dir)?;
            cmd::cmd_stale(&ctx, *threshold_secs).await?;
        }
        Commands::Reconcile => {
            let ctx = cmd::AppContext::open(&cli, &project_dir)?;
            cmd::cmd_reconcile(&ctx).await?;
        }
        Commands::Terminate { tag, kind } => {
            let ctx = cmd::AppContext::open(&cli, &project_dir)?;
            cmd::cmd_terminate(&ctx, tag, kind.as_deref()).await?;
        }
    }

    Ok(())
}

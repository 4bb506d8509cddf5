mod log_cmd;
mod run_cmd;
mod status_cmd;
mod task_cmds;

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "forge", about = "Autonomous coding agent runner")]
struct Cli {
    /// Project root (defaults to the current directory)
    #[arg(long, global = true)]
    root: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize forge state in the project root
    Init {
        /// Project name recorded in the state file (defaults to the
        /// directory name)
        #[arg(long)]
        name: Option<String>,
    },
    /// Task management
    Task {
        #[command(subcommand)]
        command: TaskCommands,
    },
    /// Execute the plan: run every executable task to completion
    Run {
        /// Mirror streamed agent output to stdout
        #[arg(long)]
        verbose: bool,
    },
    /// Show plan progress and per-task status
    Status,
    /// Print the execution log of a task
    Log {
        /// Task ID, e.g. task-001
        task_id: String,
    },
}

#[derive(Subcommand)]
pub enum TaskCommands {
    /// Append a new pending task to the plan
    Add {
        /// Short task title
        title: String,
        /// What the task should accomplish
        #[arg(long, default_value = "")]
        description: String,
        /// small, medium, or large
        #[arg(long, default_value = "medium")]
        complexity: String,
        /// Acceptance criterion (repeatable)
        #[arg(long = "criteria")]
        criteria: Vec<String>,
        /// Task ID this task depends on (repeatable)
        #[arg(long = "depends-on")]
        depends_on: Vec<String>,
    },
    /// List all tasks with their status
    List,
    /// Cancel a pending task
    Cancel {
        /// Task ID to cancel
        id: String,
        /// Why the task is being cancelled
        #[arg(long, default_value = "cancelled by operator")]
        reason: String,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    // Logs go to stderr so stdout stays clean for command output.
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    let root = match cli.root.clone().map(Ok).unwrap_or_else(std::env::current_dir) {
        Ok(root) => root,
        Err(e) => {
            eprintln!("error: cannot determine project root: {e}");
            return ExitCode::from(3);
        }
    };

    let result = match cli.command {
        Commands::Init { name } => task_cmds::cmd_init(&root, name.as_deref()),
        Commands::Task { command } => task_cmds::run(&root, command),
        Commands::Run { verbose } => return run_cmd::run(&root, verbose).await,
        Commands::Status => status_cmd::run(&root),
        Commands::Log { task_id } => log_cmd::run(&root, &task_id),
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {e:#}");
            ExitCode::FAILURE
        }
    }
}

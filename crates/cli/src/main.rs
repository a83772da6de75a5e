//! Coxswain CLI — the main entry point.
//!
//! Commands:
//! - `run`    — Start a new task from a prompt
//! - `resume` — Resume a checkpointed task by id
//! - `tasks`  — List checkpointed tasks

use clap::{Parser, Subcommand};
use std::path::PathBuf;

mod commands;
mod surface;

#[derive(Parser)]
#[command(
    name = "coxswain",
    about = "Coxswain — terminal-driven autonomous coding agent",
    version
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Path to the config file (default: ~/.coxswain/config.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Start a new task
    Run {
        /// The task prompt
        task: String,

        /// Attach an image file to the task
        #[arg(long)]
        image: Vec<PathBuf>,

        /// Working directory for tool execution (default: current dir)
        #[arg(short, long)]
        workdir: Option<PathBuf>,

        /// Model identifier, overriding the configured one
        #[arg(short, long)]
        model: Option<String>,

        /// Auto-approve read-only tools
        #[arg(long)]
        allow_reads: bool,
    },

    /// Resume a checkpointed task
    Resume {
        /// The task id printed when the task started
        id: String,

        /// Working directory for tool execution (default: current dir)
        #[arg(short, long)]
        workdir: Option<PathBuf>,

        /// Model identifier, overriding the configured one
        #[arg(short, long)]
        model: Option<String>,

        /// Auto-approve read-only tools
        #[arg(long)]
        allow_reads: bool,
    },

    /// List checkpointed tasks
    Tasks,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(filter)),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Commands::Run {
            task,
            image,
            workdir,
            model,
            allow_reads,
        } => commands::run::run(cli.config, task, image, workdir, model, allow_reads).await,
        Commands::Resume {
            id,
            workdir,
            model,
            allow_reads,
        } => commands::resume::run(cli.config, id, workdir, model, allow_reads).await,
        Commands::Tasks => commands::tasks::run(cli.config).await,
    }
}

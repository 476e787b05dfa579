//! CLI surface.

pub mod commands;

use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// Iterative AI-agent execution engine.
#[derive(Debug, Parser)]
#[command(name = "epicycle", version, about)]
pub struct Cli {
    /// Config file (default: epicycle.yaml in the working directory)
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Emit logs as JSON
    #[arg(long, global = true)]
    pub json: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Run the engine loop over an epic file
    Run {
        /// YAML epic file with the task list
        #[arg(long, default_value = "epic.yaml")]
        epic: PathBuf,
        /// Override the configured iteration budget (0 = unbounded)
        #[arg(long)]
        max_iterations: Option<u32>,
        /// Override the primary agent plugin id
        #[arg(long)]
        agent: Option<String>,
        /// Auto-commit agent changes after each completed task
        #[arg(long)]
        auto_commit: bool,
    },
    /// Render the prompt for one task without executing anything
    Preview {
        #[arg(long, default_value = "epic.yaml")]
        epic: PathBuf,
        /// Task id to render
        task_id: String,
    },
    /// Verify the configured agent answers a tiny prompt end-to-end
    Preflight {
        /// Agent plugin id (default: the configured primary)
        #[arg(long)]
        agent: Option<String>,
    },
    /// Inspect persisted iteration logs
    Logs {
        #[command(subcommand)]
        command: LogsCommands,
    },
}

#[derive(Debug, Subcommand)]
pub enum LogsCommands {
    /// List iteration logs, oldest first
    List {
        /// Only logs for this task id
        #[arg(long)]
        task: Option<String>,
    },
    /// Print one log by iteration number
    Show { iteration: u32 },
    /// Delete all but the newest N logs
    Cleanup {
        #[arg(long, default_value_t = 20)]
        keep: usize,
        /// Report what would be deleted without deleting
        #[arg(long)]
        dry_run: bool,
    },
}

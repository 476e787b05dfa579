//! Epicycle CLI entry point.

use anyhow::{Context, Result};
use clap::Parser;

use epicycle::cli::{commands, Cli, Commands, LogsCommands};
use epicycle::infrastructure::{logging, ConfigLoader};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let _log_guard = logging::init(cli.json, None);

    let config = ConfigLoader::load_from(cli.config.as_deref())
        .context("Failed to load configuration")?;

    match cli.command {
        Commands::Run {
            epic,
            max_iterations,
            agent,
            auto_commit,
        } => commands::handle_run(config, epic, max_iterations, agent, auto_commit).await,
        Commands::Preview { epic, task_id } => {
            commands::handle_preview(config, epic, &task_id).await
        }
        Commands::Preflight { agent } => commands::handle_preflight(config, agent).await,
        Commands::Logs { command } => {
            let cwd = std::env::current_dir()?;
            match command {
                LogsCommands::List { task } => {
                    commands::handle_logs_list(&config, &cwd, task.as_deref()).await
                }
                LogsCommands::Show { iteration } => {
                    commands::handle_logs_show(&config, &cwd, iteration).await
                }
                LogsCommands::Cleanup { keep, dry_run } => {
                    commands::handle_logs_cleanup(&config, &cwd, keep, dry_run).await
                }
            }
        }
    }
}

//! CLI command handlers.

use anyhow::{Context, Result};
use comfy_table::{presets::UTF8_FULL, Table};
use console::style;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::adapters::agents::AgentRegistry;
use crate::adapters::trackers::FileTracker;
use crate::adapters::GitAutoCommit;
use crate::domain::models::{EngineConfig, StopReason, TaskFilter, TaskStatus};
use crate::domain::ports::{AutoCommit, Tracker};
use crate::infrastructure::DefaultTemplateRenderer;
use crate::services::engine::{EngineDeps, EngineEvent, ExecutionEngine};
use crate::services::log_store::{format_duration, LogStore};

/// Run the engine loop headless over an epic file.
pub async fn handle_run(
    mut config: EngineConfig,
    epic: PathBuf,
    max_iterations: Option<u32>,
    agent: Option<String>,
    auto_commit: bool,
) -> Result<()> {
    if let Some(max) = max_iterations {
        config.max_iterations = max;
    }
    if let Some(agent) = agent {
        config.agent = agent;
    }
    if auto_commit {
        config.auto_commit = true;
    }

    let tracker = Arc::new(
        FileTracker::load(&epic)
            .await
            .context("Failed to load epic file")?,
    );
    if config.epic.is_none() {
        config.epic = tracker.epic();
    }

    let cwd = std::env::current_dir()?;
    let registry = Arc::new(AgentRegistry::new(&config));
    let auto_commit_adapter: Option<Arc<dyn AutoCommit>> = if config.auto_commit {
        Some(Arc::new(GitAutoCommit))
    } else {
        None
    };
    let tracker_port: Arc<dyn Tracker> = tracker.clone();

    let engine = Arc::new(ExecutionEngine::new(
        config,
        &cwd,
        EngineDeps {
            tracker: tracker_port,
            registry,
            renderer: Arc::new(DefaultTemplateRenderer),
            auto_commit: auto_commit_adapter,
        },
    ));

    let _subscription = engine.listen(print_event);

    engine
        .initialize(None)
        .await
        .context("Engine initialization failed")?;

    // First Ctrl-C asks the loop to stop and interrupts the running agent.
    let signal_engine = Arc::clone(&engine);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!("\n{}", style("Stopping (Ctrl-C again to force)...").yellow());
            signal_engine.stop();
        }
    });

    let reason = engine.start().await?;

    // Give back tasks we claimed but never finished.
    let stranded: Vec<String> = tracker
        .get_tasks(&TaskFilter {
            status: vec![TaskStatus::InProgress],
            exclude_ids: vec![],
        })
        .await
        .unwrap_or_default()
        .into_iter()
        .map(|task| task.id)
        .collect();
    if !stranded.is_empty() {
        engine.reset_tasks_to_open(&stranded).await?;
    }

    let info = engine.get_iteration_info();
    println!(
        "\n{} reason={} iterations={} completed={}/{}",
        style("Engine stopped").bold(),
        reason.as_str(),
        info.current_iteration,
        info.tasks_completed,
        info.total_tasks
    );

    if reason == StopReason::Error {
        anyhow::bail!("engine stopped on error");
    }
    Ok(())
}

/// Print the rendered prompt for one task.
pub async fn handle_preview(config: EngineConfig, epic: PathBuf, task_id: &str) -> Result<()> {
    let tracker = Arc::new(
        FileTracker::load(&epic)
            .await
            .context("Failed to load epic file")?,
    );
    let cwd = std::env::current_dir()?;
    let registry = Arc::new(AgentRegistry::new(&config));

    let engine = ExecutionEngine::new(
        config,
        &cwd,
        EngineDeps {
            tracker,
            registry,
            renderer: Arc::new(DefaultTemplateRenderer),
            auto_commit: None,
        },
    );

    let prompt = engine.generate_prompt_preview(task_id).await?;
    println!("{prompt}");
    Ok(())
}

/// Run the preflight prompt against an agent.
pub async fn handle_preflight(config: EngineConfig, agent: Option<String>) -> Result<()> {
    let agent_id = agent.unwrap_or_else(|| config.agent.clone());
    let registry = AgentRegistry::new(&config);
    let plugin = registry
        .create(&agent_id)
        .with_context(|| format!("unknown agent plugin '{agent_id}'"))?;

    let detection = plugin.detect().await;
    if !detection.available {
        anyhow::bail!(
            "{}",
            detection
                .error
                .unwrap_or_else(|| format!("{agent_id} is not available"))
        );
    }
    println!(
        "{} {} {}",
        style("detected").green(),
        agent_id,
        detection.version.unwrap_or_default()
    );

    let result = plugin.preflight(None).await;
    if result.success {
        println!(
            "{} in {}",
            style("preflight ok").green().bold(),
            format_duration(result.duration_ms)
        );
        Ok(())
    } else {
        if let Some(suggestion) = result.suggestion {
            eprintln!("{} {suggestion}", style("hint:").yellow());
        }
        anyhow::bail!(
            "preflight failed: {}",
            result.error.unwrap_or_else(|| "no output".to_string())
        )
    }
}

/// List persisted logs as a table.
pub async fn handle_logs_list(config: &EngineConfig, cwd: &Path, task: Option<&str>) -> Result<()> {
    let store = LogStore::new(config.logs_dir.clone());
    let logs = store.list_iteration_logs(cwd, task).await?;
    if logs.is_empty() {
        println!("no iteration logs found");
        return Ok(());
    }

    let mut table = Table::new();
    table.load_preset(UTF8_FULL);
    table.set_header(["Iteration", "Task", "Status", "Started", "Duration", "File"]);
    for log in &logs {
        table.add_row([
            log.metadata.iteration.to_string(),
            log.metadata.task_id.clone(),
            log.metadata.status.as_str().to_string(),
            log.metadata.started_at.to_rfc3339(),
            format_duration(log.metadata.duration_ms()),
            log.file_path
                .file_name()
                .and_then(|n| n.to_str())
                .unwrap_or_default()
                .to_string(),
        ]);
    }
    println!("{table}");

    let usage = store.disk_usage(cwd).await?;
    println!("{} logs, {} bytes on disk", logs.len(), usage);
    Ok(())
}

/// Print one log by iteration number.
pub async fn handle_logs_show(config: &EngineConfig, cwd: &Path, iteration: u32) -> Result<()> {
    let store = LogStore::new(config.logs_dir.clone());
    let log = store
        .get_iteration_log_by_number(cwd, iteration)
        .await?
        .with_context(|| format!("no log for iteration {iteration}"))?;
    let raw = tokio::fs::read_to_string(&log.file_path).await?;
    print!("{raw}");
    Ok(())
}

/// Delete old logs.
pub async fn handle_logs_cleanup(
    config: &EngineConfig,
    cwd: &Path,
    keep: usize,
    dry_run: bool,
) -> Result<()> {
    let store = LogStore::new(config.logs_dir.clone());
    let affected = store.cleanup_iteration_logs(cwd, keep, dry_run).await?;
    let verb = if dry_run { "would delete" } else { "deleted" };
    println!("{verb} {} log(s), keeping the {keep} newest", affected.len());
    Ok(())
}

/// Compact one-line rendering of engine events for headless runs.
fn print_event(event: &EngineEvent) {
    match event {
        EngineEvent::EngineStarted { total, .. } => {
            println!("{} {total} task(s)", style("started").green().bold());
        }
        EngineEvent::IterationStarted { iteration, task } => {
            println!(
                "{} #{iteration} {} ({})",
                style("iteration").cyan(),
                task.title,
                task.id
            );
        }
        EngineEvent::AgentOutput { chunk, .. } => {
            print!("{chunk}");
        }
        EngineEvent::TaskCompleted { task_id } => {
            println!("{} {task_id}", style("task completed").green());
        }
        EngineEvent::IterationRateLimited {
            attempt,
            max,
            delay_ms,
            ..
        } => {
            println!(
                "{} retry {attempt}/{max} in {}ms",
                style("rate-limited").yellow(),
                delay_ms
            );
        }
        EngineEvent::AgentSwitched { from, to, reason } => {
            println!(
                "{} {from} -> {to} ({})",
                style("agent switch").yellow(),
                reason.as_str()
            );
        }
        EngineEvent::AgentAllLimited { tried } => {
            println!(
                "{} all agents limited: {}; engine paused",
                style("rate-limited").red().bold(),
                tried.join(", ")
            );
        }
        EngineEvent::IterationFailed { action, error, .. } => {
            println!("{} ({}) {error}", style("iteration failed").red(), action.as_str());
        }
        EngineEvent::IterationSkipped { task_id } => {
            println!("{} {task_id}", style("skipped").yellow());
        }
        EngineEvent::AllComplete => {
            println!("{}", style("all tasks complete").green().bold());
        }
        EngineEvent::Warning { message } => {
            eprintln!("{} {message}", style("warning:").yellow());
        }
        _ => {}
    }
}

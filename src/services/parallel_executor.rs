//! Parallel executor.
//!
//! Runs a batch of work units concurrently, one isolated worktree per task,
//! with continue-on-error semantics. Each task runs through three attributed
//! phases (worktree acquisition, agent spawn, agent execution); when a batch
//! fails and `continue_on_error` is off, running agents are interrupted and
//! queued tasks are reported as cancelled. A Markdown failure report is
//! generated whenever any task fails.

use chrono::Utc;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tracing::{info, warn};

use crate::domain::errors::EngineResult;
use crate::domain::models::{
    BatchResult, EngineConfig, ExecutionStatus, FailurePhase, ManagedWorktree, ParallelTaskError,
    ParallelTaskResult, ParallelTaskStatus, Task, WorkUnit, WorktreeRequest,
};
use crate::domain::ports::{
    AgentFactory, ExecOptions, InterruptSignal, TemplateRenderer, WorktreeProvider,
};
use crate::services::engine::events::EventChannel;
use crate::services::log_store::{format_duration, safe_task_id};
use crate::services::subagent_parser::SubagentParser;

/// Events emitted while a batch runs.
#[derive(Debug, Clone, serde::Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ParallelEvent {
    TaskStarted {
        task_id: String,
        work_unit: String,
    },
    TaskCompleted {
        task_id: String,
    },
    TaskFailed {
        task_id: String,
        phase: FailurePhase,
        continue_execution: bool,
    },
    TaskCancelled {
        task_id: String,
    },
    BatchCompleted {
        completed: usize,
        failed: usize,
        cancelled: usize,
    },
    FailureReportGenerated,
}

/// Tracks active agents so a failing batch can interrupt them all.
#[derive(Default)]
pub struct Coordinator {
    active: Mutex<HashMap<String, Arc<InterruptSignal>>>,
}

impl Coordinator {
    fn register(&self, task_id: &str, signal: Arc<InterruptSignal>) {
        self.active
            .lock()
            .unwrap()
            .insert(task_id.to_string(), signal);
    }

    fn deregister(&self, task_id: &str) {
        self.active.lock().unwrap().remove(task_id);
    }

    /// Interrupt every registered agent.
    pub fn interrupt_all(&self) {
        for (task_id, signal) in self.active.lock().unwrap().iter() {
            info!(task_id = %task_id, "Interrupting agent for batch shutdown");
            signal.interrupt();
        }
    }

    pub fn active_count(&self) -> usize {
        self.active.lock().unwrap().len()
    }
}

#[derive(Clone)]
struct TaskContext {
    config: Arc<EngineConfig>,
    registry: Arc<dyn AgentFactory>,
    renderer: Arc<dyn TemplateRenderer>,
    pool: Arc<dyn WorktreeProvider>,
    coordinator: Arc<Coordinator>,
    shutdown: Arc<AtomicBool>,
}

/// Executes batches of independent tasks across the worktree pool.
pub struct ParallelExecutor {
    config: Arc<EngineConfig>,
    registry: Arc<dyn AgentFactory>,
    renderer: Arc<dyn TemplateRenderer>,
    pool: Arc<dyn WorktreeProvider>,
    events: Arc<EventChannel<ParallelEvent>>,
    coordinator: Arc<Coordinator>,
}

impl ParallelExecutor {
    pub fn new(
        config: EngineConfig,
        registry: Arc<dyn AgentFactory>,
        renderer: Arc<dyn TemplateRenderer>,
        pool: Arc<dyn WorktreeProvider>,
    ) -> Self {
        Self {
            config: Arc::new(config),
            registry,
            renderer,
            pool,
            events: Arc::new(EventChannel::new()),
            coordinator: Arc::new(Coordinator::default()),
        }
    }

    pub fn listen(
        &self,
        callback: impl Fn(&ParallelEvent) + Send + Sync + 'static,
    ) -> crate::services::engine::events::Subscription<ParallelEvent> {
        self.events.listen(callback)
    }

    /// Run every task of every work unit, bounded by `max_concurrency`.
    pub async fn execute(&self, units: Vec<WorkUnit>) -> EngineResult<BatchResult> {
        let started_at = Utc::now();
        let start = std::time::Instant::now();
        let max_concurrency = self.config.parallel.max_concurrency.max(1);
        let continue_on_error = self.config.parallel.continue_on_error;

        let mut queue: VecDeque<(Task, String)> = units
            .iter()
            .flat_map(|unit| {
                unit.tasks
                    .iter()
                    .map(|task| (task.clone(), unit.name.clone()))
            })
            .collect();

        let shutdown = Arc::new(AtomicBool::new(false));
        let ctx = TaskContext {
            config: Arc::clone(&self.config),
            registry: Arc::clone(&self.registry),
            renderer: Arc::clone(&self.renderer),
            pool: Arc::clone(&self.pool),
            coordinator: Arc::clone(&self.coordinator),
            shutdown: Arc::clone(&shutdown),
        };

        let mut running: JoinSet<ParallelTaskResult> = JoinSet::new();
        let mut results: Vec<ParallelTaskResult> = Vec::new();

        loop {
            while running.len() < max_concurrency && !shutdown.load(Ordering::SeqCst) {
                let Some((task, unit)) = queue.pop_front() else {
                    break;
                };
                self.events.emit(&ParallelEvent::TaskStarted {
                    task_id: task.id.clone(),
                    work_unit: unit.clone(),
                });
                let ctx = ctx.clone();
                running.spawn(async move { run_one(ctx, task, unit).await });
            }

            if running.is_empty() {
                break;
            }

            // Advance on first completion.
            match running.join_next().await {
                Some(Ok(result)) => {
                    match result.status {
                        ParallelTaskStatus::Completed => {
                            self.events.emit(&ParallelEvent::TaskCompleted {
                                task_id: result.task.id.clone(),
                            });
                        }
                        ParallelTaskStatus::Failed => {
                            self.events.emit(&ParallelEvent::TaskFailed {
                                task_id: result.task.id.clone(),
                                phase: result
                                    .error
                                    .as_ref()
                                    .map_or(FailurePhase::Unknown, |e| e.phase),
                                continue_execution: continue_on_error,
                            });
                            if !continue_on_error && !shutdown.swap(true, Ordering::SeqCst) {
                                warn!(task_id = %result.task.id, "Task failed, entering batch shutdown");
                                self.coordinator.interrupt_all();
                            }
                        }
                        ParallelTaskStatus::Cancelled => {
                            self.events.emit(&ParallelEvent::TaskCancelled {
                                task_id: result.task.id.clone(),
                            });
                        }
                    }
                    results.push(result);
                }
                Some(Err(e)) => warn!(error = %e, "Parallel task panicked"),
                None => break,
            }
        }

        // Tasks never started produce cancelled results.
        for (task, unit) in queue {
            self.events.emit(&ParallelEvent::TaskCancelled {
                task_id: task.id.clone(),
            });
            results.push(ParallelTaskResult::cancelled(task, unit));
        }

        let (completed, failed, cancelled) = count(&results);
        self.events.emit(&ParallelEvent::BatchCompleted {
            completed,
            failed,
            cancelled,
        });

        let failure_report = if failed > 0 {
            let report = build_failure_report(
                &results,
                self.config.parallel.preserve_failed_worktrees,
                start.elapsed().as_millis() as u64,
            );
            self.events.emit(&ParallelEvent::FailureReportGenerated);
            Some(report)
        } else {
            None
        };

        Ok(BatchResult {
            results,
            failure_report,
            started_at,
            ended_at: Utc::now(),
        })
    }
}

fn count(results: &[ParallelTaskResult]) -> (usize, usize, usize) {
    let mut completed = 0;
    let mut failed = 0;
    let mut cancelled = 0;
    for result in results {
        match result.status {
            ParallelTaskStatus::Completed => completed += 1,
            ParallelTaskStatus::Failed => failed += 1,
            ParallelTaskStatus::Cancelled => cancelled += 1,
        }
    }
    (completed, failed, cancelled)
}

async fn run_one(ctx: TaskContext, task: Task, work_unit: String) -> ParallelTaskResult {
    let started_at = Utc::now();
    let start = std::time::Instant::now();
    let agent_id = ctx.config.agent.clone();

    if ctx.shutdown.load(Ordering::SeqCst) {
        return ParallelTaskResult::cancelled(task, work_unit);
    }

    let finish = |status: ParallelTaskStatus,
                  worktree: Option<ManagedWorktree>,
                  stdout: String,
                  stderr: String,
                  exit_code: Option<i32>,
                  error: Option<ParallelTaskError>,
                  subagent_summary| {
        ParallelTaskResult {
            task: task.clone(),
            work_unit: work_unit.clone(),
            status,
            worktree,
            started_at,
            ended_at: Utc::now(),
            duration_ms: start.elapsed().as_millis() as u64,
            stdout,
            stderr,
            exit_code,
            error,
            subagent_summary,
        }
    };
    let fail = |phase: FailurePhase, message: String, worktree: Option<ManagedWorktree>| {
        finish(
            ParallelTaskStatus::Failed,
            worktree,
            String::new(),
            String::new(),
            None,
            Some(ParallelTaskError::new(phase, message)),
            None,
        )
    };

    // Phase 1: isolated working copy.
    let worktree = match ctx
        .pool
        .acquire(WorktreeRequest {
            base_name: safe_task_id(&task.id),
            branch: None,
            base_branch: None,
            task_id: Some(task.id.clone()),
            agent_id: Some(agent_id.clone()),
        })
        .await
    {
        Ok(worktree) => worktree,
        Err(e) => return fail(FailurePhase::WorktreeAcquisition, e.to_string(), None),
    };

    // Phase 2: spawn the agent inside it.
    let rendered = match ctx.renderer.render(
        &task,
        &ctx.config,
        ctx.config.epic.as_deref(),
        None,
        None,
    ) {
        Ok(rendered) => rendered,
        Err(e) => {
            release(&ctx, &worktree, true).await;
            return fail(FailurePhase::AgentSpawn, e.to_string(), Some(worktree));
        }
    };

    let agent_options = ctx.config.agent_options(&agent_id);
    let Some(plugin) = ctx.registry.create(&agent_id, agent_options) else {
        release(&ctx, &worktree, true).await;
        return fail(
            FailurePhase::AgentSpawn,
            format!("unknown agent plugin '{agent_id}'"),
            Some(worktree),
        );
    };

    let parser = Arc::new(Mutex::new(SubagentParser::new()));
    let (jsonl_tx, jsonl_task) = if plugin.meta().supports_subagent_tracing {
        let (tx, mut rx) = mpsc::unbounded_channel::<serde_json::Value>();
        let parser = Arc::clone(&parser);
        let tracer = Arc::clone(&plugin);
        let handle = tokio::spawn(async move {
            while let Some(value) = rx.recv().await {
                for message in tracer.canonicalize_trace(&value) {
                    parser.lock().unwrap().process(&message);
                }
            }
        });
        (Some(tx), Some(handle))
    } else {
        (None, None)
    };

    let options = ExecOptions {
        working_dir: Some(worktree.path.clone()),
        env: HashMap::new(),
        timeout: None,
        output_cap_chars: ctx.config.parallel.max_output_size_bytes,
        on_output: None,
        on_jsonl: jsonl_tx,
    };

    let handle = match plugin.execute(&rendered.prompt, &[], options).await {
        Ok(handle) => handle,
        Err(e) => {
            release(&ctx, &worktree, true).await;
            return fail(FailurePhase::AgentSpawn, e.to_string(), Some(worktree));
        }
    };

    ctx.coordinator.register(&task.id, handle.interrupt_signal());

    // Phase 3: execution.
    let waited = handle.wait().await;
    ctx.coordinator.deregister(&task.id);
    if let Some(task) = jsonl_task {
        let _ = task.await;
    }

    let agent_result = match waited {
        Ok(result) => result,
        Err(e) => {
            release(&ctx, &worktree, true).await;
            return fail(FailurePhase::AgentExecution, e.to_string(), Some(worktree));
        }
    };

    let subagent_summary = {
        let parser = parser.lock().unwrap();
        if parser.has_events() {
            Some(parser.trace().stats)
        } else {
            None
        }
    };

    let (status, error) = match agent_result.status {
        ExecutionStatus::Completed => (ParallelTaskStatus::Completed, None),
        ExecutionStatus::Interrupted if ctx.shutdown.load(Ordering::SeqCst) => {
            (ParallelTaskStatus::Cancelled, None)
        }
        ExecutionStatus::Interrupted => (
            ParallelTaskStatus::Failed,
            Some(ParallelTaskError::new(
                FailurePhase::AgentExecution,
                "agent interrupted",
            )),
        ),
        ExecutionStatus::Failed | ExecutionStatus::Timeout => (
            ParallelTaskStatus::Failed,
            Some(ParallelTaskError::new(
                FailurePhase::AgentExecution,
                agent_result
                    .error
                    .clone()
                    .unwrap_or_else(|| "agent execution failed".to_string()),
            )),
        ),
    };

    let task_failed = status == ParallelTaskStatus::Failed;
    release(&ctx, &worktree, !task_failed).await;

    finish(
        status,
        Some(worktree),
        agent_result.stdout,
        agent_result.stderr,
        agent_result.exit_code,
        error,
        subagent_summary,
    )
}

/// Release the worktree, or preserve it when a failed task asked for that.
async fn release(ctx: &TaskContext, worktree: &ManagedWorktree, succeeded: bool) {
    let preserve = !succeeded && ctx.config.parallel.preserve_failed_worktrees;
    let outcome = if preserve {
        ctx.pool.preserve(worktree.id).await
    } else {
        ctx.pool.release(worktree.id).await
    };
    if let Err(e) = outcome {
        warn!(worktree = %worktree.name, error = %e, "Worktree release failed");
    }
}

/// Build the Markdown failure report for a finished batch.
pub fn build_failure_report(
    results: &[ParallelTaskResult],
    preserved_worktrees: bool,
    duration_ms: u64,
) -> String {
    let (completed, failed, cancelled) = count(results);
    let total = results.len();
    let success_rate = if total == 0 {
        0.0
    } else {
        completed as f64 * 100.0 / total as f64
    };

    let mut report = String::from("# Parallel Execution Failure Report\n\n## Summary\n\n");
    report.push_str(&format!("- **Total tasks**: {total}\n"));
    report.push_str(&format!("- **Completed**: {completed}\n"));
    report.push_str(&format!("- **Failed**: {failed}\n"));
    report.push_str(&format!("- **Cancelled**: {cancelled}\n"));
    report.push_str(&format!("- **Success rate**: {success_rate:.1}%\n"));
    report.push_str(&format!("- **Duration**: {}\n", format_duration(duration_ms)));

    report.push_str("\n## Failures\n");
    for result in results {
        if result.status != ParallelTaskStatus::Failed {
            continue;
        }
        let error = result.error.as_ref();
        report.push_str(&format!("\n### Task {}\n\n", result.task.id));
        report.push_str(&format!("- **Title**: {}\n", result.task.title));
        report.push_str(&format!(
            "- **Agent**: {}\n",
            result
                .worktree
                .as_ref()
                .and_then(|wt| wt.agent_id.clone())
                .unwrap_or_else(|| "unknown".to_string())
        ));
        report.push_str(&format!("- **Work Unit**: {}\n", result.work_unit));
        if let Some(ref worktree) = result.worktree {
            report.push_str(&format!("- **Worktree**: {}\n", worktree.path.display()));
        }
        report.push_str(&format!(
            "- **Phase**: {}\n",
            error.map_or("unknown", |e| e.phase.as_str())
        ));
        report.push_str(&format!(
            "- **Error**: {}\n",
            error.map_or("unknown", |e| e.message.as_str())
        ));
        report.push_str(&format!("- **Duration**: {}ms\n", result.duration_ms));

        if !result.stderr.is_empty() {
            let head: String = result.stderr.chars().take(2000).collect();
            report.push_str("\n#### stderr (first 2000 chars)\n\n```\n");
            report.push_str(&head);
            report.push_str("\n```\n");
        }
        if !result.stdout.is_empty() {
            let chars: Vec<char> = result.stdout.chars().collect();
            let tail: String = chars[chars.len().saturating_sub(500)..].iter().collect();
            report.push_str("\n#### stdout (last 500 chars)\n\n```\n");
            report.push_str(&tail);
            report.push_str("\n```\n");
        }
    }

    if preserved_worktrees {
        let preserved: Vec<&ManagedWorktree> = results
            .iter()
            .filter(|r| r.status == ParallelTaskStatus::Failed)
            .filter_map(|r| r.worktree.as_ref())
            .collect();
        if !preserved.is_empty() {
            report.push_str("\n## Preserved Worktrees\n\n");
            for worktree in preserved {
                report.push_str(&format!(
                    "- {} ({})\n",
                    worktree.path.display(),
                    worktree.branch
                ));
            }
        }
    }

    report
}

//! The engine loop body and error-handling state machine.

use chrono::{DateTime, Utc};
use regex::Regex;
use std::collections::HashMap;
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::{EngineEvent, ExecutionEngine, FailureAction};
use crate::domain::errors::EngineResult;
use crate::domain::models::{
    AgentExecutionResult, EngineStatus, ExecutionStatus, IterationResult, IterationStatus,
    StopReason, Task, TaskFilter, TaskStatus,
};
use crate::domain::ports::ExecOptions;
use crate::services::log_store::{LogMetadata, SaveOptions};
use crate::services::rate_limit_detector::RateLimitVerdict;

/// Poll cadence while paused.
const PAUSE_POLL: Duration = Duration::from_millis(100);

/// What the outer loop should do after an iteration.
pub(crate) enum Disposition {
    Continue,
    Abort,
}

/// Outcome of one loop-body attempt.
pub(crate) enum BodyOutcome {
    Finished(IterationResult),
    RateLimited {
        result: IterationResult,
        verdict: RateLimitVerdict,
    },
}

fn promise_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?i)<promise>\s*COMPLETE\s*</promise>").expect("static regex")
    })
}

/// Case-insensitive, whitespace-tolerant completion marker check.
pub fn promise_found(stdout: &str) -> bool {
    promise_regex().is_match(stdout)
}

impl ExecutionEngine {
    pub(crate) async fn run_loop(&self) -> EngineResult<StopReason> {
        loop {
            self.pause_gate().await;

            if self.shutdown_requested() {
                return Ok(StopReason::Interrupted);
            }

            let on_fallback = self
                .active_agent()
                .map(|agent| agent.reason == crate::domain::models::AgentBindingReason::Fallback)
                .unwrap_or(false);
            if on_fallback && self.config.rate_limit.recover_primary_between_iterations {
                self.attempt_primary_recovery().await;
            }

            let (current, max) = {
                let state = self.state.lock().unwrap();
                (state.current_iteration, state.max_iterations)
            };
            if max > 0 && current >= max {
                return Ok(StopReason::MaxIterations);
            }

            if self.epic_complete().await? {
                self.emit(EngineEvent::AllComplete);
                return Ok(StopReason::Completed);
            }

            let Some(task) = self.select_next_task().await? else {
                return Ok(StopReason::NoTasks);
            };

            match self.run_task_iteration(task).await {
                Disposition::Continue => {}
                Disposition::Abort => return Ok(StopReason::Error),
            }

            if !self.shutdown_requested() && self.config.iteration_delay_ms > 0 {
                tokio::time::sleep(Duration::from_millis(self.config.iteration_delay_ms)).await;
            }
        }
    }

    /// Cooperative pause: honor a pending pause request and poll until the
    /// engine is resumed or stopped.
    async fn pause_gate(&self) {
        {
            let mut status = self.status.lock().unwrap();
            if *status != EngineStatus::Pausing {
                return;
            }
            *status = EngineStatus::Paused;
        }
        self.emit(EngineEvent::EnginePaused);
        info!("Engine paused");

        while self.is_paused() && !self.shutdown_requested() {
            tokio::time::sleep(PAUSE_POLL).await;
        }

        if self.status() == EngineStatus::Running {
            self.emit(EngineEvent::EngineResumed);
            info!("Engine resumed");
        }
    }

    async fn epic_complete(&self) -> EngineResult<bool> {
        let (is_worker, completed) = {
            let state = self.state.lock().unwrap();
            (state.worker_task.is_some(), state.tasks_completed)
        };
        if is_worker {
            return Ok(completed >= 1);
        }
        self.tracker.is_complete().await
    }

    async fn select_next_task(&self) -> EngineResult<Option<Task>> {
        let (worker_task, worker_processed, skipped) = {
            let state = self.state.lock().unwrap();
            (
                state.worker_task.clone(),
                state.worker_processed,
                state.skipped.iter().cloned().collect::<Vec<_>>(),
            )
        };

        if let Some(task) = worker_task {
            return Ok(if worker_processed { None } else { Some(task) });
        }

        self.tracker
            .get_next_task(&TaskFilter::actionable(skipped))
            .await
    }

    pub(crate) async fn run_task_iteration(&self, task: Task) -> Disposition {
        let iteration = {
            let mut state = self.state.lock().unwrap();
            state.current_iteration += 1;
            state.current_task = Some(task.clone());
            state.current_iteration
        };

        let disposition = self.run_task_attempts(&task, iteration).await;

        let mut state = self.state.lock().unwrap();
        state.current_task = None;
        if state.worker_task.is_some() {
            state.worker_processed = true;
        }
        drop(state);

        disposition
    }

    /// Generic-failure retry loop. Rate-limit retries happen one level
    /// down and do not consume generic retries.
    async fn run_task_attempts(&self, task: &Task, iteration: u32) -> Disposition {
        let strategy = self.config.retry.strategy;
        let max_retries = self.config.retry.max_retries;

        loop {
            let (result, rate_limit_exhausted) = self.run_rate_limit_attempts(task, iteration).await;

            if rate_limit_exhausted {
                // Every agent in the chain is limited; the engine has been
                // paused for the operator. Record the failure and move on.
                self.finish_iteration(result).await;
                return Disposition::Continue;
            }

            match result.status {
                IterationStatus::Completed | IterationStatus::Interrupted => {
                    if result.status == IterationStatus::Completed {
                        self.state.lock().unwrap().retry_counts.remove(&task.id);
                    }
                    self.finish_iteration(result).await;
                    return Disposition::Continue;
                }
                IterationStatus::Failed => {
                    let error = result
                        .error
                        .clone()
                        .unwrap_or_else(|| "iteration failed".to_string());

                    match strategy {
                        crate::domain::models::ErrorStrategy::Abort => {
                            self.emit(EngineEvent::IterationFailed {
                                iteration,
                                action: FailureAction::Abort,
                                error,
                            });
                            self.finish_iteration(result).await;
                            return Disposition::Abort;
                        }
                        crate::domain::models::ErrorStrategy::Retry => {
                            let count = {
                                let state = self.state.lock().unwrap();
                                state.retry_counts.get(&task.id).copied().unwrap_or(0)
                            };
                            if count < max_retries {
                                self.emit(EngineEvent::IterationFailed {
                                    iteration,
                                    action: FailureAction::Retry,
                                    error,
                                });
                                self.emit(EngineEvent::IterationRetrying {
                                    attempt: count + 1,
                                    max: max_retries,
                                });
                                self.state
                                    .lock()
                                    .unwrap()
                                    .retry_counts
                                    .insert(task.id.clone(), count + 1);
                                // Record the failed attempt without closing
                                // the iteration.
                                self.state.lock().unwrap().iterations.push(result);
                                if self.config.retry.retry_delay_ms > 0 {
                                    tokio::time::sleep(Duration::from_millis(
                                        self.config.retry.retry_delay_ms,
                                    ))
                                    .await;
                                }
                                if self.shutdown_requested() {
                                    return Disposition::Continue;
                                }
                                continue;
                            }
                            self.skip_task(task, iteration, result, error).await;
                            return Disposition::Continue;
                        }
                        crate::domain::models::ErrorStrategy::Skip => {
                            self.skip_task(task, iteration, result, error).await;
                            return Disposition::Continue;
                        }
                    }
                }
                IterationStatus::Running | IterationStatus::Skipped => {
                    // Attempts never finish in these states.
                    warn!(status = result.status.as_str(), "Unexpected attempt status");
                    return Disposition::Continue;
                }
            }
        }
    }

    async fn skip_task(
        &self,
        task: &Task,
        iteration: u32,
        mut result: IterationResult,
        error: String,
    ) {
        self.emit(EngineEvent::IterationFailed {
            iteration,
            action: FailureAction::Skip,
            error,
        });
        self.emit(EngineEvent::IterationSkipped {
            task_id: task.id.clone(),
        });
        self.state.lock().unwrap().skipped.insert(task.id.clone());
        result.status = IterationStatus::Skipped;
        self.finish_iteration(result).await;
    }

    /// Record the final result of an iteration, persist its log, and close
    /// it with `iteration:completed`.
    async fn finish_iteration(&self, result: IterationResult) {
        self.persist_iteration_log(&result).await;
        self.state.lock().unwrap().iterations.push(result.clone());
        self.emit(EngineEvent::IterationCompleted { result });
    }

    /// Rate-limit retry loop around the body: backoff with server hints,
    /// then fallback traversal on exhaustion. Returns the terminal result
    /// and whether the whole chain was found limited.
    async fn run_rate_limit_attempts(
        &self,
        task: &Task,
        iteration: u32,
    ) -> (IterationResult, bool) {
        loop {
            match self.execute_iteration_body(task, iteration).await {
                BodyOutcome::Finished(result) => return (result, false),
                BodyOutcome::RateLimited { result, verdict } => {
                    match self.handle_rate_limit(task, &verdict).await {
                        super::rate_limit::RateLimitDisposition::Retry
                        | super::rate_limit::RateLimitDisposition::Switched => continue,
                        super::rate_limit::RateLimitDisposition::AllLimited => {
                            return (result, true)
                        }
                    }
                }
            }
        }
    }

    /// One pass of the iteration body: activate the task, render the
    /// prompt, execute the agent, and classify the outcome.
    async fn execute_iteration_body(&self, task: &Task, iteration: u32) -> BodyOutcome {
        self.parser.lock().unwrap().reset();

        let started_at = Utc::now();
        let make = |status: IterationStatus,
                    task_completed: bool,
                    promise_complete: bool,
                    error: Option<String>,
                    agent_result: Option<AgentExecutionResult>| {
            build_result(
                iteration,
                task.clone(),
                started_at,
                status,
                task_completed,
                promise_complete,
                error,
                agent_result,
            )
        };

        self.emit(EngineEvent::IterationStarted {
            iteration,
            task: task.clone(),
        });
        self.emit(EngineEvent::TaskSelected { task: task.clone() });

        if let Err(e) = self
            .tracker
            .update_task_status(&task.id, TaskStatus::InProgress)
            .await
        {
            return BodyOutcome::Finished(make(
                IterationStatus::Failed,
                false,
                false,
                Some(format!("tracker error: {e}")),
                None,
            ));
        }
        self.state
            .lock()
            .unwrap()
            .activated_tasks
            .insert(task.id.clone());
        self.emit(EngineEvent::TaskActivated {
            task_id: task.id.clone(),
        });

        let rendered = match self.render_prompt(task) {
            Ok(rendered) => rendered,
            Err(e) => {
                return BodyOutcome::Finished(make(
                    IterationStatus::Failed,
                    false,
                    false,
                    Some(e.to_string()),
                    None,
                ))
            }
        };

        let Some(plugin) = self.active_plugin() else {
            return BodyOutcome::Finished(make(
                IterationStatus::Failed,
                false,
                false,
                Some("no agent bound".to_string()),
                None,
            ));
        };
        let family = plugin.meta().id;

        // Stream forwarding: chunks become events, JSONL messages feed the
        // subagent parser. Forwarders drain before the iteration closes.
        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<crate::domain::ports::agent::OutputChunk>();
        let events = Arc::clone(&self.events);
        let out_task = tokio::spawn(async move {
            while let Some(chunk) = out_rx.recv().await {
                events.emit(&EngineEvent::AgentOutput {
                    stream: chunk.stream,
                    chunk: chunk.text,
                });
            }
        });

        let (jsonl_tx, jsonl_task) = if plugin.meta().supports_subagent_tracing {
            let (tx, mut rx) = mpsc::unbounded_channel::<serde_json::Value>();
            let parser = Arc::clone(&self.parser);
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
            working_dir: Some(self.cwd.clone()),
            env: HashMap::new(),
            timeout: None,
            output_cap_chars: self.config.output_cap_chars,
            on_output: Some(out_tx),
            on_jsonl: jsonl_tx,
        };

        let handle = match plugin.execute(&rendered.prompt, &[], options).await {
            Ok(handle) => handle,
            Err(e) => {
                let _ = out_task.await;
                if let Some(task) = jsonl_task {
                    let _ = task.await;
                }
                return BodyOutcome::Finished(make(
                    IterationStatus::Failed,
                    false,
                    false,
                    Some(e.to_string()),
                    None,
                ));
            }
        };

        *self.current_interrupt.lock().unwrap() = Some(handle.interrupt_signal());
        let waited = handle.wait().await;
        *self.current_interrupt.lock().unwrap() = None;

        let _ = out_task.await;
        if let Some(task) = jsonl_task {
            let _ = task.await;
        }

        let agent_result = match waited {
            Ok(result) => result,
            Err(e) => {
                return BodyOutcome::Finished(make(
                    IterationStatus::Failed,
                    false,
                    false,
                    Some(e.to_string()),
                    None,
                ))
            }
        };

        let verdict = self.detector.detect(&agent_result, family);
        if verdict.is_rate_limit {
            debug!(task_id = %task.id, message = ?verdict.message, "Rate limit detected");
            let result = make(
                IterationStatus::Failed,
                false,
                false,
                Some(
                    verdict
                        .message
                        .clone()
                        .unwrap_or_else(|| "agent rate-limited".to_string()),
                ),
                Some(agent_result),
            );
            return BodyOutcome::RateLimited { result, verdict };
        }

        let promise = promise_found(&agent_result.stdout);

        match agent_result.status {
            ExecutionStatus::Interrupted => BodyOutcome::Finished(make(
                IterationStatus::Interrupted,
                false,
                promise,
                None,
                Some(agent_result),
            )),
            ExecutionStatus::Completed => {
                let task_completed = promise;
                if task_completed {
                    if let Err(e) = self.tracker.complete_task(&task.id, None).await {
                        return BodyOutcome::Finished(make(
                            IterationStatus::Failed,
                            false,
                            promise,
                            Some(format!("tracker error: {e}")),
                            Some(agent_result),
                        ));
                    }
                    {
                        let mut state = self.state.lock().unwrap();
                        state.tasks_completed += 1;
                        state.activated_tasks.remove(&task.id);
                        // Fairness across tasks: completing a task clears the
                        // per-task limited set.
                        state.rate_limited_agents.clear();
                        state.rate_limit_retry_counts.remove(&task.id);
                    }
                    self.emit(EngineEvent::TaskCompleted {
                        task_id: task.id.clone(),
                    });
                    self.run_auto_commit(task).await;
                }
                BodyOutcome::Finished(make(
                    IterationStatus::Completed,
                    task_completed,
                    promise,
                    None,
                    Some(agent_result),
                ))
            }
            ExecutionStatus::Failed | ExecutionStatus::Timeout => {
                let error = agent_result
                    .error
                    .clone()
                    .unwrap_or_else(|| "agent execution failed".to_string());
                BodyOutcome::Finished(make(
                    IterationStatus::Failed,
                    false,
                    promise,
                    Some(error),
                    Some(agent_result),
                ))
            }
        }
    }

    async fn run_auto_commit(&self, task: &Task) {
        if !self.config.auto_commit {
            return;
        }
        let Some(ref auto_commit) = self.auto_commit else {
            return;
        };

        match auto_commit.perform(&self.cwd, &task.id, &task.title).await {
            Ok(outcome) if outcome.committed => self.emit(EngineEvent::AutoCommitted {
                task_id: task.id.clone(),
                commit_sha: outcome.commit_sha,
                commit_message: outcome.commit_message,
            }),
            Ok(outcome) => match outcome.skip_reason {
                Some(reason) => self.emit(EngineEvent::AutoCommitSkipped {
                    task_id: task.id.clone(),
                    reason,
                }),
                None => self.emit(EngineEvent::AutoCommitFailed {
                    task_id: task.id.clone(),
                    error: outcome
                        .error
                        .unwrap_or_else(|| "auto-commit failed".to_string()),
                }),
            },
            Err(e) => self.emit(EngineEvent::AutoCommitFailed {
                task_id: task.id.clone(),
                error: e.to_string(),
            }),
        }
    }

    /// Persist the iteration log. Failures are warnings, never iteration
    /// failures.
    async fn persist_iteration_log(&self, result: &IterationResult) {
        let trace = {
            let parser = self.parser.lock().unwrap();
            if parser.has_events() {
                Some(parser.trace())
            } else {
                None
            }
        };

        let (switches, active_id) = {
            let mut state = self.state.lock().unwrap();
            let switches = std::mem::take(&mut state.pending_switches);
            let active = state
                .active_agent
                .as_ref()
                .map(|agent| agent.plugin_id.clone());
            (switches, active)
        };

        let completion_summary = if switches.is_empty() {
            None
        } else {
            let moves: Vec<String> = switches
                .iter()
                .map(|s| format!("{} to {} ({})", s.from, s.to, s.reason.as_str()))
                .collect();
            Some(format!(
                "Iteration ran with {} agent switch(es): {}",
                switches.len(),
                moves.join("; ")
            ))
        };

        let model = active_id
            .as_deref()
            .map(|id| self.config.agent_options(id))
            .and_then(|options| options.model)
            .or_else(|| self.config.model.clone());

        let metadata = LogMetadata {
            iteration: result.iteration,
            task_id: result.task.id.clone(),
            task_title: result.task.title.clone(),
            description: result.task.description.clone(),
            status: result.status,
            task_completed: result.task_completed,
            promise_complete: result.promise_complete,
            started_at: result.started_at,
            ended_at: result.ended_at,
            error: result.error.clone(),
            agent: active_id,
            model,
            epic: self.config.epic.clone(),
            sandbox_mode: self
                .config
                .sandbox
                .enabled
                .then(|| self.config.sandbox.mode.clone()),
            sandbox_network: self
                .config
                .sandbox
                .enabled
                .then_some(self.config.sandbox.network),
            completion_summary,
            switches,
        };

        let (stdout, stderr) = result
            .agent_result
            .as_ref()
            .map(|r| (r.stdout.as_str(), r.stderr.as_str()))
            .unwrap_or(("", ""));

        let save_options = SaveOptions {
            session_id: Some(self.session_id.clone()),
            ..Default::default()
        };

        if let Err(e) = self
            .log_store
            .save_iteration_log(&self.cwd, &metadata, stdout, stderr, trace.as_ref(), &save_options)
            .await
        {
            warn!(error = %e, iteration = result.iteration, "Failed to persist iteration log");
            self.emit(EngineEvent::Warning {
                message: format!("log persistence failed: {e}"),
            });
        }
    }
}

#[allow(clippy::too_many_arguments)]
fn build_result(
    iteration: u32,
    task: Task,
    started_at: DateTime<Utc>,
    status: IterationStatus,
    task_completed: bool,
    promise_complete: bool,
    error: Option<String>,
    agent_result: Option<AgentExecutionResult>,
) -> IterationResult {
    let ended_at = Utc::now();
    IterationResult {
        iteration,
        task,
        status,
        task_completed,
        promise_complete,
        started_at,
        ended_at,
        duration_ms: (ended_at - started_at).num_milliseconds().max(0) as u64,
        error,
        agent_result,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_promise_marker_variants() {
        assert!(promise_found("done\n<promise>COMPLETE</promise>\n"));
        assert!(promise_found("<promise>complete</promise>"));
        assert!(promise_found("<PROMISE> Complete </PROMISE>"));
        assert!(promise_found("text <promise>  COMPLETE  </promise> text"));
        assert!(!promise_found("<promise>INCOMPLETE</promise>"));
        assert!(!promise_found("promise COMPLETE"));
    }
}

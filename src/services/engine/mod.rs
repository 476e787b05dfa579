//! Execution engine.
//!
//! Drives the outer loop: select the next actionable task, render a prompt,
//! execute the bound agent, detect completion, update the tracker, persist
//! the iteration log, and route failures through the retry/skip/abort state
//! machine. The engine is a thin coordinator over well-defined subsystems:
//!
//! - **events**: typed event variants and the synchronous listener channel
//! - **iteration**: the loop body and error-handling state machine
//! - **rate_limit**: backoff, fallback-chain traversal, primary recovery

pub mod events;
mod iteration;
mod rate_limit;

pub use events::{EngineEvent, EventChannel, FailureAction, Subscription};

use chrono::{DateTime, Utc};
use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tracing::{info, warn};
use uuid::Uuid;

use crate::domain::errors::{EngineError, EngineResult};
use crate::domain::models::{
    ActiveAgent, AgentBindingReason, AgentSwitchRecord, EngineConfig, EngineStatus, IterationInfo,
    IterationResult, RateLimitState, StopReason, Task, TaskFilter, TaskStatus,
};
use crate::domain::ports::{
    AgentFactory, AgentPlugin, AutoCommit, ExtendedContext, InterruptSignal, TemplateRenderer,
    Tracker,
};
use crate::services::log_store::LogStore;
use crate::services::rate_limit_detector::RateLimitDetector;
use crate::services::subagent_parser::SubagentParser;

/// Collaborators injected into the engine.
pub struct EngineDeps {
    pub tracker: Arc<dyn Tracker>,
    pub registry: Arc<dyn AgentFactory>,
    pub renderer: Arc<dyn TemplateRenderer>,
    pub auto_commit: Option<Arc<dyn AutoCommit>>,
}

/// Worker mode: a single forced task, used by the parallel executor and by
/// external supervisors that shard an epic across engines.
#[derive(Debug, Clone)]
pub struct WorkerMode {
    pub task: Task,
}

pub(crate) struct AgentSlots {
    /// The primary instance, preserved across fallback switches so recovery
    /// can swap back without re-instantiation.
    pub primary: Arc<dyn AgentPlugin>,
    pub active: Arc<dyn AgentPlugin>,
}

#[derive(Default)]
pub(crate) struct LoopState {
    pub initialized: bool,
    pub current_iteration: u32,
    pub max_iterations: u32,
    pub total_tasks: usize,
    pub tasks_completed: usize,
    pub current_task: Option<Task>,
    pub iterations: Vec<IterationResult>,
    pub active_agent: Option<ActiveAgent>,
    pub rate_limit_state: Option<RateLimitState>,
    /// Tasks the engine decided to skip this session
    pub skipped: HashSet<String>,
    /// Agents found rate-limited for the current task
    pub rate_limited_agents: HashSet<String>,
    pub retry_counts: HashMap<String, u32>,
    pub rate_limit_retry_counts: HashMap<String, u32>,
    /// Switch records waiting to be written into the next persisted log
    pub pending_switches: Vec<AgentSwitchRecord>,
    /// Tasks this engine set to in_progress and has not completed
    pub activated_tasks: HashSet<String>,
    pub worker_task: Option<Task>,
    pub worker_processed: bool,
    pub started_at: Option<DateTime<Utc>>,
}

/// The iterative agent execution engine.
pub struct ExecutionEngine {
    pub(crate) config: EngineConfig,
    pub(crate) cwd: PathBuf,
    pub(crate) session_id: String,
    pub(crate) tracker: Arc<dyn Tracker>,
    pub(crate) registry: Arc<dyn AgentFactory>,
    pub(crate) renderer: Arc<dyn TemplateRenderer>,
    pub(crate) auto_commit: Option<Arc<dyn AutoCommit>>,
    pub(crate) log_store: LogStore,
    pub(crate) detector: RateLimitDetector,
    pub(crate) events: Arc<EventChannel<EngineEvent>>,
    pub(crate) status: Mutex<EngineStatus>,
    pub(crate) shutdown: AtomicBool,
    pub(crate) state: Mutex<LoopState>,
    pub(crate) agents: Mutex<Option<AgentSlots>>,
    pub(crate) current_interrupt: Mutex<Option<Arc<InterruptSignal>>>,
    pub(crate) parser: Arc<Mutex<SubagentParser>>,
}

impl ExecutionEngine {
    pub fn new(config: EngineConfig, cwd: impl Into<PathBuf>, deps: EngineDeps) -> Self {
        let log_store = LogStore::new(config.logs_dir.clone());
        let max_iterations = config.max_iterations;
        Self {
            config,
            cwd: cwd.into(),
            session_id: Uuid::new_v4().simple().to_string(),
            tracker: deps.tracker,
            registry: deps.registry,
            renderer: deps.renderer,
            auto_commit: deps.auto_commit,
            log_store,
            detector: RateLimitDetector::new(),
            events: Arc::new(EventChannel::new()),
            status: Mutex::new(EngineStatus::Idle),
            shutdown: AtomicBool::new(false),
            state: Mutex::new(LoopState {
                max_iterations,
                ..Default::default()
            }),
            agents: Mutex::new(None),
            current_interrupt: Mutex::new(None),
            parser: Arc::new(Mutex::new(SubagentParser::new())),
        }
    }

    /// Register an event listener.
    pub fn listen(
        &self,
        callback: impl Fn(&EngineEvent) + Send + Sync + 'static,
    ) -> Subscription<EngineEvent> {
        self.events.listen(callback)
    }

    pub(crate) fn emit(&self, event: EngineEvent) {
        self.events.emit(&event);
    }

    /// Bind and verify the primary agent, then size the run.
    ///
    /// Fails when the agent CLI is unavailable, the configured model is
    /// rejected, or (outside worker mode) the tracker cannot be reached.
    pub async fn initialize(&self, worker: Option<WorkerMode>) -> EngineResult<()> {
        let mut options = self.config.agent_options(&self.config.agent);
        if options.model.is_none() {
            options.model = self.config.model.clone();
        }

        let primary = self
            .registry
            .create(&self.config.agent, options.clone())
            .ok_or_else(|| {
                EngineError::PluginUnavailable(format!("unknown agent plugin '{}'", self.config.agent))
            })?;
        primary.initialize(options.clone()).await?;

        let detection = primary.detect().await;
        if !detection.available {
            return Err(EngineError::PluginUnavailable(detection.error.unwrap_or_else(
                || format!("{} is not available", self.config.agent),
            )));
        }

        if let Some(ref model) = options.model {
            if let Some(reason) = primary.validate_model(model) {
                return Err(EngineError::ModelInvalid {
                    plugin: self.config.agent.clone(),
                    model: model.clone(),
                    reason,
                });
            }
        }

        let total_tasks = match worker {
            Some(ref worker) => {
                let mut state = self.state.lock().unwrap();
                state.worker_task = Some(worker.task.clone());
                state.worker_processed = false;
                1
            }
            None => {
                self.tracker.sync().await?;
                let open = self
                    .tracker
                    .get_tasks(&TaskFilter::actionable(vec![]))
                    .await?;
                open.len()
            }
        };

        {
            let mut state = self.state.lock().unwrap();
            state.initialized = true;
            state.total_tasks = total_tasks;
            state.active_agent = Some(ActiveAgent::primary(&self.config.agent));
            state.rate_limit_state = Some(RateLimitState::new(&self.config.agent));
        }
        *self.agents.lock().unwrap() = Some(AgentSlots {
            primary: Arc::clone(&primary),
            active: primary,
        });

        info!(
            agent = %self.config.agent,
            version = ?detection.version,
            total_tasks,
            worker_mode = worker.is_some(),
            "Engine initialized"
        );
        Ok(())
    }

    /// Run the loop to completion. Returns the stop reason.
    pub async fn start(&self) -> EngineResult<StopReason> {
        {
            let mut status = self.status.lock().unwrap();
            if *status != EngineStatus::Idle {
                return Err(EngineError::InvalidStateTransition {
                    from: status.as_str().to_string(),
                    to: "running".to_string(),
                });
            }
            let state = self.state.lock().unwrap();
            if !state.initialized {
                return Err(EngineError::ValidationFailed(
                    "engine not initialized".to_string(),
                ));
            }
            *status = EngineStatus::Running;
        }
        self.shutdown.store(false, Ordering::SeqCst);
        self.state.lock().unwrap().started_at = Some(Utc::now());

        self.emit_started().await;
        self.warn_on_sandbox_network_mismatch();

        let reason = match self.run_loop().await {
            Ok(reason) => reason,
            Err(e) => {
                warn!(error = %e, "Engine loop stopped on error");
                StopReason::Error
            }
        };

        *self.status.lock().unwrap() = EngineStatus::Idle;
        self.state.lock().unwrap().current_task = None;
        self.emit(EngineEvent::EngineStopped { reason });
        Ok(reason)
    }

    async fn emit_started(&self) {
        let (tasks, completed) = if let Some(task) = self.worker_task() {
            (vec![task], Vec::new())
        } else {
            let open = self
                .tracker
                .get_tasks(&TaskFilter::actionable(vec![]))
                .await
                .unwrap_or_default();
            let completed = self
                .tracker
                .get_tasks(&TaskFilter {
                    status: vec![TaskStatus::Completed],
                    exclude_ids: vec![],
                })
                .await
                .unwrap_or_default();
            (open, completed)
        };
        let total = self.state.lock().unwrap().total_tasks;
        self.emit(EngineEvent::EngineStarted {
            tasks,
            completed,
            total,
        });
    }

    fn warn_on_sandbox_network_mismatch(&self) {
        if !self.config.sandbox.enabled || self.config.sandbox.network {
            return;
        }
        let requires_network = self
            .active_plugin()
            .map(|plugin| plugin.sandbox_requirements().requires_network)
            .unwrap_or(false);
        if requires_network {
            self.emit(EngineEvent::Warning {
                message: format!(
                    "sandbox network access is disabled but agent '{}' requires network",
                    self.config.agent
                ),
            });
        }
    }

    /// Request the loop to stop and interrupt any running agent.
    pub fn stop(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
        {
            let mut status = self.status.lock().unwrap();
            if matches!(
                *status,
                EngineStatus::Running | EngineStatus::Pausing | EngineStatus::Paused
            ) {
                *status = EngineStatus::Stopping;
            }
        }
        if let Some(signal) = self.current_interrupt.lock().unwrap().as_ref() {
            signal.interrupt();
        }
    }

    pub fn pause(&self) {
        let mut status = self.status.lock().unwrap();
        if *status == EngineStatus::Running {
            *status = EngineStatus::Pausing;
        }
    }

    pub fn resume(&self) {
        let mut status = self.status.lock().unwrap();
        if matches!(*status, EngineStatus::Pausing | EngineStatus::Paused) {
            *status = EngineStatus::Running;
        }
    }

    pub fn is_paused(&self) -> bool {
        *self.status.lock().unwrap() == EngineStatus::Paused
    }

    pub fn is_pausing(&self) -> bool {
        *self.status.lock().unwrap() == EngineStatus::Pausing
    }

    pub fn status(&self) -> EngineStatus {
        *self.status.lock().unwrap()
    }

    /// Raise the iteration budget. A budget of zero stays unbounded.
    pub fn add_iterations(&self, n: u32) {
        let mut state = self.state.lock().unwrap();
        if state.max_iterations > 0 {
            state.max_iterations = state.max_iterations.saturating_add(n);
        }
    }

    /// Lower the iteration budget, but never below what has already run.
    pub fn remove_iterations(&self, n: u32) {
        let mut state = self.state.lock().unwrap();
        if state.max_iterations > 0 {
            state.max_iterations = state
                .max_iterations
                .saturating_sub(n)
                .max(state.current_iteration);
        }
    }

    /// Clear a pending shutdown and resume if paused, so a stopped-at-limit
    /// engine can be started again.
    pub fn continue_execution(&self) {
        self.shutdown.store(false, Ordering::SeqCst);
        self.resume();
    }

    pub fn get_iteration_info(&self) -> IterationInfo {
        let state = self.state.lock().unwrap();
        IterationInfo {
            current_iteration: state.current_iteration,
            max_iterations: state.max_iterations,
            tasks_completed: state.tasks_completed,
            total_tasks: state.total_tasks,
        }
    }

    /// All iteration results recorded this session.
    pub fn iteration_results(&self) -> Vec<IterationResult> {
        self.state.lock().unwrap().iterations.clone()
    }

    pub fn active_agent(&self) -> Option<ActiveAgent> {
        self.state.lock().unwrap().active_agent.clone()
    }

    pub fn rate_limit_state(&self) -> Option<RateLimitState> {
        self.state.lock().unwrap().rate_limit_state.clone()
    }

    /// Re-query the tracker and refresh the task totals.
    pub async fn refresh_tasks(&self) -> EngineResult<()> {
        let open = self
            .tracker
            .get_tasks(&TaskFilter::actionable(vec![]))
            .await?;
        let completed = self
            .tracker
            .get_tasks(&TaskFilter {
                status: vec![TaskStatus::Completed],
                exclude_ids: vec![],
            })
            .await?;
        {
            let mut state = self.state.lock().unwrap();
            state.total_tasks = open.len() + completed.len();
            state.tasks_completed = completed.len();
        }
        self.emit(EngineEvent::TasksRefreshed {
            open: open.len(),
            completed: completed.len(),
        });
        Ok(())
    }

    /// Render the prompt for a task without executing anything.
    pub async fn generate_prompt_preview(&self, task_id: &str) -> EngineResult<String> {
        let tasks = self.tracker.get_tasks(&TaskFilter::default()).await?;
        let task = tasks
            .into_iter()
            .find(|t| t.id == task_id)
            .ok_or_else(|| EngineError::TaskNotFound(task_id.to_string()))?;
        let rendered = self.render_prompt(&task)?;
        Ok(rendered.prompt)
    }

    /// Revert tasks this engine marked in_progress but never completed.
    /// Used on shutdown so a crashed or stopped run doesn't strand tasks.
    pub async fn reset_tasks_to_open(&self, ids: &[String]) -> EngineResult<()> {
        let owned: Vec<String> = {
            let state = self.state.lock().unwrap();
            ids.iter()
                .filter(|id| state.activated_tasks.contains(*id))
                .cloned()
                .collect()
        };
        for id in &owned {
            if let Err(e) = self.tracker.update_task_status(id, TaskStatus::Open).await {
                warn!(task_id = %id, error = %e, "Failed to reset task to open");
            } else {
                self.state.lock().unwrap().activated_tasks.remove(id);
            }
        }
        Ok(())
    }

    pub(crate) fn render_prompt(
        &self,
        task: &Task,
    ) -> EngineResult<crate::domain::ports::RenderedPrompt> {
        let tracker_template = self.tracker.template();
        let extended = ExtendedContext {
            prd: self.tracker.prd_context(),
            ..Default::default()
        };
        self.renderer.render(
            task,
            &self.config,
            self.config.epic.as_deref(),
            Some(&extended),
            tracker_template.as_deref(),
        )
    }

    pub(crate) fn active_plugin(&self) -> Option<Arc<dyn AgentPlugin>> {
        self.agents
            .lock()
            .unwrap()
            .as_ref()
            .map(|slots| Arc::clone(&slots.active))
    }

    pub(crate) fn primary_plugin(&self) -> Option<Arc<dyn AgentPlugin>> {
        self.agents
            .lock()
            .unwrap()
            .as_ref()
            .map(|slots| Arc::clone(&slots.primary))
    }

    pub(crate) fn worker_task(&self) -> Option<Task> {
        self.state.lock().unwrap().worker_task.clone()
    }

    pub(crate) fn shutdown_requested(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }

    pub(crate) fn record_switch(&self, from: &str, to: &str, reason: AgentBindingReason) {
        let record = AgentSwitchRecord {
            from: from.to_string(),
            to: to.to_string(),
            reason,
            at: Utc::now(),
        };
        self.state
            .lock()
            .unwrap()
            .pending_switches
            .push(record.clone());
        self.emit(EngineEvent::AgentSwitched {
            from: record.from,
            to: record.to,
            reason,
        });
    }
}

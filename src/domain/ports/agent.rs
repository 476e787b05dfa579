//! Agent plugin port - interface for CLI-driven LLM agents.

use async_trait::async_trait;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, Notify};
use uuid::Uuid;

use crate::domain::errors::{EngineError, EngineResult};
use crate::domain::models::{
    AgentExecutionResult, AgentOptions, DetectResult, PreflightResult, SandboxRequirements,
    SubagentMessage,
};

/// Static description of an agent plugin.
#[derive(Debug, Clone)]
pub struct AgentMeta {
    pub id: &'static str,
    pub name: &'static str,
    pub default_command: &'static str,
    /// Alternate executable names probed during detection
    pub command_aliases: &'static [&'static str],
    /// Whether the plugin emits a parseable JSONL stream with task events
    pub supports_subagent_tracing: bool,
}

/// Which stream a captured chunk came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputStreamKind {
    Stdout,
    Stderr,
}

/// One streamed chunk of agent output.
#[derive(Debug, Clone)]
pub struct OutputChunk {
    pub stream: OutputStreamKind,
    pub text: String,
}

/// Per-execution options handed to `AgentPlugin::execute`.
#[derive(Debug, Default)]
pub struct ExecOptions {
    pub working_dir: Option<PathBuf>,
    /// Explicit env overlaid after filtering
    pub env: HashMap<String, String>,
    /// None or zero = no timeout
    pub timeout: Option<Duration>,
    /// In-memory tail cap per stream, in chars; 0 = runtime default
    pub output_cap_chars: usize,
    /// Receives each captured chunk as it streams
    pub on_output: Option<mpsc::UnboundedSender<OutputChunk>>,
    /// Receives each parsed JSONL message, for plugins that emit them
    pub on_jsonl: Option<mpsc::UnboundedSender<serde_json::Value>>,
}

/// Cooperative interrupt shared between an execution and its callers.
///
/// Setting the flag before the process has spawned is remembered; the runtime
/// checks it immediately after spawn.
#[derive(Debug, Default)]
pub struct InterruptSignal {
    requested: AtomicBool,
    running: AtomicBool,
    notify: Notify,
}

impl InterruptSignal {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Request interruption. Idempotent.
    pub fn interrupt(&self) {
        self.requested.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    pub fn is_requested(&self) -> bool {
        self.requested.load(Ordering::SeqCst)
    }

    pub fn set_running(&self, running: bool) {
        self.running.store(running, Ordering::SeqCst);
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Wait until interruption is requested.
    pub async fn requested(&self) {
        loop {
            if self.is_requested() {
                return;
            }
            let notified = self.notify.notified();
            tokio::pin!(notified);
            // Register interest before the final flag check so a notify
            // between check and await cannot be missed.
            notified.as_mut().enable();
            if self.is_requested() {
                return;
            }
            notified.await;
        }
    }
}

/// Handle to a running agent execution.
pub struct ExecutionHandle {
    execution_id: Uuid,
    result_rx: oneshot::Receiver<AgentExecutionResult>,
    interrupt: Arc<InterruptSignal>,
}

impl ExecutionHandle {
    pub fn new(
        execution_id: Uuid,
        result_rx: oneshot::Receiver<AgentExecutionResult>,
        interrupt: Arc<InterruptSignal>,
    ) -> Self {
        Self {
            execution_id,
            result_rx,
            interrupt,
        }
    }

    pub fn execution_id(&self) -> Uuid {
        self.execution_id
    }

    /// Shared interrupt signal, e.g. for a stop handler to hold.
    pub fn interrupt_signal(&self) -> Arc<InterruptSignal> {
        Arc::clone(&self.interrupt)
    }

    /// Request interruption of the underlying process.
    pub fn interrupt(&self) {
        self.interrupt.interrupt();
    }

    pub fn is_running(&self) -> bool {
        self.interrupt.is_running()
    }

    /// Wait for the execution to finish.
    pub async fn wait(self) -> EngineResult<AgentExecutionResult> {
        self.result_rx.await.map_err(|_| {
            EngineError::AgentExecution("execution task dropped before completing".to_string())
        })
    }
}

/// Trait for agent plugin implementations.
///
/// An agent is the external LLM-driven process invoked once per iteration.
/// The shared process runtime owns the subprocess lifecycle; plugins provide
/// command construction, stream interpretation, and metadata.
#[async_trait]
pub trait AgentPlugin: Send + Sync {
    fn meta(&self) -> &AgentMeta;

    /// Apply configured options (command override, flags, timeout, env policy).
    async fn initialize(&self, options: AgentOptions) -> EngineResult<()>;

    fn is_ready(&self) -> bool;

    /// Check the agent CLI is installed and report its version.
    async fn detect(&self) -> DetectResult;

    /// Reject models the plugin does not recognize; `None` means valid.
    fn validate_model(&self, model: &str) -> Option<String>;

    fn sandbox_requirements(&self) -> SandboxRequirements;

    /// Start an execution. Returns a handle immediately; the result is
    /// delivered through `ExecutionHandle::wait`.
    async fn execute(
        &self,
        prompt: &str,
        files: &[PathBuf],
        options: ExecOptions,
    ) -> EngineResult<ExecutionHandle>;

    /// Run a tiny prompt end-to-end to verify the agent works.
    async fn preflight(&self, timeout: Option<Duration>) -> PreflightResult;

    /// Adapt one native JSONL message into canonical subagent messages.
    ///
    /// Plugins without tracing support keep the default empty impl.
    fn canonicalize_trace(&self, _value: &serde_json::Value) -> Vec<SubagentMessage> {
        Vec::new()
    }

    /// Release any held resources.
    async fn dispose(&self) {}
}

/// Factory for creating agent plugin instances.
pub trait AgentFactory: Send + Sync {
    /// Create an agent of the given id with the given options.
    fn create(&self, plugin_id: &str, options: AgentOptions) -> Option<Arc<dyn AgentPlugin>>;

    /// List available plugin ids.
    fn available_ids(&self) -> Vec<&'static str>;
}

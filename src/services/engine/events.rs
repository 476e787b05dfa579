//! Typed engine events and the synchronous listener channel.
//!
//! Listeners run synchronously on the emitting task and must not mutate
//! engine state; a panicking listener is swallowed so the loop stays alive.

use serde::{Deserialize, Serialize};
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use tracing::warn;

use crate::domain::models::{
    AgentBindingReason, IterationResult, StopReason, Task,
};
use crate::domain::ports::OutputStreamKind;

/// What the error-handling state machine decided for a failed iteration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureAction {
    Retry,
    Skip,
    Abort,
}

impl FailureAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Retry => "retry",
            Self::Skip => "skip",
            Self::Abort => "abort",
        }
    }
}

/// Everything observable about a running engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum EngineEvent {
    EngineStarted {
        tasks: Vec<Task>,
        completed: Vec<Task>,
        total: usize,
    },
    EngineStopped {
        reason: StopReason,
    },
    EnginePaused,
    EngineResumed,
    TasksRefreshed {
        open: usize,
        completed: usize,
    },
    IterationStarted {
        iteration: u32,
        task: Task,
    },
    TaskSelected {
        task: Task,
    },
    TaskActivated {
        task_id: String,
    },
    AgentOutput {
        stream: OutputStreamKind,
        chunk: String,
    },
    IterationRateLimited {
        attempt: u32,
        max: u32,
        delay_ms: u64,
        used_retry_after: bool,
    },
    AgentSwitched {
        from: String,
        to: String,
        reason: AgentBindingReason,
    },
    AgentAllLimited {
        tried: Vec<String>,
    },
    AgentRecoveryAttempted {
        success: bool,
        test_duration_ms: u64,
        primary: String,
        fallback: String,
    },
    TaskCompleted {
        task_id: String,
    },
    IterationFailed {
        iteration: u32,
        action: FailureAction,
        error: String,
    },
    IterationRetrying {
        attempt: u32,
        max: u32,
    },
    IterationSkipped {
        task_id: String,
    },
    IterationCompleted {
        result: IterationResult,
    },
    AllComplete,
    AutoCommitted {
        task_id: String,
        commit_sha: Option<String>,
        commit_message: Option<String>,
    },
    AutoCommitFailed {
        task_id: String,
        error: String,
    },
    AutoCommitSkipped {
        task_id: String,
        reason: String,
    },
    Warning {
        message: String,
    },
}

impl EngineEvent {
    /// Stable event name for structured logs and UIs.
    pub fn name(&self) -> &'static str {
        match self {
            Self::EngineStarted { .. } => "engine:started",
            Self::EngineStopped { .. } => "engine:stopped",
            Self::EnginePaused => "engine:paused",
            Self::EngineResumed => "engine:resumed",
            Self::TasksRefreshed { .. } => "tasks:refreshed",
            Self::IterationStarted { .. } => "iteration:started",
            Self::TaskSelected { .. } => "task:selected",
            Self::TaskActivated { .. } => "task:activated",
            Self::AgentOutput { .. } => "agent:output",
            Self::IterationRateLimited { .. } => "iteration:rate-limited",
            Self::AgentSwitched { .. } => "agent:switched",
            Self::AgentAllLimited { .. } => "agent:all-limited",
            Self::AgentRecoveryAttempted { .. } => "agent:recovery-attempted",
            Self::TaskCompleted { .. } => "task:completed",
            Self::IterationFailed { .. } => "iteration:failed",
            Self::IterationRetrying { .. } => "iteration:retrying",
            Self::IterationSkipped { .. } => "iteration:skipped",
            Self::IterationCompleted { .. } => "iteration:completed",
            Self::AllComplete => "all:complete",
            Self::AutoCommitted { .. } => "task:auto-committed",
            Self::AutoCommitFailed { .. } => "task:auto-commit-failed",
            Self::AutoCommitSkipped { .. } => "task:auto-commit-skipped",
            Self::Warning { .. } => "engine:warning",
        }
    }
}

type Callback<E> = Box<dyn Fn(&E) + Send + Sync>;

/// Synchronous fan-out channel for typed events.
pub struct EventChannel<E> {
    listeners: Arc<Mutex<Vec<(u64, Callback<E>)>>>,
    next_id: AtomicU64,
}

impl<E> EventChannel<E> {
    pub fn new() -> Self {
        Self {
            listeners: Arc::new(Mutex::new(Vec::new())),
            next_id: AtomicU64::new(1),
        }
    }

    /// Register a listener; returns a subscription that can unsubscribe it.
    pub fn listen(&self, callback: impl Fn(&E) + Send + Sync + 'static) -> Subscription<E> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        self.listeners
            .lock()
            .unwrap()
            .push((id, Box::new(callback)));
        Subscription {
            id,
            listeners: Arc::downgrade(&self.listeners),
        }
    }

    /// Deliver an event to every listener, swallowing listener panics.
    pub fn emit(&self, event: &E) {
        let listeners = self.listeners.lock().unwrap();
        for (id, callback) in listeners.iter() {
            let outcome = std::panic::catch_unwind(AssertUnwindSafe(|| callback(event)));
            if outcome.is_err() {
                warn!(listener_id = id, "Event listener panicked; ignoring");
            }
        }
    }

    pub fn listener_count(&self) -> usize {
        self.listeners.lock().unwrap().len()
    }
}

impl<E> Default for EventChannel<E> {
    fn default() -> Self {
        Self::new()
    }
}

/// Handle to a registered listener.
pub struct Subscription<E> {
    id: u64,
    listeners: Weak<Mutex<Vec<(u64, Callback<E>)>>>,
}

impl<E> Subscription<E> {
    /// Remove the listener. A no-op if the channel is gone.
    pub fn unsubscribe(self) {
        if let Some(listeners) = self.listeners.upgrade() {
            listeners.lock().unwrap().retain(|(id, _)| *id != self.id);
        }
    }
}

//! Parallel execution result models.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::subagent::SubagentStats;
use super::task::Task;
use super::worktree::ManagedWorktree;

/// Terminal status of a task run by the parallel executor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParallelTaskStatus {
    Completed,
    Failed,
    /// Queued task dropped after a batch entered shutdown mode
    Cancelled,
}

/// Which phase of a parallel task run failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailurePhase {
    WorktreeAcquisition,
    AgentSpawn,
    AgentExecution,
    Unknown,
}

impl FailurePhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::WorktreeAcquisition => "worktree_acquisition",
            Self::AgentSpawn => "agent_spawn",
            Self::AgentExecution => "agent_execution",
            Self::Unknown => "unknown",
        }
    }
}

/// Failure attribution for a parallel task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParallelTaskError {
    pub message: String,
    pub phase: FailurePhase,
    pub occurred_at: DateTime<Utc>,
}

impl ParallelTaskError {
    pub fn new(phase: FailurePhase, message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            phase,
            occurred_at: Utc::now(),
        }
    }
}

/// Result of one task run by the parallel executor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParallelTaskResult {
    pub task: Task,
    /// Name of the work unit the task came from
    pub work_unit: String,
    pub status: ParallelTaskStatus,
    pub worktree: Option<ManagedWorktree>,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
    pub duration_ms: u64,
    pub stdout: String,
    pub stderr: String,
    pub exit_code: Option<i32>,
    pub error: Option<ParallelTaskError>,
    pub subagent_summary: Option<SubagentStats>,
}

impl ParallelTaskResult {
    /// A result for a task that never started.
    pub fn cancelled(task: Task, work_unit: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            task,
            work_unit: work_unit.into(),
            status: ParallelTaskStatus::Cancelled,
            worktree: None,
            started_at: now,
            ended_at: now,
            duration_ms: 0,
            stdout: String::new(),
            stderr: String::new(),
            exit_code: None,
            error: None,
            subagent_summary: None,
        }
    }
}

/// A named group of tasks submitted to the parallel executor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkUnit {
    pub name: String,
    pub tasks: Vec<Task>,
}

impl WorkUnit {
    pub fn new(name: impl Into<String>, tasks: Vec<Task>) -> Self {
        Self {
            name: name.into(),
            tasks,
        }
    }
}

/// Outcome of a whole parallel batch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchResult {
    pub results: Vec<ParallelTaskResult>,
    /// Markdown failure report, present when any task failed
    pub failure_report: Option<String>,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
}

impl BatchResult {
    pub fn counts(&self) -> (usize, usize, usize) {
        let mut completed = 0;
        let mut failed = 0;
        let mut cancelled = 0;
        for r in &self.results {
            match r.status {
                ParallelTaskStatus::Completed => completed += 1,
                ParallelTaskStatus::Failed => failed += 1,
                ParallelTaskStatus::Cancelled => cancelled += 1,
            }
        }
        (completed, failed, cancelled)
    }
}

//! Agent execution result and related contract types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use uuid::Uuid;

/// Terminal status of one agent subprocess execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    /// Exited with code 0
    Completed,
    /// Exited non-zero or errored
    Failed,
    /// Killed after exceeding the configured timeout
    Timeout,
    /// Killed by an interrupt request
    Interrupted,
}

impl ExecutionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Timeout => "timeout",
            Self::Interrupted => "interrupted",
        }
    }
}

/// Result of one agent subprocess execution.
///
/// `stdout`/`stderr` hold the bounded in-memory tails of the streams; the
/// truncation policy preserves the end of output, where completion markers
/// live.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentExecutionResult {
    /// Unique id for this execution
    pub execution_id: Uuid,
    pub status: ExecutionStatus,
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    pub duration_ms: u64,
    /// Whether an interrupt was requested during the run
    pub interrupted: bool,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
    /// Error message when the process could not be run or errored
    pub error: Option<String>,
}

impl AgentExecutionResult {
    pub fn is_success(&self) -> bool {
        self.status == ExecutionStatus::Completed
    }
}

/// Outcome of probing whether an agent CLI is installed and runnable.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DetectResult {
    pub available: bool,
    pub version: Option<String>,
    pub executable_path: Option<PathBuf>,
    pub error: Option<String>,
}

impl DetectResult {
    pub fn unavailable(error: impl Into<String>) -> Self {
        Self {
            available: false,
            version: None,
            executable_path: None,
            error: Some(error.into()),
        }
    }
}

/// Result of a one-shot preflight prompt against an agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PreflightResult {
    pub success: bool,
    pub duration_ms: u64,
    pub error: Option<String>,
    /// Operator hint when the preflight failed
    pub suggestion: Option<String>,
    pub stdout: Option<String>,
    pub stderr: Option<String>,
    pub exit_code: Option<i32>,
}

/// Filesystem and network requirements an agent declares for sandboxed runs.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SandboxRequirements {
    /// Paths holding credentials the agent reads (e.g. `~/.config/<agent>`)
    pub auth_paths: Vec<PathBuf>,
    /// Paths to the agent binary and its helpers
    pub binary_paths: Vec<PathBuf>,
    /// Writable runtime paths (caches, sockets)
    pub runtime_paths: Vec<PathBuf>,
    /// Whether the agent needs outbound network access
    pub requires_network: bool,
}

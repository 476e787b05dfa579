//! Iteration result model.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::execution::AgentExecutionResult;
use super::task::Task;

/// Terminal status of one iteration attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IterationStatus {
    Completed,
    Running,
    Failed,
    Interrupted,
    Skipped,
}

impl IterationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Completed => "completed",
            Self::Running => "running",
            Self::Failed => "failed",
            Self::Interrupted => "interrupted",
            Self::Skipped => "skipped",
        }
    }

    #[allow(clippy::should_implement_trait)]
    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "completed" => Some(Self::Completed),
            "running" => Some(Self::Running),
            "failed" => Some(Self::Failed),
            "interrupted" => Some(Self::Interrupted),
            "skipped" => Some(Self::Skipped),
            _ => None,
        }
    }
}

/// Result of one pass of select -> execute -> persist for a single task.
///
/// Emitted once per iteration attempt, appended to engine state and persisted
/// to the log store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IterationResult {
    /// 1-based iteration number
    pub iteration: u32,
    pub task: Task,
    pub status: IterationStatus,
    /// Whether the tracker was told the task is complete
    pub task_completed: bool,
    /// Whether the completion marker was found in stdout
    pub promise_complete: bool,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
    pub duration_ms: u64,
    pub error: Option<String>,
    pub agent_result: Option<AgentExecutionResult>,
}

impl IterationResult {
    pub fn finish(mut self, status: IterationStatus) -> Self {
        self.status = status;
        self.ended_at = Utc::now();
        self.duration_ms = (self.ended_at - self.started_at)
            .num_milliseconds()
            .max(0) as u64;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_duration_non_negative() {
        let task = Task::new("t1", "one");
        let result = IterationResult {
            iteration: 1,
            task,
            status: IterationStatus::Running,
            task_completed: false,
            promise_complete: false,
            started_at: Utc::now(),
            ended_at: Utc::now(),
            duration_ms: 0,
            error: None,
            agent_result: None,
        };
        let finished = result.finish(IterationStatus::Completed);
        assert_eq!(finished.status, IterationStatus::Completed);
        assert!(finished.ended_at >= finished.started_at);
    }
}

//! Tracker port - interface for task sources.

use async_trait::async_trait;

use crate::domain::errors::EngineResult;
use crate::domain::models::{Task, TaskFilter, TaskStatus};

/// Trait for tracker plugin implementations.
///
/// A tracker is the external system that supplies tasks for an epic and owns
/// their lifecycle. The engine only queries for actionable tasks and reports
/// status changes; ordering and dependency resolution happen behind
/// `get_next_task` so trackers can apply their own rules.
#[async_trait]
pub trait Tracker: Send + Sync {
    /// Refresh the tracker's view of its backing store.
    async fn sync(&self) -> EngineResult<()>;

    async fn get_tasks(&self, filter: &TaskFilter) -> EngineResult<Vec<Task>>;

    /// Next actionable task matching the filter, or `None`.
    async fn get_next_task(&self, filter: &TaskFilter) -> EngineResult<Option<Task>>;

    async fn update_task_status(&self, id: &str, status: TaskStatus) -> EngineResult<()>;

    /// Mark a task complete, with an optional completion note.
    async fn complete_task(&self, id: &str, note: Option<&str>) -> EngineResult<()>;

    /// Whether every task in the epic has reached a terminal status.
    async fn is_complete(&self) -> EngineResult<bool>;

    /// Tracker-supplied prompt template, if any.
    fn template(&self) -> Option<String> {
        None
    }

    /// PRD or epic context the tracker can contribute to prompts.
    fn prd_context(&self) -> Option<serde_json::Value> {
        None
    }
}

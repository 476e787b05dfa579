//! In-memory tracker, used by worker mode and tests.

use async_trait::async_trait;
use std::sync::RwLock;

use crate::domain::errors::{EngineError, EngineResult};
use crate::domain::models::{Task, TaskFilter, TaskStatus};
use crate::domain::ports::Tracker;

/// A tracker backed by a plain task list.
pub struct InMemoryTracker {
    tasks: RwLock<Vec<Task>>,
    template: Option<String>,
}

impl InMemoryTracker {
    pub fn new(tasks: Vec<Task>) -> Self {
        Self {
            tasks: RwLock::new(tasks),
            template: None,
        }
    }

    pub fn with_template(mut self, template: impl Into<String>) -> Self {
        self.template = Some(template.into());
        self
    }

    /// Current task list, cloned.
    pub fn snapshot(&self) -> Vec<Task> {
        self.tasks.read().unwrap().clone()
    }
}

#[async_trait]
impl Tracker for InMemoryTracker {
    async fn sync(&self) -> EngineResult<()> {
        Ok(())
    }

    async fn get_tasks(&self, filter: &TaskFilter) -> EngineResult<Vec<Task>> {
        let tasks = self.tasks.read().unwrap();
        Ok(tasks.iter().filter(|t| filter.matches(t)).cloned().collect())
    }

    async fn get_next_task(&self, filter: &TaskFilter) -> EngineResult<Option<Task>> {
        let tasks = self.tasks.read().unwrap();
        Ok(super::next_actionable(&tasks, filter))
    }

    async fn update_task_status(&self, id: &str, status: TaskStatus) -> EngineResult<()> {
        let mut tasks = self.tasks.write().unwrap();
        let task = tasks
            .iter_mut()
            .find(|t| t.id == id)
            .ok_or_else(|| EngineError::TaskNotFound(id.to_string()))?;
        task.status = status;
        Ok(())
    }

    async fn complete_task(&self, id: &str, note: Option<&str>) -> EngineResult<()> {
        let mut tasks = self.tasks.write().unwrap();
        let task = tasks
            .iter_mut()
            .find(|t| t.id == id)
            .ok_or_else(|| EngineError::TaskNotFound(id.to_string()))?;
        task.status = TaskStatus::Completed;
        if let Some(note) = note {
            task.metadata
                .insert("completion_note".to_string(), note.to_string());
        }
        Ok(())
    }

    async fn is_complete(&self) -> EngineResult<bool> {
        let tasks = self.tasks.read().unwrap();
        Ok(tasks.iter().all(|t| t.status.is_terminal()))
    }

    fn template(&self) -> Option<String> {
        self.template.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_complete_task_marks_completed() {
        let tracker = InMemoryTracker::new(vec![Task::new("t1", "one")]);
        assert!(!tracker.is_complete().await.unwrap());

        tracker.complete_task("t1", Some("done")).await.unwrap();
        assert!(tracker.is_complete().await.unwrap());

        let snapshot = tracker.snapshot();
        assert_eq!(snapshot[0].status, TaskStatus::Completed);
        assert_eq!(
            snapshot[0].metadata.get("completion_note").map(String::as_str),
            Some("done")
        );
    }

    #[tokio::test]
    async fn test_unknown_task_errors() {
        let tracker = InMemoryTracker::new(vec![]);
        let err = tracker.update_task_status("nope", TaskStatus::Open).await;
        assert!(matches!(err, Err(EngineError::TaskNotFound(_))));
    }
}

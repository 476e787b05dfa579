//! YAML epic-file tracker.
//!
//! Reads tasks from a single YAML file and writes status changes back, so a
//! run survives engine restarts. Format:
//!
//! ```yaml
//! epic: checkout-rework
//! template: |
//!   Work on {{task_title}} ...
//! tasks:
//!   - id: T1
//!     title: Wire the new cart store
//!     depends_on: []
//! ```

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::RwLock;
use tracing::debug;

use crate::domain::errors::{EngineError, EngineResult};
use crate::domain::models::{Task, TaskFilter, TaskStatus};
use crate::domain::ports::Tracker;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct EpicFile {
    #[serde(default)]
    epic: Option<String>,
    #[serde(default)]
    template: Option<String>,
    #[serde(default)]
    tasks: Vec<Task>,
}

/// Tracker backed by a YAML epic file.
pub struct FileTracker {
    path: PathBuf,
    state: RwLock<EpicFile>,
}

impl FileTracker {
    /// Load the epic file at `path`.
    pub async fn load(path: impl Into<PathBuf>) -> EngineResult<Self> {
        let path = path.into();
        let state = Self::read_file(&path).await?;
        Ok(Self {
            path,
            state: RwLock::new(state),
        })
    }

    async fn read_file(path: &Path) -> EngineResult<EpicFile> {
        let raw = tokio::fs::read_to_string(path).await.map_err(|e| {
            EngineError::Tracker(format!("cannot read epic file {}: {e}", path.display()))
        })?;
        serde_yaml::from_str(&raw)
            .map_err(|e| EngineError::Tracker(format!("invalid epic file {}: {e}", path.display())))
    }

    async fn persist(&self) -> EngineResult<()> {
        let raw = {
            let state = self.state.read().unwrap();
            serde_yaml::to_string(&*state)
                .map_err(|e| EngineError::Tracker(format!("cannot serialize epic file: {e}")))?
        };
        tokio::fs::write(&self.path, raw).await.map_err(|e| {
            EngineError::Tracker(format!("cannot write epic file {}: {e}", self.path.display()))
        })
    }

    /// The epic id declared in the file, if any.
    pub fn epic(&self) -> Option<String> {
        self.state.read().unwrap().epic.clone()
    }
}

#[async_trait]
impl Tracker for FileTracker {
    async fn sync(&self) -> EngineResult<()> {
        let fresh = Self::read_file(&self.path).await?;
        debug!(path = %self.path.display(), tasks = fresh.tasks.len(), "Epic file synced");
        *self.state.write().unwrap() = fresh;
        Ok(())
    }

    async fn get_tasks(&self, filter: &TaskFilter) -> EngineResult<Vec<Task>> {
        let state = self.state.read().unwrap();
        Ok(state
            .tasks
            .iter()
            .filter(|t| filter.matches(t))
            .cloned()
            .collect())
    }

    async fn get_next_task(&self, filter: &TaskFilter) -> EngineResult<Option<Task>> {
        let state = self.state.read().unwrap();
        Ok(super::next_actionable(&state.tasks, filter))
    }

    async fn update_task_status(&self, id: &str, status: TaskStatus) -> EngineResult<()> {
        {
            let mut state = self.state.write().unwrap();
            let task = state
                .tasks
                .iter_mut()
                .find(|t| t.id == id)
                .ok_or_else(|| EngineError::TaskNotFound(id.to_string()))?;
            task.status = status;
        }
        self.persist().await
    }

    async fn complete_task(&self, id: &str, note: Option<&str>) -> EngineResult<()> {
        {
            let mut state = self.state.write().unwrap();
            let task = state
                .tasks
                .iter_mut()
                .find(|t| t.id == id)
                .ok_or_else(|| EngineError::TaskNotFound(id.to_string()))?;
            task.status = TaskStatus::Completed;
            if let Some(note) = note {
                task.metadata
                    .insert("completion_note".to_string(), note.to_string());
            }
        }
        self.persist().await
    }

    async fn is_complete(&self) -> EngineResult<bool> {
        let state = self.state.read().unwrap();
        Ok(state.tasks.iter().all(|t| t.status.is_terminal()))
    }

    fn template(&self) -> Option<String> {
        self.state.read().unwrap().template.clone()
    }

    fn prd_context(&self) -> Option<serde_json::Value> {
        let state = self.state.read().unwrap();
        state
            .epic
            .as_ref()
            .map(|epic| serde_json::json!({ "epic": epic, "task_count": state.tasks.len() }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const EPIC: &str = r#"
epic: demo
template: "Do {{task_title}}"
tasks:
  - id: T1
    title: First
  - id: T2
    title: Second
    depends_on: [T1]
"#;

    async fn tracker_in(dir: &TempDir) -> FileTracker {
        let path = dir.path().join("epic.yaml");
        tokio::fs::write(&path, EPIC).await.unwrap();
        FileTracker::load(path).await.unwrap()
    }

    #[tokio::test]
    async fn test_load_and_select() {
        let dir = TempDir::new().unwrap();
        let tracker = tracker_in(&dir).await;

        assert_eq!(tracker.epic().as_deref(), Some("demo"));
        assert_eq!(tracker.template().as_deref(), Some("Do {{task_title}}"));

        let next = tracker
            .get_next_task(&TaskFilter::actionable(vec![]))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(next.id, "T1");
    }

    #[tokio::test]
    async fn test_status_changes_persist() {
        let dir = TempDir::new().unwrap();
        let tracker = tracker_in(&dir).await;

        tracker.complete_task("T1", None).await.unwrap();

        // Reload from disk and confirm
        tracker.sync().await.unwrap();
        let next = tracker
            .get_next_task(&TaskFilter::actionable(vec![]))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(next.id, "T2");
        assert!(!tracker.is_complete().await.unwrap());

        tracker.complete_task("T2", None).await.unwrap();
        assert!(tracker.is_complete().await.unwrap());
    }
}

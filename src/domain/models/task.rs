//! Task domain model.
//!
//! Tasks are owned by the tracker; the engine only requests the next
//! actionable task and reports completion.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Lifecycle status of a task, as reported by the tracker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Not started
    Open,
    /// Currently being worked on
    InProgress,
    /// Finished successfully
    Completed,
    /// Terminally failed
    Failed,
    /// Skipped by the engine after exhausting retries
    Skipped,
}

impl Default for TaskStatus {
    fn default() -> Self {
        Self::Open
    }
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Open => "open",
            Self::InProgress => "in_progress",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Skipped => "skipped",
        }
    }

    #[allow(clippy::should_implement_trait)]
    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "open" => Some(Self::Open),
            "in_progress" => Some(Self::InProgress),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            "skipped" => Some(Self::Skipped),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Skipped)
    }
}

/// A unit of work supplied by the tracker.
///
/// Identity is by `id`. The engine treats tasks as opaque apart from status
/// and dependency metadata; ordering and dependency resolution are the
/// tracker's responsibility.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    /// Tracker-assigned identifier
    pub id: String,
    /// Short human-readable title
    pub title: String,
    /// Longer description, if the tracker provides one
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Current lifecycle status
    #[serde(default)]
    pub status: TaskStatus,
    /// Parent task, for hierarchical trackers
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<String>,
    /// Task ids this task depends on
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub depends_on: Vec<String>,
    /// Task ids blocked by this task
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub blocks: Vec<String>,
    /// Tracker priority (higher first)
    #[serde(default)]
    pub priority: i64,
    /// Free-form labels
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub labels: Vec<String>,
    /// Arbitrary tracker metadata
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub metadata: HashMap<String, String>,
}

impl Task {
    /// Create an open task with the given id and title.
    pub fn new(id: impl Into<String>, title: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            title: title.into(),
            description: None,
            status: TaskStatus::Open,
            parent_id: None,
            depends_on: Vec::new(),
            blocks: Vec::new(),
            priority: 0,
            labels: Vec::new(),
            metadata: HashMap::new(),
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn with_priority(mut self, priority: i64) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_depends_on(mut self, deps: Vec<String>) -> Self {
        self.depends_on = deps;
        self
    }

    pub fn with_status(mut self, status: TaskStatus) -> Self {
        self.status = status;
        self
    }
}

/// Filter used when querying the tracker.
#[derive(Debug, Clone, Default)]
pub struct TaskFilter {
    /// Statuses to include (empty = all)
    pub status: Vec<TaskStatus>,
    /// Task ids to exclude (e.g. tasks the engine has skipped)
    pub exclude_ids: Vec<String>,
}

impl TaskFilter {
    /// The filter the engine uses for "next actionable task" queries.
    pub fn actionable(exclude_ids: Vec<String>) -> Self {
        Self {
            status: vec![TaskStatus::Open, TaskStatus::InProgress],
            exclude_ids,
        }
    }

    pub fn matches(&self, task: &Task) -> bool {
        if !self.status.is_empty() && !self.status.contains(&task.status) {
            return false;
        }
        !self.exclude_ids.contains(&task.id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_round_trip() {
        for status in [
            TaskStatus::Open,
            TaskStatus::InProgress,
            TaskStatus::Completed,
            TaskStatus::Failed,
            TaskStatus::Skipped,
        ] {
            assert_eq!(TaskStatus::from_str(status.as_str()), Some(status));
        }
        assert_eq!(TaskStatus::from_str("bogus"), None);
    }

    #[test]
    fn test_actionable_filter() {
        let filter = TaskFilter::actionable(vec!["t2".to_string()]);

        let open = Task::new("t1", "one");
        assert!(filter.matches(&open));

        let excluded = Task::new("t2", "two");
        assert!(!filter.matches(&excluded));

        let done = Task::new("t3", "three").with_status(TaskStatus::Completed);
        assert!(!filter.matches(&done));
    }
}

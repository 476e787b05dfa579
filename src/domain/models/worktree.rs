//! Managed worktree model.
//!
//! Git worktrees give each parallel task an isolated working copy on its own
//! branch.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use thiserror::Error;
use uuid::Uuid;

/// Status of a pool-managed worktree.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorktreeStatus {
    /// Being created
    Creating,
    /// Created, not yet assigned
    Ready,
    /// Assigned to exactly one task
    InUse,
    /// Branch being merged back
    Merging,
    /// Being removed
    Cleaning,
    /// Creation or cleanup failed
    Error,
}

impl WorktreeStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Creating => "creating",
            Self::Ready => "ready",
            Self::InUse => "in_use",
            Self::Merging => "merging",
            Self::Cleaning => "cleaning",
            Self::Error => "error",
        }
    }

    /// A worktree may only be destroyed when this is false.
    pub fn is_busy(&self) -> bool {
        matches!(self, Self::InUse | Self::Merging)
    }
}

/// An isolated git working copy managed by the pool.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManagedWorktree {
    pub id: Uuid,
    pub name: String,
    pub path: PathBuf,
    pub branch: String,
    pub status: WorktreeStatus,
    pub created_at: DateTime<Utc>,
    pub last_activity_at: DateTime<Utc>,
    /// Task holding this worktree while `in_use`
    pub task_id: Option<String>,
    pub agent_id: Option<String>,
}

impl ManagedWorktree {
    pub fn new(name: impl Into<String>, path: PathBuf, branch: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            path,
            branch: branch.into(),
            status: WorktreeStatus::Creating,
            created_at: now,
            last_activity_at: now,
            task_id: None,
            agent_id: None,
        }
    }

    pub fn touch(&mut self) {
        self.last_activity_at = Utc::now();
    }

    pub fn mark_ready(&mut self) {
        self.status = WorktreeStatus::Ready;
        self.touch();
    }

    pub fn assign(&mut self, task_id: Option<String>, agent_id: Option<String>) {
        self.status = WorktreeStatus::InUse;
        self.task_id = task_id;
        self.agent_id = agent_id;
        self.touch();
    }

    pub fn mark_merging(&mut self) {
        self.status = WorktreeStatus::Merging;
        self.touch();
    }

    pub fn mark_cleaning(&mut self) {
        self.status = WorktreeStatus::Cleaning;
        self.task_id = None;
        self.touch();
    }

    pub fn mark_error(&mut self) {
        self.status = WorktreeStatus::Error;
        self.touch();
    }
}

/// Request to acquire an isolated working copy.
#[derive(Debug, Clone, Default)]
pub struct WorktreeRequest {
    /// Stem used for the worktree name and generated branch
    pub base_name: String,
    /// Explicit branch name; generated from `base_name` when absent
    pub branch: Option<String>,
    /// Ref to branch from; the pool default when absent
    pub base_branch: Option<String>,
    pub task_id: Option<String>,
    pub agent_id: Option<String>,
}

/// Why an acquire was denied.
#[derive(Debug, Clone, Error)]
pub enum AcquireError {
    #[error("worktree pool exhausted")]
    PoolExhausted,
    #[error("insufficient free memory")]
    InsufficientMemory,
    #[error("high cpu utilization")]
    HighCpuUtilization,
    #[error("git error: {0}")]
    GitError(String),
    #[error("filesystem error: {0}")]
    FilesystemError(String),
}

impl AcquireError {
    pub fn reason(&self) -> &'static str {
        match self {
            Self::PoolExhausted => "pool_exhausted",
            Self::InsufficientMemory => "insufficient_memory",
            Self::HighCpuUtilization => "high_cpu_utilization",
            Self::GitError(_) => "git_error",
            Self::FilesystemError(_) => "filesystem_error",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_worktree_lifecycle() {
        let mut wt = ManagedWorktree::new("task-a", PathBuf::from(".worktrees/task-a"), "epicycle/task-a");
        assert_eq!(wt.status, WorktreeStatus::Creating);

        wt.mark_ready();
        assert_eq!(wt.status, WorktreeStatus::Ready);
        assert!(!wt.status.is_busy());

        wt.assign(Some("T1".to_string()), Some("claude_code".to_string()));
        assert_eq!(wt.status, WorktreeStatus::InUse);
        assert!(wt.status.is_busy());

        wt.mark_merging();
        assert!(wt.status.is_busy());

        wt.mark_cleaning();
        assert!(!wt.status.is_busy());
        assert!(wt.task_id.is_none());
    }
}

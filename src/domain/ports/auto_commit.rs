//! Auto-commit port.

use async_trait::async_trait;
use std::path::Path;

use crate::domain::errors::EngineResult;

/// Outcome of an auto-commit attempt after a completed task.
#[derive(Debug, Clone, Default)]
pub struct AutoCommitOutcome {
    pub committed: bool,
    pub commit_message: Option<String>,
    pub commit_sha: Option<String>,
    pub error: Option<String>,
    /// Why the commit was skipped (e.g. nothing to commit)
    pub skip_reason: Option<String>,
}

/// Commits agent-produced changes after a task completes.
#[async_trait]
pub trait AutoCommit: Send + Sync {
    async fn perform(
        &self,
        cwd: &Path,
        task_id: &str,
        task_title: &str,
    ) -> EngineResult<AutoCommitOutcome>;
}

//! Git-backed auto-commit adapter.
//!
//! Commits agent-produced changes after a completed task. A clean working
//! tree is a skip, not an error.

use async_trait::async_trait;
use std::path::Path;
use std::process::Stdio;
use tokio::process::Command;
use tracing::{debug, info};

use crate::domain::errors::{EngineError, EngineResult};
use crate::domain::ports::{AutoCommit, AutoCommitOutcome};

/// Auto-commit via the git CLI.
pub struct GitAutoCommit;

impl GitAutoCommit {
    async fn git(cwd: &Path, args: &[&str]) -> EngineResult<String> {
        let output = Command::new("git")
            .args(args)
            .current_dir(cwd)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await
            .map_err(|e| EngineError::Git(format!("failed to run git {}: {e}", args.join(" "))))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(EngineError::Git(format!(
                "git {} failed: {}",
                args.join(" "),
                stderr.trim()
            )));
        }

        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }
}

#[async_trait]
impl AutoCommit for GitAutoCommit {
    async fn perform(
        &self,
        cwd: &Path,
        task_id: &str,
        task_title: &str,
    ) -> EngineResult<AutoCommitOutcome> {
        let status = Self::git(cwd, &["status", "--porcelain"]).await?;
        if status.is_empty() {
            debug!(task_id, "No changes to auto-commit");
            return Ok(AutoCommitOutcome {
                committed: false,
                skip_reason: Some("no changes to commit".to_string()),
                ..Default::default()
            });
        }

        Self::git(cwd, &["add", "-A"]).await?;

        let message = format!("Auto-commit: {task_title} ({task_id})");
        match Self::git(cwd, &["commit", "-m", &message]).await {
            Ok(_) => {
                let sha = Self::git(cwd, &["rev-parse", "HEAD"]).await.ok();
                info!(task_id, sha = ?sha, "Auto-committed task changes");
                Ok(AutoCommitOutcome {
                    committed: true,
                    commit_message: Some(message),
                    commit_sha: sha,
                    ..Default::default()
                })
            }
            Err(e) => Ok(AutoCommitOutcome {
                committed: false,
                error: Some(e.to_string()),
                ..Default::default()
            }),
        }
    }
}

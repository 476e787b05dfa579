//! Merge engine.
//!
//! Consolidates worktree branches back into a target branch: record a
//! pre-merge anchor (plus an optional backup branch), merge each branch in
//! order, attribute conflicts per file, optionally hand conflicts to an AI
//! resolver, and support rolling the target back to the anchor.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use tokio::process::Command;
use tracing::{info, warn};
use uuid::Uuid;

use crate::domain::errors::{EngineError, EngineResult};
use crate::domain::models::{ManagedWorktree, MergeConfig};
use crate::domain::ports::ConflictResolver;

/// Outcome for one merged branch.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum MergeOutcomeStatus {
    Merged {
        commit: String,
    },
    ResolvedByAi {
        commit: String,
        confidence: f64,
    },
    /// Conflicts, no resolver configured
    Conflict {
        files: Vec<String>,
    },
    /// Conflicts the resolver declined or failed to clear
    ConflictPendingUser {
        files: Vec<String>,
    },
    /// Not attempted because an earlier conflict aborted the run
    Skipped,
    Failed {
        error: String,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorktreeMergeOutcome {
    pub branch: String,
    pub worktree_id: Option<Uuid>,
    pub outcome: MergeOutcomeStatus,
}

/// Result of one merge run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MergeReport {
    pub target_branch: String,
    /// Target HEAD before any merge was attempted
    pub premerge_ref: String,
    pub backup_branch: Option<String>,
    pub outcomes: Vec<WorktreeMergeOutcome>,
    pub started_at: chrono::DateTime<Utc>,
    pub ended_at: chrono::DateTime<Utc>,
}

impl MergeReport {
    pub fn merged_count(&self) -> usize {
        self.outcomes
            .iter()
            .filter(|o| {
                matches!(
                    o.outcome,
                    MergeOutcomeStatus::Merged { .. } | MergeOutcomeStatus::ResolvedByAi { .. }
                )
            })
            .count()
    }

    pub fn has_conflicts(&self) -> bool {
        self.outcomes.iter().any(|o| {
            matches!(
                o.outcome,
                MergeOutcomeStatus::Conflict { .. } | MergeOutcomeStatus::ConflictPendingUser { .. }
            )
        })
    }
}

/// Options for rolling the target branch back.
#[derive(Debug, Clone, Default)]
pub struct RollbackOptions {
    /// Explicit anchor; the backup branch or reflog anchor is located when absent
    pub target_ref: Option<String>,
    /// Skip the clean-working-tree check
    pub force: bool,
    /// Branches to delete after the reset (typically the merged sources)
    pub cleanup_branches: Vec<String>,
}

/// Merges worktree branches into the configured target branch.
pub struct MergeEngine {
    config: MergeConfig,
    repo_path: PathBuf,
    resolver: Option<Arc<dyn ConflictResolver>>,
}

impl MergeEngine {
    pub fn new(repo_path: impl Into<PathBuf>, config: MergeConfig) -> Self {
        Self {
            config,
            repo_path: repo_path.into(),
            resolver: None,
        }
    }

    pub fn with_resolver(mut self, resolver: Arc<dyn ConflictResolver>) -> Self {
        self.resolver = Some(resolver);
        self
    }

    /// Merge the given worktrees' branches, in order.
    pub async fn merge_worktrees(
        &self,
        worktrees: &[ManagedWorktree],
    ) -> EngineResult<MergeReport> {
        let branches: Vec<(String, Option<Uuid>)> = worktrees
            .iter()
            .map(|wt| (wt.branch.clone(), Some(wt.id)))
            .collect();
        self.merge_branches(&branches).await
    }

    /// Merge the given branches into the target, in order.
    pub async fn merge_branches(
        &self,
        branches: &[(String, Option<Uuid>)],
    ) -> EngineResult<MergeReport> {
        let started_at = Utc::now();

        self.git(&["checkout", &self.config.target_branch]).await?;
        let premerge_ref = self.git(&["rev-parse", "HEAD"]).await?;

        let backup_branch = if self.config.create_backup {
            let name = format!(
                "{}{}",
                self.config.backup_branch_prefix,
                started_at.format("%Y%m%d-%H%M%S")
            );
            self.git(&["branch", &name, &premerge_ref]).await?;
            info!(backup = %name, at = %premerge_ref, "Backup branch created");
            Some(name)
        } else {
            None
        };

        let mut outcomes = Vec::new();
        let mut aborted = false;

        for (branch, worktree_id) in branches {
            if aborted {
                outcomes.push(WorktreeMergeOutcome {
                    branch: branch.clone(),
                    worktree_id: *worktree_id,
                    outcome: MergeOutcomeStatus::Skipped,
                });
                continue;
            }

            let outcome = self.merge_one(branch).await;
            if matches!(
                outcome,
                MergeOutcomeStatus::Conflict { .. } | MergeOutcomeStatus::ConflictPendingUser { .. }
            ) && self.config.abort_on_conflict
            {
                aborted = true;
            }
            outcomes.push(WorktreeMergeOutcome {
                branch: branch.clone(),
                worktree_id: *worktree_id,
                outcome,
            });
        }

        Ok(MergeReport {
            target_branch: self.config.target_branch.clone(),
            premerge_ref,
            backup_branch,
            outcomes,
            started_at,
            ended_at: Utc::now(),
        })
    }

    async fn merge_one(&self, branch: &str) -> MergeOutcomeStatus {
        match self.git(&["merge", branch, "--no-edit"]).await {
            Ok(_) => {
                let commit = match self.git(&["rev-parse", "HEAD"]).await {
                    Ok(sha) => sha,
                    Err(e) => return MergeOutcomeStatus::Failed { error: e.to_string() },
                };
                if self.config.delete_source_branches {
                    if let Err(e) = self.git(&["branch", "-d", branch]).await {
                        warn!(branch = %branch, error = %e, "Failed to delete merged branch");
                    }
                }
                info!(branch = %branch, commit = %commit, "Branch merged");
                MergeOutcomeStatus::Merged { commit }
            }
            Err(merge_error) => {
                let files = self.conflicted_files().await;
                if files.is_empty() {
                    // Merge failed for a non-conflict reason
                    let _ = self.git(&["merge", "--abort"]).await;
                    return MergeOutcomeStatus::Failed {
                        error: merge_error.to_string(),
                    };
                }

                if self.config.ai_resolution {
                    if let Some(ref resolver) = self.resolver {
                        match self.try_ai_resolution(branch, resolver.as_ref(), &files).await {
                            Some(outcome) => return outcome,
                            None => {
                                let _ = self.git(&["merge", "--abort"]).await;
                                return MergeOutcomeStatus::ConflictPendingUser { files };
                            }
                        }
                    }
                }

                let _ = self.git(&["merge", "--abort"]).await;
                MergeOutcomeStatus::Conflict { files }
            }
        }
    }

    async fn try_ai_resolution(
        &self,
        branch: &str,
        resolver: &dyn ConflictResolver,
        files: &[String],
    ) -> Option<MergeOutcomeStatus> {
        let resolution = match resolver.resolve(&self.repo_path, files).await {
            Ok(resolution) => resolution,
            Err(e) => {
                warn!(branch = %branch, error = %e, "Conflict resolver failed");
                return None;
            }
        };

        let cleared_all = files
            .iter()
            .all(|f| resolution.resolved_files.contains(f));
        if resolution.confidence < self.config.ai_confidence_threshold || !cleared_all {
            info!(
                branch = %branch,
                confidence = resolution.confidence,
                "Resolver confidence below threshold, leaving conflict to the user"
            );
            return None;
        }

        self.git(&["add", "-A"]).await.ok()?;
        let message = format!("Merge branch '{branch}' (AI-resolved)");
        self.git(&["commit", "-m", &message]).await.ok()?;
        let commit = self.git(&["rev-parse", "HEAD"]).await.ok()?;
        info!(branch = %branch, commit = %commit, confidence = resolution.confidence, "Conflicts AI-resolved");
        Some(MergeOutcomeStatus::ResolvedByAi {
            commit,
            confidence: resolution.confidence,
        })
    }

    async fn conflicted_files(&self) -> Vec<String> {
        match self
            .git(&["diff", "--name-only", "--diff-filter=U"])
            .await
        {
            Ok(output) if !output.is_empty() => {
                output.lines().map(ToString::to_string).collect()
            }
            _ => Vec::new(),
        }
    }

    /// Hard-reset the target branch to the rollback anchor.
    ///
    /// Anchor preference: explicit ref, newest backup branch, then the
    /// pre-merge reflog entry. Returns the ref that was reset to.
    pub async fn rollback(&self, options: RollbackOptions) -> EngineResult<String> {
        if !options.force {
            let dirty = self.git(&["status", "--porcelain"]).await?;
            if !dirty.is_empty() {
                return Err(EngineError::Git(
                    "working tree has uncommitted changes; pass force to roll back anyway"
                        .to_string(),
                ));
            }
        }

        let anchor = match options.target_ref {
            Some(explicit) => explicit,
            None => match self.find_backup_branch().await {
                Some(backup) => backup,
                None => self.find_premerge_anchor().await.ok_or_else(|| {
                    EngineError::Git("no rollback anchor found in reflog".to_string())
                })?,
            },
        };

        self.git(&["checkout", &self.config.target_branch]).await?;
        self.git(&["reset", "--hard", &anchor]).await?;
        info!(anchor = %anchor, target = %self.config.target_branch, "Rolled back");

        for branch in &options.cleanup_branches {
            if let Err(e) = self.git(&["branch", "-D", branch]).await {
                warn!(branch = %branch, error = %e, "Failed to delete branch during rollback");
            }
        }

        Ok(anchor)
    }

    async fn find_backup_branch(&self) -> Option<String> {
        let pattern = format!("{}*", self.config.backup_branch_prefix);
        let output = self
            .git(&["branch", "--list", &pattern, "--format=%(refname:short)"])
            .await
            .ok()?;
        // Timestamped names sort chronologically; newest last.
        output.lines().map(ToString::to_string).max()
    }

    async fn find_premerge_anchor(&self) -> Option<String> {
        let output = self
            .git(&["reflog", "--format=%H|%gs", "-n", "50"])
            .await
            .ok()?;
        let entries: Vec<(String, String)> = output
            .lines()
            .filter_map(|line| {
                line.split_once('|')
                    .map(|(sha, subject)| (sha.to_string(), subject.to_string()))
            })
            .collect();
        premerge_anchor_from_reflog(&entries)
    }

    async fn git(&self, args: &[&str]) -> EngineResult<String> {
        let output = Command::new("git")
            .args(args)
            .current_dir(&self.repo_path)
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

/// Find the pre-merge anchor in reflog entries (newest first): the first
/// entry below the run of merge entries at the top.
fn premerge_anchor_from_reflog(entries: &[(String, String)]) -> Option<String> {
    let mut saw_merge = false;
    for (sha, subject) in entries {
        let is_merge = subject.starts_with("merge ") || subject.contains("(merge)");
        if is_merge {
            saw_merge = true;
            continue;
        }
        if saw_merge {
            return Some(sha.clone());
        }
        // Top of the reflog is not a merge: nothing to roll back past.
        return None;
    }
    None
}

//! Worktree pool.
//!
//! Gives each concurrent parallel task an isolated git working copy on a
//! fresh branch, subject to admission control: a worktree cap plus free
//! memory and CPU thresholds sampled from the host. The sample is cached and
//! refreshed periodically rather than taken per acquire, and admission is
//! evaluated under the same lock that guards the active counter.

use async_trait::async_trait;
use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::{Duration, Instant};
use sysinfo::System;
use tokio::process::Command;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::domain::errors::{EngineError, EngineResult};
use crate::domain::models::{
    AcquireError, ManagedWorktree, WorktreePoolConfig, WorktreeRequest, WorktreeStatus,
};
use crate::domain::ports::WorktreeProvider;

/// How long one resource sample stays fresh.
const SAMPLE_TTL: Duration = Duration::from_secs(5);

/// A point-in-time host resource reading.
#[derive(Debug, Clone, Copy)]
pub struct ResourceSample {
    pub free_memory_bytes: u64,
    pub cpu_percent: f32,
}

struct ResourceSampler {
    sys: System,
    last: Option<(Instant, ResourceSample)>,
}

impl ResourceSampler {
    fn new() -> Self {
        Self {
            sys: System::new(),
            last: None,
        }
    }

    fn sample(&mut self) -> ResourceSample {
        if let Some((taken, sample)) = self.last {
            if taken.elapsed() < SAMPLE_TTL {
                return sample;
            }
        }
        self.sys.refresh_memory();
        self.sys.refresh_cpu_usage();
        let sample = ResourceSample {
            free_memory_bytes: self.sys.available_memory(),
            cpu_percent: self.sys.global_cpu_usage(),
        };
        self.last = Some((Instant::now(), sample));
        sample
    }
}

/// Pure admission decision, split out for testability.
fn admit(
    active: usize,
    sample: &ResourceSample,
    config: &WorktreePoolConfig,
) -> Result<(), AcquireError> {
    if active >= config.max_worktrees {
        return Err(AcquireError::PoolExhausted);
    }
    if sample.free_memory_bytes < config.min_free_memory_bytes {
        return Err(AcquireError::InsufficientMemory);
    }
    if sample.cpu_percent > config.max_cpu_percent {
        return Err(AcquireError::HighCpuUtilization);
    }
    Ok(())
}

struct PoolState {
    active: HashMap<Uuid, ManagedWorktree>,
    sampler: ResourceSampler,
}

/// Git-backed worktree pool.
pub struct WorktreePool {
    config: WorktreePoolConfig,
    repo_path: PathBuf,
    state: Mutex<PoolState>,
}

impl WorktreePool {
    pub fn new(repo_path: impl Into<PathBuf>, config: WorktreePoolConfig) -> Self {
        Self {
            config,
            repo_path: repo_path.into(),
            state: Mutex::new(PoolState {
                active: HashMap::new(),
                sampler: ResourceSampler::new(),
            }),
        }
    }

    /// Verify the repository and prepare the worktree base directory.
    pub async fn initialize(&self) -> EngineResult<()> {
        self.git(&["rev-parse", "--git-dir"])
            .await
            .map_err(|e| EngineError::Git(format!("{} is not a git repository: {e}", self.repo_path.display())))?;

        let base = self.repo_path.join(&self.config.base_dir);
        tokio::fs::create_dir_all(&base)
            .await
            .map_err(EngineError::Io)?;

        // Drop bookkeeping for worktrees deleted out from under git.
        let _ = self.git(&["worktree", "prune"]).await;
        Ok(())
    }

    pub async fn active_count(&self) -> usize {
        self.state.lock().await.active.len()
    }

    pub async fn get(&self, id: Uuid) -> Option<ManagedWorktree> {
        self.state.lock().await.active.get(&id).cloned()
    }

    pub async fn list(&self) -> Vec<ManagedWorktree> {
        self.state.lock().await.active.values().cloned().collect()
    }

    /// Destroy every tracked worktree. Busy worktrees are skipped unless
    /// `force` is set.
    pub async fn cleanup_all(&self, force: bool) -> EngineResult<()> {
        let ids: Vec<(Uuid, bool)> = {
            let state = self.state.lock().await;
            state
                .active
                .values()
                .map(|wt| (wt.id, wt.status.is_busy()))
                .collect()
        };

        for (id, busy) in ids {
            if busy && !force {
                debug!(worktree_id = %id, "Skipping busy worktree during cleanup");
                continue;
            }
            if let Err(e) = self.destroy(id).await {
                warn!(worktree_id = %id, error = %e, "Failed to clean up worktree");
            }
        }
        Ok(())
    }

    async fn destroy(&self, id: Uuid) -> EngineResult<()> {
        let worktree = {
            let mut state = self.state.lock().await;
            let Some(worktree) = state.active.get_mut(&id) else {
                return Err(EngineError::ValidationFailed(format!(
                    "unknown worktree {id}"
                )));
            };
            worktree.mark_cleaning();
            worktree.clone()
        };

        let path = worktree.path.display().to_string();
        if let Err(e) = self.git(&["worktree", "remove", &path]).await {
            warn!(path = %path, error = %e, "Plain worktree remove failed, retrying with --force");
            if let Err(e) = self.git(&["worktree", "remove", "--force", &path]).await {
                error!(path = %path, error = %e, "Failed to force remove worktree");
                let mut state = self.state.lock().await;
                if let Some(worktree) = state.active.get_mut(&id) {
                    worktree.mark_error();
                }
                return Err(e);
            }
        }

        self.state.lock().await.active.remove(&id);
        info!(worktree = %worktree.name, branch = %worktree.branch, "Worktree destroyed");
        Ok(())
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

    async fn branch_exists(&self, branch: &str) -> bool {
        self.git(&["show-ref", "--verify", "--quiet", &format!("refs/heads/{branch}")])
            .await
            .is_ok()
    }
}

#[async_trait]
impl WorktreeProvider for WorktreePool {
    async fn acquire(&self, request: WorktreeRequest) -> Result<ManagedWorktree, AcquireError> {
        // Admission and slot reservation happen under one lock; the git work
        // runs outside it.
        let mut worktree = {
            let mut state = self.state.lock().await;
            let sample = state.sampler.sample();
            admit(state.active.len(), &sample, &self.config)?;

            let short: String = Uuid::new_v4().to_string().chars().take(8).collect();
            let name = format!("{}-{}", request.base_name, short);
            let branch = request
                .branch
                .clone()
                .unwrap_or_else(|| format!("epicycle/{name}"));
            let path = self.repo_path.join(&self.config.base_dir).join(&name);

            let worktree = ManagedWorktree::new(name, path, branch);
            state.active.insert(worktree.id, worktree.clone());
            worktree
        };

        let base = request
            .base_branch
            .clone()
            .or_else(|| self.config.base_branch.clone())
            .unwrap_or_else(|| "HEAD".to_string());
        let path = worktree.path.display().to_string();

        let result = if self.branch_exists(&worktree.branch).await {
            self.git(&["worktree", "add", &path, &worktree.branch]).await
        } else {
            self.git(&["worktree", "add", "-b", &worktree.branch, &path, &base])
                .await
        };

        if let Err(e) = result {
            error!(branch = %worktree.branch, error = %e, "Worktree creation failed");
            self.state.lock().await.active.remove(&worktree.id);
            return Err(AcquireError::GitError(e.to_string()));
        }

        worktree.mark_ready();
        worktree.assign(request.task_id.clone(), request.agent_id.clone());
        {
            let mut state = self.state.lock().await;
            state.active.insert(worktree.id, worktree.clone());
        }

        info!(
            worktree = %worktree.name,
            branch = %worktree.branch,
            task_id = ?request.task_id,
            "Worktree acquired"
        );
        Ok(worktree)
    }

    async fn release(&self, id: Uuid) -> EngineResult<()> {
        {
            let state = self.state.lock().await;
            if let Some(worktree) = state.active.get(&id) {
                if worktree.status == WorktreeStatus::Merging {
                    return Err(EngineError::InvalidStateTransition {
                        from: "merging".to_string(),
                        to: "cleaning".to_string(),
                    });
                }
            }
        }
        self.destroy(id).await
    }

    async fn preserve(&self, id: Uuid) -> EngineResult<()> {
        let mut state = self.state.lock().await;
        let Some(worktree) = state.active.remove(&id) else {
            return Err(EngineError::ValidationFailed(format!(
                "unknown worktree {id}"
            )));
        };
        info!(
            worktree = %worktree.name,
            path = %worktree.path.display(),
            "Worktree preserved on disk for inspection"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(free_mb: u64, cpu: f32) -> ResourceSample {
        ResourceSample {
            free_memory_bytes: free_mb * 1024 * 1024,
            cpu_percent: cpu,
        }
    }

    fn config() -> WorktreePoolConfig {
        WorktreePoolConfig {
            max_worktrees: 2,
            min_free_memory_bytes: 512 * 1024 * 1024,
            max_cpu_percent: 90.0,
            ..Default::default()
        }
    }

    #[test]
    fn test_admit_under_limits() {
        assert!(admit(0, &sample(1024, 10.0), &config()).is_ok());
        assert!(admit(1, &sample(1024, 10.0), &config()).is_ok());
    }

    #[test]
    fn test_admit_pool_exhausted() {
        let err = admit(2, &sample(1024, 10.0), &config()).unwrap_err();
        assert!(matches!(err, AcquireError::PoolExhausted));
        assert_eq!(err.reason(), "pool_exhausted");
    }

    #[test]
    fn test_admit_memory_pressure() {
        let err = admit(0, &sample(100, 10.0), &config()).unwrap_err();
        assert!(matches!(err, AcquireError::InsufficientMemory));
    }

    #[test]
    fn test_admit_cpu_pressure() {
        let err = admit(0, &sample(1024, 97.5), &config()).unwrap_err();
        assert!(matches!(err, AcquireError::HighCpuUtilization));
    }

    #[test]
    fn test_pool_cap_checked_before_resources() {
        // Exhaustion wins over resource pressure in reporting
        let err = admit(2, &sample(100, 99.0), &config()).unwrap_err();
        assert!(matches!(err, AcquireError::PoolExhausted));
    }
}

//! Worktree provider port.

use async_trait::async_trait;
use uuid::Uuid;

use crate::domain::errors::EngineResult;
use crate::domain::models::{AcquireError, ManagedWorktree, WorktreeRequest};

/// Hands out isolated working copies subject to admission control.
///
/// The git-backed pool is the production implementation; tests substitute an
/// in-memory provider.
#[async_trait]
pub trait WorktreeProvider: Send + Sync {
    async fn acquire(&self, request: WorktreeRequest) -> Result<ManagedWorktree, AcquireError>;

    /// Destroy the worktree. Fails if it is in use or merging.
    async fn release(&self, id: Uuid) -> EngineResult<()>;

    /// Keep the worktree on disk (e.g. after a failed task) but stop
    /// tracking it as active.
    async fn preserve(&self, id: Uuid) -> EngineResult<()>;
}

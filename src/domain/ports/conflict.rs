//! Merge conflict resolver port.

use async_trait::async_trait;
use std::path::Path;

use crate::domain::errors::EngineResult;

/// Result of an AI-assisted conflict resolution attempt.
#[derive(Debug, Clone)]
pub struct ResolutionOutcome {
    /// Files the resolver claims to have resolved
    pub resolved_files: Vec<String>,
    /// Resolver self-reported confidence in [0, 1]
    pub confidence: f64,
}

/// Resolves merge conflicts in a working copy, typically by invoking an
/// agent over the conflicted files.
#[async_trait]
pub trait ConflictResolver: Send + Sync {
    async fn resolve(
        &self,
        repo_path: &Path,
        conflict_files: &[String],
    ) -> EngineResult<ResolutionOutcome>;
}

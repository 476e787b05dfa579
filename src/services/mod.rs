//! Service layer: the execution engine and its collaborators.

pub mod engine;
pub mod log_store;
pub mod merge_engine;
pub mod parallel_executor;
pub mod rate_limit_detector;
pub mod subagent_parser;
pub mod worktree_pool;

pub use engine::{EngineDeps, EngineEvent, ExecutionEngine, WorkerMode};
pub use log_store::{IterationLog, LogMetadata, LogStore, SaveOptions};
pub use merge_engine::{MergeEngine, MergeOutcomeStatus, MergeReport, RollbackOptions};
pub use parallel_executor::{ParallelEvent, ParallelExecutor};
pub use rate_limit_detector::{RateLimitDetector, RateLimitVerdict};
pub use subagent_parser::SubagentParser;
pub use worktree_pool::WorktreePool;

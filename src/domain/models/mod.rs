//! Domain models
//!
//! Pure domain entities with business logic and validation rules.
//! These models are framework-agnostic and contain no infrastructure concerns.

pub mod config;
pub mod engine;
pub mod execution;
pub mod iteration;
pub mod parallel;
pub mod subagent;
pub mod task;
pub mod worktree;

pub use config::{
    AgentOptions, EngineConfig, ErrorStrategy, MergeConfig, ParallelConfig, RateLimitConfig,
    RetryConfig, SandboxConfig, WorktreePoolConfig,
};
pub use engine::{
    ActiveAgent, AgentBindingReason, AgentSwitchRecord, EngineStatus, IterationInfo,
    RateLimitState, StopReason,
};
pub use execution::{
    AgentExecutionResult, DetectResult, ExecutionStatus, PreflightResult, SandboxRequirements,
};
pub use iteration::{IterationResult, IterationStatus};
pub use parallel::{
    BatchResult, FailurePhase, ParallelTaskError, ParallelTaskResult, ParallelTaskStatus, WorkUnit,
};
pub use subagent::{
    SubagentEvent, SubagentMessage, SubagentNode, SubagentPhase, SubagentState, SubagentStats,
    SubagentStatus, SubagentTrace,
};
pub use task::{Task, TaskFilter, TaskStatus};
pub use worktree::{
    AcquireError, ManagedWorktree, WorktreeRequest, WorktreeStatus,
};

//! Epicycle - Iterative AI Agent Execution Engine
//!
//! Drives an outer loop over a task tracker: select the next actionable task,
//! render a prompt, spawn an agent CLI subprocess, capture and parse its
//! output (including nested subagent lifecycle events), detect completion,
//! update the tracker, persist a per-iteration log, and handle failures
//! according to a configured policy. Supports rate-limit-aware agent fallback
//! with primary recovery, auto-commit, pause/resume/stop, and parallel
//! execution of independent tasks in isolated git worktrees.

pub mod adapters;
pub mod cli;
pub mod domain;
pub mod infrastructure;
pub mod services;

// Re-export key types for convenience
pub use domain::errors::{EngineError, EngineResult};
pub use domain::models::{EngineConfig, Task, TaskStatus};
pub use services::engine::ExecutionEngine;

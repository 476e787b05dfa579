//! Engine runtime state models.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Lifecycle status of the execution engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EngineStatus {
    Idle,
    Running,
    /// Pause requested, not yet honored by the loop
    Pausing,
    Paused,
    /// Stop requested, loop is winding down
    Stopping,
}

impl EngineStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Running => "running",
            Self::Pausing => "pausing",
            Self::Paused => "paused",
            Self::Stopping => "stopping",
        }
    }
}

/// Why the currently bound agent was chosen.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentBindingReason {
    /// The configured primary agent
    Primary,
    /// A fallback bound after the primary was rate-limited
    Fallback,
}

impl AgentBindingReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Primary => "primary",
            Self::Fallback => "fallback",
        }
    }
}

/// The agent the engine is currently executing with.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActiveAgent {
    pub plugin_id: String,
    pub reason: AgentBindingReason,
    pub since: DateTime<Utc>,
}

impl ActiveAgent {
    pub fn primary(plugin_id: impl Into<String>) -> Self {
        Self {
            plugin_id: plugin_id.into(),
            reason: AgentBindingReason::Primary,
            since: Utc::now(),
        }
    }

    pub fn fallback(plugin_id: impl Into<String>) -> Self {
        Self {
            plugin_id: plugin_id.into(),
            reason: AgentBindingReason::Fallback,
            since: Utc::now(),
        }
    }
}

/// Rate-limit bookkeeping for the primary/fallback pair.
///
/// `limited_at` is set on the first switch away from the primary and cleared
/// on successful recovery.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitState {
    pub primary_agent: String,
    pub limited_at: Option<DateTime<Utc>>,
    pub fallback_agent: Option<String>,
}

impl RateLimitState {
    pub fn new(primary_agent: impl Into<String>) -> Self {
        Self {
            primary_agent: primary_agent.into(),
            limited_at: None,
            fallback_agent: None,
        }
    }
}

/// A recorded switch between agents within one engine session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentSwitchRecord {
    pub from: String,
    pub to: String,
    pub reason: AgentBindingReason,
    pub at: DateTime<Utc>,
}

/// Why the engine loop stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    MaxIterations,
    Completed,
    NoTasks,
    Interrupted,
    Error,
}

impl StopReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::MaxIterations => "max_iterations",
            Self::Completed => "completed",
            Self::NoTasks => "no_tasks",
            Self::Interrupted => "interrupted",
            Self::Error => "error",
        }
    }
}

/// Snapshot of iteration progress for UIs.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct IterationInfo {
    pub current_iteration: u32,
    /// 0 = unbounded
    pub max_iterations: u32,
    pub tasks_completed: usize,
    pub total_tasks: usize,
}

//! Subagent trace models.
//!
//! A subagent is a nested tool/agent invocation detected inside an agent's
//! streamed output. States form a forest; root depth is 1.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

/// Lifecycle status of a subagent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubagentStatus {
    Running,
    Completed,
    Error,
}

/// State of one subagent invocation.
///
/// A subagent transitions running -> completed|error exactly once; `depth` is
/// stable for the lifetime of the id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubagentState {
    pub id: Uuid,
    pub parent_id: Option<Uuid>,
    /// Tag string identifying the subagent kind (e.g. tool name)
    pub kind: String,
    pub description: String,
    pub status: SubagentStatus,
    pub spawned_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub duration_ms: Option<u64>,
    pub prompt: Option<String>,
    pub result: Option<String>,
    pub child_ids: Vec<Uuid>,
    /// 1 for top-level subagents
    pub depth: u32,
}

/// Phase of a subagent lifecycle event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubagentPhase {
    Start,
    End,
}

/// Append-only lifecycle event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubagentEvent {
    pub id: Uuid,
    pub parent_id: Option<Uuid>,
    pub kind: String,
    pub phase: SubagentPhase,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<serde_json::Value>,
}

/// Canonical message shape the subagent parser consumes.
///
/// Plugins that support tracing adapt their native stream format into this
/// shape; plugins that don't simply never produce them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SubagentMessage {
    /// A task-spawning tool use opened a new subagent.
    TaskSpawn {
        /// Stream-native correlation id (e.g. tool_use id)
        tool_id: String,
        kind: String,
        description: String,
        prompt: Option<String>,
    },
    /// A result message closed the subagent with the given correlation id.
    TaskEnd {
        tool_id: String,
        is_error: bool,
        result: Option<String>,
    },
}

/// One node of the reconstructed subagent forest.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubagentNode {
    pub state: SubagentState,
    pub children: Vec<SubagentNode>,
}

/// Aggregated statistics over a trace.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SubagentStats {
    pub total_subagents: usize,
    pub by_type: HashMap<String, usize>,
    /// Sum of durations of completed subagents
    pub total_duration_ms: u64,
    pub failure_count: usize,
    pub max_depth: u32,
}

/// Complete trace: ordered events, final hierarchy, and stats.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SubagentTrace {
    pub events: Vec<SubagentEvent>,
    pub hierarchy: Vec<SubagentNode>,
    pub stats: SubagentStats,
}

impl SubagentTrace {
    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }
}

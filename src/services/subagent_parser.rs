//! Subagent trace parser.
//!
//! Consumes canonicalized per-agent messages and maintains the map of active
//! and completed subagents plus an ordered event log. Nesting is inferred
//! from a stack: a spawn observed while another subagent is running becomes
//! its child.

use chrono::Utc;
use std::collections::HashMap;
use uuid::Uuid;

use crate::domain::models::{
    SubagentEvent, SubagentMessage, SubagentNode, SubagentPhase, SubagentState, SubagentStats,
    SubagentStatus, SubagentTrace,
};

/// Stateful parser for one agent execution's trace stream.
#[derive(Debug, Default)]
pub struct SubagentParser {
    subagents: HashMap<Uuid, SubagentState>,
    /// Insertion order, for deterministic hierarchy output
    order: Vec<Uuid>,
    events: Vec<SubagentEvent>,
    /// Currently running subagents, deepest last
    active_stack: Vec<Uuid>,
    /// Stream-native correlation id to subagent id
    tool_ids: HashMap<String, Uuid>,
}

impl SubagentParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one canonical message.
    pub fn process(&mut self, message: &SubagentMessage) {
        match message {
            SubagentMessage::TaskSpawn {
                tool_id,
                kind,
                description,
                prompt,
            } => self.open(tool_id, kind, description, prompt.as_deref()),
            SubagentMessage::TaskEnd {
                tool_id,
                is_error,
                result,
            } => self.close(tool_id, *is_error, result.as_deref()),
        }
    }

    fn open(&mut self, tool_id: &str, kind: &str, description: &str, prompt: Option<&str>) {
        let id = Uuid::new_v4();
        let parent_id = self.active_stack.last().copied();
        let depth = parent_id
            .and_then(|p| self.subagents.get(&p))
            .map_or(1, |parent| parent.depth + 1);

        if let Some(parent) = parent_id.and_then(|p| self.subagents.get_mut(&p)) {
            parent.child_ids.push(id);
        }

        let state = SubagentState {
            id,
            parent_id,
            kind: kind.to_string(),
            description: description.to_string(),
            status: SubagentStatus::Running,
            spawned_at: Utc::now(),
            ended_at: None,
            duration_ms: None,
            prompt: prompt.map(ToString::to_string),
            result: None,
            child_ids: Vec::new(),
            depth,
        };

        self.events.push(SubagentEvent {
            id,
            parent_id,
            kind: kind.to_string(),
            phase: SubagentPhase::Start,
            timestamp: state.spawned_at,
            payload: None,
        });

        self.subagents.insert(id, state);
        self.order.push(id);
        self.active_stack.push(id);
        self.tool_ids.insert(tool_id.to_string(), id);
    }

    fn close(&mut self, tool_id: &str, is_error: bool, result: Option<&str>) {
        let Some(&id) = self.tool_ids.get(tool_id) else {
            return;
        };
        let Some(state) = self.subagents.get_mut(&id) else {
            return;
        };
        if state.status != SubagentStatus::Running {
            // An id ends at most once.
            return;
        }

        let ended_at = Utc::now();
        state.status = if is_error {
            SubagentStatus::Error
        } else {
            SubagentStatus::Completed
        };
        state.ended_at = Some(ended_at);
        state.duration_ms =
            Some((ended_at - state.spawned_at).num_milliseconds().max(0) as u64);
        state.result = result.map(ToString::to_string);

        let kind = state.kind.clone();
        let parent_id = state.parent_id;

        self.events.push(SubagentEvent {
            id,
            parent_id,
            kind,
            phase: SubagentPhase::End,
            timestamp: ended_at,
            payload: result.map(|r| serde_json::Value::String(r.to_string())),
        });

        self.active_stack.retain(|active| *active != id);
    }

    pub fn events(&self) -> &[SubagentEvent] {
        &self.events
    }

    pub fn subagent(&self, id: Uuid) -> Option<&SubagentState> {
        self.subagents.get(&id)
    }

    pub fn all_subagents(&self) -> Vec<&SubagentState> {
        self.order
            .iter()
            .filter_map(|id| self.subagents.get(id))
            .collect()
    }

    pub fn active_stack(&self) -> &[Uuid] {
        &self.active_stack
    }

    pub fn has_events(&self) -> bool {
        !self.events.is_empty()
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }

    /// Build the aggregated trace from the final state map.
    pub fn trace(&self) -> SubagentTrace {
        let mut stats = SubagentStats {
            total_subagents: self.subagents.len(),
            ..Default::default()
        };

        for state in self.subagents.values() {
            *stats.by_type.entry(state.kind.clone()).or_insert(0) += 1;
            if let Some(duration) = state.duration_ms {
                stats.total_duration_ms += duration;
            }
            if state.status == SubagentStatus::Error {
                stats.failure_count += 1;
            }
            stats.max_depth = stats.max_depth.max(state.depth);
        }

        SubagentTrace {
            events: self.events.clone(),
            hierarchy: self.build_forest(),
            stats,
        }
    }

    fn build_forest(&self) -> Vec<SubagentNode> {
        self.order
            .iter()
            .filter_map(|id| self.subagents.get(id))
            .filter(|state| state.parent_id.is_none())
            .map(|state| self.build_node(state))
            .collect()
    }

    fn build_node(&self, state: &SubagentState) -> SubagentNode {
        SubagentNode {
            state: state.clone(),
            children: state
                .child_ids
                .iter()
                .filter_map(|child| self.subagents.get(child))
                .map(|child| self.build_node(child))
                .collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spawn(tool_id: &str, kind: &str) -> SubagentMessage {
        SubagentMessage::TaskSpawn {
            tool_id: tool_id.to_string(),
            kind: kind.to_string(),
            description: format!("{kind} work"),
            prompt: None,
        }
    }

    fn end(tool_id: &str, is_error: bool) -> SubagentMessage {
        SubagentMessage::TaskEnd {
            tool_id: tool_id.to_string(),
            is_error,
            result: Some("done".to_string()),
        }
    }

    #[test]
    fn test_single_subagent_lifecycle() {
        let mut parser = SubagentParser::new();
        parser.process(&spawn("t1", "explorer"));

        assert_eq!(parser.active_stack().len(), 1);
        let state = parser.all_subagents()[0];
        assert_eq!(state.status, SubagentStatus::Running);
        assert_eq!(state.depth, 1);

        parser.process(&end("t1", false));
        assert!(parser.active_stack().is_empty());
        let state = parser.all_subagents()[0];
        assert_eq!(state.status, SubagentStatus::Completed);
        assert!(state.duration_ms.is_some());
    }

    #[test]
    fn test_nesting_and_depth() {
        let mut parser = SubagentParser::new();
        parser.process(&spawn("outer", "planner"));
        parser.process(&spawn("inner", "coder"));

        let all = parser.all_subagents();
        assert_eq!(all[0].depth, 1);
        assert_eq!(all[1].depth, 2);
        assert_eq!(all[1].parent_id, Some(all[0].id));
        assert_eq!(all[0].child_ids, vec![all[1].id]);

        parser.process(&end("inner", false));
        parser.process(&end("outer", false));

        let trace = parser.trace();
        assert_eq!(trace.hierarchy.len(), 1);
        assert_eq!(trace.hierarchy[0].children.len(), 1);
        assert_eq!(trace.stats.max_depth, 2);
    }

    #[test]
    fn test_events_ordered_start_before_end() {
        let mut parser = SubagentParser::new();
        parser.process(&spawn("a", "x"));
        parser.process(&end("a", false));
        parser.process(&spawn("b", "y"));
        parser.process(&end("b", true));

        let events = parser.events();
        assert_eq!(events.len(), 4);
        assert_eq!(events[0].phase, SubagentPhase::Start);
        assert_eq!(events[1].phase, SubagentPhase::End);
        assert_eq!(events[0].id, events[1].id);
        assert_eq!(events[2].id, events[3].id);
    }

    #[test]
    fn test_end_happens_at_most_once() {
        let mut parser = SubagentParser::new();
        parser.process(&spawn("a", "x"));
        parser.process(&end("a", false));
        parser.process(&end("a", true));

        assert_eq!(parser.events().len(), 2);
        assert_eq!(
            parser.all_subagents()[0].status,
            SubagentStatus::Completed
        );
    }

    #[test]
    fn test_unknown_end_ignored() {
        let mut parser = SubagentParser::new();
        parser.process(&end("phantom", false));
        assert!(parser.events().is_empty());
    }

    #[test]
    fn test_stats_aggregation() {
        let mut parser = SubagentParser::new();
        parser.process(&spawn("a", "coder"));
        parser.process(&end("a", false));
        parser.process(&spawn("b", "coder"));
        parser.process(&end("b", true));
        parser.process(&spawn("c", "reviewer"));

        let trace = parser.trace();
        assert_eq!(trace.stats.total_subagents, 3);
        assert_eq!(trace.stats.by_type.get("coder"), Some(&2));
        assert_eq!(trace.stats.by_type.get("reviewer"), Some(&1));
        assert_eq!(trace.stats.failure_count, 1);
    }

    #[test]
    fn test_reset_clears_everything() {
        let mut parser = SubagentParser::new();
        parser.process(&spawn("a", "x"));
        parser.reset();
        assert!(!parser.has_events());
        assert!(parser.all_subagents().is_empty());
        assert!(parser.active_stack().is_empty());
    }

    #[test]
    fn test_sibling_after_child_completes() {
        let mut parser = SubagentParser::new();
        parser.process(&spawn("parent", "planner"));
        parser.process(&spawn("c1", "coder"));
        parser.process(&end("c1", false));
        parser.process(&spawn("c2", "coder"));

        let all = parser.all_subagents();
        // c2 is a sibling of c1, both children of parent
        assert_eq!(all[2].parent_id, all[1].parent_id);
        assert_eq!(all[2].depth, 2);
    }
}

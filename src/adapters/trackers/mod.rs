//! Tracker plugin implementations.

pub mod file;
pub mod memory;

pub use file::FileTracker;
pub use memory::InMemoryTracker;

use std::collections::HashSet;

use crate::domain::models::{Task, TaskFilter, TaskStatus};

/// Dependency-aware next-task selection shared by the built-in trackers.
///
/// Only tasks whose `depends_on` are all completed are actionable; among
/// those, highest priority wins, declaration order breaks ties.
pub(crate) fn next_actionable(tasks: &[Task], filter: &TaskFilter) -> Option<Task> {
    let completed: HashSet<&str> = tasks
        .iter()
        .filter(|t| t.status == TaskStatus::Completed)
        .map(|t| t.id.as_str())
        .collect();

    tasks
        .iter()
        .enumerate()
        .filter(|(_, t)| filter.matches(t))
        .filter(|(_, t)| t.depends_on.iter().all(|d| completed.contains(d.as_str())))
        .min_by_key(|(idx, t)| (std::cmp::Reverse(t.priority), *idx))
        .map(|(_, t)| t.clone())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dependency_gating() {
        let tasks = vec![
            Task::new("a", "A"),
            Task::new("b", "B").with_depends_on(vec!["a".to_string()]),
        ];
        let filter = TaskFilter::actionable(vec![]);

        let next = next_actionable(&tasks, &filter).unwrap();
        assert_eq!(next.id, "a");

        let mut tasks = tasks;
        tasks[0].status = TaskStatus::Completed;
        let next = next_actionable(&tasks, &filter).unwrap();
        assert_eq!(next.id, "b");
    }

    #[test]
    fn test_priority_ordering_with_stable_ties() {
        let tasks = vec![
            Task::new("low", "L").with_priority(1),
            Task::new("high", "H").with_priority(5),
            Task::new("high2", "H2").with_priority(5),
        ];
        let filter = TaskFilter::actionable(vec![]);
        assert_eq!(next_actionable(&tasks, &filter).unwrap().id, "high");
    }

    #[test]
    fn test_exclusions_respected() {
        let tasks = vec![Task::new("a", "A"), Task::new("b", "B")];
        let filter = TaskFilter::actionable(vec!["a".to_string()]);
        assert_eq!(next_actionable(&tasks, &filter).unwrap().id, "b");
    }
}

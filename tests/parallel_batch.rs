//! Parallel executor scenarios against a mock worktree provider and the
//! mock agent plugin.

use async_trait::async_trait;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use uuid::Uuid;

use epicycle::adapters::agents::{AgentRegistry, MockAgentPlugin, MockBehavior};
use epicycle::domain::errors::EngineResult;
use epicycle::domain::models::{
    AcquireError, EngineConfig, ManagedWorktree, ParallelTaskStatus, Task, WorkUnit,
    WorktreeRequest,
};
use epicycle::domain::ports::{AgentPlugin, WorktreeProvider};
use epicycle::infrastructure::DefaultTemplateRenderer;
use epicycle::services::ParallelExecutor;

/// In-memory worktree provider that fabricates paths and records releases.
#[derive(Default)]
struct MockWorktreeProvider {
    acquired: AtomicUsize,
    released: Mutex<Vec<Uuid>>,
    preserved: Mutex<Vec<Uuid>>,
    deny_acquires: std::sync::atomic::AtomicBool,
}

#[async_trait]
impl WorktreeProvider for MockWorktreeProvider {
    async fn acquire(&self, request: WorktreeRequest) -> Result<ManagedWorktree, AcquireError> {
        if self.deny_acquires.load(Ordering::SeqCst) {
            return Err(AcquireError::PoolExhausted);
        }
        let n = self.acquired.fetch_add(1, Ordering::SeqCst);
        let name = format!("{}-{n}", request.base_name);
        let mut worktree = ManagedWorktree::new(
            name.clone(),
            PathBuf::from(format!(".worktrees/{name}")),
            format!("epicycle/{name}"),
        );
        worktree.mark_ready();
        worktree.assign(request.task_id, request.agent_id);
        Ok(worktree)
    }

    async fn release(&self, id: Uuid) -> EngineResult<()> {
        self.released.lock().unwrap().push(id);
        Ok(())
    }

    async fn preserve(&self, id: Uuid) -> EngineResult<()> {
        self.preserved.lock().unwrap().push(id);
        Ok(())
    }
}

struct Harness {
    executor: ParallelExecutor,
    provider: Arc<MockWorktreeProvider>,
    agent: Arc<MockAgentPlugin>,
}

fn build(mut config: EngineConfig) -> Harness {
    config.agent = "claude_code".to_string();
    let registry = Arc::new(AgentRegistry::new(&config));
    let agent = Arc::new(MockAgentPlugin::with_id("claude_code"));
    let plugin: Arc<dyn AgentPlugin> = agent.clone();
    registry.register("claude_code", plugin);

    let provider = Arc::new(MockWorktreeProvider::default());
    let pool: Arc<dyn WorktreeProvider> = provider.clone();

    let executor = ParallelExecutor::new(
        config,
        registry,
        Arc::new(DefaultTemplateRenderer),
        pool,
    );

    Harness {
        executor,
        provider,
        agent,
    }
}

fn tasks(ids: &[&str]) -> Vec<Task> {
    ids.iter()
        .map(|id| Task::new(*id, format!("Task {id}")))
        .collect()
}

#[tokio::test]
async fn s6_continue_on_error_batch() {
    let mut config = EngineConfig::default();
    config.parallel.max_concurrency = 2;
    config.parallel.continue_on_error = true;
    config.parallel.preserve_failed_worktrees = true;

    let harness = build(config);
    // Task T2 fails during execution; the rest succeed.
    harness
        .agent
        .behavior_for_prompt("Task T2:", MockBehavior::failure(1, "broken build"));

    let batch = harness
        .executor
        .execute(vec![WorkUnit::new("unit-1", tasks(&["T1", "T2", "T3", "T4"]))])
        .await
        .unwrap();

    let (completed, failed, cancelled) = {
        let mut counts = (0, 0, 0);
        for result in &batch.results {
            match result.status {
                ParallelTaskStatus::Completed => counts.0 += 1,
                ParallelTaskStatus::Failed => counts.1 += 1,
                ParallelTaskStatus::Cancelled => counts.2 += 1,
            }
        }
        counts
    };
    assert_eq!((completed, failed, cancelled), (3, 1, 0));

    let report = batch.failure_report.expect("failure report");
    assert!(report.contains("### Task T2"));
    assert!(report.contains("- **Phase**: agent_execution"));
    assert!(report.contains("broken build"));
    assert!(report.contains("## Preserved Worktrees"));

    // The failed task's worktree was preserved, the other three released.
    assert_eq!(harness.provider.preserved.lock().unwrap().len(), 1);
    assert_eq!(harness.provider.released.lock().unwrap().len(), 3);
}

#[tokio::test]
async fn shutdown_mode_cancels_queued_tasks() {
    let mut config = EngineConfig::default();
    config.parallel.max_concurrency = 1;
    config.parallel.continue_on_error = false;

    let harness = build(config);
    harness
        .agent
        .behavior_for_prompt("Task T1:", MockBehavior::failure(1, "first task fails"));

    let batch = harness
        .executor
        .execute(vec![WorkUnit::new("unit-1", tasks(&["T1", "T2", "T3"]))])
        .await
        .unwrap();

    let statuses: Vec<ParallelTaskStatus> = batch
        .results
        .iter()
        .map(|result| result.status)
        .collect();
    assert_eq!(statuses[0], ParallelTaskStatus::Failed);
    assert_eq!(
        statuses[1..],
        [ParallelTaskStatus::Cancelled, ParallelTaskStatus::Cancelled]
    );
    // Only the first task ever reached an agent.
    assert_eq!(harness.agent.execution_count(), 1);
}

#[tokio::test]
async fn worktree_acquisition_failure_is_attributed() {
    let mut config = EngineConfig::default();
    config.parallel.max_concurrency = 1;

    let harness = build(config);
    harness.provider.deny_acquires.store(true, Ordering::SeqCst);

    let batch = harness
        .executor
        .execute(vec![WorkUnit::new("unit-1", tasks(&["T1"]))])
        .await
        .unwrap();

    assert_eq!(batch.results.len(), 1);
    let result = &batch.results[0];
    assert_eq!(result.status, ParallelTaskStatus::Failed);
    let error = result.error.as_ref().unwrap();
    assert_eq!(
        error.phase,
        epicycle::domain::models::FailurePhase::WorktreeAcquisition
    );
    // No agent ran at all.
    assert_eq!(harness.agent.execution_count(), 0);
}

#[tokio::test]
async fn subagent_summary_collected_per_task() {
    let config = EngineConfig::default();
    let harness = build(config);

    let jsonl = vec![
        serde_json::json!({
            "type": "task_spawn",
            "tool_id": "t-1",
            "kind": "coder",
            "description": "implement",
            "prompt": null
        }),
        serde_json::json!({
            "type": "task_end",
            "tool_id": "t-1",
            "is_error": false,
            "result": "ok"
        }),
    ];
    harness.agent.behavior_for_prompt(
        "Task T1:",
        MockBehavior::completed_with_promise("done").with_jsonl(jsonl),
    );

    let batch = harness
        .executor
        .execute(vec![WorkUnit::new("unit-1", tasks(&["T1"]))])
        .await
        .unwrap();

    let summary = batch.results[0]
        .subagent_summary
        .as_ref()
        .expect("subagent summary");
    assert_eq!(summary.total_subagents, 1);
    assert_eq!(summary.by_type.get("coder"), Some(&1));
}

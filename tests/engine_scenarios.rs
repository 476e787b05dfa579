//! End-to-end engine loop scenarios against the mock agent plugin and the
//! in-memory tracker.

use std::sync::{Arc, Mutex};
use tempfile::TempDir;

use epicycle::adapters::agents::{AgentRegistry, MockAgentPlugin, MockBehavior};
use epicycle::adapters::trackers::InMemoryTracker;
use epicycle::domain::models::{
    AgentBindingReason, EngineConfig, ErrorStrategy, IterationStatus, StopReason, Task, TaskStatus,
};
use epicycle::domain::ports::Tracker;
use epicycle::infrastructure::DefaultTemplateRenderer;
use epicycle::services::engine::{EngineDeps, EngineEvent, ExecutionEngine, WorkerMode};
use epicycle::services::log_store::LogStore;

struct Harness {
    engine: Arc<ExecutionEngine>,
    tracker: Arc<InMemoryTracker>,
    primary: Arc<MockAgentPlugin>,
    events: Arc<Mutex<Vec<EngineEvent>>>,
    workspace: TempDir,
}

fn fast_config() -> EngineConfig {
    let mut config = EngineConfig::default();
    config.agent = "claude_code".to_string();
    config.iteration_delay_ms = 0;
    config.retry.retry_delay_ms = 0;
    config.rate_limit.base_backoff_ms = 1;
    config
}

fn build(config: EngineConfig, tasks: Vec<Task>, fallback: Option<Arc<MockAgentPlugin>>) -> Harness {
    let workspace = TempDir::new().unwrap();
    let tracker = Arc::new(InMemoryTracker::new(tasks));
    let registry = Arc::new(AgentRegistry::new(&config));

    let primary = Arc::new(MockAgentPlugin::with_id("claude_code"));
    let primary_plugin: Arc<dyn epicycle::domain::ports::AgentPlugin> = primary.clone();
    registry.register("claude_code", primary_plugin);
    if let Some(fallback) = fallback {
        registry.register("opencode", fallback);
    }
    let tracker_port: Arc<dyn Tracker> = tracker.clone();

    let engine = Arc::new(ExecutionEngine::new(
        config,
        workspace.path(),
        EngineDeps {
            tracker: tracker_port,
            registry,
            renderer: Arc::new(DefaultTemplateRenderer),
            auto_commit: None,
        },
    ));

    let events = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&events);
    // Subscription kept for the engine's lifetime via leak into the harness
    std::mem::forget(engine.listen(move |event| {
        sink.lock().unwrap().push(event.clone());
    }));

    Harness {
        engine,
        tracker,
        primary,
        events,
        workspace,
    }
}

fn event_names(events: &[EngineEvent]) -> Vec<&'static str> {
    events.iter().map(EngineEvent::name).collect()
}

/// Assert `expected` occurs as an ordered subsequence of `names`.
fn assert_subsequence(names: &[&'static str], expected: &[&'static str]) {
    let mut iter = names.iter();
    for want in expected {
        assert!(
            iter.any(|name| name == want),
            "event '{want}' missing or out of order in {names:?}"
        );
    }
}

#[tokio::test]
async fn s1_happy_path_single_task() {
    let harness = build(fast_config(), vec![Task::new("T1", "First task")], None);
    harness.engine.initialize(None).await.unwrap();

    let reason = harness.engine.start().await.unwrap();
    assert_eq!(reason, StopReason::Completed);

    let events = harness.events.lock().unwrap();
    assert_subsequence(
        &event_names(&events),
        &[
            "engine:started",
            "iteration:started",
            "task:selected",
            "task:activated",
            "agent:output",
            "task:completed",
            "iteration:completed",
            "all:complete",
            "engine:stopped",
        ],
    );

    // The iteration result says both completion flags are set.
    let completed = events.iter().find_map(|event| match event {
        EngineEvent::IterationCompleted { result } => Some(result.clone()),
        _ => None,
    });
    let completed = completed.expect("iteration:completed event");
    assert_eq!(completed.status, IterationStatus::Completed);
    assert!(completed.task_completed);
    assert!(completed.promise_complete);
    drop(events);

    // Tracker saw exactly one completion.
    let snapshot = harness.tracker.snapshot();
    assert_eq!(snapshot[0].status, TaskStatus::Completed);

    // One log file with the promise recorded.
    let store = LogStore::new(".epicycle/logs");
    let logs = store
        .list_iteration_logs(harness.workspace.path(), None)
        .await
        .unwrap();
    assert_eq!(logs.len(), 1);
    assert_eq!(logs[0].metadata.status, IterationStatus::Completed);
    assert!(logs[0].metadata.promise_complete);
    assert!(logs[0].stdout.contains("<promise>COMPLETE</promise>"));
}

#[tokio::test]
async fn s2_retry_then_skip() {
    let mut config = fast_config();
    config.retry.strategy = ErrorStrategy::Retry;
    config.retry.max_retries = 2;

    let harness = build(config, vec![Task::new("T1", "Flaky task")], None);
    for _ in 0..3 {
        harness
            .primary
            .push_behavior(MockBehavior::failure(1, "boom"));
    }

    harness.engine.initialize(None).await.unwrap();
    let reason = harness.engine.start().await.unwrap();
    assert_eq!(reason, StopReason::NoTasks);

    // The agent ran exactly three times: initial + two retries.
    assert_eq!(harness.primary.execution_count(), 3);

    let events = harness.events.lock().unwrap();
    let retrying: Vec<(u32, u32)> = events
        .iter()
        .filter_map(|event| match event {
            EngineEvent::IterationRetrying { attempt, max } => Some((*attempt, *max)),
            _ => None,
        })
        .collect();
    assert_eq!(retrying, vec![(1, 2), (2, 2)]);
    assert_subsequence(
        &event_names(&events),
        &[
            "iteration:retrying",
            "iteration:retrying",
            "iteration:failed",
            "iteration:skipped",
        ],
    );

    // All attempts ran under the same iteration number.
    let iteration_numbers: Vec<u32> = events
        .iter()
        .filter_map(|event| match event {
            EngineEvent::IterationStarted { iteration, .. } => Some(*iteration),
            _ => None,
        })
        .collect();
    assert_eq!(iteration_numbers, vec![1, 1, 1]);
}

#[tokio::test]
async fn s3_rate_limit_respects_retry_after() {
    let harness = build(fast_config(), vec![Task::new("T1", "Limited once")], None);
    harness
        .primary
        .push_behavior(MockBehavior::rate_limited_with_retry_after(1));
    // Second attempt succeeds with the default promise behavior.

    harness.engine.initialize(None).await.unwrap();
    let started = std::time::Instant::now();
    let reason = harness.engine.start().await.unwrap();
    assert_eq!(reason, StopReason::Completed);
    // The server hint (1 s) was honored.
    assert!(started.elapsed() >= std::time::Duration::from_secs(1));

    let events = harness.events.lock().unwrap();
    let rate_limited = events.iter().find_map(|event| match event {
        EngineEvent::IterationRateLimited {
            attempt,
            delay_ms,
            used_retry_after,
            ..
        } => Some((*attempt, *delay_ms, *used_retry_after)),
        _ => None,
    });
    assert_eq!(rate_limited, Some((1, 1000, true)));

    // Task completed within the same iteration number.
    let completed_iterations: Vec<u32> = events
        .iter()
        .filter_map(|event| match event {
            EngineEvent::IterationCompleted { result } => Some(result.iteration),
            _ => None,
        })
        .collect();
    assert_eq!(completed_iterations, vec![1]);
}

#[tokio::test]
async fn s4_fallback_then_primary_recovery() {
    let mut config = fast_config();
    config.fallback_agents = vec!["opencode".to_string()];
    config.rate_limit.max_retries = 1;

    let fallback = Arc::new(MockAgentPlugin::with_id("opencode"));
    let harness = build(
        config,
        vec![Task::new("T1", "First"), Task::new("T2", "Second")],
        Some(Arc::clone(&fallback)),
    );

    // Primary: limited twice for T1 (initial try + 1 rate-limit retry),
    // then healthy for the recovery probe and T2.
    harness.primary.push_behavior(MockBehavior::rate_limited());
    harness.primary.push_behavior(MockBehavior::rate_limited());

    harness.engine.initialize(None).await.unwrap();
    let reason = harness.engine.start().await.unwrap();
    assert_eq!(reason, StopReason::Completed);

    let events = harness.events.lock().unwrap();
    let switches: Vec<(String, String, AgentBindingReason)> = events
        .iter()
        .filter_map(|event| match event {
            EngineEvent::AgentSwitched { from, to, reason } => {
                Some((from.clone(), to.clone(), *reason))
            }
            _ => None,
        })
        .collect();
    assert_eq!(
        switches,
        vec![
            (
                "claude_code".to_string(),
                "opencode".to_string(),
                AgentBindingReason::Fallback
            ),
            (
                "opencode".to_string(),
                "claude_code".to_string(),
                AgentBindingReason::Primary
            ),
        ]
    );

    let recovery = events.iter().find_map(|event| match event {
        EngineEvent::AgentRecoveryAttempted {
            success,
            primary,
            fallback,
            ..
        } => Some((*success, primary.clone(), fallback.clone())),
        _ => None,
    });
    assert_eq!(
        recovery,
        Some((true, "claude_code".to_string(), "opencode".to_string()))
    );

    assert_subsequence(
        &event_names(&events),
        &[
            "agent:switched",
            "task:completed",
            "iteration:completed",
            "agent:recovery-attempted",
            "agent:switched",
            "task:completed",
        ],
    );
    drop(events);

    // T1 went to the fallback, T2 ran on the recovered primary.
    assert_eq!(fallback.execution_count(), 1);
    let state = harness.engine.rate_limit_state().unwrap();
    assert!(state.fallback_agent.is_none());
    assert!(state.limited_at.is_none());
    assert_eq!(
        harness.engine.active_agent().unwrap().reason,
        AgentBindingReason::Primary
    );
}

#[tokio::test]
async fn s5_worker_mode_skip_stops_with_no_tasks() {
    let mut config = fast_config();
    config.retry.strategy = ErrorStrategy::Skip;

    let task = Task::new("T9", "Forced task");
    let harness = build(config, vec![task.clone()], None);
    harness
        .primary
        .push_behavior(MockBehavior::failure(1, "exit 1"));

    harness
        .engine
        .initialize(Some(WorkerMode { task }))
        .await
        .unwrap();
    let reason = harness.engine.start().await.unwrap();
    assert_eq!(reason, StopReason::NoTasks);

    let events = harness.events.lock().unwrap();
    assert_subsequence(
        &event_names(&events),
        &["iteration:failed", "iteration:skipped", "engine:stopped"],
    );
    // The forced task is processed exactly once.
    assert_eq!(harness.primary.execution_count(), 1);
}

#[tokio::test]
async fn all_agents_limited_pauses_engine() {
    let mut config = fast_config();
    config.rate_limit.max_retries = 0;
    // No fallbacks configured.

    let harness = build(config, vec![Task::new("T1", "Unlucky")], None);
    harness
        .primary
        .push_behavior(MockBehavior::rate_limited());

    // Stop the engine as soon as the chain reports exhausted, otherwise the
    // pause would hold the test forever.
    let stopper = Arc::clone(&harness.engine);
    std::mem::forget(harness.engine.listen(move |event| {
        if matches!(event, EngineEvent::AgentAllLimited { .. }) {
            stopper.stop();
        }
    }));

    harness.engine.initialize(None).await.unwrap();
    let reason = harness.engine.start().await.unwrap();
    assert_eq!(reason, StopReason::Interrupted);

    let events = harness.events.lock().unwrap();
    let tried = events.iter().find_map(|event| match event {
        EngineEvent::AgentAllLimited { tried } => Some(tried.clone()),
        _ => None,
    });
    assert_eq!(tried, Some(vec!["claude_code".to_string()]));
}

#[tokio::test]
async fn subagent_trace_lands_in_iteration_log() {
    let harness = build(fast_config(), vec![Task::new("T1", "Traced")], None);

    let jsonl = vec![
        serde_json::json!({
            "type": "task_spawn",
            "tool_id": "tool-1",
            "kind": "explorer",
            "description": "scan the tree",
            "prompt": null
        }),
        serde_json::json!({
            "type": "task_end",
            "tool_id": "tool-1",
            "is_error": false,
            "result": "done"
        }),
    ];
    harness.primary.push_behavior(
        MockBehavior::completed_with_promise("traced run").with_jsonl(jsonl),
    );

    harness.engine.initialize(None).await.unwrap();
    let reason = harness.engine.start().await.unwrap();
    assert_eq!(reason, StopReason::Completed);

    let store = LogStore::new(".epicycle/logs");
    let logs = store
        .list_iteration_logs(harness.workspace.path(), None)
        .await
        .unwrap();
    let trace = logs[0].subagent_trace.as_ref().expect("trace section");
    assert_eq!(trace.stats.total_subagents, 1);
    assert_eq!(trace.stats.by_type.get("explorer"), Some(&1));
    assert_eq!(trace.events.len(), 2);
}

#[tokio::test]
async fn incomplete_run_leaves_task_in_progress_and_resets() {
    // Agent exits cleanly but never emits the promise marker: the iteration
    // succeeds, the task stays in progress, and the next iteration picks it
    // up again.
    let mut config = fast_config();
    config.max_iterations = 1;

    let harness = build(config, vec![Task::new("T1", "Long task")], None);
    harness
        .primary
        .push_behavior(MockBehavior::completed_without_promise("progress, not done"));

    harness.engine.initialize(None).await.unwrap();
    let reason = harness.engine.start().await.unwrap();
    assert_eq!(reason, StopReason::MaxIterations);

    let snapshot = harness.tracker.snapshot();
    assert_eq!(snapshot[0].status, TaskStatus::InProgress);

    // Shutdown recovery: the engine owns that in-progress task and can
    // hand it back.
    harness
        .engine
        .reset_tasks_to_open(&["T1".to_string()])
        .await
        .unwrap();
    let snapshot = harness.tracker.snapshot();
    assert_eq!(snapshot[0].status, TaskStatus::Open);
}

#[tokio::test]
async fn abort_strategy_stops_engine_with_error() {
    let mut config = fast_config();
    config.retry.strategy = ErrorStrategy::Abort;

    let harness = build(config, vec![Task::new("T1", "Fatal")], None);
    harness
        .primary
        .push_behavior(MockBehavior::failure(2, "hard failure"));

    harness.engine.initialize(None).await.unwrap();
    let reason = harness.engine.start().await.unwrap();
    assert_eq!(reason, StopReason::Error);

    let events = harness.events.lock().unwrap();
    let aborted = events.iter().any(|event| {
        matches!(
            event,
            EngineEvent::IterationFailed {
                action: epicycle::services::engine::FailureAction::Abort,
                ..
            }
        )
    });
    assert!(aborted);
}

#[tokio::test]
async fn initialize_fails_when_agent_unavailable() {
    let harness = build(fast_config(), vec![Task::new("T1", "Task")], None);
    harness.primary.set_available(false);

    let err = harness.engine.initialize(None).await;
    assert!(err.is_err());
    assert!(err.unwrap_err().to_string().contains("not found in PATH"));
}

//! Mock agent plugin for testing.
//!
//! Runs entirely in-process: each execution pops a scripted behavior and
//! replays its output through the normal streaming callbacks, so engine
//! tests exercise the same paths real plugins do.

use async_trait::async_trait;
use chrono::Utc;
use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tokio::sync::oneshot;
use uuid::Uuid;

use crate::domain::errors::EngineResult;
use crate::domain::models::{
    AgentExecutionResult, AgentOptions, DetectResult, ExecutionStatus, PreflightResult,
    SandboxRequirements, SubagentMessage,
};
use crate::domain::ports::{
    AgentMeta, AgentPlugin, ExecOptions, ExecutionHandle, InterruptSignal, OutputChunk,
    OutputStreamKind,
};

/// One scripted execution.
#[derive(Debug, Clone)]
pub struct MockBehavior {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
    pub delay: Duration,
    /// Values streamed to the JSONL callback before completion
    pub jsonl: Vec<serde_json::Value>,
}

impl Default for MockBehavior {
    fn default() -> Self {
        Self {
            stdout: "Mock task completed successfully.\n<promise>COMPLETE</promise>\n".to_string(),
            stderr: String::new(),
            exit_code: 0,
            delay: Duration::from_millis(0),
            jsonl: Vec::new(),
        }
    }
}

impl MockBehavior {
    /// A run that succeeds and signals task completion.
    pub fn completed_with_promise(output: impl Into<String>) -> Self {
        Self {
            stdout: format!("{}\n<promise>COMPLETE</promise>\n", output.into()),
            ..Default::default()
        }
    }

    /// A run that succeeds without the completion marker.
    pub fn completed_without_promise(output: impl Into<String>) -> Self {
        Self {
            stdout: format!("{}\n", output.into()),
            ..Default::default()
        }
    }

    pub fn failure(exit_code: i32, stderr: impl Into<String>) -> Self {
        Self {
            stdout: String::new(),
            stderr: format!("{}\n", stderr.into()),
            exit_code,
            ..Default::default()
        }
    }

    pub fn rate_limited() -> Self {
        Self::failure(1, "Error: 429 Too Many Requests")
    }

    pub fn rate_limited_with_retry_after(seconds: u64) -> Self {
        Self::failure(1, format!("Error: 429 Too Many Requests. Retry after {seconds} seconds"))
    }

    pub fn with_jsonl(mut self, jsonl: Vec<serde_json::Value>) -> Self {
        self.jsonl = jsonl;
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }
}

/// Scriptable in-process agent plugin.
pub struct MockAgentPlugin {
    meta: AgentMeta,
    script: Mutex<VecDeque<MockBehavior>>,
    /// Behaviors keyed by a substring of the prompt; checked before the
    /// scripted queue so concurrent executions stay deterministic
    prompt_behaviors: Mutex<Vec<(String, MockBehavior)>>,
    default_behavior: MockBehavior,
    available: AtomicBool,
    executed_prompts: Mutex<Vec<String>>,
}

impl MockAgentPlugin {
    pub fn new() -> Self {
        Self::with_id("mock")
    }

    /// A mock that identifies as `id`, so tests can stand in for any
    /// configured plugin name.
    pub fn with_id(id: &'static str) -> Self {
        Self {
            meta: AgentMeta {
                id,
                name: id,
                default_command: "mock",
                command_aliases: &[],
                supports_subagent_tracing: true,
            },
            script: Mutex::new(VecDeque::new()),
            prompt_behaviors: Mutex::new(Vec::new()),
            default_behavior: MockBehavior::default(),
            available: AtomicBool::new(true),
            executed_prompts: Mutex::new(Vec::new()),
        }
    }

    pub fn with_default_behavior(mut self, behavior: MockBehavior) -> Self {
        self.default_behavior = behavior;
        self
    }

    /// Queue a behavior for the next execution; FIFO order.
    pub fn push_behavior(&self, behavior: MockBehavior) {
        self.script.lock().unwrap().push_back(behavior);
    }

    /// Use `behavior` for any execution whose prompt contains `needle`.
    pub fn behavior_for_prompt(&self, needle: impl Into<String>, behavior: MockBehavior) {
        self.prompt_behaviors
            .lock()
            .unwrap()
            .push((needle.into(), behavior));
    }

    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Prompts this plugin has executed, in order.
    pub fn executed_prompts(&self) -> Vec<String> {
        self.executed_prompts.lock().unwrap().clone()
    }

    pub fn execution_count(&self) -> usize {
        self.executed_prompts.lock().unwrap().len()
    }
}

impl Default for MockAgentPlugin {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl AgentPlugin for MockAgentPlugin {
    fn meta(&self) -> &AgentMeta {
        &self.meta
    }

    async fn initialize(&self, _options: AgentOptions) -> EngineResult<()> {
        Ok(())
    }

    fn is_ready(&self) -> bool {
        true
    }

    async fn detect(&self) -> DetectResult {
        if self.available.load(Ordering::SeqCst) {
            DetectResult {
                available: true,
                version: Some("1.0.0".to_string()),
                executable_path: None,
                error: None,
            }
        } else {
            DetectResult::unavailable(format!("{} not found in PATH", self.meta.name))
        }
    }

    fn validate_model(&self, _model: &str) -> Option<String> {
        None
    }

    fn sandbox_requirements(&self) -> SandboxRequirements {
        SandboxRequirements::default()
    }

    async fn execute(
        &self,
        prompt: &str,
        _files: &[PathBuf],
        options: ExecOptions,
    ) -> EngineResult<ExecutionHandle> {
        self.executed_prompts
            .lock()
            .unwrap()
            .push(prompt.to_string());

        let by_prompt = {
            let prompt_behaviors = self.prompt_behaviors.lock().unwrap();
            prompt_behaviors
                .iter()
                .find(|(needle, _)| prompt.contains(needle))
                .map(|(_, behavior)| behavior.clone())
        };
        let behavior = by_prompt.unwrap_or_else(|| {
            self.script
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| self.default_behavior.clone())
        });

        let execution_id = Uuid::new_v4();
        let interrupt = InterruptSignal::new();
        let (result_tx, result_rx) = oneshot::channel();
        let task_interrupt = std::sync::Arc::clone(&interrupt);

        tokio::spawn(async move {
            let started_at = Utc::now();
            let start = Instant::now();
            task_interrupt.set_running(true);

            for line in behavior.stdout.lines() {
                if let Some(ref tx) = options.on_output {
                    let _ = tx.send(OutputChunk {
                        stream: OutputStreamKind::Stdout,
                        text: format!("{line}\n"),
                    });
                }
            }
            for line in behavior.stderr.lines() {
                if let Some(ref tx) = options.on_output {
                    let _ = tx.send(OutputChunk {
                        stream: OutputStreamKind::Stderr,
                        text: format!("{line}\n"),
                    });
                }
            }
            if let Some(ref tx) = options.on_jsonl {
                for value in &behavior.jsonl {
                    let _ = tx.send(value.clone());
                }
            }

            let interrupted = tokio::select! {
                () = tokio::time::sleep(behavior.delay) => false,
                () = task_interrupt.requested() => true,
            };

            task_interrupt.set_running(false);

            let status = if interrupted {
                ExecutionStatus::Interrupted
            } else if behavior.exit_code == 0 {
                ExecutionStatus::Completed
            } else {
                ExecutionStatus::Failed
            };

            let result = AgentExecutionResult {
                execution_id,
                status,
                exit_code: if interrupted {
                    None
                } else {
                    Some(behavior.exit_code)
                },
                stdout: behavior.stdout,
                stderr: behavior.stderr,
                duration_ms: start.elapsed().as_millis() as u64,
                interrupted,
                started_at,
                ended_at: Utc::now(),
                error: if !interrupted && behavior.exit_code != 0 {
                    Some(format!("agent exited with code {}", behavior.exit_code))
                } else {
                    None
                },
            };

            let _ = result_tx.send(result);
        });

        Ok(ExecutionHandle::new(execution_id, result_rx, interrupt))
    }

    async fn preflight(&self, _timeout: Option<Duration>) -> PreflightResult {
        PreflightResult {
            success: self.available.load(Ordering::SeqCst),
            duration_ms: 1,
            error: None,
            suggestion: None,
            stdout: Some("PREFLIGHT_OK".to_string()),
            stderr: None,
            exit_code: Some(0),
        }
    }

    fn canonicalize_trace(&self, value: &serde_json::Value) -> Vec<SubagentMessage> {
        // The mock streams canonical messages directly.
        serde_json::from_value::<SubagentMessage>(value.clone())
            .ok()
            .into_iter()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_scripted_behaviors_in_order() {
        let plugin = MockAgentPlugin::new();
        plugin.push_behavior(MockBehavior::failure(1, "boom"));
        plugin.push_behavior(MockBehavior::completed_with_promise("done"));

        let first = plugin
            .execute("p1", &[], ExecOptions::default())
            .await
            .unwrap()
            .wait()
            .await
            .unwrap();
        assert_eq!(first.status, ExecutionStatus::Failed);

        let second = plugin
            .execute("p2", &[], ExecOptions::default())
            .await
            .unwrap()
            .wait()
            .await
            .unwrap();
        assert_eq!(second.status, ExecutionStatus::Completed);
        assert!(second.stdout.contains("<promise>COMPLETE</promise>"));

        assert_eq!(plugin.executed_prompts(), vec!["p1", "p2"]);
    }

    #[tokio::test]
    async fn test_interrupt_during_delay() {
        let plugin = MockAgentPlugin::new()
            .with_default_behavior(MockBehavior::default().with_delay(Duration::from_secs(30)));
        let handle = plugin
            .execute("p", &[], ExecOptions::default())
            .await
            .unwrap();
        handle.interrupt();
        let result = handle.wait().await.unwrap();
        assert_eq!(result.status, ExecutionStatus::Interrupted);
    }
}

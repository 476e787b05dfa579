//! Claude Code CLI agent plugin.
//!
//! Spawns the `claude` CLI in print mode with a stream-json output format,
//! which yields one JSON message per line. Task tool invocations in that
//! stream carry the subagent lifecycle the trace parser consumes.

use async_trait::async_trait;
use std::path::PathBuf;
use std::time::Duration;
use tokio::sync::RwLock;

use crate::adapters::runtime::{self, CommandSpec, EnvPolicy};
use crate::domain::errors::EngineResult;
use crate::domain::models::{
    AgentOptions, DetectResult, PreflightResult, SandboxConfig, SandboxRequirements,
    SubagentMessage,
};
use crate::domain::ports::{AgentMeta, AgentPlugin, ExecOptions, ExecutionHandle};

const META: AgentMeta = AgentMeta {
    id: "claude_code",
    name: "Claude Code",
    default_command: "claude",
    command_aliases: &["claude-code"],
    supports_subagent_tracing: true,
};

/// Models the CLI accepts, beyond full `claude-*` identifiers.
const MODEL_ALIASES: &[&str] = &["opus", "sonnet", "haiku"];

/// Claude Code CLI agent plugin.
pub struct ClaudeCodePlugin {
    state: RwLock<PluginState>,
    sandbox: SandboxConfig,
}

#[derive(Default)]
struct PluginState {
    options: AgentOptions,
    ready: bool,
}

impl ClaudeCodePlugin {
    pub fn new(options: AgentOptions, sandbox: SandboxConfig) -> Self {
        Self {
            state: RwLock::new(PluginState {
                options,
                ready: true,
            }),
            sandbox,
        }
    }

    fn build_args(options: &AgentOptions, prompt: &str, files: &[PathBuf]) -> Vec<String> {
        let mut args = vec![
            "--print".to_string(),
            "--verbose".to_string(),
            "--output-format".to_string(),
            "stream-json".to_string(),
        ];

        args.extend(options.default_flags.iter().cloned());

        if let Some(ref model) = options.model {
            args.push("--model".to_string());
            args.push(model.clone());
        }

        for file in files {
            args.push("--add-dir".to_string());
            args.push(file.display().to_string());
        }

        args.push("-p".to_string());
        args.push(prompt.to_string());

        args
    }
}

#[async_trait]
impl AgentPlugin for ClaudeCodePlugin {
    fn meta(&self) -> &AgentMeta {
        &META
    }

    async fn initialize(&self, options: AgentOptions) -> EngineResult<()> {
        let mut state = self.state.write().await;
        state.options = options;
        state.ready = true;
        Ok(())
    }

    fn is_ready(&self) -> bool {
        self.state.try_read().map(|s| s.ready).unwrap_or(false)
    }

    async fn detect(&self) -> DetectResult {
        let command = {
            let state = self.state.read().await;
            state.options.command.clone()
        };
        runtime::detect_agent(&META, command.as_deref()).await
    }

    fn validate_model(&self, model: &str) -> Option<String> {
        if MODEL_ALIASES.contains(&model) || model.starts_with("claude-") {
            None
        } else {
            Some(format!(
                "unknown model '{model}' (expected one of {} or a claude-* identifier)",
                MODEL_ALIASES.join(", ")
            ))
        }
    }

    fn sandbox_requirements(&self) -> SandboxRequirements {
        let home = std::env::var("HOME").map(PathBuf::from).unwrap_or_default();
        SandboxRequirements {
            auth_paths: vec![home.join(".claude"), home.join(".claude.json")],
            binary_paths: vec![],
            runtime_paths: vec![home.join(".cache")],
            requires_network: true,
        }
    }

    async fn execute(
        &self,
        prompt: &str,
        files: &[PathBuf],
        mut options: ExecOptions,
    ) -> EngineResult<ExecutionHandle> {
        let (program, args, env_policy, timeout) = {
            let state = self.state.read().await;
            (
                state
                    .options
                    .command
                    .clone()
                    .unwrap_or_else(|| META.default_command.to_string()),
                Self::build_args(&state.options, prompt, files),
                EnvPolicy {
                    exclude: state.options.env_exclude.clone(),
                    passthrough: state.options.env_passthrough.clone(),
                },
                state.options.timeout_ms,
            )
        };

        if options.timeout.is_none() && timeout > 0 {
            options.timeout = Some(Duration::from_millis(timeout));
        }

        let spec = CommandSpec {
            program,
            args,
            stdin_payload: None,
            emits_jsonl: true,
            env_policy,
            sandbox_wrapper: if self.sandbox.enabled {
                self.sandbox.wrapper.clone()
            } else {
                Vec::new()
            },
        };

        runtime::execute(spec, options)
    }

    async fn preflight(&self, timeout: Option<Duration>) -> PreflightResult {
        runtime::run_preflight(self, timeout).await
    }

    fn canonicalize_trace(&self, value: &serde_json::Value) -> Vec<SubagentMessage> {
        canonicalize_stream_json(value)
    }
}

/// Adapt one stream-json message into canonical subagent messages.
///
/// Spawns come from assistant `tool_use` blocks named `Task`; ends come from
/// user `tool_result` blocks carrying the matching `tool_use_id`.
fn canonicalize_stream_json(value: &serde_json::Value) -> Vec<SubagentMessage> {
    let mut messages = Vec::new();
    let Some(kind) = value.get("type").and_then(|t| t.as_str()) else {
        return messages;
    };

    let content = value
        .get("message")
        .and_then(|m| m.get("content"))
        .and_then(|c| c.as_array());
    let Some(content) = content else {
        return messages;
    };

    match kind {
        "assistant" => {
            for block in content {
                if block.get("type").and_then(|t| t.as_str()) != Some("tool_use") {
                    continue;
                }
                if block.get("name").and_then(|n| n.as_str()) != Some("Task") {
                    continue;
                }
                let Some(id) = block.get("id").and_then(|i| i.as_str()) else {
                    continue;
                };
                let input = block.get("input");
                messages.push(SubagentMessage::TaskSpawn {
                    tool_id: id.to_string(),
                    kind: input
                        .and_then(|i| i.get("subagent_type"))
                        .and_then(|t| t.as_str())
                        .unwrap_or("task")
                        .to_string(),
                    description: input
                        .and_then(|i| i.get("description"))
                        .and_then(|d| d.as_str())
                        .unwrap_or_default()
                        .to_string(),
                    prompt: input
                        .and_then(|i| i.get("prompt"))
                        .and_then(|p| p.as_str())
                        .map(ToString::to_string),
                });
            }
        }
        "user" => {
            for block in content {
                if block.get("type").and_then(|t| t.as_str()) != Some("tool_result") {
                    continue;
                }
                let Some(id) = block.get("tool_use_id").and_then(|i| i.as_str()) else {
                    continue;
                };
                messages.push(SubagentMessage::TaskEnd {
                    tool_id: id.to_string(),
                    is_error: block
                        .get("is_error")
                        .and_then(serde_json::Value::as_bool)
                        .unwrap_or(false),
                    result: extract_result_text(block.get("content")),
                });
            }
        }
        _ => {}
    }

    messages
}

fn extract_result_text(content: Option<&serde_json::Value>) -> Option<String> {
    match content? {
        serde_json::Value::String(s) => Some(s.clone()),
        serde_json::Value::Array(blocks) => {
            let text: Vec<&str> = blocks
                .iter()
                .filter(|b| b.get("type").and_then(|t| t.as_str()) == Some("text"))
                .filter_map(|b| b.get("text").and_then(|t| t.as_str()))
                .collect();
            if text.is_empty() {
                None
            } else {
                Some(text.join("\n"))
            }
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_build_args() {
        let options = AgentOptions {
            model: Some("sonnet".to_string()),
            default_flags: vec!["--max-turns".to_string(), "25".to_string()],
            ..Default::default()
        };
        let args = ClaudeCodePlugin::build_args(&options, "do the thing", &[]);

        assert!(args.contains(&"--print".to_string()));
        assert!(args.contains(&"stream-json".to_string()));
        assert!(args.contains(&"--max-turns".to_string()));
        assert!(args.contains(&"sonnet".to_string()));
        assert_eq!(args.last().unwrap(), "do the thing");
    }

    #[test]
    fn test_validate_model() {
        let plugin = ClaudeCodePlugin::new(AgentOptions::default(), SandboxConfig::default());
        assert!(plugin.validate_model("sonnet").is_none());
        assert!(plugin.validate_model("claude-sonnet-4-20250514").is_none());
        assert!(plugin.validate_model("gpt-4").is_some());
    }

    #[test]
    fn test_canonicalize_task_spawn() {
        let value = json!({
            "type": "assistant",
            "message": {
                "content": [
                    {"type": "text", "text": "Spawning a helper."},
                    {
                        "type": "tool_use",
                        "id": "toolu_01",
                        "name": "Task",
                        "input": {
                            "subagent_type": "explorer",
                            "description": "Find the config",
                            "prompt": "Locate config loading code"
                        }
                    }
                ]
            }
        });
        let messages = canonicalize_stream_json(&value);
        assert_eq!(messages.len(), 1);
        assert_eq!(
            messages[0],
            SubagentMessage::TaskSpawn {
                tool_id: "toolu_01".to_string(),
                kind: "explorer".to_string(),
                description: "Find the config".to_string(),
                prompt: Some("Locate config loading code".to_string()),
            }
        );
    }

    #[test]
    fn test_canonicalize_ignores_other_tools() {
        let value = json!({
            "type": "assistant",
            "message": {
                "content": [
                    {"type": "tool_use", "id": "toolu_02", "name": "Bash", "input": {}}
                ]
            }
        });
        assert!(canonicalize_stream_json(&value).is_empty());
    }

    #[test]
    fn test_canonicalize_task_end() {
        let value = json!({
            "type": "user",
            "message": {
                "content": [
                    {
                        "type": "tool_result",
                        "tool_use_id": "toolu_01",
                        "is_error": false,
                        "content": [{"type": "text", "text": "found it"}]
                    }
                ]
            }
        });
        let messages = canonicalize_stream_json(&value);
        assert_eq!(
            messages[0],
            SubagentMessage::TaskEnd {
                tool_id: "toolu_01".to_string(),
                is_error: false,
                result: Some("found it".to_string()),
            }
        );
    }
}

//! OpenCode CLI agent plugin.
//!
//! A plain-text fallback agent: prompts go in as a `run` argument, output
//! comes back as unstructured text. No subagent tracing.

use async_trait::async_trait;
use std::path::PathBuf;
use std::time::Duration;
use tokio::sync::RwLock;

use crate::adapters::runtime::{self, CommandSpec, EnvPolicy};
use crate::domain::errors::EngineResult;
use crate::domain::models::{
    AgentOptions, DetectResult, PreflightResult, SandboxConfig, SandboxRequirements,
};
use crate::domain::ports::{AgentMeta, AgentPlugin, ExecOptions, ExecutionHandle};

const META: AgentMeta = AgentMeta {
    id: "opencode",
    name: "OpenCode",
    default_command: "opencode",
    command_aliases: &[],
    supports_subagent_tracing: false,
};

/// OpenCode CLI agent plugin.
pub struct OpencodePlugin {
    state: RwLock<PluginState>,
    sandbox: SandboxConfig,
}

#[derive(Default)]
struct PluginState {
    options: AgentOptions,
    ready: bool,
}

impl OpencodePlugin {
    pub fn new(options: AgentOptions, sandbox: SandboxConfig) -> Self {
        Self {
            state: RwLock::new(PluginState {
                options,
                ready: true,
            }),
            sandbox,
        }
    }

    fn build_args(options: &AgentOptions, prompt: &str) -> Vec<String> {
        let mut args = vec!["run".to_string()];
        args.extend(options.default_flags.iter().cloned());
        if let Some(ref model) = options.model {
            args.push("--model".to_string());
            args.push(model.clone());
        }
        args.push(prompt.to_string());
        args
    }
}

#[async_trait]
impl AgentPlugin for OpencodePlugin {
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

    fn validate_model(&self, _model: &str) -> Option<String> {
        // opencode routes models through provider config; accept anything
        None
    }

    fn sandbox_requirements(&self) -> SandboxRequirements {
        let home = std::env::var("HOME").map(PathBuf::from).unwrap_or_default();
        SandboxRequirements {
            auth_paths: vec![home.join(".config/opencode")],
            binary_paths: vec![],
            runtime_paths: vec![home.join(".cache")],
            requires_network: true,
        }
    }

    async fn execute(
        &self,
        prompt: &str,
        _files: &[PathBuf],
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
                Self::build_args(&state.options, prompt),
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
            emits_jsonl: false,
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
}

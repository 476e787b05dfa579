//! Engine configuration model.
//!
//! Loaded by `infrastructure::config` from a YAML file merged with
//! environment overrides; every field carries a serde default so a partial
//! file is valid.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;

/// What to do when an iteration fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorStrategy {
    /// Retry the same task up to `max_retries`, then skip it
    Retry,
    /// Skip the task immediately
    Skip,
    /// Stop the engine
    Abort,
}

impl Default for ErrorStrategy {
    fn default() -> Self {
        Self::Retry
    }
}

/// Generic failure retry policy (distinct from rate-limit retries).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub strategy: ErrorStrategy,
    pub max_retries: u32,
    pub retry_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            strategy: ErrorStrategy::default(),
            max_retries: 2,
            retry_delay_ms: 2_000,
        }
    }
}

/// Rate-limit backoff and recovery policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    /// Rate-limit retries per task per agent before falling back
    pub max_retries: u32,
    /// Base for the 3^attempt backoff (defaults yield 5 s, 15 s, 45 s)
    pub base_backoff_ms: u64,
    /// Probe the preserved primary between iterations while on a fallback
    pub recover_primary_between_iterations: bool,
    /// Timeout for the recovery probe
    pub probe_timeout_ms: u64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_backoff_ms: 5_000,
            recover_primary_between_iterations: true,
            probe_timeout_ms: 5_000,
        }
    }
}

/// Sandbox wrapping for agent subprocesses.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SandboxConfig {
    pub enabled: bool,
    /// Whether the sandbox allows outbound network
    pub network: bool,
    /// Mode label surfaced in logs ("auto", "strict", ...)
    pub mode: String,
    /// Wrapper argv prefixed to the agent command when enabled
    pub wrapper: Vec<String>,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            network: true,
            mode: "auto".to_string(),
            wrapper: Vec::new(),
        }
    }
}

/// Per-plugin agent options.
///
/// Unknown keys are rejected so typos in config files surface early.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct AgentOptions {
    /// Override for the plugin's default command
    pub command: Option<String>,
    /// Flags prepended to every invocation
    pub default_flags: Vec<String>,
    /// Per-execution timeout; 0 = none
    pub timeout_ms: u64,
    pub model: Option<String>,
    /// Extra env key patterns to remove (on top of the built-in defaults)
    pub env_exclude: Vec<String>,
    /// Env key patterns restored after exclusion
    pub env_passthrough: Vec<String>,
    /// Explicit env overlaid last
    pub env: HashMap<String, String>,
}

/// Worktree pool admission limits.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorktreePoolConfig {
    pub max_worktrees: usize,
    pub base_dir: PathBuf,
    /// Deny acquire when free memory falls below this
    pub min_free_memory_bytes: u64,
    /// Deny acquire when CPU utilization exceeds this percentage
    pub max_cpu_percent: f32,
    /// Ref new branches are created from; repo HEAD when absent
    pub base_branch: Option<String>,
}

impl Default for WorktreePoolConfig {
    fn default() -> Self {
        Self {
            max_worktrees: 4,
            base_dir: PathBuf::from(".worktrees"),
            min_free_memory_bytes: 512 * 1024 * 1024,
            max_cpu_percent: 90.0,
            base_branch: None,
        }
    }
}

/// Parallel executor limits.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ParallelConfig {
    pub max_concurrency: usize,
    pub continue_on_error: bool,
    /// Keep the worktree of a failed task for inspection
    pub preserve_failed_worktrees: bool,
    /// Per-stream in-memory tail bound for parallel agents
    pub max_output_size_bytes: usize,
}

impl Default for ParallelConfig {
    fn default() -> Self {
        Self {
            max_concurrency: 2,
            continue_on_error: true,
            preserve_failed_worktrees: false,
            max_output_size_bytes: 2_000_000,
        }
    }
}

/// Merge engine behavior.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MergeConfig {
    pub target_branch: String,
    pub create_backup: bool,
    pub backup_branch_prefix: String,
    /// Skip remaining branches after the first conflict
    pub abort_on_conflict: bool,
    pub delete_source_branches: bool,
    /// Attempt AI conflict resolution when a resolver is wired
    pub ai_resolution: bool,
    /// Minimum resolver confidence to commit an AI-resolved merge
    pub ai_confidence_threshold: f64,
}

impl Default for MergeConfig {
    fn default() -> Self {
        Self {
            target_branch: "main".to_string(),
            create_backup: true,
            backup_branch_prefix: "epicycle-backup-".to_string(),
            abort_on_conflict: false,
            delete_source_branches: false,
            ai_resolution: false,
            ai_confidence_threshold: 0.85,
        }
    }
}

/// Top-level engine configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Primary agent plugin id
    pub agent: String,
    /// Fallback chain, tried in declared order
    pub fallback_agents: Vec<String>,
    pub model: Option<String>,
    /// 0 = unbounded
    pub max_iterations: u32,
    pub iteration_delay_ms: u64,
    pub retry: RetryConfig,
    pub rate_limit: RateLimitConfig,
    pub sandbox: SandboxConfig,
    pub auto_commit: bool,
    /// In-memory tail cap for captured agent output, in chars
    pub output_cap_chars: usize,
    /// Directory iteration logs are written under, relative to the workspace
    pub logs_dir: PathBuf,
    /// Prompt template override; tracker template wins when present
    pub template: Option<String>,
    /// Epic identifier surfaced in prompts and log headers
    pub epic: Option<String>,
    pub agents: HashMap<String, AgentOptions>,
    pub worktrees: WorktreePoolConfig,
    pub parallel: ParallelConfig,
    pub merge: MergeConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            agent: "claude_code".to_string(),
            fallback_agents: Vec::new(),
            model: None,
            max_iterations: 0,
            iteration_delay_ms: 1_000,
            retry: RetryConfig::default(),
            rate_limit: RateLimitConfig::default(),
            sandbox: SandboxConfig::default(),
            auto_commit: false,
            output_cap_chars: 2_000_000,
            logs_dir: PathBuf::from(".epicycle/logs"),
            template: None,
            epic: None,
            agents: HashMap::new(),
            worktrees: WorktreePoolConfig::default(),
            parallel: ParallelConfig::default(),
            merge: MergeConfig::default(),
        }
    }
}

impl EngineConfig {
    /// Options for a plugin id, falling back to empty defaults.
    pub fn agent_options(&self, plugin_id: &str) -> AgentOptions {
        self.agents.get(plugin_id).cloned().unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = EngineConfig::default();
        assert_eq!(config.agent, "claude_code");
        assert_eq!(config.retry.max_retries, 2);
        assert_eq!(config.rate_limit.base_backoff_ms, 5_000);
        assert_eq!(config.merge.ai_confidence_threshold, 0.85);
        assert_eq!(config.parallel.max_concurrency, 2);
    }

    #[test]
    fn test_partial_yaml_deserializes() {
        let config: EngineConfig =
            serde_yaml::from_str("agent: opencode\nmax_iterations: 5\n").unwrap();
        assert_eq!(config.agent, "opencode");
        assert_eq!(config.max_iterations, 5);
        assert_eq!(config.iteration_delay_ms, 1_000);
    }

    #[test]
    fn test_agent_options_rejects_unknown_keys() {
        let result: Result<AgentOptions, _> =
            serde_yaml::from_str("command: claude\nbogus_key: 1\n");
        assert!(result.is_err());
    }
}

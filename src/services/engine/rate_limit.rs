//! Rate-limit handling: backoff with server hints, fallback-chain
//! traversal, and between-iteration primary recovery.

use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{info, warn};

use super::{EngineEvent, ExecutionEngine};
use crate::domain::models::{ActiveAgent, AgentBindingReason, AgentOptions, Task};
use crate::domain::ports::ExecOptions;
use crate::services::rate_limit_detector::RateLimitVerdict;

/// Minimal prompt used to probe whether the primary has recovered.
const RECOVERY_PROBE_PROMPT: &str = "Respond with exactly: OK";

/// What the rate-limit handler decided.
pub(crate) enum RateLimitDisposition {
    /// Backoff elapsed; re-run the iteration on the same agent
    Retry,
    /// A fallback agent was bound; re-run the iteration on it
    Switched,
    /// The whole chain is limited; the engine was paused
    AllLimited,
}

/// Compute the wait before a rate-limit retry.
///
/// A positive server hint wins; otherwise exponential backoff on a base of
/// `base_backoff_ms` tripling per attempt (5 s, 15 s, 45 s with defaults).
pub(crate) fn backoff_delay_ms(
    base_backoff_ms: u64,
    attempt: u32,
    retry_after_seconds: Option<u64>,
) -> (u64, bool) {
    match retry_after_seconds {
        Some(seconds) if seconds > 0 => (seconds * 1000, true),
        _ => (
            base_backoff_ms.saturating_mul(3u64.saturating_pow(attempt)),
            false,
        ),
    }
}

/// Fill unset fallback options from the agent being replaced, so a bare
/// fallback entry inherits flags and timeout but never the command.
pub(crate) fn inherit_options(mut options: AgentOptions, inherited: &AgentOptions) -> AgentOptions {
    if options.default_flags.is_empty() {
        options.default_flags = inherited.default_flags.clone();
    }
    if options.timeout_ms == 0 {
        options.timeout_ms = inherited.timeout_ms;
    }
    if options.env_exclude.is_empty() {
        options.env_exclude = inherited.env_exclude.clone();
    }
    if options.env_passthrough.is_empty() {
        options.env_passthrough = inherited.env_passthrough.clone();
    }
    options
}

impl ExecutionEngine {
    fn active_agent_id(&self) -> String {
        self.state
            .lock()
            .unwrap()
            .active_agent
            .as_ref()
            .map(|agent| agent.plugin_id.clone())
            .unwrap_or_else(|| self.config.agent.clone())
    }

    /// Handle a rate-limited execution: back off and retry the current
    /// agent, or traverse the fallback chain once retries are exhausted.
    pub(crate) async fn handle_rate_limit(
        &self,
        task: &Task,
        verdict: &RateLimitVerdict,
    ) -> RateLimitDisposition {
        let max = self.config.rate_limit.max_retries;
        let attempt = {
            let state = self.state.lock().unwrap();
            state
                .rate_limit_retry_counts
                .get(&task.id)
                .copied()
                .unwrap_or(0)
        };

        if attempt < max {
            let (delay_ms, used_retry_after) = backoff_delay_ms(
                self.config.rate_limit.base_backoff_ms,
                attempt,
                verdict.retry_after_seconds,
            );
            self.state
                .lock()
                .unwrap()
                .rate_limit_retry_counts
                .insert(task.id.clone(), attempt + 1);
            self.emit(EngineEvent::IterationRateLimited {
                attempt: attempt + 1,
                max,
                delay_ms,
                used_retry_after,
            });
            info!(
                task_id = %task.id,
                attempt = attempt + 1,
                delay_ms,
                used_retry_after,
                "Rate limited, backing off"
            );
            tokio::time::sleep(Duration::from_millis(delay_ms)).await;
            return RateLimitDisposition::Retry;
        }

        // Retries exhausted for the bound agent.
        let exhausted = self.active_agent_id();
        self.state
            .lock()
            .unwrap()
            .rate_limited_agents
            .insert(exhausted.clone());

        if self.bind_fallback(task).await {
            return RateLimitDisposition::Switched;
        }

        let tried = {
            let state = self.state.lock().unwrap();
            let mut tried = vec![exhausted];
            for id in &self.config.fallback_agents {
                if state.rate_limited_agents.contains(id) && !tried.contains(id) {
                    tried.push(id.clone());
                }
            }
            tried
        };
        warn!(tried = ?tried, "Every agent in the fallback chain is rate-limited");
        self.emit(EngineEvent::AgentAllLimited { tried });
        self.pause();
        RateLimitDisposition::AllLimited
    }

    /// Traverse the fallback chain in declared order, skipping agents
    /// already found limited. Returns whether a fallback was bound.
    async fn bind_fallback(&self, task: &Task) -> bool {
        let current_id = self.active_agent_id();
        let current_options = {
            let mut options = self.config.agent_options(&current_id);
            if options.model.is_none() {
                options.model = self.config.model.clone();
            }
            options
        };

        for id in &self.config.fallback_agents {
            if self
                .state
                .lock()
                .unwrap()
                .rate_limited_agents
                .contains(id)
            {
                continue;
            }

            let options = inherit_options(self.config.agent_options(id), &current_options);
            let Some(plugin) = self.registry.create(id, options.clone()) else {
                warn!(agent = %id, "Unknown fallback agent plugin");
                self.state
                    .lock()
                    .unwrap()
                    .rate_limited_agents
                    .insert(id.clone());
                continue;
            };
            if let Err(e) = plugin.initialize(options).await {
                warn!(agent = %id, error = %e, "Fallback agent failed to initialize");
                self.state
                    .lock()
                    .unwrap()
                    .rate_limited_agents
                    .insert(id.clone());
                continue;
            }
            let detection = plugin.detect().await;
            if !detection.available {
                warn!(agent = %id, error = ?detection.error, "Fallback agent unavailable");
                self.state
                    .lock()
                    .unwrap()
                    .rate_limited_agents
                    .insert(id.clone());
                continue;
            }

            // Bind it.
            {
                let mut agents = self.agents.lock().unwrap();
                if let Some(slots) = agents.as_mut() {
                    slots.active = Arc::clone(&plugin);
                }
            }
            {
                let mut state = self.state.lock().unwrap();
                state.active_agent = Some(ActiveAgent::fallback(id.clone()));
                if let Some(rl) = state.rate_limit_state.as_mut() {
                    rl.fallback_agent = Some(id.clone());
                    if rl.limited_at.is_none() {
                        rl.limited_at = Some(chrono::Utc::now());
                    }
                }
                state.rate_limit_retry_counts.remove(&task.id);
            }
            info!(from = %current_id, to = %id, "Switched to fallback agent");
            self.record_switch(&current_id, id, AgentBindingReason::Fallback);
            return true;
        }
        false
    }

    /// Probe the preserved primary with a short-timeout prompt; swap back
    /// on a clean, non-rate-limited completion.
    pub(crate) async fn attempt_primary_recovery(&self) {
        let Some(primary) = self.primary_plugin() else {
            return;
        };
        let primary_id = {
            let state = self.state.lock().unwrap();
            state
                .rate_limit_state
                .as_ref()
                .map(|rl| rl.primary_agent.clone())
                .unwrap_or_else(|| self.config.agent.clone())
        };
        let fallback_id = self.active_agent_id();
        let start = Instant::now();

        let options = ExecOptions {
            timeout: Some(Duration::from_millis(self.config.rate_limit.probe_timeout_ms)),
            ..Default::default()
        };

        let probe = match primary.execute(RECOVERY_PROBE_PROMPT, &[], options).await {
            Ok(handle) => handle.wait().await,
            Err(e) => Err(e),
        };

        let (success, test_duration_ms) = match probe {
            Ok(result) => {
                let verdict = self.detector.detect(&result, primary.meta().id);
                (
                    result.is_success() && !verdict.is_rate_limit,
                    result.duration_ms,
                )
            }
            Err(_) => (false, start.elapsed().as_millis() as u64),
        };

        if success {
            {
                let mut agents = self.agents.lock().unwrap();
                if let Some(slots) = agents.as_mut() {
                    slots.active = Arc::clone(&primary);
                }
            }
            {
                let mut state = self.state.lock().unwrap();
                state.active_agent = Some(ActiveAgent::primary(primary_id.clone()));
                if let Some(rl) = state.rate_limit_state.as_mut() {
                    rl.limited_at = None;
                    rl.fallback_agent = None;
                }
                state.rate_limited_agents.clear();
            }
            info!(primary = %primary_id, "Primary agent recovered");
            self.emit(EngineEvent::AgentRecoveryAttempted {
                success: true,
                test_duration_ms,
                primary: primary_id.clone(),
                fallback: fallback_id.clone(),
            });
            self.record_switch(&fallback_id, &primary_id, AgentBindingReason::Primary);
        } else {
            self.emit(EngineEvent::AgentRecoveryAttempted {
                success: false,
                test_duration_ms,
                primary: primary_id,
                fallback: fallback_id,
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_progression() {
        assert_eq!(backoff_delay_ms(5_000, 0, None), (5_000, false));
        assert_eq!(backoff_delay_ms(5_000, 1, None), (15_000, false));
        assert_eq!(backoff_delay_ms(5_000, 2, None), (45_000, false));
    }

    #[test]
    fn test_retry_after_hint_wins() {
        assert_eq!(backoff_delay_ms(5_000, 2, Some(2)), (2_000, true));
        // Zero or absent hints fall back to exponential backoff
        assert_eq!(backoff_delay_ms(5_000, 0, Some(0)), (5_000, false));
    }

    #[test]
    fn test_inherit_options() {
        let current = AgentOptions {
            default_flags: vec!["--max-turns".to_string(), "25".to_string()],
            timeout_ms: 60_000,
            env_exclude: vec!["FOO_*".to_string()],
            ..Default::default()
        };

        let inherited = inherit_options(AgentOptions::default(), &current);
        assert_eq!(inherited.default_flags, current.default_flags);
        assert_eq!(inherited.timeout_ms, 60_000);
        assert_eq!(inherited.env_exclude, current.env_exclude);
        // Command is never inherited
        assert!(inherited.command.is_none());

        let own = AgentOptions {
            default_flags: vec!["--fast".to_string()],
            timeout_ms: 1_000,
            ..Default::default()
        };
        let kept = inherit_options(own.clone(), &current);
        assert_eq!(kept.default_flags, own.default_flags);
        assert_eq!(kept.timeout_ms, 1_000);
    }
}

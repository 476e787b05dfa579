//! Agent plugin registry and factory.

pub mod claude_code;
pub mod mock;
pub mod opencode;

pub use claude_code::ClaudeCodePlugin;
pub use mock::{MockAgentPlugin, MockBehavior};
pub use opencode::OpencodePlugin;

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use crate::domain::models::{AgentOptions, EngineConfig, SandboxConfig};
use crate::domain::ports::{AgentFactory, AgentPlugin};

/// Registry of available agent plugins.
///
/// Builds concrete plugin instances from configured per-plugin options.
/// Test code can register pre-built instances under any id; registered
/// instances win over construction.
pub struct AgentRegistry {
    options: HashMap<String, AgentOptions>,
    sandbox: SandboxConfig,
    instances: RwLock<HashMap<String, Arc<dyn AgentPlugin>>>,
}

impl AgentRegistry {
    pub fn new(config: &EngineConfig) -> Self {
        Self {
            options: config.agents.clone(),
            sandbox: config.sandbox.clone(),
            instances: RwLock::new(HashMap::new()),
        }
    }

    /// Register a pre-built plugin instance under an id.
    pub fn register(&self, id: impl Into<String>, plugin: Arc<dyn AgentPlugin>) {
        self.instances.write().unwrap().insert(id.into(), plugin);
    }

    /// Create (or fetch a registered) plugin by id with its configured options.
    pub fn create(&self, plugin_id: &str) -> Option<Arc<dyn AgentPlugin>> {
        let options = self.options.get(plugin_id).cloned().unwrap_or_default();
        self.create_with_options(plugin_id, options)
    }

    /// Create a plugin by id with explicit options (e.g. options inherited
    /// from the agent being replaced during fallback).
    pub fn create_with_options(
        &self,
        plugin_id: &str,
        options: AgentOptions,
    ) -> Option<Arc<dyn AgentPlugin>> {
        if let Some(instance) = self.instances.read().unwrap().get(plugin_id) {
            return Some(Arc::clone(instance));
        }

        match plugin_id {
            "claude_code" => Some(Arc::new(ClaudeCodePlugin::new(
                options,
                self.sandbox.clone(),
            ))),
            "opencode" => Some(Arc::new(OpencodePlugin::new(options, self.sandbox.clone()))),
            "mock" => Some(Arc::new(MockAgentPlugin::new())),
            _ => None,
        }
    }

    /// Options configured for a plugin id.
    pub fn options_for(&self, plugin_id: &str) -> AgentOptions {
        self.options.get(plugin_id).cloned().unwrap_or_default()
    }
}

impl AgentFactory for AgentRegistry {
    fn create(&self, plugin_id: &str, options: AgentOptions) -> Option<Arc<dyn AgentPlugin>> {
        self.create_with_options(plugin_id, options)
    }

    fn available_ids(&self) -> Vec<&'static str> {
        vec!["claude_code", "opencode", "mock"]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_known_plugins() {
        let registry = AgentRegistry::new(&EngineConfig::default());
        assert!(registry.create("claude_code").is_some());
        assert!(registry.create("opencode").is_some());
        assert!(registry.create("mock").is_some());
        assert!(registry.create("nonexistent").is_none());
    }

    #[test]
    fn test_registered_instance_wins() {
        let registry = AgentRegistry::new(&EngineConfig::default());
        let mock = Arc::new(MockAgentPlugin::with_id("claude_code"));
        registry.register("claude_code", mock);

        let plugin = registry.create("claude_code").unwrap();
        assert_eq!(plugin.meta().id, "claude_code");
        // Registered mocks report availability without a real CLI.
        assert!(plugin.is_ready());
    }
}

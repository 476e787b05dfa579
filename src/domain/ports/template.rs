//! Template renderer port.

use crate::domain::errors::EngineResult;
use crate::domain::models::{EngineConfig, Task};

/// Where the rendered prompt's template came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PromptSource {
    /// Template supplied by the tracker
    Tracker,
    /// Template from the engine configuration
    Config,
    /// Built-in default template
    Builtin,
}

/// A successfully rendered prompt.
#[derive(Debug, Clone)]
pub struct RenderedPrompt {
    pub prompt: String,
    pub source: PromptSource,
}

/// Optional extra context woven into prompts.
#[derive(Debug, Clone, Default)]
pub struct ExtendedContext {
    pub recent_progress: Option<String>,
    pub codebase_patterns: Option<String>,
    pub prd: Option<serde_json::Value>,
}

/// Pure prompt rendering over a task and its context.
pub trait TemplateRenderer: Send + Sync {
    fn render(
        &self,
        task: &Task,
        config: &EngineConfig,
        epic: Option<&str>,
        extended: Option<&ExtendedContext>,
        tracker_template: Option<&str>,
    ) -> EngineResult<RenderedPrompt>;
}

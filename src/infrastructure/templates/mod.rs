//! Built-in prompt template rendering.
//!
//! Rendering is a pure substitution of `{{placeholder}}` variables over a
//! template chosen by precedence: tracker-supplied template, then the
//! configured template, then the built-in default.

use crate::domain::errors::{EngineError, EngineResult};
use crate::domain::models::{EngineConfig, Task};
use crate::domain::ports::{ExtendedContext, PromptSource, RenderedPrompt, TemplateRenderer};

/// Default prompt when neither the tracker nor the config provide one.
const BUILTIN_TEMPLATE: &str = "\
You are an autonomous coding agent working on one task of an epic.

Task {{task_id}}: {{task_title}}

{{task_description}}

Work on this task until it is fully done. Commit nothing yourself; the \
engine handles commits. When, and only when, the task is fully complete, \
output the marker below on its own line:

<promise>COMPLETE</promise>
";

/// Placeholder-substituting renderer.
pub struct DefaultTemplateRenderer;

impl DefaultTemplateRenderer {
    fn substitute(template: &str, task: &Task, epic: Option<&str>, extended: Option<&ExtendedContext>) -> String {
        let labels = task.labels.join(", ");
        let prd = extended
            .and_then(|ext| ext.prd.as_ref())
            .map(ToString::to_string)
            .unwrap_or_default();

        template
            .replace("{{task_id}}", &task.id)
            .replace("{{task_title}}", &task.title)
            .replace(
                "{{task_description}}",
                task.description.as_deref().unwrap_or(""),
            )
            .replace("{{epic}}", epic.unwrap_or(""))
            .replace("{{priority}}", &task.priority.to_string())
            .replace("{{labels}}", &labels)
            .replace(
                "{{recent_progress}}",
                extended
                    .and_then(|ext| ext.recent_progress.as_deref())
                    .unwrap_or(""),
            )
            .replace(
                "{{codebase_patterns}}",
                extended
                    .and_then(|ext| ext.codebase_patterns.as_deref())
                    .unwrap_or(""),
            )
            .replace("{{prd}}", &prd)
    }
}

impl TemplateRenderer for DefaultTemplateRenderer {
    fn render(
        &self,
        task: &Task,
        config: &EngineConfig,
        epic: Option<&str>,
        extended: Option<&ExtendedContext>,
        tracker_template: Option<&str>,
    ) -> EngineResult<RenderedPrompt> {
        let (template, source) = if let Some(template) = tracker_template {
            (template.to_string(), PromptSource::Tracker)
        } else if let Some(ref template) = config.template {
            (template.clone(), PromptSource::Config)
        } else {
            (BUILTIN_TEMPLATE.to_string(), PromptSource::Builtin)
        };

        let prompt = Self::substitute(&template, task, epic, extended);
        if prompt.trim().is_empty() {
            return Err(EngineError::Template(format!(
                "template rendered empty prompt for task {}",
                task.id
            )));
        }

        Ok(RenderedPrompt { prompt, source })
    }
}

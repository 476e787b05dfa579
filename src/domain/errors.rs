//! Domain errors for the Epicycle execution engine.

use thiserror::Error;

/// Domain-level errors that can occur while the engine runs.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("Plugin unavailable: {0}")]
    PluginUnavailable(String),

    #[error("Invalid model '{model}' for agent '{plugin}': {reason}")]
    ModelInvalid {
        plugin: String,
        model: String,
        reason: String,
    },

    #[error("Agent execution failed: {0}")]
    AgentExecution(String),

    #[error("Tracker error: {0}")]
    Tracker(String),

    #[error("Task not found: {0}")]
    TaskNotFound(String),

    #[error("Template rendering failed: {0}")]
    Template(String),

    #[error("Sandbox resolution failed: {0}")]
    Sandbox(String),

    #[error("Git operation failed: {0}")]
    Git(String),

    #[error("Log persistence failed: {0}")]
    LogPersistence(String),

    #[error("Invalid state transition from {from} to {to}")]
    InvalidStateTransition { from: String, to: String },

    #[error("Validation failed: {0}")]
    ValidationFailed(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type EngineResult<T> = Result<T, EngineError>;

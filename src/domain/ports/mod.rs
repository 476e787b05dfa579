//! Domain ports (interfaces) for the Epicycle engine.

pub mod agent;
pub mod auto_commit;
pub mod conflict;
pub mod template;
pub mod tracker;
pub mod worktree;

pub use agent::{
    AgentFactory, AgentMeta, AgentPlugin, ExecOptions, ExecutionHandle, InterruptSignal,
    OutputChunk, OutputStreamKind,
};
pub use auto_commit::{AutoCommit, AutoCommitOutcome};
pub use conflict::{ConflictResolver, ResolutionOutcome};
pub use template::{ExtendedContext, PromptSource, RenderedPrompt, TemplateRenderer};
pub use tracker::Tracker;
pub use worktree::WorktreeProvider;

//! Adapters: agent plugins, tracker plugins, the shared process runtime,
//! and git-facing helpers.

pub mod agents;
pub mod auto_commit;
pub mod runtime;
pub mod trackers;

pub use agents::AgentRegistry;
pub use auto_commit::GitAutoCommit;

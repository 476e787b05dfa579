//! Domain layer for the Epicycle execution engine.
//!
//! Core models and ports. These are framework-agnostic and contain no
//! process or filesystem concerns.

pub mod errors;
pub mod models;
pub mod ports;

// Re-export error types for convenient access
pub use errors::{EngineError, EngineResult};

//! Infrastructure: configuration loading, logging setup, and the built-in
//! template renderer.

pub mod config;
pub mod logging;
pub mod templates;

pub use config::ConfigLoader;
pub use templates::DefaultTemplateRenderer;

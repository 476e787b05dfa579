//! Configuration loading.
//!
//! Merges, in order: built-in defaults, an optional YAML file
//! (`epicycle.yaml` by default), and `EPICYCLE_`-prefixed environment
//! variables (`__` separates nesting, e.g. `EPICYCLE_RETRY__MAX_RETRIES`).

use figment::providers::{Env, Format, Serialized, Yaml};
use figment::Figment;
use std::path::Path;

use crate::domain::errors::{EngineError, EngineResult};
use crate::domain::models::EngineConfig;

/// Default config file name, resolved against the working directory.
pub const DEFAULT_CONFIG_FILE: &str = "epicycle.yaml";

pub struct ConfigLoader;

impl ConfigLoader {
    /// Load from the default file location plus env overrides.
    pub fn load() -> EngineResult<EngineConfig> {
        Self::load_from(None)
    }

    /// Load from an explicit file path plus env overrides.
    pub fn load_from(path: Option<&Path>) -> EngineResult<EngineConfig> {
        let file = path
            .map(Path::to_path_buf)
            .unwrap_or_else(|| DEFAULT_CONFIG_FILE.into());

        Figment::from(Serialized::defaults(EngineConfig::default()))
            .merge(Yaml::file(file))
            .merge(Env::prefixed("EPICYCLE_").split("__"))
            .extract()
            .map_err(|e| EngineError::Config(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_load_missing_file_yields_defaults() {
        let config = ConfigLoader::load_from(Some(Path::new("/definitely/not/there.yaml"))).unwrap();
        assert_eq!(config.agent, "claude_code");
        assert_eq!(config.retry.max_retries, 2);
    }

    #[test]
    fn test_load_merges_file_over_defaults() {
        let mut file = tempfile::NamedTempFile::with_suffix(".yaml").unwrap();
        writeln!(
            file,
            "agent: opencode\nfallback_agents: [claude_code]\nretry:\n  max_retries: 7\n"
        )
        .unwrap();

        let config = ConfigLoader::load_from(Some(file.path())).unwrap();
        assert_eq!(config.agent, "opencode");
        assert_eq!(config.fallback_agents, vec!["claude_code".to_string()]);
        assert_eq!(config.retry.max_retries, 7);
        // Untouched sections keep defaults
        assert_eq!(config.rate_limit.base_backoff_ms, 5_000);
    }
}

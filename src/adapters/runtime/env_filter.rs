//! Environment filtering for agent subprocesses.
//!
//! Secrets are stripped from the inherited environment before an agent is
//! spawned. Defaults are always active; user-specified exclusions and
//! passthrough patterns layer over them, and explicit env from the caller is
//! overlaid last.

use std::collections::HashMap;

/// Patterns removed from every agent environment.
pub const DEFAULT_EXCLUDE_PATTERNS: &[&str] = &["*_API_KEY", "*_SECRET_KEY", "*_SECRET"];

/// Case-sensitive wildcard match: `*` = any run of characters, `?` = one.
pub fn wildcard_match(pattern: &str, key: &str) -> bool {
    let p: Vec<char> = pattern.chars().collect();
    let k: Vec<char> = key.chars().collect();

    // dp[i][j]: pattern[..i] matches key[..j]
    let mut dp = vec![vec![false; k.len() + 1]; p.len() + 1];
    dp[0][0] = true;
    for i in 1..=p.len() {
        if p[i - 1] == '*' {
            dp[i][0] = dp[i - 1][0];
        }
    }
    for i in 1..=p.len() {
        for j in 1..=k.len() {
            dp[i][j] = match p[i - 1] {
                '*' => dp[i - 1][j] || dp[i][j - 1],
                '?' => dp[i - 1][j - 1],
                c => dp[i - 1][j - 1] && c == k[j - 1],
            };
        }
    }
    dp[p.len()][k.len()]
}

fn matches_any(patterns: &[String], key: &str) -> bool {
    patterns.iter().any(|p| wildcard_match(p, key))
}

/// Env filtering policy for one agent execution.
#[derive(Debug, Clone, Default)]
pub struct EnvPolicy {
    /// User exclusions, applied after the defaults
    pub exclude: Vec<String>,
    /// Keys restored from the base environment after exclusion
    pub passthrough: Vec<String>,
}

impl EnvPolicy {
    /// Build the child environment from a base environment.
    ///
    /// Order: remove defaults, remove user exclusions, restore passthrough
    /// matches from the base, then overlay `explicit`.
    pub fn build(
        &self,
        base: &HashMap<String, String>,
        explicit: &HashMap<String, String>,
    ) -> HashMap<String, String> {
        let mut env: HashMap<String, String> = base
            .iter()
            .filter(|(key, _)| {
                !DEFAULT_EXCLUDE_PATTERNS
                    .iter()
                    .any(|p| wildcard_match(p, key))
                    && !matches_any(&self.exclude, key)
            })
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();

        for (key, value) in base {
            if matches_any(&self.passthrough, key) {
                env.insert(key.clone(), value.clone());
            }
        }

        for (key, value) in explicit {
            env.insert(key.clone(), value.clone());
        }

        env
    }
}

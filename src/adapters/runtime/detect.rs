//! Agent CLI detection: command resolution and version probing.

use regex::Regex;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::OnceLock;
use tokio::process::Command;
use tracing::debug;

use crate::domain::models::DetectResult;
use crate::domain::ports::AgentMeta;

fn version_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^\d+\.\d+\.\d+$").expect("static regex"))
}

/// Resolve a command to an executable path.
///
/// Commands containing a path separator are checked directly; bare names are
/// probed against every `PATH` entry, the way `which` does.
pub fn resolve_command(command: &str) -> Option<PathBuf> {
    if command.contains(std::path::MAIN_SEPARATOR) || command.contains('/') {
        let path = PathBuf::from(command);
        return path.is_file().then_some(path);
    }

    let path_var = std::env::var_os("PATH")?;
    for dir in std::env::split_paths(&path_var) {
        let candidate = dir.join(command);
        if is_executable(&candidate) {
            return Some(candidate);
        }
        #[cfg(windows)]
        {
            for ext in ["exe", "cmd", "bat"] {
                let with_ext = dir.join(format!("{command}.{ext}"));
                if with_ext.is_file() {
                    return Some(with_ext);
                }
            }
        }
    }
    None
}

#[cfg(unix)]
fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    path.is_file()
        && path
            .metadata()
            .map(|m| m.permissions().mode() & 0o111 != 0)
            .unwrap_or(false)
}

#[cfg(not(unix))]
fn is_executable(path: &Path) -> bool {
    path.is_file()
}

/// Run `<program> --version` and extract a `MAJOR.MINOR.PATCH` token.
pub async fn probe_version(program: &Path) -> Result<String, String> {
    let output = Command::new(program)
        .arg("--version")
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .output()
        .await
        .map_err(|e| format!("failed to run {} --version: {e}", program.display()))?;

    if !output.status.success() {
        return Err(format!(
            "{} --version exited with {:?}",
            program.display(),
            output.status.code()
        ));
    }

    let stdout = String::from_utf8_lossy(&output.stdout);
    extract_version(&stdout)
        .ok_or_else(|| format!("no version string in output of {} --version", program.display()))
}

/// Find the first whitespace-separated token shaped like a semver triple.
pub fn extract_version(output: &str) -> Option<String> {
    output
        .split_whitespace()
        .map(|token| token.trim_start_matches('v'))
        .find(|token| version_regex().is_match(token))
        .map(ToString::to_string)
}

/// Full detection for a plugin: resolve the configured command or any of the
/// plugin's known names, then verify with a version probe.
pub async fn detect_agent(meta: &AgentMeta, configured_command: Option<&str>) -> DetectResult {
    let mut candidates: Vec<&str> = Vec::new();
    if let Some(cmd) = configured_command {
        candidates.push(cmd);
    } else {
        candidates.push(meta.default_command);
        candidates.extend(meta.command_aliases.iter().copied());
    }

    for candidate in &candidates {
        let Some(path) = resolve_command(candidate) else {
            continue;
        };
        debug!(plugin = meta.id, command = %candidate, path = %path.display(), "Resolved agent command");
        match probe_version(&path).await {
            Ok(version) => {
                return DetectResult {
                    available: true,
                    version: Some(version),
                    executable_path: Some(path),
                    error: None,
                }
            }
            Err(e) => {
                return DetectResult {
                    available: false,
                    version: None,
                    executable_path: Some(path),
                    error: Some(e),
                }
            }
        }
    }

    DetectResult::unavailable(format!(
        "{} not found in PATH (tried: {})",
        meta.name,
        candidates.join(", ")
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extract_version() {
        assert_eq!(extract_version("1.2.3"), Some("1.2.3".to_string()));
        assert_eq!(
            extract_version("claude version 0.14.2 (stable)"),
            Some("0.14.2".to_string())
        );
        assert_eq!(extract_version("v2.0.1"), Some("2.0.1".to_string()));
        assert_eq!(extract_version("no version here"), None);
        assert_eq!(extract_version("1.2"), None);
        assert_eq!(extract_version("1.2.3.4"), None);
    }

    #[test]
    fn test_resolve_missing_command() {
        assert!(resolve_command("definitely-not-a-real-binary-epicycle").is_none());
    }

    #[cfg(unix)]
    #[test]
    fn test_resolve_absolute_path() {
        // /bin/sh exists on any Unix
        assert!(resolve_command("/bin/sh").is_some());
        assert!(resolve_command("/bin/no-such-file-epicycle").is_none());
    }
}

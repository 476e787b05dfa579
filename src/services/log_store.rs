//! Iteration log persistence.
//!
//! Each iteration is persisted as a single file: a parseable markdown-ish
//! header, the raw stdout, and optional stderr and subagent-trace sections.
//! Loading a freshly saved file reproduces every header field and both
//! streams byte-for-byte (provided the streams don't contain the section
//! dividers themselves).

use chrono::{DateTime, NaiveDateTime, Utc};
use regex::Regex;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

use crate::domain::errors::{EngineError, EngineResult};
use crate::domain::models::{
    AgentBindingReason, AgentSwitchRecord, IterationStatus, SubagentTrace,
};

const RAW_MARKER: &str = "\n--- RAW OUTPUT ---\n";
const STDERR_MARKER: &str = "\n--- STDERR ---\n";
const TRACE_MARKER: &str = "\n--- SUBAGENT TRACE ---\n";

/// Max chars of task description stored in the header.
const DESCRIPTION_LIMIT: usize = 200;

/// Header metadata of one iteration log.
#[derive(Debug, Clone)]
pub struct LogMetadata {
    pub iteration: u32,
    pub task_id: String,
    pub task_title: String,
    pub description: Option<String>,
    pub status: IterationStatus,
    pub task_completed: bool,
    pub promise_complete: bool,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
    pub error: Option<String>,
    pub agent: Option<String>,
    pub model: Option<String>,
    pub epic: Option<String>,
    pub sandbox_mode: Option<String>,
    pub sandbox_network: Option<bool>,
    pub completion_summary: Option<String>,
    pub switches: Vec<AgentSwitchRecord>,
}

impl LogMetadata {
    pub fn duration_ms(&self) -> u64 {
        (self.ended_at - self.started_at).num_milliseconds().max(0) as u64
    }
}

/// A loaded iteration log.
#[derive(Debug, Clone)]
pub struct IterationLog {
    pub metadata: LogMetadata,
    pub stdout: String,
    pub stderr: String,
    pub subagent_trace: Option<SubagentTrace>,
    pub file_path: PathBuf,
}

/// Options for saving one log.
#[derive(Debug, Clone, Default)]
pub struct SaveOptions {
    /// Use the session filename scheme when present; legacy otherwise
    pub session_id: Option<String>,
    /// Stream stdout from this file instead of the in-memory string
    pub stdout_path: Option<PathBuf>,
    /// Stream stderr from this file instead of the in-memory string
    pub stderr_path: Option<PathBuf>,
}

/// Components recovered from a log filename.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedFilename {
    pub session: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub iteration: Option<u32>,
    pub task_id: String,
}

/// Persists and retrieves per-iteration logs under a workspace directory.
#[derive(Debug, Clone)]
pub struct LogStore {
    logs_dir: PathBuf,
}

impl LogStore {
    /// `logs_dir` is resolved relative to the cwd passed to each operation.
    pub fn new(logs_dir: impl Into<PathBuf>) -> Self {
        Self {
            logs_dir: logs_dir.into(),
        }
    }

    fn dir(&self, cwd: &Path) -> PathBuf {
        cwd.join(&self.logs_dir)
    }

    /// Persist one iteration log, returning the file path.
    pub async fn save_iteration_log(
        &self,
        cwd: &Path,
        metadata: &LogMetadata,
        stdout: &str,
        stderr: &str,
        trace: Option<&SubagentTrace>,
        options: &SaveOptions,
    ) -> EngineResult<PathBuf> {
        let dir = self.dir(cwd);
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|e| EngineError::LogPersistence(format!("cannot create {}: {e}", dir.display())))?;

        let filename = match options.session_id {
            Some(ref session) => session_filename(session, metadata.started_at, &metadata.task_id),
            None => legacy_filename(metadata.iteration, &metadata.task_id),
        };
        let path = dir.join(&filename);

        let mut file = tokio::fs::File::create(&path)
            .await
            .map_err(|e| EngineError::LogPersistence(format!("cannot create {}: {e}", path.display())))?;

        let write_err =
            |e: std::io::Error| EngineError::LogPersistence(format!("cannot write {}: {e}", path.display()));

        file.write_all(serialize_header(metadata).as_bytes())
            .await
            .map_err(write_err)?;

        file.write_all(RAW_MARKER.trim_start_matches('\n').as_bytes())
            .await
            .map_err(write_err)?;
        write_stream(&mut file, stdout, options.stdout_path.as_deref(), &path).await?;

        let has_stderr = options.stderr_path.is_some() || !stderr.is_empty();
        if has_stderr {
            file.write_all(STDERR_MARKER.as_bytes()).await.map_err(write_err)?;
            write_stream(&mut file, stderr, options.stderr_path.as_deref(), &path).await?;
        }

        if let Some(trace) = trace {
            let json = serde_json::to_string_pretty(trace)?;
            file.write_all(TRACE_MARKER.as_bytes()).await.map_err(write_err)?;
            file.write_all(json.as_bytes()).await.map_err(write_err)?;
            file.write_all(b"\n").await.map_err(write_err)?;
        }

        file.flush().await.map_err(write_err)?;
        debug!(path = %path.display(), iteration = metadata.iteration, "Iteration log saved");
        Ok(path)
    }

    /// Load a log file back into its parts.
    pub async fn load_iteration_log(path: &Path) -> EngineResult<IterationLog> {
        let raw = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| EngineError::LogPersistence(format!("cannot read {}: {e}", path.display())))?;
        parse_log(&raw, path)
    }

    /// All logs under `cwd`, chronological by `started_at`.
    pub async fn list_iteration_logs(
        &self,
        cwd: &Path,
        task_id: Option<&str>,
    ) -> EngineResult<Vec<IterationLog>> {
        let dir = self.dir(cwd);
        let mut logs = Vec::new();

        let mut entries = match tokio::fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(_) => return Ok(logs),
        };

        while let Ok(Some(entry)) = entries.next_entry().await {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("log") {
                continue;
            }
            let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            if parse_filename(name).is_none() {
                continue;
            }
            match Self::load_iteration_log(&path).await {
                Ok(log) => {
                    if task_id.map_or(true, |id| log.metadata.task_id == id) {
                        logs.push(log);
                    }
                }
                Err(e) => warn!(path = %path.display(), error = %e, "Skipping unparseable log"),
            }
        }

        logs.sort_by_key(|log| log.metadata.started_at);
        Ok(logs)
    }

    pub async fn get_iteration_log_by_number(
        &self,
        cwd: &Path,
        iteration: u32,
    ) -> EngineResult<Option<IterationLog>> {
        let logs = self.list_iteration_logs(cwd, None).await?;
        Ok(logs
            .into_iter()
            .rev()
            .find(|log| log.metadata.iteration == iteration))
    }

    pub async fn get_iteration_logs_by_task(
        &self,
        cwd: &Path,
        task_id: &str,
    ) -> EngineResult<Vec<IterationLog>> {
        self.list_iteration_logs(cwd, Some(task_id)).await
    }

    /// Delete all but the `keep` newest logs. Returns the affected paths;
    /// with `dry_run` nothing is deleted.
    pub async fn cleanup_iteration_logs(
        &self,
        cwd: &Path,
        keep: usize,
        dry_run: bool,
    ) -> EngineResult<Vec<PathBuf>> {
        let mut logs = self.list_iteration_logs(cwd, None).await?;
        // Newest first, then everything past `keep` goes.
        logs.reverse();

        let mut affected = Vec::new();
        for log in logs.into_iter().skip(keep) {
            if !dry_run {
                tokio::fs::remove_file(&log.file_path).await.map_err(|e| {
                    EngineError::LogPersistence(format!(
                        "cannot remove {}: {e}",
                        log.file_path.display()
                    ))
                })?;
            }
            affected.push(log.file_path);
        }
        Ok(affected)
    }

    pub async fn has_iteration_logs(&self, cwd: &Path) -> bool {
        self.list_iteration_logs(cwd, None)
            .await
            .map(|logs| !logs.is_empty())
            .unwrap_or(false)
    }

    /// Total bytes used by log files.
    pub async fn disk_usage(&self, cwd: &Path) -> EngineResult<u64> {
        let dir = self.dir(cwd);
        let mut total = 0;
        let mut entries = match tokio::fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(_) => return Ok(0),
        };
        while let Ok(Some(entry)) = entries.next_entry().await {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) == Some("log") {
                if let Ok(meta) = entry.metadata().await {
                    total += meta.len();
                }
            }
        }
        Ok(total)
    }
}

async fn write_stream(
    file: &mut tokio::fs::File,
    in_memory: &str,
    source_path: Option<&Path>,
    dest: &Path,
) -> EngineResult<()> {
    match source_path {
        Some(source) => {
            let mut reader = tokio::fs::File::open(source).await.map_err(|e| {
                EngineError::LogPersistence(format!("cannot open {}: {e}", source.display()))
            })?;
            tokio::io::copy(&mut reader, file).await.map_err(|e| {
                EngineError::LogPersistence(format!("cannot stream into {}: {e}", dest.display()))
            })?;
        }
        None => {
            file.write_all(in_memory.as_bytes()).await.map_err(|e| {
                EngineError::LogPersistence(format!("cannot write {}: {e}", dest.display()))
            })?;
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Serialization
// ---------------------------------------------------------------------------

/// Render a duration as `Hh Mm Ss`, `Mm Ss`, or `Ss`.
pub fn format_duration(ms: u64) -> String {
    let total_secs = ms / 1000;
    let hours = total_secs / 3600;
    let minutes = (total_secs % 3600) / 60;
    let seconds = total_secs % 60;
    if hours > 0 {
        format!("{hours}h {minutes}m {seconds}s")
    } else if minutes > 0 {
        format!("{minutes}m {seconds}s")
    } else {
        format!("{seconds}s")
    }
}

fn single_line(text: &str) -> String {
    text.replace(['\n', '\r'], " ")
}

fn yes_no(value: bool) -> &'static str {
    if value {
        "Yes"
    } else {
        "No"
    }
}

fn serialize_header(m: &LogMetadata) -> String {
    let mut s = format!("# Iteration {} Log\n", m.iteration);

    if let Some(ref summary) = m.completion_summary {
        s.push_str("\n## Summary (For Context Recovery)\n\n");
        s.push_str(summary.trim());
        s.push('\n');
    }

    s.push_str("\n## Metadata\n\n");
    s.push_str(&format!("- **Task ID**: {}\n", single_line(&m.task_id)));
    s.push_str(&format!("- **Task Title**: {}\n", single_line(&m.task_title)));
    if let Some(ref description) = m.description {
        let description = single_line(description);
        let truncated: String = if description.chars().count() > DESCRIPTION_LIMIT {
            let head: String = description.chars().take(DESCRIPTION_LIMIT).collect();
            format!("{head}...")
        } else {
            description
        };
        s.push_str(&format!("- **Description**: {truncated}\n"));
    }
    s.push_str(&format!("- **Status**: {}\n", m.status.as_str()));
    s.push_str(&format!("- **Task Completed**: {}\n", yes_no(m.task_completed)));
    s.push_str(&format!("- **Promise Detected**: {}\n", yes_no(m.promise_complete)));
    s.push_str(&format!("- **Started At**: {}\n", m.started_at.to_rfc3339()));
    s.push_str(&format!("- **Ended At**: {}\n", m.ended_at.to_rfc3339()));
    s.push_str(&format!("- **Duration**: {}\n", format_duration(m.duration_ms())));
    if let Some(ref error) = m.error {
        s.push_str(&format!("- **Error**: {}\n", single_line(error)));
    }
    if let Some(ref agent) = m.agent {
        s.push_str(&format!("- **Agent**: {agent}\n"));
    }
    if let Some(ref model) = m.model {
        s.push_str(&format!("- **Model**: {model}\n"));
    }
    if let Some(ref epic) = m.epic {
        s.push_str(&format!("- **Epic**: {epic}\n"));
    }
    if let Some(ref mode) = m.sandbox_mode {
        s.push_str(&format!("- **Sandbox Mode**: {mode}\n"));
    }
    if let Some(network) = m.sandbox_network {
        s.push_str(&format!(
            "- **Sandbox Network**: {}\n",
            if network { "Enabled" } else { "Disabled" }
        ));
    }
    if let Some(ref summary) = m.completion_summary {
        s.push_str(&format!("- **Completion Summary**: {}\n", single_line(summary)));
    }

    if !m.switches.is_empty() {
        s.push_str("\n## Agent Switches\n\n");
        for switch in &m.switches {
            let label = match switch.reason {
                AgentBindingReason::Fallback => "Switched to fallback",
                AgentBindingReason::Primary => "Recovered to primary",
            };
            s.push_str(&format!(
                "- **{label}**: {} → {} at {}\n",
                switch.from,
                switch.to,
                switch.at.to_rfc3339()
            ));
        }
    }

    s
}

// ---------------------------------------------------------------------------
// Parsing
// ---------------------------------------------------------------------------

fn parse_log(raw: &str, path: &Path) -> EngineResult<IterationLog> {
    let Some(marker_pos) = raw.find(RAW_MARKER) else {
        return Err(EngineError::LogPersistence(format!(
            "{} has no raw output section",
            path.display()
        )));
    };
    let header = &raw[..marker_pos];
    let body = &raw[marker_pos + RAW_MARKER.len()..];

    let (body, trace) = match body.find(TRACE_MARKER) {
        Some(pos) => {
            let json = body[pos + TRACE_MARKER.len()..].trim_end();
            let trace: SubagentTrace = serde_json::from_str(json)?;
            (&body[..pos], Some(trace))
        }
        None => (body, None),
    };

    let (stdout, stderr) = match body.find(STDERR_MARKER) {
        Some(pos) => (
            body[..pos].to_string(),
            body[pos + STDERR_MARKER.len()..].to_string(),
        ),
        None => (body.to_string(), String::new()),
    };

    let metadata = parse_header(header, path)?;

    Ok(IterationLog {
        metadata,
        stdout,
        stderr,
        subagent_trace: trace,
        file_path: path.to_path_buf(),
    })
}

fn header_value<'a>(header: &'a str, key: &str) -> Option<&'a str> {
    let needle = format!("- **{key}**: ");
    header
        .lines()
        .find_map(|line| line.strip_prefix(needle.as_str()))
}

fn parse_timestamp(value: &str) -> EngineResult<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| EngineError::LogPersistence(format!("bad timestamp '{value}': {e}")))
}

fn parse_header(header: &str, path: &Path) -> EngineResult<LogMetadata> {
    let iteration_re = iteration_title_regex();
    let iteration = iteration_re
        .captures(header)
        .and_then(|c| c.get(1))
        .and_then(|m| m.as_str().parse().ok())
        .ok_or_else(|| {
            EngineError::LogPersistence(format!("{} has no iteration title", path.display()))
        })?;

    let required = |key: &str| {
        header_value(header, key).ok_or_else(|| {
            EngineError::LogPersistence(format!("{} missing header field {key}", path.display()))
        })
    };

    let status_str = required("Status")?;
    let status = IterationStatus::from_str(status_str).ok_or_else(|| {
        EngineError::LogPersistence(format!("unknown status '{status_str}' in {}", path.display()))
    })?;

    let switches = parse_switches(header);

    Ok(LogMetadata {
        iteration,
        task_id: required("Task ID")?.to_string(),
        task_title: required("Task Title")?.to_string(),
        description: header_value(header, "Description").map(ToString::to_string),
        status,
        task_completed: required("Task Completed")? == "Yes",
        promise_complete: required("Promise Detected")? == "Yes",
        started_at: parse_timestamp(required("Started At")?)?,
        ended_at: parse_timestamp(required("Ended At")?)?,
        error: header_value(header, "Error").map(ToString::to_string),
        agent: header_value(header, "Agent").map(ToString::to_string),
        model: header_value(header, "Model").map(ToString::to_string),
        epic: header_value(header, "Epic").map(ToString::to_string),
        sandbox_mode: header_value(header, "Sandbox Mode").map(ToString::to_string),
        sandbox_network: header_value(header, "Sandbox Network").map(|v| v == "Enabled"),
        completion_summary: header_value(header, "Completion Summary").map(ToString::to_string),
        switches,
    })
}

fn parse_switches(header: &str) -> Vec<AgentSwitchRecord> {
    let mut switches = Vec::new();
    for line in header.lines() {
        let (reason, rest) =
            if let Some(rest) = line.strip_prefix("- **Switched to fallback**: ") {
                (AgentBindingReason::Fallback, rest)
            } else if let Some(rest) = line.strip_prefix("- **Recovered to primary**: ") {
                (AgentBindingReason::Primary, rest)
            } else {
                continue;
            };

        let Some((pair, at)) = rest.rsplit_once(" at ") else {
            continue;
        };
        let Some((from, to)) = pair.split_once(" → ") else {
            continue;
        };
        let Ok(at) = DateTime::parse_from_rfc3339(at) else {
            continue;
        };
        switches.push(AgentSwitchRecord {
            from: from.to_string(),
            to: to.to_string(),
            reason,
            at: at.with_timezone(&Utc),
        });
    }
    switches
}

// ---------------------------------------------------------------------------
// Filenames
// ---------------------------------------------------------------------------

fn iteration_title_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"# Iteration (\d+) Log").expect("static regex"))
}

fn session_filename_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^([0-9a-fA-F]{8})_(\d{4}-\d{2}-\d{2}_\d{2}-\d{2}-\d{2})_(.+)\.log$")
            .expect("static regex")
    })
}

fn legacy_filename_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^iteration-(\d+)-(.+)\.log$").expect("static regex"))
}

/// Replace filesystem-hostile characters in a task id.
pub fn safe_task_id(task_id: &str) -> String {
    task_id
        .chars()
        .map(|c| match c {
            '/' | '\\' | ':' | '*' | '?' | '"' | '<' | '>' | '|' => '-',
            other => other,
        })
        .collect()
}

/// Legacy filename: `iteration-{000N}-{safeTaskId}.log`.
pub fn legacy_filename(iteration: u32, task_id: &str) -> String {
    format!("iteration-{:04}-{}.log", iteration, safe_task_id(task_id))
}

/// Session filename: `{sessionId8}_{YYYY-MM-DD_HH-mm-ss}_{safeTaskId}.log`.
pub fn session_filename(session_id: &str, started_at: DateTime<Utc>, task_id: &str) -> String {
    let session8: String = session_id.chars().take(8).collect();
    format!(
        "{}_{}_{}.log",
        session8,
        started_at.format("%Y-%m-%d_%H-%M-%S"),
        safe_task_id(task_id)
    )
}

/// Recover filename components from either scheme.
pub fn parse_filename(name: &str) -> Option<ParsedFilename> {
    if let Some(caps) = session_filename_regex().captures(name) {
        let started_at = NaiveDateTime::parse_from_str(&caps[2], "%Y-%m-%d_%H-%M-%S")
            .ok()
            .map(|naive| naive.and_utc());
        return Some(ParsedFilename {
            session: Some(caps[1].to_string()),
            started_at,
            iteration: None,
            task_id: caps[3].to_string(),
        });
    }
    if let Some(caps) = legacy_filename_regex().captures(name) {
        return Some(ParsedFilename {
            session: None,
            started_at: None,
            iteration: caps[1].parse().ok(),
            task_id: caps[2].to_string(),
        });
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::models::{SubagentStats, SubagentTrace};
    use chrono::TimeZone;
    use proptest::prelude::*;
    use tempfile::TempDir;

    fn sample_metadata() -> LogMetadata {
        LogMetadata {
            iteration: 3,
            task_id: "T-42".to_string(),
            task_title: "Wire the loop".to_string(),
            description: Some("A description of the work".to_string()),
            status: IterationStatus::Completed,
            task_completed: true,
            promise_complete: true,
            started_at: Utc.with_ymd_and_hms(2025, 6, 1, 10, 0, 0).unwrap(),
            ended_at: Utc.with_ymd_and_hms(2025, 6, 1, 10, 1, 5).unwrap(),
            error: None,
            agent: Some("claude_code".to_string()),
            model: Some("sonnet".to_string()),
            epic: Some("checkout".to_string()),
            sandbox_mode: Some("auto".to_string()),
            sandbox_network: Some(false),
            completion_summary: None,
            switches: vec![],
        }
    }

    #[test]
    fn test_format_duration() {
        assert_eq!(format_duration(5_000), "5s");
        assert_eq!(format_duration(65_000), "1m 5s");
        assert_eq!(format_duration(3_725_000), "1h 2m 5s");
        assert_eq!(format_duration(0), "0s");
    }

    #[test]
    fn test_safe_task_id() {
        assert_eq!(safe_task_id("a/b\\c:d*e?f\"g<h>i|j"), "a-b-c-d-e-f-g-h-i-j");
        assert_eq!(safe_task_id("plain-id_1"), "plain-id_1");
    }

    #[test]
    fn test_filename_round_trip() {
        let started = Utc.with_ymd_and_hms(2025, 6, 1, 9, 30, 15).unwrap();
        let name = session_filename("deadbeefcafe", started, "T/9");
        assert_eq!(name, "deadbeef_2025-06-01_09-30-15_T-9.log");

        let parsed = parse_filename(&name).unwrap();
        assert_eq!(parsed.session.as_deref(), Some("deadbeef"));
        assert_eq!(parsed.started_at, Some(started));
        assert_eq!(parsed.task_id, "T-9");
        assert_eq!(parsed.iteration, None);
    }

    #[test]
    fn test_legacy_filename_round_trip() {
        let name = legacy_filename(7, "T1");
        assert_eq!(name, "iteration-0007-T1.log");
        let parsed = parse_filename(&name).unwrap();
        assert_eq!(parsed.iteration, Some(7));
        assert_eq!(parsed.task_id, "T1");
        assert_eq!(parsed.session, None);
    }

    #[test]
    fn test_parse_filename_rejects_noise() {
        assert!(parse_filename("notes.txt").is_none());
        assert!(parse_filename("iteration-x-y.log").is_none());
    }

    #[tokio::test]
    async fn test_save_load_round_trip() {
        let dir = TempDir::new().unwrap();
        let store = LogStore::new(".epicycle/logs");
        let metadata = sample_metadata();

        let stdout = "line one\nline two\n<promise>COMPLETE</promise>\n";
        let stderr = "a warning\n";

        let path = store
            .save_iteration_log(dir.path(), &metadata, stdout, stderr, None, &SaveOptions::default())
            .await
            .unwrap();

        let log = LogStore::load_iteration_log(&path).await.unwrap();
        assert_eq!(log.metadata.iteration, 3);
        assert_eq!(log.metadata.task_id, "T-42");
        assert_eq!(log.metadata.task_title, "Wire the loop");
        assert_eq!(log.metadata.status, IterationStatus::Completed);
        assert!(log.metadata.task_completed);
        assert!(log.metadata.promise_complete);
        assert_eq!(log.metadata.started_at, metadata.started_at);
        assert_eq!(log.metadata.ended_at, metadata.ended_at);
        assert_eq!(log.metadata.agent.as_deref(), Some("claude_code"));
        assert_eq!(log.metadata.sandbox_network, Some(false));
        assert_eq!(log.stdout, stdout);
        assert_eq!(log.stderr, stderr);
        assert!(log.subagent_trace.is_none());
    }

    #[tokio::test]
    async fn test_round_trip_with_trace_and_switches() {
        let dir = TempDir::new().unwrap();
        let store = LogStore::new("logs");

        let mut metadata = sample_metadata();
        metadata.completion_summary = Some("Recovered after one fallback switch".to_string());
        metadata.switches = vec![
            AgentSwitchRecord {
                from: "claude_code".to_string(),
                to: "opencode".to_string(),
                reason: AgentBindingReason::Fallback,
                at: Utc.with_ymd_and_hms(2025, 6, 1, 10, 0, 30).unwrap(),
            },
            AgentSwitchRecord {
                from: "opencode".to_string(),
                to: "claude_code".to_string(),
                reason: AgentBindingReason::Primary,
                at: Utc.with_ymd_and_hms(2025, 6, 1, 10, 0, 50).unwrap(),
            },
        ];

        let trace = SubagentTrace {
            events: vec![],
            hierarchy: vec![],
            stats: SubagentStats {
                total_subagents: 2,
                ..Default::default()
            },
        };

        let path = store
            .save_iteration_log(
                dir.path(),
                &metadata,
                "out\n",
                "",
                Some(&trace),
                &SaveOptions {
                    session_id: Some("0123456789ab".to_string()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        assert!(path
            .file_name()
            .unwrap()
            .to_str()
            .unwrap()
            .starts_with("01234567_"));

        let log = LogStore::load_iteration_log(&path).await.unwrap();
        assert_eq!(log.metadata.switches.len(), 2);
        assert_eq!(log.metadata.switches[0].to, "opencode");
        assert_eq!(log.metadata.switches[1].reason, AgentBindingReason::Primary);
        assert_eq!(
            log.metadata.completion_summary.as_deref(),
            Some("Recovered after one fallback switch")
        );
        assert_eq!(log.subagent_trace.unwrap().stats.total_subagents, 2);
        assert_eq!(log.stdout, "out\n");
        assert_eq!(log.stderr, "");
    }

    #[tokio::test]
    async fn test_description_truncated_to_limit() {
        let dir = TempDir::new().unwrap();
        let store = LogStore::new("logs");
        let mut metadata = sample_metadata();
        metadata.description = Some("x".repeat(300));

        let path = store
            .save_iteration_log(dir.path(), &metadata, "", "", None, &SaveOptions::default())
            .await
            .unwrap();
        let log = LogStore::load_iteration_log(&path).await.unwrap();
        let description = log.metadata.description.unwrap();
        assert_eq!(description.chars().count(), DESCRIPTION_LIMIT + 3);
        assert!(description.ends_with("..."));
    }

    #[tokio::test]
    async fn test_list_sorts_chronologically_across_schemes() {
        let dir = TempDir::new().unwrap();
        let store = LogStore::new("logs");

        let mut newer = sample_metadata();
        newer.iteration = 2;
        newer.started_at = Utc.with_ymd_and_hms(2025, 6, 2, 8, 0, 0).unwrap();
        newer.ended_at = Utc.with_ymd_and_hms(2025, 6, 2, 8, 0, 5).unwrap();

        let older = sample_metadata();

        // Newer saved first, with the session scheme; older with legacy.
        store
            .save_iteration_log(
                dir.path(),
                &newer,
                "",
                "",
                None,
                &SaveOptions {
                    session_id: Some("abcdef012345".to_string()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        store
            .save_iteration_log(dir.path(), &older, "", "", None, &SaveOptions::default())
            .await
            .unwrap();

        let logs = store.list_iteration_logs(dir.path(), None).await.unwrap();
        assert_eq!(logs.len(), 2);
        assert_eq!(logs[0].metadata.iteration, 3);
        assert_eq!(logs[1].metadata.iteration, 2);

        let found = store
            .get_iteration_log_by_number(dir.path(), 2)
            .await
            .unwrap();
        assert!(found.is_some());
    }

    #[tokio::test]
    async fn test_cleanup_keeps_newest() {
        let dir = TempDir::new().unwrap();
        let store = LogStore::new("logs");

        for i in 0..5 {
            let mut metadata = sample_metadata();
            metadata.iteration = i;
            metadata.task_id = format!("T{i}");
            metadata.started_at = Utc.with_ymd_and_hms(2025, 6, 1, 10, i, 0).unwrap();
            metadata.ended_at = metadata.started_at;
            store
                .save_iteration_log(dir.path(), &metadata, "", "", None, &SaveOptions::default())
                .await
                .unwrap();
        }

        let would_delete = store
            .cleanup_iteration_logs(dir.path(), 2, true)
            .await
            .unwrap();
        assert_eq!(would_delete.len(), 3);
        assert!(store.has_iteration_logs(dir.path()).await);

        let deleted = store
            .cleanup_iteration_logs(dir.path(), 2, false)
            .await
            .unwrap();
        assert_eq!(deleted.len(), 3);

        let remaining = store.list_iteration_logs(dir.path(), None).await.unwrap();
        assert_eq!(remaining.len(), 2);
        assert_eq!(remaining[0].metadata.iteration, 3);
        assert_eq!(remaining[1].metadata.iteration, 4);
    }

    #[tokio::test]
    async fn test_streamed_save_from_files() {
        let dir = TempDir::new().unwrap();
        let store = LogStore::new("logs");

        let stdout_path = dir.path().join("stdout.txt");
        tokio::fs::write(&stdout_path, "streamed out\n").await.unwrap();
        let stderr_path = dir.path().join("stderr.txt");
        tokio::fs::write(&stderr_path, "streamed err\n").await.unwrap();

        let path = store
            .save_iteration_log(
                dir.path(),
                &sample_metadata(),
                "",
                "",
                None,
                &SaveOptions {
                    stdout_path: Some(stdout_path),
                    stderr_path: Some(stderr_path),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        let log = LogStore::load_iteration_log(&path).await.unwrap();
        assert_eq!(log.stdout, "streamed out\n");
        assert_eq!(log.stderr, "streamed err\n");
    }

    #[tokio::test]
    async fn test_disk_usage() {
        let dir = TempDir::new().unwrap();
        let store = LogStore::new("logs");
        assert_eq!(store.disk_usage(dir.path()).await.unwrap(), 0);

        store
            .save_iteration_log(dir.path(), &sample_metadata(), "abc", "", None, &SaveOptions::default())
            .await
            .unwrap();
        assert!(store.disk_usage(dir.path()).await.unwrap() > 0);
    }

    proptest! {
        #[test]
        fn prop_stream_round_trip(
            stdout in "[a-zA-Z0-9 \n]{0,200}",
            stderr in "[a-zA-Z0-9 \n]{0,200}",
        ) {
            let rt = tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
                .unwrap();
            rt.block_on(async {
                let dir = TempDir::new().unwrap();
                let store = LogStore::new("logs");
                let path = store
                    .save_iteration_log(dir.path(), &sample_metadata(), &stdout, &stderr, None, &SaveOptions::default())
                    .await
                    .unwrap();
                let log = LogStore::load_iteration_log(&path).await.unwrap();
                assert_eq!(log.stdout, stdout);
                assert_eq!(log.stderr, stderr);
            });
        }

        // Filenames must round-trip for any iteration number, session id,
        // timestamp, and task id, including ids full of the characters
        // `safe_task_id` sanitizes. The parsed task id equals the sanitized
        // form, since that is what lands in the filename.
        #[test]
        fn prop_filename_round_trip(
            iteration in 0u32..100_000,
            session in "[0-9a-f]{8,16}",
            task_id in r#"[A-Za-z0-9 ._/\\:*?"<>|-]{1,24}"#,
            secs in 0i64..4_102_444_800,
        ) {
            let started_at = Utc.timestamp_opt(secs, 0).unwrap();

            let name = session_filename(&session, started_at, &task_id);
            let parsed = parse_filename(&name).expect("session filename parses");
            prop_assert_eq!(parsed.session.as_deref(), Some(&session[..8]));
            prop_assert_eq!(parsed.started_at, Some(started_at));
            prop_assert_eq!(parsed.iteration, None);
            prop_assert_eq!(&parsed.task_id, &safe_task_id(&task_id));

            let name = legacy_filename(iteration, &task_id);
            let parsed = parse_filename(&name).expect("legacy filename parses");
            prop_assert_eq!(parsed.iteration, Some(iteration));
            prop_assert_eq!(&parsed.task_id, &safe_task_id(&task_id));
            prop_assert_eq!(parsed.session, None);
            prop_assert_eq!(parsed.started_at, None);
        }
    }
}

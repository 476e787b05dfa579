//! Rate-limit detection over finished agent executions.
//!
//! Classification works on the captured stdout/stderr text plus the exit
//! code. Detection rules live in a data table keyed by agent family; new
//! agents add patterns, not code. Detection is monotonic: a positive verdict
//! with no usable retry-after hint is still a positive verdict.

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::domain::models::AgentExecutionResult;

/// Verdict over one finished execution.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RateLimitVerdict {
    pub is_rate_limit: bool,
    /// The matched fragment, for operator-facing messages
    pub message: Option<String>,
    /// Server-suggested wait, when one was present in the output
    pub retry_after_seconds: Option<u64>,
}

struct FamilyRule {
    family: &'static str,
    pattern: Regex,
}

/// Classifies agent output as rate-limited and extracts retry hints.
pub struct RateLimitDetector {
    /// Patterns applied to every agent family
    base_rules: Vec<Regex>,
    /// Family-specific additions
    family_rules: Vec<FamilyRule>,
    retry_after_rules: Vec<Regex>,
}

impl RateLimitDetector {
    pub fn new() -> Self {
        let re = |p: &str| Regex::new(p).expect("static detection pattern");
        Self {
            base_rules: vec![
                re(r"(?i)\b429\b"),
                re(r"(?i)too many requests"),
                re(r"(?i)rate[ _-]?limit(ed|_error)?"),
                re(r"(?i)quota (exceeded|exhausted)"),
            ],
            family_rules: vec![
                FamilyRule {
                    family: "claude_code",
                    pattern: re(r"(?i)usage limit reached|overloaded_error|hit your usage limit"),
                },
                FamilyRule {
                    family: "opencode",
                    pattern: re(r"(?i)provider (is )?rate limiting"),
                },
            ],
            retry_after_rules: vec![
                re(r"(?i)retry[ _-]?after[:\s]+(?P<secs>\d+)"),
                re(r"(?i)try again in (?P<secs>\d+)\s*s"),
                re(r#"(?i)"retry_after(?:_seconds)?"\s*:\s*(?P<secs>\d+)"#),
            ],
        }
    }

    /// Inspect a finished execution for the given agent family.
    pub fn detect(&self, result: &AgentExecutionResult, family: &str) -> RateLimitVerdict {
        // stderr is the usual channel for limit errors; stdout is checked
        // too because some CLIs report structured errors there.
        for text in [&result.stderr, &result.stdout] {
            if let Some(matched) = self.match_text(text, family) {
                return RateLimitVerdict {
                    is_rate_limit: true,
                    message: Some(matched),
                    retry_after_seconds: self.extract_retry_after(text),
                };
            }
        }

        RateLimitVerdict::default()
    }

    fn match_text(&self, text: &str, family: &str) -> Option<String> {
        for rule in &self.base_rules {
            if let Some(m) = rule.find(text) {
                return Some(snippet_around(text, m.start()));
            }
        }
        for rule in &self.family_rules {
            if rule.family == family {
                if let Some(m) = rule.pattern.find(text) {
                    return Some(snippet_around(text, m.start()));
                }
            }
        }
        None
    }

    fn extract_retry_after(&self, text: &str) -> Option<u64> {
        for rule in &self.retry_after_rules {
            if let Some(caps) = rule.captures(text) {
                if let Some(secs) = caps.name("secs") {
                    if let Ok(value) = secs.as_str().parse::<u64>() {
                        return Some(value);
                    }
                }
            }
        }
        None
    }
}

impl Default for RateLimitDetector {
    fn default() -> Self {
        Self::new()
    }
}

/// The line containing the match, trimmed for display.
fn snippet_around(text: &str, offset: usize) -> String {
    let start = text[..offset].rfind('\n').map_or(0, |i| i + 1);
    let end = text[offset..]
        .find('\n')
        .map_or(text.len(), |i| offset + i);
    text[start..end].trim().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::models::ExecutionStatus;
    use chrono::Utc;
    use uuid::Uuid;

    fn result_with(stdout: &str, stderr: &str, exit_code: i32) -> AgentExecutionResult {
        AgentExecutionResult {
            execution_id: Uuid::new_v4(),
            status: if exit_code == 0 {
                ExecutionStatus::Completed
            } else {
                ExecutionStatus::Failed
            },
            exit_code: Some(exit_code),
            stdout: stdout.to_string(),
            stderr: stderr.to_string(),
            duration_ms: 10,
            interrupted: false,
            started_at: Utc::now(),
            ended_at: Utc::now(),
            error: None,
        }
    }

    #[test]
    fn test_plain_429_detected() {
        let detector = RateLimitDetector::new();
        let verdict = detector.detect(
            &result_with("", "Error: 429 Too Many Requests", 1),
            "claude_code",
        );
        assert!(verdict.is_rate_limit);
        assert!(verdict.message.unwrap().contains("429"));
        assert_eq!(verdict.retry_after_seconds, None);
    }

    #[test]
    fn test_retry_after_hint_extracted() {
        let detector = RateLimitDetector::new();
        let verdict = detector.detect(
            &result_with("", "429 Too Many Requests. Retry after 42 seconds", 1),
            "claude_code",
        );
        assert!(verdict.is_rate_limit);
        assert_eq!(verdict.retry_after_seconds, Some(42));
    }

    #[test]
    fn test_structured_payload_on_stdout() {
        let detector = RateLimitDetector::new();
        let verdict = detector.detect(
            &result_with(
                r#"{"type":"error","error":{"type":"rate_limit_error","message":"..."},"retry_after":7}"#,
                "",
                1,
            ),
            "claude_code",
        );
        assert!(verdict.is_rate_limit);
        assert_eq!(verdict.retry_after_seconds, Some(7));
    }

    #[test]
    fn test_family_specific_pattern() {
        let detector = RateLimitDetector::new();
        let verdict = detector.detect(
            &result_with("", "You have hit your usage limit.", 1),
            "claude_code",
        );
        assert!(verdict.is_rate_limit);

        // Same text is not flagged for a family without that rule
        let verdict = detector.detect(
            &result_with("", "You have hit your usage limit.", 1),
            "opencode",
        );
        assert!(!verdict.is_rate_limit);
    }

    #[test]
    fn test_ordinary_failure_not_flagged() {
        let detector = RateLimitDetector::new();
        let verdict = detector.detect(
            &result_with("", "Error: compilation failed in src/lib.rs", 1),
            "claude_code",
        );
        assert!(!verdict.is_rate_limit);
    }
}

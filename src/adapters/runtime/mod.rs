//! Shared agent process runtime.
//!
//! Owns the subprocess lifecycle for every agent plugin: spawn with a
//! filtered environment, streamed capture with bounded in-memory retention,
//! optional JSONL parsing, stdin prompt delivery, sandbox wrapping,
//! interrupt/timeout escalation, and completion reporting. Plugins only
//! construct a [`CommandSpec`] and interpret the result.

pub mod detect;
pub mod env_filter;
pub mod tail_buffer;

pub use detect::{detect_agent, extract_version, probe_version, resolve_command};
pub use env_filter::{wildcard_match, EnvPolicy, DEFAULT_EXCLUDE_PATTERNS};
pub use tail_buffer::{TailBuffer, DEFAULT_CAP_CHARS, TRUNCATION_PREFIX};

use chrono::Utc;
use std::collections::HashMap;
use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::domain::errors::EngineResult;
use crate::domain::models::{AgentExecutionResult, ExecutionStatus, PreflightResult};
use crate::domain::ports::{
    AgentPlugin, ExecOptions, ExecutionHandle, InterruptSignal, OutputChunk, OutputStreamKind,
};

/// Grace period between SIGTERM and SIGKILL.
const KILL_GRACE: Duration = Duration::from_secs(5);

/// Default preflight timeout.
pub const PREFLIGHT_TIMEOUT: Duration = Duration::from_secs(15);

/// Prompt used by preflight checks.
pub const PREFLIGHT_PROMPT: &str = "Respond with exactly: PREFLIGHT_OK";

/// Everything a plugin contributes to one execution.
#[derive(Debug, Clone, Default)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,
    /// Prompt delivered on stdin instead of argv, when set
    pub stdin_payload: Option<String>,
    /// Whether stdout is a JSONL stream worth parsing
    pub emits_jsonl: bool,
    pub env_policy: EnvPolicy,
    /// Argv prefix wrapping the command in a sandbox, empty = no sandbox
    pub sandbox_wrapper: Vec<String>,
}

/// Start an agent subprocess and return a handle to it.
///
/// The handle resolves to an [`AgentExecutionResult`]; spawn failures are
/// reported through the result rather than the returned future so callers
/// always observe a uniform completion path.
pub fn execute(spec: CommandSpec, options: ExecOptions) -> EngineResult<ExecutionHandle> {
    let execution_id = Uuid::new_v4();
    let interrupt = InterruptSignal::new();
    let (result_tx, result_rx) = oneshot::channel();

    let supervisor_interrupt = Arc::clone(&interrupt);
    tokio::spawn(async move {
        let result = supervise(execution_id, spec, options, supervisor_interrupt).await;
        let _ = result_tx.send(result);
    });

    Ok(ExecutionHandle::new(execution_id, result_rx, interrupt))
}

async fn supervise(
    execution_id: Uuid,
    spec: CommandSpec,
    options: ExecOptions,
    interrupt: Arc<InterruptSignal>,
) -> AgentExecutionResult {
    let started_at = Utc::now();
    let start = Instant::now();

    let fail = |error: String, interrupted: bool| AgentExecutionResult {
        execution_id,
        status: if interrupted {
            ExecutionStatus::Interrupted
        } else {
            ExecutionStatus::Failed
        },
        exit_code: None,
        stdout: String::new(),
        stderr: String::new(),
        duration_ms: start.elapsed().as_millis() as u64,
        interrupted,
        started_at,
        ended_at: Utc::now(),
        error: Some(error),
    };

    // An interrupt requested before sandbox-wrap resolution reaches the
    // spawn is honored without starting the process at all.
    if interrupt.is_requested() {
        return fail("interrupted before spawn".to_string(), true);
    }

    let mut cmd = build_command(&spec);
    cmd.stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    cmd.stdin(if spec.stdin_payload.is_some() {
        Stdio::piped()
    } else {
        Stdio::null()
    });

    if let Some(ref dir) = options.working_dir {
        cmd.current_dir(dir);
    }

    let base: HashMap<String, String> = std::env::vars().collect();
    let env = spec.env_policy.build(&base, &options.env);
    cmd.env_clear();
    cmd.envs(&env);

    let mut child = match cmd.spawn() {
        Ok(child) => child,
        Err(e) => return fail(format!("failed to spawn {}: {e}", spec.program), false),
    };

    interrupt.set_running(true);
    debug!(execution_id = %execution_id, program = %spec.program, pid = ?child.id(), "Agent process spawned");

    if let Some(payload) = spec.stdin_payload.clone() {
        if let Some(mut stdin) = child.stdin.take() {
            if let Err(e) = stdin.write_all(payload.as_bytes()).await {
                warn!(execution_id = %execution_id, error = %e, "Failed to deliver prompt on stdin");
            }
            drop(stdin);
        }
    }

    let cap = if options.output_cap_chars == 0 {
        DEFAULT_CAP_CHARS
    } else {
        options.output_cap_chars
    };

    let stdout_task = child.stdout.take().map(|stream| {
        spawn_reader(
            stream,
            OutputStreamKind::Stdout,
            cap,
            options.on_output.clone(),
            spec.emits_jsonl.then(|| options.on_jsonl.clone()).flatten(),
        )
    });
    let stderr_task = child.stderr.take().map(|stream| {
        spawn_reader(
            stream,
            OutputStreamKind::Stderr,
            cap,
            options.on_output.clone(),
            None,
        )
    });

    let timeout = options.timeout.filter(|d| !d.is_zero());
    let (exit, timed_out, wait_error) = wait_with_escalation(&mut child, &interrupt, timeout).await;

    interrupt.set_running(false);

    let stdout = join_reader(stdout_task).await;
    let stderr = join_reader(stderr_task).await;

    let interrupted = interrupt.is_requested();
    let (status, exit_code, error) = match exit {
        Some(status) => {
            let code = status.code();
            let killed_by_signal = was_terminated_by_signal(&status);
            let exec_status = if interrupted {
                ExecutionStatus::Interrupted
            } else if killed_by_signal && timed_out {
                ExecutionStatus::Timeout
            } else if killed_by_signal {
                ExecutionStatus::Interrupted
            } else if code == Some(0) {
                ExecutionStatus::Completed
            } else {
                ExecutionStatus::Failed
            };
            let error = match exec_status {
                ExecutionStatus::Failed => Some(format!(
                    "agent exited with code {}",
                    code.map_or_else(|| "unknown".to_string(), |c| c.to_string())
                )),
                ExecutionStatus::Timeout => Some("agent timed out".to_string()),
                _ => None,
            };
            (exec_status, code, error)
        }
        None => (
            if interrupted {
                ExecutionStatus::Interrupted
            } else {
                ExecutionStatus::Failed
            },
            None,
            wait_error,
        ),
    };

    AgentExecutionResult {
        execution_id,
        status,
        exit_code,
        stdout,
        stderr,
        duration_ms: start.elapsed().as_millis() as u64,
        interrupted,
        started_at,
        ended_at: Utc::now(),
        error,
    }
}

/// Wait for the child, honoring interrupts and the per-execution timeout
/// with SIGTERM then SIGKILL escalation.
async fn wait_with_escalation(
    child: &mut Child,
    interrupt: &Arc<InterruptSignal>,
    timeout: Option<Duration>,
) -> (Option<std::process::ExitStatus>, bool, Option<String>) {
    let mut term_sent = false;
    let mut timed_out = false;
    let mut kill_deadline: Option<std::pin::Pin<Box<tokio::time::Sleep>>> = None;

    // One year stands in for "no timeout"; the guard keeps the branch dead.
    let timeout_sleep =
        tokio::time::sleep(timeout.unwrap_or(Duration::from_secs(365 * 24 * 3600)));
    tokio::pin!(timeout_sleep);
    let timeout_armed = timeout.is_some();

    loop {
        tokio::select! {
            status = child.wait() => {
                return match status {
                    Ok(status) => (Some(status), timed_out, None),
                    Err(e) => (None, timed_out, Some(format!("failed to wait on agent: {e}"))),
                };
            }
            () = interrupt.requested(), if !term_sent => {
                term_sent = true;
                send_term(child);
                kill_deadline = Some(Box::pin(tokio::time::sleep(KILL_GRACE)));
            }
            () = &mut timeout_sleep, if timeout_armed && !term_sent => {
                timed_out = true;
                term_sent = true;
                send_term(child);
                kill_deadline = Some(Box::pin(tokio::time::sleep(KILL_GRACE)));
            }
            () = async { kill_deadline.as_mut().expect("guarded").await }, if kill_deadline.is_some() => {
                let _ = child.start_kill();
                kill_deadline = None;
            }
        }
    }
}

#[cfg(unix)]
fn send_term(child: &Child) {
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;
    if let Some(pid) = child.id() {
        let _ = kill(Pid::from_raw(pid as i32), Signal::SIGTERM);
    }
}

#[cfg(not(unix))]
fn send_term(child: &Child) {
    // No SIGTERM analogue; escalation goes straight to kill after the grace
    // window via `start_kill`.
    let _ = child;
}

#[cfg(unix)]
fn was_terminated_by_signal(status: &std::process::ExitStatus) -> bool {
    use std::os::unix::process::ExitStatusExt;
    // SIGTERM (15) or SIGKILL (9), the two the escalation path sends
    matches!(status.signal(), Some(15 | 9))
}

#[cfg(not(unix))]
fn was_terminated_by_signal(status: &std::process::ExitStatus) -> bool {
    status.code().is_none()
}

#[cfg(windows)]
fn build_command(spec: &CommandSpec) -> Command {
    // Windows needs a shell, and commands containing spaces must be quoted.
    let mut argv: Vec<String> = Vec::new();
    argv.extend(spec.sandbox_wrapper.iter().cloned());
    argv.push(spec.program.clone());
    argv.extend(spec.args.iter().cloned());

    let line = argv
        .iter()
        .map(|part| {
            if part.contains(' ') {
                format!("\"{part}\"")
            } else {
                part.clone()
            }
        })
        .collect::<Vec<_>>()
        .join(" ");

    let mut cmd = Command::new("cmd");
    cmd.args(["/C", &line]);
    cmd
}

#[cfg(not(windows))]
fn build_command(spec: &CommandSpec) -> Command {
    if spec.sandbox_wrapper.is_empty() {
        let mut cmd = Command::new(&spec.program);
        cmd.args(&spec.args);
        cmd
    } else {
        let mut cmd = Command::new(&spec.sandbox_wrapper[0]);
        cmd.args(&spec.sandbox_wrapper[1..]);
        cmd.arg(&spec.program);
        cmd.args(&spec.args);
        cmd
    }
}

fn spawn_reader<R>(
    stream: R,
    kind: OutputStreamKind,
    cap: usize,
    on_output: Option<mpsc::UnboundedSender<OutputChunk>>,
    on_jsonl: Option<mpsc::UnboundedSender<serde_json::Value>>,
) -> JoinHandle<String>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut tail = TailBuffer::new(cap);
        let reader = BufReader::new(stream);
        let mut lines = reader.lines();

        while let Ok(Some(line)) = lines.next_line().await {
            let chunk = format!("{line}\n");
            tail.push(&chunk);
            if let Some(ref tx) = on_output {
                let _ = tx.send(OutputChunk {
                    stream: kind,
                    text: chunk,
                });
            }
            if let Some(ref tx) = on_jsonl {
                if let Ok(value) = serde_json::from_str::<serde_json::Value>(&line) {
                    let _ = tx.send(value);
                }
            }
        }

        tail.into_string()
    })
}

async fn join_reader(task: Option<JoinHandle<String>>) -> String {
    match task {
        Some(task) => task.await.unwrap_or_default(),
        None => String::new(),
    }
}

/// Shared preflight implementation: run the tiny standard prompt against a
/// plugin and report whether a sane response came back.
pub async fn run_preflight(plugin: &dyn AgentPlugin, timeout: Option<Duration>) -> PreflightResult {
    let start = Instant::now();
    let options = ExecOptions {
        timeout: Some(timeout.unwrap_or(PREFLIGHT_TIMEOUT)),
        ..Default::default()
    };

    let handle = match plugin.execute(PREFLIGHT_PROMPT, &[], options).await {
        Ok(handle) => handle,
        Err(e) => {
            return PreflightResult {
                success: false,
                duration_ms: start.elapsed().as_millis() as u64,
                error: Some(e.to_string()),
                suggestion: Some(format!(
                    "verify `{}` is installed and on PATH",
                    plugin.meta().default_command
                )),
                stdout: None,
                stderr: None,
                exit_code: None,
            }
        }
    };

    match handle.wait().await {
        Ok(result) => {
            let success = result.status == ExecutionStatus::Completed && !result.stdout.trim().is_empty();
            let suggestion = if success {
                None
            } else if result.status == ExecutionStatus::Timeout {
                Some("agent did not answer within the preflight timeout; check authentication".to_string())
            } else {
                Some(format!(
                    "run `{} --version` and check credentials",
                    plugin.meta().default_command
                ))
            };
            PreflightResult {
                success,
                duration_ms: result.duration_ms,
                error: result.error.clone(),
                suggestion,
                stdout: Some(result.stdout),
                stderr: Some(result.stderr),
                exit_code: result.exit_code,
            }
        }
        Err(e) => PreflightResult {
            success: false,
            duration_ms: start.elapsed().as_millis() as u64,
            error: Some(e.to_string()),
            suggestion: None,
            stdout: None,
            stderr: None,
            exit_code: None,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sh_spec(script: &str) -> CommandSpec {
        CommandSpec {
            program: "/bin/sh".to_string(),
            args: vec!["-c".to_string(), script.to_string()],
            ..Default::default()
        }
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_execute_captures_stdout_and_exit() {
        let handle = execute(sh_spec("echo hello; echo err >&2; exit 0"), ExecOptions::default()).unwrap();
        let result = handle.wait().await.unwrap();

        assert_eq!(result.status, ExecutionStatus::Completed);
        assert_eq!(result.exit_code, Some(0));
        assert_eq!(result.stdout, "hello\n");
        assert_eq!(result.stderr, "err\n");
        assert!(!result.interrupted);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_execute_nonzero_exit_is_failed() {
        let handle = execute(sh_spec("exit 3"), ExecOptions::default()).unwrap();
        let result = handle.wait().await.unwrap();

        assert_eq!(result.status, ExecutionStatus::Failed);
        assert_eq!(result.exit_code, Some(3));
        assert!(result.error.is_some());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_execute_timeout() {
        let options = ExecOptions {
            timeout: Some(Duration::from_millis(200)),
            ..Default::default()
        };
        let handle = execute(sh_spec("sleep 30"), options).unwrap();
        let result = handle.wait().await.unwrap();

        assert_eq!(result.status, ExecutionStatus::Timeout);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_interrupt_marks_interrupted() {
        let handle = execute(sh_spec("sleep 30"), ExecOptions::default()).unwrap();
        let signal = handle.interrupt_signal();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            signal.interrupt();
        });
        let result = handle.wait().await.unwrap();

        assert_eq!(result.status, ExecutionStatus::Interrupted);
        assert!(result.interrupted);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_pending_interrupt_before_spawn() {
        let handle = execute(sh_spec("sleep 30"), ExecOptions::default()).unwrap();
        handle.interrupt();
        // The supervisor may or may not have spawned yet; either way the
        // result must be interrupted.
        let result = handle.wait().await.unwrap();
        assert_eq!(result.status, ExecutionStatus::Interrupted);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_stdin_payload_delivery() {
        let spec = CommandSpec {
            program: "/bin/sh".to_string(),
            args: vec!["-c".to_string(), "cat".to_string()],
            stdin_payload: Some("from stdin\n".to_string()),
            ..Default::default()
        };
        let handle = execute(spec, ExecOptions::default()).unwrap();
        let result = handle.wait().await.unwrap();
        assert_eq!(result.stdout, "from stdin\n");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_jsonl_pipeline() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let spec = CommandSpec {
            program: "/bin/sh".to_string(),
            args: vec![
                "-c".to_string(),
                r#"echo '{"type":"assistant"}'; echo not-json"#.to_string(),
            ],
            emits_jsonl: true,
            ..Default::default()
        };
        let options = ExecOptions {
            on_jsonl: Some(tx),
            ..Default::default()
        };
        let handle = execute(spec, options).unwrap();
        let result = handle.wait().await.unwrap();
        assert_eq!(result.status, ExecutionStatus::Completed);

        let first = rx.recv().await.unwrap();
        assert_eq!(first["type"], "assistant");
        // Non-JSON line is skipped, channel closes after process end.
        assert!(rx.recv().await.is_none());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_spawn_failure_is_reported_via_result() {
        let spec = CommandSpec {
            program: "/no/such/binary-epicycle".to_string(),
            ..Default::default()
        };
        let handle = execute(spec, ExecOptions::default()).unwrap();
        let result = handle.wait().await.unwrap();
        assert_eq!(result.status, ExecutionStatus::Failed);
        assert!(result.error.unwrap().contains("failed to spawn"));
    }
}

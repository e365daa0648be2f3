//! Child-process client for the short-lived reviewer backend.
//!
//! Spawns the reviewer CLI with `--output-format stream-json` and parses the
//! newline-delimited JSON events it writes to stdout. The exit code is
//! authoritative; stdout content is captured regardless. Timeouts terminate
//! the child with SIGTERM, escalating to SIGKILL after a grace period, and
//! reject rather than resolve.

use serde_json::Value;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader};
use tokio::process::{Child, Command};
use tracing::{debug, warn};

/// Grace period between SIGTERM and SIGKILL.
const KILL_GRACE: Duration = Duration::from_secs(5);

#[derive(Debug, Error)]
pub enum ReviewerError {
    #[error("reviewer CLI not found at '{path}'\n  → install it or set reviewer.cli_path in config.yaml")]
    NotFound { path: String },
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("reviewer timed out after {0:?}")]
    Timeout(Duration),
    #[error("reviewer invocation cancelled")]
    Cancelled,
}

pub type Result<T> = std::result::Result<T, ReviewerError>;

/// Options for one reviewer invocation.
#[derive(Debug, Clone)]
pub struct ExecOptions {
    pub model: String,
    pub working_dir: PathBuf,
    pub system_prompt: Option<String>,
    pub timeout: Duration,
}

/// A tool call observed on the reviewer stream.
#[derive(Debug, Clone)]
pub struct ReviewerToolCall {
    pub id: String,
    pub name: String,
    pub input: Value,
    pub output: Option<Value>,
}

/// Final result of a reviewer invocation.
#[derive(Debug, Clone)]
pub struct ExecResult {
    pub success: bool,
    pub output: String,
    pub tool_calls: Vec<ReviewerToolCall>,
    pub cost_usd: Option<f64>,
    pub input_tokens: Option<u64>,
    pub output_tokens: Option<u64>,
    pub duration_ms: u64,
    pub session_id: Option<String>,
}

/// Events surfaced by `execute_stream`.
#[derive(Debug, Clone)]
pub enum ReviewerEvent {
    Init { session_id: String, tools: Vec<String> },
    Text(String),
    Thinking,
    ToolUse(ReviewerToolCall),
    ToolResult { id: String, output: Value },
    Stats { cost_usd: Option<f64>, input_tokens: Option<u64>, output_tokens: Option<u64> },
}

/// Incremental parser over the line-delimited JSON event stream.
///
/// Tolerant of blank lines and non-JSON noise; unrecognised events are
/// dropped. Accumulates text, open tool calls, and final stats.
#[derive(Debug, Default)]
pub struct StreamParser {
    pub session_id: Option<String>,
    pub tools: Vec<String>,
    pub text: String,
    pub thinking_deltas: u64,
    pub tool_calls: Vec<ReviewerToolCall>,
    pub cost_usd: Option<f64>,
    pub input_tokens: Option<u64>,
    pub output_tokens: Option<u64>,
}

impl StreamParser {
    /// Parse one stdout line, returning the event it carried (if any).
    pub fn handle_line(&mut self, line: &str) -> Option<ReviewerEvent> {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            return None;
        }
        let Ok(value) = serde_json::from_str::<Value>(trimmed) else {
            debug!(line = %trimmed, "dropping non-JSON reviewer line");
            return None;
        };

        match value.get("type").and_then(Value::as_str) {
            Some("system") => {
                if value.get("subtype").and_then(Value::as_str) == Some("init") {
                    let session_id = value
                        .get("session_id")
                        .and_then(Value::as_str)
                        .unwrap_or_default()
                        .to_string();
                    let tools = value
                        .get("tools")
                        .and_then(Value::as_array)
                        .map(|a| {
                            a.iter()
                                .filter_map(Value::as_str)
                                .map(String::from)
                                .collect()
                        })
                        .unwrap_or_default();
                    self.session_id = Some(session_id.clone());
                    self.tools.clone_from(&tools);
                    return Some(ReviewerEvent::Init { session_id, tools });
                }
                None
            }
            Some("assistant") => match value.get("subtype").and_then(Value::as_str) {
                Some("content_block_start") => {
                    let block = value.get("block")?;
                    if block.get("type").and_then(Value::as_str) != Some("tool_use") {
                        return None;
                    }
                    let call = ReviewerToolCall {
                        id: block
                            .get("id")
                            .and_then(Value::as_str)
                            .unwrap_or_default()
                            .to_string(),
                        name: block
                            .get("name")
                            .and_then(Value::as_str)
                            .unwrap_or("unknown")
                            .to_string(),
                        input: block.get("input").cloned().unwrap_or(Value::Null),
                        output: None,
                    };
                    self.tool_calls.push(call.clone());
                    Some(ReviewerEvent::ToolUse(call))
                }
                Some("content_block_delta") => {
                    let delta = value.get("delta")?;
                    match delta.get("type").and_then(Value::as_str) {
                        Some("text_delta") => {
                            let text = delta.get("text").and_then(Value::as_str)?.to_string();
                            self.text.push_str(&text);
                            Some(ReviewerEvent::Text(text))
                        }
                        Some("thinking_delta") => {
                            self.thinking_deltas += 1;
                            Some(ReviewerEvent::Thinking)
                        }
                        _ => None,
                    }
                }
                _ => None,
            },
            Some("user") => {
                let blocks = value.get("content").and_then(Value::as_array)?;
                let mut last = None;
                for block in blocks {
                    if block.get("type").and_then(Value::as_str) != Some("tool_result") {
                        continue;
                    }
                    let id = block
                        .get("tool_use_id")
                        .and_then(Value::as_str)
                        .unwrap_or_default()
                        .to_string();
                    let output = block.get("content").cloned().unwrap_or(Value::Null);
                    if let Some(open) = self
                        .tool_calls
                        .iter_mut()
                        .find(|c| c.id == id && c.output.is_none())
                    {
                        open.output = Some(output.clone());
                    }
                    last = Some(ReviewerEvent::ToolResult { id, output });
                }
                last
            }
            Some("result") => {
                self.cost_usd = value.get("total_cost_usd").and_then(Value::as_f64);
                self.input_tokens = value.get("input_tokens").and_then(Value::as_u64);
                self.output_tokens = value.get("output_tokens").and_then(Value::as_u64);
                Some(ReviewerEvent::Stats {
                    cost_usd: self.cost_usd,
                    input_tokens: self.input_tokens,
                    output_tokens: self.output_tokens,
                })
            }
            _ => {
                debug!("dropping unrecognised reviewer event");
                None
            }
        }
    }
}

/// Typed client wrapping the reviewer CLI.
#[derive(Debug)]
pub struct ReviewerClient {
    cli_path: String,
    /// Pids of in-flight children, terminated by `abort`.
    active: Arc<Mutex<Vec<u32>>>,
}

impl ReviewerClient {
    pub fn new(cli_path: &str) -> Self {
        Self {
            cli_path: cli_path.to_string(),
            active: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn cli_path(&self) -> &str {
        &self.cli_path
    }

    /// Run one reviewer invocation to completion.
    pub async fn execute(&self, prompt: &str, options: &ExecOptions) -> Result<ExecResult> {
        self.execute_with_cancel(prompt, options, &tokio_util::sync::CancellationToken::new())
            .await
    }

    /// Run one reviewer invocation, terminating the child (SIGTERM, then
    /// SIGKILL after the grace period) if `cancel` fires first.
    pub async fn execute_with_cancel(
        &self,
        prompt: &str,
        options: &ExecOptions,
        cancel: &tokio_util::sync::CancellationToken,
    ) -> Result<ExecResult> {
        let start = std::time::Instant::now();

        let mut child = self.spawn(prompt, options)?;
        let pid = child.id();
        if let Some(pid) = pid {
            self.active.lock().expect("active lock poisoned").push(pid);
        }

        let result = self
            .drive_child(&mut child, options.timeout, None, cancel)
            .await;

        if let Some(pid) = pid {
            self.active
                .lock()
                .expect("active lock poisoned")
                .retain(|p| *p != pid);
        }

        let (parser, exit_code, stderr) = result?;
        Ok(Self::finish(parser, exit_code, stderr, start))
    }

    fn spawn(&self, prompt: &str, options: &ExecOptions) -> Result<Child> {
        let mut cmd = Command::new(&self.cli_path);
        cmd.arg("-p")
            .arg(prompt)
            .arg("--output-format")
            .arg("stream-json")
            .arg("--model")
            .arg(&options.model)
            .current_dir(&options.working_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(system) = &options.system_prompt {
            cmd.arg("--system-prompt").arg(system);
        }

        cmd.spawn().map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                ReviewerError::NotFound {
                    path: self.cli_path.clone(),
                }
            } else {
                ReviewerError::Io(e)
            }
        })
    }

    fn finish(
        parser: StreamParser,
        exit_code: i32,
        stderr: String,
        start: std::time::Instant,
    ) -> ExecResult {
        let success = exit_code == 0;
        let output = if success || stderr.trim().is_empty() {
            parser.text.clone()
        } else {
            // Exit code is authoritative; surface stderr as the output.
            stderr
        };

        ExecResult {
            success,
            output,
            tool_calls: parser.tool_calls,
            cost_usd: parser.cost_usd,
            input_tokens: parser.input_tokens,
            output_tokens: parser.output_tokens,
            duration_ms: start.elapsed().as_millis() as u64,
            session_id: parser.session_id,
        }
    }

    /// Run an invocation, forwarding events to `events` as they arrive.
    ///
    /// Same contract as `execute`; the sender sees each stream event before
    /// the final result resolves. A dropped receiver does not stop the run.
    pub async fn execute_stream(
        &self,
        prompt: &str,
        options: &ExecOptions,
        events: tokio::sync::mpsc::UnboundedSender<ReviewerEvent>,
    ) -> Result<ExecResult> {
        let start = std::time::Instant::now();

        let mut child = self.spawn(prompt, options)?;
        let pid = child.id();
        if let Some(pid) = pid {
            self.active.lock().expect("active lock poisoned").push(pid);
        }

        let result = self
            .drive_child(
                &mut child,
                options.timeout,
                Some(&events),
                &tokio_util::sync::CancellationToken::new(),
            )
            .await;

        if let Some(pid) = pid {
            self.active
                .lock()
                .expect("active lock poisoned")
                .retain(|p| *p != pid);
        }

        let (parser, exit_code, stderr) = result?;
        Ok(Self::finish(parser, exit_code, stderr, start))
    }

    /// Terminate any in-flight reviewer process.
    pub fn abort(&self) {
        let pids: Vec<u32> = self
            .active
            .lock()
            .expect("active lock poisoned")
            .drain(..)
            .collect();
        for pid in pids {
            terminate_pid(pid);
            tokio::spawn(async move {
                tokio::time::sleep(KILL_GRACE).await;
                kill_pid(pid);
            });
        }
    }

    /// Read the child's stream until exit, deadline, or cancellation.
    async fn drive_child(
        &self,
        child: &mut Child,
        timeout: Duration,
        events: Option<&tokio::sync::mpsc::UnboundedSender<ReviewerEvent>>,
        cancel: &tokio_util::sync::CancellationToken,
    ) -> Result<(StreamParser, i32, String)> {
        let stdout = child.stdout.take().expect("stdout piped");
        let stderr = child.stderr.take().expect("stderr piped");

        let stderr_task = tokio::spawn(async move {
            let mut buf = String::new();
            let mut reader = BufReader::new(stderr);
            let _ = reader.read_to_string(&mut buf).await;
            buf
        });

        let mut parser = StreamParser::default();
        let mut lines = BufReader::new(stdout).lines();
        let deadline = tokio::time::Instant::now() + timeout;

        loop {
            tokio::select! {
                line = lines.next_line() => match line? {
                    Some(line) => {
                        if let Some(event) = parser.handle_line(&line) {
                            if let Some(tx) = events {
                                let _ = tx.send(event);
                            }
                        }
                    }
                    None => break,
                },
                () = cancel.cancelled() => {
                    terminate_child(child).await;
                    stderr_task.abort();
                    return Err(ReviewerError::Cancelled);
                }
                () = tokio::time::sleep_until(deadline) => {
                    warn!(timeout_sec = timeout.as_secs(), "reviewer timed out");
                    terminate_child(child).await;
                    stderr_task.abort();
                    return Err(ReviewerError::Timeout(timeout));
                }
            }
        }

        let status = tokio::select! {
            status = child.wait() => status?,
            () = cancel.cancelled() => {
                terminate_child(child).await;
                stderr_task.abort();
                return Err(ReviewerError::Cancelled);
            }
            () = tokio::time::sleep_until(deadline) => {
                terminate_child(child).await;
                stderr_task.abort();
                return Err(ReviewerError::Timeout(timeout));
            }
        };

        let stderr = stderr_task.await.unwrap_or_default();
        Ok((parser, status.code().unwrap_or(-1), stderr))
    }
}

/// SIGTERM the child, then SIGKILL after the grace period.
async fn terminate_child(child: &mut Child) {
    if let Some(pid) = child.id() {
        terminate_pid(pid);
        let graceful = tokio::time::timeout(KILL_GRACE, child.wait()).await;
        if graceful.is_err() {
            let _ = child.kill().await;
        }
        let _ = child.wait().await;
    } else {
        let _ = child.kill().await;
    }
}

#[cfg(unix)]
fn terminate_pid(pid: u32) {
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;
    let _ = kill(Pid::from_raw(pid as i32), Signal::SIGTERM);
}

#[cfg(not(unix))]
fn terminate_pid(pid: u32) {
    // No SIGTERM equivalent; the grace-period kill handles it.
    let _ = pid;
}

#[cfg(unix)]
fn kill_pid(pid: u32) {
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;
    let _ = kill(Pid::from_raw(pid as i32), Signal::SIGKILL);
}

#[cfg(not(unix))]
fn kill_pid(pid: u32) {
    let _ = pid;
}

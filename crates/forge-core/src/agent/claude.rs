//! [`Agent`] adapter for the Claude Code CLI.
//!
//! Spawns `claude --print --output-format stream-json` and parses its
//! line-oriented JSON output into text fragments. The stream format has
//! evolved over time, so the parser tolerates unknown shapes: anything it
//! does not recognize is logged and skipped, never fatal.

use std::process::Stdio;
use std::time::Instant;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::{Agent, AgentError, AgentRequest, AgentRun, ChunkFn};

/// Line buffer capacity. Content blocks can run long; anything below
/// 1 MiB risks splitting a line mid-JSON.
const STREAM_BUF_CAPACITY: usize = 1024 * 1024;

/// Grace period between SIGTERM and SIGKILL.
const KILL_GRACE: std::time::Duration = std::time::Duration::from_secs(5);

/// Adapter for the [Claude Code](https://docs.anthropic.com/en/docs/claude-code) CLI.
#[derive(Debug, Clone)]
pub struct ClaudeAdapter {
    /// Path to the `claude` binary. Defaults to `"claude"` (found via `$PATH`).
    binary_path: String,
}

impl ClaudeAdapter {
    pub fn new() -> Self {
        Self {
            binary_path: "claude".to_string(),
        }
    }

    /// Use a custom binary path. Useful for testing or non-standard
    /// installs.
    pub fn with_binary(path: impl Into<String>) -> Self {
        Self {
            binary_path: path.into(),
        }
    }
}

impl Default for ClaudeAdapter {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Stream parsing
// ---------------------------------------------------------------------------

/// One parsed line of the stream.
#[derive(Debug, Clone, PartialEq)]
enum StreamItem {
    /// A text fragment to forward to the chunk callback.
    Text(String),
    /// The final result line: the assembled text (which would duplicate
    /// the fragments) plus usage counters.
    Result {
        input_tokens: Option<u64>,
        output_tokens: Option<u64>,
        turns: Option<u32>,
    },
    /// A control line with nothing to emit.
    Ignored,
}

/// Parse one line of stream-json output. Shapes are tried in order and the
/// first match wins:
///
/// 1. `{delta: {text: T}}`
/// 2. `{message: {content: [{text: T1}, {text: T2}, ...]}}`
/// 3. `{type: "result"}` -- emits nothing (the full text would duplicate)
/// 4. `{content_block: {text: T}}` with non-empty T
///
/// Returns `None` for lines that are not valid JSON; callers treat those
/// as opaque.
fn parse_stream_line(line: &str) -> Option<StreamItem> {
    let v: serde_json::Value = match serde_json::from_str(line) {
        Ok(v) => v,
        Err(_) => return None,
    };

    if let Some(text) = v
        .get("delta")
        .and_then(|d| d.get("text"))
        .and_then(|t| t.as_str())
    {
        return Some(StreamItem::Text(text.to_string()));
    }

    if let Some(content) = v
        .get("message")
        .and_then(|m| m.get("content"))
        .and_then(|c| c.as_array())
    {
        let mut assembled = String::new();
        for block in content {
            if let Some(text) = block.get("text").and_then(|t| t.as_str()) {
                assembled.push_str(text);
            }
        }
        if !assembled.is_empty() {
            return Some(StreamItem::Text(assembled));
        }
        return Some(StreamItem::Ignored);
    }

    let event_type = v.get("type").and_then(|t| t.as_str()).unwrap_or("");
    if event_type == "result" {
        let usage = v.get("usage");
        return Some(StreamItem::Result {
            input_tokens: usage
                .and_then(|u| u.get("input_tokens"))
                .and_then(|n| n.as_u64()),
            output_tokens: usage
                .and_then(|u| u.get("output_tokens"))
                .and_then(|n| n.as_u64()),
            turns: v
                .get("num_turns")
                .and_then(|n| n.as_u64())
                .map(|n| n as u32),
        });
    }

    if let Some(text) = v
        .get("content_block")
        .and_then(|b| b.get("text"))
        .and_then(|t| t.as_str())
    {
        if !text.is_empty() {
            return Some(StreamItem::Text(text.to_string()));
        }
    }

    match event_type {
        "system" | "user" | "assistant" | "message_start" | "message_stop" => {}
        other => {
            debug!(event_type = other, "ignoring unrecognized stream-json line");
        }
    }
    Some(StreamItem::Ignored)
}

// ---------------------------------------------------------------------------
// Process control
// ---------------------------------------------------------------------------

/// SIGTERM, a short grace, then SIGKILL.
async fn terminate(child: &mut Child) {
    #[cfg(unix)]
    if let Some(pid) = child.id() {
        // SAFETY: pid belongs to a child we spawned.
        let ret = unsafe { libc::kill(pid as i32, libc::SIGTERM) };
        if ret != 0 {
            warn!(pid, "SIGTERM failed, proceeding to SIGKILL");
        }
    }

    match tokio::time::timeout(KILL_GRACE, child.wait()).await {
        Ok(Ok(_status)) => {
            debug!("agent process exited after SIGTERM");
        }
        _ => {
            debug!("agent process did not exit in grace period, killing");
            let _ = child.kill().await;
        }
    }
}

// ---------------------------------------------------------------------------
// Agent impl
// ---------------------------------------------------------------------------

#[async_trait]
impl Agent for ClaudeAdapter {
    fn name(&self) -> &str {
        "claude-code"
    }

    async fn check_available(&self) -> Result<(), AgentError> {
        let result = Command::new(&self.binary_path)
            .arg("--version")
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await;

        match result {
            Ok(status) if status.success() => Ok(()),
            Ok(status) => Err(AgentError::NotAvailable(format!(
                "{} --version exited with {status}",
                self.binary_path
            ))),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(AgentError::NotAvailable(
                format!("{} not found on PATH", self.binary_path),
            )),
            Err(e) => Err(AgentError::Spawn(e)),
        }
    }

    async fn execute(
        &self,
        req: &AgentRequest,
        cancel: &CancellationToken,
        on_chunk: &ChunkFn<'_>,
    ) -> Result<AgentRun, AgentError> {
        if cancel.is_cancelled() {
            return Err(AgentError::Cancelled);
        }

        let start = Instant::now();
        let deadline = tokio::time::Instant::now() + req.timeout;

        let mut cmd = Command::new(&self.binary_path);
        cmd.arg("--print")
            .arg("--output-format")
            .arg("stream-json")
            .arg("--verbose");

        if let Some(ref model) = req.model {
            cmd.arg("--model").arg(model);
        }
        if let Some(max_turns) = req.max_turns {
            cmd.arg("--max-turns").arg(max_turns.to_string());
        }
        if let Some(ref system_prompt) = req.system_prompt {
            cmd.arg("--system-prompt").arg(system_prompt);
        }
        if !req.allowed_tools.is_empty() {
            cmd.arg("--allowedTools").arg(req.allowed_tools.join(","));
        }
        cmd.arg("--prompt").arg(&req.prompt);

        cmd.current_dir(&req.working_dir);
        // Inherit the current environment, then overlay the configured vars.
        for (key, value) in &req.env_vars {
            cmd.env(key, value);
        }

        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd.spawn().map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                AgentError::NotAvailable(format!("{} not found on PATH", self.binary_path))
            } else {
                AgentError::Spawn(e)
            }
        })?;

        let stdout = child.stdout.take().ok_or_else(|| {
            AgentError::Spawn(std::io::Error::other("agent stdout not captured"))
        })?;
        let stderr = child.stderr.take();

        // Drain stderr concurrently so the child cannot block on a full pipe.
        let stderr_task = tokio::spawn(async move {
            use tokio::io::AsyncReadExt;
            let mut buf = Vec::new();
            if let Some(mut pipe) = stderr {
                let _ = pipe.read_to_end(&mut buf).await;
            }
            String::from_utf8_lossy(&buf).into_owned()
        });

        let mut lines = BufReader::with_capacity(STREAM_BUF_CAPACITY, stdout).lines();
        let mut run = AgentRun::default();

        loop {
            let line = tokio::select! {
                line = lines.next_line() => line,
                _ = tokio::time::sleep_until(deadline) => {
                    terminate(&mut child).await;
                    return Err(AgentError::Timeout(req.timeout));
                }
                _ = cancel.cancelled() => {
                    terminate(&mut child).await;
                    return Err(AgentError::Cancelled);
                }
            };

            match line {
                Ok(Some(line)) => {
                    let trimmed = line.trim();
                    if trimmed.is_empty() {
                        continue;
                    }
                    match parse_stream_line(trimmed) {
                        Some(StreamItem::Text(fragment)) => {
                            on_chunk(&fragment);
                            run.text.push_str(&fragment);
                        }
                        Some(StreamItem::Result {
                            input_tokens,
                            output_tokens,
                            turns,
                        }) => {
                            run.input_tokens = input_tokens.or(run.input_tokens);
                            run.output_tokens = output_tokens.or(run.output_tokens);
                            run.turns = turns.or(run.turns);
                        }
                        Some(StreamItem::Ignored) => {}
                        None => {
                            debug!(line = trimmed, "skipping non-JSON line from agent");
                        }
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    terminate(&mut child).await;
                    return Err(AgentError::Io(e));
                }
            }
        }

        let status = tokio::select! {
            status = child.wait() => status.map_err(AgentError::Spawn)?,
            _ = tokio::time::sleep_until(deadline) => {
                terminate(&mut child).await;
                return Err(AgentError::Timeout(req.timeout));
            }
            _ = cancel.cancelled() => {
                terminate(&mut child).await;
                return Err(AgentError::Cancelled);
            }
        };

        let stderr_text = stderr_task.await.unwrap_or_default();

        if !status.success() {
            return Err(AgentError::ExitNonZero {
                code: status.code().unwrap_or(-1),
                stderr: stderr_text,
            });
        }

        run.duration = start.elapsed();
        Ok(run)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

//! Test/build command runner.
//!
//! Executes a user-configured command in the project root and reports
//! pass/fail with the combined output. Commands are tokenized on
//! whitespace only; there is no shell interpretation.

use std::path::Path;
use std::process::Stdio;
use std::time::Instant;

use thiserror::Error;
use tokio::io::AsyncReadExt;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// The result of one gate command.
#[derive(Debug, Clone)]
pub struct CheckResult {
    /// Whether the command exited zero.
    pub passed: bool,
    /// The real exit code; signal termination maps to 1.
    pub exit_code: i32,
    /// Combined stdout+stderr.
    pub output: String,
    pub duration_seconds: f64,
}

impl CheckResult {
    /// The result of an empty (unconfigured) command: a passing no-op.
    fn noop() -> Self {
        Self {
            passed: true,
            exit_code: 0,
            output: String::new(),
            duration_seconds: 0.0,
        }
    }
}

/// Errors from running a gate command.
#[derive(Debug, Error)]
pub enum CheckError {
    #[error("failed to execute {command:?}: {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("check {command:?} cancelled")]
    Cancelled { command: String },
}

/// Run `command` with the working directory set to `working_dir`.
///
/// An empty command returns `passed = true` without spawning anything.
pub async fn run_check(
    command: &str,
    working_dir: &Path,
    cancel: &CancellationToken,
) -> Result<CheckResult, CheckError> {
    let mut tokens = command.split_whitespace();
    let Some(program) = tokens.next() else {
        return Ok(CheckResult::noop());
    };

    if cancel.is_cancelled() {
        return Err(CheckError::Cancelled {
            command: command.to_string(),
        });
    }

    debug!(command, dir = %working_dir.display(), "running check");
    let start = Instant::now();

    let mut child = Command::new(program)
        .args(tokens)
        .current_dir(working_dir)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| CheckError::Spawn {
            command: command.to_string(),
            source: e,
        })?;

    // Drain both pipes while waiting so the child cannot block on a full
    // pipe buffer.
    let mut stdout_pipe = child.stdout.take();
    let mut stderr_pipe = child.stderr.take();

    let read_stdout = async {
        let mut buf = Vec::new();
        if let Some(ref mut pipe) = stdout_pipe {
            pipe.read_to_end(&mut buf).await.ok();
        }
        String::from_utf8_lossy(&buf).into_owned()
    };

    let read_stderr = async {
        let mut buf = Vec::new();
        if let Some(ref mut pipe) = stderr_pipe {
            pipe.read_to_end(&mut buf).await.ok();
        }
        String::from_utf8_lossy(&buf).into_owned()
    };

    let joined = async { tokio::join!(child.wait(), read_stdout, read_stderr) };

    let (wait_result, stdout, stderr) = tokio::select! {
        result = joined => result,
        _ = cancel.cancelled() => {
            return Err(CheckError::Cancelled {
                command: command.to_string(),
            });
        }
    };

    let status = wait_result.map_err(|e| CheckError::Spawn {
        command: command.to_string(),
        source: e,
    })?;

    let mut output = stdout;
    output.push_str(&stderr);

    let exit_code = status.code().unwrap_or(1);

    Ok(CheckResult {
        passed: exit_code == 0,
        exit_code,
        output,
        duration_seconds: start.elapsed().as_secs_f64(),
    })
}

//! Engine event bus.
//!
//! The engine emits a [`TaskEvent`] on every observable transition. The
//! handler is a single callback supplied by the caller; there is no
//! backpressure, so handlers must be non-blocking or buffer internally.
//! Events carry owned data only, never references to mutable state.

use std::fmt;
use std::sync::Arc;

use chrono::Utc;
use serde::{Deserialize, Serialize};

/// The kind of an observable transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskEventKind {
    TaskStart,
    BranchCreated,
    ClaudeStart,
    ClaudeChunk,
    ClaudeDone,
    TestStart,
    TestPassed,
    TestFailed,
    BuildStart,
    BuildPassed,
    BuildFailed,
    Retry,
    Commit,
    Push,
    TaskDone,
    TaskFailed,
    TaskSkipped,
    Error,
}

impl fmt::Display for TaskEventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::TaskStart => "task_start",
            Self::BranchCreated => "branch_created",
            Self::ClaudeStart => "claude_start",
            Self::ClaudeChunk => "claude_chunk",
            Self::ClaudeDone => "claude_done",
            Self::TestStart => "test_start",
            Self::TestPassed => "test_passed",
            Self::TestFailed => "test_failed",
            Self::BuildStart => "build_start",
            Self::BuildPassed => "build_passed",
            Self::BuildFailed => "build_failed",
            Self::Retry => "retry",
            Self::Commit => "commit",
            Self::Push => "push",
            Self::TaskDone => "task_done",
            Self::TaskFailed => "task_failed",
            Self::TaskSkipped => "task_skipped",
            Self::Error => "error",
        };
        f.write_str(s)
    }
}

/// One observable transition of one task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskEvent {
    pub task_id: String,
    pub kind: TaskEventKind,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    pub timestamp_ms: i64,
}

impl TaskEvent {
    pub fn new(task_id: impl Into<String>, kind: TaskEventKind, message: impl Into<String>) -> Self {
        Self {
            task_id: task_id.into(),
            kind,
            message: message.into(),
            detail: None,
            timestamp_ms: Utc::now().timestamp_millis(),
        }
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }
}

/// The caller-supplied event handler.
pub type EventSink = Arc<dyn Fn(TaskEvent) + Send + Sync>;

/// A sink that drops every event, for callers that do not observe.
pub fn null_sink() -> EventSink {
    Arc::new(|_event| {})
}

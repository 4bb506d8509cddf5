//! Version-control adapter.
//!
//! The [`Git`] trait is a pure capability interface invoked only by the
//! engine. Implementations must not interpret command output beyond
//! success/failure and the returned value; errors carry the combined
//! stdout+stderr for diagnostics.

pub mod cli;

use async_trait::async_trait;
use std::path::PathBuf;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

pub use cli::CliGit;

/// Errors from git operations.
#[derive(Debug, Error)]
pub enum GitError {
    /// The target path is not a git repository.
    #[error("not a git repository: {0}")]
    NotARepo(PathBuf),

    /// The git binary could not be executed.
    #[error("failed to run git {command}: {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    /// git exited non-zero. `output` is the combined stdout+stderr.
    #[error("git {command} failed (exit {code}): {output}")]
    Exit {
        command: String,
        code: i32,
        output: String,
    },

    /// The cancellation scope tripped while the command was running.
    #[error("git {command} cancelled")]
    Cancelled { command: String },
}

/// Capability interface over the host version-control tool.
///
/// Object-safe so the engine can hold `Arc<dyn Git>` and tests can
/// substitute mocks.
#[async_trait]
pub trait Git: Send + Sync {
    /// Branch HEAD currently points at.
    async fn current_branch(&self, cancel: &CancellationToken) -> Result<String, GitError>;

    /// Whether a local ref with this name exists. Missing is `false`,
    /// never an error.
    async fn branch_exists(
        &self,
        name: &str,
        cancel: &CancellationToken,
    ) -> Result<bool, GitError>;

    /// Create a branch from `base` and check it out.
    async fn create_branch(
        &self,
        name: &str,
        base: &str,
        cancel: &CancellationToken,
    ) -> Result<(), GitError>;

    async fn checkout_branch(
        &self,
        name: &str,
        cancel: &CancellationToken,
    ) -> Result<(), GitError>;

    /// Stage the entire worktree.
    async fn stage_all(&self, cancel: &CancellationToken) -> Result<(), GitError>;

    /// Whether the staged diff is non-empty.
    async fn has_staged_changes(&self, cancel: &CancellationToken) -> Result<bool, GitError>;

    /// Whether the porcelain status is non-empty.
    async fn has_unstaged_changes(&self, cancel: &CancellationToken) -> Result<bool, GitError>;

    /// Create a commit from the staged changes. Returns the new HEAD SHA.
    async fn commit(
        &self,
        message: &str,
        cancel: &CancellationToken,
    ) -> Result<String, GitError>;

    /// Push HEAD to origin, setting the upstream.
    async fn push(&self, cancel: &CancellationToken) -> Result<(), GitError>;

    /// Merge `branch` into the current branch with `--no-ff`.
    async fn merge(&self, branch: &str, cancel: &CancellationToken) -> Result<(), GitError>;

    /// SHA of HEAD.
    async fn latest_sha(&self, cancel: &CancellationToken) -> Result<String, GitError>;

    /// Discard the worktree back to HEAD.
    async fn reset_hard(&self, cancel: &CancellationToken) -> Result<(), GitError>;

    /// Delete a local branch. Fails for the current branch or an unknown
    /// name.
    async fn delete_branch(
        &self,
        name: &str,
        cancel: &CancellationToken,
    ) -> Result<(), GitError>;

    /// Whether any remote is configured.
    async fn has_remote(&self, cancel: &CancellationToken) -> Result<bool, GitError>;
}

// ---------------------------------------------------------------------------
// Branch naming
// ---------------------------------------------------------------------------

/// Characters git refuses in ref names; each is replaced with `-`.
const FORBIDDEN: &[char] = &[
    ' ', '~', '^', ':', '\\', '?', '*', '[', ']', '@', '{', '}',
];

/// Make a candidate branch name safe for git.
///
/// Replaces forbidden characters with `-`, collapses runs of `.` into a
/// single `.`, trims a leading `.`, and strips a trailing `.lock`.
pub fn sanitize_branch(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    let mut prev_dot = false;
    for ch in name.chars() {
        if FORBIDDEN.contains(&ch) {
            out.push('-');
            prev_dot = false;
        } else if ch == '.' {
            if !prev_dot {
                out.push('.');
            }
            prev_dot = true;
        } else {
            out.push(ch);
            prev_dot = false;
        }
    }

    let out = out.strip_prefix('.').unwrap_or(&out);
    let out = out.strip_suffix(".lock").unwrap_or(out);
    out.to_string()
}

/// Substitute `{id}` in the branch pattern, then sanitize.
pub fn expand_branch(pattern: &str, task_id: &str) -> String {
    sanitize_branch(&pattern.replace("{id}", task_id))
}

/// The standard commit message for a completed task.
pub fn commit_message(task_id: &str, title: &str) -> String {
    format!("forge: {task_id} — {title}")
}

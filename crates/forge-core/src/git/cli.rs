//! [`Git`] implementation that shells out to the `git` binary.

use std::path::{Path, PathBuf};
use std::process::Stdio;

use async_trait::async_trait;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::{Git, GitError};

/// Runs `git` subcommands in a fixed repository root.
#[derive(Debug, Clone)]
pub struct CliGit {
    repo_path: PathBuf,
}

impl CliGit {
    /// Create an adapter for the repository at `repo_path`.
    ///
    /// Verifies the path is inside a git repository with
    /// `git rev-parse --git-dir`.
    pub fn new(repo_path: impl Into<PathBuf>) -> Result<Self, GitError> {
        let repo_path = repo_path.into();

        let output = std::process::Command::new("git")
            .args(["rev-parse", "--git-dir"])
            .current_dir(&repo_path)
            .output()
            .map_err(|e| GitError::Spawn {
                command: "rev-parse --git-dir".into(),
                source: e,
            })?;

        if !output.status.success() {
            return Err(GitError::NotARepo(repo_path));
        }

        Ok(Self { repo_path })
    }

    pub fn repo_path(&self) -> &Path {
        &self.repo_path
    }

    /// Spawn `git <args>` and wait under the cancellation scope.
    ///
    /// Returns the exit code and combined stdout+stderr without judging
    /// success; callers decide what non-zero means.
    async fn exec(
        &self,
        args: &[&str],
        cancel: &CancellationToken,
    ) -> Result<(i32, String), GitError> {
        let command = args.join(" ");
        if cancel.is_cancelled() {
            return Err(GitError::Cancelled { command });
        }
        debug!(command = %command, "running git");

        let mut cmd = Command::new("git");
        cmd.args(args)
            .current_dir(&self.repo_path)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let child = cmd.spawn().map_err(|e| GitError::Spawn {
            command: command.clone(),
            source: e,
        })?;

        let output = tokio::select! {
            out = child.wait_with_output() => out.map_err(|e| GitError::Spawn {
                command: command.clone(),
                source: e,
            })?,
            _ = cancel.cancelled() => {
                // Dropping the in-flight future kills the child.
                return Err(GitError::Cancelled { command });
            }
        };

        let mut combined = String::from_utf8_lossy(&output.stdout).into_owned();
        combined.push_str(&String::from_utf8_lossy(&output.stderr));

        Ok((output.status.code().unwrap_or(-1), combined))
    }

    /// Like [`Self::exec`] but maps non-zero exits to [`GitError::Exit`].
    async fn run(&self, args: &[&str], cancel: &CancellationToken) -> Result<String, GitError> {
        let (code, output) = self.exec(args, cancel).await?;
        if code != 0 {
            return Err(GitError::Exit {
                command: args.join(" "),
                code,
                output,
            });
        }
        Ok(output)
    }
}

#[async_trait]
impl Git for CliGit {
    async fn current_branch(&self, cancel: &CancellationToken) -> Result<String, GitError> {
        let out = self
            .run(&["rev-parse", "--abbrev-ref", "HEAD"], cancel)
            .await?;
        Ok(out.trim().to_string())
    }

    async fn branch_exists(
        &self,
        name: &str,
        cancel: &CancellationToken,
    ) -> Result<bool, GitError> {
        let refname = format!("refs/heads/{name}");
        let (code, _) = self
            .exec(&["rev-parse", "--verify", "--quiet", &refname], cancel)
            .await?;
        Ok(code == 0)
    }

    async fn create_branch(
        &self,
        name: &str,
        base: &str,
        cancel: &CancellationToken,
    ) -> Result<(), GitError> {
        self.run(&["checkout", "-b", name, base], cancel).await?;
        Ok(())
    }

    async fn checkout_branch(
        &self,
        name: &str,
        cancel: &CancellationToken,
    ) -> Result<(), GitError> {
        self.run(&["checkout", name], cancel).await?;
        Ok(())
    }

    async fn stage_all(&self, cancel: &CancellationToken) -> Result<(), GitError> {
        // The runner's own bookkeeping under .forge/ never belongs in a
        // task commit.
        self.run(&["add", "-A", "--", ".", ":(exclude).forge"], cancel)
            .await?;
        Ok(())
    }

    async fn has_staged_changes(&self, cancel: &CancellationToken) -> Result<bool, GitError> {
        // --quiet exits 1 when the staged diff is non-empty.
        let (code, output) = self.exec(&["diff", "--cached", "--quiet"], cancel).await?;
        match code {
            0 => Ok(false),
            1 => Ok(true),
            _ => Err(GitError::Exit {
                command: "diff --cached --quiet".into(),
                code,
                output,
            }),
        }
    }

    async fn has_unstaged_changes(&self, cancel: &CancellationToken) -> Result<bool, GitError> {
        let out = self.run(&["status", "--porcelain"], cancel).await?;
        Ok(!out.trim().is_empty())
    }

    async fn commit(
        &self,
        message: &str,
        cancel: &CancellationToken,
    ) -> Result<String, GitError> {
        self.run(&["commit", "-m", message], cancel).await?;
        self.latest_sha(cancel).await
    }

    async fn push(&self, cancel: &CancellationToken) -> Result<(), GitError> {
        self.run(&["push", "--set-upstream", "origin", "HEAD"], cancel)
            .await?;
        Ok(())
    }

    async fn merge(&self, branch: &str, cancel: &CancellationToken) -> Result<(), GitError> {
        self.run(&["merge", "--no-ff", branch], cancel).await?;
        Ok(())
    }

    async fn latest_sha(&self, cancel: &CancellationToken) -> Result<String, GitError> {
        let out = self.run(&["rev-parse", "HEAD"], cancel).await?;
        Ok(out.trim().to_string())
    }

    async fn reset_hard(&self, cancel: &CancellationToken) -> Result<(), GitError> {
        self.run(&["reset", "--hard", "HEAD"], cancel).await?;
        // Untracked residue counts as worktree state too; keep the runner's
        // own bookkeeping out of the sweep.
        self.run(&["clean", "-fd", "-e", ".forge"], cancel).await?;
        Ok(())
    }

    async fn delete_branch(
        &self,
        name: &str,
        cancel: &CancellationToken,
    ) -> Result<(), GitError> {
        self.run(&["branch", "-D", name], cancel).await?;
        Ok(())
    }

    async fn has_remote(&self, cancel: &CancellationToken) -> Result<bool, GitError> {
        let out = self.run(&["remote"], cancel).await?;
        Ok(!out.trim().is_empty())
    }
}

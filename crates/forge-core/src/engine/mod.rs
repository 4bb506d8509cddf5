//! The execution engine: runs a validated task graph to completion.
//!
//! The scheduler is strictly sequential -- every task shares one working
//! tree, so exactly one task is `in_progress` at any moment and the tree
//! always returns to the base branch between tasks. Each task runs a
//! branch / agent / verify / commit state machine with bounded retries;
//! task-level outcomes flow back as [`TaskOutcome`] values and only fatal
//! conditions (store failure, losing the base branch, cancellation) abort
//! the run.

pub mod events;

use std::sync::{Arc, Mutex};
use std::time::Instant;

use chrono::Utc;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use forge_state::{Phase, State, Store, StoreError, TaskStatus};

use crate::agent::{Agent, AgentError, AgentRequest};
use crate::check::{CheckError, run_check};
use crate::git::{self, Git, GitError};
use crate::prompt;

use events::{EventSink, TaskEvent, TaskEventKind};

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

/// Errors that abort the whole run. Everything task-scoped is reported
/// through [`TaskOutcome`] and events instead.
#[derive(Debug, Error)]
pub enum EngineError {
    /// A startup precondition does not hold (maps to exit code 3).
    #[error("startup invariant violated: {0}")]
    Startup(String),

    /// The run was cancelled (maps to exit code 2).
    #[error("run cancelled")]
    Cancelled,

    /// The store could not persist a transition.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// The working tree could not be returned to the base branch; a
    /// subsequent task would fork from an unintended parent.
    #[error("failed to return to base branch {branch}: {source}")]
    BaseBranch {
        branch: String,
        #[source]
        source: GitError,
    },

    /// An internal invariant broke mid-run.
    #[error("fatal engine error: {0}")]
    Fatal(String),
}

/// Terminal result of one task's state machine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskOutcome {
    Done {
        branch: String,
        sha: String,
        retries: u32,
    },
    Failed {
        reason: String,
        retries: u32,
    },
}

/// Final tally of a completed run.
#[derive(Debug, Clone, PartialEq)]
pub struct RunSummary {
    pub done: usize,
    pub failed: usize,
    pub skipped: usize,
    pub retries: u32,
    pub wall_seconds: f64,
}

impl RunSummary {
    /// 0 when every task completed, 1 when any failed or was skipped.
    pub fn exit_code(&self) -> i32 {
        if self.failed == 0 && self.skipped == 0 {
            0
        } else {
            1
        }
    }
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

/// Orchestrates the store, git adapter, agent adapter, and check runner
/// under one cancellation scope.
pub struct Engine {
    store: Store,
    git: Arc<dyn Git>,
    agent: Arc<dyn Agent>,
    sink: EventSink,
    cancel: CancellationToken,
}

impl Engine {
    pub fn new(
        store: Store,
        git: Arc<dyn Git>,
        agent: Arc<dyn Agent>,
        sink: EventSink,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            store,
            git,
            agent,
            sink,
            cancel,
        }
    }

    fn emit(&self, event: TaskEvent) {
        (self.sink)(event);
    }

    /// Run the scheduler loop to completion.
    ///
    /// Picks the first executable task (stable insertion order), runs its
    /// state machine, persists the outcome, and repeats until nothing is
    /// executable. Completed branches are then merged into the base branch
    /// in completion order.
    pub async fn run(&self, state: &mut State) -> Result<RunSummary, EngineError> {
        let started = Instant::now();

        self.validate_startup(state).await?;

        let base_branch = match state.settings.base_branch.clone() {
            Some(branch) => branch,
            None => self
                .git
                .current_branch(&self.cancel)
                .await
                .map_err(|e| EngineError::Startup(format!("cannot determine base branch: {e}")))?,
        };
        let push_enabled = self.git.has_remote(&self.cancel).await.unwrap_or(false);

        info!(
            base_branch = %base_branch,
            push = push_enabled,
            tasks = state.tasks.len(),
            "starting execution"
        );

        // (task_id, branch) pairs in completion order, merged at the end.
        let mut completed: Vec<(String, String)> = Vec::new();
        let mut total_retries: u32 = 0;
        let mut cancelled = false;

        loop {
            if self.cancel.is_cancelled() {
                cancelled = true;
                break;
            }

            let cascade = state.executable_tasks();
            if !cascade.newly_skipped.is_empty() {
                // Persist before announcing: observers of the state file
                // must never see an unannounced transition or vice versa.
                self.store.save(state)?;
                for id in &cascade.newly_skipped {
                    self.emit(TaskEvent::new(
                        id,
                        TaskEventKind::TaskSkipped,
                        "skipped: dependency did not complete",
                    ));
                }
            }

            let Some(task_id) = cascade.ready.first().cloned() else {
                break;
            };

            let title = {
                let task = state
                    .find_task_mut(&task_id)
                    .ok_or_else(|| EngineError::Fatal(format!("task {task_id} vanished")))?;
                task.status = TaskStatus::InProgress;
                task.title.clone()
            };
            self.store.save(state)?;
            self.emit(TaskEvent::new(
                &task_id,
                TaskEventKind::TaskStart,
                format!("starting: {title}"),
            ));

            let outcome = self
                .run_task(state, &task_id, &base_branch, push_enabled)
                .await?;

            let task = state
                .find_task_mut(&task_id)
                .ok_or_else(|| EngineError::Fatal(format!("task {task_id} vanished")))?;
            match &outcome {
                TaskOutcome::Done {
                    branch,
                    sha,
                    retries,
                } => {
                    task.status = TaskStatus::Done;
                    task.git_sha = Some(sha.clone());
                    task.completed_at = Some(Utc::now());
                    task.retries = *retries;
                    total_retries += retries;
                    completed.push((task_id.clone(), branch.clone()));
                    self.store.save(state)?;
                    self.emit(TaskEvent::new(
                        &task_id,
                        TaskEventKind::TaskDone,
                        format!("done: {title}"),
                    ));
                }
                TaskOutcome::Failed { reason, retries } => {
                    task.status = TaskStatus::Failed;
                    task.retries = *retries;
                    if reason.contains("cancelled") {
                        task.cancelled_reason = Some(reason.clone());
                    }
                    total_retries += retries;
                    self.store.save(state)?;
                    self.emit(
                        TaskEvent::new(
                            &task_id,
                            TaskEventKind::TaskFailed,
                            format!("failed: {title}"),
                        )
                        .with_detail(reason.clone()),
                    );
                }
            }
        }

        if cancelled {
            // One final save; no merges after cancellation.
            self.store.save(state)?;
            return Err(EngineError::Cancelled);
        }

        // Merge completed branches into the base branch, in completion
        // order. Conflicts are surfaced as events, not fatal errors.
        for (task_id, branch) in &completed {
            match self.git.merge(branch, &self.cancel).await {
                Ok(()) => {
                    info!(branch = %branch, "merged task branch");
                }
                Err(e) => {
                    warn!(branch = %branch, error = %e, "merge failed");
                    self.emit(
                        TaskEvent::new(
                            task_id,
                            TaskEventKind::Error,
                            format!("merge of {branch} failed"),
                        )
                        .with_detail(e.to_string()),
                    );
                    // Clear any half-applied merge so the next one starts
                    // from a clean tree.
                    let _ = self.git.reset_hard(&self.cancel).await;
                }
            }
        }

        self.git
            .checkout_branch(&base_branch, &self.cancel)
            .await
            .map_err(|e| EngineError::BaseBranch {
                branch: base_branch.clone(),
                source: e,
            })?;

        if push_enabled {
            if let Err(e) = self.git.push(&self.cancel).await {
                warn!(error = %e, "push of base branch failed");
                self.emit(
                    TaskEvent::new("", TaskEventKind::Error, "push of base branch failed")
                        .with_detail(e.to_string()),
                );
            }
        }

        let summary = RunSummary {
            done: state.completed_tasks().len(),
            failed: state.failed_tasks().len(),
            skipped: state
                .tasks
                .iter()
                .filter(|t| t.status == TaskStatus::Skipped)
                .count(),
            retries: total_retries,
            wall_seconds: started.elapsed().as_secs_f64(),
        };

        if summary.failed == 0 && summary.skipped == 0 {
            state.phase = Phase::Done;
        }
        self.store.save(state)?;

        info!(
            done = summary.done,
            failed = summary.failed,
            skipped = summary.skipped,
            retries = summary.retries,
            "execution finished"
        );

        Ok(summary)
    }

    /// Startup preconditions (maps to exit code 3 when violated).
    async fn validate_startup(&self, state: &State) -> Result<(), EngineError> {
        if state.phase != Phase::Execution {
            return Err(EngineError::Startup(format!(
                "state is in phase {}, expected execution",
                state.phase
            )));
        }
        if state.tasks.is_empty() {
            return Err(EngineError::Startup("no tasks in plan".to_string()));
        }
        if state.project_name.trim().is_empty() {
            return Err(EngineError::Startup("project_name is empty".to_string()));
        }
        if !state.settings.branch_pattern.contains("{id}") {
            return Err(EngineError::Startup(format!(
                "branch_pattern {:?} does not contain {{id}}",
                state.settings.branch_pattern
            )));
        }
        if let Some(task) = state
            .tasks
            .iter()
            .find(|t| t.status == TaskStatus::InProgress)
        {
            return Err(EngineError::Startup(format!(
                "task {} is in_progress; load should have demoted it",
                task.id
            )));
        }
        self.agent
            .check_available()
            .await
            .map_err(|e| EngineError::Startup(e.to_string()))?;
        Ok(())
    }

    /// Run one task's state machine, then tear down: discard uncommitted
    /// residue, return to the base branch, and persist the per-task log.
    async fn run_task(
        &self,
        state: &mut State,
        task_id: &str,
        base_branch: &str,
        push_enabled: bool,
    ) -> Result<TaskOutcome, EngineError> {
        let log = Mutex::new(String::new());

        let result = self
            .run_task_inner(state, task_id, base_branch, push_enabled, &log)
            .await;

        // Teardown must run on every path, including after cancellation, so
        // it uses a fresh scope: losing the base branch here would poison
        // every subsequent task.
        let teardown_scope = CancellationToken::new();
        if let Err(e) = self.git.reset_hard(&teardown_scope).await {
            warn!(task_id, error = %e, "failed to discard worktree residue");
        }
        self.git
            .checkout_branch(base_branch, &teardown_scope)
            .await
            .map_err(|e| EngineError::BaseBranch {
                branch: base_branch.to_string(),
                source: e,
            })?;

        if let Ok(TaskOutcome::Failed { reason, .. }) = &result {
            let mut buf = log.lock().unwrap_or_else(|e| e.into_inner());
            buf.push_str(&format!("=== FAILED: {reason} ===\n"));
        }
        let contents = log.lock().unwrap_or_else(|e| e.into_inner()).clone();
        if let Err(e) = self.store.write_task_log(task_id, &contents) {
            warn!(task_id, error = %e, "failed to write task log");
        }

        result
    }

    async fn run_task_inner(
        &self,
        state: &mut State,
        task_id: &str,
        base_branch: &str,
        push_enabled: bool,
        log: &Mutex<String>,
    ) -> Result<TaskOutcome, EngineError> {
        let (title, complexity) = {
            let task = state
                .find_task(task_id)
                .ok_or_else(|| EngineError::Fatal(format!("task {task_id} vanished")))?;
            (task.title.clone(), task.complexity)
        };
        let settings = state.settings.clone();

        // -- Branch setup ---------------------------------------------------

        let branch = git::expand_branch(&settings.branch_pattern, task_id);
        let created = match self.setup_branch(&branch, base_branch).await {
            Ok(created) => created,
            Err(GitError::Cancelled { .. }) => {
                return Ok(TaskOutcome::Failed {
                    reason: "cancelled".to_string(),
                    retries: 0,
                });
            }
            Err(e) => {
                self.emit(
                    TaskEvent::new(task_id, TaskEventKind::Error, "branch setup failed")
                        .with_detail(e.to_string()),
                );
                return Ok(TaskOutcome::Failed {
                    reason: format!("branch setup failed: {e}"),
                    retries: 0,
                });
            }
        };

        if let Some(task) = state.find_task_mut(task_id) {
            task.branch = Some(branch.clone());
        }
        self.store.save(state)?;
        self.emit(TaskEvent::new(
            task_id,
            TaskEventKind::BranchCreated,
            if created {
                format!("created branch {branch}")
            } else {
                format!("checked out existing branch {branch}")
            },
        ));

        // -- Attempt loop ---------------------------------------------------

        let max_attempts = settings.max_retries + 1;
        let mut last_output = String::new();

        for attempt in 0..max_attempts {
            if self.cancel.is_cancelled() {
                return Ok(TaskOutcome::Failed {
                    reason: "cancelled".to_string(),
                    retries: attempt,
                });
            }

            let (task_prompt, system_prompt) = {
                let task = state
                    .find_task(task_id)
                    .ok_or_else(|| EngineError::Fatal(format!("task {task_id} vanished")))?;
                let task_prompt = if attempt == 0 {
                    prompt::build_task_prompt(state, task)
                } else {
                    prompt::build_retry_prompt(
                        state,
                        task,
                        attempt + 1,
                        max_attempts,
                        &last_output,
                    )
                };
                (task_prompt, prompt::build_system_prompt(state))
            };

            let mut req = AgentRequest::new(task_prompt, self.store.root());
            req.system_prompt = Some(system_prompt);
            req.model = settings.model.clone();
            req.max_turns = Some(settings.max_turns.for_complexity(complexity));
            req.env_vars = settings.env_vars.clone();

            {
                let mut buf = log.lock().unwrap_or_else(|e| e.into_inner());
                buf.push_str(&format!("=== Claude Output (attempt {}) ===\n", attempt + 1));
            }
            self.emit(TaskEvent::new(
                task_id,
                TaskEventKind::ClaudeStart,
                format!("attempt {} of {max_attempts}", attempt + 1),
            ));

            let on_chunk = move |chunk: &str| {
                let mut buf = log.lock().unwrap_or_else(|e| e.into_inner());
                buf.push_str(chunk);
                drop(buf);
                self.emit(TaskEvent::new(task_id, TaskEventKind::ClaudeChunk, chunk));
            };

            match self.agent.execute(&req, &self.cancel, &on_chunk).await {
                Ok(run) => {
                    {
                        let mut buf = log.lock().unwrap_or_else(|e| e.into_inner());
                        if !buf.ends_with('\n') {
                            buf.push('\n');
                        }
                    }
                    self.emit(TaskEvent::new(
                        task_id,
                        TaskEventKind::ClaudeDone,
                        format!("agent finished in {:.1}s", run.duration.as_secs_f64()),
                    ));
                }
                Err(AgentError::Cancelled) => {
                    return Ok(TaskOutcome::Failed {
                        reason: "cancelled".to_string(),
                        retries: attempt,
                    });
                }
                Err(e) => {
                    self.emit(
                        TaskEvent::new(task_id, TaskEventKind::Error, "agent error")
                            .with_detail(e.to_string()),
                    );
                    return Ok(TaskOutcome::Failed {
                        reason: format!("agent error: {e}"),
                        retries: attempt,
                    });
                }
            }

            // -- Verification gates -----------------------------------------

            let mut gate_failed = false;

            if let Some(command) = settings
                .test_command
                .as_deref()
                .filter(|c| !c.trim().is_empty())
            {
                match self
                    .run_gate(
                        task_id,
                        command,
                        "Test",
                        TaskEventKind::TestStart,
                        TaskEventKind::TestPassed,
                        TaskEventKind::TestFailed,
                        log,
                    )
                    .await
                {
                    GateResult::Passed => {}
                    GateResult::Failed(output) => {
                        last_output = output;
                        gate_failed = true;
                    }
                    GateResult::Cancelled => {
                        return Ok(TaskOutcome::Failed {
                            reason: "cancelled".to_string(),
                            retries: attempt,
                        });
                    }
                    GateResult::Error(reason) => {
                        return Ok(TaskOutcome::Failed {
                            reason,
                            retries: attempt,
                        });
                    }
                }
            }

            if !gate_failed {
                if let Some(command) = settings
                    .build_command
                    .as_deref()
                    .filter(|c| !c.trim().is_empty())
                {
                    match self
                        .run_gate(
                            task_id,
                            command,
                            "Build",
                            TaskEventKind::BuildStart,
                            TaskEventKind::BuildPassed,
                            TaskEventKind::BuildFailed,
                            log,
                        )
                        .await
                    {
                        GateResult::Passed => {}
                        GateResult::Failed(output) => {
                            last_output = output;
                            gate_failed = true;
                        }
                        GateResult::Cancelled => {
                            return Ok(TaskOutcome::Failed {
                                reason: "cancelled".to_string(),
                                retries: attempt,
                            });
                        }
                        GateResult::Error(reason) => {
                            return Ok(TaskOutcome::Failed {
                                reason,
                                retries: attempt,
                            });
                        }
                    }
                }
            }

            if gate_failed {
                if attempt + 1 < max_attempts {
                    self.emit(TaskEvent::new(
                        task_id,
                        TaskEventKind::Retry,
                        format!("retrying (attempt {} of {max_attempts})", attempt + 2),
                    ));
                    continue;
                }
                return Ok(TaskOutcome::Failed {
                    reason: format!("verification failed after {max_attempts} attempts"),
                    retries: attempt,
                });
            }

            // -- Commit phase -----------------------------------------------

            return self
                .commit_task(task_id, &title, &branch, push_enabled, attempt)
                .await;
        }

        // The loop always returns; max_attempts >= 1.
        Ok(TaskOutcome::Failed {
            reason: "no attempts were made".to_string(),
            retries: 0,
        })
    }

    async fn setup_branch(&self, branch: &str, base_branch: &str) -> Result<bool, GitError> {
        if self.git.branch_exists(branch, &self.cancel).await? {
            self.git.checkout_branch(branch, &self.cancel).await?;
            Ok(false)
        } else {
            self.git
                .create_branch(branch, base_branch, &self.cancel)
                .await?;
            Ok(true)
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn run_gate(
        &self,
        task_id: &str,
        command: &str,
        label: &str,
        start_kind: TaskEventKind,
        passed_kind: TaskEventKind,
        failed_kind: TaskEventKind,
        log: &Mutex<String>,
    ) -> GateResult {
        self.emit(TaskEvent::new(task_id, start_kind, command));

        match run_check(command, self.store.root(), &self.cancel).await {
            Ok(result) => {
                {
                    let mut buf = log.lock().unwrap_or_else(|e| e.into_inner());
                    buf.push_str(&format!("=== {label} Output ===\n{}\n", result.output));
                }
                if result.passed {
                    self.emit(TaskEvent::new(
                        task_id,
                        passed_kind,
                        format!("passed in {:.1}s", result.duration_seconds),
                    ));
                    GateResult::Passed
                } else {
                    self.emit(
                        TaskEvent::new(
                            task_id,
                            failed_kind,
                            format!("failed with exit code {}", result.exit_code),
                        )
                        .with_detail(prompt::truncate_output(
                            &result.output,
                            prompt::DEFAULT_TRUNCATE_LIMIT,
                        )),
                    );
                    GateResult::Failed(result.output)
                }
            }
            Err(CheckError::Cancelled { .. }) => GateResult::Cancelled,
            Err(e) => {
                self.emit(
                    TaskEvent::new(task_id, TaskEventKind::Error, format!("{label} command error"))
                        .with_detail(e.to_string()),
                );
                GateResult::Error(format!("{} command error: {e}", label.to_lowercase()))
            }
        }
    }

    async fn commit_task(
        &self,
        task_id: &str,
        title: &str,
        branch: &str,
        push_enabled: bool,
        attempt: u32,
    ) -> Result<TaskOutcome, EngineError> {
        let commit = async {
            self.git.stage_all(&self.cancel).await?;
            self.git.has_staged_changes(&self.cancel).await
        };

        let has_changes = match commit.await {
            Ok(v) => v,
            Err(GitError::Cancelled { .. }) => {
                return Ok(TaskOutcome::Failed {
                    reason: "cancelled".to_string(),
                    retries: attempt,
                });
            }
            Err(e) => {
                return Ok(TaskOutcome::Failed {
                    reason: format!("staging failed: {e}"),
                    retries: attempt,
                });
            }
        };

        // The agent reported success but produced no artifact; re-running
        // the same prompt is unlikely to change that, so this is terminal.
        if !has_changes {
            return Ok(TaskOutcome::Failed {
                reason: "no code changes produced".to_string(),
                retries: attempt,
            });
        }

        let message = git::commit_message(task_id, title);
        let sha = match self.git.commit(&message, &self.cancel).await {
            Ok(sha) => sha,
            Err(GitError::Cancelled { .. }) => {
                return Ok(TaskOutcome::Failed {
                    reason: "cancelled".to_string(),
                    retries: attempt,
                });
            }
            Err(e) => {
                return Ok(TaskOutcome::Failed {
                    reason: format!("commit failed: {e}"),
                    retries: attempt,
                });
            }
        };
        self.emit(TaskEvent::new(
            task_id,
            TaskEventKind::Commit,
            format!("committed {}", &sha[..sha.len().min(8)]),
        ));

        if push_enabled {
            match self.git.push(&self.cancel).await {
                Ok(()) => {
                    self.emit(TaskEvent::new(task_id, TaskEventKind::Push, "pushed branch"));
                }
                Err(GitError::Cancelled { .. }) => {
                    return Ok(TaskOutcome::Failed {
                        reason: "cancelled".to_string(),
                        retries: attempt,
                    });
                }
                Err(e) => {
                    return Ok(TaskOutcome::Failed {
                        reason: format!("push failed: {e}"),
                        retries: attempt,
                    });
                }
            }
        }

        Ok(TaskOutcome::Done {
            branch: branch.to_string(),
            sha,
            retries: attempt,
        })
    }
}

/// Internal result of one verification gate.
enum GateResult {
    Passed,
    Failed(String),
    Cancelled,
    Error(String),
}

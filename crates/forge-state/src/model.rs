use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

// ---------------------------------------------------------------------------
// Enums
// ---------------------------------------------------------------------------

/// Lifecycle status of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    InProgress,
    Done,
    Failed,
    Skipped,
    Cancelled,
}

impl TaskStatus {
    /// Terminal statuses are never executed again.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Done | Self::Failed | Self::Skipped | Self::Cancelled
        )
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::InProgress => "in_progress",
            Self::Done => "done",
            Self::Failed => "failed",
            Self::Skipped => "skipped",
            Self::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

impl FromStr for TaskStatus {
    type Err = StateError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "in_progress" => Ok(Self::InProgress),
            "done" => Ok(Self::Done),
            "failed" => Ok(Self::Failed),
            "skipped" => Ok(Self::Skipped),
            "cancelled" => Ok(Self::Cancelled),
            other => Err(StateError::InvalidValue(format!(
                "invalid task status: {other:?}"
            ))),
        }
    }
}

/// Rough implementation size of a task, used to budget agent turns.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Complexity {
    Small,
    Medium,
    Large,
}

impl fmt::Display for Complexity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Small => "small",
            Self::Medium => "medium",
            Self::Large => "large",
        };
        f.write_str(s)
    }
}

impl FromStr for Complexity {
    type Err = StateError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "small" => Ok(Self::Small),
            "medium" => Ok(Self::Medium),
            "large" => Ok(Self::Large),
            other => Err(StateError::InvalidValue(format!(
                "invalid complexity: {other:?}"
            ))),
        }
    }
}

/// Overall phase of the project workflow. The engine only runs in
/// `execution`; the earlier phases belong to the planning collaborators.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Planning,
    Review,
    Inputs,
    Execution,
    Done,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Planning => "planning",
            Self::Review => "review",
            Self::Inputs => "inputs",
            Self::Execution => "execution",
            Self::Done => "done",
        };
        f.write_str(s)
    }
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Errors from in-memory state operations.
#[derive(Debug, Error)]
pub enum StateError {
    #[error("task not found: {0}")]
    UnknownTask(String),

    #[error("cannot cancel task {id}: status is {status}, expected pending")]
    NotCancellable { id: String, status: TaskStatus },

    #[error("{0}")]
    InvalidValue(String),
}

// ---------------------------------------------------------------------------
// Task
// ---------------------------------------------------------------------------

/// A single unit of work, implemented in one agent session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    /// Stable identity of the form `task-NNN`.
    pub id: String,
    pub title: String,
    pub description: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub acceptance_criteria: Vec<String>,
    pub complexity: Complexity,
    /// IDs of tasks that must be `done` before this one is eligible.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub depends_on: Vec<String>,
    pub status: TaskStatus,
    pub plan_version_created: u32,
    pub plan_version_modified: u32,
    /// Branch the task ran on; set during branch setup.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub branch: Option<String>,
    /// Commit SHA recorded when the task reached `done`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub git_sha: Option<String>,
    /// Retries consumed by the terminal attempt (0 when the first attempt
    /// succeeded).
    #[serde(default)]
    pub retries: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cancelled_reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

// ---------------------------------------------------------------------------
// Settings
// ---------------------------------------------------------------------------

/// Per-complexity agent turn budgets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MaxTurns {
    pub small: u32,
    pub medium: u32,
    pub large: u32,
}

impl Default for MaxTurns {
    fn default() -> Self {
        Self {
            small: 15,
            medium: 30,
            large: 50,
        }
    }
}

impl MaxTurns {
    pub fn for_complexity(&self, complexity: Complexity) -> u32 {
        match complexity {
            Complexity::Small => self.small,
            Complexity::Medium => self.medium,
            Complexity::Large => self.large,
        }
    }
}

/// Run configuration collected before execution starts.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Test command run after each agent attempt. `None` disables the gate.
    pub test_command: Option<String>,
    /// Build command run after the tests pass. `None` disables the gate.
    pub build_command: Option<String>,
    /// Branch name template. Must contain the literal `{id}`.
    pub branch_pattern: String,
    /// Extra attempts after the first. Total attempts = `max_retries + 1`.
    pub max_retries: u32,
    pub max_turns: MaxTurns,
    /// Extra environment variables for agent invocations.
    pub env_vars: BTreeMap<String, String>,
    /// Free-form text appended to the project context block.
    pub extra_context: Option<String>,
    /// Overrides the branch the run forks from and merges into. Defaults to
    /// whatever HEAD points at when the engine starts.
    pub base_branch: Option<String>,
    pub model: Option<String>,
    /// Project facts collected by the structure scanner, used in prompts.
    pub language: Option<String>,
    pub frameworks: Vec<String>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            test_command: None,
            build_command: None,
            branch_pattern: "forge/{id}".to_string(),
            max_retries: 2,
            max_turns: MaxTurns::default(),
            env_vars: BTreeMap::new(),
            extra_context: None,
            base_branch: None,
            model: None,
            language: None,
            frameworks: Vec::new(),
        }
    }
}

// ---------------------------------------------------------------------------
// State
// ---------------------------------------------------------------------------

/// A recorded plan revision, appended whenever the plan version is bumped.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanRevision {
    pub version: u32,
    pub summary: String,
    pub created_at: DateTime<Utc>,
}

/// Result of the `executable_tasks` query: the tasks that may run now, and
/// the tasks the dependency cascade just moved to `skipped`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CascadeOutcome {
    /// IDs of `pending` tasks whose dependencies are all `done`, in
    /// insertion order.
    pub ready: Vec<String>,
    /// IDs transitioned `pending -> skipped` by this query, in the order
    /// the cascade reached them.
    pub newly_skipped: Vec<String>,
}

/// The persisted root: plan, tasks, and settings for one project.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct State {
    pub project_name: String,
    pub phase: Phase,
    pub plan_version: u32,
    pub tasks: Vec<Task>,
    pub settings: Settings,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub revisions: Vec<PlanRevision>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl State {
    /// Create an empty state in the `planning` phase.
    pub fn new(project_name: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            project_name: project_name.into(),
            phase: Phase::Planning,
            plan_version: 1,
            tasks: Vec::new(),
            settings: Settings::default(),
            revisions: Vec::new(),
            created_at: now,
            updated_at: now,
        }
    }

    /// Mint the next task ID: `task-NNN` where NNN is one past the highest
    /// existing numeric suffix, zero-padded to three digits.
    fn next_task_id(&self) -> String {
        let max = self
            .tasks
            .iter()
            .filter_map(|t| t.id.strip_prefix("task-"))
            .filter_map(|n| n.parse::<u32>().ok())
            .max()
            .unwrap_or(0);
        format!("task-{:03}", max + 1)
    }

    /// Append a new `pending` task and return its ID.
    pub fn add_task(
        &mut self,
        title: impl Into<String>,
        description: impl Into<String>,
        complexity: Complexity,
        acceptance_criteria: Vec<String>,
        depends_on: Vec<String>,
    ) -> String {
        let id = self.next_task_id();
        self.tasks.push(Task {
            id: id.clone(),
            title: title.into(),
            description: description.into(),
            acceptance_criteria,
            complexity,
            depends_on,
            status: TaskStatus::Pending,
            plan_version_created: self.plan_version,
            plan_version_modified: self.plan_version,
            branch: None,
            git_sha: None,
            retries: 0,
            cancelled_reason: None,
            completed_at: None,
        });
        id
    }

    pub fn find_task(&self, id: &str) -> Option<&Task> {
        self.tasks.iter().find(|t| t.id == id)
    }

    pub fn find_task_mut(&mut self, id: &str) -> Option<&mut Task> {
        self.tasks.iter_mut().find(|t| t.id == id)
    }

    pub fn pending_tasks(&self) -> Vec<&Task> {
        self.tasks
            .iter()
            .filter(|t| t.status == TaskStatus::Pending)
            .collect()
    }

    pub fn completed_tasks(&self) -> Vec<&Task> {
        self.tasks
            .iter()
            .filter(|t| t.status == TaskStatus::Done)
            .collect()
    }

    pub fn failed_tasks(&self) -> Vec<&Task> {
        self.tasks
            .iter()
            .filter(|t| t.status == TaskStatus::Failed)
            .collect()
    }

    /// The scheduler's primary query.
    ///
    /// First runs the skip cascade to a fixed point: any `pending` task with
    /// a dependency in {`failed`, `cancelled`, `skipped`} is transitioned in
    /// place to `skipped`, which may in turn unblock further skips (a chain
    /// A(failed) -> B -> C must leave both B and C skipped). Then returns,
    /// in insertion order, the `pending` tasks whose dependencies are all
    /// `done`.
    pub fn executable_tasks(&mut self) -> CascadeOutcome {
        let mut newly_skipped = Vec::new();

        loop {
            let status_by_id: HashMap<String, TaskStatus> = self
                .tasks
                .iter()
                .map(|t| (t.id.clone(), t.status))
                .collect();

            let mut changed = false;
            for task in &mut self.tasks {
                if task.status != TaskStatus::Pending {
                    continue;
                }
                let blocked = task.depends_on.iter().any(|dep| {
                    matches!(
                        status_by_id.get(dep),
                        Some(TaskStatus::Failed)
                            | Some(TaskStatus::Cancelled)
                            | Some(TaskStatus::Skipped)
                    )
                });
                if blocked {
                    task.status = TaskStatus::Skipped;
                    newly_skipped.push(task.id.clone());
                    changed = true;
                }
            }

            if !changed {
                break;
            }
        }

        let status_by_id: HashMap<&str, TaskStatus> = self
            .tasks
            .iter()
            .map(|t| (t.id.as_str(), t.status))
            .collect();

        let ready = self
            .tasks
            .iter()
            .filter(|t| t.status == TaskStatus::Pending)
            .filter(|t| {
                t.depends_on
                    .iter()
                    .all(|dep| status_by_id.get(dep.as_str()) == Some(&TaskStatus::Done))
            })
            .map(|t| t.id.clone())
            .collect();

        CascadeOutcome {
            ready,
            newly_skipped,
        }
    }

    /// Cancel a task. Only permissible while it is still `pending`.
    pub fn cancel_task(&mut self, id: &str, reason: impl Into<String>) -> Result<(), StateError> {
        let task = self
            .find_task_mut(id)
            .ok_or_else(|| StateError::UnknownTask(id.to_string()))?;

        if task.status != TaskStatus::Pending {
            return Err(StateError::NotCancellable {
                id: id.to_string(),
                status: task.status,
            });
        }

        task.status = TaskStatus::Cancelled;
        task.cancelled_reason = Some(reason.into());
        Ok(())
    }

    /// Increment the plan version and append a revision record.
    pub fn bump_plan_version(&mut self, summary: impl Into<String>) {
        self.plan_version += 1;
        self.revisions.push(PlanRevision {
            version: self.plan_version,
            summary: summary.into(),
            created_at: Utc::now(),
        });
    }

    /// Promote any `in_progress` task to `failed` with reason "interrupted".
    ///
    /// A task can only be left `in_progress` on disk when the process died
    /// mid-task; the next run must not resume it blind. Returns the IDs
    /// that were demoted.
    pub fn demote_interrupted(&mut self) -> Vec<String> {
        let mut demoted = Vec::new();
        for task in &mut self.tasks {
            if task.status == TaskStatus::InProgress {
                task.status = TaskStatus::Failed;
                task.cancelled_reason = Some("interrupted".to_string());
                demoted.push(task.id.clone());
            }
        }
        demoted
    }

    /// Check the structural invariants the store guarantees on disk:
    /// unique IDs, dependencies that reference existing tasks, an acyclic
    /// dependency graph over non-terminal tasks, a branch pattern carrying
    /// `{id}`, and `updated_at` not older than any completion timestamp.
    pub fn validate(&self) -> Result<(), String> {
        let mut seen = HashSet::new();
        for task in &self.tasks {
            if !seen.insert(task.id.as_str()) {
                return Err(format!("duplicate task id: {}", task.id));
            }
        }

        for task in &self.tasks {
            for dep in &task.depends_on {
                if !seen.contains(dep.as_str()) {
                    return Err(format!(
                        "task {} depends on unknown task {}",
                        task.id, dep
                    ));
                }
            }
        }

        if !self.settings.branch_pattern.contains("{id}") {
            return Err(format!(
                "branch_pattern {:?} does not contain {{id}}",
                self.settings.branch_pattern
            ));
        }

        for task in &self.tasks {
            if let Some(completed_at) = task.completed_at {
                if self.updated_at < completed_at {
                    return Err(format!(
                        "updated_at predates completed_at of task {}",
                        task.id
                    ));
                }
            }
        }

        self.check_acyclic()
    }

    /// Cycle detection over the non-terminal subgraph via iterative DFS
    /// with three colours.
    fn check_acyclic(&self) -> Result<(), String> {
        #[derive(Clone, Copy, PartialEq)]
        enum Mark {
            Unvisited,
            InStack,
            Done,
        }

        let live: HashMap<&str, &Task> = self
            .tasks
            .iter()
            .filter(|t| !t.status.is_terminal())
            .map(|t| (t.id.as_str(), t))
            .collect();

        let mut marks: HashMap<&str, Mark> =
            live.keys().map(|id| (*id, Mark::Unvisited)).collect();

        for start in live.keys() {
            if marks[start] != Mark::Unvisited {
                continue;
            }
            // Stack of (node, next dependency index to try).
            let mut stack: Vec<(&str, usize)> = vec![(*start, 0)];
            marks.insert(*start, Mark::InStack);

            while let Some((node, idx)) = stack.pop() {
                let deps = &live[node].depends_on;
                if idx < deps.len() {
                    stack.push((node, idx + 1));
                    let dep = deps[idx].as_str();
                    // Dependencies on terminal tasks cannot form a live cycle.
                    if !live.contains_key(dep) {
                        continue;
                    }
                    match marks[dep] {
                        Mark::InStack => {
                            return Err(format!(
                                "dependency cycle through {} and {}",
                                node, dep
                            ));
                        }
                        Mark::Unvisited => {
                            marks.insert(dep, Mark::InStack);
                            stack.push((dep, 0));
                        }
                        Mark::Done => {}
                    }
                } else {
                    marks.insert(node, Mark::Done);
                }
            }
        }

        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

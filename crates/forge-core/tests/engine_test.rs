//! End-to-end scenarios for the execution engine, run against throwaway
//! git repositories with a scripted mock agent.

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use forge_core::agent::{Agent, AgentError, AgentRequest, AgentRun, ChunkFn};
use forge_core::engine::events::{EventSink, TaskEvent, TaskEventKind};
use forge_core::engine::{Engine, EngineError};
use forge_core::git::{CliGit, Git};
use forge_state::{Complexity, Phase, State, Store, TaskStatus};

// ===========================================================================
// Mock agent
// ===========================================================================

/// One scripted agent invocation.
#[derive(Debug, Clone)]
enum MockStep {
    /// Write a unique file into the working tree and stream `text`.
    Work(&'static str),
    /// Stream `text` but change nothing.
    NoOp(&'static str),
    /// Fail with a non-zero exit.
    Fail(&'static str),
}

/// Agent whose invocations follow a fixed script. When the script runs
/// out, further invocations behave like [`MockStep::Work`].
struct MockAgent {
    steps: Mutex<VecDeque<MockStep>>,
    prompts: Mutex<Vec<String>>,
}

impl MockAgent {
    fn new(steps: Vec<MockStep>) -> Self {
        Self {
            steps: Mutex::new(steps.into()),
            prompts: Mutex::new(Vec::new()),
        }
    }

    fn prompts(&self) -> Vec<String> {
        self.prompts.lock().unwrap().clone()
    }

    fn invocations(&self) -> usize {
        self.prompts.lock().unwrap().len()
    }
}

#[async_trait]
impl Agent for MockAgent {
    fn name(&self) -> &str {
        "mock-agent"
    }

    async fn check_available(&self) -> Result<(), AgentError> {
        Ok(())
    }

    async fn execute(
        &self,
        req: &AgentRequest,
        _cancel: &CancellationToken,
        on_chunk: &ChunkFn<'_>,
    ) -> Result<AgentRun, AgentError> {
        let invocation = {
            let mut prompts = self.prompts.lock().unwrap();
            prompts.push(req.prompt.clone());
            prompts.len()
        };

        let step = self
            .steps
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(MockStep::Work("implemented"));

        match step {
            MockStep::Work(text) => {
                let file = req.working_dir.join(format!("agent-output-{invocation}.txt"));
                std::fs::write(&file, "generated\n").unwrap();
                on_chunk(text);
                Ok(AgentRun {
                    text: text.to_string(),
                    duration: Duration::from_millis(5),
                    ..Default::default()
                })
            }
            MockStep::NoOp(text) => {
                on_chunk(text);
                Ok(AgentRun {
                    text: text.to_string(),
                    duration: Duration::from_millis(5),
                    ..Default::default()
                })
            }
            MockStep::Fail(stderr) => Err(AgentError::ExitNonZero {
                code: 1,
                stderr: stderr.to_string(),
            }),
        }
    }
}

// ===========================================================================
// Test harness
// ===========================================================================

fn run_git(repo: &Path, args: &[&str]) -> String {
    let output = Command::new("git")
        .args(args)
        .current_dir(repo)
        .output()
        .unwrap_or_else(|e| panic!("failed to run git {}: {e}", args.join(" ")));
    assert!(
        output.status.success(),
        "git {} failed: {}",
        args.join(" "),
        String::from_utf8_lossy(&output.stderr)
    );
    String::from_utf8_lossy(&output.stdout).into_owned()
}

struct Harness {
    _repo_dir: tempfile::TempDir,
    scripts_dir: tempfile::TempDir,
    repo: PathBuf,
    store: Store,
    state: State,
    agent: Arc<MockAgent>,
    events: Arc<Mutex<Vec<TaskEvent>>>,
    cancel: CancellationToken,
}

impl Harness {
    fn new(steps: Vec<MockStep>) -> Self {
        let repo_dir = tempfile::TempDir::new().expect("failed to create repo dir");
        let repo = repo_dir.path().to_path_buf();

        run_git(&repo, &["init"]);
        run_git(&repo, &["config", "user.email", "test@forge.dev"]);
        run_git(&repo, &["config", "user.name", "Forge Test"]);
        std::fs::write(repo.join("README.md"), "# Test repo\n").unwrap();
        run_git(&repo, &["add", "."]);
        run_git(&repo, &["commit", "-m", "Initial commit"]);

        let store = Store::new(&repo);
        let mut state = store.init("demo").expect("init failed");
        state.phase = Phase::Execution;
        store.save(&mut state).expect("save failed");

        Self {
            _repo_dir: repo_dir,
            scripts_dir: tempfile::TempDir::new().expect("failed to create scripts dir"),
            repo,
            store,
            state,
            agent: Arc::new(MockAgent::new(steps)),
            events: Arc::new(Mutex::new(Vec::new())),
            cancel: CancellationToken::new(),
        }
    }

    fn base_branch(&self) -> String {
        run_git(&self.repo, &["rev-parse", "--abbrev-ref", "HEAD"])
            .trim()
            .to_string()
    }

    /// Write an executable gate script and return its path as a command.
    fn gate_script(&self, name: &str, body: &str) -> String {
        let path = self.scripts_dir.path().join(name);
        std::fs::write(&path, format!("#!/bin/sh\n{body}")).unwrap();
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        }
        path.to_str().unwrap().to_string()
    }

    fn add_task(&mut self, title: &str, deps: Vec<String>) -> String {
        let id = self.state.add_task(
            title,
            format!("implement {title}"),
            Complexity::Small,
            vec![],
            deps,
        );
        self.store.save(&mut self.state).unwrap();
        id
    }

    fn engine(&self) -> Engine {
        let events = Arc::clone(&self.events);
        let sink: EventSink = Arc::new(move |event: TaskEvent| {
            events.lock().unwrap().push(event);
        });
        let git = CliGit::new(&self.repo).expect("repo should be valid");
        Engine::new(
            self.store.clone(),
            Arc::new(git) as Arc<dyn Git>,
            Arc::clone(&self.agent) as Arc<dyn Agent>,
            sink,
            self.cancel.clone(),
        )
    }

    fn events(&self) -> Vec<TaskEvent> {
        self.events.lock().unwrap().clone()
    }

    fn events_of_kind(&self, kind: TaskEventKind) -> Vec<TaskEvent> {
        self.events()
            .into_iter()
            .filter(|e| e.kind == kind)
            .collect()
    }

    fn status_of(&self, id: &str) -> TaskStatus {
        self.state.find_task(id).unwrap().status
    }
}

fn commit_count(repo: &Path) -> usize {
    run_git(repo, &["rev-list", "--count", "HEAD"])
        .trim()
        .parse()
        .unwrap()
}

// ===========================================================================
// Happy path: sequential dependencies
// ===========================================================================

#[tokio::test]
async fn happy_path_runs_tasks_in_dependency_order() {
    let mut harness = Harness::new(vec![]);
    let pass = harness.gate_script("pass.sh", "echo all tests passed\nexit 0\n");
    harness.state.settings.test_command = Some(pass);
    harness.state.settings.max_retries = 2;

    let a = harness.add_task("task a", vec![]);
    let b = harness.add_task("task b", vec![a.clone()]);
    let c = harness.add_task("task c", vec![b.clone()]);

    let base = harness.base_branch();
    let engine = harness.engine();
    let summary = engine.run(&mut harness.state).await.expect("run failed");

    assert_eq!(summary.done, 3);
    assert_eq!(summary.failed, 0);
    assert_eq!(summary.skipped, 0);
    assert_eq!(summary.exit_code(), 0);

    for id in [&a, &b, &c] {
        let task = harness.state.find_task(id).unwrap();
        assert_eq!(task.status, TaskStatus::Done);
        assert!(task.git_sha.is_some(), "{id} should carry a sha");
        assert!(task.completed_at.is_some());
        assert_eq!(task.retries, 0);
    }

    // Tasks ran strictly in document order.
    let starts: Vec<String> = harness
        .events_of_kind(TaskEventKind::TaskStart)
        .into_iter()
        .map(|e| e.task_id)
        .collect();
    assert_eq!(starts, vec![a.clone(), b.clone(), c.clone()]);

    // Done(A) precedes Start(B): at most one task in progress.
    let events = harness.events();
    let done_a = events
        .iter()
        .position(|e| e.kind == TaskEventKind::TaskDone && e.task_id == a)
        .unwrap();
    let start_b = events
        .iter()
        .position(|e| e.kind == TaskEventKind::TaskStart && e.task_id == b)
        .unwrap();
    assert!(done_a < start_b);

    // All three branches merged into base, which is checked out again.
    assert_eq!(harness.base_branch(), base);
    for n in 1..=3 {
        assert!(
            harness.repo.join(format!("agent-output-{n}.txt")).exists(),
            "merged work from invocation {n} should be on base"
        );
    }
    let merges = run_git(&harness.repo, &["log", "--merges", "--oneline"]);
    assert_eq!(merges.lines().count(), 3);
}

// ===========================================================================
// Cascading skip
// ===========================================================================

#[tokio::test]
async fn failed_dependency_cascades_to_skips() {
    let mut harness = Harness::new(vec![]);

    let a = harness.add_task("task a", vec![]);
    let b = harness.add_task("task b", vec![a.clone()]);
    let c = harness.add_task("task c", vec![b.clone()]);
    let d = harness.add_task("task d", vec![]);

    // A failed in a prior run.
    harness.state.find_task_mut(&a).unwrap().status = TaskStatus::Failed;
    harness.store.save(&mut harness.state).unwrap();

    let engine = harness.engine();
    let summary = engine.run(&mut harness.state).await.expect("run failed");

    assert_eq!(harness.status_of(&a), TaskStatus::Failed);
    assert_eq!(harness.status_of(&b), TaskStatus::Skipped);
    assert_eq!(harness.status_of(&c), TaskStatus::Skipped);
    assert_eq!(harness.status_of(&d), TaskStatus::Done);

    assert_eq!(summary.done, 1);
    assert_eq!(summary.failed, 1);
    assert_eq!(summary.skipped, 2);
    assert_eq!(summary.exit_code(), 1);

    // A was not re-attempted: exactly one agent invocation (for D).
    assert_eq!(harness.agent.invocations(), 1);

    let skipped: Vec<String> = harness
        .events_of_kind(TaskEventKind::TaskSkipped)
        .into_iter()
        .map(|e| e.task_id)
        .collect();
    assert_eq!(skipped, vec![b, c]);
}

// ===========================================================================
// Retry then success
// ===========================================================================

#[tokio::test]
async fn retry_prompts_carry_prior_failure_output() {
    let mut harness = Harness::new(vec![]);

    // Gate fails twice with distinct messages, then passes.
    let counter = harness.scripts_dir.path().join("attempts");
    let flaky = harness.gate_script(
        "flaky.sh",
        &format!(
            r#"n=$(cat {counter} 2>/dev/null || echo 0)
n=$((n+1))
echo $n > {counter}
if [ $n -eq 1 ]; then echo "TestAuth expected 200 got 401"; exit 1; fi
if [ $n -eq 2 ]; then echo "TestAuth still failing"; exit 1; fi
echo ok
exit 0
"#,
            counter = counter.display()
        ),
    );
    harness.state.settings.test_command = Some(flaky);
    harness.state.settings.max_retries = 2;

    let id = harness.add_task("flaky task", vec![]);

    let engine = harness.engine();
    let summary = engine.run(&mut harness.state).await.expect("run failed");

    assert_eq!(summary.done, 1);
    assert_eq!(summary.retries, 2);

    let task = harness.state.find_task(&id).unwrap();
    assert_eq!(task.status, TaskStatus::Done);
    assert_eq!(task.retries, 2);

    // Three invocations; each retry prompt carries the previous failure
    // output verbatim.
    let prompts = harness.agent.prompts();
    assert_eq!(prompts.len(), 3);
    assert!(prompts[1].contains("attempt 2 of 3"));
    assert!(prompts[1].contains("TestAuth expected 200 got 401"));
    assert!(prompts[2].contains("attempt 3 of 3"));
    assert!(prompts[2].contains("TestAuth still failing"));
    assert!(prompts[2].contains("THIS IS THE FINAL ATTEMPT."));

    assert_eq!(harness.events_of_kind(TaskEventKind::TestFailed).len(), 2);
    assert_eq!(harness.events_of_kind(TaskEventKind::Retry).len(), 2);
}

// ===========================================================================
// Retry exhaustion
// ===========================================================================

#[tokio::test]
async fn exhausted_retries_fail_without_commit() {
    let mut harness = Harness::new(vec![]);
    let fail = harness.gate_script("fail.sh", "echo TestAuth broken\nexit 1\n");
    harness.state.settings.test_command = Some(fail);
    harness.state.settings.max_retries = 1;

    let id = harness.add_task("doomed task", vec![]);
    let commits_before = commit_count(&harness.repo);

    let engine = harness.engine();
    let summary = engine.run(&mut harness.state).await.expect("run failed");

    assert_eq!(summary.failed, 1);
    assert_eq!(summary.exit_code(), 1);

    let task = harness.state.find_task(&id).unwrap();
    assert_eq!(task.status, TaskStatus::Failed);
    assert_eq!(task.retries, 1);
    assert!(task.git_sha.is_none());

    // 1 + 1 retry = two invocations, no commit, back on base.
    assert_eq!(harness.agent.invocations(), 2);
    assert_eq!(commit_count(&harness.repo), commits_before);
    assert!(harness.events_of_kind(TaskEventKind::Commit).is_empty());
    assert!(harness.events_of_kind(TaskEventKind::Push).is_empty());
}

// ===========================================================================
// No changes produced
// ===========================================================================

#[tokio::test]
async fn no_changes_produced_is_terminal() {
    let mut harness = Harness::new(vec![
        MockStep::NoOp("looks done already, nothing to change"),
    ]);
    harness.state.settings.max_retries = 2;

    let id = harness.add_task("phantom task", vec![]);
    let commits_before = commit_count(&harness.repo);

    let engine = harness.engine();
    let summary = engine.run(&mut harness.state).await.expect("run failed");

    assert_eq!(summary.failed, 1);

    let task = harness.state.find_task(&id).unwrap();
    assert_eq!(task.status, TaskStatus::Failed);
    // Not retryable: the same prompt would produce the same nothing.
    assert_eq!(task.retries, 0);
    assert_eq!(harness.agent.invocations(), 1);
    assert_eq!(commit_count(&harness.repo), commits_before);

    let failed = harness.events_of_kind(TaskEventKind::TaskFailed);
    assert_eq!(failed.len(), 1);
    assert!(
        failed[0]
            .detail
            .as_deref()
            .unwrap_or_default()
            .contains("no code changes produced")
    );
}

// ===========================================================================
// Cancellation mid-run
// ===========================================================================

#[tokio::test]
async fn cancellation_stops_scheduling_and_skips_merges() {
    let mut harness = Harness::new(vec![]);

    let a = harness.add_task("task a", vec![]);
    let b = harness.add_task("task b", vec![]);
    let c = harness.add_task("task c", vec![]);

    // Trip the scope as soon as the first task completes.
    let trip = harness.cancel.clone();
    let first_done = Arc::new(Mutex::new(false));
    let events = Arc::clone(&harness.events);
    let sink: EventSink = Arc::new(move |event: TaskEvent| {
        if event.kind == TaskEventKind::TaskDone {
            let mut done = first_done.lock().unwrap();
            if !*done {
                *done = true;
                trip.cancel();
            }
        }
        events.lock().unwrap().push(event);
    });

    let git = CliGit::new(&harness.repo).unwrap();
    let engine = Engine::new(
        harness.store.clone(),
        Arc::new(git) as Arc<dyn Git>,
        Arc::clone(&harness.agent) as Arc<dyn Agent>,
        sink,
        harness.cancel.clone(),
    );

    let err = engine.run(&mut harness.state).await.unwrap_err();
    assert!(matches!(err, EngineError::Cancelled));

    assert_eq!(harness.status_of(&a), TaskStatus::Done);
    // The second task never started; the third certainly did not.
    assert_eq!(harness.status_of(&b), TaskStatus::Pending);
    assert_eq!(harness.status_of(&c), TaskStatus::Pending);

    // No merges happen after cancellation.
    let merges = run_git(&harness.repo, &["log", "--merges", "--oneline"]);
    assert_eq!(merges.lines().count(), 0);

    // The final state is on disk.
    let reloaded = harness.store.load().unwrap().unwrap();
    assert_eq!(reloaded.find_task(&a).unwrap().status, TaskStatus::Done);
}

// ===========================================================================
// Resume
// ===========================================================================

#[tokio::test]
async fn resume_skips_completed_tasks() {
    let mut harness = Harness::new(vec![]);

    let first = harness.add_task("already done", vec![]);
    let second = harness.add_task("still pending", vec![]);

    {
        let task = harness.state.find_task_mut(&first).unwrap();
        task.status = TaskStatus::Done;
        task.git_sha = Some("deadbeef".repeat(5));
        task.completed_at = Some(chrono::Utc::now());
    }
    harness.store.save(&mut harness.state).unwrap();

    let engine = harness.engine();
    let summary = engine.run(&mut harness.state).await.expect("run failed");

    assert_eq!(summary.done, 2);
    assert_eq!(harness.agent.invocations(), 1);
    assert!(harness.agent.prompts()[0].contains("still pending"));

    assert_eq!(harness.status_of(&first), TaskStatus::Done);
    assert_eq!(harness.status_of(&second), TaskStatus::Done);

    // Only the resumed task started.
    let starts = harness.events_of_kind(TaskEventKind::TaskStart);
    assert_eq!(starts.len(), 1);
    assert_eq!(starts[0].task_id, second);
}

// ===========================================================================
// Branch already exists
// ===========================================================================

#[tokio::test]
async fn existing_branch_is_checked_out() {
    let mut harness = Harness::new(vec![]);
    let id = harness.add_task("reuse branch", vec![]);

    // The branch exists from a prior run.
    run_git(&harness.repo, &["branch", &format!("forge/{id}")]);

    let engine = harness.engine();
    let summary = engine.run(&mut harness.state).await.expect("run failed");
    assert_eq!(summary.done, 1);

    let branch_events = harness.events_of_kind(TaskEventKind::BranchCreated);
    assert_eq!(branch_events.len(), 1);
    assert!(
        branch_events[0].message.contains("existing"),
        "expected checkout of existing branch, got: {}",
        branch_events[0].message
    );

    let task = harness.state.find_task(&id).unwrap();
    assert_eq!(task.branch.as_deref(), Some(format!("forge/{id}").as_str()));
}

// ===========================================================================
// Cross-cutting properties
// ===========================================================================

#[tokio::test]
async fn durability_task_done_is_on_disk_with_sha() {
    let mut harness = Harness::new(vec![]);
    let id = harness.add_task("durable task", vec![]);

    let engine = harness.engine();
    engine.run(&mut harness.state).await.expect("run failed");

    let reloaded = harness.store.load().unwrap().unwrap();
    let task = reloaded.find_task(&id).unwrap();
    assert_eq!(task.status, TaskStatus::Done);
    assert!(!task.git_sha.as_deref().unwrap_or_default().is_empty());
}

#[tokio::test]
async fn per_task_events_arrive_in_causal_order() {
    let mut harness = Harness::new(vec![]);
    let pass = harness.gate_script("pass.sh", "exit 0\n");
    harness.state.settings.test_command = Some(pass.clone());
    harness.state.settings.build_command = Some(pass);
    let id = harness.add_task("ordered task", vec![]);

    let engine = harness.engine();
    engine.run(&mut harness.state).await.expect("run failed");

    let kinds: Vec<TaskEventKind> = harness
        .events()
        .into_iter()
        .filter(|e| e.task_id == id && e.kind != TaskEventKind::ClaudeChunk)
        .map(|e| e.kind)
        .collect();

    assert_eq!(
        kinds,
        vec![
            TaskEventKind::TaskStart,
            TaskEventKind::BranchCreated,
            TaskEventKind::ClaudeStart,
            TaskEventKind::ClaudeDone,
            TaskEventKind::TestStart,
            TaskEventKind::TestPassed,
            TaskEventKind::BuildStart,
            TaskEventKind::BuildPassed,
            TaskEventKind::Commit,
            TaskEventKind::TaskDone,
        ]
    );
}

#[tokio::test]
async fn task_log_is_written_with_framing() {
    let mut harness = Harness::new(vec![]);
    let fail = harness.gate_script("fail.sh", "echo assertion blew up\nexit 1\n");
    harness.state.settings.test_command = Some(fail);
    harness.state.settings.max_retries = 0;

    let id = harness.add_task("logged task", vec![]);

    let engine = harness.engine();
    engine.run(&mut harness.state).await.expect("run failed");

    let log = harness.store.read_task_log(&id).expect("log missing");
    assert!(log.contains("=== Claude Output (attempt 1) ==="));
    assert!(log.contains("=== Test Output ==="));
    assert!(log.contains("assertion blew up"));
    assert!(log.contains("=== FAILED:"));
}

#[tokio::test]
async fn startup_rejects_wrong_phase() {
    let mut harness = Harness::new(vec![]);
    harness.add_task("task", vec![]);
    harness.state.phase = Phase::Planning;

    let engine = harness.engine();
    let err = engine.run(&mut harness.state).await.unwrap_err();
    assert!(matches!(err, EngineError::Startup(_)));
}

#[tokio::test]
async fn startup_rejects_empty_plan() {
    let mut harness = Harness::new(vec![]);
    let engine = harness.engine();
    let err = engine.run(&mut harness.state).await.unwrap_err();
    assert!(matches!(err, EngineError::Startup(_)));
}

#[tokio::test]
async fn agent_error_fails_task_but_run_continues() {
    let mut harness = Harness::new(vec![
        MockStep::Fail("model overloaded"),
        MockStep::Work("second task fine"),
    ]);

    let bad = harness.add_task("task hitting agent error", vec![]);
    let good = harness.add_task("independent task", vec![]);

    let engine = harness.engine();
    let summary = engine.run(&mut harness.state).await.expect("run failed");

    assert_eq!(harness.status_of(&bad), TaskStatus::Failed);
    assert_eq!(harness.status_of(&good), TaskStatus::Done);
    assert_eq!(summary.failed, 1);
    assert_eq!(summary.done, 1);
}

#[tokio::test]
async fn base_branch_restored_after_failure() {
    let mut harness = Harness::new(vec![]);
    let fail = harness.gate_script("fail.sh", "exit 1\n");
    harness.state.settings.test_command = Some(fail);
    harness.state.settings.max_retries = 0;
    harness.add_task("failing task", vec![]);

    let base = harness.base_branch();
    let engine = harness.engine();
    engine.run(&mut harness.state).await.expect("run failed");

    assert_eq!(harness.base_branch(), base);
}

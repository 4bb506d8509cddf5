//! `forge run` command: wire the adapters to the engine, stream progress
//! to the console, and map the result to the documented exit codes.
//!
//! Exit codes: 0 all tasks done, 1 one or more failed/skipped, 2 run
//! cancelled, 3 startup invariant violation (missing/corrupt state, not a
//! repo, agent binary unavailable).

use std::path::Path;
use std::process::ExitCode;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::warn;

use forge_core::agent::{Agent, ClaudeAdapter};
use forge_core::engine::events::{EventSink, TaskEvent, TaskEventKind};
use forge_core::engine::{Engine, EngineError, RunSummary};
use forge_core::git::{CliGit, Git};
use forge_state::Store;

const EXIT_CANCELLED: u8 = 2;
const EXIT_STARTUP: u8 = 3;

pub async fn run(root: &Path, verbose: bool) -> ExitCode {
    let store = Store::new(root);

    let mut state = match store.load() {
        Ok(Some(state)) => state,
        Ok(None) => {
            eprintln!("error: no forge state found; run `forge init` first");
            return ExitCode::from(EXIT_STARTUP);
        }
        Err(e) => {
            eprintln!("error: {e}");
            return ExitCode::from(EXIT_STARTUP);
        }
    };

    let git = match CliGit::new(root) {
        Ok(git) => git,
        Err(e) => {
            eprintln!("error: {e}");
            return ExitCode::from(EXIT_STARTUP);
        }
    };

    let cancel = CancellationToken::new();
    let trip = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!("\ninterrupt received, finishing current step...");
            trip.cancel();
        }
    });

    let engine = Engine::new(
        store,
        Arc::new(git) as Arc<dyn Git>,
        Arc::new(ClaudeAdapter::new()) as Arc<dyn Agent>,
        console_sink(verbose),
        cancel,
    );

    match engine.run(&mut state).await {
        Ok(summary) => {
            print_summary(&summary);
            ExitCode::from(summary.exit_code() as u8)
        }
        Err(EngineError::Cancelled) => {
            eprintln!("run cancelled");
            ExitCode::from(EXIT_CANCELLED)
        }
        Err(EngineError::Startup(reason)) => {
            eprintln!("error: {reason}");
            ExitCode::from(EXIT_STARTUP)
        }
        Err(e) => {
            eprintln!("error: {e}");
            ExitCode::from(EXIT_STARTUP)
        }
    }
}

/// Event sink that renders progress lines. Chunks stream through only in
/// verbose mode; everything else becomes one line per event.
fn console_sink(verbose: bool) -> EventSink {
    Arc::new(move |event: TaskEvent| match event.kind {
        TaskEventKind::ClaudeChunk => {
            if verbose {
                use std::io::Write;
                print!("{}", event.message);
                let _ = std::io::stdout().flush();
            }
        }
        TaskEventKind::TaskStart
        | TaskEventKind::BranchCreated
        | TaskEventKind::ClaudeStart
        | TaskEventKind::ClaudeDone
        | TaskEventKind::TestStart
        | TaskEventKind::TestPassed
        | TaskEventKind::BuildStart
        | TaskEventKind::BuildPassed
        | TaskEventKind::Commit
        | TaskEventKind::Push
        | TaskEventKind::TaskDone => {
            println!("[{}] {}", event.task_id, event.message);
        }
        TaskEventKind::TestFailed
        | TaskEventKind::BuildFailed
        | TaskEventKind::Retry
        | TaskEventKind::TaskFailed
        | TaskEventKind::TaskSkipped
        | TaskEventKind::Error => {
            println!("[{}] {}: {}", event.task_id, event.kind, event.message);
            if let Some(detail) = event.detail {
                warn!(task_id = %event.task_id, kind = %event.kind, detail = %detail, "task event");
            }
        }
    })
}

fn print_summary(summary: &RunSummary) {
    println!();
    println!(
        "Run finished: {} done, {} failed, {} skipped ({} retries, {:.1}s)",
        summary.done, summary.failed, summary.skipped, summary.retries, summary.wall_seconds
    );
}

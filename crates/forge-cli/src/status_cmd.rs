//! `forge status` command: plan progress and per-task status.

use std::path::Path;

use anyhow::{Context, Result};

use forge_state::{Store, TaskStatus};

pub fn run(root: &Path) -> Result<()> {
    let store = Store::new(root);
    let state = store
        .load()
        .context("failed to load forge state")?
        .context("no forge state found; run `forge init` first")?;

    println!("Project: {}", state.project_name);
    println!("Phase: {}", state.phase);
    println!("Plan version: {}", state.plan_version);
    println!();

    if state.tasks.is_empty() {
        println!("No tasks in plan.");
        return Ok(());
    }

    let count = |status: TaskStatus| state.tasks.iter().filter(|t| t.status == status).count();
    println!(
        "Progress: {}/{} done",
        count(TaskStatus::Done),
        state.tasks.len()
    );
    println!(
        "  pending={} in_progress={} done={} failed={} skipped={} cancelled={}",
        count(TaskStatus::Pending),
        count(TaskStatus::InProgress),
        count(TaskStatus::Done),
        count(TaskStatus::Failed),
        count(TaskStatus::Skipped),
        count(TaskStatus::Cancelled),
    );
    println!();

    println!("Tasks:");
    for task in &state.tasks {
        let icon = match task.status {
            TaskStatus::Pending => ".",
            TaskStatus::InProgress => "*",
            TaskStatus::Done => "+",
            TaskStatus::Failed => "!",
            TaskStatus::Skipped => "-",
            TaskStatus::Cancelled => "x",
        };
        let mut line = format!("  [{}] {} {}", icon, task.id, task.title);
        if task.retries > 0 {
            line.push_str(&format!(" (retries: {})", task.retries));
        }
        if let Some(ref sha) = task.git_sha {
            line.push_str(&format!(" @{}", &sha[..sha.len().min(8)]));
        }
        println!("{line}");
    }

    Ok(())
}

//! `forge init` and `forge task ...` commands: the thin CLI surface over
//! the task store.

use std::path::Path;

use anyhow::{Context, Result, bail};

use forge_state::{Complexity, Store};

use crate::TaskCommands;

/// `forge init`: create `.forge/` with an empty state.
pub fn cmd_init(root: &Path, name: Option<&str>) -> Result<()> {
    let project_name = match name {
        Some(name) => name.to_string(),
        None => root
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("project")
            .to_string(),
    };

    let store = Store::new(root);
    store
        .init(&project_name)
        .context("failed to initialize forge state")?;

    println!("Initialized forge state at {}", store.state_path().display());
    println!("  project: {project_name}");
    Ok(())
}

pub fn run(root: &Path, command: TaskCommands) -> Result<()> {
    let store = Store::new(root);
    let mut state = store
        .load()
        .context("failed to load forge state")?
        .context("no forge state found; run `forge init` first")?;

    match command {
        TaskCommands::Add {
            title,
            description,
            complexity,
            criteria,
            depends_on,
        } => {
            let complexity: Complexity = complexity
                .parse()
                .map_err(|e| anyhow::anyhow!("{e}"))?;

            for dep in &depends_on {
                if state.find_task(dep).is_none() {
                    bail!("unknown dependency: {dep}");
                }
            }

            let id = state.add_task(&title, description, complexity, criteria, depends_on);
            store.save(&mut state)?;
            println!("Added {id}: {title}");
        }
        TaskCommands::List => {
            if state.tasks.is_empty() {
                println!("No tasks in plan.");
                return Ok(());
            }
            for task in &state.tasks {
                let deps = if task.depends_on.is_empty() {
                    String::new()
                } else {
                    format!(" (depends on {})", task.depends_on.join(", "))
                };
                println!(
                    "{}  [{}] {}{}",
                    task.id, task.status, task.title, deps
                );
            }
        }
        TaskCommands::Cancel { id, reason } => {
            state
                .cancel_task(&id, reason)
                .map_err(|e| anyhow::anyhow!("{e}"))?;
            store.save(&mut state)?;
            println!("Cancelled {id}");
        }
    }

    Ok(())
}

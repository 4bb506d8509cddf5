//! `forge log` command: print a task's persisted execution log.

use std::path::Path;

use anyhow::{Context, Result};

use forge_state::Store;

pub fn run(root: &Path, task_id: &str) -> Result<()> {
    let store = Store::new(root);
    let log = store
        .read_task_log(task_id)
        .with_context(|| format!("no log found for {task_id}"))?;
    print!("{log}");
    Ok(())
}

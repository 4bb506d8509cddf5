//! The on-disk store under `${root}/.forge/`.
//!
//! Layout:
//!
//! ```text
//! .forge/
//!   state.json        -- the persisted State (sole writer: the engine)
//!   .gitignore        -- ignores logs/
//!   logs/<task>.log   -- per-task execution transcripts
//! ```
//!
//! Saves are atomic: the state is written to a sibling temp file, fsynced,
//! then renamed over the target. A crash leaves either the old state or the
//! new state, never a torn file. Concurrent readers (e.g. a status view)
//! may observe a committed prior version but never a partial write.

use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::Utc;
use thiserror::Error;
use tracing::{debug, warn};

use crate::model::State;

const FORGE_DIR: &str = ".forge";
const STATE_FILE: &str = "state.json";
const LOGS_DIR: &str = "logs";

/// Errors from store operations.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("state already initialized at {0}")]
    AlreadyInitialized(PathBuf),

    #[error("corrupt state: {0}")]
    CorruptState(String),

    #[error("failed to serialize state: {0}")]
    Serialize(serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Handle to the `.forge/` directory of one project root.
#[derive(Debug, Clone)]
pub struct Store {
    root: PathBuf,
}

impl Store {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn forge_dir(&self) -> PathBuf {
        self.root.join(FORGE_DIR)
    }

    pub fn state_path(&self) -> PathBuf {
        self.forge_dir().join(STATE_FILE)
    }

    pub fn logs_dir(&self) -> PathBuf {
        self.forge_dir().join(LOGS_DIR)
    }

    pub fn task_log_path(&self, task_id: &str) -> PathBuf {
        self.logs_dir().join(format!("{task_id}.log"))
    }

    /// Create `.forge/` with its `.gitignore` and an empty default state.
    ///
    /// Fails with [`StoreError::AlreadyInitialized`] if a state file is
    /// already present.
    pub fn init(&self, project_name: &str) -> Result<State, StoreError> {
        let state_path = self.state_path();
        if state_path.exists() {
            return Err(StoreError::AlreadyInitialized(state_path));
        }

        fs::create_dir_all(self.forge_dir())?;
        fs::write(self.forge_dir().join(".gitignore"), "logs/\n")?;

        let mut state = State::new(project_name);
        self.save(&mut state)?;
        debug!(path = %state_path.display(), "initialized forge state");
        Ok(state)
    }

    /// Load the state, or `Ok(None)` when no state file exists.
    ///
    /// Any `in_progress` task on disk is the residue of a killed run; it is
    /// promoted to `failed("interrupted")` here so every consumer observes
    /// a consistent view, and the demotion is persisted immediately.
    pub fn load(&self) -> Result<Option<State>, StoreError> {
        let path = self.state_path();
        let contents = match fs::read_to_string(&path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        let mut state: State = serde_json::from_str(&contents)
            .map_err(|e| StoreError::CorruptState(format!("{}: {e}", path.display())))?;

        state.validate().map_err(StoreError::CorruptState)?;

        let demoted = state.demote_interrupted();
        if !demoted.is_empty() {
            warn!(tasks = ?demoted, "demoted interrupted in_progress tasks to failed");
            self.save(&mut state)?;
        }

        Ok(Some(state))
    }

    /// Stamp `updated_at` and persist atomically.
    ///
    /// The write goes to `state.json.tmp`, is fsynced, then renamed over
    /// `state.json`. The save is synchronous: callers may announce the
    /// transition (events, console) only after this returns.
    pub fn save(&self, state: &mut State) -> Result<(), StoreError> {
        state.updated_at = Utc::now();

        let json = serde_json::to_string_pretty(state).map_err(StoreError::Serialize)?;

        let path = self.state_path();
        let tmp = self.forge_dir().join(format!("{STATE_FILE}.tmp"));
        {
            let mut file = File::create(&tmp)?;
            file.write_all(json.as_bytes())?;
            file.write_all(b"\n")?;
            file.sync_all()?;
        }
        fs::rename(&tmp, &path)?;

        Ok(())
    }

    /// Write a per-task execution log, creating `logs/` on demand.
    pub fn write_task_log(&self, task_id: &str, contents: &str) -> Result<(), StoreError> {
        fs::create_dir_all(self.logs_dir())?;
        fs::write(self.task_log_path(task_id), contents)?;
        Ok(())
    }

    /// Read a per-task execution log.
    pub fn read_task_log(&self, task_id: &str) -> Result<String, StoreError> {
        Ok(fs::read_to_string(self.task_log_path(task_id))?)
    }
}

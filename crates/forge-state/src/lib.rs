//! Durable plan state for the forge runner.
//!
//! This crate owns the data model (tasks, settings, plan metadata) and the
//! JSON-backed store under `.forge/` in the project root. The store is the
//! single source of truth for resume: it is written atomically after every
//! meaningful task transition, so a crashed run always restarts from a
//! correct prefix of the intended history.

pub mod model;
pub mod store;

pub use model::{
    CascadeOutcome, Complexity, MaxTurns, Phase, PlanRevision, Settings, State, StateError, Task,
    TaskStatus,
};
pub use store::{Store, StoreError};

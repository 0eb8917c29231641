//! Core domain models for the swarm engine.
//!
//! This module contains the task data model and the dependency graph
//! the scheduler executes.

pub mod dag;
pub mod task;

pub use dag::{ReadySet, TaskDAG};
pub use task::{Priority, Task, TaskId, TaskState};

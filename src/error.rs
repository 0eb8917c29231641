use std::time::Duration;

use thiserror::Error;

use crate::core::task::TaskId;

#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML parse error: {0}")]
    TomlParse(#[from] toml::de::Error),

    #[error("TOML serialize error: {0}")]
    TomlSerialize(#[from] toml::ser::Error),

    #[error("No home directory")]
    NoHomeDir,

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Dependency cycle detected: {}", format_cycle(.cycle))]
    CycleDetected { cycle: Vec<TaskId> },

    #[error("Task {task} has invalid dependency {dependency}: {reason}")]
    InvalidDependency {
        task: TaskId,
        dependency: TaskId,
        reason: String,
    },

    #[error("Pool queue is full ({queue_length}/{max_queue_size})")]
    PoolExhausted {
        queue_length: usize,
        max_queue_size: usize,
    },

    #[error("Operation timed out after {0:?}")]
    Timeout(Duration),

    #[error("Pool drained")]
    PoolDrained,

    #[error("Task {task_id} timed out after {timeout:?}")]
    TaskTimeout { task_id: TaskId, timeout: Duration },

    #[error("Circuit breaker {name} is OPEN")]
    CircuitOpen { name: String },

    #[error("Budget exceeded: {reason}")]
    BudgetExceeded { reason: String },

    #[error("{0}")]
    Agent(String),

    #[error("Agent not available: {0}")]
    AgentNotAvailable(String),

    #[error("Task join error: {0}")]
    TaskJoin(String),

    #[error("Checkpoint not found: {0}")]
    CheckpointNotFound(String),
}

pub type Result<T> = std::result::Result<T, Error>;

fn format_cycle(cycle: &[TaskId]) -> String {
    cycle
        .iter()
        .map(|id| id.to_string())
        .collect::<Vec<_>>()
        .join(" -> ")
}

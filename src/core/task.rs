//! Task data model for the execution DAG.
//!
//! Tasks are the atomic units of work dispatched to agents. They are plain
//! data: the caller decides ids, agent references, dependencies and
//! priorities, and the engine treats them as opaque input.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Unique identifier for a task within a graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(pub u64);

impl std::fmt::Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for TaskId {
    type Err = std::num::ParseIntError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(Self(s.trim().parse()?))
    }
}

impl From<u64> for TaskId {
    fn from(value: u64) -> Self {
        Self(value)
    }
}

/// Priority label attached to a task by whatever produced the graph.
///
/// Only used to order tasks that are ready at the same time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Critical,
    High,
    Medium,
    Low,
}

impl Priority {
    /// Numeric score; higher runs first.
    pub fn score(&self) -> u8 {
        match self {
            Priority::Critical => 4,
            Priority::High => 3,
            Priority::Medium => 2,
            Priority::Low => 1,
        }
    }
}

impl Default for Priority {
    fn default() -> Self {
        Self::Medium
    }
}

impl std::fmt::Display for Priority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Priority::Critical => write!(f, "critical"),
            Priority::High => write!(f, "high"),
            Priority::Medium => write!(f, "medium"),
            Priority::Low => write!(f, "low"),
        }
    }
}

/// Task state in its lifecycle.
///
/// `Pending -> Ready -> Running -> {Succeeded | Failed}`. Terminal states
/// are final. A task that is never dispatched (the run was cancelled) goes
/// straight to `Failed` from `Pending` or `Ready`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    /// Waiting for at least one dependency.
    #[default]
    Pending,
    /// Every dependency is terminal; waiting for dispatch.
    Ready,
    /// An attempt is in flight (or waiting out a retry delay).
    Running,
    /// Finished successfully.
    Succeeded,
    /// Finished unsuccessfully after its last attempt.
    Failed,
}

impl TaskState {
    /// Check if the state is terminal (Succeeded or Failed).
    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskState::Succeeded | TaskState::Failed)
    }

    /// Whether the lifecycle allows moving from `self` to `next`.
    pub fn can_transition_to(&self, next: TaskState) -> bool {
        use TaskState::*;
        matches!(
            (self, next),
            (Pending, Ready)
                | (Ready, Running)
                | (Running, Succeeded)
                | (Pending | Ready | Running, Failed)
        )
    }
}

impl std::fmt::Display for TaskState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TaskState::Pending => write!(f, "pending"),
            TaskState::Ready => write!(f, "ready"),
            TaskState::Running => write!(f, "running"),
            TaskState::Succeeded => write!(f, "succeeded"),
            TaskState::Failed => write!(f, "failed"),
        }
    }
}

/// A single task in the execution DAG.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    /// Unique identifier for this task.
    pub id: TaskId,
    /// Which agent (and therefore which provider breaker) runs the task.
    #[serde(alias = "agent")]
    pub agent_ref: String,
    /// What the task should accomplish.
    pub description: String,
    /// Tasks that must reach a terminal state before this one starts.
    #[serde(default)]
    pub dependencies: BTreeSet<TaskId>,
    /// Optional ordering hint among simultaneously ready tasks.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority: Option<Priority>,
    /// Expected token consumption, used for budget admission.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub estimated_tokens: Option<u64>,
}

impl Task {
    /// Create a task with no dependencies.
    pub fn new(id: impl Into<TaskId>, agent_ref: &str, description: &str) -> Self {
        Self {
            id: id.into(),
            agent_ref: agent_ref.to_string(),
            description: description.to_string(),
            dependencies: BTreeSet::new(),
            priority: None,
            estimated_tokens: None,
        }
    }

    /// Add dependencies on the given task ids.
    pub fn depends_on<I, T>(mut self, ids: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<TaskId>,
    {
        self.dependencies.extend(ids.into_iter().map(Into::into));
        self
    }

    /// Set the priority label.
    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = Some(priority);
        self
    }

    /// Set the token estimate used for budget admission.
    pub fn with_estimate(mut self, tokens: u64) -> Self {
        self.estimated_tokens = Some(tokens);
        self
    }

    /// Score used to order ready tasks. Unlabelled tasks count as medium.
    pub fn priority_score(&self) -> u8 {
        self.priority.unwrap_or_default().score()
    }
}

//! Graph execution engine.
//!
//! The Scheduler validates a task graph, then dispatches ready tasks
//! through the concurrency gate while respecting dependencies. Each attempt
//! is wrapped in the agent's circuit breaker and a per-attempt timeout, is
//! admitted by the token budget, and is retried with exponential backoff.
//!
//! Completion drives the loop: up to `max_concurrency` tasks are in flight
//! across the whole graph, and every finished task immediately unlocks its
//! dependents. A task sleeping out a retry delay gives its slot back to the
//! loop; when it wakes it competes for a pool slot like any other attempt.
//! A failed task still counts as resolved, so one failing branch never
//! stalls unrelated work; its output is simply left out of its dependents'
//! context.
//!
//! Each task moves through [`TaskState`]; every transition is emitted as
//! [`SchedulerEvent::TaskStateChanged`] and can be read back with
//! [`Scheduler::state_of`].

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use futures::stream::{FuturesUnordered, StreamExt};
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::sync::{mpsc, Notify};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::agent::{Agent, AgentReply, Invocation};
use crate::config::EngineConfig;
use crate::core::dag::{ReadySet, TaskDAG};
use crate::core::task::{Task, TaskId, TaskState};
use crate::error::{Error, Result};
use crate::orchestration::budget::{ExecutionTier, TokenBudgetManager, TokenUsage};
use crate::orchestration::checkpoint::{CheckpointManager, CheckpointState};
use crate::orchestration::circuit_breaker::{CircuitBreaker, CircuitBreakerRegistry};
use crate::orchestration::gate::ConcurrencyGate;
use crate::util::{elapsed_ms, lock, spawn_with_timeout};
use crate::{swlog, swlog_debug, swlog_warn};

/// Why a task failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// An attempt exceeded the task timeout.
    Timeout,
    /// The agent's circuit breaker was open.
    CircuitOpen,
    /// The budget did not admit the attempt.
    BudgetExceeded,
    /// The pool queue was full or drained.
    PoolExhausted,
    /// No pool slot became free within the acquire timeout.
    QueueTimeout,
    /// The agent call itself returned an error.
    Agent,
    /// The run was cancelled before the task was dispatched.
    Cancelled,
}

impl FailureKind {
    pub fn classify(err: &Error) -> Self {
        match err {
            Error::TaskTimeout { .. } => FailureKind::Timeout,
            Error::CircuitOpen { .. } => FailureKind::CircuitOpen,
            Error::BudgetExceeded { .. } => FailureKind::BudgetExceeded,
            Error::PoolExhausted { .. } | Error::PoolDrained => FailureKind::PoolExhausted,
            Error::Timeout(_) => FailureKind::QueueTimeout,
            _ => FailureKind::Agent,
        }
    }

    /// Whether another attempt could change the outcome.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, FailureKind::BudgetExceeded | FailureKind::Cancelled)
    }
}

impl std::fmt::Display for FailureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            FailureKind::Timeout => "timeout",
            FailureKind::CircuitOpen => "circuit_open",
            FailureKind::BudgetExceeded => "budget_exceeded",
            FailureKind::PoolExhausted => "pool_exhausted",
            FailureKind::QueueTimeout => "queue_timeout",
            FailureKind::Agent => "agent",
            FailureKind::Cancelled => "cancelled",
        };
        write!(f, "{}", s)
    }
}

/// How one attempt ended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum AttemptOutcome {
    Succeeded,
    Failed { kind: FailureKind, error: String },
}

/// Immutable record of a single attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttemptRecord {
    pub attempt: u32,
    pub started_at: DateTime<Utc>,
    pub duration_ms: u64,
    pub outcome: AttemptOutcome,
}

/// Final outcome of one task. The last attempt decides it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub task_id: TaskId,
    pub agent_ref: String,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<FailureKind>,
    /// Wall time from first dispatch to the terminal state.
    pub duration_ms: u64,
    /// Number of the last attempt; 0 if the task never ran.
    pub attempt: u32,
    #[serde(default)]
    pub attempts: Vec<AttemptRecord>,
}

impl ExecutionResult {
    fn cancelled(task: &Task) -> Self {
        Self {
            task_id: task.id,
            agent_ref: task.agent_ref.clone(),
            success: false,
            output: None,
            error: Some("Cancelled before dispatch".to_string()),
            failure: Some(FailureKind::Cancelled),
            duration_ms: 0,
            attempt: 0,
            attempts: Vec::new(),
        }
    }

    fn is_cancelled(&self) -> bool {
        self.failure == Some(FailureKind::Cancelled)
    }
}

/// Lifecycle notifications emitted while a graph runs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SchedulerEvent {
    /// A task moved to a new lifecycle state.
    TaskStateChanged {
        task_id: TaskId,
        from: TaskState,
        to: TaskState,
    },
    /// An attempt of a task is starting.
    TaskStarted {
        task_id: TaskId,
        agent_ref: String,
        attempt: u32,
    },
    /// An attempt failed and another one follows after `delay`.
    TaskRetrying {
        task_id: TaskId,
        attempt: u32,
        delay: Duration,
        error: String,
    },
    TaskCompleted {
        task_id: TaskId,
        duration_ms: u64,
    },
    TaskFailed {
        task_id: TaskId,
        kind: FailureKind,
        error: String,
    },
    /// A checkpoint was taken. `persisted` is false when only the
    /// manager's in-memory copy exists.
    CheckpointWritten {
        checkpoint_id: String,
        phase: String,
        persisted: bool,
    },
    /// The run was cancelled with `undispatched` tasks never started.
    Cancelled {
        undispatched: usize,
    },
    /// Every task has a result.
    AllTasksComplete {
        succeeded: usize,
        failed: usize,
    },
}

/// Context handed to a task: outputs of its successful dependencies in
/// ascending id order. Failed dependencies contribute nothing.
pub fn dependency_context(dag: &TaskDAG, outputs: &HashMap<TaskId, String>, id: &TaskId) -> String {
    let mut deps = dag.dependencies_of(id);
    deps.sort();
    deps.iter()
        .filter_map(|dep| outputs.get(dep).map(|out| format!("[task {}]\n{}", dep, out)))
        .collect::<Vec<_>>()
        .join("\n\n")
}

/// Checkpoint payload for the results gathered so far. Tasks cancelled
/// before dispatch stay pending so a resume runs them.
fn snapshot(dag: &TaskDAG, results: &[ExecutionResult], phase: &str) -> CheckpointState {
    let kept: Vec<ExecutionResult> = results
        .iter()
        .filter(|r| !r.is_cancelled())
        .cloned()
        .collect();
    let completed: Vec<TaskId> = kept.iter().map(|r| r.task_id).collect();
    let done: HashSet<TaskId> = completed.iter().copied().collect();
    let mut pending: Vec<TaskId> = dag
        .task_ids()
        .into_iter()
        .filter(|id| !done.contains(id))
        .collect();
    pending.sort();
    CheckpointState {
        completed_task_ids: completed,
        pending_task_ids: pending,
        results: kept,
        context: json!({ "phase": phase, "total_tasks": dag.task_count() }),
    }
}

/// Tasks of one run that are sleeping out a retry delay.
#[derive(Debug, Default)]
struct Backoff {
    sleeping: AtomicUsize,
    wake: Notify,
}

impl Backoff {
    fn sleeping(&self) -> usize {
        self.sleeping.load(Ordering::SeqCst)
    }

    /// Sleep for `delay` (or until `cancel` fires) while counted as idle.
    async fn wait(&self, delay: Duration, cancel: &CancellationToken) {
        self.sleeping.fetch_add(1, Ordering::SeqCst);
        self.wake.notify_one();
        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = cancel.cancelled() => {}
        }
        self.sleeping.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Dependency-aware executor for task graphs.
///
/// # Example
///
/// ```ignore
/// use std::sync::Arc;
/// use swarm::agent::{AgentBackend, EchoAgent};
/// use swarm::config::EngineConfig;
/// use swarm::core::Task;
/// use swarm::orchestration::Scheduler;
///
/// let scheduler = Scheduler::new(EngineConfig::default(), Arc::new(AgentBackend::Echo(EchoAgent)));
/// let results = scheduler
///     .execute(vec![
///         Task::new(1, "coder", "write it"),
///         Task::new(2, "reviewer", "review it").depends_on([1]),
///     ])
///     .await?;
/// ```
pub struct Scheduler {
    config: EngineConfig,
    agent: Arc<dyn Agent>,
    gate: ConcurrencyGate,
    breakers: Arc<CircuitBreakerRegistry>,
    budget: Option<Arc<TokenBudgetManager>>,
    checkpoints: Option<(Arc<CheckpointManager>, String)>,
    events: Option<mpsc::UnboundedSender<SchedulerEvent>>,
    cancel: CancellationToken,
    states: Mutex<HashMap<TaskId, TaskState>>,
}

impl Scheduler {
    pub fn new(config: EngineConfig, agent: Arc<dyn Agent>) -> Self {
        let gate = ConcurrencyGate::new(config.pool_config(), config.rate_limit.clone());
        Self {
            config,
            agent,
            gate,
            breakers: Arc::new(CircuitBreakerRegistry::new()),
            budget: None,
            checkpoints: None,
            events: None,
            cancel: CancellationToken::new(),
            states: Mutex::new(HashMap::new()),
        }
    }

    /// Gate every attempt on `budget` and track usage into it.
    pub fn with_budget(mut self, budget: Arc<TokenBudgetManager>) -> Self {
        self.budget = Some(budget);
        self
    }

    /// Write a checkpoint for `mission_id` whenever a wave completes.
    pub fn with_checkpoints(mut self, manager: Arc<CheckpointManager>, mission_id: &str) -> Self {
        self.checkpoints = Some((manager, mission_id.to_string()));
        self
    }

    pub fn with_events(mut self, tx: mpsc::UnboundedSender<SchedulerEvent>) -> Self {
        self.events = Some(tx);
        self
    }

    /// Share breakers with other schedulers instead of using a private set.
    pub fn with_breakers(mut self, breakers: Arc<CircuitBreakerRegistry>) -> Self {
        self.breakers = breakers;
        self
    }

    /// Stop dispatching once `token` is cancelled.
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn gate(&self) -> &ConcurrencyGate {
        &self.gate
    }

    pub fn breakers(&self) -> &Arc<CircuitBreakerRegistry> {
        &self.breakers
    }

    /// State of `id` in the current or most recent run.
    pub fn state_of(&self, id: &TaskId) -> Option<TaskState> {
        lock(&self.states).get(id).copied()
    }

    /// Every task's state in the current or most recent run.
    pub fn states(&self) -> BTreeMap<TaskId, TaskState> {
        lock(&self.states)
            .iter()
            .map(|(id, state)| (*id, *state))
            .collect()
    }

    /// Run every task and return one result per task in completion order.
    ///
    /// # Errors
    ///
    /// Only configuration and graph errors (`Validation`,
    /// `CycleDetected`, `InvalidDependency`), raised before anything runs. Task failures are
    /// reported in the results.
    pub async fn execute(&self, tasks: Vec<Task>) -> Result<Vec<ExecutionResult>> {
        self.resume(tasks, CheckpointState::default()).await
    }

    /// Like [`execute`](Self::execute), but tasks listed as completed in
    /// `state` (and present in its results) are not run again. Their
    /// results come first in the returned list.
    pub async fn resume(
        &self,
        tasks: Vec<Task>,
        state: CheckpointState,
    ) -> Result<Vec<ExecutionResult>> {
        self.config.validate()?;
        let dag = TaskDAG::from_tasks(tasks)?;
        let levels = dag.levels()?;
        {
            let mut states = lock(&self.states);
            states.clear();
            states.extend(dag.task_ids().into_iter().map(|id| (id, TaskState::Pending)));
        }

        let completed: HashSet<TaskId> = state.completed_task_ids.iter().copied().collect();
        let mut results: Vec<ExecutionResult> = Vec::with_capacity(dag.task_count());
        let mut outputs: HashMap<TaskId, String> = HashMap::new();
        let mut restored: HashSet<TaskId> = HashSet::new();
        for result in state.results {
            let id = result.task_id;
            if !completed.contains(&id)
                || !dag.contains_task(&id)
                || result.is_cancelled()
                || !restored.insert(id)
            {
                continue;
            }
            let terminal = if result.success {
                outputs.insert(id, result.output.clone().unwrap_or_default());
                TaskState::Succeeded
            } else {
                TaskState::Failed
            };
            lock(&self.states).insert(id, terminal);
            results.push(result);
        }
        if !restored.is_empty() {
            swlog!("scheduler: resuming with {} task(s) restored", restored.len());
        }

        let mut level_of: HashMap<TaskId, usize> = HashMap::new();
        let mut level_open: Vec<usize> = vec![0; levels.len()];
        for (level, ids) in levels.iter().enumerate() {
            for id in ids {
                if !restored.contains(id) {
                    level_of.insert(*id, level);
                    level_open[level] += 1;
                }
            }
        }

        let mut ready = ReadySet::with_resolved(&dag, &restored);
        for id in ready.queued() {
            self.set_state(id, TaskState::Ready);
        }
        let limit = self.config.max_concurrency;
        let backoff = Backoff::default();
        let mut in_flight: FuturesUnordered<BoxFuture<'_, ExecutionResult>> =
            FuturesUnordered::new();
        let mut cancelled = false;

        swlog!(
            "scheduler: executing {} task(s), {} level(s), max_concurrency={}",
            dag.task_count() - restored.len(),
            levels.len(),
            limit
        );

        loop {
            if !cancelled && self.cancel.is_cancelled() {
                cancelled = true;
                swlog_warn!(
                    "scheduler: cancelled, waiting for {} in-flight task(s)",
                    in_flight.len()
                );
            }
            if !cancelled {
                while in_flight.len().saturating_sub(backoff.sleeping()) < limit {
                    let Some(id) = ready.pop() else { break };
                    let Some(task) = dag.get_task(&id) else {
                        continue;
                    };
                    self.set_state(id, TaskState::Running);
                    let context = dependency_context(&dag, &outputs, &id);
                    swlog_debug!(
                        "scheduler: dispatching task {} to {} ({} in flight)",
                        id,
                        task.agent_ref,
                        in_flight.len()
                    );
                    in_flight.push(self.run_task(task.clone(), context, &backoff).boxed());
                }
            }

            if in_flight.is_empty() {
                break;
            }

            let finished = tokio::select! {
                biased;
                _ = self.cancel.cancelled(), if !cancelled => continue,
                next = in_flight.next() => next,
                _ = backoff.wake.notified() => continue,
            };
            let Some(result) = finished else { break };

            let id = result.task_id;
            if result.success {
                outputs.insert(id, result.output.clone().unwrap_or_default());
                self.set_state(id, TaskState::Succeeded);
                self.emit(SchedulerEvent::TaskCompleted {
                    task_id: id,
                    duration_ms: result.duration_ms,
                });
            } else {
                self.set_state(id, TaskState::Failed);
                self.emit(SchedulerEvent::TaskFailed {
                    task_id: id,
                    kind: result.failure.unwrap_or(FailureKind::Agent),
                    error: result.error.clone().unwrap_or_default(),
                });
            }
            for unlocked in ready.resolve(id) {
                self.set_state(unlocked, TaskState::Ready);
            }
            results.push(result);

            if let Some(&level) = level_of.get(&id) {
                level_open[level] -= 1;
                if level_open[level] == 0 {
                    self.checkpoint(&dag, &results, &format!("wave-{}", level + 1))
                        .await;
                }
            }
        }

        let undispatched = ready.undispatched();
        if !undispatched.is_empty() {
            swlog_warn!(
                "scheduler: {} task(s) never dispatched",
                undispatched.len()
            );
            self.emit(SchedulerEvent::Cancelled {
                undispatched: undispatched.len(),
            });
            for id in &undispatched {
                if let Some(task) = dag.get_task(id) {
                    self.set_state(*id, TaskState::Failed);
                    results.push(ExecutionResult::cancelled(task));
                }
            }
            self.checkpoint(&dag, &results, "cancelled").await;
        }

        let succeeded = results.iter().filter(|r| r.success).count();
        let failed = results.len() - succeeded;
        swlog!(
            "scheduler: finished, {} succeeded, {} failed",
            succeeded,
            failed
        );
        self.emit(SchedulerEvent::AllTasksComplete { succeeded, failed });
        Ok(results)
    }

    /// Run one task to its terminal state, retrying retryable failures.
    async fn run_task(&self, task: Task, context: String, backoff: &Backoff) -> ExecutionResult {
        let started = Instant::now();
        let breaker = self
            .breakers
            .get_or_create(&task.agent_ref, &self.config.circuit_breaker);
        let max_attempts = self.config.max_retries.saturating_add(1);
        let mut attempts: Vec<AttemptRecord> = Vec::new();
        let mut attempt = 0;

        loop {
            attempt += 1;
            self.emit(SchedulerEvent::TaskStarted {
                task_id: task.id,
                agent_ref: task.agent_ref.clone(),
                attempt,
            });
            let started_at = Utc::now();
            let attempt_start = Instant::now();
            let outcome = self.attempt(&task, &context, attempt, &breaker).await;
            let duration_ms = elapsed_ms(attempt_start);

            let err = match outcome {
                Ok(reply) => {
                    attempts.push(AttemptRecord {
                        attempt,
                        started_at,
                        duration_ms,
                        outcome: AttemptOutcome::Succeeded,
                    });
                    swlog!("task {} succeeded on attempt {}", task.id, attempt);
                    return ExecutionResult {
                        task_id: task.id,
                        agent_ref: task.agent_ref,
                        success: true,
                        output: Some(reply.content),
                        error: None,
                        failure: None,
                        duration_ms: elapsed_ms(started),
                        attempt,
                        attempts,
                    };
                }
                Err(err) => err,
            };

            let kind = FailureKind::classify(&err);
            let message = err.to_string();
            attempts.push(AttemptRecord {
                attempt,
                started_at,
                duration_ms,
                outcome: AttemptOutcome::Failed {
                    kind,
                    error: message.clone(),
                },
            });

            let mut give_up = !kind.is_retryable() || attempt >= max_attempts;
            if !give_up {
                let delay = self.config.retry_delay(attempt + 1);
                swlog_debug!(
                    "task {} attempt {} failed ({}), retrying in {:?}",
                    task.id,
                    attempt,
                    message,
                    delay
                );
                self.emit(SchedulerEvent::TaskRetrying {
                    task_id: task.id,
                    attempt,
                    delay,
                    error: message.clone(),
                });
                backoff.wait(delay, &self.cancel).await;
                give_up = self.cancel.is_cancelled();
            }

            if give_up {
                swlog_warn!(
                    "task {} failed after {} attempt(s): {}",
                    task.id,
                    attempt,
                    message
                );
                return ExecutionResult {
                    task_id: task.id,
                    agent_ref: task.agent_ref,
                    success: false,
                    output: None,
                    error: Some(message),
                    failure: Some(kind),
                    duration_ms: elapsed_ms(started),
                    attempt,
                    attempts,
                };
            }
        }
    }

    /// One attempt: budget admission, then rate token and pool slot, then
    /// the breaker-wrapped agent call under the task timeout.
    ///
    /// Successful calls charge the reported usage. Failed calls that reached
    /// the agent charge the task's estimate as input tokens, since the
    /// provider may have billed them; attempts stopped before the agent
    /// (budget, breaker, pool) charge nothing.
    async fn attempt(
        &self,
        task: &Task,
        context: &str,
        attempt: u32,
        breaker: &CircuitBreaker,
    ) -> Result<AgentReply> {
        let estimate = task.estimated_tokens.unwrap_or(0);
        let mut tier = ExecutionTier::Pro;
        if let Some(budget) = &self.budget {
            let decision = budget.can_proceed(estimate);
            if !decision.allowed {
                return Err(Error::BudgetExceeded {
                    reason: decision
                        .reason
                        .unwrap_or_else(|| "budget exhausted".to_string()),
                });
            }
            if self.config.downgrade_tier {
                tier = budget.suggest_model(estimate);
            }
        }

        let invocation = Invocation {
            context: context.to_string(),
            tier,
            attempt,
        };
        let timeout = self.config.task_timeout();
        let task_id = task.id;
        let agent = Arc::clone(&self.agent);
        let owned = task.clone();
        let called = AtomicBool::new(false);
        let reached = &called;

        let outcome = self
            .gate
            .execute(move || {
                breaker.call(move || async move {
                    reached.store(true, Ordering::SeqCst);
                    let call = async move { agent.invoke(&owned, &invocation).await };
                    match spawn_with_timeout(timeout, call).await {
                        Err(Error::Timeout(_)) => Err(Error::TaskTimeout { task_id, timeout }),
                        other => other,
                    }
                })
            })
            .await;

        if let Some(budget) = &self.budget {
            match &outcome {
                Ok(reply) => budget.track(task.id, reply.usage),
                Err(_) if estimate > 0 && called.load(Ordering::SeqCst) => {
                    budget.track(task.id, TokenUsage::new(estimate, 0))
                }
                Err(_) => {}
            }
        }
        outcome
    }

    async fn checkpoint(&self, dag: &TaskDAG, results: &[ExecutionResult], phase: &str) {
        let Some((manager, mission_id)) = &self.checkpoints else {
            return;
        };
        if !self.config.checkpoint.enabled {
            return;
        }
        let state = snapshot(dag, results, phase);
        let succeeded = state.results.iter().filter(|r| r.success).count();
        let metadata = json!({
            "succeeded": succeeded,
            "failed": state.results.len() - succeeded,
        });
        match manager.record(mission_id, phase, state, metadata).await {
            Ok(receipt) => {
                self.emit(SchedulerEvent::CheckpointWritten {
                    checkpoint_id: receipt.id,
                    phase: phase.to_string(),
                    persisted: receipt.persisted,
                });
                let keep = self.config.checkpoint.keep.max(1);
                if let Err(e) = manager.clean_old(mission_id, keep).await {
                    swlog_warn!("scheduler: pruning checkpoints failed: {}", e);
                }
            }
            Err(e) => swlog_warn!("scheduler: checkpoint {} skipped: {}", phase, e),
        }
    }

    /// Move `id` to `to`, ignoring moves the lifecycle does not allow.
    fn set_state(&self, id: TaskId, to: TaskState) {
        let from = {
            let mut states = lock(&self.states);
            let from = states.get(&id).copied().unwrap_or_default();
            if !from.can_transition_to(to) {
                swlog_warn!("scheduler: task {} cannot move from {} to {}", id, from, to);
                return;
            }
            states.insert(id, to);
            from
        };
        self.emit(SchedulerEvent::TaskStateChanged {
            task_id: id,
            from,
            to,
        });
    }

    fn emit(&self, event: SchedulerEvent) {
        if let Some(tx) = &self.events {
            let _ = tx.send(event);
        }
    }
}

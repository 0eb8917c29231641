//! End-to-end scheduling tests.
//!
//! These tests verify that a graph run:
//! - Never starts a task before all of its dependencies are terminal
//! - Keeps the number of running tasks within `max_concurrency`
//! - Orders simultaneously ready tasks by priority, then id
//! - Hands each task the outputs of its successful dependencies
//! - Rejects malformed graphs before any agent is called
//! - Stops dispatching when cancelled, reporting the rest as cancelled

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use swarm::core::{Priority, TaskId, TaskState};
use swarm::orchestration::{FailureKind, Scheduler, SchedulerEvent};
use swarm::Error;

use crate::fixtures::{
    chain, diamond, fast_config, independent, layered, position, result_for, task, MockAgent,
};

/// Test: Diamond graph runs to completion in dependency order.
///
/// Given: `{1:[], 2:[1], 3:[1], 4:[2,3]}`
/// When: The graph is executed
/// Then: Every task succeeds, 1 finishes first and 4 last
#[tokio::test]
async fn test_diamond_completes_in_dependency_order() {
    let agent = MockAgent::new().into_arc();
    let scheduler = Scheduler::new(fast_config(4), agent.clone());

    let results = scheduler.execute(diamond()).await.unwrap();

    assert_eq!(results.len(), 4);
    assert!(results.iter().all(|r| r.success));
    assert_eq!(position(&results, 1), 0);
    assert_eq!(position(&results, 4), 3);
    assert!(position(&results, 1) < position(&results, 2));
    assert!(position(&results, 1) < position(&results, 3));
    assert_eq!(agent.call_count(), 4);
}

/// Test: No task starts before its dependencies have finished.
///
/// Given: A four-layer graph with mixed latencies
/// When: It runs with room for three tasks at once
/// Then: For every edge, the dependency's call returned before the
///       dependent's call started
#[tokio::test(start_paused = true)]
async fn test_dependencies_finish_before_dependents_start() {
    let tasks = layered(3);
    let mut agent = MockAgent::new();
    for id in 1..=12u64 {
        agent = agent.latency(id, Duration::from_millis(5 + (id * 7) % 23));
    }
    let agent = agent.into_arc();
    let scheduler = Scheduler::new(fast_config(3), agent.clone());

    let results = scheduler.execute(tasks.clone()).await.unwrap();
    assert!(results.iter().all(|r| r.success));

    let calls = agent.calls();
    for task in &tasks {
        let call = calls.iter().find(|c| c.task_id == task.id).unwrap();
        for dep in &task.dependencies {
            let dep_call = calls.iter().find(|c| c.task_id == *dep).unwrap();
            assert!(
                dep_call.finished.unwrap() < call.started,
                "task {} started before dependency {} finished",
                task.id,
                dep
            );
        }
    }
}

/// Test: The concurrency bound holds across the whole graph.
///
/// Given: Twelve independent tasks and `max_concurrency = 3`
/// When: The graph is executed
/// Then: Exactly three calls were ever running at once
#[tokio::test(start_paused = true)]
async fn test_concurrency_never_exceeds_limit() {
    let agent = MockAgent::new()
        .default_latency(Duration::from_millis(20))
        .into_arc();
    let scheduler = Scheduler::new(fast_config(3), agent.clone());

    let results = scheduler.execute(independent(12)).await.unwrap();

    assert_eq!(results.len(), 12);
    assert_eq!(agent.peak_concurrency(), 3);
    assert!(scheduler.gate().stats().peak_concurrent <= 3);
}

/// Test: A chain runs strictly one task at a time regardless of the limit.
#[tokio::test(start_paused = true)]
async fn test_chain_is_sequential() {
    let agent = MockAgent::new().into_arc();
    let scheduler = Scheduler::new(fast_config(8), agent.clone());

    let results = scheduler.execute(chain(5)).await.unwrap();

    let order: Vec<TaskId> = results.iter().map(|r| r.task_id).collect();
    assert_eq!(order, (1..=5).map(TaskId).collect::<Vec<_>>());
    assert_eq!(agent.peak_concurrency(), 1);
}

/// Test: Ready tasks are dispatched by priority, then by ascending id.
///
/// Given: Five independent tasks with mixed priority labels
/// When: They run one at a time
/// Then: Critical, High, the two unlabelled (as Medium, by id), then Low
#[tokio::test]
async fn test_priority_breaks_ties_between_ready_tasks() {
    let agent = MockAgent::new().into_arc();
    let scheduler = Scheduler::new(fast_config(1), agent.clone());
    let tasks = vec![
        task(1, "worker", &[]).with_priority(Priority::Low),
        task(2, "worker", &[]),
        task(3, "worker", &[]).with_priority(Priority::Critical),
        task(4, "worker", &[]).with_priority(Priority::High),
        task(5, "worker", &[]),
    ];

    scheduler.execute(tasks).await.unwrap();

    let started: Vec<TaskId> = agent.calls().iter().map(|c| c.task_id).collect();
    assert_eq!(
        started,
        vec![TaskId(3), TaskId(4), TaskId(2), TaskId(5), TaskId(1)]
    );
}

/// Test: Dependency outputs reach the dependent as context.
///
/// Given: The diamond graph
/// When: It runs
/// Then: Task 1 gets no context and task 4 gets the outputs of 2 and 3 in
///       ascending id order
#[tokio::test]
async fn test_context_carries_dependency_outputs() {
    let agent = MockAgent::new().into_arc();
    let scheduler = Scheduler::new(fast_config(4), agent.clone());

    scheduler.execute(diamond()).await.unwrap();

    assert_eq!(agent.calls_for(1)[0].context, "");
    assert_eq!(agent.calls_for(2)[0].context, "[task 1]\noutput-1");
    assert_eq!(
        agent.calls_for(4)[0].context,
        "[task 2]\noutput-2\n\n[task 3]\noutput-3"
    );
}

/// Test: A cyclic graph is rejected before anything runs.
#[tokio::test]
async fn test_cycle_is_rejected_without_agent_calls() {
    let agent = MockAgent::new().into_arc();
    let scheduler = Scheduler::new(fast_config(4), agent.clone());
    let tasks = vec![
        task(1, "worker", &[3]),
        task(2, "worker", &[1]),
        task(3, "worker", &[2]),
        task(4, "worker", &[]),
    ];

    let err = scheduler.execute(tasks).await.unwrap_err();

    match err {
        Error::CycleDetected { cycle } => {
            assert_eq!(cycle.first(), cycle.last());
            assert!(cycle.contains(&TaskId(1)));
            assert!(!cycle.contains(&TaskId(4)));
        }
        other => panic!("expected a cycle error, got {other}"),
    }
    assert_eq!(agent.call_count(), 0);
}

/// Test: A dependency on an unknown task is rejected before anything runs.
#[tokio::test]
async fn test_unknown_dependency_is_rejected() {
    let agent = MockAgent::new().into_arc();
    let scheduler = Scheduler::new(fast_config(4), agent.clone());

    let err = scheduler
        .execute(vec![task(1, "worker", &[]), task(2, "worker", &[9])])
        .await
        .unwrap_err();

    assert!(matches!(
        err,
        Error::InvalidDependency {
            task: TaskId(2),
            dependency: TaskId(9),
            ..
        }
    ));
    assert_eq!(agent.call_count(), 0);
}

/// Test: Cancelling mid-run lets in-flight work finish and skips the rest.
///
/// Given: The diamond graph and an agent that cancels the run while task 1
///        is executing
/// When: The graph is executed
/// Then: Task 1 succeeds, tasks 2, 3 and 4 are reported as cancelled with
///       no attempts, the agent was called once, and every task ends in a
///       terminal state
#[tokio::test]
async fn test_cancellation_stops_dispatch() {
    let token = CancellationToken::new();
    let agent = MockAgent::new()
        .cancel_during(1, token.clone())
        .into_arc();
    let (tx, mut rx) = mpsc::unbounded_channel();
    let scheduler = Scheduler::new(fast_config(4), agent.clone())
        .with_cancellation(token)
        .with_events(tx);

    let results = scheduler.execute(diamond()).await.unwrap();

    assert_eq!(results.len(), 4);
    assert!(result_for(&results, 1).success);
    for id in 2..=4 {
        let result = result_for(&results, id);
        assert_eq!(result.failure, Some(FailureKind::Cancelled));
        assert_eq!(result.attempt, 0);
        assert!(result.attempts.is_empty());
    }
    assert_eq!(agent.call_count(), 1);

    let events: Vec<SchedulerEvent> = std::iter::from_fn(|| rx.try_recv().ok()).collect();
    assert!(events.contains(&SchedulerEvent::Cancelled { undispatched: 3 }));
    assert_eq!(
        events.last(),
        Some(&SchedulerEvent::AllTasksComplete {
            succeeded: 1,
            failed: 3
        })
    );

    let moves = |id: u64| -> Vec<(TaskState, TaskState)> {
        events
            .iter()
            .filter_map(|e| match e {
                SchedulerEvent::TaskStateChanged { task_id, from, to } if *task_id == TaskId(id) => {
                    Some((*from, *to))
                }
                _ => None,
            })
            .collect()
    };
    assert_eq!(
        moves(2),
        vec![
            (TaskState::Pending, TaskState::Ready),
            (TaskState::Ready, TaskState::Failed)
        ]
    );
    assert_eq!(moves(4), vec![(TaskState::Pending, TaskState::Failed)]);
    assert_eq!(scheduler.state_of(&TaskId(1)), Some(TaskState::Succeeded));
    assert!(scheduler.states().values().all(|s| s.is_terminal()));
}

/// Test: A spawned run shares its results with the caller.
#[tokio::test]
async fn test_scheduler_run_from_spawned_task() {
    let agent = MockAgent::new().into_arc();
    let scheduler = Arc::new(Scheduler::new(fast_config(2), agent));

    let handle = tokio::spawn({
        let scheduler = Arc::clone(&scheduler);
        async move { scheduler.execute(diamond()).await }
    });

    let results = handle.await.unwrap().unwrap();
    assert_eq!(results.iter().filter(|r| r.success).count(), 4);
}

//! Resilience tests.
//!
//! These tests verify the engine's failure handling end to end:
//! - One failing task never blocks unrelated work
//! - Retries back off exponentially and respect the attempt limit
//! - A task waiting out its backoff leaves its slot to other work
//! - Circuit breakers trip per agent and can be shared between runs
//! - The token budget gates attempts before the agent is called
//! - The rate limiter paces dispatch

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::Instant;

use swarm::config::EngineConfig;
use swarm::core::TaskId;
use swarm::orchestration::{
    AttemptOutcome, BudgetEvent, BudgetLimits, BudgetScope, CircuitBreakerConfig,
    CircuitBreakerRegistry, CircuitState, FailureKind, RateLimitConfig, Scheduler,
    SchedulerEvent, TokenBudgetManager, TokenUsage,
};

use crate::fixtures::{diamond, fast_config, independent, result_for, task, Behavior, MockAgent};

fn breaker_config(failure_threshold: u32) -> CircuitBreakerConfig {
    CircuitBreakerConfig {
        failure_threshold,
        success_threshold: 1,
        timeout_ms: 60_000,
    }
}

/// Test: A failing task does not affect independent tasks.
///
/// Given: Five independent tasks where task 3 always fails
/// When: The graph is executed
/// Then: Task 3 fails with an agent error and the other four succeed
#[tokio::test]
async fn test_failure_is_isolated() {
    let agent = MockAgent::new().behave(3, Behavior::Fail).into_arc();
    let scheduler = Scheduler::new(fast_config(2), agent.clone());

    let results = scheduler.execute(independent(5)).await.unwrap();

    assert_eq!(results.len(), 5);
    let failed = result_for(&results, 3);
    assert!(!failed.success);
    assert_eq!(failed.failure, Some(FailureKind::Agent));
    assert_eq!(failed.error.as_deref(), Some("mock failure for task 3"));
    assert_eq!(results.iter().filter(|r| r.success).count(), 4);
}

/// Test: A failed dependency still unlocks its dependents.
///
/// Given: The diamond graph where task 2 always fails
/// When: The graph is executed
/// Then: Task 4 still runs, and its context holds only task 3's output
#[tokio::test]
async fn test_failed_dependency_resolves_dependent() {
    let agent = MockAgent::new().behave(2, Behavior::Fail).into_arc();
    let scheduler = Scheduler::new(fast_config(4), agent.clone());

    let results = scheduler.execute(diamond()).await.unwrap();

    assert!(!result_for(&results, 2).success);
    assert!(result_for(&results, 4).success);
    assert_eq!(agent.calls_for(4)[0].context, "[task 3]\noutput-3");
}

/// Test: Retries back off exponentially until the task succeeds.
///
/// Given: A task that fails twice and `max_retries = 2`
/// When: The graph is executed
/// Then: The third attempt succeeds, the retry delays double, and every
///       attempt is recorded
#[tokio::test(start_paused = true)]
async fn test_retry_backoff_until_success() {
    let agent = MockAgent::new()
        .behave(1, Behavior::FailTimes(2))
        .into_arc();
    let config = EngineConfig {
        max_retries: 2,
        retry_delay_ms: 100,
        ..fast_config(1)
    };
    let (tx, mut rx) = mpsc::unbounded_channel();
    let scheduler = Scheduler::new(config, agent.clone()).with_events(tx);

    let results = scheduler.execute(vec![task(1, "worker", &[])]).await.unwrap();

    let result = &results[0];
    assert!(result.success);
    assert_eq!(result.attempt, 3);
    assert_eq!(result.attempts.len(), 3);
    assert_eq!(result.attempts[2].outcome, AttemptOutcome::Succeeded);

    let attempts: Vec<u32> = agent.calls_for(1).iter().map(|c| c.attempt).collect();
    assert_eq!(attempts, vec![1, 2, 3]);

    let delays: Vec<Duration> = std::iter::from_fn(|| rx.try_recv().ok())
        .filter_map(|e| match e {
            SchedulerEvent::TaskRetrying { delay, .. } => Some(delay),
            _ => None,
        })
        .collect();
    assert_eq!(
        delays,
        vec![Duration::from_millis(100), Duration::from_millis(200)]
    );
}

/// Test: An independent task runs while another waits out its backoff.
///
/// Given: One slot, a 10s retry delay, task 1 failing once and an
///        independent task 2
/// When: The graph is executed
/// Then: The agent sees task 1, then task 2, then task 1's retry, and task 2
///       finishes long before the backoff ends
#[tokio::test(start_paused = true)]
async fn test_independent_task_runs_during_backoff() {
    let agent = MockAgent::new()
        .behave(1, Behavior::FailTimes(1))
        .into_arc();
    let config = EngineConfig {
        max_retries: 1,
        retry_delay_ms: 10_000,
        ..fast_config(1)
    };
    let scheduler = Scheduler::new(config, agent.clone());

    let results = scheduler.execute(independent(2)).await.unwrap();

    let order: Vec<TaskId> = agent.calls().iter().map(|c| c.task_id).collect();
    assert_eq!(order, vec![TaskId(1), TaskId(2), TaskId(1)]);
    assert_eq!(results[0].task_id, TaskId(2));
    assert!(results[0].duration_ms < 10_000);
    assert!(result_for(&results, 1).success);
    assert_eq!(agent.peak_concurrency(), 1);
}

/// Test: A retry that cannot get a pool slot in time fails with
/// `QueueTimeout`.
///
/// Given: One slot, a 100ms acquire timeout, task 1 failing once with a
///        short backoff, and a slow independent task 2 that takes the slot
///        during that backoff
/// When: The graph is executed
/// Then: Task 1's retry waits in the pool queue, times out there, and the
///       agent never sees it
#[tokio::test(start_paused = true)]
async fn test_retry_waiting_for_slot_times_out() {
    let agent = MockAgent::new()
        .behave(1, Behavior::FailTimes(1))
        .latency(2, Duration::from_secs(1))
        .into_arc();
    let config = EngineConfig {
        max_retries: 1,
        acquire_timeout_ms: 100,
        ..fast_config(1)
    };
    let scheduler = Scheduler::new(config, agent.clone());

    let results = scheduler.execute(independent(2)).await.unwrap();

    let retried = result_for(&results, 1);
    assert!(!retried.success);
    assert_eq!(retried.failure, Some(FailureKind::QueueTimeout));
    assert_eq!(retried.attempts.len(), 2);
    assert_eq!(agent.calls_for(1).len(), 1);
    assert!(result_for(&results, 2).success);

    let stats = scheduler.gate().stats();
    assert_eq!(stats.peak_queue_size, 1);
    assert_eq!(stats.peak_concurrent, 1);
}

/// Test: A hanging agent is cut off by the task timeout and retried.
///
/// Given: A task whose agent never answers, a 100ms timeout, one retry
/// When: The graph is executed
/// Then: Both attempts time out and the task fails with `Timeout`
#[tokio::test(start_paused = true)]
async fn test_timeout_then_retry() {
    let agent = MockAgent::new().behave(1, Behavior::Hang).into_arc();
    let config = EngineConfig {
        max_retries: 1,
        task_timeout_ms: 100,
        ..fast_config(1)
    };
    let scheduler = Scheduler::new(config, agent.clone());

    let results = scheduler.execute(vec![task(1, "worker", &[])]).await.unwrap();

    let result = &results[0];
    assert!(!result.success);
    assert_eq!(result.failure, Some(FailureKind::Timeout));
    assert_eq!(result.attempt, 2);
    assert!(result.attempts.iter().all(|a| matches!(
        a.outcome,
        AttemptOutcome::Failed {
            kind: FailureKind::Timeout,
            ..
        }
    )));
    assert_eq!(agent.calls_for(1).len(), 2);
}

/// Test: An agent's breaker opens after repeated failures and rejects
/// further tasks for that agent only.
///
/// Given: Four tasks on a failing agent, one on a healthy agent, a breaker
///        threshold of 2, no retries and one task at a time
/// When: The graph is executed
/// Then: The first two calls fail, the next two are rejected without a
///       call, and the healthy agent's task succeeds
#[tokio::test]
async fn test_breaker_opens_across_tasks() {
    let mut agent = MockAgent::new();
    for id in 1..=4 {
        agent = agent.behave(id, Behavior::Fail);
    }
    let agent = agent.into_arc();
    let config = EngineConfig {
        circuit_breaker: breaker_config(2),
        ..fast_config(1)
    };
    let scheduler = Scheduler::new(config, agent.clone());
    let tasks = vec![
        task(1, "flaky", &[]),
        task(2, "flaky", &[]),
        task(3, "flaky", &[]),
        task(4, "flaky", &[]),
        task(5, "steady", &[]),
    ];

    let results = scheduler.execute(tasks).await.unwrap();

    assert_eq!(result_for(&results, 1).failure, Some(FailureKind::Agent));
    assert_eq!(result_for(&results, 2).failure, Some(FailureKind::Agent));
    assert_eq!(
        result_for(&results, 3).failure,
        Some(FailureKind::CircuitOpen)
    );
    assert_eq!(
        result_for(&results, 4).error.as_deref(),
        Some("Circuit breaker flaky is OPEN")
    );
    assert!(result_for(&results, 5).success);
    assert_eq!(agent.calls().iter().filter(|c| c.agent_ref == "flaky").count(), 2);

    let breakers = scheduler.breakers();
    assert_eq!(breakers.get("flaky").unwrap().state(), CircuitState::Open);
    assert_eq!(breakers.get("steady").unwrap().state(), CircuitState::Closed);
    let stats = breakers.all_stats();
    assert_eq!(stats[0].name, "flaky");
    assert_eq!(stats[0].total_rejected, 2);
}

/// Test: Schedulers sharing a registry share breaker state.
///
/// Given: A registry whose `flaky` breaker was tripped by a first run
/// When: A second scheduler with the same registry runs a `flaky` task
/// Then: The task is rejected without calling the agent
#[tokio::test]
async fn test_shared_registry_carries_open_breaker() {
    let registry = Arc::new(CircuitBreakerRegistry::new());
    let config = EngineConfig {
        circuit_breaker: breaker_config(1),
        ..fast_config(1)
    };

    let first_agent = MockAgent::new().behave(1, Behavior::Fail).into_arc();
    let first = Scheduler::new(config.clone(), first_agent).with_breakers(Arc::clone(&registry));
    first.execute(vec![task(1, "flaky", &[])]).await.unwrap();
    assert_eq!(registry.get("flaky").unwrap().state(), CircuitState::Open);

    let second_agent = MockAgent::new().into_arc();
    let second =
        Scheduler::new(config, second_agent.clone()).with_breakers(Arc::clone(&registry));
    let results = second
        .execute(vec![task(7, "flaky", &[])])
        .await
        .unwrap();

    assert_eq!(results[0].failure, Some(FailureKind::CircuitOpen));
    assert_eq!(second_agent.call_count(), 0);

    registry.reset_all();
    let results = second
        .execute(vec![task(8, "flaky", &[])])
        .await
        .unwrap();
    assert!(results[0].success);
}

/// Test: The budget gate denies attempts that would cross the limit.
///
/// Given: A session limit of 5000 with 4900 already used
/// When: A task estimated at 200 and one estimated at 50 run in turn
/// Then: The first is denied without a call or retry, the second runs and
///       pushes the session over its limit
#[tokio::test]
async fn test_budget_gate_through_scheduler() {
    let (budget_tx, mut budget_rx) = mpsc::unbounded_channel();
    let budget = Arc::new(
        TokenBudgetManager::new(BudgetLimits {
            session_limit: 5_000,
            ..Default::default()
        })
        .with_events(budget_tx),
    );
    budget.track(TaskId(99), TokenUsage::new(4_900, 0));

    let agent = MockAgent::new().into_arc();
    let config = EngineConfig {
        max_retries: 3,
        ..fast_config(1)
    };
    let scheduler = Scheduler::new(config, agent.clone()).with_budget(Arc::clone(&budget));
    let tasks = vec![
        task(1, "worker", &[]).with_estimate(200),
        task(2, "worker", &[]).with_estimate(50),
    ];

    let results = scheduler.execute(tasks).await.unwrap();

    let denied = result_for(&results, 1);
    assert_eq!(denied.failure, Some(FailureKind::BudgetExceeded));
    assert_eq!(denied.attempt, 1);
    assert!(agent.calls_for(1).is_empty());

    assert!(result_for(&results, 2).success);
    assert_eq!(budget.stats().session_used, 5_050);
    assert!(!budget.can_proceed(0).allowed);

    let events: Vec<BudgetEvent> = std::iter::from_fn(|| budget_rx.try_recv().ok()).collect();
    assert!(events.iter().any(|e| matches!(
        e,
        BudgetEvent::LimitReached {
            scope: BudgetScope::Session,
            used: 5_050,
            ..
        }
    )));
}

/// Test: The rate limiter spaces out dispatch.
///
/// Given: One token per 100ms with a burst of one, and four tasks
/// When: The graph is executed
/// Then: The run takes at least the 300ms needed to refill three tokens
#[tokio::test(start_paused = true)]
async fn test_rate_limit_paces_dispatch() {
    let agent = MockAgent::new()
        .default_latency(Duration::from_millis(1))
        .into_arc();
    let config = EngineConfig {
        rate_limit: RateLimitConfig {
            tokens_per_interval: 1,
            interval_ms: 100,
            max_burst: 1,
            enabled: true,
        },
        ..fast_config(4)
    };
    let scheduler = Scheduler::new(config, agent.clone());

    let start = Instant::now();
    let results = scheduler.execute(independent(4)).await.unwrap();
    let elapsed = start.elapsed();

    assert!(results.iter().all(|r| r.success));
    assert!(elapsed >= Duration::from_millis(300), "took {:?}", elapsed);
    assert!(elapsed < Duration::from_secs(2), "took {:?}", elapsed);
}

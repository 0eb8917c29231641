//! Persistence tests.
//!
//! These tests verify that:
//! - A checkpoint is written each time a wave of the graph completes
//! - Old checkpoints are pruned to the configured count
//! - A run resumed from a checkpoint skips the work it already did
//! - A cancelled run leaves a checkpoint that finishes the graph on resume
//! - Checkpoints and budget usage survive a fresh manager reading the disk
//! - A checkpoint that could not be written is reported as not persisted

use std::sync::Arc;

use serde_json::json;
use tempfile::TempDir;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use swarm::config::EngineConfig;
use swarm::core::TaskId;
use swarm::orchestration::{
    BudgetLimits, CheckpointConfig, CheckpointManager, CheckpointState, Scheduler,
    SchedulerEvent, TokenBudgetManager, TokenUsage,
};

use crate::fixtures::{chain, diamond, fast_config, result_for, MockAgent};

const MISSION: &str = "mission-a";

fn checkpointing(manager: &Arc<CheckpointManager>, keep: usize) -> (Scheduler, Arc<MockAgent>) {
    let agent = MockAgent::new().into_arc();
    let config = EngineConfig {
        checkpoint: CheckpointConfig {
            enabled: true,
            keep,
        },
        ..fast_config(4)
    };
    let scheduler =
        Scheduler::new(config, agent.clone()).with_checkpoints(Arc::clone(manager), MISSION);
    (scheduler, agent)
}

/// Test: Each completed wave produces a checkpoint.
///
/// Given: The diamond graph (three waves) with checkpointing enabled
/// When: The graph is executed
/// Then: `wave-1`, `wave-2` and `wave-3` are written in order, and the
///       latest one records every task as completed
#[tokio::test]
async fn test_checkpoint_written_per_wave() {
    let dir = TempDir::new().unwrap();
    let manager = Arc::new(CheckpointManager::new(dir.path()));
    let (tx, mut rx) = mpsc::unbounded_channel();
    let (scheduler, _agent) = checkpointing(&manager, 5);
    let scheduler = scheduler.with_events(tx);

    scheduler.execute(diamond()).await.unwrap();

    let phases: Vec<(String, bool)> = std::iter::from_fn(|| rx.try_recv().ok())
        .filter_map(|e| match e {
            SchedulerEvent::CheckpointWritten {
                phase, persisted, ..
            } => Some((phase, persisted)),
            _ => None,
        })
        .collect();
    assert_eq!(
        phases,
        vec![
            ("wave-1".to_string(), true),
            ("wave-2".to_string(), true),
            ("wave-3".to_string(), true)
        ]
    );

    let ids = manager.list_checkpoints(MISSION).await.unwrap();
    assert_eq!(ids.len(), 3);

    let latest = manager.get_latest(MISSION).await.unwrap().unwrap();
    assert_eq!(latest.phase, "wave-3");
    assert_eq!(latest.id, ids[0]);
    assert_eq!(latest.state.completed_task_ids.len(), 4);
    assert!(latest.state.pending_task_ids.is_empty());
    assert_eq!(latest.metadata["succeeded"], json!(4));

    let files = std::fs::read_dir(dir.path()).unwrap().count();
    assert_eq!(files, 3);
}

/// Test: A checkpoint whose file write fails is flagged as not persisted.
///
/// Given: A checkpoint directory path that is occupied by a regular file
/// When: A single-task graph is executed with checkpointing enabled
/// Then: The run still succeeds, the `wave-1` event says `persisted: false`,
///       and the checkpoint is only held in the manager's cache
#[tokio::test]
async fn test_unwritable_checkpoint_reported_as_cache_only() {
    let dir = TempDir::new().unwrap();
    let blocker = dir.path().join("not-a-dir");
    std::fs::write(&blocker, "file in the way").unwrap();
    let manager = Arc::new(CheckpointManager::new(&blocker));
    let (tx, mut rx) = mpsc::unbounded_channel();
    let (scheduler, _agent) = checkpointing(&manager, 5);
    let scheduler = scheduler.with_events(tx);

    let results = scheduler.execute(chain(1)).await.unwrap();
    assert!(results[0].success);

    let written: Vec<(String, bool)> = std::iter::from_fn(|| rx.try_recv().ok())
        .filter_map(|e| match e {
            SchedulerEvent::CheckpointWritten {
                checkpoint_id,
                persisted,
                ..
            } => Some((checkpoint_id, persisted)),
            _ => None,
        })
        .collect();
    assert_eq!(written.len(), 1);
    let (id, persisted) = &written[0];
    assert!(!persisted);
    assert!(manager.restore(id).await.unwrap().is_some());
    assert!(!blocker.join(format!("{}.json", id)).exists());
}

/// Test: Only the newest `keep` checkpoints survive a run.
#[tokio::test]
async fn test_old_checkpoints_are_pruned() {
    let dir = TempDir::new().unwrap();
    let manager = Arc::new(CheckpointManager::new(dir.path()));
    let (scheduler, _agent) = checkpointing(&manager, 2);

    scheduler.execute(chain(6)).await.unwrap();

    let ids = manager.list_checkpoints(MISSION).await.unwrap();
    assert_eq!(ids.len(), 2);
    let latest = manager.load(&ids[0]).await.unwrap();
    let previous = manager.load(&ids[1]).await.unwrap();
    assert_eq!(latest.phase, "wave-6");
    assert_eq!(previous.phase, "wave-5");
}

/// Test: Resuming from a mid-run checkpoint skips completed tasks.
///
/// Given: The `wave-1` checkpoint of a finished diamond run
/// When: The diamond is resumed from it with a fresh agent
/// Then: Only tasks 2, 3 and 4 are called, and task 2 still sees task 1's
///       restored output
#[tokio::test]
async fn test_resume_from_wave_checkpoint() {
    let dir = TempDir::new().unwrap();
    let manager = Arc::new(CheckpointManager::new(dir.path()));
    let (scheduler, _agent) = checkpointing(&manager, 5);
    scheduler.execute(diamond()).await.unwrap();

    let mut wave_one = None;
    for id in manager.list_checkpoints(MISSION).await.unwrap() {
        let checkpoint = manager.load(&id).await.unwrap();
        if checkpoint.phase == "wave-1" {
            wave_one = Some(checkpoint);
        }
    }
    let wave_one = wave_one.expect("wave-1 checkpoint");
    assert_eq!(wave_one.state.completed_task_ids, vec![TaskId(1)]);
    assert_eq!(
        wave_one.state.pending_task_ids,
        vec![TaskId(2), TaskId(3), TaskId(4)]
    );

    let agent = MockAgent::new().into_arc();
    let resumed = Scheduler::new(fast_config(4), agent.clone());
    let results = resumed.resume(diamond(), wave_one.state).await.unwrap();

    assert_eq!(results.len(), 4);
    assert_eq!(results[0].task_id, TaskId(1));
    assert!(results.iter().all(|r| r.success));
    assert!(agent.calls_for(1).is_empty());
    assert_eq!(agent.call_count(), 3);
    assert_eq!(agent.calls_for(2)[0].context, "[task 1]\noutput-1");
}

/// Test: A cancelled run can be finished from its final checkpoint.
///
/// Given: A diamond run cancelled while task 1 executes
/// When: The run ends
/// Then: A `cancelled` checkpoint lists task 1 as completed and the rest as
///       pending, and resuming from it runs exactly the pending tasks
#[tokio::test]
async fn test_cancelled_run_resumes_from_checkpoint() {
    let dir = TempDir::new().unwrap();
    let manager = Arc::new(CheckpointManager::new(dir.path()));
    let token = CancellationToken::new();
    let agent = MockAgent::new()
        .cancel_during(1, token.clone())
        .into_arc();
    let scheduler = Scheduler::new(fast_config(4), agent)
        .with_checkpoints(Arc::clone(&manager), MISSION)
        .with_cancellation(token);

    scheduler.execute(diamond()).await.unwrap();

    let latest = manager.get_latest(MISSION).await.unwrap().unwrap();
    assert_eq!(latest.phase, "cancelled");
    assert_eq!(latest.state.completed_task_ids, vec![TaskId(1)]);
    assert_eq!(
        latest.state.pending_task_ids,
        vec![TaskId(2), TaskId(3), TaskId(4)]
    );
    assert_eq!(latest.state.results.len(), 1);

    let state = manager.restore(&latest.id).await.unwrap().unwrap();
    let agent = MockAgent::new().into_arc();
    let resumed = Scheduler::new(fast_config(4), agent.clone());
    let results = resumed.resume(diamond(), state).await.unwrap();

    assert_eq!(results.len(), 4);
    assert!(results.iter().all(|r| r.success));
    assert_eq!(agent.call_count(), 3);
    assert!(result_for(&results, 4).success);
}

/// Test: A checkpoint read back by a fresh manager equals what was written.
#[tokio::test]
async fn test_checkpoint_survives_fresh_manager() {
    let dir = TempDir::new().unwrap();
    let writer = Arc::new(CheckpointManager::new(dir.path()));
    let (scheduler, _agent) = checkpointing(&writer, 5);
    let results = scheduler.execute(diamond()).await.unwrap();

    let state = CheckpointState {
        completed_task_ids: results.iter().map(|r| r.task_id).collect(),
        pending_task_ids: Vec::new(),
        results: results.clone(),
        context: json!({"note": "manual"}),
    };
    let id = writer
        .create(MISSION, "final", state.clone(), json!({"by": "test"}))
        .await
        .unwrap();

    let reader = CheckpointManager::new(dir.path());
    let restored = reader.restore(&id).await.unwrap().unwrap();
    assert_eq!(restored, state);
    assert_eq!(reader.load(&id).await.unwrap().metadata["by"], "test");
    assert_eq!(reader.list_checkpoints(MISSION).await.unwrap()[0], id);

    assert!(reader.restore("mission-a_final_1").await.unwrap().is_none());
}

/// Test: Budget usage written by one manager is picked up by another.
///
/// Given: A manager that tracked usage for two tasks and saved it
/// When: A fresh manager with a tighter session limit loads the file
/// Then: Usage totals carry over, limits stay as configured, and
///       admission reflects the restored usage
#[tokio::test]
async fn test_budget_usage_survives_restart() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("budget.json");

    let first = TokenBudgetManager::new(BudgetLimits::default());
    first.track(TaskId(1), TokenUsage::new(300, 200));
    first.track(TaskId(2), TokenUsage::new(100, 0));
    first.save(&path).await.unwrap();

    let second = TokenBudgetManager::new(BudgetLimits {
        session_limit: 1_000,
        ..Default::default()
    });
    assert!(second.load(&path).await.unwrap());

    let stats = second.stats();
    assert_eq!(stats.daily_used, 600);
    assert_eq!(stats.session_used, 600);
    assert_eq!(stats.task_usage[&TaskId(1)], 500);
    assert_eq!(second.limits().session_limit, 1_000);
    assert!(second.can_proceed(300).allowed);
    assert!(!second.can_proceed(400).allowed);

    let missing = TokenBudgetManager::new(BudgetLimits::default());
    assert!(!missing.load(&dir.path().join("absent.json")).await.unwrap());
    assert_eq!(missing.stats().session_used, 0);
}

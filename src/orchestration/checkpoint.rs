//! Durable execution snapshots.
//!
//! Each checkpoint is one pretty-printed JSON file named
//! `<mission>_<phase>_<epoch millis>.json` in a flat store directory.
//! Checkpoints are written whole and never modified afterwards; later
//! checkpoints of the same mission supersede earlier ones.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::core::task::TaskId;
use crate::error::{Error, Result};
use crate::orchestration::scheduler::ExecutionResult;
use crate::util::lock;
use crate::{swlog, swlog_debug, swlog_warn};

/// Retention settings used by the scheduler.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CheckpointConfig {
    /// Write a checkpoint after every completed wave.
    pub enabled: bool,
    /// Checkpoints kept per mission after each write.
    pub keep: usize,
}

impl Default for CheckpointConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            keep: 5,
        }
    }
}

/// Execution progress captured in a checkpoint.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CheckpointState {
    pub completed_task_ids: Vec<TaskId>,
    pub pending_task_ids: Vec<TaskId>,
    pub results: Vec<ExecutionResult>,
    /// Opaque caller data carried along with the snapshot.
    #[serde(default)]
    pub context: serde_json::Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub id: String,
    pub mission_id: String,
    pub phase: String,
    pub timestamp: DateTime<Utc>,
    pub state: CheckpointState,
    #[serde(default)]
    pub metadata: serde_json::Value,
}

/// Outcome of [`CheckpointManager::record`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckpointReceipt {
    pub id: String,
    /// False when the file write failed and the checkpoint only lives in
    /// the manager's cache.
    pub persisted: bool,
}

/// Trailing epoch-millis component of a checkpoint id.
fn id_timestamp(id: &str) -> Option<i64> {
    id.rsplit_once('_').and_then(|(_, ts)| ts.parse().ok())
}

fn validate_component(kind: &str, value: &str) -> Result<()> {
    if value.is_empty() {
        return Err(Error::Validation(format!("{} must not be empty", kind)));
    }
    if value.contains(|c| c == '/' || c == '\\') || value == "." || value == ".." {
        return Err(Error::Validation(format!(
            "{} '{}' must not contain path separators",
            kind, value
        )));
    }
    Ok(())
}

/// File-backed checkpoint store with an in-process cache.
#[derive(Debug)]
pub struct CheckpointManager {
    dir: PathBuf,
    cache: Mutex<HashMap<String, Checkpoint>>,
    last_millis: Mutex<i64>,
}

impl CheckpointManager {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            cache: Mutex::new(HashMap::new()),
            last_millis: Mutex::new(0),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, id: &str) -> PathBuf {
        self.dir.join(format!("{}.json", id))
    }

    /// Millisecond timestamp strictly greater than any handed out before,
    /// so ids from this manager never collide.
    fn next_timestamp(&self) -> DateTime<Utc> {
        let mut last = lock(&self.last_millis);
        let millis = Utc::now().timestamp_millis().max(*last + 1);
        *last = millis;
        DateTime::from_timestamp_millis(millis).unwrap_or_else(Utc::now)
    }

    /// Snapshot `state` and return the new checkpoint id.
    ///
    /// A failed write is logged and otherwise ignored: the checkpoint stays
    /// available from this manager's cache. Use [`record`](Self::record)
    /// to learn whether it reached disk.
    ///
    /// # Errors
    ///
    /// `Validation` if the mission or phase is empty or contains a path
    /// separator.
    pub async fn create(
        &self,
        mission_id: &str,
        phase: &str,
        state: CheckpointState,
        metadata: serde_json::Value,
    ) -> Result<String> {
        self.record(mission_id, phase, state, metadata)
            .await
            .map(|receipt| receipt.id)
    }

    /// Like [`create`](Self::create), but also reports whether the file
    /// write succeeded.
    pub async fn record(
        &self,
        mission_id: &str,
        phase: &str,
        state: CheckpointState,
        metadata: serde_json::Value,
    ) -> Result<CheckpointReceipt> {
        validate_component("mission id", mission_id)?;
        validate_component("phase", phase)?;

        let timestamp = self.next_timestamp();
        let id = format!("{}_{}_{}", mission_id, phase, timestamp.timestamp_millis());
        let checkpoint = Checkpoint {
            id: id.clone(),
            mission_id: mission_id.to_string(),
            phase: phase.to_string(),
            timestamp,
            state,
            metadata,
        };
        lock(&self.cache).insert(id.clone(), checkpoint.clone());

        let persisted = match self.write(&checkpoint).await {
            Ok(()) => {
                swlog!(
                    "checkpoint {} written ({} completed, {} pending)",
                    id,
                    checkpoint.state.completed_task_ids.len(),
                    checkpoint.state.pending_task_ids.len()
                );
                true
            }
            Err(e) => {
                swlog_warn!("checkpoint {} not persisted: {}", id, e);
                false
            }
        };
        Ok(CheckpointReceipt { id, persisted })
    }

    async fn write(&self, checkpoint: &Checkpoint) -> Result<()> {
        let contents = serde_json::to_string_pretty(checkpoint)?;
        tokio::fs::create_dir_all(&self.dir).await?;
        let path = self.path_for(&checkpoint.id);
        let temp_path = path.with_extension("json.tmp");
        tokio::fs::write(&temp_path, &contents).await?;
        tokio::fs::rename(&temp_path, &path).await?;
        Ok(())
    }

    /// Load a checkpoint from the cache or disk.
    pub async fn load(&self, id: &str) -> Result<Checkpoint> {
        if let Some(cached) = lock(&self.cache).get(id).cloned() {
            return Ok(cached);
        }
        let path = self.path_for(id);
        let contents = match tokio::fs::read_to_string(&path).await {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(Error::CheckpointNotFound(id.to_string()));
            }
            Err(e) => return Err(e.into()),
        };
        let checkpoint: Checkpoint = serde_json::from_str(&contents)?;
        swlog_debug!("checkpoint {} loaded from {}", id, path.display());
        lock(&self.cache).insert(id.to_string(), checkpoint.clone());
        Ok(checkpoint)
    }

    /// Most recent checkpoint of a mission, if any.
    pub async fn get_latest(&self, mission_id: &str) -> Result<Option<Checkpoint>> {
        match self.list_checkpoints(mission_id).await?.first() {
            Some(id) => Ok(Some(self.load(id).await?)),
            None => Ok(None),
        }
    }

    /// State captured by checkpoint `id`, or `None` if it does not exist.
    pub async fn restore(&self, id: &str) -> Result<Option<CheckpointState>> {
        match self.load(id).await {
            Ok(checkpoint) => Ok(Some(checkpoint.state)),
            Err(Error::CheckpointNotFound(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Remove a checkpoint. Returns whether anything was removed.
    pub async fn delete(&self, id: &str) -> Result<bool> {
        let cached = lock(&self.cache).remove(id).is_some();
        let on_disk = match tokio::fs::remove_file(self.path_for(id)).await {
            Ok(()) => true,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => false,
            Err(e) => return Err(e.into()),
        };
        if cached || on_disk {
            swlog_debug!("checkpoint {} deleted", id);
        }
        Ok(cached || on_disk)
    }

    /// Delete every checkpoint of `mission_id` beyond the newest `keep`.
    /// Returns how many were deleted.
    pub async fn clean_old(&self, mission_id: &str, keep: usize) -> Result<usize> {
        let ids = self.list_checkpoints(mission_id).await?;
        let mut deleted = 0;
        for id in ids.iter().skip(keep) {
            if self.delete(id).await? {
                deleted += 1;
            }
        }
        if deleted > 0 {
            swlog!("checkpoints: removed {} old for mission {}", deleted, mission_id);
        }
        Ok(deleted)
    }

    /// Ids of a mission's checkpoints, newest first.
    pub async fn list_checkpoints(&self, mission_id: &str) -> Result<Vec<String>> {
        let prefix = format!("{}_", mission_id);
        let mut ids: Vec<String> = lock(&self.cache)
            .keys()
            .filter(|id| id.starts_with(&prefix))
            .cloned()
            .collect();

        match tokio::fs::read_dir(&self.dir).await {
            Ok(mut entries) => {
                while let Some(entry) = entries.next_entry().await? {
                    let name = entry.file_name();
                    let Some(id) = name.to_str().and_then(|n| n.strip_suffix(".json")) else {
                        continue;
                    };
                    if id.starts_with(&prefix) && !ids.iter().any(|known| known == id) {
                        ids.push(id.to_string());
                    }
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => swlog_warn!(
                "checkpoints: cannot read {}: {}, listing cached only",
                self.dir.display(),
                e
            ),
        }

        ids.retain(|id| id_timestamp(id).is_some());
        // Order by the embedded timestamp, not the full name, so phase
        // names cannot reorder checkpoints.
        ids.sort_by(|a, b| {
            id_timestamp(b)
                .cmp(&id_timestamp(a))
                .then_with(|| b.cmp(a))
        });
        Ok(ids)
    }
}

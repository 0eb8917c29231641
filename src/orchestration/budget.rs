//! Token budget accounting.
//!
//! `TokenBudgetManager` keeps running totals against three ceilings (daily,
//! session, per task). Only the daily and session ceilings gate admission;
//! the per-task ceiling is observational and only raises events.

use std::collections::{BTreeMap, HashSet};
use std::path::Path;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::core::task::TaskId;
use crate::error::Result;
use crate::util::lock;
use crate::{swlog, swlog_debug, swlog_warn};

/// Budget ceilings in tokens.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BudgetLimits {
    pub daily_limit: u64,
    pub session_limit: u64,
    pub task_limit: u64,
    /// Fraction of a limit at which a warning event fires.
    pub warning_threshold: f64,
}

impl Default for BudgetLimits {
    fn default() -> Self {
        Self {
            daily_limit: 1_000_000,
            session_limit: 200_000,
            task_limit: 50_000,
            warning_threshold: 0.8,
        }
    }
}

/// Partial update for [`TokenBudgetManager::set_limits`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LimitsUpdate {
    pub daily_limit: Option<u64>,
    pub session_limit: Option<u64>,
    pub task_limit: Option<u64>,
    pub warning_threshold: Option<f64>,
}

/// Tokens consumed by one agent call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub input: u64,
    pub output: u64,
    pub total: u64,
}

impl TokenUsage {
    pub fn new(input: u64, output: u64) -> Self {
        Self {
            input,
            output,
            total: input + output,
        }
    }
}

/// Which ceiling an event refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BudgetScope {
    Daily,
    Session,
    Task,
}

impl std::fmt::Display for BudgetScope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BudgetScope::Daily => write!(f, "daily"),
            BudgetScope::Session => write!(f, "session"),
            BudgetScope::Task => write!(f, "task"),
        }
    }
}

/// Threshold notifications, each sent once per scope (and per task for
/// the task scope) until the matching reset.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BudgetEvent {
    Warning {
        scope: BudgetScope,
        task_id: Option<TaskId>,
        used: u64,
        limit: u64,
    },
    LimitReached {
        scope: BudgetScope,
        task_id: Option<TaskId>,
        used: u64,
        limit: u64,
    },
}

/// Answer from [`TokenBudgetManager::can_proceed`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BudgetDecision {
    pub allowed: bool,
    pub reason: Option<String>,
}

impl BudgetDecision {
    fn allow() -> Self {
        Self {
            allowed: true,
            reason: None,
        }
    }

    fn deny(reason: String) -> Self {
        Self {
            allowed: false,
            reason: Some(reason),
        }
    }
}

/// Execution tier an agent should target, cheapest first.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionTier {
    Local,
    Flash,
    #[default]
    Pro,
}

impl std::fmt::Display for ExecutionTier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExecutionTier::Local => write!(f, "local"),
            ExecutionTier::Flash => write!(f, "flash"),
            ExecutionTier::Pro => write!(f, "pro"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BudgetRemaining {
    pub daily: u64,
    pub session: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BudgetStats {
    pub daily_used: u64,
    pub daily_limit: u64,
    pub daily_percent: f64,
    pub session_used: u64,
    pub session_limit: u64,
    pub session_percent: f64,
    pub task_usage: BTreeMap<TaskId, u64>,
}

/// On-disk form written by `save` and read by `load`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct PersistedBudget {
    daily_used: u64,
    session_used: u64,
    #[serde(default)]
    task_usage: BTreeMap<TaskId, u64>,
    #[serde(default)]
    limits: Option<BudgetLimits>,
    #[serde(default)]
    saved_at: Option<DateTime<Utc>>,
}

type AlertKey = (BudgetScope, Option<TaskId>);

#[derive(Debug, Default)]
struct Ledger {
    daily_used: u64,
    session_used: u64,
    task_usage: BTreeMap<TaskId, u64>,
    warned: HashSet<AlertKey>,
    reached: HashSet<AlertKey>,
}

impl Ledger {
    fn clear_alerts(&mut self, scope: BudgetScope) {
        self.warned.retain(|(s, _)| *s != scope);
        self.reached.retain(|(s, _)| *s != scope);
    }
}

fn percent(used: u64, limit: u64) -> f64 {
    if limit == 0 {
        100.0
    } else {
        used as f64 / limit as f64 * 100.0
    }
}

/// Tracks token consumption and gates admission.
#[derive(Debug, Default)]
pub struct TokenBudgetManager {
    limits: Mutex<BudgetLimits>,
    ledger: Mutex<Ledger>,
    events: Option<mpsc::UnboundedSender<BudgetEvent>>,
}

impl TokenBudgetManager {
    pub fn new(limits: BudgetLimits) -> Self {
        Self {
            limits: Mutex::new(limits),
            ledger: Mutex::new(Ledger::default()),
            events: None,
        }
    }

    pub fn with_events(mut self, tx: mpsc::UnboundedSender<BudgetEvent>) -> Self {
        self.events = Some(tx);
        self
    }

    pub fn limits(&self) -> BudgetLimits {
        lock(&self.limits).clone()
    }

    /// Add `usage.total` to the daily, session, and per-task totals.
    pub fn track(&self, task_id: TaskId, usage: TokenUsage) {
        let limits = self.limits();
        let mut fired = Vec::new();
        {
            let mut ledger = lock(&self.ledger);
            ledger.daily_used += usage.total;
            ledger.session_used += usage.total;
            let task_used = {
                let entry = ledger.task_usage.entry(task_id).or_insert(0);
                *entry += usage.total;
                *entry
            };
            let checks = [
                (BudgetScope::Daily, None, ledger.daily_used, limits.daily_limit),
                (BudgetScope::Session, None, ledger.session_used, limits.session_limit),
                (BudgetScope::Task, Some(task_id), task_used, limits.task_limit),
            ];
            for (scope, task, used, limit) in checks {
                let key = (scope, task);
                let warn_at = (limits.warning_threshold * limit as f64).ceil() as u64;
                if used >= warn_at && ledger.warned.insert(key) {
                    fired.push(BudgetEvent::Warning {
                        scope,
                        task_id: task,
                        used,
                        limit,
                    });
                }
                if used >= limit && ledger.reached.insert(key) {
                    fired.push(BudgetEvent::LimitReached {
                        scope,
                        task_id: task,
                        used,
                        limit,
                    });
                }
            }
        }
        swlog_debug!("budget: task {} used {} tokens", task_id, usage.total);
        for event in fired {
            match &event {
                BudgetEvent::Warning {
                    scope, used, limit, ..
                } => swlog!("budget: {} usage at {}/{} tokens", scope, used, limit),
                BudgetEvent::LimitReached {
                    scope, used, limit, ..
                } => swlog_warn!("budget: {} limit reached ({}/{})", scope, used, limit),
            }
            if let Some(tx) = &self.events {
                let _ = tx.send(event);
            }
        }
    }

    /// Whether a call estimated at `estimate` tokens fits the daily and
    /// session budgets.
    pub fn can_proceed(&self, estimate: u64) -> BudgetDecision {
        let limits = self.limits();
        let ledger = lock(&self.ledger);
        let gates = [
            ("Daily", ledger.daily_used, limits.daily_limit),
            ("Session", ledger.session_used, limits.session_limit),
        ];
        for (label, used, limit) in gates {
            if used >= limit {
                return BudgetDecision::deny(format!(
                    "{} token limit reached ({}/{})",
                    label, used, limit
                ));
            }
            if used.saturating_add(estimate) >= limit {
                return BudgetDecision::deny(format!(
                    "{} token limit would be exceeded ({} used + {} estimated >= {})",
                    label, used, estimate, limit
                ));
            }
        }
        BudgetDecision::allow()
    }

    pub fn remaining(&self) -> BudgetRemaining {
        let limits = self.limits();
        let ledger = lock(&self.ledger);
        BudgetRemaining {
            daily: limits.daily_limit.saturating_sub(ledger.daily_used),
            session: limits.session_limit.saturating_sub(ledger.session_used),
        }
    }

    pub fn stats(&self) -> BudgetStats {
        let limits = self.limits();
        let ledger = lock(&self.ledger);
        BudgetStats {
            daily_used: ledger.daily_used,
            daily_limit: limits.daily_limit,
            daily_percent: percent(ledger.daily_used, limits.daily_limit),
            session_used: ledger.session_used,
            session_limit: limits.session_limit,
            session_percent: percent(ledger.session_used, limits.session_limit),
            task_usage: ledger.task_usage.clone(),
        }
    }

    /// Zero the session total and per-task totals. Daily usage is kept.
    pub fn reset_session(&self) {
        let mut ledger = lock(&self.ledger);
        ledger.session_used = 0;
        ledger.task_usage.clear();
        ledger.clear_alerts(BudgetScope::Session);
        ledger.clear_alerts(BudgetScope::Task);
        swlog!("budget: session reset");
    }

    /// Zero the daily total.
    pub fn reset_daily(&self) {
        let mut ledger = lock(&self.ledger);
        ledger.daily_used = 0;
        ledger.clear_alerts(BudgetScope::Daily);
        swlog!("budget: daily usage reset");
    }

    /// Replace only the limits present in `update`.
    pub fn set_limits(&self, update: LimitsUpdate) {
        let mut limits = lock(&self.limits);
        if let Some(v) = update.daily_limit {
            limits.daily_limit = v;
        }
        if let Some(v) = update.session_limit {
            limits.session_limit = v;
        }
        if let Some(v) = update.task_limit {
            limits.task_limit = v;
        }
        if let Some(v) = update.warning_threshold {
            limits.warning_threshold = v;
        }
    }

    /// Pick the execution tier the remaining budget can afford.
    ///
    /// `Local` once the daily remainder drops below the estimate or 5% of
    /// the daily limit, `Flash` when the session remainder is under three
    /// times the estimate, `Pro` otherwise.
    pub fn suggest_model(&self, estimate: u64) -> ExecutionTier {
        let limits = self.limits();
        let remaining = self.remaining();
        let daily_floor = estimate.max(limits.daily_limit / 20);
        if remaining.daily < daily_floor {
            ExecutionTier::Local
        } else if remaining.session < estimate.saturating_mul(3) {
            ExecutionTier::Flash
        } else {
            ExecutionTier::Pro
        }
    }

    /// Restore usage totals from `path`.
    ///
    /// Returns `false` when the file does not exist, leaving usage at zero.
    /// Limits stay as configured; the persisted copy is informational.
    pub async fn load(&self, path: &Path) -> Result<bool> {
        let contents = match tokio::fs::read_to_string(path).await {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                swlog_debug!("budget: no saved state at {}", path.display());
                return Ok(false);
            }
            Err(e) => return Err(e.into()),
        };
        let persisted: PersistedBudget = serde_json::from_str(&contents)?;
        let mut ledger = lock(&self.ledger);
        ledger.daily_used = persisted.daily_used;
        ledger.session_used = persisted.session_used;
        ledger.task_usage = persisted.task_usage;
        ledger.warned.clear();
        ledger.reached.clear();
        swlog_debug!(
            "budget: loaded daily={} session={} from {}",
            ledger.daily_used,
            ledger.session_used,
            path.display()
        );
        Ok(true)
    }

    /// Write usage totals and limits to `path` as pretty JSON.
    pub async fn save(&self, path: &Path) -> Result<()> {
        let persisted = {
            let ledger = lock(&self.ledger);
            PersistedBudget {
                daily_used: ledger.daily_used,
                session_used: ledger.session_used,
                task_usage: ledger.task_usage.clone(),
                limits: Some(self.limits()),
                saved_at: Some(Utc::now()),
            }
        };
        let contents = serde_json::to_string_pretty(&persisted)?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let temp_path = path.with_extension("json.tmp");
        tokio::fs::write(&temp_path, &contents).await?;
        tokio::fs::rename(&temp_path, path).await?;
        swlog_debug!("budget: saved to {}", path.display());
        Ok(())
    }
}

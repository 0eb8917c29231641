use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::orchestration::budget::BudgetLimits;
use crate::orchestration::checkpoint::CheckpointConfig;
use crate::orchestration::circuit_breaker::CircuitBreakerConfig;
use crate::orchestration::pool::{PoolConfig, QueueOrder};
use crate::orchestration::rate_limiter::RateLimitConfig;
use crate::{swlog_debug, Error, Result};

/// Settings consumed by the scheduler and its gates.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Tasks allowed in flight across the whole graph.
    pub max_concurrency: usize,
    /// Wall-clock limit for a single attempt.
    pub task_timeout_ms: u64,
    /// Extra attempts after the first failure.
    pub max_retries: u32,
    /// Base delay before a retry, doubled on each further attempt.
    pub retry_delay_ms: u64,
    /// How long a task may wait for a pool slot.
    pub acquire_timeout_ms: u64,
    pub max_queue_size: usize,
    pub queue_order: QueueOrder,
    pub rate_limit: RateLimitConfig,
    pub circuit_breaker: CircuitBreakerConfig,
    pub budget: BudgetLimits,
    pub checkpoint: CheckpointConfig,
    /// Ask the budget manager for a cheaper tier when budget runs low.
    pub downgrade_tier: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_concurrency: 4,
            task_timeout_ms: 10 * 60 * 1000,
            max_retries: 2,
            retry_delay_ms: 1000,
            acquire_timeout_ms: 60_000,
            max_queue_size: 1000,
            queue_order: QueueOrder::Fifo,
            rate_limit: RateLimitConfig::default(),
            circuit_breaker: CircuitBreakerConfig::default(),
            budget: BudgetLimits::default(),
            checkpoint: CheckpointConfig::default(),
            downgrade_tier: false,
        }
    }
}

impl EngineConfig {
    pub fn task_timeout(&self) -> Duration {
        Duration::from_millis(self.task_timeout_ms)
    }

    /// Delay before attempt `attempt` (2 or later): `retry_delay_ms * 2^(attempt-2)`.
    pub fn retry_delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(2).min(16);
        Duration::from_millis(self.retry_delay_ms.saturating_mul(1u64 << exponent))
    }

    pub fn pool_config(&self) -> PoolConfig {
        PoolConfig {
            max_concurrent: self.max_concurrency,
            max_queue_size: self.max_queue_size,
            acquire_timeout_ms: self.acquire_timeout_ms,
            queue_order: self.queue_order,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_concurrency == 0 {
            return Err(Error::Validation(
                "max_concurrency must be at least 1".to_string(),
            ));
        }
        if self.task_timeout_ms == 0 {
            return Err(Error::Validation(
                "task_timeout_ms must be greater than 0".to_string(),
            ));
        }
        if self.rate_limit.enabled && self.rate_limit.tokens_per_interval == 0 {
            return Err(Error::Validation(
                "rate_limit.tokens_per_interval must be at least 1 when enabled".to_string(),
            ));
        }
        if self.rate_limit.enabled && self.rate_limit.max_burst == 0 {
            return Err(Error::Validation(
                "rate_limit.max_burst must be at least 1 when enabled".to_string(),
            ));
        }
        if self.circuit_breaker.failure_threshold == 0 || self.circuit_breaker.success_threshold == 0 {
            return Err(Error::Validation(
                "circuit_breaker thresholds must be at least 1".to_string(),
            ));
        }
        if !(0.0..=1.0).contains(&self.budget.warning_threshold) {
            return Err(Error::Validation(
                "budget.warning_threshold must be between 0 and 1".to_string(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct Config {
    /// Command used for agents without an entry in `agents`.
    pub default_command: Option<String>,
    /// Where checkpoints and budget state live; defaults to `~/.swarm`.
    pub state_dir: Option<String>,
    #[serde(default)]
    pub engine: EngineConfig,
    /// Command per agent reference.
    #[serde(default)]
    pub agents: BTreeMap<String, String>,
}

impl Config {
    pub fn swarm_dir() -> Result<PathBuf> {
        Ok(dirs::home_dir().ok_or(Error::NoHomeDir)?.join(".swarm"))
    }

    pub fn config_path() -> Result<PathBuf> {
        Ok(Self::swarm_dir()?.join("swarm.toml"))
    }

    pub fn state_dir(&self) -> Result<PathBuf> {
        match &self.state_dir {
            Some(dir) => Ok(expand_tilde(dir)),
            None => Self::swarm_dir(),
        }
    }

    pub fn checkpoint_dir(&self) -> Result<PathBuf> {
        Ok(self.state_dir()?.join("checkpoints"))
    }

    pub fn budget_path(&self) -> Result<PathBuf> {
        Ok(self.state_dir()?.join("budget.json"))
    }

    pub fn load() -> Result<Self> {
        Self::load_from(&Self::config_path()?)
    }

    /// Load from `path`; a missing file yields defaults.
    pub fn load_from(path: &Path) -> Result<Self> {
        swlog_debug!("Config::load path={}", path.display());
        if !path.exists() {
            swlog_debug!("Config file not found, using defaults");
            return Ok(Self::default());
        }
        let config: Self = toml::from_str(&fs::read_to_string(path)?)?;
        config.engine.validate()?;
        swlog_debug!(
            "Config loaded: max_concurrency={}, agents={}, default_command={:?}",
            config.engine.max_concurrency,
            config.agents.len(),
            config.default_command
        );
        Ok(config)
    }

    pub fn save(&self) -> Result<()> {
        self.save_to(&Self::config_path()?)
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(dir) = path.parent() {
            if !dir.exists() {
                swlog_debug!("Creating config directory: {}", dir.display());
                fs::create_dir_all(dir)?;
            }
        }
        fs::write(path, toml::to_string_pretty(self)?)?;
        swlog_debug!("Config saved to {}", path.display());
        Ok(())
    }

    pub fn ensure_dirs(&self) -> Result<()> {
        let checkpoints = self.checkpoint_dir()?;
        if !checkpoints.exists() {
            swlog_debug!("Creating checkpoint directory: {}", checkpoints.display());
            fs::create_dir_all(&checkpoints)?;
        }
        Ok(())
    }
}

pub fn expand_tilde(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(path)
}

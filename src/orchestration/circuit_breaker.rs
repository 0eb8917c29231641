//! Per-provider circuit breakers.
//!
//! A `CircuitBreaker` stops calling a provider after repeated failures and
//! lets a trial call through once its cooldown has passed:
//!
//! - `CLOSED`: calls pass; `failure_threshold` consecutive failures open it.
//! - `OPEN`: calls are rejected without running until `timeout_ms` has
//!   elapsed since opening; the next call then moves it to `HALF_OPEN`.
//! - `HALF_OPEN`: `success_threshold` consecutive successes close it; any
//!   failure reopens it.
//!
//! The wrapped call's own error is always returned unchanged. Breakers are
//! shared through a `CircuitBreakerRegistry` keyed by provider name.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::time::Instant;

use crate::error::{Error, Result};
use crate::util::lock;
use crate::{swlog, swlog_warn};

/// Circuit breaker states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CircuitState::Closed => write!(f, "CLOSED"),
            CircuitState::Open => write!(f, "OPEN"),
            CircuitState::HalfOpen => write!(f, "HALF_OPEN"),
        }
    }
}

/// Breaker thresholds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures that open a closed breaker.
    pub failure_threshold: u32,
    /// Consecutive half-open successes that close the breaker.
    pub success_threshold: u32,
    /// Cooldown before an open breaker admits a trial call.
    pub timeout_ms: u64,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            success_threshold: 2,
            timeout_ms: 60_000,
        }
    }
}

impl CircuitBreakerConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

/// Emitted on every state transition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BreakerEvent {
    StateChanged {
        name: String,
        from: CircuitState,
        to: CircuitState,
    },
}

/// Point-in-time view of one breaker.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BreakerStats {
    pub name: String,
    pub state: CircuitState,
    pub consecutive_failures: u32,
    pub consecutive_successes: u32,
    pub total_calls: u64,
    pub total_failures: u64,
    pub total_rejected: u64,
    /// How long the breaker has been open, if it is open.
    pub open_for_ms: Option<u64>,
}

#[derive(Debug)]
struct BreakerInner {
    state: CircuitState,
    consecutive_failures: u32,
    consecutive_successes: u32,
    opened_at: Option<Instant>,
    total_calls: u64,
    total_failures: u64,
    total_rejected: u64,
}

impl BreakerInner {
    fn closed() -> Self {
        Self {
            state: CircuitState::Closed,
            consecutive_failures: 0,
            consecutive_successes: 0,
            opened_at: None,
            total_calls: 0,
            total_failures: 0,
            total_rejected: 0,
        }
    }
}

/// Failure-isolation state machine for one provider.
#[derive(Debug)]
pub struct CircuitBreaker {
    name: String,
    config: CircuitBreakerConfig,
    inner: Mutex<BreakerInner>,
    events: Option<mpsc::UnboundedSender<BreakerEvent>>,
}

impl CircuitBreaker {
    pub fn new(name: &str, config: CircuitBreakerConfig) -> Self {
        Self {
            name: name.to_string(),
            config,
            inner: Mutex::new(BreakerInner::closed()),
            events: None,
        }
    }

    /// Report state transitions on `tx`.
    pub fn with_events(mut self, tx: mpsc::UnboundedSender<BreakerEvent>) -> Self {
        self.events = Some(tx);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    /// Current state. An open breaker whose cooldown has passed still reads
    /// `Open` until the next call arrives.
    pub fn state(&self) -> CircuitState {
        lock(&self.inner).state
    }

    /// Run `f` through the breaker.
    ///
    /// # Errors
    ///
    /// `CircuitOpen` without running `f` while the breaker is open and
    /// cooling down; otherwise whatever `f` returns.
    pub async fn call<F, Fut, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        self.admit()?;
        let result = f().await;
        match &result {
            Ok(_) => self.record_success(),
            Err(_) => self.record_failure(),
        }
        result
    }

    fn admit(&self) -> Result<()> {
        let mut inner = lock(&self.inner);
        inner.total_calls += 1;
        if inner.state == CircuitState::Open {
            let cooled = inner
                .opened_at
                .map(|at| at.elapsed() >= self.config.timeout())
                .unwrap_or(true);
            if !cooled {
                inner.total_rejected += 1;
                return Err(Error::CircuitOpen {
                    name: self.name.clone(),
                });
            }
            inner.consecutive_successes = 0;
            self.transition(&mut inner, CircuitState::HalfOpen);
        }
        Ok(())
    }

    /// Count a successful call.
    pub fn record_success(&self) {
        let mut inner = lock(&self.inner);
        match inner.state {
            CircuitState::Closed => inner.consecutive_failures = 0,
            CircuitState::HalfOpen => {
                inner.consecutive_successes += 1;
                if inner.consecutive_successes >= self.config.success_threshold {
                    inner.consecutive_failures = 0;
                    inner.consecutive_successes = 0;
                    inner.opened_at = None;
                    self.transition(&mut inner, CircuitState::Closed);
                }
            }
            // A call admitted before the breaker opened.
            CircuitState::Open => {}
        }
    }

    /// Count a failed call.
    pub fn record_failure(&self) {
        let mut inner = lock(&self.inner);
        inner.total_failures += 1;
        match inner.state {
            CircuitState::Closed => {
                inner.consecutive_failures += 1;
                if inner.consecutive_failures >= self.config.failure_threshold {
                    inner.opened_at = Some(Instant::now());
                    self.transition(&mut inner, CircuitState::Open);
                }
            }
            CircuitState::HalfOpen => {
                inner.consecutive_successes = 0;
                inner.opened_at = Some(Instant::now());
                self.transition(&mut inner, CircuitState::Open);
            }
            CircuitState::Open => {}
        }
    }

    /// Force the breaker closed with zeroed counters.
    pub fn reset(&self) {
        let mut inner = lock(&self.inner);
        inner.consecutive_failures = 0;
        inner.consecutive_successes = 0;
        inner.opened_at = None;
        if inner.state != CircuitState::Closed {
            self.transition(&mut inner, CircuitState::Closed);
        }
    }

    pub fn stats(&self) -> BreakerStats {
        let inner = lock(&self.inner);
        BreakerStats {
            name: self.name.clone(),
            state: inner.state,
            consecutive_failures: inner.consecutive_failures,
            consecutive_successes: inner.consecutive_successes,
            total_calls: inner.total_calls,
            total_failures: inner.total_failures,
            total_rejected: inner.total_rejected,
            open_for_ms: match inner.state {
                CircuitState::Open => inner
                    .opened_at
                    .map(|at| at.elapsed().as_millis() as u64),
                _ => None,
            },
        }
    }

    fn transition(&self, inner: &mut BreakerInner, to: CircuitState) {
        let from = inner.state;
        inner.state = to;
        if to == CircuitState::Open {
            swlog_warn!(
                "circuit breaker {}: {} -> {} after {} failure(s)",
                self.name,
                from,
                to,
                inner.consecutive_failures
            );
        } else {
            swlog!("circuit breaker {}: {} -> {}", self.name, from, to);
        }
        if let Some(tx) = &self.events {
            let _ = tx.send(BreakerEvent::StateChanged {
                name: self.name.clone(),
                from,
                to,
            });
        }
    }
}

/// Name-keyed collection of breakers, one per provider.
#[derive(Debug, Default)]
pub struct CircuitBreakerRegistry {
    breakers: Mutex<HashMap<String, Arc<CircuitBreaker>>>,
    events: Option<mpsc::UnboundedSender<BreakerEvent>>,
}

impl CircuitBreakerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach `tx` to every breaker created from now on.
    pub fn with_events(mut self, tx: mpsc::UnboundedSender<BreakerEvent>) -> Self {
        self.events = Some(tx);
        self
    }

    /// Return the breaker for `name`, creating it with `config` on first use.
    ///
    /// Later calls return the same breaker and ignore `config`.
    pub fn get_or_create(&self, name: &str, config: &CircuitBreakerConfig) -> Arc<CircuitBreaker> {
        let mut breakers = lock(&self.breakers);
        let breaker = breakers.entry(name.to_string()).or_insert_with(|| {
            let mut breaker = CircuitBreaker::new(name, config.clone());
            if let Some(tx) = &self.events {
                breaker = breaker.with_events(tx.clone());
            }
            Arc::new(breaker)
        });
        Arc::clone(breaker)
    }

    pub fn get(&self, name: &str) -> Option<Arc<CircuitBreaker>> {
        lock(&self.breakers).get(name).cloned()
    }

    /// Force every breaker closed with zeroed counters.
    pub fn reset_all(&self) {
        let breakers: Vec<Arc<CircuitBreaker>> = lock(&self.breakers).values().cloned().collect();
        for breaker in breakers {
            breaker.reset();
        }
    }

    /// Stats for every breaker, sorted by name.
    pub fn all_stats(&self) -> Vec<BreakerStats> {
        let breakers: Vec<Arc<CircuitBreaker>> = lock(&self.breakers).values().cloned().collect();
        let mut stats: Vec<BreakerStats> = breakers.iter().map(|b| b.stats()).collect();
        stats.sort_by(|a, b| a.name.cmp(&b.name));
        stats
    }

    pub fn len(&self) -> usize {
        lock(&self.breakers).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

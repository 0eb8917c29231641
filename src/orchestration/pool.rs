//! Bounded-concurrency execution pool.
//!
//! The `ConnectionPool` runs units of work with at most `max_concurrent` in
//! flight. Extra work waits in a bounded queue (FIFO or LIFO) until a slot
//! frees up or its acquire timeout expires. A finishing unit hands its slot
//! straight to the next queued waiter, so `active` never dips between the
//! two.

use std::collections::VecDeque;
use std::future::Future;
use std::sync::Mutex;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;
use tokio::time::Instant;

use crate::error::{Error, Result};
use crate::util::{elapsed_ms, lock};
use crate::{swlog_debug, swlog_trace};

/// Order in which queued requests are released.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum QueueOrder {
    /// Oldest request first.
    #[default]
    Fifo,
    /// Newest request first.
    Lifo,
}

/// Pool settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Maximum units of work running at once.
    pub max_concurrent: usize,
    /// Maximum requests waiting for a slot.
    pub max_queue_size: usize,
    /// How long a queued request may wait before it is rejected.
    pub acquire_timeout_ms: u64,
    /// Release order for queued requests.
    pub queue_order: QueueOrder,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 4,
            max_queue_size: 1000,
            acquire_timeout_ms: 60_000,
            queue_order: QueueOrder::Fifo,
        }
    }
}

impl PoolConfig {
    pub fn acquire_timeout(&self) -> Duration {
        Duration::from_millis(self.acquire_timeout_ms)
    }
}

/// Running pool statistics.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct PoolStats {
    /// Units of work that ran to completion (success or failure).
    pub total_executed: u64,
    /// Units of work that returned an error.
    pub total_failed: u64,
    /// Queued requests rejected by the acquire timeout.
    pub total_timeout: u64,
    /// Highest number of simultaneously running units.
    pub peak_concurrent: usize,
    /// Longest the queue has been.
    pub peak_queue_size: usize,
    /// Mean time from request to dispatch, in milliseconds.
    pub avg_wait_ms: f64,
    /// Mean run time of a unit of work, in milliseconds.
    pub avg_execution_ms: f64,
    /// Units running right now.
    pub active: usize,
    /// Requests waiting right now.
    pub queued: usize,
}

/// A queued request: the grant channel fires once a slot is handed over.
struct Waiter {
    id: u64,
    enqueued_at: Instant,
    grant: oneshot::Sender<Result<()>>,
}

#[derive(Default)]
struct PoolState {
    active: usize,
    queue: VecDeque<Waiter>,
    next_waiter: u64,
    executed: u64,
    failed: u64,
    timeouts: u64,
    peak_concurrent: usize,
    peak_queue: usize,
    wait_total_ms: u64,
    wait_count: u64,
    exec_total_ms: u64,
    exec_count: u64,
}

impl PoolState {
    fn record_wait(&mut self, ms: u64) {
        self.wait_total_ms = self.wait_total_ms.saturating_add(ms);
        self.wait_count += 1;
    }

    fn pop_next(&mut self, order: QueueOrder) -> Option<Waiter> {
        match order {
            QueueOrder::Fifo => self.queue.pop_front(),
            QueueOrder::Lifo => self.queue.pop_back(),
        }
    }

    fn remove_waiter(&mut self, id: u64) -> bool {
        match self.queue.iter().position(|w| w.id == id) {
            Some(pos) => {
                self.queue.remove(pos);
                true
            }
            None => false,
        }
    }
}

/// Bounded-concurrency execution queue.
///
/// # Example
///
/// ```ignore
/// use swarm::orchestration::{ConnectionPool, PoolConfig};
///
/// let pool = ConnectionPool::new(PoolConfig::default());
/// let answer = pool.execute(|| async { Ok(42) }).await?;
/// ```
pub struct ConnectionPool {
    config: PoolConfig,
    state: Mutex<PoolState>,
}

impl ConnectionPool {
    pub fn new(config: PoolConfig) -> Self {
        Self {
            config,
            state: Mutex::new(PoolState::default()),
        }
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    /// Units of work running right now.
    pub fn active(&self) -> usize {
        lock(&self.state).active
    }

    /// Requests waiting for a slot right now.
    pub fn queue_len(&self) -> usize {
        lock(&self.state).queue.len()
    }

    /// Run `f` once a slot is available.
    ///
    /// # Errors
    ///
    /// - `PoolExhausted` immediately if the queue is full
    /// - `Timeout` if the request waited longer than the acquire timeout
    /// - `PoolDrained` if the queue was drained while waiting
    /// - whatever `f` itself returns
    pub async fn execute<F, Fut, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let slot = self.acquire().await?;
        let started = Instant::now();
        let result = f().await;
        self.record_execution(elapsed_ms(started), result.is_ok());
        drop(slot);
        result
    }

    /// Reject every queued request with `PoolDrained`.
    ///
    /// Running work is unaffected. Returns how many requests were rejected.
    pub fn drain(&self) -> usize {
        let waiters: Vec<Waiter> = lock(&self.state).queue.drain(..).collect();
        let count = waiters.len();
        for waiter in waiters {
            let _ = waiter.grant.send(Err(Error::PoolDrained));
        }
        if count > 0 {
            swlog_debug!("pool: drained {} queued request(s)", count);
        }
        count
    }

    /// Snapshot of the running statistics.
    pub fn stats(&self) -> PoolStats {
        let state = lock(&self.state);
        let avg = |total: u64, count: u64| {
            if count == 0 {
                0.0
            } else {
                total as f64 / count as f64
            }
        };
        PoolStats {
            total_executed: state.executed,
            total_failed: state.failed,
            total_timeout: state.timeouts,
            peak_concurrent: state.peak_concurrent,
            peak_queue_size: state.peak_queue,
            avg_wait_ms: avg(state.wait_total_ms, state.wait_count),
            avg_execution_ms: avg(state.exec_total_ms, state.exec_count),
            active: state.active,
            queued: state.queue.len(),
        }
    }

    async fn acquire(&self) -> Result<PoolSlot<'_>> {
        let (id, rx) = {
            let mut state = lock(&self.state);
            if state.active < self.config.max_concurrent {
                state.active += 1;
                state.peak_concurrent = state.peak_concurrent.max(state.active);
                state.record_wait(0);
                return Ok(PoolSlot { pool: self });
            }
            if state.queue.len() >= self.config.max_queue_size {
                return Err(Error::PoolExhausted {
                    queue_length: state.queue.len(),
                    max_queue_size: self.config.max_queue_size,
                });
            }
            let (tx, rx) = oneshot::channel();
            let id = state.next_waiter;
            state.next_waiter += 1;
            state.queue.push_back(Waiter {
                id,
                enqueued_at: Instant::now(),
                grant: tx,
            });
            state.peak_queue = state.peak_queue.max(state.queue.len());
            swlog_trace!("pool: request {} queued ({} waiting)", id, state.queue.len());
            (id, rx)
        };

        let mut ticket = QueueTicket {
            pool: self,
            id,
            grant: Some(rx),
        };
        let timeout = self.config.acquire_timeout();
        let waited = match ticket.grant.as_mut() {
            Some(rx) => tokio::time::timeout(timeout, rx).await,
            None => return Err(Error::PoolDrained),
        };

        match waited {
            Ok(Ok(grant)) => {
                ticket.grant = None;
                grant.map(|()| PoolSlot { pool: self })
            }
            Ok(Err(_closed)) => {
                ticket.grant = None;
                Err(Error::PoolDrained)
            }
            Err(_elapsed) => {
                let mut state = lock(&self.state);
                if state.remove_waiter(id) {
                    state.timeouts += 1;
                    ticket.grant = None;
                    swlog_debug!("pool: request {} timed out after {:?}", id, timeout);
                    return Err(Error::Timeout(timeout));
                }
                drop(state);
                // The slot was handed over just as the timer fired.
                match ticket.grant.take().map(|mut rx| rx.try_recv()) {
                    Some(Ok(Ok(()))) => Ok(PoolSlot { pool: self }),
                    Some(Ok(Err(e))) => Err(e),
                    _ => Err(Error::Timeout(timeout)),
                }
            }
        }
    }

    fn release(&self) {
        let mut state = lock(&self.state);
        while let Some(waiter) = state.pop_next(self.config.queue_order) {
            let waited = elapsed_ms(waiter.enqueued_at);
            if waiter.grant.send(Ok(())).is_ok() {
                state.record_wait(waited);
                swlog_trace!("pool: slot handed to request {}", waiter.id);
                return;
            }
        }
        state.active = state.active.saturating_sub(1);
    }

    fn record_execution(&self, ms: u64, ok: bool) {
        let mut state = lock(&self.state);
        state.executed += 1;
        if !ok {
            state.failed += 1;
        }
        state.exec_total_ms = state.exec_total_ms.saturating_add(ms);
        state.exec_count += 1;
    }
}

/// A held pool slot; dropping it releases the slot to the next waiter.
struct PoolSlot<'a> {
    pool: &'a ConnectionPool,
}

impl Drop for PoolSlot<'_> {
    fn drop(&mut self) {
        self.pool.release();
    }
}

/// A queued request that has not been resolved yet.
///
/// If the waiting future is dropped, the request leaves the queue, and a
/// slot granted in the meantime is passed on instead of leaking.
struct QueueTicket<'a> {
    pool: &'a ConnectionPool,
    id: u64,
    grant: Option<oneshot::Receiver<Result<()>>>,
}

impl Drop for QueueTicket<'_> {
    fn drop(&mut self) {
        let Some(mut rx) = self.grant.take() else {
            return;
        };
        if lock(&self.pool.state).remove_waiter(self.id) {
            return;
        }
        if let Ok(Ok(())) = rx.try_recv() {
            self.pool.release();
        }
    }
}

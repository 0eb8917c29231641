//! Concurrency gate: rate limiter in front of the connection pool.
//!
//! Every unit of work first takes a rate token and only then competes for
//! a pool slot, so throughput stays capped no matter how many slots are
//! free.

use std::future::Future;

use crate::error::Result;
use crate::orchestration::pool::{ConnectionPool, PoolConfig, PoolStats};
use crate::orchestration::rate_limiter::{RateLimitConfig, RateLimiter};

/// Rate-limited, bounded-concurrency executor (the "managed pool").
pub struct ConcurrencyGate {
    limiter: RateLimiter,
    pool: ConnectionPool,
}

impl ConcurrencyGate {
    pub fn new(pool: PoolConfig, rate_limit: RateLimitConfig) -> Self {
        Self {
            limiter: RateLimiter::new(rate_limit),
            pool: ConnectionPool::new(pool),
        }
    }

    /// Wait for a rate token, then run `f` in the pool.
    pub async fn execute<F, Fut, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        self.limiter.acquire().await;
        self.pool.execute(f).await
    }

    pub fn limiter(&self) -> &RateLimiter {
        &self.limiter
    }

    pub fn pool(&self) -> &ConnectionPool {
        &self.pool
    }

    pub fn stats(&self) -> PoolStats {
        self.pool.stats()
    }

    /// Reject everything waiting for a pool slot.
    pub fn drain(&self) -> usize {
        self.pool.drain()
    }
}

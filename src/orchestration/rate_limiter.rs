//! Token-bucket rate limiter.
//!
//! Bounds how fast work is admitted, independent of how many pool slots
//! are free. The bucket starts full at `max_burst` tokens and refills at
//! `tokens_per_interval` per `interval_ms`.

use std::sync::Mutex;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use crate::swlog_trace;
use crate::util::lock;

/// Rate limiter settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    /// Tokens added per interval.
    pub tokens_per_interval: u32,
    /// Refill interval in milliseconds.
    pub interval_ms: u64,
    /// Bucket capacity and starting token count.
    pub max_burst: u32,
    /// When false every acquire succeeds immediately.
    pub enabled: bool,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            tokens_per_interval: 60,
            interval_ms: 60_000,
            max_burst: 10,
            enabled: true,
        }
    }
}

impl RateLimitConfig {
    /// A configuration that never throttles.
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            ..Default::default()
        }
    }

    /// Wait between retries of a blocked `acquire`: one token's worth of time.
    pub fn retry_delay(&self) -> Duration {
        let per_token = (self.interval_ms as f64 / self.tokens_per_interval.max(1) as f64).ceil();
        Duration::from_millis((per_token as u64).max(1))
    }
}

#[derive(Debug)]
struct Bucket {
    tokens: f64,
    last_refill: Instant,
}

/// Token-bucket throttle.
#[derive(Debug)]
pub struct RateLimiter {
    config: RateLimitConfig,
    bucket: Mutex<Bucket>,
}

impl RateLimiter {
    /// Create a limiter with a full bucket.
    pub fn new(config: RateLimitConfig) -> Self {
        let tokens = config.max_burst as f64;
        Self {
            config,
            bucket: Mutex::new(Bucket {
                tokens,
                last_refill: Instant::now(),
            }),
        }
    }

    /// The limiter's settings.
    pub fn config(&self) -> &RateLimitConfig {
        &self.config
    }

    /// Take a token if one is available, without waiting.
    pub fn try_acquire(&self) -> bool {
        if !self.config.enabled {
            return true;
        }
        let mut bucket = lock(&self.bucket);
        self.refill(&mut bucket);
        if bucket.tokens >= 1.0 {
            bucket.tokens -= 1.0;
            swlog_trace!("rate limiter: token taken, {} left", bucket.tokens);
            true
        } else {
            false
        }
    }

    /// Wait until a token is available and take it.
    pub async fn acquire(&self) {
        let delay = self.config.retry_delay();
        while !self.try_acquire() {
            swlog_trace!("rate limiter: throttled, sleeping {:?}", delay);
            tokio::time::sleep(delay).await;
        }
    }

    /// Whole tokens available right now.
    pub fn available(&self) -> u32 {
        if !self.config.enabled {
            return self.config.max_burst;
        }
        let mut bucket = lock(&self.bucket);
        self.refill(&mut bucket);
        bucket.tokens as u32
    }

    fn refill(&self, bucket: &mut Bucket) {
        let now = Instant::now();
        let elapsed_ms = now.duration_since(bucket.last_refill).as_millis() as f64;
        let interval = self.config.interval_ms.max(1) as f64;
        let to_add = (elapsed_ms / interval * self.config.tokens_per_interval as f64).floor();
        // Only move the refill mark when something was added, otherwise
        // frequent checks would keep discarding partial progress.
        if to_add > 0.0 {
            bucket.tokens = (bucket.tokens + to_add).min(self.config.max_burst as f64);
            bucket.last_refill = now;
        }
    }
}

//! Execution engine and its resilience primitives.
//!
//! Leaves first: the token-bucket [`RateLimiter`], the bounded
//! [`ConnectionPool`], the [`ConcurrencyGate`] composing the two, per-agent
//! [`CircuitBreaker`]s, the [`TokenBudgetManager`], the
//! [`CheckpointManager`], and finally the [`Scheduler`] that drives a task
//! graph through all of them.

pub mod budget;
pub mod checkpoint;
pub mod circuit_breaker;
pub mod gate;
pub mod pool;
pub mod rate_limiter;
pub mod scheduler;

pub use budget::{
    BudgetDecision, BudgetEvent, BudgetLimits, BudgetRemaining, BudgetScope, BudgetStats,
    ExecutionTier, LimitsUpdate, TokenBudgetManager, TokenUsage,
};
pub use checkpoint::{
    Checkpoint, CheckpointConfig, CheckpointManager, CheckpointReceipt, CheckpointState,
};
pub use circuit_breaker::{
    BreakerEvent, BreakerStats, CircuitBreaker, CircuitBreakerConfig, CircuitBreakerRegistry,
    CircuitState,
};
pub use gate::ConcurrencyGate;
pub use pool::{ConnectionPool, PoolConfig, PoolStats, QueueOrder};
pub use rate_limiter::{RateLimitConfig, RateLimiter};
pub use scheduler::{
    dependency_context, AttemptOutcome, AttemptRecord, ExecutionResult, FailureKind, Scheduler,
    SchedulerEvent,
};

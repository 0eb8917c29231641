//! Integration test suite for swarm.
//!
//! These tests run whole task graphs through the scheduler and check the
//! engine's observable guarantees end to end.
//!
//! # Test Categories
//!
//! - `scheduler_e2e`: ordering, concurrency and context propagation
//! - `resilience`: failure isolation, retries, breakers, budget and rate gates
//! - `persistence`: checkpoints, resume and budget state on disk
//!
//! # CI Compatibility
//!
//! Agents are scripted mocks; nothing leaves the process.


mod persistence;
mod resilience;
mod scheduler_e2e;

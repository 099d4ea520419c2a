//! Lease engine: claiming, heartbeats, recovery and fair fetching.
//!
//! This module provides the moving parts built on top of [`crate::store`]:
//!
//! - **JobQueue**: producer surface (enqueue, stats, dead-letter views)
//! - **LeaseManager**: claim / renew / complete / release plus the heartbeat task
//! - **FairnessScheduler**: weighted round-robin choice of the next priority
//! - **IdempotencyGate**: suppresses side effects of redelivered jobs
//! - **Reaper** / **ScheduledMover**: background recovery and promotion loops
//! - **WorkerPool**: fetch loops that tie all of the above together
//!
//! # Architecture
//!
//! ```text
//!                      ┌──────────────┐
//!                      │   Producer   │
//!                      │  (JobQueue)  │
//!                      └──────┬───────┘
//!               ready_time ≤ now │ ready_time > now
//!                 ┌────────────┴────────────┐
//!          ┌──────▼───────┐          ┌──────▼───────┐
//!          │ ready:{p}    │◄─────────│ sched:{p}    │
//!          │ (list)       │  mover   │ (sorted set) │
//!          └──────┬───────┘          └──────────────┘
//!                 │ claim (atomic pop + lease)
//!         ┌───────┼───────────────────┐
//!         ▼       ▼                   ▼
//!    ┌─────────┐ ┌─────────┐     ┌─────────┐
//!    │ Worker 1│ │ Worker 2│ ... │ Worker N│──► proc:{w} ◄── reaper
//!    └─────────┘ └─────────┘     └─────────┘
//! ```
//!
//! # Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use workq::config::QueueConfig;
//! use workq::scheduler::{JobHandler, JobQueue, WorkerPool};
//!
//! let config = QueueConfig::load("workq.yaml")?;
//!
//! let queue = JobQueue::connect(&config).await?;
//! queue.enqueue(queue.job("high", "payload")).await?;
//!
//! let mut pool = WorkerPool::connect(config, Arc::new(MyHandler)).await?;
//! pool.start().await?;
//!
//! // Graceful shutdown
//! pool.shutdown().await?;
//! ```
//!
//! # Reliability Features
//!
//! - **Atomic claim**: pop and lease creation are one store operation
//! - **Crash recovery**: the reaper returns expired leases of stale workers
//! - **Dead letter queue**: jobs out of attempts are parked with their last error
//! - **Graceful shutdown**: running jobs get a grace period, then are released

pub mod breaker;
pub mod fairness;
pub mod idempotency;
pub mod job;
pub mod lease;
pub mod mover;
pub mod queue;
pub mod reaper;
pub mod registry;
pub mod retry;
pub mod worker_pool;

// Re-export main types for convenience
pub use breaker::{BreakerState, CircuitBreaker};
pub use fairness::FairnessScheduler;
pub use idempotency::{CompletionGuard, GateDecision, IdempotencyGate};
pub use job::{DeadLetterEntry, Job, DEFAULT_MAX_ATTEMPTS};
pub use lease::{Heartbeat, LeaseLoss, LeaseManager};
pub use mover::ScheduledMover;
pub use queue::{EnqueueRoute, JobQueue, PriorityStats, QueueError, QueueStats};
pub use reaper::{ReapReport, Reaper};
pub use registry::{generate_worker_id, WorkerRegistry};
pub use retry::{with_backoff, RetryPolicy};
pub use worker_pool::{JobHandler, PoolError, PoolStats, WorkerPool, WorkerPoolConfig};

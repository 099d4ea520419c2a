//! workq: distributed at-least-once job queue on Redis.
//!
//! Jobs are claimed under time-bounded leases kept alive by heartbeats.
//! A reaper returns the leases of crashed workers, a mover promotes delayed
//! jobs when they come due, and an idempotency gate keeps redelivered jobs
//! from repeating their side effects.

// Core modules
pub mod cli;
pub mod clock;
pub mod config;
pub mod error;
pub mod metrics;
pub mod scheduler;
pub mod store;

// Re-export commonly used types
pub use config::QueueConfig;
pub use error::{ConfigError, StoreError};
pub use scheduler::{Job, JobHandler, JobQueue, WorkerPool};

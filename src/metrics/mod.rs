//! Metrics module for Prometheus-based monitoring.
//!
//! Claims, finishes, reclaims, promotions and renewals are counted here, and
//! queue depths are published as gauges whenever `JobQueue::stats` runs.
//! Operators watch DLQ growth and the reclaim rate through these metrics.
//!
//! # Example
//!
//! ```ignore
//! use workq::metrics::{init_metrics, export_metrics, MetricsCollector};
//!
//! init_metrics().expect("Failed to initialize metrics");
//!
//! let collector = MetricsCollector::new();
//! collector.record_claim("high");
//!
//! let metrics_text = export_metrics();
//! ```

pub mod collectors;
pub mod prometheus;

pub use collectors::MetricsCollector;
pub use prometheus::{export_metrics, init_metrics};

pub use prometheus::{
    ACTIVE_WORKERS, CIRCUIT_BREAKER_STATE, CIRCUIT_BREAKER_TRIPS, IDEMPOTENCY_DUPLICATES,
    JOBS_CLAIMED, JOBS_ENQUEUED, JOBS_FINISHED, JOBS_PROMOTED, JOB_DURATION, LEASE_RENEWALS,
    QUEUE_DEPTH, RECLAIMS, REGISTRY,
};

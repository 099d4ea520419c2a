//! Prometheus metrics registration and export.
//!
//! This module defines all Prometheus metrics used by workq and provides
//! functions for initializing, registering, and exporting metrics.

use prometheus::{
    CounterVec, Encoder, Gauge, GaugeVec, Histogram, HistogramOpts, IntCounter, Opts, Registry,
    TextEncoder,
};
use std::sync::OnceLock;

/// Global Prometheus registry for all workq metrics.
pub static REGISTRY: OnceLock<Registry> = OnceLock::new();

/// Jobs accepted from producers, labeled by priority and route (ready/scheduled).
pub static JOBS_ENQUEUED: OnceLock<CounterVec> = OnceLock::new();

/// Successful claims, labeled by priority.
pub static JOBS_CLAIMED: OnceLock<CounterVec> = OnceLock::new();

/// Finished leases, labeled by outcome.
pub static JOBS_FINISHED: OnceLock<CounterVec> = OnceLock::new();

/// Reaper reclaim attempts, labeled by outcome.
pub static RECLAIMS: OnceLock<CounterVec> = OnceLock::new();

/// Jobs promoted from the scheduled set, labeled by priority.
pub static JOBS_PROMOTED: OnceLock<CounterVec> = OnceLock::new();

/// Lease renewals, labeled by result.
pub static LEASE_RENEWALS: OnceLock<CounterVec> = OnceLock::new();

/// Deliveries suppressed by the idempotent completion gate.
pub static IDEMPOTENCY_DUPLICATES: OnceLock<IntCounter> = OnceLock::new();

/// Handler execution duration in seconds.
pub static JOB_DURATION: OnceLock<Histogram> = OnceLock::new();

/// Queue depth, labeled by queue (`ready:{p}`, `sched:{p}`, `dlq`).
pub static QUEUE_DEPTH: OnceLock<GaugeVec> = OnceLock::new();

/// Number of fetch loops currently running a handler.
pub static ACTIVE_WORKERS: OnceLock<Gauge> = OnceLock::new();

/// Circuit breaker state: 0 closed, 1 half-open, 2 open.
pub static CIRCUIT_BREAKER_STATE: OnceLock<Gauge> = OnceLock::new();

/// Transitions of the circuit breaker into the open state.
pub static CIRCUIT_BREAKER_TRIPS: OnceLock<IntCounter> = OnceLock::new();

/// Initialize all metrics and register them with the registry.
///
/// Calling this more than once is a no-op.
///
/// # Errors
///
/// Returns a `prometheus::Error` if metric registration fails, typically due to
/// duplicate metric names or invalid metric configurations.
pub fn init_metrics() -> Result<(), prometheus::Error> {
    if REGISTRY.get().is_some() {
        return Ok(());
    }

    let registry = Registry::new();

    // Job lifecycle
    let jobs_enqueued = CounterVec::new(
        Opts::new("workq_jobs_enqueued_total", "Jobs accepted from producers"),
        &["priority", "route"],
    )?;

    let jobs_claimed = CounterVec::new(
        Opts::new("workq_jobs_claimed_total", "Jobs claimed by workers"),
        &["priority"],
    )?;

    let jobs_finished = CounterVec::new(
        Opts::new("workq_jobs_finished_total", "Leases finished by outcome"),
        &["outcome"],
    )?;

    let job_duration = Histogram::with_opts(
        HistogramOpts::new(
            "workq_job_duration_seconds",
            "Handler execution duration in seconds",
        )
        .buckets(vec![0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 30.0, 120.0, 600.0]),
    )?;

    // Background loops
    let reclaims = CounterVec::new(
        Opts::new("workq_reclaims_total", "Reaper reclaim attempts by outcome"),
        &["outcome"],
    )?;

    let jobs_promoted = CounterVec::new(
        Opts::new(
            "workq_jobs_promoted_total",
            "Jobs promoted from the scheduled set",
        ),
        &["priority"],
    )?;

    // Leases and the completion gate
    let lease_renewals = CounterVec::new(
        Opts::new("workq_lease_renewals_total", "Lease renewals by result"),
        &["result"],
    )?;

    let idempotency_duplicates = IntCounter::new(
        "workq_idempotency_duplicates_total",
        "Deliveries suppressed by the idempotency gate",
    )?;

    // Gauges
    let queue_depth = GaugeVec::new(
        Opts::new("workq_queue_depth", "Number of jobs per queue"),
        &["queue"],
    )?;

    let active_workers = Gauge::new(
        "workq_active_workers",
        "Number of workers currently running a handler",
    )?;

    let breaker_state = Gauge::new(
        "workq_circuit_breaker_state",
        "Circuit breaker state (0 closed, 1 half-open, 2 open)",
    )?;

    let breaker_trips = IntCounter::new(
        "workq_circuit_breaker_trips_total",
        "Transitions of the circuit breaker to open",
    )?;

    registry.register(Box::new(jobs_enqueued.clone()))?;
    registry.register(Box::new(jobs_claimed.clone()))?;
    registry.register(Box::new(jobs_finished.clone()))?;
    registry.register(Box::new(job_duration.clone()))?;
    registry.register(Box::new(reclaims.clone()))?;
    registry.register(Box::new(jobs_promoted.clone()))?;
    registry.register(Box::new(lease_renewals.clone()))?;
    registry.register(Box::new(idempotency_duplicates.clone()))?;
    registry.register(Box::new(queue_depth.clone()))?;
    registry.register(Box::new(active_workers.clone()))?;
    registry.register(Box::new(breaker_state.clone()))?;
    registry.register(Box::new(breaker_trips.clone()))?;

    // A concurrent initializer may have won; its metrics stay authoritative.
    let _ = REGISTRY.set(registry);
    let _ = JOBS_ENQUEUED.set(jobs_enqueued);
    let _ = JOBS_CLAIMED.set(jobs_claimed);
    let _ = JOBS_FINISHED.set(jobs_finished);
    let _ = JOB_DURATION.set(job_duration);
    let _ = RECLAIMS.set(reclaims);
    let _ = JOBS_PROMOTED.set(jobs_promoted);
    let _ = LEASE_RENEWALS.set(lease_renewals);
    let _ = IDEMPOTENCY_DUPLICATES.set(idempotency_duplicates);
    let _ = QUEUE_DEPTH.set(queue_depth);
    let _ = ACTIVE_WORKERS.set(active_workers);
    let _ = CIRCUIT_BREAKER_STATE.set(breaker_state);
    let _ = CIRCUIT_BREAKER_TRIPS.set(breaker_trips);

    tracing::info!("Prometheus metrics initialized successfully");

    Ok(())
}

/// Export all registered metrics in Prometheus text format.
///
/// If the registry has not been initialized or encoding fails, returns a
/// comment line describing the problem.
pub fn export_metrics() -> String {
    let Some(registry) = REGISTRY.get() else {
        return "# Metrics not initialized. Call init_metrics() first.\n".to_string();
    };

    let encoder = TextEncoder::new();
    let metric_families = registry.gather();

    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        return format!("# Error encoding metrics: {}\n", e);
    }

    String::from_utf8(buffer)
        .unwrap_or_else(|e| format!("# Error converting metrics to UTF-8: {}\n", e))
}

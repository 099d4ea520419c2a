//! Metric recording for the lease engine.
//!
//! `MetricsCollector` wraps the raw Prometheus metrics so call sites record by
//! intent (`record_claim`, `record_reclaim`) instead of by label. Every method
//! is a no-op until `init_metrics()` has run, so library users that never
//! initialize metrics pay nothing.

use super::prometheus::{
    ACTIVE_WORKERS, CIRCUIT_BREAKER_STATE, CIRCUIT_BREAKER_TRIPS, IDEMPOTENCY_DUPLICATES,
    JOBS_CLAIMED, JOBS_ENQUEUED, JOBS_FINISHED, JOBS_PROMOTED, JOB_DURATION, LEASE_RENEWALS,
    QUEUE_DEPTH, RECLAIMS,
};

/// Metrics collector for recording workq operational metrics.
///
/// # Example
///
/// ```ignore
/// use workq::metrics::{MetricsCollector, init_metrics};
///
/// init_metrics().expect("Failed to init metrics");
/// let collector = MetricsCollector::new();
///
/// collector.record_enqueue("high", "ready");
/// collector.record_claim("high");
/// collector.record_finish("completed", Some(0.42));
/// ```
#[derive(Debug, Clone, Copy, Default)]
pub struct MetricsCollector;

impl MetricsCollector {
    /// Create a new MetricsCollector instance.
    pub fn new() -> Self {
        Self
    }

    /// Record a job accepted from a producer.
    ///
    /// * `route` - `"ready"` or `"scheduled"`
    pub fn record_enqueue(&self, priority: &str, route: &str) {
        if let Some(enqueued) = JOBS_ENQUEUED.get() {
            enqueued.with_label_values(&[priority, route]).inc();
        }
    }

    /// Record a successful claim.
    pub fn record_claim(&self, priority: &str) {
        if let Some(claimed) = JOBS_CLAIMED.get() {
            claimed.with_label_values(&[priority]).inc();
        }
        tracing::trace!(priority = priority, "Recorded claim metric");
    }

    /// Record how a lease was finished, with the handler duration if one ran.
    pub fn record_finish(&self, outcome: &str, duration_secs: Option<f64>) {
        if let Some(finished) = JOBS_FINISHED.get() {
            finished.with_label_values(&[outcome]).inc();
        }

        if let (Some(histogram), Some(secs)) = (JOB_DURATION.get(), duration_secs) {
            histogram.observe(secs);
        }

        tracing::trace!(
            outcome = outcome,
            duration_secs = duration_secs,
            "Recorded finish metric"
        );
    }

    /// Record a reaper reclaim attempt.
    pub fn record_reclaim(&self, outcome: &str) {
        if let Some(reclaims) = RECLAIMS.get() {
            reclaims.with_label_values(&[outcome]).inc();
        }
    }

    /// Record jobs promoted by the mover.
    pub fn record_promoted(&self, priority: &str, count: usize) {
        if count == 0 {
            return;
        }
        if let Some(promoted) = JOBS_PROMOTED.get() {
            promoted
                .with_label_values(&[priority])
                .inc_by(count as f64);
        }
    }

    /// Record a lease renewal result (`renewed`, `not_owner`, `expired`, `error`).
    pub fn record_renewal(&self, result: &str) {
        if let Some(renewals) = LEASE_RENEWALS.get() {
            renewals.with_label_values(&[result]).inc();
        }
    }

    /// Record a delivery suppressed by the idempotency gate.
    pub fn record_duplicate(&self) {
        if let Some(duplicates) = IDEMPOTENCY_DUPLICATES.get() {
            duplicates.inc();
        }
    }

    /// Update the depth gauge of one queue.
    ///
    /// * `queue` - `ready:{priority}`, `sched:{priority}` or `dlq`
    pub fn update_queue_depth(&self, queue: &str, depth: usize) {
        if let Some(queue_depth) = QUEUE_DEPTH.get() {
            queue_depth.with_label_values(&[queue]).set(depth as f64);
        }

        tracing::trace!(queue = queue, depth = depth, "Updated queue depth metric");
    }

    /// Increment the count of workers running a handler.
    pub fn inc_active_workers(&self) {
        if let Some(active) = ACTIVE_WORKERS.get() {
            active.inc();
        }
    }

    /// Decrement the count of workers running a handler.
    pub fn dec_active_workers(&self) {
        if let Some(active) = ACTIVE_WORKERS.get() {
            active.dec();
        }
    }

    /// Publish the circuit breaker state (0 closed, 1 half-open, 2 open).
    pub fn update_breaker_state(&self, state: i64) {
        if let Some(gauge) = CIRCUIT_BREAKER_STATE.get() {
            gauge.set(state as f64);
        }
    }

    /// Record a transition of the circuit breaker to open.
    pub fn record_breaker_trip(&self) {
        if let Some(trips) = CIRCUIT_BREAKER_TRIPS.get() {
            trips.inc();
        }
    }
}

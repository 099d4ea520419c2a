//! Reaper: returns the jobs of crashed workers to the queue.
//!
//! Every scan takes the stale end of the worker registry and asks the store to
//! reclaim each worker's lease. The store only touches a lease whose expiry has
//! passed, so a worker that is slow to heartbeat but still renewing keeps its
//! job. Any number of reapers may run at once; each reclaim is atomic and a
//! second reaper finds nothing left to do.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

use super::registry::WorkerRegistry;
use super::retry::{with_backoff, RetryPolicy};
use crate::clock::Clock;
use crate::config::{ReaperConfig, RetryConfig};
use crate::error::StoreError;
use crate::metrics::MetricsCollector;
use crate::store::{duration_ms, LeaseStore, ReclaimOutcome};

/// What one scan did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReapReport {
    /// Stale workers examined.
    pub scanned: usize,
    pub requeued: usize,
    pub scheduled: usize,
    pub dead_lettered: usize,
    /// Stale workers whose lease had not expired yet.
    pub alive: usize,
    /// Stale workers holding no lease.
    pub idle: usize,
    /// Workers whose reclaim still failed after retries; tried again on the
    /// next scan.
    pub errors: usize,
}

impl ReapReport {
    /// Jobs returned to the queue or dead-lettered.
    pub fn reclaimed(&self) -> usize {
        self.requeued + self.scheduled + self.dead_lettered
    }
}

/// Background reclaim loop.
pub struct Reaper {
    store: Arc<dyn LeaseStore>,
    clock: Arc<dyn Clock>,
    registry: WorkerRegistry,
    retry: RetryPolicy,
    scan_interval: Duration,
    liveness_timeout: Duration,
    scan_batch: usize,
    metrics: MetricsCollector,
}

impl Reaper {
    pub fn new(store: Arc<dyn LeaseStore>, clock: Arc<dyn Clock>, config: &ReaperConfig) -> Self {
        Self {
            registry: WorkerRegistry::new(Arc::clone(&store), Arc::clone(&clock)),
            retry: RetryPolicy::for_store(&RetryConfig::default()),
            store,
            clock,
            scan_interval: Duration::from_millis(config.scan_interval_ms),
            liveness_timeout: Duration::from_millis(config.liveness_timeout_ms),
            scan_batch: config.scan_batch,
            metrics: MetricsCollector::new(),
        }
    }

    /// Replaces the retry policy for transient store errors.
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Runs one scan.
    ///
    /// Transient store errors are retried with backoff. A worker whose
    /// reclaim still fails is logged and counted and the scan moves on to
    /// the next. Only a failure to read the registry aborts the scan.
    pub async fn tick(&self) -> Result<ReapReport, StoreError> {
        let now = self.clock.now_ms();
        let cutoff = now.saturating_sub(duration_ms(self.liveness_timeout));
        let stale = with_backoff(&self.retry, "stale_workers", || {
            self.registry.stale(cutoff, self.scan_batch)
        })
        .await?;

        let mut report = ReapReport {
            scanned: stale.len(),
            ..Default::default()
        };

        for worker_id in stale {
            let reclaimed = with_backoff(&self.retry, "reclaim", || {
                self.store.reclaim(&worker_id, now, cutoff)
            })
            .await;
            match reclaimed {
                Ok(outcome) => {
                    self.metrics.record_reclaim(outcome.as_str());
                    match outcome {
                        ReclaimOutcome::Requeued => report.requeued += 1,
                        ReclaimOutcome::Scheduled => report.scheduled += 1,
                        ReclaimOutcome::DeadLettered => report.dead_lettered += 1,
                        ReclaimOutcome::Alive => report.alive += 1,
                        ReclaimOutcome::NoLease => report.idle += 1,
                    }
                    if outcome.reclaimed() {
                        info!(
                            worker_id = %worker_id,
                            outcome = outcome.as_str(),
                            "Reclaimed expired lease"
                        );
                    } else {
                        debug!(worker_id = %worker_id, outcome = outcome.as_str(), "Stale worker");
                    }
                }
                Err(e) => {
                    report.errors += 1;
                    warn!(worker_id = %worker_id, error = %e, "Reclaim failed");
                }
            }
        }

        Ok(report)
    }

    /// Scans every `scan_interval` until `shutdown` fires.
    pub async fn run(self, mut shutdown: broadcast::Receiver<()>) {
        info!(
            interval_ms = self.scan_interval.as_millis() as u64,
            liveness_timeout_ms = self.liveness_timeout.as_millis() as u64,
            "Reaper started"
        );
        let mut interval = tokio::time::interval(self.scan_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.recv() => break,
                _ = interval.tick() => {}
            }
            match self.tick().await {
                Ok(report) if report.reclaimed() > 0 => {
                    info!(
                        scanned = report.scanned,
                        reclaimed = report.reclaimed(),
                        dead_lettered = report.dead_lettered,
                        "Reaper scan"
                    );
                }
                Ok(_) => {}
                Err(e) => error!(error = %e, "Reaper scan failed"),
            }
        }
        info!("Reaper stopped");
    }
}

//! Lease manager: claim, heartbeat, complete and release.
//!
//! A lease is the exclusive, time-bounded right of one worker to process one
//! job. The manager wraps the store primitives with transient-error retries
//! and runs the heartbeat that keeps a lease alive while a handler works.

use std::sync::Arc;
use std::time::Duration;

use rand::RngExt;
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::retry::{with_backoff, RetryPolicy};
use crate::clock::Clock;
use crate::config::QueueConfig;
use crate::error::StoreError;
use crate::metrics::MetricsCollector;
use crate::store::{FinishOutcome, JobOutcome, Lease, LeaseHandle, LeaseStore, RenewOutcome};

/// Why a heartbeat stopped renewing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeaseLoss {
    /// The record was reclaimed or replaced.
    NotOwner,
    /// The record is still ours but expired before the renewal arrived.
    Expired,
    /// The store could not be reached before the lease ran out.
    Unreachable,
}

impl LeaseLoss {
    pub fn as_str(&self) -> &'static str {
        match self {
            LeaseLoss::NotOwner => "not_owner",
            LeaseLoss::Expired => "expired",
            LeaseLoss::Unreachable => "unreachable",
        }
    }
}

/// Lease operations bound to one store, clock and timing configuration.
#[derive(Clone)]
pub struct LeaseManager {
    store: Arc<dyn LeaseStore>,
    clock: Arc<dyn Clock>,
    ttl: Duration,
    renewal_min: Duration,
    renewal_max: Duration,
    retry: RetryPolicy,
    metrics: MetricsCollector,
}

impl std::fmt::Debug for LeaseManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LeaseManager")
            .field("ttl", &self.ttl)
            .field("renewal_min", &self.renewal_min)
            .field("renewal_max", &self.renewal_max)
            .field("retry", &self.retry)
            .finish_non_exhaustive()
    }
}

impl LeaseManager {
    pub fn new(store: Arc<dyn LeaseStore>, clock: Arc<dyn Clock>, config: &QueueConfig) -> Self {
        Self {
            store,
            clock,
            ttl: config.lease.ttl(),
            renewal_min: Duration::from_millis(config.lease.renewal_min_ms),
            renewal_max: Duration::from_millis(config.lease.renewal_max_ms),
            retry: RetryPolicy::for_store(&config.store_retry),
            metrics: MetricsCollector::new(),
        }
    }

    /// Replaces the store retry policy.
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    pub fn store(&self) -> &Arc<dyn LeaseStore> {
        &self.store
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    /// Claims the head of `priority`'s ready queue for `worker_id`.
    ///
    /// Returns `None` if the queue stayed empty for `wait` (or immediately,
    /// without `wait`).
    pub async fn claim(
        &self,
        priority: &str,
        worker_id: &str,
        wait: Option<Duration>,
    ) -> Result<Option<Lease>, StoreError> {
        let lease = with_backoff(&self.retry, "claim", || {
            self.store
                .claim(priority, worker_id, self.clock.now_ms(), self.ttl, wait)
        })
        .await?;

        if let Some(lease) = &lease {
            self.metrics.record_claim(priority);
            debug!(
                worker_id = %worker_id,
                job_id = %lease.handle.job_id,
                priority = %priority,
                attempt = lease.job.attempt_count,
                "Claimed job"
            );
        }
        Ok(lease)
    }

    /// Extends the lease by one TTL if it is still ours and unexpired.
    pub async fn renew(&self, handle: &LeaseHandle) -> Result<RenewOutcome, StoreError> {
        with_backoff(&self.retry, "renew", || {
            self.store.renew(handle, self.clock.now_ms(), self.ttl)
        })
        .await
    }

    /// Finishes the lease with the handler's outcome.
    pub async fn complete(
        &self,
        handle: &LeaseHandle,
        outcome: &JobOutcome,
    ) -> Result<FinishOutcome, StoreError> {
        let finished = with_backoff(&self.retry, "complete", || {
            self.store.finish(handle, outcome, self.clock.now_ms())
        })
        .await?;

        if finished == FinishOutcome::NotOwner {
            warn!(
                worker_id = %handle.worker_id,
                job_id = %handle.job_id,
                "Lease lost before completion, outcome discarded"
            );
        }
        Ok(finished)
    }

    /// Returns the job to the head of its queue without consuming an attempt.
    pub async fn release(&self, handle: &LeaseHandle) -> Result<bool, StoreError> {
        with_backoff(&self.retry, "release", || {
            self.store.release(&handle.worker_id, Some(&handle.job_id))
        })
        .await
    }

    /// Releases whatever `worker_id` still holds, e.g. after a restart.
    pub async fn release_leftover(&self, worker_id: &str) -> Result<bool, StoreError> {
        with_backoff(&self.retry, "release", || self.store.release(worker_id, None)).await
    }

    /// Returns a lease this worker can no longer renew to the queue.
    ///
    /// Used after the heartbeat saw `Expired`: the worker's own registry entry
    /// is fresh, so the reaper would not look at it soon.
    pub async fn abandon(&self, handle: &LeaseHandle) -> Result<FinishOutcome, StoreError> {
        let outcome = with_backoff(&self.retry, "abandon", || {
            self.store.reclaim(&handle.worker_id, self.clock.now_ms(), 0)
        })
        .await?;
        self.metrics.record_reclaim(outcome.as_str());
        Ok(match outcome {
            crate::store::ReclaimOutcome::Requeued => FinishOutcome::Requeued,
            crate::store::ReclaimOutcome::Scheduled => FinishOutcome::Scheduled,
            crate::store::ReclaimOutcome::DeadLettered => FinishOutcome::DeadLettered,
            crate::store::ReclaimOutcome::NoLease | crate::store::ReclaimOutcome::Alive => {
                FinishOutcome::NotOwner
            }
        })
    }

    /// Picks the next renewal delay uniformly in `[renewal_min, renewal_max]`.
    pub fn renewal_interval(&self) -> Duration {
        let min = self.renewal_min.as_millis() as u64;
        let max = self.renewal_max.as_millis() as u64;
        if max <= min {
            return self.renewal_min;
        }
        Duration::from_millis(rand::rng().random_range(min..=max))
    }

    /// Starts renewing `lease` in the background until stopped or lost.
    pub fn start_heartbeat(&self, lease: &Lease) -> Heartbeat {
        let (stop_tx, mut stop_rx) = oneshot::channel::<()>();
        let (lost_tx, lost_rx) = watch::channel(None);
        let manager = self.clone();
        let handle = lease.handle.clone();
        let mut expires_at_ms = lease.expires_at_ms;

        let task = tokio::spawn(async move {
            loop {
                let interval = manager.renewal_interval();
                tokio::select! {
                    _ = &mut stop_rx => return None,
                    _ = tokio::time::sleep(interval) => {}
                }

                let loss = match manager.renew(&handle).await {
                    Ok(RenewOutcome::Renewed { expires_at_ms: next }) => {
                        manager.metrics.record_renewal("renewed");
                        expires_at_ms = next;
                        continue;
                    }
                    Ok(RenewOutcome::NotOwner) => {
                        manager.metrics.record_renewal("not_owner");
                        LeaseLoss::NotOwner
                    }
                    Ok(RenewOutcome::Expired) => {
                        manager.metrics.record_renewal("expired");
                        LeaseLoss::Expired
                    }
                    Err(e) => {
                        manager.metrics.record_renewal("error");
                        warn!(
                            worker_id = %handle.worker_id,
                            job_id = %handle.job_id,
                            error = %e,
                            "Lease renewal failed"
                        );
                        if manager.clock.now_ms() < expires_at_ms {
                            continue;
                        }
                        LeaseLoss::Unreachable
                    }
                };

                warn!(
                    worker_id = %handle.worker_id,
                    job_id = %handle.job_id,
                    reason = loss.as_str(),
                    "Lease lost"
                );
                let _ = lost_tx.send(Some(loss));
                return Some(loss);
            }
        });

        Heartbeat {
            stop_tx,
            lost_rx,
            task,
        }
    }
}

/// Handle to a running heartbeat task.
#[derive(Debug)]
pub struct Heartbeat {
    stop_tx: oneshot::Sender<()>,
    lost_rx: watch::Receiver<Option<LeaseLoss>>,
    task: JoinHandle<Option<LeaseLoss>>,
}

impl Heartbeat {
    /// Resolves when the lease is lost. Never resolves otherwise.
    pub async fn lost(&mut self) -> LeaseLoss {
        loop {
            if let Some(loss) = *self.lost_rx.borrow_and_update() {
                return loss;
            }
            if self.lost_rx.changed().await.is_err() {
                std::future::pending::<()>().await;
            }
        }
    }

    /// Stops renewing and reports whether the lease had been lost.
    pub async fn stop(self) -> Option<LeaseLoss> {
        let _ = self.stop_tx.send(());
        match self.task.await {
            Ok(loss) => loss,
            Err(e) => {
                warn!(error = %e, "Heartbeat task failed");
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::scheduler::job::Job;
    use crate::store::MemoryLeaseStore;

    fn setup() -> (Arc<MemoryLeaseStore>, Arc<ManualClock>, LeaseManager) {
        let store = Arc::new(MemoryLeaseStore::new());
        let clock = Arc::new(ManualClock::starting_now());
        let config = QueueConfig::default().with_lease_timing(
            Duration::from_millis(200),
            Duration::from_millis(10),
            Duration::from_millis(20),
        );
        let manager = LeaseManager::new(store.clone(), clock.clone(), &config);
        (store, clock, manager)
    }

    #[test]
    fn test_renewal_interval_within_bounds() {
        let (_, _, manager) = setup();
        for _ in 0..100 {
            let interval = manager.renewal_interval();
            assert!(interval >= Duration::from_millis(10));
            assert!(interval <= Duration::from_millis(20));
        }
    }

    #[tokio::test]
    async fn test_claim_renew_complete() {
        let (store, _clock, manager) = setup();
        store
            .push_ready(&Job::new("high", "p").with_id("j1"))
            .await
            .expect("push");

        let lease = manager
            .claim("high", "w1", None)
            .await
            .expect("claim")
            .expect("job ready");
        assert_eq!(lease.handle.job_id, "j1");

        let renewed = manager.renew(&lease.handle).await.expect("renew");
        assert!(matches!(renewed, RenewOutcome::Renewed { .. }));

        let finished = manager
            .complete(&lease.handle, &JobOutcome::Success)
            .await
            .expect("complete");
        assert_eq!(finished, FinishOutcome::Completed);
        assert!(store.processing_record("w1").await.expect("record").is_none());
    }

    #[tokio::test]
    async fn test_heartbeat_keeps_lease_alive() {
        let (store, clock, manager) = setup();
        store
            .push_ready(&Job::new("high", "p").with_id("j1"))
            .await
            .expect("push");
        let lease = manager
            .claim("high", "w1", None)
            .await
            .expect("claim")
            .expect("job ready");

        let heartbeat = manager.start_heartbeat(&lease);
        tokio::time::sleep(Duration::from_millis(60)).await;
        clock.advance(Duration::from_millis(150));
        tokio::time::sleep(Duration::from_millis(60)).await;

        assert_eq!(heartbeat.stop().await, None);
        let record = store
            .processing_record("w1")
            .await
            .expect("record")
            .expect("still held");
        assert!(record.lease_expiry_ms > lease.expires_at_ms);
    }

    #[tokio::test]
    async fn test_heartbeat_reports_reclaimed_lease() {
        let (store, clock, manager) = setup();
        store
            .push_ready(&Job::new("high", "p").with_id("j1"))
            .await
            .expect("push");
        let lease = manager
            .claim("high", "w1", None)
            .await
            .expect("claim")
            .expect("job ready");

        let mut heartbeat = manager.start_heartbeat(&lease);
        // Jump past expiry and let the reaper take the job first.
        clock.advance(Duration::from_millis(500));
        let outcome = store
            .reclaim("w1", clock.now_ms(), clock.now_ms())
            .await
            .expect("reclaim");
        assert!(outcome.reclaimed());

        let loss = tokio::time::timeout(Duration::from_secs(2), heartbeat.lost())
            .await
            .expect("loss reported");
        assert_eq!(loss, LeaseLoss::NotOwner);
        assert_eq!(heartbeat.stop().await, Some(LeaseLoss::NotOwner));
    }

    #[tokio::test]
    async fn test_heartbeat_reports_expiry_and_abandon_requeues() {
        let (store, clock, manager) = setup();
        store
            .push_ready(&Job::new("high", "p").with_id("j1"))
            .await
            .expect("push");
        let lease = manager
            .claim("high", "w1", None)
            .await
            .expect("claim")
            .expect("job ready");

        let mut heartbeat = manager.start_heartbeat(&lease);
        clock.advance(Duration::from_millis(500));
        let loss = tokio::time::timeout(Duration::from_secs(2), heartbeat.lost())
            .await
            .expect("loss reported");
        assert_eq!(loss, LeaseLoss::Expired);
        heartbeat.stop().await;

        let outcome = manager.abandon(&lease.handle).await.expect("abandon");
        assert_eq!(outcome, FinishOutcome::Requeued);
        let ready = store.peek_ready("high", 10).await.expect("peek");
        assert_eq!(ready.len(), 1);
        assert_eq!(ready[0].attempt_count, 1);
    }
}

//! Worker pool for processing jobs from the lease store.
//!
//! Each worker runs as an independent async task with its own registry entry,
//! fairness state and circuit breaker. A worker's fetch loop:
//!
//! 1. claims the next job through the [`FairnessScheduler`]
//! 2. starts a lease heartbeat
//! 3. passes the job through the [`IdempotencyGate`]
//! 4. runs the handler, watching for lease loss and shutdown
//! 5. stops the heartbeat and completes the lease with the outcome
//!
//! The pool also runs the [`Reaper`] and [`ScheduledMover`] background loops
//! when enabled. Shutdown is a broadcast: idle workers stop at their next
//! loop turn, busy workers get a grace period before their job is released.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::breaker::CircuitBreaker;
use super::fairness::FairnessScheduler;
use super::idempotency::{CompletionGuard, GateDecision, IdempotencyGate};
use super::job::Job;
use super::lease::{LeaseLoss, LeaseManager};
use super::mover::ScheduledMover;
use super::reaper::Reaper;
use super::registry::{generate_worker_id, WorkerRegistry};
use super::retry::RetryPolicy;
use crate::clock::{Clock, SystemClock};
use crate::config::QueueConfig;
use crate::error::{ConfigError, StoreError};
use crate::metrics::MetricsCollector;
use crate::store::{
    FinishOutcome, IdempotencyState, JobOutcome, KeySpace, Lease, LeaseHandle, LeaseStore,
    RedisLeaseStore,
};

/// Error recorded when a duplicate delivery finds the first one still running.
pub const DUPLICATE_IN_PROGRESS_ERROR: &str = "duplicate delivery while in progress";

/// Application code run for each claimed job.
///
/// Side effects belong inside `handle`: the pool opens the idempotency record
/// before calling it and closes it after it returns.
#[async_trait]
pub trait JobHandler: Send + Sync {
    async fn handle(&self, job: &Job) -> anyhow::Result<()>;
}

/// Errors that can occur in the worker pool.
#[derive(Debug, Error)]
pub enum PoolError {
    /// Failed to reach the backing store.
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    /// The configuration was rejected.
    #[error("Invalid configuration: {0}")]
    Config(#[from] ConfigError),

    /// Pool is already running.
    #[error("Pool is already running")]
    AlreadyRunning,

    /// Pool is not running.
    #[error("Pool is not running")]
    NotRunning,

    /// Shutdown timed out.
    #[error("Shutdown timed out after {0:?}")]
    ShutdownTimeout(Duration),
}

/// Lifecycle settings of the pool.
#[derive(Debug, Clone)]
pub struct WorkerPoolConfig {
    /// Number of worker tasks to spawn.
    pub num_workers: usize,
    /// How long `shutdown` waits for every task to stop.
    pub shutdown_timeout: Duration,
    /// Run a reaper loop in this process.
    pub run_reaper: bool,
    /// Run a scheduled mover loop in this process.
    pub run_mover: bool,
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        Self::from_queue_config(&QueueConfig::default())
    }
}

impl WorkerPoolConfig {
    /// Derives pool settings from the queue configuration.
    pub fn from_queue_config(config: &QueueConfig) -> Self {
        Self {
            num_workers: config.worker.count,
            shutdown_timeout: Duration::from_millis(config.worker.shutdown_grace_ms)
                + config.lease.claim_timeout()
                + Duration::from_secs(5),
            run_reaper: config.reaper.enabled,
            run_mover: config.mover.enabled,
        }
    }

    /// Sets the number of workers.
    pub fn with_num_workers(mut self, num_workers: usize) -> Self {
        self.num_workers = num_workers;
        self
    }

    /// Sets the shutdown timeout.
    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }

    /// Enables or disables the reaper loop.
    pub fn with_reaper(mut self, enabled: bool) -> Self {
        self.run_reaper = enabled;
        self
    }

    /// Enables or disables the scheduled mover loop.
    pub fn with_mover(mut self, enabled: bool) -> Self {
        self.run_mover = enabled;
        self
    }
}

/// Statistics about the worker pool.
#[derive(Debug, Clone, Default)]
pub struct PoolStats {
    /// Total number of workers in the pool.
    pub num_workers: usize,
    /// Number of workers currently processing jobs.
    pub active_workers: usize,
    /// Jobs whose handler succeeded.
    pub jobs_completed: u64,
    /// Jobs whose handler failed or panicked.
    pub jobs_failed: u64,
    /// Deliveries skipped by the idempotency gate.
    pub jobs_duplicate: u64,
    /// Jobs abandoned because the lease was lost mid-run.
    pub leases_lost: u64,
    /// Average handler duration.
    pub average_job_duration: Duration,
}

impl PoolStats {
    /// Returns the total number of handler runs (completed + failed).
    pub fn total_processed(&self) -> u64 {
        self.jobs_completed + self.jobs_failed
    }

    /// Returns the success rate as a percentage.
    pub fn success_rate(&self) -> f64 {
        let total = self.total_processed();
        if total == 0 {
            return 0.0;
        }
        (self.jobs_completed as f64 / total as f64) * 100.0
    }
}

/// Shared state for tracking pool statistics.
#[derive(Debug, Default)]
struct SharedPoolStats {
    jobs_completed: AtomicU64,
    jobs_failed: AtomicU64,
    jobs_duplicate: AtomicU64,
    leases_lost: AtomicU64,
    total_duration_ms: AtomicU64,
    active_workers: AtomicU64,
}

impl SharedPoolStats {
    fn new() -> Self {
        Self::default()
    }

    fn record_completion(&self, duration: Duration) {
        self.jobs_completed.fetch_add(1, Ordering::SeqCst);
        self.total_duration_ms
            .fetch_add(duration.as_millis() as u64, Ordering::SeqCst);
    }

    fn record_failure(&self, duration: Duration) {
        self.jobs_failed.fetch_add(1, Ordering::SeqCst);
        self.total_duration_ms
            .fetch_add(duration.as_millis() as u64, Ordering::SeqCst);
    }

    fn record_duplicate(&self) {
        self.jobs_duplicate.fetch_add(1, Ordering::SeqCst);
    }

    fn record_lost(&self) {
        self.leases_lost.fetch_add(1, Ordering::SeqCst);
    }

    fn increment_active(&self) {
        self.active_workers.fetch_add(1, Ordering::SeqCst);
    }

    fn decrement_active(&self) {
        self.active_workers.fetch_sub(1, Ordering::SeqCst);
    }

    fn to_pool_stats(&self, num_workers: usize) -> PoolStats {
        let completed = self.jobs_completed.load(Ordering::SeqCst);
        let failed = self.jobs_failed.load(Ordering::SeqCst);
        let total_duration_ms = self.total_duration_ms.load(Ordering::SeqCst);
        let active = self.active_workers.load(Ordering::SeqCst);

        let total_jobs = completed + failed;
        let average_duration = if total_jobs > 0 {
            Duration::from_millis(total_duration_ms / total_jobs)
        } else {
            Duration::ZERO
        };

        PoolStats {
            num_workers,
            active_workers: active as usize,
            jobs_completed: completed,
            jobs_failed: failed,
            jobs_duplicate: self.jobs_duplicate.load(Ordering::SeqCst),
            leases_lost: self.leases_lost.load(Ordering::SeqCst),
            average_job_duration: average_duration,
        }
    }
}

/// Worker pool that runs fetch loops and background loops against one store.
pub struct WorkerPool {
    config: WorkerPoolConfig,
    queue_config: QueueConfig,
    store: Arc<dyn LeaseStore>,
    clock: Arc<dyn Clock>,
    handler: Arc<dyn JobHandler>,
    shutdown_tx: broadcast::Sender<()>,
    worker_handles: Vec<JoinHandle<()>>,
    worker_ids: Vec<String>,
    stats: Arc<SharedPoolStats>,
    is_running: AtomicBool,
}

impl WorkerPool {
    /// Creates a worker pool over an existing store.
    ///
    /// # Errors
    ///
    /// Returns `PoolError::Config` if the configuration fails validation.
    pub fn new(
        queue_config: QueueConfig,
        store: Arc<dyn LeaseStore>,
        clock: Arc<dyn Clock>,
        handler: Arc<dyn JobHandler>,
    ) -> Result<Self, PoolError> {
        queue_config.validate()?;
        let config = WorkerPoolConfig::from_queue_config(&queue_config);

        // Buffer size of 1 is sufficient since we only send once
        let (shutdown_tx, _) = broadcast::channel(1);

        Ok(Self {
            config,
            queue_config,
            store,
            clock,
            handler,
            shutdown_tx,
            worker_handles: Vec::new(),
            worker_ids: Vec::new(),
            stats: Arc::new(SharedPoolStats::new()),
            is_running: AtomicBool::new(false),
        })
    }

    /// Connects to Redis and creates a pool using the system clock.
    ///
    /// # Errors
    ///
    /// Returns `PoolError` if validation or the connection fails.
    pub async fn connect(
        queue_config: QueueConfig,
        handler: Arc<dyn JobHandler>,
    ) -> Result<Self, PoolError> {
        queue_config.validate()?;
        let keys = KeySpace::new(&queue_config.namespace, &queue_config.idempotency_namespace);
        let store = RedisLeaseStore::connect(&queue_config.redis_url, keys).await?;
        Self::new(queue_config, Arc::new(store), Arc::new(SystemClock), handler)
    }

    /// Starts all workers and the enabled background loops.
    ///
    /// # Errors
    ///
    /// Returns `PoolError::AlreadyRunning` if the pool is already running.
    pub async fn start(&mut self) -> Result<(), PoolError> {
        if self.is_running.load(Ordering::SeqCst) {
            return Err(PoolError::AlreadyRunning);
        }

        let leases = LeaseManager::new(
            Arc::clone(&self.store),
            Arc::clone(&self.clock),
            &self.queue_config,
        );
        let registry = WorkerRegistry::new(Arc::clone(&self.store), Arc::clone(&self.clock));
        let gate = IdempotencyGate::new(
            Arc::clone(&self.store),
            Arc::clone(&self.clock),
            &self.queue_config.idempotency,
        );
        let fairness = FairnessScheduler::new(&self.queue_config.priorities)?;

        self.worker_ids.clear();
        for i in 0..self.config.num_workers {
            let id = generate_worker_id(i);
            let worker = Worker {
                id: id.clone(),
                leases: leases.clone(),
                registry: registry.clone(),
                gate: gate.clone(),
                fairness: fairness.clone(),
                breaker: CircuitBreaker::from_config(&self.queue_config.breaker),
                handler: Arc::clone(&self.handler),
                job_backoff: RetryPolicy::for_jobs(&self.queue_config.worker),
                claim_timeout: self.queue_config.lease.claim_timeout(),
                registry_interval: Duration::from_millis(self.queue_config.lease.renewal_min_ms),
                shutdown_grace: Duration::from_millis(self.queue_config.worker.shutdown_grace_ms),
                breaker_pause: Duration::from_millis(self.queue_config.breaker.pause_ms),
                shutdown_rx: self.shutdown_tx.subscribe(),
                stats: Arc::clone(&self.stats),
                metrics: MetricsCollector::new(),
            };

            self.worker_handles.push(tokio::spawn(worker.run()));
            self.worker_ids.push(id);
        }

        if self.config.run_reaper {
            let reaper = Reaper::new(
                Arc::clone(&self.store),
                Arc::clone(&self.clock),
                &self.queue_config.reaper,
            )
            .with_retry(RetryPolicy::for_store(&self.queue_config.store_retry));
            self.worker_handles
                .push(tokio::spawn(reaper.run(self.shutdown_tx.subscribe())));
        }
        if self.config.run_mover {
            let mover = ScheduledMover::new(
                Arc::clone(&self.store),
                Arc::clone(&self.clock),
                &self.queue_config,
            );
            self.worker_handles
                .push(tokio::spawn(mover.run(self.shutdown_tx.subscribe())));
        }

        self.is_running.store(true, Ordering::SeqCst);
        info!(
            num_workers = self.config.num_workers,
            reaper = self.config.run_reaper,
            mover = self.config.run_mover,
            "Worker pool started"
        );

        Ok(())
    }

    /// Gracefully shuts down all workers and background loops.
    ///
    /// # Errors
    ///
    /// Returns `PoolError::ShutdownTimeout` if tasks don't stop within the
    /// configured timeout.
    pub async fn shutdown(&mut self) -> Result<(), PoolError> {
        if !self.is_running.load(Ordering::SeqCst) {
            return Err(PoolError::NotRunning);
        }

        info!("Initiating worker pool shutdown");

        // Ignore send error - workers may have already stopped
        let _ = self.shutdown_tx.send(());

        let shutdown_future = async {
            for handle in self.worker_handles.drain(..) {
                if let Err(e) = handle.await {
                    error!(error = %e, "Worker task panicked during shutdown");
                }
            }
        };

        let result = tokio::time::timeout(self.config.shutdown_timeout, shutdown_future).await;
        self.is_running.store(false, Ordering::SeqCst);
        match result {
            Ok(()) => {
                info!("Worker pool shutdown complete");
                Ok(())
            }
            Err(_) => Err(PoolError::ShutdownTimeout(self.config.shutdown_timeout)),
        }
    }

    /// Returns current pool statistics.
    pub fn stats(&self) -> PoolStats {
        self.stats.to_pool_stats(self.config.num_workers)
    }

    /// Returns whether the pool is currently running.
    pub fn is_running(&self) -> bool {
        self.is_running.load(Ordering::SeqCst)
    }

    /// Returns the number of workers in the pool.
    pub fn num_workers(&self) -> usize {
        self.config.num_workers
    }

    /// Ids of the workers started by the last `start`.
    pub fn worker_ids(&self) -> &[String] {
        &self.worker_ids
    }

    pub fn store(&self) -> &Arc<dyn LeaseStore> {
        &self.store
    }
}

/// Whether the fetch loop should keep going after a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Next {
    Continue,
    Stop,
}

/// How the handler run ended.
enum RunEnd {
    Finished(anyhow::Result<()>),
    Panicked(String),
    Lost(LeaseLoss),
    /// Shutdown arrived and the grace period ran out.
    Interrupted,
}

/// A single fetch loop.
struct Worker {
    id: String,
    leases: LeaseManager,
    registry: WorkerRegistry,
    gate: IdempotencyGate,
    fairness: FairnessScheduler,
    breaker: CircuitBreaker,
    handler: Arc<dyn JobHandler>,
    job_backoff: RetryPolicy,
    claim_timeout: Duration,
    registry_interval: Duration,
    shutdown_grace: Duration,
    breaker_pause: Duration,
    shutdown_rx: broadcast::Receiver<()>,
    stats: Arc<SharedPoolStats>,
    metrics: MetricsCollector,
}

impl Worker {
    /// Main worker loop.
    async fn run(mut self) {
        info!(worker_id = %self.id, "Worker started");

        if let Err(e) = self.registry.register(&self.id).await {
            warn!(worker_id = %self.id, error = %e, "Failed to register worker");
        }
        self.recover_leftover().await;

        // Whether this worker may still hold a processing record it could not
        // hand back. Such a worker stays registered so the reaper finds it.
        let mut holding = false;
        let mut last_touch = Instant::now();

        loop {
            match self.shutdown_rx.try_recv() {
                Ok(()) | Err(broadcast::error::TryRecvError::Closed) => {
                    info!(worker_id = %self.id, "Worker received shutdown signal");
                    break;
                }
                Err(broadcast::error::TryRecvError::Lagged(_)) => continue,
                Err(broadcast::error::TryRecvError::Empty) => {}
            }

            if last_touch.elapsed() >= self.registry_interval {
                if let Err(e) = self.registry.heartbeat(&self.id).await {
                    warn!(worker_id = %self.id, error = %e, "Registry heartbeat failed");
                }
                last_touch = Instant::now();
            }

            if !self.breaker.allow() {
                tokio::select! {
                    _ = self.shutdown_rx.recv() => break,
                    _ = tokio::time::sleep(self.breaker_pause) => continue,
                }
            }

            match self
                .fairness
                .claim_next(&self.leases, &self.id, self.claim_timeout)
                .await
            {
                Ok(Some(lease)) => {
                    last_touch = Instant::now();
                    let (next, held) = self.process(lease).await;
                    holding = held;
                    if next == Next::Stop {
                        break;
                    }
                }
                Ok(None) => {
                    self.breaker.cancel();
                    debug!(worker_id = %self.id, "No jobs available");
                }
                Err(StoreError::LeaseHeld(_)) => {
                    self.breaker.cancel();
                    warn!(worker_id = %self.id, "Worker still holds a lease, releasing it");
                    self.recover_leftover().await;
                }
                Err(e) => {
                    self.breaker.cancel();
                    error!(worker_id = %self.id, error = %e, "Failed to claim job");
                    tokio::select! {
                        _ = self.shutdown_rx.recv() => break,
                        _ = tokio::time::sleep(self.claim_timeout) => {}
                    }
                }
            }
        }

        if holding {
            warn!(worker_id = %self.id, "Leaving registry entry for the reaper");
        } else if let Err(e) = self.registry.deregister(&self.id).await {
            warn!(worker_id = %self.id, error = %e, "Failed to deregister worker");
        }
        info!(worker_id = %self.id, "Worker stopped");
    }

    /// Hands back a job left under this worker's id by an earlier run.
    async fn recover_leftover(&self) {
        match self.leases.release_leftover(&self.id).await {
            Ok(true) => info!(worker_id = %self.id, "Released job left by a previous run"),
            Ok(false) => {}
            Err(e) => warn!(worker_id = %self.id, error = %e, "Failed to release leftover job"),
        }
    }

    /// Processes one claimed job. Returns whether to keep fetching and
    /// whether a processing record may still be held.
    async fn process(&mut self, lease: Lease) -> (Next, bool) {
        let job = lease.job.clone();
        let handle = lease.handle.clone();

        info!(
            worker_id = %self.id,
            job_id = %job.id,
            priority = %job.priority,
            attempt = job.attempt_count + 1,
            "Processing job"
        );

        let mut heartbeat = self.leases.start_heartbeat(&lease);

        let guard = match self.gate.begin(&job.id).await {
            Ok(GateDecision::Fresh(guard)) => guard,
            Ok(GateDecision::Duplicate(state)) => {
                heartbeat.stop().await;
                self.stats.record_duplicate();
                self.breaker.cancel();
                return (Next::Continue, self.finish_duplicate(&handle, state).await);
            }
            Err(e) => {
                heartbeat.stop().await;
                self.breaker.cancel();
                warn!(worker_id = %self.id, job_id = %job.id, error = %e, "Idempotency check failed");
                return (Next::Continue, self.release(&handle).await);
            }
        };

        self.stats.increment_active();
        self.metrics.inc_active_workers();
        let started = Instant::now();

        let handler = Arc::clone(&self.handler);
        let handler_job = job.clone();
        let mut task = tokio::spawn(async move { handler.handle(&handler_job).await });

        let mut next = Next::Continue;
        let first = tokio::select! {
            res = &mut task => Some(join_result(res)),
            loss = heartbeat.lost() => Some(RunEnd::Lost(loss)),
            _ = self.shutdown_rx.recv() => None,
        };
        let end = match first {
            Some(end) => end,
            None => {
                next = Next::Stop;
                info!(
                    worker_id = %self.id,
                    job_id = %job.id,
                    grace_ms = self.shutdown_grace.as_millis() as u64,
                    "Shutdown requested, waiting for running job"
                );
                match tokio::time::timeout(self.shutdown_grace, &mut task).await {
                    Ok(res) => join_result(res),
                    Err(_) => RunEnd::Interrupted,
                }
            }
        };

        let duration = started.elapsed();
        self.stats.decrement_active();
        self.metrics.dec_active_workers();

        let held = match end {
            RunEnd::Finished(Ok(())) => {
                heartbeat.stop().await;
                self.finish_success(&job, &handle, guard, duration).await
            }
            RunEnd::Finished(Err(e)) => {
                heartbeat.stop().await;
                self.finish_failure(&job, &handle, guard, format!("{e:#}"), duration)
                    .await
            }
            RunEnd::Panicked(message) => {
                heartbeat.stop().await;
                self.finish_failure(&job, &handle, guard, message, duration)
                    .await
            }
            RunEnd::Lost(loss) => {
                task.abort();
                heartbeat.stop().await;
                // No result to judge the job by; a half-open probe goes back.
                self.breaker.cancel();
                self.stats.record_lost();
                self.handle_loss(&handle, guard, loss).await
            }
            RunEnd::Interrupted => {
                task.abort();
                heartbeat.stop().await;
                self.breaker.cancel();
                warn!(
                    worker_id = %self.id,
                    job_id = %job.id,
                    "Job did not finish within the shutdown grace period, releasing it"
                );
                abandon_guard(guard, &job.id).await;
                self.release(&handle).await
            }
        };

        (next, held)
    }

    async fn finish_success(
        &self,
        job: &Job,
        handle: &LeaseHandle,
        guard: CompletionGuard,
        duration: Duration,
    ) -> bool {
        // Side effects happened; the record is done whatever the lease says.
        if let Err(e) = guard.complete().await {
            warn!(job_id = %job.id, error = %e, "Failed to mark idempotency record done");
        }
        self.stats.record_completion(duration);
        self.breaker.record(true);

        match self.leases.complete(handle, &JobOutcome::Success).await {
            Ok(outcome) => {
                self.metrics
                    .record_finish(outcome.as_str(), Some(duration.as_secs_f64()));
                info!(
                    worker_id = %self.id,
                    job_id = %job.id,
                    outcome = outcome.as_str(),
                    duration_ms = duration.as_millis() as u64,
                    "Job completed"
                );
                false
            }
            Err(e) => {
                error!(worker_id = %self.id, job_id = %job.id, error = %e, "Failed to complete job");
                true
            }
        }
    }

    async fn finish_failure(
        &self,
        job: &Job,
        handle: &LeaseHandle,
        guard: CompletionGuard,
        error: String,
        duration: Duration,
    ) -> bool {
        abandon_guard(guard, &job.id).await;
        self.stats.record_failure(duration);
        self.breaker.record(false);

        let backoff = self.job_backoff.delay_for(job.attempt_count + 1);
        let outcome = JobOutcome::Failure {
            error: error.clone(),
            backoff,
        };
        match self.leases.complete(handle, &outcome).await {
            Ok(finished) => {
                self.metrics
                    .record_finish(finished.as_str(), Some(duration.as_secs_f64()));
                if finished == FinishOutcome::DeadLettered {
                    error!(
                        worker_id = %self.id,
                        job_id = %job.id,
                        attempts = job.attempt_count + 1,
                        error = %error,
                        "Job failed, moved to dead letter queue"
                    );
                } else {
                    warn!(
                        worker_id = %self.id,
                        job_id = %job.id,
                        outcome = finished.as_str(),
                        backoff_ms = backoff.as_millis() as u64,
                        remaining_attempts = job.remaining_attempts().saturating_sub(1),
                        error = %error,
                        "Job failed"
                    );
                }
                false
            }
            Err(e) => {
                error!(worker_id = %self.id, job_id = %job.id, error = %e, "Failed to record job failure");
                true
            }
        }
    }

    /// Settles a delivery the idempotency gate refused to run.
    async fn finish_duplicate(&self, handle: &LeaseHandle, state: IdempotencyState) -> bool {
        let outcome = match state {
            IdempotencyState::Done => JobOutcome::Success,
            // The first delivery may still be running or may have died; try
            // again once its record has had time to expire.
            IdempotencyState::InProgress => JobOutcome::Failure {
                error: DUPLICATE_IN_PROGRESS_ERROR.to_string(),
                backoff: self.gate.ttl(),
            },
        };
        match self.leases.complete(handle, &outcome).await {
            Ok(finished) => {
                self.metrics.record_finish(finished.as_str(), None);
                info!(
                    worker_id = %self.id,
                    job_id = %handle.job_id,
                    state = state.as_str(),
                    outcome = finished.as_str(),
                    "Skipped duplicate delivery"
                );
                false
            }
            Err(e) => {
                error!(worker_id = %self.id, job_id = %handle.job_id, error = %e, "Failed to settle duplicate");
                true
            }
        }
    }

    async fn handle_loss(
        &self,
        handle: &LeaseHandle,
        guard: CompletionGuard,
        loss: LeaseLoss,
    ) -> bool {
        abandon_guard(guard, &handle.job_id).await;
        match loss {
            // Someone else owns the job now.
            LeaseLoss::NotOwner => false,
            LeaseLoss::Expired | LeaseLoss::Unreachable => {
                match self.leases.abandon(handle).await {
                    Ok(outcome) => {
                        self.metrics.record_finish(outcome.as_str(), None);
                        info!(
                            worker_id = %self.id,
                            job_id = %handle.job_id,
                            outcome = outcome.as_str(),
                            "Returned job after lease loss"
                        );
                        false
                    }
                    Err(e) => {
                        warn!(worker_id = %self.id, job_id = %handle.job_id, error = %e, "Failed to return job after lease loss");
                        true
                    }
                }
            }
        }
    }

    /// Returns the job without consuming an attempt. Returns whether a
    /// record may still be held.
    async fn release(&self, handle: &LeaseHandle) -> bool {
        match self.leases.release(handle).await {
            Ok(_) => false,
            Err(e) => {
                error!(worker_id = %self.id, job_id = %handle.job_id, error = %e, "Failed to release job");
                true
            }
        }
    }
}

fn join_result(res: Result<anyhow::Result<()>, tokio::task::JoinError>) -> RunEnd {
    match res {
        Ok(result) => RunEnd::Finished(result),
        Err(e) if e.is_panic() => RunEnd::Panicked(format!("handler panicked: {e}")),
        Err(e) => RunEnd::Panicked(format!("handler task failed: {e}")),
    }
}

async fn abandon_guard(guard: CompletionGuard, job_id: &str) {
    if let Err(e) = guard.abandon().await {
        warn!(job_id = %job_id, error = %e, "Failed to release idempotency record");
    }
}

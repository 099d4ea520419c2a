//! Producer and operator surface of the queue.
//!
//! `JobQueue` is what a producer holds: it routes new jobs to the ready queue
//! or the scheduled set, and exposes the depth, age and dead-letter views an
//! operator needs. It never claims; claiming belongs to the worker pool.
//!
//! # Queue Structure
//!
//! Per priority `p`, in the queue namespace:
//!
//! - `ready:{p}`: FIFO list of jobs ready to run
//! - `sched:{p}`: sorted set of delayed jobs, scored by ready time
//!
//! Plus `dlq` for jobs that exhausted their retry budget. See
//! [`crate::store::KeySpace`] for the full layout.

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tracing::{debug, info};

use super::job::{DeadLetterEntry, Job};
use super::registry::WorkerRegistry;
use crate::clock::{Clock, SystemClock};
use crate::config::QueueConfig;
use crate::error::StoreError;
use crate::metrics::MetricsCollector;
use crate::store::{KeySpace, LeaseStore, RedisLeaseStore};

/// Errors that can occur during queue operations.
#[derive(Debug, Error)]
pub enum QueueError {
    /// The backing store failed.
    #[error("Store operation failed: {0}")]
    Store(#[from] StoreError),

    /// The job names a priority that is not configured.
    #[error("Unknown priority '{0}'")]
    UnknownPriority(String),
}

/// Where an enqueued job was placed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueRoute {
    Ready,
    Scheduled,
}

impl EnqueueRoute {
    pub fn as_str(&self) -> &'static str {
        match self {
            EnqueueRoute::Ready => "ready",
            EnqueueRoute::Scheduled => "scheduled",
        }
    }
}

/// Depths of one priority.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PriorityStats {
    pub name: String,
    pub ready: usize,
    pub scheduled: usize,
    /// How long the next job to be claimed has been ready.
    pub oldest_age: Option<Duration>,
}

/// Snapshot of the whole queue.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueueStats {
    pub priorities: Vec<PriorityStats>,
    pub dead_letter: usize,
    /// Registry entries seen within the liveness timeout.
    pub live_workers: usize,
}

impl QueueStats {
    pub fn total_ready(&self) -> usize {
        self.priorities.iter().map(|p| p.ready).sum()
    }

    pub fn total_scheduled(&self) -> usize {
        self.priorities.iter().map(|p| p.scheduled).sum()
    }
}

/// Producer-side handle to the queue.
#[derive(Clone)]
pub struct JobQueue {
    store: Arc<dyn LeaseStore>,
    clock: Arc<dyn Clock>,
    registry: WorkerRegistry,
    priorities: Vec<String>,
    default_max_attempts: u32,
    liveness_timeout: Duration,
    metrics: MetricsCollector,
}

impl std::fmt::Debug for JobQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobQueue")
            .field("priorities", &self.priorities)
            .field("default_max_attempts", &self.default_max_attempts)
            .finish_non_exhaustive()
    }
}

impl JobQueue {
    /// Creates a queue over an existing store.
    pub fn new(store: Arc<dyn LeaseStore>, clock: Arc<dyn Clock>, config: &QueueConfig) -> Self {
        Self {
            registry: WorkerRegistry::new(Arc::clone(&store), Arc::clone(&clock)),
            store,
            clock,
            priorities: config.priority_names(),
            default_max_attempts: config.worker.max_attempts,
            liveness_timeout: Duration::from_millis(config.reaper.liveness_timeout_ms),
            metrics: MetricsCollector::new(),
        }
    }

    /// Connects to Redis and creates a queue using the system clock.
    ///
    /// # Errors
    ///
    /// Returns `QueueError::Store` if the connection fails.
    pub async fn connect(config: &QueueConfig) -> Result<Self, QueueError> {
        let keys = KeySpace::new(&config.namespace, &config.idempotency_namespace);
        let store = RedisLeaseStore::connect(&config.redis_url, keys).await?;
        Ok(Self::new(Arc::new(store), Arc::new(SystemClock), config))
    }

    pub fn store(&self) -> &Arc<dyn LeaseStore> {
        &self.store
    }

    pub fn priorities(&self) -> &[String] {
        &self.priorities
    }

    /// Builds a job with the configured retry budget.
    pub fn job(&self, priority: impl Into<String>, payload: impl Into<String>) -> Job {
        Job::new(priority, payload).with_max_attempts(self.default_max_attempts)
    }

    /// Enqueues a job.
    ///
    /// A job whose ready time is in the future goes to the scheduled set and
    /// is promoted by the mover; anything else is appended to the ready queue.
    pub async fn enqueue(&self, job: Job) -> Result<EnqueueRoute, QueueError> {
        self.check_priority(&job.priority)?;
        let route = if job.ready_time_ms() > self.clock.now_ms() {
            self.store.schedule(&job, job.ready_time_ms()).await?;
            EnqueueRoute::Scheduled
        } else {
            self.store.push_ready(&job).await?;
            EnqueueRoute::Ready
        };
        self.metrics.record_enqueue(&job.priority, route.as_str());
        debug!(
            job_id = %job.id,
            priority = %job.priority,
            route = route.as_str(),
            "Enqueued job"
        );
        Ok(route)
    }

    /// Enqueues a job to become ready after `delay`.
    pub async fn enqueue_in(&self, job: Job, delay: Duration) -> Result<EnqueueRoute, QueueError> {
        let job = job.with_enqueue_time(self.clock.now()).delayed_by(delay);
        self.enqueue(job).await
    }

    /// Enqueues several jobs.
    ///
    /// Every priority is checked before anything is written. Ready jobs are
    /// pushed in one store call, preserving their order.
    pub async fn enqueue_batch(&self, jobs: Vec<Job>) -> Result<usize, QueueError> {
        if jobs.is_empty() {
            return Ok(0);
        }
        for job in &jobs {
            self.check_priority(&job.priority)?;
        }

        let now = self.clock.now_ms();
        let (delayed, ready): (Vec<Job>, Vec<Job>) =
            jobs.into_iter().partition(|j| j.ready_time_ms() > now);

        self.store.push_ready_many(&ready).await?;
        for job in &ready {
            self.metrics.record_enqueue(&job.priority, EnqueueRoute::Ready.as_str());
        }
        for job in &delayed {
            self.store.schedule(job, job.ready_time_ms()).await?;
            self.metrics
                .record_enqueue(&job.priority, EnqueueRoute::Scheduled.as_str());
        }

        let total = ready.len() + delayed.len();
        info!(ready = ready.len(), scheduled = delayed.len(), "Enqueued batch");
        Ok(total)
    }

    /// Reads depths for every priority and publishes them as gauges.
    pub async fn stats(&self) -> Result<QueueStats, QueueError> {
        let now = self.clock.now();
        let mut priorities = Vec::with_capacity(self.priorities.len());

        for name in &self.priorities {
            let ready = self.store.ready_depth(name).await?;
            let scheduled = self.store.scheduled_depth(name).await?;
            let oldest_age = self
                .store
                .peek_ready(name, 1)
                .await?
                .first()
                .map(|job| job.waiting_for(now));

            self.metrics.update_queue_depth(&format!("ready:{name}"), ready);
            self.metrics.update_queue_depth(&format!("sched:{name}"), scheduled);
            priorities.push(PriorityStats {
                name: name.clone(),
                ready,
                scheduled,
                oldest_age,
            });
        }

        let dead_letter = self.store.dead_letter_depth().await?;
        self.metrics.update_queue_depth("dlq", dead_letter);

        let live_workers = self.registry.live_count(self.liveness_timeout).await?;

        Ok(QueueStats {
            priorities,
            dead_letter,
            live_workers,
        })
    }

    /// Lists up to `limit` dead-letter entries, newest first.
    pub async fn peek_dead_letter(&self, limit: usize) -> Result<Vec<DeadLetterEntry>, QueueError> {
        Ok(self.store.peek_dead_letter(limit).await?)
    }

    /// Deletes every dead-letter entry. Returns how many were removed.
    pub async fn purge_dead_letter(&self) -> Result<usize, QueueError> {
        let removed = self.store.purge_dead_letter().await?;
        info!(removed = removed, "Purged dead-letter queue");
        Ok(removed)
    }

    fn check_priority(&self, priority: &str) -> Result<(), QueueError> {
        if self.priorities.iter().any(|p| p == priority) {
            Ok(())
        } else {
            Err(QueueError::UnknownPriority(priority.to_string()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::store::{JobOutcome, MemoryLeaseStore};

    fn queue() -> (Arc<MemoryLeaseStore>, Arc<ManualClock>, JobQueue) {
        let store = Arc::new(MemoryLeaseStore::new());
        let clock = Arc::new(ManualClock::starting_now());
        let queue = JobQueue::new(store.clone(), clock.clone(), &QueueConfig::default());
        (store, clock, queue)
    }

    #[tokio::test]
    async fn test_enqueue_routes_by_ready_time() {
        let (store, clock, queue) = queue();

        let ready = queue.job("high", "now").with_ready_time(clock.now());
        assert_eq!(queue.enqueue(ready).await.expect("enqueue"), EnqueueRoute::Ready);

        let later = queue.job("high", "later");
        assert_eq!(
            queue
                .enqueue_in(later, Duration::from_secs(30))
                .await
                .expect("enqueue"),
            EnqueueRoute::Scheduled
        );

        assert_eq!(store.ready_depth("high").await.expect("depth"), 1);
        assert_eq!(store.scheduled_depth("high").await.expect("depth"), 1);
    }

    #[tokio::test]
    async fn test_enqueue_rejects_unknown_priority() {
        let (_, _, queue) = queue();
        let err = queue
            .enqueue(Job::new("urgent", "x"))
            .await
            .expect_err("unknown priority");
        assert!(matches!(err, QueueError::UnknownPriority(p) if p == "urgent"));
    }

    #[tokio::test]
    async fn test_enqueue_batch_checks_all_before_writing() {
        let (store, clock, queue) = queue();
        let err = queue
            .enqueue_batch(vec![Job::new("high", "a"), Job::new("nope", "b")])
            .await;
        assert!(err.is_err());
        assert_eq!(store.ready_depth("high").await.expect("depth"), 0);

        let n = queue
            .enqueue_batch(vec![
                Job::new("high", "a").with_id("a").with_ready_time(clock.now()),
                Job::new("high", "b").with_id("b").with_ready_time(clock.now()),
            ])
            .await
            .expect("batch");
        assert_eq!(n, 2);
        let order: Vec<String> = store
            .peek_ready("high", 10)
            .await
            .expect("peek")
            .into_iter()
            .map(|j| j.id)
            .collect();
        assert_eq!(order, vec!["a".to_string(), "b".to_string()]);
    }

    #[tokio::test]
    async fn test_stats_reports_depths_and_age() {
        let (store, clock, queue) = queue();
        queue
            .enqueue(
                queue
                    .job("low", "x")
                    .with_max_attempts(1)
                    .with_ready_time(clock.now()),
            )
            .await
            .expect("enqueue");
        clock.advance(Duration::from_secs(5));

        let stats = queue.stats().await.expect("stats");
        let low = stats
            .priorities
            .iter()
            .find(|p| p.name == "low")
            .expect("low listed");
        assert_eq!(low.ready, 1);
        assert_eq!(low.oldest_age, Some(Duration::from_secs(5)));
        assert_eq!(stats.total_ready(), 1);
        assert_eq!(stats.dead_letter, 0);

        let high = &stats.priorities[0];
        assert_eq!(high.name, "high");
        assert_eq!(high.oldest_age, None);

        // A single-attempt job is dead-lettered on its first failure.
        let lease = store
            .claim("low", "w1", clock.now_ms(), Duration::from_secs(30), None)
            .await
            .expect("claim")
            .expect("job ready");
        assert_eq!(lease.job.max_attempts, 1);
        store
            .finish(
                &lease.handle,
                &JobOutcome::Failure {
                    error: "boom".to_string(),
                    backoff: Duration::ZERO,
                },
                clock.now_ms(),
            )
            .await
            .expect("finish");

        let stats = queue.stats().await.expect("stats");
        assert_eq!(stats.dead_letter, 1);
        assert_eq!(stats.live_workers, 1);

        let entries = queue.peek_dead_letter(10).await.expect("peek");
        assert_eq!(entries[0].error, "boom");
        assert_eq!(queue.purge_dead_letter().await.expect("purge"), 1);
        assert_eq!(queue.stats().await.expect("stats").dead_letter, 0);
    }
}

//! Lease store adapter.
//!
//! [`LeaseStore`] is the only seam between the engine and the backing store.
//! Every operation that must change more than one structure (pop + lease write,
//! lease delete + re-enqueue, range pop + push) is a single call on this trait
//! and is applied atomically by the implementation:
//!
//! - [`RedisLeaseStore`]: server-side Lua scripts over a shared `ConnectionManager`
//! - [`MemoryLeaseStore`]: one mutex around the whole state, for tests and
//!   single-process deployments
//!
//! Callers pass the current time (`now_ms`, epoch milliseconds) into every
//! time-dependent operation so that lease expiry, ready times and registry
//! liveness are all measured on the caller's [`crate::clock::Clock`].

pub mod keys;
pub mod memory;
pub mod redis;

use std::time::Duration;

use async_trait::async_trait;

use crate::error::StoreError;
use crate::scheduler::job::{DeadLetterEntry, Job};

pub use self::keys::KeySpace;
pub use self::memory::MemoryLeaseStore;
pub use self::redis::RedisLeaseStore;

/// Error recorded on jobs returned to the queue because their lease expired.
pub const LEASE_EXPIRED_ERROR: &str = "lease expired";

/// Identifies one lease: the worker holding it and the job it covers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeaseHandle {
    pub worker_id: String,
    pub job_id: String,
    pub priority: String,
}

/// A claimed job together with its lease.
#[derive(Debug, Clone)]
pub struct Lease {
    pub job: Job,
    pub handle: LeaseHandle,
    /// Lease expiry in epoch milliseconds.
    pub expires_at_ms: i64,
}

/// Snapshot of a worker's processing record.
#[derive(Debug, Clone, PartialEq)]
pub struct ProcessingRecord {
    pub owner: String,
    pub job_id: String,
    pub lease_expiry_ms: i64,
    pub job: Job,
}

/// Result of a conditional lease extension.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RenewOutcome {
    Renewed { expires_at_ms: i64 },
    /// The record is gone or belongs to another lease.
    NotOwner,
    /// The record is still ours but its expiry has passed.
    Expired,
}

/// How a handler attempt ended.
#[derive(Debug, Clone, PartialEq)]
pub enum JobOutcome {
    Success,
    /// The attempt failed. A zero `backoff` re-enqueues to the ready queue,
    /// a positive one schedules the retry `backoff` from now.
    Failure { error: String, backoff: Duration },
}

/// Where a job went when its lease was finished.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FinishOutcome {
    /// Job and processing record deleted.
    Completed,
    /// Returned to the ready queue with `attempt_count` incremented.
    Requeued,
    /// Placed in the scheduled set with `attempt_count` incremented.
    Scheduled,
    /// Retry budget exhausted; moved to the dead-letter queue.
    DeadLettered,
    /// The caller no longer owns the lease; nothing changed.
    NotOwner,
}

impl FinishOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            FinishOutcome::Completed => "completed",
            FinishOutcome::Requeued => "requeued",
            FinishOutcome::Scheduled => "scheduled",
            FinishOutcome::DeadLettered => "dead_lettered",
            FinishOutcome::NotOwner => "not_owner",
        }
    }
}

/// Result of a reaper reclaim attempt against one worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReclaimOutcome {
    /// The worker holds no processing record.
    NoLease,
    /// The lease has not expired; it was left alone.
    Alive,
    Requeued,
    Scheduled,
    DeadLettered,
}

impl ReclaimOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReclaimOutcome::NoLease => "no_lease",
            ReclaimOutcome::Alive => "alive",
            ReclaimOutcome::Requeued => "requeued",
            ReclaimOutcome::Scheduled => "scheduled",
            ReclaimOutcome::DeadLettered => "dead_lettered",
        }
    }

    /// Returns whether a processing record was deleted.
    pub fn reclaimed(&self) -> bool {
        matches!(
            self,
            ReclaimOutcome::Requeued | ReclaimOutcome::Scheduled | ReclaimOutcome::DeadLettered
        )
    }
}

/// State of an existing idempotency record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdempotencyState {
    InProgress,
    Done,
}

impl IdempotencyState {
    pub fn as_str(&self) -> &'static str {
        match self {
            IdempotencyState::InProgress => "in_progress",
            IdempotencyState::Done => "done",
        }
    }

    pub(crate) fn parse(raw: &str) -> Result<Self, StoreError> {
        match raw {
            "in_progress" => Ok(IdempotencyState::InProgress),
            "done" => Ok(IdempotencyState::Done),
            other => Err(StoreError::UnexpectedReply(format!(
                "unknown idempotency state '{other}'"
            ))),
        }
    }
}

/// Result of `idempotency_begin`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdempotencyStatus {
    /// The record was created; the caller owns the side effects.
    Fresh,
    /// A record already exists.
    Duplicate(IdempotencyState),
}

/// Atomic primitives of the backing store.
#[async_trait]
pub trait LeaseStore: Send + Sync {
    /// Appends a job to the tail of its priority's ready queue.
    async fn push_ready(&self, job: &Job) -> Result<(), StoreError>;

    /// Appends several jobs to their ready queues, in order.
    async fn push_ready_many(&self, jobs: &[Job]) -> Result<(), StoreError> {
        for job in jobs {
            self.push_ready(job).await?;
        }
        Ok(())
    }

    /// Inserts a job into its priority's scheduled set at `ready_at_ms`.
    async fn schedule(&self, job: &Job, ready_at_ms: i64) -> Result<(), StoreError>;

    /// Pops the head of `priority`'s ready queue and creates the worker's
    /// processing record in one step.
    ///
    /// With `wait`, blocks up to that long for the queue to become non-empty.
    /// Fails with [`StoreError::LeaseHeld`] if the worker already holds a lease.
    async fn claim(
        &self,
        priority: &str,
        worker_id: &str,
        now_ms: i64,
        ttl: Duration,
        wait: Option<Duration>,
    ) -> Result<Option<Lease>, StoreError>;

    /// Extends a lease only if it is still owned by the handle and unexpired.
    async fn renew(
        &self,
        handle: &LeaseHandle,
        now_ms: i64,
        ttl: Duration,
    ) -> Result<RenewOutcome, StoreError>;

    /// Deletes the processing record and applies the outcome to the job.
    async fn finish(
        &self,
        handle: &LeaseHandle,
        outcome: &JobOutcome,
        now_ms: i64,
    ) -> Result<FinishOutcome, StoreError>;

    /// Returns a held job to the head of its ready queue without consuming an
    /// attempt. With `job_id`, only that lease is released.
    ///
    /// Returns whether a job was released.
    async fn release(&self, worker_id: &str, job_id: Option<&str>) -> Result<bool, StoreError>;

    /// Reclaims the worker's lease if it has expired, re-enqueueing or
    /// dead-lettering the job. The worker's registry entry is removed if its
    /// last-seen time is at or before `stale_before_ms`, whatever the outcome.
    async fn reclaim(
        &self,
        worker_id: &str,
        now_ms: i64,
        stale_before_ms: i64,
    ) -> Result<ReclaimOutcome, StoreError>;

    /// Moves up to `limit` due jobs from the scheduled set to the ready queue,
    /// earliest ready time first. Returns the number moved.
    async fn promote(&self, priority: &str, now_ms: i64, limit: usize) -> Result<usize, StoreError>;

    /// Adds or refreshes a registry entry.
    async fn touch_worker(&self, worker_id: &str, now_ms: i64) -> Result<(), StoreError>;

    async fn remove_worker(&self, worker_id: &str) -> Result<(), StoreError>;

    /// Returns up to `limit` workers last seen at or before `cutoff_ms`, oldest first.
    async fn stale_workers(&self, cutoff_ms: i64, limit: usize) -> Result<Vec<String>, StoreError>;

    /// Counts workers seen after `since_ms`.
    async fn count_workers(&self, since_ms: i64) -> Result<usize, StoreError>;

    /// Creates an `in_progress` record for `key` unless one exists.
    async fn idempotency_begin(
        &self,
        key: &str,
        now_ms: i64,
        ttl: Duration,
    ) -> Result<IdempotencyStatus, StoreError>;

    /// Marks the record `done` with a fresh TTL.
    async fn idempotency_end(&self, key: &str, now_ms: i64, ttl: Duration)
        -> Result<(), StoreError>;

    /// Deletes the record if it is still `in_progress`. Returns whether it was deleted.
    async fn idempotency_release(&self, key: &str, now_ms: i64) -> Result<bool, StoreError>;

    async fn ready_depth(&self, priority: &str) -> Result<usize, StoreError>;

    /// Returns up to `limit` ready jobs in claim order without removing them.
    async fn peek_ready(&self, priority: &str, limit: usize) -> Result<Vec<Job>, StoreError>;

    async fn scheduled_depth(&self, priority: &str) -> Result<usize, StoreError>;

    /// Returns up to `limit` scheduled jobs with their ready times, earliest first.
    async fn peek_scheduled(
        &self,
        priority: &str,
        limit: usize,
    ) -> Result<Vec<(Job, i64)>, StoreError>;

    async fn processing_record(
        &self,
        worker_id: &str,
    ) -> Result<Option<ProcessingRecord>, StoreError>;

    async fn dead_letter_depth(&self) -> Result<usize, StoreError>;

    /// Returns up to `limit` dead-letter entries, newest first.
    async fn peek_dead_letter(&self, limit: usize) -> Result<Vec<DeadLetterEntry>, StoreError>;

    /// Empties the dead-letter queue. Returns the number of entries removed.
    async fn purge_dead_letter(&self) -> Result<usize, StoreError>;
}

pub(crate) fn duration_ms(d: Duration) -> i64 {
    i64::try_from(d.as_millis()).unwrap_or(i64::MAX)
}

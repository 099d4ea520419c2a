//! In-process lease store.
//!
//! All state sits behind one mutex, so every trait operation is atomic in the
//! same sense a Redis script is: no other caller observes an intermediate
//! state. Blocking claims park on a [`Notify`] that is signalled whenever a
//! ready queue grows.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use tokio::sync::Notify;

use super::{
    duration_ms, FinishOutcome, IdempotencyState, IdempotencyStatus, JobOutcome, Lease,
    LeaseHandle, LeaseStore, ProcessingRecord, ReclaimOutcome, RenewOutcome,
    LEASE_EXPIRED_ERROR,
};
use crate::error::StoreError;
use crate::scheduler::job::{DeadLetterEntry, Job};

#[derive(Debug, Clone)]
struct Processing {
    job: Job,
    lease_expiry_ms: i64,
}

#[derive(Debug, Clone, Copy)]
struct IdempotencyRecord {
    state: IdempotencyState,
    expires_at_ms: i64,
}

/// Where a failed or reclaimed job ended up.
enum Retired {
    Requeued,
    Scheduled,
    DeadLettered,
}

#[derive(Debug, Default)]
struct State {
    /// Front is the tail (LPUSH side), back is the head (next to claim).
    ready: HashMap<String, VecDeque<Job>>,
    /// Keyed by (ready time, job id) so iteration is in promotion order.
    scheduled: HashMap<String, BTreeMap<(i64, String), Job>>,
    processing: HashMap<String, Processing>,
    workers: HashMap<String, i64>,
    /// Front is the newest entry.
    dead_letter: VecDeque<DeadLetterEntry>,
    idempotency: HashMap<String, IdempotencyRecord>,
}

impl State {
    fn push_ready(&mut self, job: Job) {
        self.ready
            .entry(job.priority.clone())
            .or_default()
            .push_front(job);
    }

    fn schedule(&mut self, job: Job, ready_at_ms: i64) {
        let set = self.scheduled.entry(job.priority.clone()).or_default();
        // One entry per job id: scheduling again moves it.
        set.retain(|(_, id), _| id != &job.id);
        set.insert((ready_at_ms, job.id.clone()), job);
    }

    /// Increments the attempt count and routes the job to the ready queue,
    /// the scheduled set or the dead-letter queue.
    fn retire(&mut self, mut job: Job, error: &str, backoff_ms: i64, now_ms: i64) -> Retired {
        job.attempt_count = job.attempt_count.saturating_add(1);
        if job.attempt_count >= job.max_attempts {
            self.dead_letter.push_front(DeadLetterEntry {
                job,
                error: error.to_string(),
                moved_at: millis_to_datetime(now_ms),
            });
            return Retired::DeadLettered;
        }
        let ready_at_ms = now_ms.saturating_add(backoff_ms);
        job.ready_time = millis_to_datetime(ready_at_ms);
        if backoff_ms > 0 {
            self.schedule(job, ready_at_ms);
            Retired::Scheduled
        } else {
            self.push_ready(job);
            Retired::Requeued
        }
    }

    fn live_idempotency(&self, key: &str, now_ms: i64) -> Option<IdempotencyRecord> {
        self.idempotency
            .get(key)
            .copied()
            .filter(|r| r.expires_at_ms > now_ms)
    }
}

/// Lease store kept entirely in process memory.
#[derive(Debug, Default)]
pub struct MemoryLeaseStore {
    state: Mutex<State>,
    ready_signal: Notify,
}

impl MemoryLeaseStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn try_claim(
        &self,
        priority: &str,
        worker_id: &str,
        now_ms: i64,
        ttl: Duration,
    ) -> Result<Option<Lease>, StoreError> {
        let mut state = self.lock();
        if state.processing.contains_key(worker_id) {
            return Err(StoreError::LeaseHeld(worker_id.to_string()));
        }
        let Some(job) = state.ready.get_mut(priority).and_then(VecDeque::pop_back) else {
            return Ok(None);
        };
        let expires_at_ms = now_ms.saturating_add(duration_ms(ttl));
        state.processing.insert(
            worker_id.to_string(),
            Processing {
                job: job.clone(),
                lease_expiry_ms: expires_at_ms,
            },
        );
        state.workers.insert(worker_id.to_string(), now_ms);

        Ok(Some(Lease {
            handle: LeaseHandle {
                worker_id: worker_id.to_string(),
                job_id: job.id.clone(),
                priority: job.priority.clone(),
            },
            job,
            expires_at_ms,
        }))
    }

    fn owned<'a>(state: &'a State, handle: &LeaseHandle) -> Option<&'a Processing> {
        state
            .processing
            .get(&handle.worker_id)
            .filter(|p| p.job.id == handle.job_id)
    }
}

fn millis_to_datetime(ms: i64) -> chrono::DateTime<Utc> {
    Utc.timestamp_millis_opt(ms).single().unwrap_or_else(Utc::now)
}

#[async_trait]
impl LeaseStore for MemoryLeaseStore {
    async fn push_ready(&self, job: &Job) -> Result<(), StoreError> {
        self.lock().push_ready(job.clone());
        self.ready_signal.notify_waiters();
        Ok(())
    }

    async fn push_ready_many(&self, jobs: &[Job]) -> Result<(), StoreError> {
        {
            let mut state = self.lock();
            for job in jobs {
                state.push_ready(job.clone());
            }
        }
        self.ready_signal.notify_waiters();
        Ok(())
    }

    async fn schedule(&self, job: &Job, ready_at_ms: i64) -> Result<(), StoreError> {
        self.lock().schedule(job.clone(), ready_at_ms);
        Ok(())
    }

    async fn claim(
        &self,
        priority: &str,
        worker_id: &str,
        now_ms: i64,
        ttl: Duration,
        wait: Option<Duration>,
    ) -> Result<Option<Lease>, StoreError> {
        let Some(wait) = wait else {
            return self.try_claim(priority, worker_id, now_ms, ttl);
        };

        let deadline = tokio::time::Instant::now() + wait;
        loop {
            // Register for the wakeup before looking, so a push between the
            // check and the wait is not missed.
            let notified = self.ready_signal.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(lease) = self.try_claim(priority, worker_id, now_ms, ttl)? {
                return Ok(Some(lease));
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Ok(None);
            }
        }
    }

    async fn renew(
        &self,
        handle: &LeaseHandle,
        now_ms: i64,
        ttl: Duration,
    ) -> Result<RenewOutcome, StoreError> {
        let mut state = self.lock();
        let Some(record) = state
            .processing
            .get_mut(&handle.worker_id)
            .filter(|p| p.job.id == handle.job_id)
        else {
            return Ok(RenewOutcome::NotOwner);
        };
        if record.lease_expiry_ms < now_ms {
            return Ok(RenewOutcome::Expired);
        }
        let expires_at_ms = now_ms.saturating_add(duration_ms(ttl));
        record.lease_expiry_ms = expires_at_ms;
        if let Some(seen) = state.workers.get_mut(&handle.worker_id) {
            *seen = now_ms;
        }
        Ok(RenewOutcome::Renewed { expires_at_ms })
    }

    async fn finish(
        &self,
        handle: &LeaseHandle,
        outcome: &JobOutcome,
        now_ms: i64,
    ) -> Result<FinishOutcome, StoreError> {
        let retired = {
            let mut state = self.lock();
            if Self::owned(&state, handle).is_none() {
                return Ok(FinishOutcome::NotOwner);
            }
            let Some(record) = state.processing.remove(&handle.worker_id) else {
                return Ok(FinishOutcome::NotOwner);
            };
            match outcome {
                JobOutcome::Success => return Ok(FinishOutcome::Completed),
                JobOutcome::Failure { error, backoff } => {
                    state.retire(record.job, error, duration_ms(*backoff), now_ms)
                }
            }
        };
        Ok(match retired {
            Retired::Requeued => {
                self.ready_signal.notify_waiters();
                FinishOutcome::Requeued
            }
            Retired::Scheduled => FinishOutcome::Scheduled,
            Retired::DeadLettered => FinishOutcome::DeadLettered,
        })
    }

    async fn release(&self, worker_id: &str, job_id: Option<&str>) -> Result<bool, StoreError> {
        {
            let mut state = self.lock();
            let matches = state
                .processing
                .get(worker_id)
                .is_some_and(|p| job_id.map_or(true, |id| p.job.id == id));
            if !matches {
                return Ok(false);
            }
            let Some(record) = state.processing.remove(worker_id) else {
                return Ok(false);
            };
            // Back to the head: it was the next job in line when claimed.
            state
                .ready
                .entry(record.job.priority.clone())
                .or_default()
                .push_back(record.job);
        }
        self.ready_signal.notify_waiters();
        Ok(true)
    }

    async fn reclaim(
        &self,
        worker_id: &str,
        now_ms: i64,
        stale_before_ms: i64,
    ) -> Result<ReclaimOutcome, StoreError> {
        let outcome = {
            let mut state = self.lock();
            let outcome = match state.processing.get(worker_id) {
                None => ReclaimOutcome::NoLease,
                Some(p) if p.lease_expiry_ms >= now_ms => ReclaimOutcome::Alive,
                Some(_) => match state.processing.remove(worker_id) {
                    Some(record) => {
                        match state.retire(record.job, LEASE_EXPIRED_ERROR, 0, now_ms) {
                            Retired::Requeued => ReclaimOutcome::Requeued,
                            Retired::Scheduled => ReclaimOutcome::Scheduled,
                            Retired::DeadLettered => ReclaimOutcome::DeadLettered,
                        }
                    }
                    None => ReclaimOutcome::NoLease,
                },
            };
            if state
                .workers
                .get(worker_id)
                .is_some_and(|seen| *seen <= stale_before_ms)
            {
                state.workers.remove(worker_id);
            }
            outcome
        };
        if outcome == ReclaimOutcome::Requeued {
            self.ready_signal.notify_waiters();
        }
        Ok(outcome)
    }

    async fn promote(&self, priority: &str, now_ms: i64, limit: usize) -> Result<usize, StoreError> {
        let moved = {
            let mut state = self.lock();
            let due: Vec<Job> = match state.scheduled.get_mut(priority) {
                Some(set) => {
                    let keys: Vec<(i64, String)> = set
                        .keys()
                        .take_while(|(ready_at, _)| *ready_at <= now_ms)
                        .take(limit)
                        .cloned()
                        .collect();
                    keys.iter().filter_map(|k| set.remove(k)).collect()
                }
                None => Vec::new(),
            };
            let moved = due.len();
            for job in due {
                state.push_ready(job);
            }
            moved
        };
        if moved > 0 {
            self.ready_signal.notify_waiters();
        }
        Ok(moved)
    }

    async fn touch_worker(&self, worker_id: &str, now_ms: i64) -> Result<(), StoreError> {
        self.lock().workers.insert(worker_id.to_string(), now_ms);
        Ok(())
    }

    async fn remove_worker(&self, worker_id: &str) -> Result<(), StoreError> {
        self.lock().workers.remove(worker_id);
        Ok(())
    }

    async fn stale_workers(&self, cutoff_ms: i64, limit: usize) -> Result<Vec<String>, StoreError> {
        let state = self.lock();
        let mut stale: Vec<(i64, &String)> = state
            .workers
            .iter()
            .filter(|(_, seen)| **seen <= cutoff_ms)
            .map(|(id, seen)| (*seen, id))
            .collect();
        stale.sort();
        Ok(stale
            .into_iter()
            .take(limit)
            .map(|(_, id)| id.clone())
            .collect())
    }

    async fn count_workers(&self, since_ms: i64) -> Result<usize, StoreError> {
        Ok(self
            .lock()
            .workers
            .values()
            .filter(|seen| **seen > since_ms)
            .count())
    }

    async fn idempotency_begin(
        &self,
        key: &str,
        now_ms: i64,
        ttl: Duration,
    ) -> Result<IdempotencyStatus, StoreError> {
        let mut state = self.lock();
        if let Some(record) = state.live_idempotency(key, now_ms) {
            return Ok(IdempotencyStatus::Duplicate(record.state));
        }
        state.idempotency.insert(
            key.to_string(),
            IdempotencyRecord {
                state: IdempotencyState::InProgress,
                expires_at_ms: now_ms.saturating_add(duration_ms(ttl)),
            },
        );
        Ok(IdempotencyStatus::Fresh)
    }

    async fn idempotency_end(
        &self,
        key: &str,
        now_ms: i64,
        ttl: Duration,
    ) -> Result<(), StoreError> {
        self.lock().idempotency.insert(
            key.to_string(),
            IdempotencyRecord {
                state: IdempotencyState::Done,
                expires_at_ms: now_ms.saturating_add(duration_ms(ttl)),
            },
        );
        Ok(())
    }

    async fn idempotency_release(&self, key: &str, now_ms: i64) -> Result<bool, StoreError> {
        let mut state = self.lock();
        match state.live_idempotency(key, now_ms) {
            Some(record) if record.state == IdempotencyState::InProgress => {
                state.idempotency.remove(key);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn ready_depth(&self, priority: &str) -> Result<usize, StoreError> {
        Ok(self.lock().ready.get(priority).map_or(0, VecDeque::len))
    }

    async fn peek_ready(&self, priority: &str, limit: usize) -> Result<Vec<Job>, StoreError> {
        Ok(self
            .lock()
            .ready
            .get(priority)
            .map(|q| q.iter().rev().take(limit).cloned().collect())
            .unwrap_or_default())
    }

    async fn scheduled_depth(&self, priority: &str) -> Result<usize, StoreError> {
        Ok(self.lock().scheduled.get(priority).map_or(0, BTreeMap::len))
    }

    async fn peek_scheduled(
        &self,
        priority: &str,
        limit: usize,
    ) -> Result<Vec<(Job, i64)>, StoreError> {
        Ok(self
            .lock()
            .scheduled
            .get(priority)
            .map(|set| {
                set.iter()
                    .take(limit)
                    .map(|((ready_at, _), job)| (job.clone(), *ready_at))
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn processing_record(
        &self,
        worker_id: &str,
    ) -> Result<Option<ProcessingRecord>, StoreError> {
        Ok(self.lock().processing.get(worker_id).map(|p| ProcessingRecord {
            owner: worker_id.to_string(),
            job_id: p.job.id.clone(),
            lease_expiry_ms: p.lease_expiry_ms,
            job: p.job.clone(),
        }))
    }

    async fn dead_letter_depth(&self) -> Result<usize, StoreError> {
        Ok(self.lock().dead_letter.len())
    }

    async fn peek_dead_letter(&self, limit: usize) -> Result<Vec<DeadLetterEntry>, StoreError> {
        Ok(self.lock().dead_letter.iter().take(limit).cloned().collect())
    }

    async fn purge_dead_letter(&self) -> Result<usize, StoreError> {
        let mut state = self.lock();
        let purged = state.dead_letter.len();
        state.dead_letter.clear();
        Ok(purged)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TTL: Duration = Duration::from_secs(30);
    const NOW: i64 = 1_700_000_000_000;

    fn job(id: &str, priority: &str) -> Job {
        Job::new(priority, "payload").with_id(id)
    }

    #[tokio::test]
    async fn test_claim_is_fifo_within_priority() {
        let store = MemoryLeaseStore::new();
        store.push_ready(&job("a", "high")).await.expect("push");
        store.push_ready(&job("b", "high")).await.expect("push");

        let first = store
            .claim("high", "w1", NOW, TTL, None)
            .await
            .expect("claim")
            .expect("job available");
        assert_eq!(first.job.id, "a");
        assert_eq!(first.expires_at_ms, NOW + 30_000);

        let second = store
            .claim("high", "w2", NOW, TTL, None)
            .await
            .expect("claim")
            .expect("job available");
        assert_eq!(second.job.id, "b");
    }

    #[tokio::test]
    async fn test_claim_creates_processing_record() {
        let store = MemoryLeaseStore::new();
        store.push_ready(&job("a", "low")).await.expect("push");
        store
            .claim("low", "w1", NOW, TTL, None)
            .await
            .expect("claim");

        let record = store
            .processing_record("w1")
            .await
            .expect("lookup")
            .expect("record exists");
        assert_eq!(record.owner, "w1");
        assert_eq!(record.job_id, "a");
        assert_eq!(store.ready_depth("low").await.expect("depth"), 0);
        assert_eq!(store.count_workers(NOW - 1).await.expect("count"), 1);
    }

    #[tokio::test]
    async fn test_second_claim_while_holding_fails() {
        let store = MemoryLeaseStore::new();
        store.push_ready(&job("a", "low")).await.expect("push");
        store.push_ready(&job("b", "low")).await.expect("push");
        store.claim("low", "w1", NOW, TTL, None).await.expect("claim");

        let err = store
            .claim("low", "w1", NOW, TTL, None)
            .await
            .expect_err("second claim must fail");
        assert!(matches!(err, StoreError::LeaseHeld(_)));
        assert_eq!(store.ready_depth("low").await.expect("depth"), 1);
    }

    #[tokio::test]
    async fn test_blocking_claim_wakes_on_push() {
        let store = std::sync::Arc::new(MemoryLeaseStore::new());
        let waiter = {
            let store = std::sync::Arc::clone(&store);
            tokio::spawn(async move {
                store
                    .claim("high", "w1", NOW, TTL, Some(Duration::from_secs(5)))
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        store.push_ready(&job("late", "high")).await.expect("push");

        let lease = waiter
            .await
            .expect("task should not panic")
            .expect("claim")
            .expect("job delivered");
        assert_eq!(lease.job.id, "late");
    }

    #[tokio::test]
    async fn test_blocking_claim_times_out() {
        let store = MemoryLeaseStore::new();
        let result = store
            .claim("high", "w1", NOW, TTL, Some(Duration::from_millis(20)))
            .await
            .expect("claim");
        assert!(result.is_none());
    }

    #[tokio::test]
    async fn test_renew_checks_owner_and_expiry() {
        let store = MemoryLeaseStore::new();
        store.push_ready(&job("a", "low")).await.expect("push");
        let lease = store
            .claim("low", "w1", NOW, TTL, None)
            .await
            .expect("claim")
            .expect("job");

        let outcome = store
            .renew(&lease.handle, NOW + 10_000, TTL)
            .await
            .expect("renew");
        assert_eq!(
            outcome,
            RenewOutcome::Renewed {
                expires_at_ms: NOW + 40_000
            }
        );

        let mut foreign = lease.handle.clone();
        foreign.job_id = "other".to_string();
        assert_eq!(
            store.renew(&foreign, NOW, TTL).await.expect("renew"),
            RenewOutcome::NotOwner
        );

        assert_eq!(
            store
                .renew(&lease.handle, NOW + 40_001, TTL)
                .await
                .expect("renew"),
            RenewOutcome::Expired
        );
    }

    #[tokio::test]
    async fn test_failure_with_backoff_schedules_retry() {
        let store = MemoryLeaseStore::new();
        store.push_ready(&job("a", "low")).await.expect("push");
        let lease = store
            .claim("low", "w1", NOW, TTL, None)
            .await
            .expect("claim")
            .expect("job");

        let outcome = store
            .finish(
                &lease.handle,
                &JobOutcome::Failure {
                    error: "boom".to_string(),
                    backoff: Duration::from_secs(2),
                },
                NOW,
            )
            .await
            .expect("finish");
        assert_eq!(outcome, FinishOutcome::Scheduled);

        let scheduled = store.peek_scheduled("low", 10).await.expect("peek");
        assert_eq!(scheduled.len(), 1);
        assert_eq!(scheduled[0].0.attempt_count, 1);
        assert_eq!(scheduled[0].1, NOW + 2_000);
        assert!(store.processing_record("w1").await.expect("lookup").is_none());
    }

    #[tokio::test]
    async fn test_exhausted_failure_dead_letters() {
        let store = MemoryLeaseStore::new();
        store
            .push_ready(&job("a", "low").with_max_attempts(1))
            .await
            .expect("push");
        let lease = store
            .claim("low", "w1", NOW, TTL, None)
            .await
            .expect("claim")
            .expect("job");

        let outcome = store
            .finish(
                &lease.handle,
                &JobOutcome::Failure {
                    error: "fatal".to_string(),
                    backoff: Duration::ZERO,
                },
                NOW,
            )
            .await
            .expect("finish");
        assert_eq!(outcome, FinishOutcome::DeadLettered);

        let entries = store.peek_dead_letter(10).await.expect("peek");
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].error, "fatal");
        assert_eq!(entries[0].job.attempt_count, 1);
        assert_eq!(entries[0].moved_at.timestamp_millis(), NOW);
        assert_eq!(store.purge_dead_letter().await.expect("purge"), 1);
        assert_eq!(store.dead_letter_depth().await.expect("depth"), 0);
    }

    #[tokio::test]
    async fn test_release_returns_job_to_head() {
        let store = MemoryLeaseStore::new();
        store.push_ready(&job("a", "high")).await.expect("push");
        store.push_ready(&job("b", "high")).await.expect("push");
        store.claim("high", "w1", NOW, TTL, None).await.expect("claim");

        assert!(!store.release("w1", Some("b")).await.expect("release"));
        assert!(store.release("w1", None).await.expect("release"));

        let ready = store.peek_ready("high", 10).await.expect("peek");
        let ids: Vec<&str> = ready.iter().map(|j| j.id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b"]);
        assert_eq!(ready[0].attempt_count, 0);
    }

    #[tokio::test]
    async fn test_reclaim_respects_live_lease() {
        let store = MemoryLeaseStore::new();
        store.push_ready(&job("a", "high")).await.expect("push");
        store.claim("high", "w1", NOW, TTL, None).await.expect("claim");

        let outcome = store.reclaim("w1", NOW + 30_000, NOW).await.expect("reclaim");
        assert_eq!(outcome, ReclaimOutcome::Alive);
        // The registry entry was stale and is removed regardless.
        assert_eq!(store.count_workers(0).await.expect("count"), 0);

        let outcome = store.reclaim("w1", NOW + 30_001, NOW).await.expect("reclaim");
        assert_eq!(outcome, ReclaimOutcome::Requeued);
        let ready = store.peek_ready("high", 1).await.expect("peek");
        assert_eq!(ready[0].attempt_count, 1);

        let outcome = store.reclaim("w1", NOW + 30_002, NOW).await.expect("reclaim");
        assert_eq!(outcome, ReclaimOutcome::NoLease);
    }

    #[tokio::test]
    async fn test_promote_respects_limit_and_order() {
        let store = MemoryLeaseStore::new();
        store.schedule(&job("late", "low"), NOW - 100).await.expect("schedule");
        store.schedule(&job("early", "low"), NOW - 500).await.expect("schedule");
        store.schedule(&job("future", "low"), NOW + 500).await.expect("schedule");

        assert_eq!(store.promote("low", NOW, 1).await.expect("promote"), 1);
        assert_eq!(store.promote("low", NOW, 10).await.expect("promote"), 1);
        assert_eq!(store.promote("low", NOW, 10).await.expect("promote"), 0);

        let ready = store.peek_ready("low", 10).await.expect("peek");
        let ids: Vec<&str> = ready.iter().map(|j| j.id.as_str()).collect();
        assert_eq!(ids, vec!["early", "late"]);
        assert_eq!(store.scheduled_depth("low").await.expect("depth"), 1);
    }

    #[tokio::test]
    async fn test_rescheduling_same_job_moves_score() {
        let store = MemoryLeaseStore::new();
        let j = job("a", "low");
        store.schedule(&j, NOW + 1_000).await.expect("schedule");
        store.schedule(&j, NOW + 5_000).await.expect("schedule");
        store
            .schedule(&Job::new("low", "v2").with_id("a"), NOW + 3_000)
            .await
            .expect("schedule");

        let scheduled = store.peek_scheduled("low", 10).await.expect("peek");
        assert_eq!(scheduled.len(), 1);
        assert_eq!(scheduled[0].0.payload, "v2");
        assert_eq!(scheduled[0].1, NOW + 3_000);
    }

    #[tokio::test]
    async fn test_idempotency_lifecycle() {
        let store = MemoryLeaseStore::new();
        let ttl = Duration::from_secs(60);

        assert_eq!(
            store.idempotency_begin("k", NOW, ttl).await.expect("begin"),
            IdempotencyStatus::Fresh
        );
        assert_eq!(
            store.idempotency_begin("k", NOW, ttl).await.expect("begin"),
            IdempotencyStatus::Duplicate(IdempotencyState::InProgress)
        );
        store.idempotency_end("k", NOW, ttl).await.expect("end");
        assert!(!store.idempotency_release("k", NOW).await.expect("release"));
        assert_eq!(
            store.idempotency_begin("k", NOW + 1, ttl).await.expect("begin"),
            IdempotencyStatus::Duplicate(IdempotencyState::Done)
        );
        assert_eq!(
            store
                .idempotency_begin("k", NOW + 60_000, ttl)
                .await
                .expect("begin"),
            IdempotencyStatus::Fresh
        );
    }

    #[tokio::test]
    async fn test_stale_workers_oldest_first() {
        let store = MemoryLeaseStore::new();
        store.touch_worker("b", NOW - 10).await.expect("touch");
        store.touch_worker("a", NOW - 20).await.expect("touch");
        store.touch_worker("fresh", NOW).await.expect("touch");

        let stale = store.stale_workers(NOW - 5, 10).await.expect("stale");
        assert_eq!(stale, vec!["a".to_string(), "b".to_string()]);
        assert_eq!(store.stale_workers(NOW - 5, 1).await.expect("stale").len(), 1);

        store.remove_worker("a").await.expect("remove");
        assert_eq!(store.count_workers(NOW - 100).await.expect("count"), 2);
    }
}

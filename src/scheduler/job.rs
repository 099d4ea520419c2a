//! Job definitions for the scheduler.
//!
//! - `Job`: a unit of work, serialized as JSON into the ready queue, the
//!   scheduled set, the processing list and the dead-letter queue
//! - `DeadLetterEntry`: a job that exhausted its retry budget, with its final error
//!
//! Timestamps are serialized as epoch milliseconds so the store scripts can
//! compare and rewrite them without date parsing.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Default maximum number of attempts for a job.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

/// A job representing a unit of work to be executed.
///
/// Everything except `attempt_count` (and `ready_time`, which is moved forward
/// when a retry is scheduled) is fixed at creation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    /// Unique identifier, also the idempotency key.
    pub id: String,
    /// Name of the priority class the job is queued under.
    pub priority: String,
    /// Opaque payload handed to the handler.
    pub payload: String,
    /// When the producer created the job.
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub enqueue_time: DateTime<Utc>,
    /// Earliest time the job may run.
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub ready_time: DateTime<Utc>,
    /// Failed or reclaimed attempts so far.
    #[serde(default)]
    pub attempt_count: u32,
    /// Attempts allowed before the job is dead-lettered.
    pub max_attempts: u32,
}

impl Job {
    /// Creates a job that is ready immediately.
    ///
    /// The job gets a new UUID, zero attempts and the default retry budget.
    pub fn new(priority: impl Into<String>, payload: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            priority: priority.into(),
            payload: payload.into(),
            enqueue_time: now,
            ready_time: now,
            attempt_count: 0,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
        }
    }

    /// Sets an explicit job id.
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    /// Sets the maximum number of attempts.
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    /// Sets the enqueue time. The ready time follows unless it was already later.
    pub fn with_enqueue_time(mut self, at: DateTime<Utc>) -> Self {
        if self.ready_time <= self.enqueue_time {
            self.ready_time = at;
        }
        self.enqueue_time = at;
        self
    }

    /// Sets the time from which the job may run.
    pub fn with_ready_time(mut self, at: DateTime<Utc>) -> Self {
        self.ready_time = at;
        self
    }

    /// Delays the job by `delay` relative to its enqueue time.
    pub fn delayed_by(mut self, delay: Duration) -> Self {
        let delay = chrono::Duration::from_std(delay).unwrap_or(chrono::Duration::zero());
        self.ready_time = self.enqueue_time + delay;
        self
    }

    /// Returns whether the job may run at `now`.
    pub fn is_ready(&self, now: DateTime<Utc>) -> bool {
        self.ready_time <= now
    }

    /// Returns whether a failed attempt would be retried.
    ///
    /// A failure increments `attempt_count` first, so the job is retried only
    /// while the incremented count stays below `max_attempts`.
    pub fn should_retry(&self) -> bool {
        self.attempt_count.saturating_add(1) < self.max_attempts
    }

    /// Returns the number of attempts left, counting the current one.
    pub fn remaining_attempts(&self) -> u32 {
        self.max_attempts.saturating_sub(self.attempt_count)
    }

    /// Returns how long the job has been ready and waiting at `now`.
    pub fn waiting_for(&self, now: DateTime<Utc>) -> Duration {
        (now - self.ready_time).to_std().unwrap_or(Duration::ZERO)
    }

    pub fn ready_time_ms(&self) -> i64 {
        self.ready_time.timestamp_millis()
    }
}

/// A job parked in the dead-letter queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeadLetterEntry {
    pub job: Job,
    /// Error of the final attempt.
    pub error: String,
    /// When the job was dead-lettered.
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub moved_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_job_new() {
        let job = Job::new("high", "payload");

        assert!(Uuid::parse_str(&job.id).is_ok());
        assert_eq!(job.priority, "high");
        assert_eq!(job.payload, "payload");
        assert_eq!(job.attempt_count, 0);
        assert_eq!(job.max_attempts, DEFAULT_MAX_ATTEMPTS);
        assert_eq!(job.enqueue_time, job.ready_time);
    }

    #[test]
    fn test_delayed_job_is_not_ready() {
        let job = Job::new("low", "x").delayed_by(Duration::from_secs(5));
        assert!(!job.is_ready(job.enqueue_time));
        assert!(job.is_ready(job.enqueue_time + chrono::Duration::seconds(5)));
    }

    #[test]
    fn test_with_enqueue_time_moves_ready_time() {
        let at = Utc::now() - chrono::Duration::minutes(10);
        let job = Job::new("low", "x").with_enqueue_time(at);
        assert_eq!(job.enqueue_time, at);
        assert_eq!(job.ready_time, at);
    }

    #[test]
    fn test_retry_budget() {
        let mut job = Job::new("medium", "x").with_max_attempts(2);
        assert!(job.should_retry());
        assert_eq!(job.remaining_attempts(), 2);

        job.attempt_count = 1;
        assert!(!job.should_retry());
        assert_eq!(job.remaining_attempts(), 1);
    }

    #[test]
    fn test_single_attempt_job_never_retries() {
        let job = Job::new("high", "x").with_max_attempts(1);
        assert!(!job.should_retry());
    }

    #[test]
    fn test_waiting_for() {
        let job = Job::new("low", "x");
        let later = job.ready_time + chrono::Duration::seconds(3);
        assert_eq!(job.waiting_for(later), Duration::from_secs(3));
        assert_eq!(
            job.waiting_for(job.ready_time - chrono::Duration::seconds(1)),
            Duration::ZERO
        );
    }

    #[test]
    fn test_timestamps_serialize_as_millis() {
        let job = Job::new("high", "x").with_id("j1");
        let value = serde_json::to_value(&job).expect("serialization should work");

        assert_eq!(value["id"], "j1");
        assert_eq!(
            value["ready_time"].as_i64(),
            Some(job.ready_time.timestamp_millis())
        );
    }

    #[test]
    fn test_job_accepts_script_rewritten_json() {
        // Scripts re-encode jobs with float-formatted numbers and escaped slashes.
        let raw = r#"{"payload":"a\/b","id":"j9","priority":"low","attempt_count":2,
            "max_attempts":3,"enqueue_time":1700000000000,"ready_time":1700000005000}"#;
        let job: Job = serde_json::from_str(raw).expect("deserialization should work");

        assert_eq!(job.payload, "a/b");
        assert_eq!(job.attempt_count, 2);
        assert_eq!(job.ready_time.timestamp_millis(), 1_700_000_005_000);
    }

    #[test]
    fn test_dead_letter_entry_structure() {
        let entry = DeadLetterEntry {
            job: Job::new("low", "x"),
            error: "boom".to_string(),
            moved_at: Utc::now(),
        };

        let value = serde_json::to_value(&entry).expect("entry should serialize");
        assert!(value.get("job").is_some());
        assert_eq!(value["error"], "boom");
        assert!(value["moved_at"].is_i64());
    }
}

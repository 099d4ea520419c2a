//! Redis-backed lease store.
//!
//! Each operation that spans more than one key runs as a Lua script, so Redis
//! applies it as one indivisible step. Claims prefer the blocking `BLMOVE`
//! primitive; a capability probe at connect time decides, and servers without
//! it get a non-blocking pop-and-stamp script polled until the wait elapses.
//!
//! The processing record is split across two keys: `queue:proc:{w}` is the
//! list `BLMOVE` moves the job into, `queue:proc:{w}:lease` holds
//! `{owner, job_id, lease_expiry}`. Expiry is a field compared by scripts, not
//! a Redis TTL, so a lapsed lease stays visible until it is reclaimed.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use redis::aio::{ConnectionManager, MultiplexedConnection};
use redis::{AsyncCommands, Value};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::keys::KeySpace;
use super::{
    duration_ms, FinishOutcome, IdempotencyState, IdempotencyStatus, JobOutcome, Lease,
    LeaseHandle, LeaseStore, ProcessingRecord, ReclaimOutcome, RenewOutcome,
    LEASE_EXPIRED_ERROR,
};
use crate::error::StoreError;
use crate::scheduler::job::{DeadLetterEntry, Job};

/// Poll interval of the non-blocking claim fallback.
const FALLBACK_POLL: Duration = Duration::from_millis(100);

/// Idle dedicated connections kept for blocking claims.
const MAX_IDLE_BLOCKING: usize = 16;

/// Lua scripts evaluated by the store.
mod scripts {
    use redis::Script;

    /// Non-blocking claim: pop the head of the ready queue into the
    /// processing list, stamp the lease and refresh the registry entry.
    pub fn claim() -> Script {
        Script::new(
            r#"
            -- KEYS: ready, proc, lease, workers
            -- ARGV: worker, now_ms, ttl_ms
            if redis.call('LLEN', KEYS[2]) > 0 then
                return {'held'}
            end
            local raw = redis.call('RPOPLPUSH', KEYS[1], KEYS[2])
            if not raw then
                return {'empty'}
            end
            local ok, job = pcall(cjson.decode, raw)
            local id = ''
            if ok and type(job) == 'table' and job.id then
                id = tostring(job.id)
            end
            local expiry = tonumber(ARGV[2]) + tonumber(ARGV[3])
            redis.call('HSET', KEYS[3], 'owner', ARGV[1], 'job_id', id,
                'lease_expiry', string.format('%.0f', expiry))
            redis.call('ZADD', KEYS[4], ARGV[2], ARGV[1])
            return {'claimed', raw, string.format('%.0f', expiry)}
            "#,
        )
    }

    /// Guard run before a blocking move: refuse if a lease is held and make
    /// sure the worker is registered, so an interrupted claim stays reapable.
    pub fn prepare_blocking_claim() -> Script {
        Script::new(
            r#"
            -- KEYS: proc, workers
            -- ARGV: worker, now_ms
            if redis.call('LLEN', KEYS[1]) > 0 then
                return 0
            end
            redis.call('ZADD', KEYS[2], ARGV[2], ARGV[1])
            return 1
            "#,
        )
    }

    /// Stamps the lease on the job a blocking move just delivered.
    pub fn stamp_lease() -> Script {
        Script::new(
            r#"
            -- KEYS: proc, lease, workers
            -- ARGV: worker, now_ms, ttl_ms
            local raw = redis.call('LINDEX', KEYS[1], 0)
            if not raw then
                return {'empty'}
            end
            local ok, job = pcall(cjson.decode, raw)
            local id = ''
            if ok and type(job) == 'table' and job.id then
                id = tostring(job.id)
            end
            local expiry = tonumber(ARGV[2]) + tonumber(ARGV[3])
            redis.call('HSET', KEYS[2], 'owner', ARGV[1], 'job_id', id,
                'lease_expiry', string.format('%.0f', expiry))
            redis.call('ZADD', KEYS[3], ARGV[2], ARGV[1])
            return {'claimed', raw, string.format('%.0f', expiry)}
            "#,
        )
    }

    /// Extends a lease only if owner and job match and it has not expired.
    pub fn renew() -> Script {
        Script::new(
            r#"
            -- KEYS: lease, workers
            -- ARGV: worker, job_id, now_ms, ttl_ms
            local owner = redis.call('HGET', KEYS[1], 'owner')
            local held = redis.call('HGET', KEYS[1], 'job_id')
            if owner ~= ARGV[1] or held ~= ARGV[2] then
                return {'not_owner'}
            end
            local now = tonumber(ARGV[3])
            local expiry = tonumber(redis.call('HGET', KEYS[1], 'lease_expiry'))
            if not expiry or expiry < now then
                return {'expired'}
            end
            local renewed = now + tonumber(ARGV[4])
            redis.call('HSET', KEYS[1], 'lease_expiry', string.format('%.0f', renewed))
            redis.call('ZADD', KEYS[2], 'XX', ARGV[3], ARGV[1])
            return {'renewed', string.format('%.0f', renewed)}
            "#,
        )
    }

    /// Every way a lease ends: `success`, `failure`, `release` and `reclaim`.
    ///
    /// Ready and scheduled keys are derived from the prefix and the job's own
    /// priority, since the job is only known once the script has read it.
    pub fn finish() -> Script {
        Script::new(
            r#"
            -- KEYS: proc, lease, dlq, workers
            -- ARGV: mode, worker, job_id, now_ms, prefix, error, backoff_ms, stale_before_ms
            local proc, lease, dlq, workers = KEYS[1], KEYS[2], KEYS[3], KEYS[4]
            local mode, worker, job_id = ARGV[1], ARGV[2], ARGV[3]
            local now = tonumber(ARGV[4])
            local prefix = ARGV[5]

            local function retire(raw, err, backoff)
                local job = cjson.decode(raw)
                job.attempt_count = (tonumber(job.attempt_count) or 0) + 1
                if job.attempt_count >= (tonumber(job.max_attempts) or 1) then
                    redis.call('LPUSH', dlq,
                        cjson.encode({job = job, error = err, moved_at = now}))
                    return 'dead_lettered'
                end
                job.ready_time = now + backoff
                local encoded = cjson.encode(job)
                if backoff > 0 then
                    local sched = prefix .. ':sched:' .. job.priority
                    local index = prefix .. ':sched-ids:' .. job.priority
                    local id = tostring(job.id)
                    local previous = redis.call('HGET', index, id)
                    if previous then
                        redis.call('ZREM', sched, previous)
                    end
                    redis.call('ZADD', sched, string.format('%.0f', now + backoff), encoded)
                    redis.call('HSET', index, id, encoded)
                    return 'scheduled'
                end
                redis.call('LPUSH', prefix .. ':ready:' .. job.priority, encoded)
                return 'requeued'
            end

            local raw = redis.call('LINDEX', proc, 0)

            if mode == 'reclaim' then
                local outcome = 'no_lease'
                if raw then
                    local expiry = tonumber(redis.call('HGET', lease, 'lease_expiry'))
                    if expiry and expiry >= now then
                        outcome = 'alive'
                    else
                        outcome = retire(raw, ARGV[6], 0)
                        redis.call('DEL', proc, lease)
                    end
                end
                local seen = redis.call('ZSCORE', workers, worker)
                if seen and tonumber(seen) <= tonumber(ARGV[8]) then
                    redis.call('ZREM', workers, worker)
                end
                return {outcome}
            end

            if mode == 'release' then
                if not raw then
                    return {'none'}
                end
                if job_id ~= '' and redis.call('HGET', lease, 'job_id') ~= job_id then
                    return {'none'}
                end
                local job = cjson.decode(raw)
                redis.call('RPUSH', prefix .. ':ready:' .. job.priority, raw)
                redis.call('DEL', proc, lease)
                return {'released'}
            end

            local owner = redis.call('HGET', lease, 'owner')
            local held = redis.call('HGET', lease, 'job_id')
            if not raw or owner ~= worker or held ~= job_id then
                return {'not_owner'}
            end
            if mode == 'success' then
                redis.call('DEL', proc, lease)
                return {'completed'}
            end
            local outcome = retire(raw, ARGV[6], tonumber(ARGV[7]))
            redis.call('DEL', proc, lease)
            return {outcome}
            "#,
        )
    }

    /// Adds a job to the scheduled set, replacing any entry with the same id.
    pub fn schedule() -> Script {
        Script::new(
            r#"
            -- KEYS: sched, index
            -- ARGV: ready_at_ms, member, job_id
            local previous = redis.call('HGET', KEYS[2], ARGV[3])
            if previous then
                redis.call('ZREM', KEYS[1], previous)
            end
            redis.call('ZADD', KEYS[1], ARGV[1], ARGV[2])
            redis.call('HSET', KEYS[2], ARGV[3], ARGV[2])
            return 1
            "#,
        )
    }

    /// Moves due jobs from the scheduled set to the ready queue, earliest first.
    pub fn promote() -> Script {
        Script::new(
            r#"
            -- KEYS: sched, ready, index
            -- ARGV: now_ms, limit
            local due = redis.call('ZRANGEBYSCORE', KEYS[1], '-inf', ARGV[1],
                'LIMIT', 0, tonumber(ARGV[2]))
            for _, raw in ipairs(due) do
                redis.call('ZREM', KEYS[1], raw)
                local ok, job = pcall(cjson.decode, raw)
                if ok and type(job) == 'table' and job.id then
                    local id = tostring(job.id)
                    if redis.call('HGET', KEYS[3], id) == raw then
                        redis.call('HDEL', KEYS[3], id)
                    end
                end
                redis.call('LPUSH', KEYS[2], raw)
            end
            return #due
            "#,
        )
    }

    pub fn idempotency_begin() -> Script {
        Script::new(
            r#"
            -- KEYS: record
            -- ARGV: ttl_ms
            if redis.call('SET', KEYS[1], 'in_progress', 'NX', 'PX', ARGV[1]) then
                return {'fresh'}
            end
            return {'duplicate', redis.call('GET', KEYS[1]) or ''}
            "#,
        )
    }

    pub fn idempotency_release() -> Script {
        Script::new(
            r#"
            -- KEYS: record
            if redis.call('GET', KEYS[1]) == 'in_progress' then
                return redis.call('DEL', KEYS[1])
            end
            return 0
            "#,
        )
    }
}

struct Scripts {
    claim: redis::Script,
    prepare_blocking_claim: redis::Script,
    stamp_lease: redis::Script,
    renew: redis::Script,
    finish: redis::Script,
    schedule: redis::Script,
    promote: redis::Script,
    idempotency_begin: redis::Script,
    idempotency_release: redis::Script,
}

impl Scripts {
    fn load() -> Self {
        Self {
            claim: scripts::claim(),
            prepare_blocking_claim: scripts::prepare_blocking_claim(),
            stamp_lease: scripts::stamp_lease(),
            renew: scripts::renew(),
            finish: scripts::finish(),
            schedule: scripts::schedule(),
            promote: scripts::promote(),
            idempotency_begin: scripts::idempotency_begin(),
            idempotency_release: scripts::idempotency_release(),
        }
    }
}

/// Arguments of the `finish` script besides the keys.
struct FinishArgs<'a> {
    mode: &'a str,
    worker_id: &'a str,
    job_id: &'a str,
    now_ms: i64,
    error: &'a str,
    backoff_ms: i64,
    stale_before_ms: i64,
}

/// Lease store backed by Redis.
pub struct RedisLeaseStore {
    client: redis::Client,
    /// Shared connection for non-blocking commands (handles reconnection).
    redis: ConnectionManager,
    /// Dedicated connections for `BLMOVE`, which would stall a shared one.
    blocking: Mutex<Vec<MultiplexedConnection>>,
    blocking_move: bool,
    keys: KeySpace,
    scripts: Scripts,
}

impl std::fmt::Debug for RedisLeaseStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisLeaseStore")
            .field("keys", &self.keys)
            .field("blocking_move", &self.blocking_move)
            .finish_non_exhaustive()
    }
}

impl RedisLeaseStore {
    /// Connects to Redis and probes for `BLMOVE`.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::ConnectionFailed` if the connection fails.
    pub async fn connect(redis_url: &str, keys: KeySpace) -> Result<Self, StoreError> {
        let client = redis::Client::open(redis_url)
            .map_err(|e| StoreError::ConnectionFailed(e.to_string()))?;

        let redis = ConnectionManager::new(client.clone())
            .await
            .map_err(|e| StoreError::ConnectionFailed(e.to_string()))?;

        let mut store = Self {
            client,
            redis,
            blocking: Mutex::new(Vec::new()),
            blocking_move: false,
            keys,
            scripts: Scripts::load(),
        };
        store.blocking_move = store.probe_blocking_move().await;
        Ok(store)
    }

    pub fn keys(&self) -> &KeySpace {
        &self.keys
    }

    async fn probe_blocking_move(&self) -> bool {
        let mut conn = self.redis.clone();
        let reply: Result<Value, redis::RedisError> = redis::cmd("COMMAND")
            .arg("INFO")
            .arg("BLMOVE")
            .query_async(&mut conn)
            .await;

        match reply {
            Ok(Value::Bulk(items)) if items.first().is_some_and(|v| !matches!(v, Value::Nil)) => {
                info!("Store supports BLMOVE, claims will block server-side");
                true
            }
            Ok(_) => {
                warn!("Store does not support BLMOVE, falling back to polling claim script");
                false
            }
            Err(e) => {
                warn!(error = %e, "BLMOVE capability probe failed, falling back to polling claim script");
                false
            }
        }
    }

    async fn checkout_blocking(&self) -> Result<MultiplexedConnection, StoreError> {
        if let Some(conn) = self.blocking.lock().await.pop() {
            return Ok(conn);
        }
        debug!("Opening dedicated connection for blocking claims");
        Ok(self.client.get_multiplexed_tokio_connection().await?)
    }

    async fn checkin_blocking(&self, conn: MultiplexedConnection) {
        let mut idle = self.blocking.lock().await;
        if idle.len() < MAX_IDLE_BLOCKING {
            idle.push(conn);
        }
    }

    async fn claim_once(
        &self,
        priority: &str,
        worker_id: &str,
        now_ms: i64,
        ttl_ms: i64,
    ) -> Result<Vec<String>, StoreError> {
        let mut conn = self.redis.clone();
        let reply: Vec<String> = self
            .scripts
            .claim
            .key(self.keys.ready(priority))
            .key(self.keys.processing(worker_id))
            .key(self.keys.lease(worker_id))
            .key(self.keys.workers())
            .arg(worker_id)
            .arg(now_ms)
            .arg(ttl_ms)
            .invoke_async::<_, Vec<String>>(&mut conn)
            .await?;
        Ok(reply)
    }

    async fn claim_polling(
        &self,
        priority: &str,
        worker_id: &str,
        now_ms: i64,
        ttl_ms: i64,
        wait: Duration,
    ) -> Result<Vec<String>, StoreError> {
        let deadline = tokio::time::Instant::now() + wait;
        loop {
            let reply = self.claim_once(priority, worker_id, now_ms, ttl_ms).await?;
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            if reply.first().map(String::as_str) != Some("empty") || remaining.is_zero() {
                return Ok(reply);
            }
            tokio::time::sleep(remaining.min(FALLBACK_POLL)).await;
        }
    }

    async fn claim_blocking(
        &self,
        priority: &str,
        worker_id: &str,
        now_ms: i64,
        ttl_ms: i64,
        wait: Duration,
    ) -> Result<Vec<String>, StoreError> {
        let processing = self.keys.processing(worker_id);
        let workers = self.keys.workers();
        let mut conn = self.redis.clone();

        let prepared: i64 = self
            .scripts
            .prepare_blocking_claim
            .key(&processing)
            .key(&workers)
            .arg(worker_id)
            .arg(now_ms)
            .invoke_async::<_, i64>(&mut conn)
            .await?;
        if prepared == 0 {
            return Ok(vec!["held".to_string()]);
        }

        let mut blocking = self.checkout_blocking().await?;
        // BLMOVE treats a zero timeout as "forever".
        let timeout_secs = wait.as_secs_f64().max(0.01);
        let moved: Option<String> = redis::cmd("BLMOVE")
            .arg(self.keys.ready(priority))
            .arg(&processing)
            .arg("RIGHT")
            .arg("LEFT")
            .arg(timeout_secs)
            .query_async(&mut blocking)
            .await?;
        self.checkin_blocking(blocking).await;

        if moved.is_none() {
            return Ok(vec!["empty".to_string()]);
        }

        let reply: Vec<String> = self
            .scripts
            .stamp_lease
            .key(&processing)
            .key(self.keys.lease(worker_id))
            .key(&workers)
            .arg(worker_id)
            .arg(now_ms)
            .arg(ttl_ms)
            .invoke_async::<_, Vec<String>>(&mut conn)
            .await?;
        Ok(reply)
    }

    fn parse_claim(reply: &[String], worker_id: &str) -> Result<Option<Lease>, StoreError> {
        match reply.first().map(String::as_str) {
            Some("claimed") => {
                let raw = reply
                    .get(1)
                    .ok_or_else(|| StoreError::UnexpectedReply("claim reply without job".into()))?;
                let expires_at_ms = reply
                    .get(2)
                    .and_then(|s| s.parse::<i64>().ok())
                    .ok_or_else(|| {
                        StoreError::UnexpectedReply("claim reply without expiry".into())
                    })?;
                let job: Job = serde_json::from_str(raw)?;
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
            Some("empty") => Ok(None),
            Some("held") => Err(StoreError::LeaseHeld(worker_id.to_string())),
            other => Err(StoreError::UnexpectedReply(format!(
                "claim returned {other:?}"
            ))),
        }
    }

    async fn run_finish(&self, args: FinishArgs<'_>) -> Result<String, StoreError> {
        let mut conn = self.redis.clone();
        let reply: Vec<String> = self
            .scripts
            .finish
            .key(self.keys.processing(args.worker_id))
            .key(self.keys.lease(args.worker_id))
            .key(self.keys.dead_letter())
            .key(self.keys.workers())
            .arg(args.mode)
            .arg(args.worker_id)
            .arg(args.job_id)
            .arg(args.now_ms)
            .arg(self.keys.prefix())
            .arg(args.error)
            .arg(args.backoff_ms)
            .arg(args.stale_before_ms)
            .invoke_async::<_, Vec<String>>(&mut conn)
            .await?;
        reply
            .into_iter()
            .next()
            .ok_or_else(|| StoreError::UnexpectedReply("empty finish reply".into()))
    }
}

#[async_trait]
impl LeaseStore for RedisLeaseStore {
    async fn push_ready(&self, job: &Job) -> Result<(), StoreError> {
        let serialized = serde_json::to_string(job)?;
        let mut conn = self.redis.clone();
        conn.lpush::<_, _, ()>(self.keys.ready(&job.priority), serialized)
            .await?;
        Ok(())
    }

    async fn push_ready_many(&self, jobs: &[Job]) -> Result<(), StoreError> {
        if jobs.is_empty() {
            return Ok(());
        }

        let mut pipe = redis::pipe();
        for job in jobs {
            pipe.lpush(self.keys.ready(&job.priority), serde_json::to_string(job)?)
                .ignore();
        }
        let mut conn = self.redis.clone();
        pipe.query_async::<_, ()>(&mut conn).await?;
        Ok(())
    }

    async fn schedule(&self, job: &Job, ready_at_ms: i64) -> Result<(), StoreError> {
        let serialized = serde_json::to_string(job)?;
        let mut conn = self.redis.clone();
        self.scripts
            .schedule
            .key(self.keys.scheduled(&job.priority))
            .key(self.keys.scheduled_index(&job.priority))
            .arg(ready_at_ms)
            .arg(serialized)
            .arg(&job.id)
            .invoke_async::<_, i64>(&mut conn)
            .await?;
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
        let ttl_ms = duration_ms(ttl);
        let reply = match wait {
            Some(wait) if !wait.is_zero() && self.blocking_move => {
                self.claim_blocking(priority, worker_id, now_ms, ttl_ms, wait)
                    .await?
            }
            Some(wait) if !wait.is_zero() => {
                self.claim_polling(priority, worker_id, now_ms, ttl_ms, wait)
                    .await?
            }
            _ => self.claim_once(priority, worker_id, now_ms, ttl_ms).await?,
        };
        Self::parse_claim(&reply, worker_id)
    }

    async fn renew(
        &self,
        handle: &LeaseHandle,
        now_ms: i64,
        ttl: Duration,
    ) -> Result<RenewOutcome, StoreError> {
        let mut conn = self.redis.clone();
        let reply: Vec<String> = self
            .scripts
            .renew
            .key(self.keys.lease(&handle.worker_id))
            .key(self.keys.workers())
            .arg(&handle.worker_id)
            .arg(&handle.job_id)
            .arg(now_ms)
            .arg(duration_ms(ttl))
            .invoke_async::<_, Vec<String>>(&mut conn)
            .await?;

        match reply.first().map(String::as_str) {
            Some("renewed") => {
                let expires_at_ms = reply
                    .get(1)
                    .and_then(|s| s.parse::<i64>().ok())
                    .ok_or_else(|| {
                        StoreError::UnexpectedReply("renew reply without expiry".into())
                    })?;
                Ok(RenewOutcome::Renewed { expires_at_ms })
            }
            Some("not_owner") => Ok(RenewOutcome::NotOwner),
            Some("expired") => Ok(RenewOutcome::Expired),
            other => Err(StoreError::UnexpectedReply(format!(
                "renew returned {other:?}"
            ))),
        }
    }

    async fn finish(
        &self,
        handle: &LeaseHandle,
        outcome: &JobOutcome,
        now_ms: i64,
    ) -> Result<FinishOutcome, StoreError> {
        let (mode, error, backoff_ms) = match outcome {
            JobOutcome::Success => ("success", "", 0),
            JobOutcome::Failure { error, backoff } => {
                ("failure", error.as_str(), duration_ms(*backoff))
            }
        };
        let reply = self
            .run_finish(FinishArgs {
                mode,
                worker_id: &handle.worker_id,
                job_id: &handle.job_id,
                now_ms,
                error,
                backoff_ms,
                stale_before_ms: 0,
            })
            .await?;

        match reply.as_str() {
            "completed" => Ok(FinishOutcome::Completed),
            "requeued" => Ok(FinishOutcome::Requeued),
            "scheduled" => Ok(FinishOutcome::Scheduled),
            "dead_lettered" => Ok(FinishOutcome::DeadLettered),
            "not_owner" => Ok(FinishOutcome::NotOwner),
            other => Err(StoreError::UnexpectedReply(format!(
                "finish returned '{other}'"
            ))),
        }
    }

    async fn release(&self, worker_id: &str, job_id: Option<&str>) -> Result<bool, StoreError> {
        let reply = self
            .run_finish(FinishArgs {
                mode: "release",
                worker_id,
                job_id: job_id.unwrap_or(""),
                now_ms: 0,
                error: "",
                backoff_ms: 0,
                stale_before_ms: 0,
            })
            .await?;
        Ok(reply == "released")
    }

    async fn reclaim(
        &self,
        worker_id: &str,
        now_ms: i64,
        stale_before_ms: i64,
    ) -> Result<ReclaimOutcome, StoreError> {
        let reply = self
            .run_finish(FinishArgs {
                mode: "reclaim",
                worker_id,
                job_id: "",
                now_ms,
                error: LEASE_EXPIRED_ERROR,
                backoff_ms: 0,
                stale_before_ms,
            })
            .await?;

        match reply.as_str() {
            "no_lease" => Ok(ReclaimOutcome::NoLease),
            "alive" => Ok(ReclaimOutcome::Alive),
            "requeued" => Ok(ReclaimOutcome::Requeued),
            "scheduled" => Ok(ReclaimOutcome::Scheduled),
            "dead_lettered" => Ok(ReclaimOutcome::DeadLettered),
            other => Err(StoreError::UnexpectedReply(format!(
                "reclaim returned '{other}'"
            ))),
        }
    }

    async fn promote(&self, priority: &str, now_ms: i64, limit: usize) -> Result<usize, StoreError> {
        if limit == 0 {
            return Ok(0);
        }
        let mut conn = self.redis.clone();
        let moved: usize = self
            .scripts
            .promote
            .key(self.keys.scheduled(priority))
            .key(self.keys.ready(priority))
            .key(self.keys.scheduled_index(priority))
            .arg(now_ms)
            .arg(limit)
            .invoke_async::<_, usize>(&mut conn)
            .await?;
        Ok(moved)
    }

    async fn touch_worker(&self, worker_id: &str, now_ms: i64) -> Result<(), StoreError> {
        let mut conn = self.redis.clone();
        redis::cmd("ZADD")
            .arg(self.keys.workers())
            .arg(now_ms)
            .arg(worker_id)
            .query_async::<_, ()>(&mut conn)
            .await?;
        Ok(())
    }

    async fn remove_worker(&self, worker_id: &str) -> Result<(), StoreError> {
        let mut conn = self.redis.clone();
        conn.zrem::<_, _, ()>(self.keys.workers(), worker_id).await?;
        Ok(())
    }

    async fn stale_workers(&self, cutoff_ms: i64, limit: usize) -> Result<Vec<String>, StoreError> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        let mut conn = self.redis.clone();
        let stale: Vec<String> = redis::cmd("ZRANGEBYSCORE")
            .arg(self.keys.workers())
            .arg("-inf")
            .arg(cutoff_ms)
            .arg("LIMIT")
            .arg(0)
            .arg(limit)
            .query_async(&mut conn)
            .await?;
        Ok(stale)
    }

    async fn count_workers(&self, since_ms: i64) -> Result<usize, StoreError> {
        let mut conn = self.redis.clone();
        let count: usize = redis::cmd("ZCOUNT")
            .arg(self.keys.workers())
            .arg(format!("({since_ms}"))
            .arg("+inf")
            .query_async(&mut conn)
            .await?;
        Ok(count)
    }

    async fn idempotency_begin(
        &self,
        key: &str,
        _now_ms: i64,
        ttl: Duration,
    ) -> Result<IdempotencyStatus, StoreError> {
        let mut conn = self.redis.clone();
        let reply: Vec<String> = self
            .scripts
            .idempotency_begin
            .key(self.keys.idempotency(key))
            .arg(duration_ms(ttl).max(1))
            .invoke_async::<_, Vec<String>>(&mut conn)
            .await?;

        match reply.first().map(String::as_str) {
            Some("fresh") => Ok(IdempotencyStatus::Fresh),
            Some("duplicate") => {
                // The record may expire between SET and GET; treat that as in progress.
                let state = match reply.get(1).map(String::as_str) {
                    Some("") | None => IdempotencyState::InProgress,
                    Some(raw) => IdempotencyState::parse(raw)?,
                };
                Ok(IdempotencyStatus::Duplicate(state))
            }
            other => Err(StoreError::UnexpectedReply(format!(
                "idempotency begin returned {other:?}"
            ))),
        }
    }

    async fn idempotency_end(
        &self,
        key: &str,
        _now_ms: i64,
        ttl: Duration,
    ) -> Result<(), StoreError> {
        let mut conn = self.redis.clone();
        redis::cmd("SET")
            .arg(self.keys.idempotency(key))
            .arg(IdempotencyState::Done.as_str())
            .arg("PX")
            .arg(duration_ms(ttl).max(1))
            .query_async::<_, ()>(&mut conn)
            .await?;
        Ok(())
    }

    async fn idempotency_release(&self, key: &str, _now_ms: i64) -> Result<bool, StoreError> {
        let mut conn = self.redis.clone();
        let deleted: i64 = self
            .scripts
            .idempotency_release
            .key(self.keys.idempotency(key))
            .invoke_async::<_, i64>(&mut conn)
            .await?;
        Ok(deleted > 0)
    }

    async fn ready_depth(&self, priority: &str) -> Result<usize, StoreError> {
        let mut conn = self.redis.clone();
        let len: usize = conn.llen(self.keys.ready(priority)).await?;
        Ok(len)
    }

    async fn peek_ready(&self, priority: &str, limit: usize) -> Result<Vec<Job>, StoreError> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        let mut conn = self.redis.clone();
        let start = -(limit.min(isize::MAX as usize) as isize);
        let data: Vec<String> = conn.lrange(self.keys.ready(priority), start, -1).await?;

        // The head of the queue is the last element.
        data.iter()
            .rev()
            .map(|s| serde_json::from_str(s).map_err(StoreError::from))
            .collect()
    }

    async fn scheduled_depth(&self, priority: &str) -> Result<usize, StoreError> {
        let mut conn = self.redis.clone();
        let len: usize = conn.zcard(self.keys.scheduled(priority)).await?;
        Ok(len)
    }

    async fn peek_scheduled(
        &self,
        priority: &str,
        limit: usize,
    ) -> Result<Vec<(Job, i64)>, StoreError> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        let mut conn = self.redis.clone();
        let data: Vec<(String, f64)> = redis::cmd("ZRANGE")
            .arg(self.keys.scheduled(priority))
            .arg(0)
            .arg(limit.saturating_sub(1))
            .arg("WITHSCORES")
            .query_async(&mut conn)
            .await?;

        data.iter()
            .map(|(raw, score)| Ok((serde_json::from_str::<Job>(raw)?, *score as i64)))
            .collect()
    }

    async fn processing_record(
        &self,
        worker_id: &str,
    ) -> Result<Option<ProcessingRecord>, StoreError> {
        let mut conn = self.redis.clone();
        let (raw, lease): (Option<String>, HashMap<String, String>) = redis::pipe()
            .cmd("LINDEX")
            .arg(self.keys.processing(worker_id))
            .arg(0)
            .cmd("HGETALL")
            .arg(self.keys.lease(worker_id))
            .query_async(&mut conn)
            .await?;

        let Some(raw) = raw else {
            return Ok(None);
        };
        let job: Job = serde_json::from_str(&raw)?;
        Ok(Some(ProcessingRecord {
            owner: lease.get("owner").cloned().unwrap_or_default(),
            job_id: lease.get("job_id").cloned().unwrap_or_default(),
            lease_expiry_ms: lease
                .get("lease_expiry")
                .and_then(|s| s.parse().ok())
                .unwrap_or(0),
            job,
        }))
    }

    async fn dead_letter_depth(&self) -> Result<usize, StoreError> {
        let mut conn = self.redis.clone();
        let len: usize = conn.llen(self.keys.dead_letter()).await?;
        Ok(len)
    }

    async fn peek_dead_letter(&self, limit: usize) -> Result<Vec<DeadLetterEntry>, StoreError> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        let end = isize::try_from(limit).unwrap_or(isize::MAX) - 1;
        let mut conn = self.redis.clone();
        let data: Vec<String> = conn.lrange(self.keys.dead_letter(), 0, end).await?;

        data.iter()
            .map(|s| serde_json::from_str(s).map_err(StoreError::from))
            .collect()
    }

    async fn purge_dead_letter(&self) -> Result<usize, StoreError> {
        let mut conn = self.redis.clone();
        let (purged, _): (usize, i64) = redis::pipe()
            .atomic()
            .llen(self.keys.dead_letter())
            .del(self.keys.dead_letter())
            .query_async(&mut conn)
            .await?;
        Ok(purged)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reply(parts: &[&str]) -> Vec<String> {
        parts.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_parse_claimed_reply() {
        let job = Job::new("high", "payload").with_id("j1");
        let raw = serde_json::to_string(&job).expect("serialize");
        let parsed = RedisLeaseStore::parse_claim(&reply(&["claimed", &raw, "1700000030000"]), "w1")
            .expect("parse")
            .expect("lease");

        assert_eq!(parsed.job.id, "j1");
        assert_eq!(parsed.handle.worker_id, "w1");
        assert_eq!(parsed.handle.priority, "high");
        assert_eq!(parsed.expires_at_ms, 1_700_000_030_000);
    }

    #[test]
    fn test_parse_empty_and_held_replies() {
        assert!(RedisLeaseStore::parse_claim(&reply(&["empty"]), "w1")
            .expect("parse")
            .is_none());
        assert!(matches!(
            RedisLeaseStore::parse_claim(&reply(&["held"]), "w1"),
            Err(StoreError::LeaseHeld(_))
        ));
        assert!(matches!(
            RedisLeaseStore::parse_claim(&reply(&["claimed"]), "w1"),
            Err(StoreError::UnexpectedReply(_))
        ));
    }

    #[test]
    fn test_script_hashes_are_distinct() {
        let scripts = Scripts::load();
        let hashes = [
            scripts.claim.get_hash(),
            scripts.prepare_blocking_claim.get_hash(),
            scripts.stamp_lease.get_hash(),
            scripts.renew.get_hash(),
            scripts.finish.get_hash(),
            scripts.promote.get_hash(),
            scripts.idempotency_begin.get_hash(),
            scripts.idempotency_release.get_hash(),
        ];
        let unique: std::collections::HashSet<_> = hashes.iter().collect();
        assert_eq!(unique.len(), hashes.len());
        assert_eq!(scripts::finish().get_hash(), scripts.finish.get_hash());
    }
}

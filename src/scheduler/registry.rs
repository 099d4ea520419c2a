//! Worker registry.
//!
//! Every live worker keeps an entry in a sorted set scored by its last-seen
//! time. Claims and renewals refresh the entry as a side effect, and a
//! background heartbeat refreshes it while the worker is idle. The reaper
//! reads the stale end of the set.

use std::sync::Arc;
use std::time::Duration;

use rand::RngExt;
use tracing::{debug, info};

use crate::clock::Clock;
use crate::error::StoreError;
use crate::store::{duration_ms, LeaseStore};

/// Registry operations for one store and clock.
#[derive(Clone)]
pub struct WorkerRegistry {
    store: Arc<dyn LeaseStore>,
    clock: Arc<dyn Clock>,
}

impl std::fmt::Debug for WorkerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerRegistry").finish_non_exhaustive()
    }
}

impl WorkerRegistry {
    pub fn new(store: Arc<dyn LeaseStore>, clock: Arc<dyn Clock>) -> Self {
        Self { store, clock }
    }

    /// Adds the worker with the current time as its last-seen time.
    pub async fn register(&self, worker_id: &str) -> Result<(), StoreError> {
        self.store.touch_worker(worker_id, self.clock.now_ms()).await?;
        info!(worker_id = %worker_id, "Worker registered");
        Ok(())
    }

    /// Refreshes the worker's last-seen time.
    pub async fn heartbeat(&self, worker_id: &str) -> Result<(), StoreError> {
        self.store.touch_worker(worker_id, self.clock.now_ms()).await
    }

    pub async fn deregister(&self, worker_id: &str) -> Result<(), StoreError> {
        self.store.remove_worker(worker_id).await?;
        debug!(worker_id = %worker_id, "Worker deregistered");
        Ok(())
    }

    /// Workers last seen at or before `cutoff_ms`, oldest first.
    pub async fn stale(&self, cutoff_ms: i64, limit: usize) -> Result<Vec<String>, StoreError> {
        self.store.stale_workers(cutoff_ms, limit).await
    }

    /// Workers seen within `liveness_timeout`.
    pub async fn live_count(&self, liveness_timeout: Duration) -> Result<usize, StoreError> {
        let since = self.clock.now_ms().saturating_sub(duration_ms(liveness_timeout));
        self.store.count_workers(since).await
    }
}

/// Builds a worker id unique across processes: `{host}-{pid}-{nonce}-{index}`.
pub fn generate_worker_id(index: usize) -> String {
    let host = hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .filter(|h| !h.is_empty())
        .unwrap_or_else(|| "unknown".to_string());
    let host: String = host
        .chars()
        .map(|c| if c == ':' || c.is_whitespace() { '_' } else { c })
        .collect();
    let nonce: u32 = rand::rng().random_range(0..=0xffff);
    format!("{}-{}-{:04x}-{}", host, std::process::id(), nonce, index)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::store::MemoryLeaseStore;

    #[test]
    fn test_worker_ids_are_distinct() {
        let a = generate_worker_id(0);
        let b = generate_worker_id(1);
        assert_ne!(a, b);
        assert!(a.ends_with("-0"));
        assert!(!a.contains(':'));
        assert!(a.contains(&std::process::id().to_string()));
    }

    #[tokio::test]
    async fn test_stale_and_live_counts() {
        let store = Arc::new(MemoryLeaseStore::new());
        let clock = Arc::new(ManualClock::starting_now());
        let registry = WorkerRegistry::new(store, clock.clone());

        registry.register("old").await.expect("register");
        clock.advance(Duration::from_secs(90));
        registry.register("fresh").await.expect("register");

        let cutoff = clock.now_ms() - 60_000;
        let stale = registry.stale(cutoff, 10).await.expect("stale");
        assert_eq!(stale, vec!["old".to_string()]);
        assert_eq!(
            registry.live_count(Duration::from_secs(60)).await.expect("count"),
            1
        );

        registry.heartbeat("old").await.expect("heartbeat");
        assert!(registry.stale(cutoff, 10).await.expect("stale").is_empty());

        registry.deregister("old").await.expect("deregister");
        assert_eq!(
            registry.live_count(Duration::from_secs(60)).await.expect("count"),
            1
        );
    }
}

//! Key layout in the backing store.
//!
//! For a namespace `queue`, priority `p` and worker `w`:
//!
//! - `queue:ready:{p}`: ready queue (list; LPUSH to enqueue, RPOP end is the head)
//! - `queue:sched:{p}`: scheduled set (sorted set scored by ready time in epoch ms)
//! - `queue:sched-ids:{p}`: job id to scheduled member (hash), one entry per id
//! - `queue:proc:{w}`: processing list holding the single job leased by `w`
//! - `queue:proc:{w}:lease`: lease hash `{owner, job_id, lease_expiry}`
//! - `queue:workers`: worker registry (sorted set scored by last-seen epoch ms)
//! - `queue:dlq`: dead-letter queue (list, newest first)
//! - `idem:{key}`: idempotency record (string `in_progress` | `done` with PX expiry)

/// Builds every key the engine touches from two prefixes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeySpace {
    namespace: String,
    idempotency_namespace: String,
}

impl KeySpace {
    pub fn new(namespace: impl Into<String>, idempotency_namespace: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            idempotency_namespace: idempotency_namespace.into(),
        }
    }

    /// Queue key prefix. Scripts derive ready/scheduled keys from it.
    pub fn prefix(&self) -> &str {
        &self.namespace
    }

    pub fn ready(&self, priority: &str) -> String {
        format!("{}:ready:{}", self.namespace, priority)
    }

    pub fn scheduled(&self, priority: &str) -> String {
        format!("{}:sched:{}", self.namespace, priority)
    }

    pub fn scheduled_index(&self, priority: &str) -> String {
        format!("{}:sched-ids:{}", self.namespace, priority)
    }

    pub fn processing(&self, worker_id: &str) -> String {
        format!("{}:proc:{}", self.namespace, worker_id)
    }

    pub fn lease(&self, worker_id: &str) -> String {
        format!("{}:proc:{}:lease", self.namespace, worker_id)
    }

    pub fn workers(&self) -> String {
        format!("{}:workers", self.namespace)
    }

    pub fn dead_letter(&self) -> String {
        format!("{}:dlq", self.namespace)
    }

    pub fn idempotency(&self, key: &str) -> String {
        format!("{}:{}", self.idempotency_namespace, key)
    }
}

impl Default for KeySpace {
    fn default() -> Self {
        Self::new("queue", "idem")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_layout() {
        let keys = KeySpace::default();
        assert_eq!(keys.ready("high"), "queue:ready:high");
        assert_eq!(keys.scheduled("low"), "queue:sched:low");
        assert_eq!(keys.scheduled_index("low"), "queue:sched-ids:low");
        assert_eq!(keys.processing("w-1"), "queue:proc:w-1");
        assert_eq!(keys.lease("w-1"), "queue:proc:w-1:lease");
        assert_eq!(keys.workers(), "queue:workers");
        assert_eq!(keys.dead_letter(), "queue:dlq");
        assert_eq!(keys.idempotency("j1"), "idem:j1");
    }

    #[test]
    fn test_custom_namespace() {
        let keys = KeySpace::new("jobs", "dedup");
        assert_eq!(keys.prefix(), "jobs");
        assert_eq!(keys.ready("p"), "jobs:ready:p");
        assert_eq!(keys.idempotency("k"), "dedup:k");
    }
}

//! Idempotent completion gate.
//!
//! Before a handler runs, the gate creates an `in_progress` record for the
//! job's key. A redelivered job whose record exists is a duplicate and its
//! handler is skipped. The record lives for a bounded TTL: a worker that dies
//! between `begin` and the end of the handler leaves the record in progress
//! until it expires, after which a redelivery is treated as fresh again. The
//! TTL is the size of that risk window, not a permanent dedup horizon.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};

use crate::clock::Clock;
use crate::config::IdempotencyConfig;
use crate::error::StoreError;
use crate::metrics::MetricsCollector;
use crate::store::{IdempotencyState, IdempotencyStatus, LeaseStore};

/// Result of [`IdempotencyGate::begin`].
#[derive(Debug)]
pub enum GateDecision {
    /// Run the handler; finish the guard when it returns.
    Fresh(CompletionGuard),
    /// A record already exists; the handler must not run.
    Duplicate(IdempotencyState),
}

/// Gate over the idempotency records of one store.
#[derive(Clone)]
pub struct IdempotencyGate {
    store: Arc<dyn LeaseStore>,
    clock: Arc<dyn Clock>,
    ttl: Duration,
    enabled: bool,
    metrics: MetricsCollector,
}

impl std::fmt::Debug for IdempotencyGate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IdempotencyGate")
            .field("ttl", &self.ttl)
            .field("enabled", &self.enabled)
            .finish_non_exhaustive()
    }
}

impl IdempotencyGate {
    pub fn new(
        store: Arc<dyn LeaseStore>,
        clock: Arc<dyn Clock>,
        config: &IdempotencyConfig,
    ) -> Self {
        Self {
            store,
            clock,
            ttl: Duration::from_millis(config.ttl_ms),
            enabled: config.enabled,
            metrics: MetricsCollector::new(),
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Claims the side effects for `key`.
    ///
    /// With the gate disabled every call is `Fresh` and the guard does nothing.
    pub async fn begin(&self, key: &str) -> Result<GateDecision, StoreError> {
        if !self.enabled {
            return Ok(GateDecision::Fresh(CompletionGuard::disarmed(self)));
        }
        match self
            .store
            .idempotency_begin(key, self.clock.now_ms(), self.ttl)
            .await?
        {
            IdempotencyStatus::Fresh => Ok(GateDecision::Fresh(CompletionGuard {
                store: Arc::clone(&self.store),
                clock: Arc::clone(&self.clock),
                ttl: self.ttl,
                key: Some(key.to_string()),
            })),
            IdempotencyStatus::Duplicate(state) => {
                self.metrics.record_duplicate();
                debug!(key = %key, state = state.as_str(), "Duplicate delivery suppressed");
                Ok(GateDecision::Duplicate(state))
            }
        }
    }
}

/// Owns an `in_progress` record until the handler's side effects are done.
///
/// [`complete`](Self::complete) marks the record `done`;
/// [`abandon`](Self::abandon) deletes it so a retry can run. Dropping an
/// unfinished guard abandons the record in the background.
pub struct CompletionGuard {
    store: Arc<dyn LeaseStore>,
    clock: Arc<dyn Clock>,
    ttl: Duration,
    key: Option<String>,
}

impl std::fmt::Debug for CompletionGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompletionGuard")
            .field("key", &self.key)
            .finish_non_exhaustive()
    }
}

impl CompletionGuard {
    fn disarmed(gate: &IdempotencyGate) -> Self {
        Self {
            store: Arc::clone(&gate.store),
            clock: Arc::clone(&gate.clock),
            ttl: gate.ttl,
            key: None,
        }
    }

    pub fn key(&self) -> Option<&str> {
        self.key.as_deref()
    }

    /// Marks the record `done` with a fresh TTL.
    pub async fn complete(mut self) -> Result<(), StoreError> {
        let Some(key) = self.key.take() else {
            return Ok(());
        };
        self.store
            .idempotency_end(&key, self.clock.now_ms(), self.ttl)
            .await
    }

    /// Deletes the record if it is still `in_progress`.
    pub async fn abandon(mut self) -> Result<bool, StoreError> {
        let Some(key) = self.key.take() else {
            return Ok(false);
        };
        self.store
            .idempotency_release(&key, self.clock.now_ms())
            .await
    }
}

impl Drop for CompletionGuard {
    fn drop(&mut self) {
        let Some(key) = self.key.take() else {
            return;
        };
        let store = Arc::clone(&self.store);
        let now = self.clock.now_ms();
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                runtime.spawn(async move {
                    if let Err(e) = store.idempotency_release(&key, now).await {
                        warn!(key = %key, error = %e, "Failed to release idempotency record");
                    }
                });
            }
            Err(_) => {
                warn!(key = %key, "Idempotency record left in progress until its TTL");
            }
        }
    }
}

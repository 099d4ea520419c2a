//! Priority fairness scheduler.
//!
//! Deterministic weighted round-robin over the configured priorities. Each
//! priority holds a token counter starting at its weight; a claim from a
//! priority spends one token, and once every counter is zero all of them are
//! reset together. With weights 8:2:1 and every queue non-empty the claim
//! sequence is eight high, two medium, one low, repeating, so low is served at
//! least once in any eleven consecutive claims.
//!
//! Priorities whose queue is empty are skipped within the same fetch, so an
//! idle high-priority queue never holds up draining the others.

use std::time::Duration;

use tracing::debug;

use super::lease::LeaseManager;
use crate::config::PriorityWeight;
use crate::error::{ConfigError, StoreError};
use crate::store::Lease;

#[derive(Debug, Clone, PartialEq, Eq)]
struct TokenBucket {
    name: String,
    weight: u32,
    tokens: u32,
}

/// Per-worker weighted round-robin state. Not shared and not persisted.
#[derive(Debug, Clone)]
pub struct FairnessScheduler {
    buckets: Vec<TokenBucket>,
}

impl FairnessScheduler {
    /// Builds the scheduler in declared order.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::InvalidWeight` for a zero or negative weight and
    /// `ConfigError::DuplicatePriority` for a repeated name.
    pub fn new(priorities: &[PriorityWeight]) -> Result<Self, ConfigError> {
        if priorities.is_empty() {
            return Err(ConfigError::invalid("priorities", "must be non-empty"));
        }
        let mut buckets: Vec<TokenBucket> = Vec::with_capacity(priorities.len());
        for p in priorities {
            let weight = u32::try_from(p.weight)
                .ok()
                .filter(|w| *w > 0)
                .ok_or_else(|| ConfigError::InvalidWeight {
                    name: p.name.clone(),
                    weight: p.weight,
                })?;
            if buckets.iter().any(|b| b.name == p.name) {
                return Err(ConfigError::DuplicatePriority(p.name.clone()));
            }
            buckets.push(TokenBucket {
                name: p.name.clone(),
                weight,
                tokens: weight,
            });
        }
        Ok(Self { buckets })
    }

    /// Priorities with tokens left, in declared order.
    pub fn candidates(&self) -> Vec<String> {
        self.buckets
            .iter()
            .filter(|b| b.tokens > 0)
            .map(|b| b.name.clone())
            .collect()
    }

    /// Spends one token of `priority`, resetting every bucket once all are empty.
    pub fn record_claim(&mut self, priority: &str) {
        if let Some(bucket) = self.buckets.iter_mut().find(|b| b.name == priority) {
            bucket.tokens = bucket.tokens.saturating_sub(1);
        }
        if self.buckets.iter().all(|b| b.tokens == 0) {
            self.refill();
        }
    }

    /// Resets every bucket to its weight.
    pub fn refill(&mut self) {
        for bucket in &mut self.buckets {
            bucket.tokens = bucket.weight;
        }
    }

    pub fn tokens(&self, priority: &str) -> Option<u32> {
        self.buckets
            .iter()
            .find(|b| b.name == priority)
            .map(|b| b.tokens)
    }

    /// Length of one full cycle (the sum of weights).
    pub fn cycle_len(&self) -> u32 {
        self.buckets.iter().map(|b| b.weight).sum()
    }

    fn has_exhausted(&self) -> bool {
        self.buckets.iter().any(|b| b.tokens == 0)
    }

    /// Claims the next job according to the token state.
    ///
    /// Scans priorities with tokens in declared order without blocking. If all
    /// of them are empty while some priority is out of tokens, the buckets are
    /// refilled and the scan repeats, so work is never left waiting behind an
    /// empty queue. If nothing is ready at all, blocks up to `wait` on the
    /// first candidate.
    pub async fn claim_next(
        &mut self,
        leases: &LeaseManager,
        worker_id: &str,
        wait: Duration,
    ) -> Result<Option<Lease>, StoreError> {
        if let Some(lease) = self.scan(leases, worker_id).await? {
            return Ok(Some(lease));
        }

        if self.has_exhausted() {
            debug!(worker_id = %worker_id, "Priorities with tokens are empty, refilling");
            self.refill();
            if let Some(lease) = self.scan(leases, worker_id).await? {
                return Ok(Some(lease));
            }
        }

        if wait.is_zero() {
            return Ok(None);
        }
        let Some(first) = self.candidates().into_iter().next() else {
            return Ok(None);
        };
        let lease = leases.claim(&first, worker_id, Some(wait)).await?;
        if lease.is_some() {
            self.record_claim(&first);
        }
        Ok(lease)
    }

    async fn scan(
        &mut self,
        leases: &LeaseManager,
        worker_id: &str,
    ) -> Result<Option<Lease>, StoreError> {
        for priority in self.candidates() {
            if let Some(lease) = leases.claim(&priority, worker_id, None).await? {
                self.record_claim(&priority);
                return Ok(Some(lease));
            }
        }
        Ok(None)
    }
}

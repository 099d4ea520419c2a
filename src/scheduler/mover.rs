//! Scheduled job mover.
//!
//! Promotes due jobs from each priority's scheduled set to its ready queue.
//! The promotion is a single store operation per priority, so several movers
//! may tick concurrently without promoting a job twice.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

use super::retry::{with_backoff, RetryPolicy};
use crate::clock::Clock;
use crate::config::QueueConfig;
use crate::error::StoreError;
use crate::metrics::MetricsCollector;
use crate::store::LeaseStore;

pub struct ScheduledMover {
    store: Arc<dyn LeaseStore>,
    clock: Arc<dyn Clock>,
    priorities: Vec<String>,
    tick_interval: Duration,
    batch_limit: usize,
    retry: RetryPolicy,
    metrics: MetricsCollector,
}

impl ScheduledMover {
    pub fn new(store: Arc<dyn LeaseStore>, clock: Arc<dyn Clock>, config: &QueueConfig) -> Self {
        Self {
            store,
            clock,
            priorities: config.priority_names(),
            tick_interval: Duration::from_millis(config.mover.tick_interval_ms),
            batch_limit: config.mover.batch_limit,
            retry: RetryPolicy::for_store(&config.store_retry),
            metrics: MetricsCollector::new(),
        }
    }

    /// Promotes due jobs of every priority, up to the batch limit each.
    ///
    /// Returns the total moved. A backlog larger than the limit drains over
    /// the following ticks.
    ///
    /// Transient store errors are retried with backoff. A priority that still
    /// fails does not hold up the others; the first such error is returned
    /// once every priority has been tried.
    pub async fn tick(&self) -> Result<usize, StoreError> {
        let now = self.clock.now_ms();
        let mut total = 0;
        let mut first_error = None;
        for priority in &self.priorities {
            let promoted = with_backoff(&self.retry, "promote", || {
                self.store.promote(priority, now, self.batch_limit)
            })
            .await;
            match promoted {
                Ok(moved) => {
                    if moved > 0 {
                        debug!(priority = %priority, moved = moved, "Promoted scheduled jobs");
                        self.metrics.record_promoted(priority, moved);
                    }
                    total += moved;
                }
                Err(e) => {
                    warn!(priority = %priority, error = %e, "Promotion failed");
                    first_error.get_or_insert(e);
                }
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(total),
        }
    }

    /// Ticks every `tick_interval` until `shutdown` fires.
    pub async fn run(self, mut shutdown: broadcast::Receiver<()>) {
        info!(
            interval_ms = self.tick_interval.as_millis() as u64,
            batch_limit = self.batch_limit,
            "Scheduled mover started"
        );
        let mut interval = tokio::time::interval(self.tick_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.recv() => break,
                _ = interval.tick() => {}
            }
            if let Err(e) = self.tick().await {
                error!(error = %e, "Scheduled mover tick failed");
            }
        }
        info!("Scheduled mover stopped");
    }
}

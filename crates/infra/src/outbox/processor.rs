//! Drains the outbox into the event bus.

use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Mutex, mpsc};
use std::thread;

use serde::Serialize;
use tracing::{debug, error, info, instrument, warn};

use tessera_core::Clock;
use tessera_events::EventBus;

use super::store::OutboxStore;
use super::types::{OutboxMessage, OutboxStats, OutboxStoreError};
use crate::config::OutboxConfig;

/// What a single tick did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TickReport {
    pub claimed: usize,
    pub published: usize,
    /// Publish or settle failures; the messages stay unprocessed.
    pub failed: usize,
    /// Messages whose claim expired before they could be settled.
    pub claim_lost: usize,
}

impl TickReport {
    pub fn is_idle(&self) -> bool {
        self.claimed == 0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Delivery {
    Published,
    Failed,
    ClaimLost,
}

/// Claims batches of outbox messages and publishes them.
///
/// Delivery is at-least-once. A message published just before its lease ran
/// out can be published again by whoever claims it next.
pub struct OutboxProcessor {
    store: Arc<dyn OutboxStore>,
    bus: Arc<dyn EventBus>,
    clock: Arc<dyn Clock>,
    config: OutboxConfig,
    lease: chrono::Duration,
}

impl OutboxProcessor {
    pub fn new(
        store: Arc<dyn OutboxStore>,
        bus: Arc<dyn EventBus>,
        clock: Arc<dyn Clock>,
        config: OutboxConfig,
    ) -> Self {
        let lease =
            chrono::Duration::from_std(config.lease).unwrap_or_else(|_| chrono::Duration::days(1));
        Self {
            store,
            bus,
            clock,
            config,
            lease,
        }
    }

    pub fn config(&self) -> &OutboxConfig {
        &self.config
    }

    fn owner(&self) -> &str {
        &self.config.instance_id
    }

    /// Claim one batch and publish it.
    ///
    /// Only a failed claim is returned as an error. Per-message failures are
    /// recorded on the message and counted in the report.
    #[instrument(skip(self), fields(owner = %self.config.instance_id))]
    pub fn tick(&self) -> Result<TickReport, OutboxStoreError> {
        let now = self.clock.now();
        let batch =
            self.store
                .claim_unprocessed(self.owner(), self.config.batch_size, self.lease, now)?;

        if batch.is_empty() {
            debug!("outbox empty");
            return Ok(TickReport::default());
        }

        let mut report = TickReport {
            claimed: batch.len(),
            ..TickReport::default()
        };

        for delivery in self.deliver_all(batch) {
            match delivery {
                Delivery::Published => report.published += 1,
                Delivery::Failed => report.failed += 1,
                Delivery::ClaimLost => report.claim_lost += 1,
            }
        }

        info!(
            claimed = report.claimed,
            published = report.published,
            failed = report.failed,
            claim_lost = report.claim_lost,
            "outbox tick finished"
        );
        Ok(report)
    }

    /// Fan the batch out over a bounded set of publisher threads.
    fn deliver_all(&self, batch: Vec<OutboxMessage>) -> Vec<Delivery> {
        let workers = self.config.workers.clamp(1, batch.len());
        let total = batch.len();

        let (job_tx, job_rx) = mpsc::channel::<OutboxMessage>();
        let (done_tx, done_rx) = mpsc::channel::<Delivery>();
        let job_rx = Mutex::new(job_rx);

        for message in batch {
            // The receiver lives until the scope below ends.
            let _ = job_tx.send(message);
        }
        drop(job_tx);

        thread::scope(|scope| {
            for _ in 0..workers {
                let done_tx = done_tx.clone();
                let job_rx = &job_rx;
                scope.spawn(move || {
                    loop {
                        let next = job_rx
                            .lock()
                            .unwrap_or_else(|poisoned| poisoned.into_inner())
                            .recv();
                        let Ok(message) = next else { break };
                        if done_tx.send(self.deliver(&message)).is_err() {
                            break;
                        }
                    }
                });
            }
        });
        drop(done_tx);

        let outcomes: Vec<Delivery> = done_rx.iter().collect();
        debug_assert_eq!(outcomes.len(), total);
        outcomes
    }

    fn deliver(&self, message: &OutboxMessage) -> Delivery {
        let event = message.to_integration_event();
        let published = panic::catch_unwind(AssertUnwindSafe(|| self.bus.publish(&event)))
            .unwrap_or_else(|payload| {
                Err(tessera_events::PublishError::Unavailable(format!(
                    "publisher panicked: {}",
                    panic_message(payload.as_ref())
                )))
            });

        let settled = match published {
            Ok(()) => self
                .store
                .mark_processed(message.id, self.owner(), self.clock.now())
                .map(|()| Delivery::Published),
            Err(err) => {
                warn!(
                    message_id = %message.id,
                    message_type = %message.message_type,
                    attempts = message.attempts,
                    error = %err,
                    "outbox publish failed"
                );
                self.store
                    .mark_errored(message.id, self.owner(), &err.to_string())
                    .map(|()| Delivery::Failed)
            }
        };

        match settled {
            Ok(delivery) => delivery,
            Err(err @ OutboxStoreError::ClaimLost { .. }) => {
                error!(message_id = %message.id, error = %err, "outbox claim lost before settling");
                Delivery::ClaimLost
            }
            Err(err) => {
                error!(message_id = %message.id, error = %err, "failed to settle outbox message");
                Delivery::Failed
            }
        }
    }

    /// Delete processed messages older than the configured retention.
    #[instrument(skip(self))]
    pub fn purge_processed(&self) -> Result<usize, OutboxStoreError> {
        let retention = chrono::Duration::from_std(self.config.retention)
            .unwrap_or_else(|_| chrono::Duration::days(365));
        let cutoff = self.clock.now() - retention;
        let purged = self.store.purge_processed_older_than(cutoff)?;
        if purged > 0 {
            info!(purged, %cutoff, "purged processed outbox messages");
        }
        Ok(purged)
    }

    pub fn stats(&self) -> Result<OutboxStats, OutboxStoreError> {
        self.store.stats(self.clock.now())
    }
}

pub(crate) fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

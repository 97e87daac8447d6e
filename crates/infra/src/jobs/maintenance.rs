//! Periodic maintenance registered at startup.

use std::sync::Arc;

use tracing::info;

use tessera_auth::{RefreshTokenStore, SigningKeyring};
use tessera_core::Clock;

use super::scheduler::{JobScheduler, SchedulerError};
use super::types::{Cadence, JobQueue, RecurringJobDefinition};
use crate::outbox::OutboxProcessor;

pub const OUTBOX_PROCESSOR: &str = "outbox-processor";
pub const OUTBOX_CLEANUP: &str = "outbox-cleanup";
pub const SIGNING_KEY_ROTATION: &str = "signing-key-rotation";
pub const SIGNING_KEY_PURGE: &str = "signing-key-purge";
pub const REFRESH_TOKEN_PURGE: &str = "refresh-token-purge";

/// Upper bound on outbox ticks per scheduled run.
const MAX_OUTBOX_TICKS_PER_RUN: usize = 50;

/// Job id, queue and cadence of every maintenance job.
pub fn maintenance_schedule() -> Vec<(&'static str, JobQueue, Cadence)> {
    vec![
        (OUTBOX_PROCESSOR, JobQueue::Priority, Cadence::new("*/10 * * * * *", "* * * * *")),
        (OUTBOX_CLEANUP, JobQueue::Default, Cadence::new("*/5 * * * *", "0 3 * * *")),
        (SIGNING_KEY_ROTATION, JobQueue::Default, Cadence::new("0 * * * *", "0 4 * * 0")),
        (SIGNING_KEY_PURGE, JobQueue::Default, Cadence::new("*/15 * * * *", "30 4 * * *")),
        (REFRESH_TOKEN_PURGE, JobQueue::Default, Cadence::new("*/10 * * * *", "0 5 * * *")),
    ]
}

/// Services the maintenance handlers act on.
pub struct MaintenanceJobs {
    pub outbox: Arc<OutboxProcessor>,
    pub keyring: Arc<SigningKeyring>,
    pub refresh_tokens: Arc<RefreshTokenStore>,
    pub clock: Arc<dyn Clock>,
}

/// Register handlers and definitions for every maintenance job, using the
/// scheduler's environment to pick each cadence.
pub fn register_maintenance_jobs(
    scheduler: &JobScheduler,
    jobs: MaintenanceJobs,
) -> Result<Vec<RecurringJobDefinition>, SchedulerError> {
    let MaintenanceJobs {
        outbox,
        keyring,
        refresh_tokens,
        clock,
    } = jobs;

    {
        let outbox = Arc::clone(&outbox);
        scheduler.register_handler(OUTBOX_PROCESSOR, move || {
            let batch_size = outbox.config().batch_size;
            // Keep draining while full batches go out; a batch of failures
            // waits for the next run.
            for _ in 0..MAX_OUTBOX_TICKS_PER_RUN {
                let report = outbox.tick()?;
                if report.claimed < batch_size || report.published == 0 {
                    break;
                }
            }
            Ok(())
        });
    }

    scheduler.register_handler(OUTBOX_CLEANUP, move || {
        outbox.purge_processed()?;
        Ok(())
    });

    {
        let keyring = Arc::clone(&keyring);
        scheduler.register_handler(SIGNING_KEY_ROTATION, move || {
            let key = keyring.rotate()?;
            info!(kid = %key.id, "scheduled signing key rotation");
            Ok(())
        });
    }

    scheduler.register_handler(SIGNING_KEY_PURGE, move || {
        keyring.purge_expired()?;
        Ok(())
    });

    scheduler.register_handler(REFRESH_TOKEN_PURGE, move || {
        let purged = refresh_tokens.purge_expired(clock.now())?;
        if purged > 0 {
            info!(purged, "purged expired refresh tokens");
        }
        Ok(())
    });

    maintenance_schedule()
        .into_iter()
        .map(|(job_id, queue, cadence)| scheduler.add_or_update_cadence(job_id, &cadence, queue))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::cron::CronSchedule;

    #[test]
    fn every_cadence_parses_in_both_environments() {
        for (job_id, _, cadence) in maintenance_schedule() {
            CronSchedule::parse(&cadence.development)
                .unwrap_or_else(|e| panic!("{job_id} development: {e}"));
            CronSchedule::parse(&cadence.production)
                .unwrap_or_else(|e| panic!("{job_id} production: {e}"));
        }
    }

    #[test]
    fn only_the_outbox_processor_is_priority() {
        let priority: Vec<_> = maintenance_schedule()
            .into_iter()
            .filter(|(_, queue, _)| *queue == JobQueue::Priority)
            .map(|(id, _, _)| id)
            .collect();
        assert_eq!(priority, vec![OUTBOX_PROCESSOR]);
    }
}

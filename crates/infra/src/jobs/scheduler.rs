//! Cron-driven recurring job scheduler.

use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, RwLock, mpsc};
use std::thread;

use serde::Serialize;
use thiserror::Error;
use tracing::{debug, error, info, warn};

use tessera_core::{Clock, DomainError};

use super::cron::{CronError, CronSchedule};
use super::store::{JobStoreError, RecurringJobStore};
use super::types::{Cadence, JobOutcome, JobQueue, JobRun, RecurringJobDefinition};
use crate::config::{RuntimeEnvironment, SchedulerConfig};
use crate::outbox::processor::panic_message;

/// Job handler function type.
pub type JobHandler = Arc<dyn Fn() -> anyhow::Result<()> + Send + Sync>;

#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("invalid cron expression for job '{job_id}': {source}")]
    InvalidCron {
        job_id: String,
        #[source]
        source: CronError,
    },

    #[error("cron expression for job '{0}' never fires")]
    NeverFires(String),

    #[error("recurring job not found: {0}")]
    NotFound(String),

    #[error(transparent)]
    Store(#[from] JobStoreError),

    #[error("failed to spawn scheduler worker: {0}")]
    Spawn(#[from] std::io::Error),
}

impl From<SchedulerError> for DomainError {
    fn from(err: SchedulerError) -> Self {
        match err {
            SchedulerError::InvalidCron { .. } | SchedulerError::NeverFires(_) => {
                DomainError::Validation(err.to_string())
            }
            SchedulerError::NotFound(_) => DomainError::NotFound,
            SchedulerError::Store(e) => e.into(),
            SchedulerError::Spawn(e) => DomainError::Fatal(e.to_string()),
        }
    }
}

/// Result of one pass over a queue.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RunSummary {
    pub executed: usize,
    pub succeeded: usize,
    pub failed: usize,
    /// Due jobs another instance advanced first.
    pub skipped: usize,
}

/// Runs registered handlers on their cron schedules.
///
/// Definitions live in a [`RecurringJobStore`]; handlers are registered per
/// process. A handler that returns an error or panics is logged and recorded
/// as the job's last run, and the job simply runs again at its next time.
pub struct JobScheduler {
    store: Arc<dyn RecurringJobStore>,
    clock: Arc<dyn Clock>,
    handlers: RwLock<HashMap<String, JobHandler>>,
    config: SchedulerConfig,
}

impl JobScheduler {
    pub fn new(
        store: Arc<dyn RecurringJobStore>,
        clock: Arc<dyn Clock>,
        config: SchedulerConfig,
    ) -> Self {
        Self {
            store,
            clock,
            handlers: RwLock::new(HashMap::new()),
            config,
        }
    }

    pub fn environment(&self) -> RuntimeEnvironment {
        self.config.environment
    }

    /// Register (or replace) the handler invoked for jobs naming `name`.
    pub fn register_handler<F>(&self, name: impl Into<String>, handler: F)
    where
        F: Fn() -> anyhow::Result<()> + Send + Sync + 'static,
    {
        let mut handlers = self
            .handlers
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        handlers.insert(name.into(), Arc::new(handler));
    }

    fn handler(&self, name: &str) -> Option<JobHandler> {
        self.handlers
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(name)
            .cloned()
    }

    /// Create or update a job whose handler has the same name as the job.
    ///
    /// Re-registering an unchanged expression keeps the stored next run and
    /// last run, so restarts do not shift the schedule.
    pub fn add_or_update(
        &self,
        job_id: &str,
        cron_expression: &str,
        queue: JobQueue,
    ) -> Result<RecurringJobDefinition, SchedulerError> {
        self.add_or_update_with_handler(job_id, job_id, cron_expression, queue)
    }

    /// Like [`add_or_update`](Self::add_or_update), picking the cron
    /// expression for the configured environment.
    pub fn add_or_update_cadence(
        &self,
        job_id: &str,
        cadence: &Cadence,
        queue: JobQueue,
    ) -> Result<RecurringJobDefinition, SchedulerError> {
        self.add_or_update(job_id, cadence.for_env(self.config.environment), queue)
    }

    pub fn add_or_update_with_handler(
        &self,
        job_id: &str,
        handler: &str,
        cron_expression: &str,
        queue: JobQueue,
    ) -> Result<RecurringJobDefinition, SchedulerError> {
        let schedule =
            CronSchedule::parse(cron_expression).map_err(|source| SchedulerError::InvalidCron {
                job_id: job_id.to_string(),
                source,
            })?;
        let now = self.clock.now();

        let existing = self.store.get(job_id)?;
        let unchanged = existing
            .as_ref()
            .is_some_and(|job| job.cron_expression == schedule.expression());

        let next_run_at = match &existing {
            Some(job) if unchanged && job.next_run_at.is_some() => job.next_run_at,
            _ => schedule.next_after(now),
        };
        if next_run_at.is_none() {
            return Err(SchedulerError::NeverFires(job_id.to_string()));
        }

        let job = RecurringJobDefinition {
            id: job_id.to_string(),
            cron_expression: schedule.expression().to_string(),
            queue,
            handler: handler.to_string(),
            next_run_at,
            last_run: existing.and_then(|job| job.last_run),
        };
        self.store.upsert(job.clone())?;

        info!(
            scheduler = %self.config.name,
            job_id,
            cron = %job.cron_expression,
            %queue,
            next_run_at = ?job.next_run_at,
            "recurring job registered"
        );
        Ok(job)
    }

    /// Returns whether the job existed.
    pub fn remove(&self, job_id: &str) -> Result<bool, SchedulerError> {
        let removed = self.store.remove(job_id)?;
        if removed {
            info!(scheduler = %self.config.name, job_id, "recurring job removed");
        }
        Ok(removed)
    }

    pub fn list(&self) -> Result<Vec<RecurringJobDefinition>, SchedulerError> {
        Ok(self.store.list()?)
    }

    /// Run every job on `queue` that is due now.
    ///
    /// Each due job is first advanced to its next occurrence after now; runs
    /// missed while the scheduler was down collapse into this one.
    pub fn run_due(&self, queue: JobQueue) -> Result<RunSummary, SchedulerError> {
        let now = self.clock.now();
        let mut summary = RunSummary::default();

        for job in self.store.due(queue, now)? {
            let next = match CronSchedule::parse(&job.cron_expression) {
                Ok(schedule) => schedule.next_after(now),
                Err(e) => {
                    // Unparseable rows are parked rather than retried every poll.
                    error!(job_id = %job.id, error = %e, "stored cron expression is invalid");
                    None
                }
            };

            match self.store.try_advance(&job.id, job.next_run_at, next) {
                Ok(true) => {}
                Ok(false) => {
                    debug!(job_id = %job.id, "job already claimed by another scheduler");
                    summary.skipped += 1;
                    continue;
                }
                Err(JobStoreError::NotFound(_)) => {
                    summary.skipped += 1;
                    continue;
                }
                Err(e) => return Err(e.into()),
            }

            let run = self.execute(&job);
            summary.executed += 1;
            if run.outcome.is_success() {
                summary.succeeded += 1;
            } else {
                summary.failed += 1;
            }
            self.record(&job.id, run);
        }

        Ok(summary)
    }

    /// Run a job now, outside its schedule. Its next run time is unchanged.
    pub fn trigger(&self, job_id: &str) -> Result<JobRun, SchedulerError> {
        let job = self
            .store
            .get(job_id)?
            .ok_or_else(|| SchedulerError::NotFound(job_id.to_string()))?;
        let run = self.execute(&job);
        self.record(&job.id, run.clone());
        Ok(run)
    }

    fn execute(&self, job: &RecurringJobDefinition) -> JobRun {
        let started_at = self.clock.now();

        let outcome = match self.handler(&job.handler) {
            None => JobOutcome::Failed {
                error: format!("no handler registered for '{}'", job.handler),
            },
            Some(handler) => match panic::catch_unwind(AssertUnwindSafe(|| handler())) {
                Ok(Ok(())) => JobOutcome::Succeeded,
                Ok(Err(e)) => JobOutcome::Failed {
                    error: format!("{e:#}"),
                },
                Err(payload) => JobOutcome::Panicked {
                    message: panic_message(payload.as_ref()),
                },
            },
        };

        let finished_at = self.clock.now();
        match &outcome {
            JobOutcome::Succeeded => debug!(
                job_id = %job.id,
                queue = %job.queue,
                duration_ms = (finished_at - started_at).num_milliseconds(),
                "job succeeded"
            ),
            JobOutcome::Failed { error } => warn!(job_id = %job.id, queue = %job.queue, %error, "job failed"),
            JobOutcome::Panicked { message } => {
                error!(job_id = %job.id, queue = %job.queue, panic = %message, "job panicked")
            }
        }

        JobRun {
            started_at,
            finished_at,
            outcome,
        }
    }

    fn record(&self, job_id: &str, run: JobRun) {
        if let Err(e) = self.store.record_run(job_id, run) {
            // The job may have been removed while it ran.
            debug!(job_id, error = %e, "could not record job run");
        }
    }

    /// Start one worker thread per queue.
    pub fn spawn(self: Arc<Self>) -> Result<SchedulerHandle, SchedulerError> {
        let mut workers = Vec::with_capacity(JobQueue::ALL.len());

        for queue in JobQueue::ALL {
            let (shutdown_tx, shutdown_rx) = mpsc::channel::<()>();
            let scheduler = Arc::clone(&self);
            let join = thread::Builder::new()
                .name(format!("{}-{}", self.config.name, queue))
                .spawn(move || scheduler.worker_loop(queue, shutdown_rx));

            match join {
                Ok(join) => workers.push(Worker {
                    shutdown: shutdown_tx,
                    join,
                }),
                Err(e) => {
                    SchedulerHandle { workers }.shutdown();
                    return Err(e.into());
                }
            }
        }

        Ok(SchedulerHandle { workers })
    }

    fn worker_loop(&self, queue: JobQueue, shutdown_rx: mpsc::Receiver<()>) {
        info!(scheduler = %self.config.name, %queue, "scheduler worker started");

        loop {
            match self.run_due(queue) {
                Ok(summary) if summary.executed > 0 || summary.skipped > 0 => debug!(
                    %queue,
                    executed = summary.executed,
                    failed = summary.failed,
                    skipped = summary.skipped,
                    "scheduler pass finished"
                ),
                Ok(_) => {}
                Err(e) => error!(scheduler = %self.config.name, %queue, error = %e, "scheduler pass failed"),
            }

            match shutdown_rx.recv_timeout(self.config.poll_interval) {
                Err(mpsc::RecvTimeoutError::Timeout) => continue,
                Ok(()) | Err(mpsc::RecvTimeoutError::Disconnected) => break,
            }
        }

        info!(scheduler = %self.config.name, %queue, "scheduler worker stopped");
    }
}

#[derive(Debug)]
struct Worker {
    shutdown: mpsc::Sender<()>,
    join: thread::JoinHandle<()>,
}

/// Handle to control running scheduler workers.
#[derive(Debug)]
pub struct SchedulerHandle {
    workers: Vec<Worker>,
}

impl SchedulerHandle {
    /// Signal every worker and wait for in-flight jobs to finish.
    pub fn shutdown(self) {
        for worker in &self.workers {
            let _ = worker.shutdown.send(());
        }
        for worker in self.workers {
            if worker.join.join().is_err() {
                error!("scheduler worker panicked");
            }
        }
    }
}

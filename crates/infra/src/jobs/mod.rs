//! Recurring job scheduling.
//!
//! ## Design
//!
//! - Jobs are named, cron-scheduled and bound to a queue
//! - Each queue is served by its own worker thread
//! - Failures and panics are recorded as the job's last run, never propagated
//! - Instances sharing a store coordinate through a compare-and-swap on the
//!   next run time
//!
//! ## Components
//!
//! - `CronSchedule`: expression parsing and next-occurrence search
//! - `RecurringJobStore`: persistence for job definitions
//! - `JobScheduler`: registration, `run_due` and the spawned worker loops
//! - `maintenance`: the outbox, key and token jobs every deployment runs

pub mod cron;
pub mod maintenance;
pub mod scheduler;
pub mod store;
pub mod types;

pub use cron::{CronError, CronSchedule};
pub use maintenance::{MaintenanceJobs, maintenance_schedule, register_maintenance_jobs};
pub use scheduler::{JobHandler, JobScheduler, RunSummary, SchedulerError, SchedulerHandle};
pub use store::{InMemoryRecurringJobStore, JobStoreError, RecurringJobStore};
pub use types::{Cadence, JobOutcome, JobQueue, JobRun, RecurringJobDefinition};

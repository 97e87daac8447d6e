//! Infrastructure layer: outbox storage and delivery, recurring jobs.

pub mod config;
pub mod jobs;
pub mod outbox;

pub use config::{OutboxConfig, RuntimeEnvironment, SchedulerConfig};

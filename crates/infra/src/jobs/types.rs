//! Recurring job definitions and run records.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::RuntimeEnvironment;

/// Worker queue a job runs on. Each queue has its own loop, so a slow
/// default job never delays a priority one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobQueue {
    #[default]
    Default,
    Priority,
}

impl JobQueue {
    pub const ALL: [JobQueue; 2] = [JobQueue::Priority, JobQueue::Default];

    pub fn as_str(self) -> &'static str {
        match self {
            JobQueue::Default => "default",
            JobQueue::Priority => "priority",
        }
    }
}

impl std::fmt::Display for JobQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A job's development and production cron expressions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cadence {
    pub development: String,
    pub production: String,
}

impl Cadence {
    pub fn new(development: impl Into<String>, production: impl Into<String>) -> Self {
        Self {
            development: development.into(),
            production: production.into(),
        }
    }

    pub fn for_env(&self, environment: RuntimeEnvironment) -> &str {
        match environment {
            RuntimeEnvironment::Development => &self.development,
            RuntimeEnvironment::Production => &self.production,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum JobOutcome {
    Succeeded,
    Failed { error: String },
    Panicked { message: String },
}

impl JobOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, JobOutcome::Succeeded)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobRun {
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub outcome: JobOutcome,
}

/// A job registered with the scheduler.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecurringJobDefinition {
    pub id: String,
    pub cron_expression: String,
    pub queue: JobQueue,
    /// Name of the registered handler to invoke.
    pub handler: String,
    /// `None` when the expression has no future occurrence.
    pub next_run_at: Option<DateTime<Utc>>,
    pub last_run: Option<JobRun>,
}

impl RecurringJobDefinition {
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.next_run_at.is_some_and(|next| next <= now)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn cadence_follows_environment() {
        let cadence = Cadence::new("*/5 * * * *", "0 3 * * *");
        assert_eq!(cadence.for_env(RuntimeEnvironment::Development), "*/5 * * * *");
        assert_eq!(cadence.for_env(RuntimeEnvironment::Production), "0 3 * * *");
    }

    #[test]
    fn due_only_when_next_run_has_passed() {
        let now = Utc::now();
        let mut job = RecurringJobDefinition {
            id: "cleanup".into(),
            cron_expression: "0 3 * * *".into(),
            queue: JobQueue::Default,
            handler: "cleanup".into(),
            next_run_at: None,
            last_run: None,
        };
        assert!(!job.is_due(now));

        job.next_run_at = Some(now + Duration::seconds(1));
        assert!(!job.is_due(now));
        assert!(job.is_due(now + Duration::seconds(1)));
    }

    #[test]
    fn outcome_serializes_with_status_tag() {
        let json = serde_json::to_value(JobOutcome::Failed { error: "boom".into() }).unwrap();
        assert_eq!(json, serde_json::json!({ "status": "failed", "error": "boom" }));
    }
}

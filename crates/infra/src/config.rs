//! Configuration for the outbox processor and the job scheduler.

use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Which of a job's two cadences applies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuntimeEnvironment {
    #[default]
    Development,
    Production,
}

impl RuntimeEnvironment {
    pub fn is_production(self) -> bool {
        matches!(self, RuntimeEnvironment::Production)
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("unknown runtime environment '{0}' (expected development or production)")]
pub struct ParseEnvironmentError(pub String);

impl FromStr for RuntimeEnvironment {
    type Err = ParseEnvironmentError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "development" | "dev" => Ok(RuntimeEnvironment::Development),
            "production" | "prod" => Ok(RuntimeEnvironment::Production),
            other => Err(ParseEnvironmentError(other.to_string())),
        }
    }
}

impl core::fmt::Display for RuntimeEnvironment {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            RuntimeEnvironment::Development => f.write_str("development"),
            RuntimeEnvironment::Production => f.write_str("production"),
        }
    }
}

/// Outbox processor configuration.
#[derive(Debug, Clone)]
pub struct OutboxConfig {
    /// Messages claimed per tick.
    pub batch_size: usize,
    /// How long a claim protects a message from other processors.
    pub lease: Duration,
    /// Publisher threads per tick.
    pub workers: usize,
    /// Processed messages older than this are purged by the cleanup job.
    pub retention: Duration,
    /// Claim owner; must be unique per running processor.
    pub instance_id: String,
}

impl Default for OutboxConfig {
    fn default() -> Self {
        Self {
            batch_size: 20,
            lease: Duration::from_secs(60),
            workers: 4,
            retention: Duration::from_secs(7 * 24 * 60 * 60),
            instance_id: format!("outbox-{}", uuid::Uuid::now_v7()),
        }
    }
}

impl OutboxConfig {
    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers.max(1);
        self
    }

    pub fn with_lease(mut self, lease: Duration) -> Self {
        self.lease = lease;
        self
    }

    pub fn with_instance_id(mut self, instance_id: impl Into<String>) -> Self {
        self.instance_id = instance_id.into();
        self
    }
}

/// Job scheduler configuration.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// How often each queue loop checks for due jobs.
    pub poll_interval: Duration,
    pub environment: RuntimeEnvironment,
    /// Prefix for worker thread names and log fields.
    pub name: String,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(500),
            environment: RuntimeEnvironment::Development,
            name: "scheduler".to_string(),
        }
    }
}

impl SchedulerConfig {
    pub fn with_environment(mut self, environment: RuntimeEnvironment) -> Self {
        self.environment = environment;
        self
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn environment_parses_short_and_long_names() {
        assert_eq!("prod".parse::<RuntimeEnvironment>(), Ok(RuntimeEnvironment::Production));
        assert_eq!(
            " Development ".parse::<RuntimeEnvironment>(),
            Ok(RuntimeEnvironment::Development)
        );
        assert!("staging".parse::<RuntimeEnvironment>().is_err());
    }

    #[test]
    fn builder_clamps_batch_and_workers() {
        let config = OutboxConfig::default().with_batch_size(0).with_workers(0);
        assert_eq!(config.batch_size, 1);
        assert_eq!(config.workers, 1);
    }
}

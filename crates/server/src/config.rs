//! Process configuration read from the environment.

use std::str::FromStr;

use thiserror::Error;

use tessera_auth::AuthConfig;
use tessera_infra::{OutboxConfig, RuntimeEnvironment, SchedulerConfig};
use tessera_observability::LogFormat;

#[derive(Debug, Error, PartialEq, Eq)]
#[error("invalid value '{value}' for {var}: {reason}")]
pub struct ConfigError {
    pub var: &'static str,
    pub value: String,
    pub reason: String,
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub environment: RuntimeEnvironment,
    pub log_format: LogFormat,
    pub auth: AuthConfig,
    pub outbox: OutboxConfig,
    pub scheduler: SchedulerConfig,
    /// Selects the Postgres outbox when set.
    pub database_url: Option<String>,
}

impl AppConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    /// Build from an arbitrary variable source. Unset and empty variables
    /// fall back to defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let get = |var: &str| lookup(var).filter(|v| !v.trim().is_empty());

        let environment: RuntimeEnvironment = parse(&get, "TESSERA_ENV")?.unwrap_or_default();
        let log_format: LogFormat = parse(&get, "TESSERA_LOG_FORMAT")?.unwrap_or_default();

        let mut auth = AuthConfig::default();
        if let Some(issuer) = get("TESSERA_JWT_ISSUER") {
            auth.issuer = issuer;
        }
        if let Some(ttl) = parse::<i64>(&get, "TESSERA_ACCESS_TOKEN_TTL_SECS")? {
            auth.access_token_lifetime_secs = ttl;
        }
        if let Some(grace) = parse::<i64>(&get, "TESSERA_KEY_GRACE_SECS")? {
            auth.key_grace_period_secs = grace;
        }

        let mut outbox = OutboxConfig::default();
        if let Some(batch_size) = parse::<usize>(&get, "TESSERA_OUTBOX_BATCH_SIZE")? {
            outbox = outbox.with_batch_size(batch_size);
        }

        Ok(Self {
            environment,
            log_format,
            auth,
            outbox,
            scheduler: SchedulerConfig::default().with_environment(environment),
            database_url: get("DATABASE_URL"),
        })
    }
}

fn parse<T>(
    get: &impl Fn(&str) -> Option<String>,
    var: &'static str,
) -> Result<Option<T>, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    get(var)
        .map(|value| {
            value.trim().parse::<T>().map_err(|e| ConfigError {
                var,
                value: value.clone(),
                reason: e.to_string(),
            })
        })
        .transpose()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config(vars: &[(&str, &str)]) -> Result<AppConfig, ConfigError> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        AppConfig::from_lookup(|var| vars.get(var).cloned())
    }

    #[test]
    fn defaults_when_nothing_is_set() {
        let config = config(&[]).unwrap();
        assert_eq!(config.environment, RuntimeEnvironment::Development);
        assert_eq!(config.log_format, LogFormat::Json);
        assert_eq!(config.auth.issuer, AuthConfig::default().issuer);
        assert_eq!(config.outbox.batch_size, OutboxConfig::default().batch_size);
        assert!(config.database_url.is_none());
    }

    #[test]
    fn reads_every_variable() {
        let config = config(&[
            ("TESSERA_ENV", "production"),
            ("TESSERA_LOG_FORMAT", "pretty"),
            ("TESSERA_JWT_ISSUER", "https://id.acme.test"),
            ("TESSERA_ACCESS_TOKEN_TTL_SECS", "300"),
            ("TESSERA_KEY_GRACE_SECS", "600"),
            ("TESSERA_OUTBOX_BATCH_SIZE", "50"),
            ("DATABASE_URL", "postgres://localhost/tessera"),
        ])
        .unwrap();

        assert_eq!(config.environment, RuntimeEnvironment::Production);
        assert_eq!(config.scheduler.environment, RuntimeEnvironment::Production);
        assert_eq!(config.log_format, LogFormat::Pretty);
        assert_eq!(config.auth.issuer, "https://id.acme.test");
        assert_eq!(config.auth.access_token_lifetime_secs, 300);
        assert_eq!(config.auth.key_grace_period_secs, 600);
        assert_eq!(config.outbox.batch_size, 50);
        assert_eq!(config.database_url.as_deref(), Some("postgres://localhost/tessera"));
    }

    #[test]
    fn empty_values_are_unset() {
        let config = config(&[("DATABASE_URL", "  "), ("TESSERA_ENV", "")]).unwrap();
        assert!(config.database_url.is_none());
        assert_eq!(config.environment, RuntimeEnvironment::Development);
    }

    #[test]
    fn malformed_numbers_name_the_variable() {
        let err = config(&[("TESSERA_OUTBOX_BATCH_SIZE", "lots")]).unwrap_err();
        assert_eq!(err.var, "TESSERA_OUTBOX_BATCH_SIZE");
        assert_eq!(err.value, "lots");
    }
}

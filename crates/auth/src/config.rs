//! Authentication configuration.

use chrono::Duration;

use crate::error::AuthError;

/// Refresh token lifetime used when a caller passes a non-positive one.
pub const DEFAULT_REFRESH_TOKEN_LIFETIME_SECS: i64 = 7 * 24 * 60 * 60;

/// Configuration for token issuance, key rotation and refresh tokens.
///
/// Built once at startup and handed to the constructors that need it; nothing
/// reads process-wide settings after initialization.
#[derive(Debug, Clone)]
pub struct AuthConfig {
    /// JWT issuer (`iss` claim), also required on verification.
    pub issuer: String,
    /// Prefix applied to extension claim names (e.g. `"tessera:"`).
    pub claim_prefix: String,
    /// Access token lifetime in seconds (default: 900 = 15 minutes).
    pub access_token_lifetime_secs: i64,
    /// Refresh token lifetime in seconds (default: 7 days).
    pub refresh_token_lifetime_secs: i64,
    /// How long a retired signing key stays in the published key set.
    ///
    /// Must be longer than the access token lifetime.
    pub key_grace_period_secs: i64,
    /// Length of generated HMAC key material in bytes.
    pub key_material_len: usize,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            issuer: "tessera".into(),
            claim_prefix: "tessera:".into(),
            access_token_lifetime_secs: 900,
            refresh_token_lifetime_secs: DEFAULT_REFRESH_TOKEN_LIFETIME_SECS,
            key_grace_period_secs: 2 * 60 * 60,
            key_material_len: 64,
        }
    }
}

impl AuthConfig {
    pub fn access_token_lifetime(&self) -> Duration {
        Duration::seconds(self.access_token_lifetime_secs)
    }

    pub fn refresh_token_lifetime(&self) -> Duration {
        Duration::seconds(self.refresh_token_lifetime_secs)
    }

    pub fn key_grace_period(&self) -> Duration {
        Duration::seconds(self.key_grace_period_secs)
    }

    /// Reject configurations that would make issued tokens unverifiable.
    pub fn validate(&self) -> Result<(), AuthError> {
        if self.issuer.trim().is_empty() {
            return Err(AuthError::invalid_config("issuer must not be empty"));
        }
        if self.access_token_lifetime_secs <= 0 {
            return Err(AuthError::invalid_config(
                "access token lifetime must be positive",
            ));
        }
        if self.key_grace_period_secs <= self.access_token_lifetime_secs {
            return Err(AuthError::invalid_config(format!(
                "key grace period ({}s) must exceed the access token lifetime ({}s)",
                self.key_grace_period_secs, self.access_token_lifetime_secs
            )));
        }
        if self.key_material_len < 32 {
            return Err(AuthError::invalid_config(
                "signing key material must be at least 32 bytes",
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        AuthConfig::default().validate().unwrap();
    }

    #[test]
    fn grace_period_must_outlive_access_tokens() {
        let config = AuthConfig {
            access_token_lifetime_secs: 3600,
            key_grace_period_secs: 3600,
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(AuthError::InvalidConfig(_))));
    }
}

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;

use tessera_core::{TeamId, UserId};

use crate::tier::TenantTier;

/// Claims carried by every access token.
///
/// Core identity claims are fixed fields; extension claims produced by the
/// registered generators are flattened next to them under prefixed names.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AccessClaims {
    /// Subject / user identifier.
    pub sub: UserId,
    pub username: String,
    pub email: String,
    pub team_id: TeamId,
    pub tier: TenantTier,
    pub position: i32,
    pub leader: bool,
    pub iss: String,

    /// Unique token id.
    pub jti: String,

    #[serde(rename = "iat", with = "chrono::serde::ts_seconds")]
    pub issued_at: DateTime<Utc>,

    #[serde(rename = "exp", with = "chrono::serde::ts_seconds")]
    pub expires_at: DateTime<Utc>,

    #[serde(flatten)]
    pub extensions: BTreeMap<String, JsonValue>,
}

/// Claim names owned by the core claim set.
pub const RESERVED_CLAIMS: &[&str] = &[
    "sub", "username", "email", "team_id", "tier", "position", "leader", "iss", "jti", "iat",
    "exp", "nbf", "aud",
];

pub fn is_reserved_claim(name: &str) -> bool {
    RESERVED_CLAIMS.contains(&name)
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TokenValidationError {
    #[error("token has expired")]
    Expired,

    #[error("token not yet valid (issued_at is in the future)")]
    NotYetValid,

    #[error("invalid token time window (expires_at <= issued_at)")]
    InvalidTimeWindow,
}

/// Deterministically validate the time window of decoded claims.
///
/// Signature checks happen before this, in the token service.
pub fn validate_claims(
    claims: &AccessClaims,
    now: DateTime<Utc>,
) -> Result<(), TokenValidationError> {
    if claims.expires_at <= claims.issued_at {
        return Err(TokenValidationError::InvalidTimeWindow);
    }
    if now < claims.issued_at {
        return Err(TokenValidationError::NotYetValid);
    }
    if now >= claims.expires_at {
        return Err(TokenValidationError::Expired);
    }
    Ok(())
}

/// Claims whose signature and time window have been verified.
///
/// Only the token service constructs this.
#[derive(Debug, Clone, PartialEq)]
pub struct VerifiedClaims(AccessClaims);

impl VerifiedClaims {
    pub(crate) fn new(claims: AccessClaims) -> Self {
        Self(claims)
    }

    pub fn claims(&self) -> &AccessClaims {
        &self.0
    }

    pub fn into_inner(self) -> AccessClaims {
        self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn claims(issued_at: DateTime<Utc>, lifetime: Duration) -> AccessClaims {
        AccessClaims {
            sub: UserId::new(),
            username: "jane".into(),
            email: "jane@acme.test".into(),
            team_id: TeamId::new(),
            tier: TenantTier::Customer,
            position: 3,
            leader: false,
            iss: "tessera".into(),
            jti: "t-1".into(),
            issued_at,
            expires_at: issued_at + lifetime,
            extensions: BTreeMap::new(),
        }
    }

    #[test]
    fn window_checks() {
        let now = Utc::now();
        let c = claims(now, Duration::minutes(15));

        assert_eq!(validate_claims(&c, now), Ok(()));
        assert_eq!(
            validate_claims(&c, now - Duration::seconds(1)),
            Err(TokenValidationError::NotYetValid)
        );
        assert_eq!(
            validate_claims(&c, now + Duration::minutes(15)),
            Err(TokenValidationError::Expired)
        );
        assert_eq!(
            validate_claims(&claims(now, Duration::zero()), now),
            Err(TokenValidationError::InvalidTimeWindow)
        );
    }

    #[test]
    fn extensions_serialize_beside_core_claims() {
        let mut c = claims(Utc::now(), Duration::minutes(15));
        c.extensions
            .insert("tessera:plan".into(), JsonValue::String("gold".into()));

        let json = serde_json::to_value(&c).unwrap();
        assert_eq!(json["tessera:plan"], "gold");
        assert_eq!(json["tier"], "customer");
        assert!(json["exp"].is_i64());
    }
}

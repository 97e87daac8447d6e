//! Principals: the stored user shape, the resolved principal used at token
//! issuance, and the per-request context rebuilt from a verified token.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use tessera_core::{TeamId, UserId};

use crate::claims::VerifiedClaims;
use crate::error::AuthError;
use crate::tier::{TenantTier, Team, TierMember};
use crate::two_factor::TwoFactorProvider;

/// A user account as the repository stores it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserAccount {
    pub id: UserId,
    pub team_id: TeamId,
    pub username: String,
    pub email: String,
    pub email_confirmed: bool,
    pub phone_number: Option<String>,
    pub phone_confirmed: bool,
    pub position: i32,
    pub is_leader: bool,
    pub two_factor: Option<TwoFactorProvider>,
}

impl UserAccount {
    pub fn new(
        id: UserId,
        team_id: TeamId,
        username: impl Into<String>,
        email: impl Into<String>,
        position: i32,
    ) -> Self {
        Self {
            id,
            team_id,
            username: username.into(),
            email: email.into(),
            email_confirmed: false,
            phone_number: None,
            phone_confirmed: false,
            position,
            is_leader: false,
            two_factor: None,
        }
    }

    pub fn requires_two_factor(&self) -> bool {
        self.two_factor.is_some()
    }
}

/// A user resolved against its team.
///
/// Construction checks the membership invariants, so holders of a `Principal`
/// never re-validate the position range.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Principal {
    user: UserAccount,
    team: Team,
}

impl Principal {
    pub fn resolve(user: UserAccount, team: Team) -> Result<Self, AuthError> {
        if user.team_id != team.id {
            return Err(AuthError::validation(
                "team_id",
                format!("user {} does not belong to team {}", user.id, team.id),
            ));
        }
        if !team.admits(user.position) {
            return Err(AuthError::validation(
                "position",
                format!(
                    "position {} is outside [{}, {}] for team '{}'",
                    user.position, team.min_position, team.max_position, team.name
                ),
            ));
        }
        Ok(Self { user, team })
    }

    pub fn user(&self) -> &UserAccount {
        &self.user
    }

    pub fn team(&self) -> &Team {
        &self.team
    }

    pub fn user_id(&self) -> UserId {
        self.user.id
    }

    pub fn position(&self) -> i32 {
        self.user.position
    }
}

impl TierMember for Principal {
    fn tier(&self) -> TenantTier {
        self.team.tier
    }

    fn is_leader(&self) -> bool {
        self.user.is_leader
    }
}

/// Snapshot of the caller for one request.
///
/// Only buildable from claims whose signature and lifetime were verified, so
/// tier and position can never come from client-supplied input.
#[derive(Debug, Clone, PartialEq)]
pub struct PrincipalContext {
    user_id: UserId,
    team_id: TeamId,
    username: String,
    email: String,
    tier: TenantTier,
    position: i32,
    leader: bool,
    token_id: String,
    expires_at: DateTime<Utc>,
    extensions: BTreeMap<String, JsonValue>,
}

impl PrincipalContext {
    pub fn from_verified(verified: VerifiedClaims) -> Self {
        let claims = verified.into_inner();
        Self {
            user_id: claims.sub,
            team_id: claims.team_id,
            username: claims.username,
            email: claims.email,
            tier: claims.tier,
            position: claims.position,
            leader: claims.leader,
            token_id: claims.jti,
            expires_at: claims.expires_at,
            extensions: claims.extensions,
        }
    }

    pub fn user_id(&self) -> UserId {
        self.user_id
    }

    pub fn team_id(&self) -> TeamId {
        self.team_id
    }

    pub fn username(&self) -> &str {
        &self.username
    }

    pub fn email(&self) -> &str {
        &self.email
    }

    pub fn position(&self) -> i32 {
        self.position
    }

    pub fn token_id(&self) -> &str {
        &self.token_id
    }

    pub fn expires_at(&self) -> DateTime<Utc> {
        self.expires_at
    }

    /// Extension claim by its full (prefixed) name.
    pub fn extension(&self, name: &str) -> Option<&JsonValue> {
        self.extensions.get(name)
    }
}

impl TierMember for PrincipalContext {
    fn tier(&self) -> TenantTier {
        self.tier
    }

    fn is_leader(&self) -> bool {
        self.leader
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn acme() -> Team {
        Team::new(TeamId::new(), "Acme", TenantTier::Customer, 1, 5).unwrap()
    }

    #[test]
    fn resolves_member_inside_range() {
        let team = acme();
        let user = UserAccount::new(UserId::new(), team.id, "jane", "jane@acme.test", 3);
        let principal = Principal::resolve(user, team).unwrap();

        assert!(!principal.tier_at_least(TenantTier::Super));
        assert!(principal.tier_at_least(TenantTier::Customer));
        assert!(!principal.is_leader_of(TenantTier::Customer));
    }

    #[test]
    fn rejects_position_outside_range() {
        let team = acme();
        let user = UserAccount::new(UserId::new(), team.id, "jane", "jane@acme.test", 9);
        let err = Principal::resolve(user, team).unwrap_err();
        assert!(matches!(err, AuthError::Validation { field: "position", .. }));
    }

    #[test]
    fn rejects_user_from_another_team() {
        let user = UserAccount::new(UserId::new(), TeamId::new(), "jane", "jane@acme.test", 3);
        let err = Principal::resolve(user, acme()).unwrap_err();
        assert!(matches!(err, AuthError::Validation { field: "team_id", .. }));
    }
}

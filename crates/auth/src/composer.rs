//! Claim composition at token-issuance time.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde_json::Value as JsonValue;

use tessera_core::{TeamId, UserId};

use crate::claims::is_reserved_claim;
use crate::error::AuthError;
use crate::principal::{Principal, UserAccount};
use crate::tier::{TenantTier, Team, TierMember};

/// One extension claim, named without the configured prefix.
#[derive(Debug, Clone, PartialEq)]
pub struct Claim {
    pub name: String,
    pub value: JsonValue,
}

impl Claim {
    pub fn new(name: impl Into<String>, value: impl Into<JsonValue>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }
}

/// Source of extra claims.
///
/// Implementations must be pure functions of `(user, team)`: no IO, no
/// clock, no randomness. Reissuing a token from the same state must produce
/// the same claims.
pub trait ExtraClaimsGenerator: Send + Sync {
    fn generate(&self, user: &UserAccount, team: &Team) -> Vec<Claim>;
}

impl<F> ExtraClaimsGenerator for F
where
    F: Fn(&UserAccount, &Team) -> Vec<Claim> + Send + Sync,
{
    fn generate(&self, user: &UserAccount, team: &Team) -> Vec<Claim> {
        self(user, team)
    }
}

/// Generator used when nothing else is registered.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoExtraClaims;

impl ExtraClaimsGenerator for NoExtraClaims {
    fn generate(&self, _user: &UserAccount, _team: &Team) -> Vec<Claim> {
        Vec::new()
    }
}

/// The complete claim set for one principal, before signing.
#[derive(Debug, Clone, PartialEq)]
pub struct ClaimSet {
    pub subject: UserId,
    pub username: String,
    pub email: String,
    pub team_id: TeamId,
    pub tier: TenantTier,
    pub position: i32,
    pub leader: bool,
    pub extensions: BTreeMap<String, JsonValue>,
}

/// Builds [`ClaimSet`]s from core identity plus the registered generators.
pub struct ClaimsComposer {
    prefix: String,
    generators: Vec<Arc<dyn ExtraClaimsGenerator>>,
}

impl ClaimsComposer {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            generators: vec![Arc::new(NoExtraClaims)],
        }
    }

    /// Composer with an explicit, ordered generator list.
    ///
    /// An empty list falls back to [`NoExtraClaims`].
    pub fn with_generators(
        prefix: impl Into<String>,
        generators: Vec<Arc<dyn ExtraClaimsGenerator>>,
    ) -> Self {
        let mut composer = Self::new(prefix);
        if !generators.is_empty() {
            composer.generators = generators;
        }
        composer
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn compose(&self, principal: &Principal) -> Result<ClaimSet, AuthError> {
        let user = principal.user();
        let team = principal.team();

        let mut extensions = BTreeMap::new();
        for generator in &self.generators {
            for claim in generator.generate(user, team) {
                let name = format!("{}{}", self.prefix, claim.name);
                if is_reserved_claim(&name) {
                    return Err(AuthError::ReservedClaim(name));
                }
                // Later generators override earlier ones.
                extensions.insert(name, claim.value);
            }
        }

        Ok(ClaimSet {
            subject: user.id,
            username: user.username.clone(),
            email: user.email.clone(),
            team_id: team.id,
            tier: principal.tier(),
            position: user.position,
            leader: principal.is_leader(),
            extensions,
        })
    }
}

impl Default for ClaimsComposer {
    fn default() -> Self {
        Self::new("")
    }
}

impl core::fmt::Debug for ClaimsComposer {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("ClaimsComposer")
            .field("prefix", &self.prefix)
            .field("generators", &self.generators.len())
            .finish()
    }
}

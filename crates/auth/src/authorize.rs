use std::sync::Arc;

use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info, instrument};
use validator::{Validate, ValidationErrors};

use tessera_core::{DomainError, TeamId, UserId};

use crate::error::AuthError;
use crate::principal::PrincipalContext;
use crate::tier::{TenantTier, TierMember};
use crate::token::TokenService;

/// What an operation demands of its caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", content = "tier", rename_all = "snake_case")]
pub enum Requirement {
    /// Any verified principal.
    AuthenticatedOnly,
    /// `tier >= t`.
    TierMinimum(TenantTier),
    /// `tier == t`.
    TierExact(TenantTier),
    /// Leader of a team at exactly `t`.
    LeaderOf(TenantTier),
    /// Leader of a team at `t` or above.
    LeaderMinimumOf(TenantTier),
}

impl core::fmt::Display for Requirement {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Requirement::AuthenticatedOnly => f.write_str("authenticated"),
            Requirement::TierMinimum(t) => write!(f, "tier >= {t}"),
            Requirement::TierExact(t) => write!(f, "tier == {t}"),
            Requirement::LeaderOf(t) => write!(f, "leader of a {t} team"),
            Requirement::LeaderMinimumOf(t) => write!(f, "leader of a {t}-or-higher team"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DenialKind {
    TierTooLow,
    TierMismatch,
    NotLeader,
}

/// Why a principal was turned away.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DenialReason {
    pub kind: DenialKind,
    pub message: String,
    pub suggestions: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    Allow,
    Deny(DenialReason),
}

impl Decision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Decision::Allow)
    }
}

/// Check `principal` against `requirement`.
///
/// - No IO
/// - No panics
/// - The only place tier and leader rules are evaluated
pub fn authorize<P>(principal: &P, requirement: Requirement) -> Decision
where
    P: TierMember + ?Sized,
{
    let tier = principal.tier();
    let deny = |kind, message: String, suggestions: Vec<String>| {
        Decision::Deny(DenialReason {
            kind,
            message,
            suggestions,
        })
    };

    match requirement {
        Requirement::AuthenticatedOnly => Decision::Allow,
        Requirement::TierMinimum(required) if principal.tier_at_least(required) => Decision::Allow,
        Requirement::TierMinimum(required) => deny(
            DenialKind::TierTooLow,
            format!("tier {tier} is below the required minimum {required}"),
            vec![format!("Sign in with an account from a {required}-or-higher team")],
        ),
        Requirement::TierExact(required) if tier == required => Decision::Allow,
        Requirement::TierExact(required) => deny(
            DenialKind::TierMismatch,
            format!("operation is restricted to {required} teams; caller is {tier}"),
            vec![format!("Sign in with an account from a {required} team")],
        ),
        Requirement::LeaderOf(required) if principal.is_leader_of(required) => Decision::Allow,
        Requirement::LeaderMinimumOf(required) if principal.is_leader_at_least(required) => {
            Decision::Allow
        }
        Requirement::LeaderOf(required) | Requirement::LeaderMinimumOf(required) => {
            if principal.is_leader() {
                deny(
                    DenialKind::TierTooLow,
                    format!("caller leads a {tier} team; {requirement} is required"),
                    vec![format!("Ask a leader of a {required} team to perform this operation")],
                )
            } else {
                deny(
                    DenialKind::NotLeader,
                    format!("caller is not a team leader; {requirement} is required"),
                    vec!["Ask your team leader to perform this operation".to_string()],
                )
            }
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Authorization Explanation (Audit Trail)
// ─────────────────────────────────────────────────────────────────────────────

/// Serialisable record of an authorization decision.
#[derive(Debug, Clone, Serialize)]
pub struct AuthorizationExplanation {
    pub requirement: Requirement,
    pub granted: bool,
    pub reason: String,
    pub principal: PrincipalState,
    pub denial_reason: Option<DenialReason>,
}

/// The principal attributes the decision looked at.
#[derive(Debug, Clone, Serialize)]
pub struct PrincipalState {
    pub user_id: UserId,
    pub team_id: TeamId,
    pub tier: TenantTier,
    pub position: i32,
    pub leader: bool,
}

pub fn explain(principal: &PrincipalContext, requirement: Requirement) -> AuthorizationExplanation {
    let state = PrincipalState {
        user_id: principal.user_id(),
        team_id: principal.team_id(),
        tier: principal.tier(),
        position: principal.position(),
        leader: principal.is_leader(),
    };

    match authorize(principal, requirement) {
        Decision::Allow => AuthorizationExplanation {
            requirement,
            granted: true,
            reason: format!("{} satisfies '{requirement}'", describe(&state)),
            principal: state,
            denial_reason: None,
        },
        Decision::Deny(denial) => AuthorizationExplanation {
            requirement,
            granted: false,
            reason: denial.message.clone(),
            principal: state,
            denial_reason: Some(denial),
        },
    }
}

fn describe(state: &PrincipalState) -> String {
    if state.leader {
        format!("leader of a {} team", state.tier)
    } else {
        format!("{} member at position {}", state.tier, state.position)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Request pipeline
// ─────────────────────────────────────────────────────────────────────────────

/// A unit of business logic guarded by the gate.
///
/// `Validate` carries field-level rules only; tier and leader rules belong
/// in [`Operation::requirement`].
pub trait Operation: Validate {
    type Output;

    fn requirement(&self) -> Requirement;

    fn execute(self, principal: &PrincipalContext) -> Result<Self::Output, DomainError>;
}

#[derive(Debug, Error)]
pub enum GateError {
    #[error(transparent)]
    Unauthenticated(AuthError),

    #[error("forbidden: {}", .0.message)]
    Forbidden(DenialReason),

    #[error("validation failed: {0}")]
    Validation(#[from] ValidationErrors),

    #[error(transparent)]
    Handler(DomainError),
}

impl From<GateError> for DomainError {
    fn from(err: GateError) -> Self {
        match err {
            GateError::Unauthenticated(e) => e.into(),
            GateError::Forbidden(denial) => DomainError::Forbidden(denial.message),
            GateError::Validation(e) => DomainError::Validation(e.to_string()),
            GateError::Handler(e) => e,
        }
    }
}

/// Authentication, then authorization, then field validation, then the handler.
pub struct AuthorizationGate {
    tokens: Arc<TokenService>,
}

impl AuthorizationGate {
    pub fn new(tokens: Arc<TokenService>) -> Self {
        Self { tokens }
    }

    pub fn authorize(&self, principal: &PrincipalContext, requirement: Requirement) -> Decision {
        let decision = authorize(principal, requirement);
        match &decision {
            Decision::Allow => {
                debug!(user_id = %principal.user_id(), %requirement, "authorized");
            }
            Decision::Deny(denial) => {
                info!(
                    user_id = %principal.user_id(),
                    team_id = %principal.team_id(),
                    %requirement,
                    kind = ?denial.kind,
                    reason = %denial.message,
                    "authorization denied"
                );
            }
        }
        decision
    }

    /// Run `operation` for the caller identified by `bearer`.
    #[instrument(skip_all, fields(requirement = %operation.requirement()))]
    pub fn run<O: Operation>(&self, bearer: Option<&str>, operation: O) -> Result<O::Output, GateError> {
        let principal = self
            .tokens
            .authenticate(bearer)
            .map_err(GateError::Unauthenticated)?;
        self.run_as(&principal, operation)
    }

    /// Run `operation` for an already-authenticated principal.
    pub fn run_as<O: Operation>(
        &self,
        principal: &PrincipalContext,
        operation: O,
    ) -> Result<O::Output, GateError> {
        if let Decision::Deny(denial) = self.authorize(principal, operation.requirement()) {
            return Err(GateError::Forbidden(denial));
        }
        operation.validate()?;
        operation.execute(principal).map_err(GateError::Handler)
    }
}

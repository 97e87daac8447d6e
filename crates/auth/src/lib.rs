//! `tessera-auth`: tenant hierarchy, token/key lifecycle and the authorization gate.
//!
//! This crate is decoupled from HTTP. Storage is reached through the
//! repository traits (`SigningKeyStore`, `RefreshTokenRepository`).

pub mod authorize;
pub mod claims;
pub mod composer;
pub mod config;
pub mod error;
pub mod keyring;
pub mod principal;
pub mod refresh;
pub mod tier;
pub mod token;
pub mod two_factor;

pub use authorize::{
    AuthorizationExplanation, AuthorizationGate, Decision, DenialKind, DenialReason, GateError,
    Operation, Requirement, authorize, explain,
};
pub use claims::{AccessClaims, TokenValidationError, VerifiedClaims, validate_claims};
pub use composer::{Claim, ClaimSet, ClaimsComposer, ExtraClaimsGenerator, NoExtraClaims};
pub use config::AuthConfig;
pub use error::AuthError;
pub use keyring::{
    InMemorySigningKeyStore, KeySetDocument, KeyStatus, SigningKey, SigningKeyStore,
    SigningKeyring,
};
pub use principal::{Principal, PrincipalContext, UserAccount};
pub use refresh::{
    InMemoryRefreshTokenRepository, IssuedRefreshToken, RefreshToken, RefreshTokenRepository,
    RefreshTokenStore,
};
pub use tier::{Team, TenantTier, TierMember};
pub use token::{AuthSession, SignedToken, TokenService};
pub use two_factor::{TwoFactorProvider, disable_two_factor, enable_two_factor};

// Re-exported so operations can derive field validation without a direct dependency.
pub use validator;

//! Authentication error types.

use thiserror::Error;

use tessera_core::DomainError;

use crate::two_factor::TwoFactorProvider;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AuthError {
    /// No credential was presented.
    #[error("missing credential")]
    MissingCredential,

    #[error("token has expired")]
    TokenExpired,

    #[error("invalid token: {0}")]
    TokenInvalid(String),

    #[error("refresh token is unknown or revoked")]
    RefreshTokenInvalid,

    #[error("refresh token has expired")]
    RefreshTokenExpired,

    /// The refresh token was consumed by a concurrent rotation.
    #[error("refresh token was already rotated")]
    RefreshTokenReplayed,

    #[error("two-factor authentication required via {0}")]
    TwoFactorRequired(TwoFactorProvider),

    #[error("{field}: {message}")]
    Validation {
        field: &'static str,
        message: String,
    },

    #[error("invalid auth configuration: {0}")]
    InvalidConfig(String),

    /// Claims generators produced a name reserved for core claims.
    #[error("claim '{0}' collides with a reserved claim")]
    ReservedClaim(String),

    /// The key ring found itself in an impossible state (e.g. two active keys).
    #[error("signing key invariant violated: {0}")]
    KeyringInvariant(String),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("cryptography error: {0}")]
    Crypto(String),
}

impl AuthError {
    pub fn validation(field: &'static str, message: impl Into<String>) -> Self {
        Self::Validation {
            field,
            message: message.into(),
        }
    }

    pub fn invalid_config(msg: impl Into<String>) -> Self {
        Self::InvalidConfig(msg.into())
    }
}

impl From<AuthError> for DomainError {
    fn from(err: AuthError) -> Self {
        match err {
            AuthError::MissingCredential
            | AuthError::TokenExpired
            | AuthError::TokenInvalid(_)
            | AuthError::RefreshTokenInvalid
            | AuthError::RefreshTokenExpired => DomainError::Unauthenticated(err.to_string()),
            AuthError::RefreshTokenReplayed => DomainError::Conflict(err.to_string()),
            AuthError::TwoFactorRequired(provider) => DomainError::TwoFactorRequired {
                provider: provider.to_string(),
            },
            AuthError::Validation { .. } => DomainError::Validation(err.to_string()),
            AuthError::InvalidConfig(_)
            | AuthError::ReservedClaim(_)
            | AuthError::KeyringInvariant(_)
            | AuthError::Storage(_)
            | AuthError::Crypto(_) => DomainError::Fatal(err.to_string()),
        }
    }
}

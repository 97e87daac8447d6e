//! Error taxonomy shared by every layer.

use thiserror::Error;

/// Result type used across the domain layer.
pub type DomainResult<T> = Result<T, DomainError>;

/// Top-level error categories.
///
/// Component errors (`AuthError`, `OutboxStoreError`, ...) convert into this
/// enum so callers at the edge can map one type onto responses and metrics.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DomainError {
    /// No credential, or a credential that failed verification.
    #[error("unauthenticated: {0}")]
    Unauthenticated(String),

    /// Valid credential, insufficient tier or leader status.
    #[error("forbidden: {0}")]
    Forbidden(String),

    /// Valid credential, but a second factor is still outstanding.
    ///
    /// Kept apart from `Forbidden` because the caller can remediate it.
    #[error("two-factor authentication required ({provider})")]
    TwoFactorRequired { provider: String },

    /// Field-level input errors.
    #[error("validation failed: {0}")]
    Validation(String),

    #[error("not found")]
    NotFound,

    /// A concurrent writer won (stale refresh token, lost compare-and-swap).
    #[error("conflict: {0}")]
    Conflict(String),

    /// Publishing an outbox message failed; it will be retried.
    #[error("transient delivery failure: {0}")]
    TransientDelivery(String),

    /// Programming error or broken invariant. The operation must halt.
    #[error("fatal: {0}")]
    Fatal(String),
}

impl DomainError {
    pub fn unauthenticated(msg: impl Into<String>) -> Self {
        Self::Unauthenticated(msg.into())
    }

    pub fn forbidden(msg: impl Into<String>) -> Self {
        Self::Forbidden(msg.into())
    }

    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn conflict(msg: impl Into<String>) -> Self {
        Self::Conflict(msg.into())
    }

    pub fn fatal(msg: impl Into<String>) -> Self {
        Self::Fatal(msg.into())
    }

    pub fn not_found() -> Self {
        Self::NotFound
    }

    /// Whether retrying the same operation later can succeed without any
    /// change on the caller's side.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::TransientDelivery(_) | Self::Conflict(_))
    }
}

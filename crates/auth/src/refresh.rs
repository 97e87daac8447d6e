//! Long-lived refresh tokens.
//!
//! The caller receives an opaque secret; only its SHA-256 hash is stored.
//! Rotation is a compare-and-swap on the stored row, so of two concurrent
//! refreshes with the same secret exactly one wins.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use chrono::{DateTime, Duration, Utc};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{info, instrument, warn};

use tessera_core::{Clock, RefreshTokenId, UserId};

use crate::config::{AuthConfig, DEFAULT_REFRESH_TOKEN_LIFETIME_SECS};
use crate::error::AuthError;

/// Upper bound on the secret a client may present.
pub const MAX_SECRET_LEN: usize = 200;

const SECRET_BYTES: usize = 32;

/// A stored refresh token. Holds the secret's hash, never the secret.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RefreshToken {
    pub id: RefreshTokenId,
    pub token_hash: String,
    pub user_id: UserId,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl RefreshToken {
    /// Valid up to and including `expires_at`.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at < now
    }
}

/// A freshly issued token together with the secret handed to the client.
#[derive(Clone)]
pub struct IssuedRefreshToken {
    pub token: RefreshToken,
    pub secret: String,
}

impl core::fmt::Debug for IssuedRefreshToken {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("IssuedRefreshToken")
            .field("token", &self.token)
            .field("secret", &"<redacted>")
            .finish()
    }
}

pub fn hash_secret(secret: &str) -> String {
    hex::encode(Sha256::digest(secret.as_bytes()))
}

fn generate_secret() -> String {
    let mut bytes = [0u8; SECRET_BYTES];
    rand::rngs::OsRng.fill_bytes(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}

/// Persistence for refresh tokens.
pub trait RefreshTokenRepository: Send + Sync {
    fn insert(&self, token: RefreshToken) -> Result<(), AuthError>;

    fn find_by_hash(&self, token_hash: &str) -> Result<Option<RefreshToken>, AuthError>;

    /// Replace `expected` with `replacement` if `expected` is still stored.
    ///
    /// Returns `false` without writing when another caller already removed it.
    fn replace(
        &self,
        expected: RefreshTokenId,
        replacement: RefreshToken,
    ) -> Result<bool, AuthError>;

    fn delete(&self, id: RefreshTokenId) -> Result<bool, AuthError>;

    fn delete_for_user(&self, user_id: UserId) -> Result<usize, AuthError>;

    fn delete_expired(&self, now: DateTime<Utc>) -> Result<usize, AuthError>;
}

impl<R> RefreshTokenRepository for Arc<R>
where
    R: RefreshTokenRepository + ?Sized,
{
    fn insert(&self, token: RefreshToken) -> Result<(), AuthError> {
        (**self).insert(token)
    }

    fn find_by_hash(&self, token_hash: &str) -> Result<Option<RefreshToken>, AuthError> {
        (**self).find_by_hash(token_hash)
    }

    fn replace(
        &self,
        expected: RefreshTokenId,
        replacement: RefreshToken,
    ) -> Result<bool, AuthError> {
        (**self).replace(expected, replacement)
    }

    fn delete(&self, id: RefreshTokenId) -> Result<bool, AuthError> {
        (**self).delete(id)
    }

    fn delete_for_user(&self, user_id: UserId) -> Result<usize, AuthError> {
        (**self).delete_for_user(user_id)
    }

    fn delete_expired(&self, now: DateTime<Utc>) -> Result<usize, AuthError> {
        (**self).delete_expired(now)
    }
}

#[derive(Debug, Default)]
pub struct InMemoryRefreshTokenRepository {
    tokens: RwLock<HashMap<RefreshTokenId, RefreshToken>>,
}

impl InMemoryRefreshTokenRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.tokens.read().map(|t| t.len()).unwrap_or_default()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn poisoned() -> AuthError {
    AuthError::Storage("lock poisoned".into())
}

impl RefreshTokenRepository for InMemoryRefreshTokenRepository {
    fn insert(&self, token: RefreshToken) -> Result<(), AuthError> {
        let mut tokens = self.tokens.write().map_err(|_| poisoned())?;
        tokens.insert(token.id, token);
        Ok(())
    }

    fn find_by_hash(&self, token_hash: &str) -> Result<Option<RefreshToken>, AuthError> {
        let tokens = self.tokens.read().map_err(|_| poisoned())?;
        Ok(tokens.values().find(|t| t.token_hash == token_hash).cloned())
    }

    fn replace(
        &self,
        expected: RefreshTokenId,
        replacement: RefreshToken,
    ) -> Result<bool, AuthError> {
        let mut tokens = self.tokens.write().map_err(|_| poisoned())?;
        if tokens.remove(&expected).is_none() {
            return Ok(false);
        }
        tokens.insert(replacement.id, replacement);
        Ok(true)
    }

    fn delete(&self, id: RefreshTokenId) -> Result<bool, AuthError> {
        let mut tokens = self.tokens.write().map_err(|_| poisoned())?;
        Ok(tokens.remove(&id).is_some())
    }

    fn delete_for_user(&self, user_id: UserId) -> Result<usize, AuthError> {
        let mut tokens = self.tokens.write().map_err(|_| poisoned())?;
        let before = tokens.len();
        tokens.retain(|_, t| t.user_id != user_id);
        Ok(before - tokens.len())
    }

    fn delete_expired(&self, now: DateTime<Utc>) -> Result<usize, AuthError> {
        let mut tokens = self.tokens.write().map_err(|_| poisoned())?;
        let before = tokens.len();
        tokens.retain(|_, t| !t.is_expired(now));
        Ok(before - tokens.len())
    }
}

/// Issues, rotates and revokes refresh tokens.
pub struct RefreshTokenStore {
    repository: Arc<dyn RefreshTokenRepository>,
    clock: Arc<dyn Clock>,
    default_lifetime: Duration,
}

impl RefreshTokenStore {
    pub fn new(
        repository: Arc<dyn RefreshTokenRepository>,
        clock: Arc<dyn Clock>,
        config: &AuthConfig,
    ) -> Self {
        let default_lifetime = if config.refresh_token_lifetime_secs > 0 {
            config.refresh_token_lifetime()
        } else {
            Duration::seconds(DEFAULT_REFRESH_TOKEN_LIFETIME_SECS)
        };
        Self {
            repository,
            clock,
            default_lifetime,
        }
    }

    fn mint(&self, user_id: UserId, lifetime: Duration) -> Result<IssuedRefreshToken, AuthError> {
        let lifetime = if lifetime > Duration::zero() {
            lifetime
        } else {
            self.default_lifetime
        };
        let now = self.clock.now();
        let expires_at = now
            .checked_add_signed(lifetime)
            .ok_or_else(|| AuthError::validation("lifetime", "expiry is out of range"))?;
        let secret = generate_secret();
        Ok(IssuedRefreshToken {
            token: RefreshToken {
                id: RefreshTokenId::new(),
                token_hash: hash_secret(&secret),
                user_id,
                created_at: now,
                expires_at,
            },
            secret,
        })
    }

    /// Issue a new token. A non-positive `lifetime` selects the default.
    #[instrument(skip(self))]
    pub fn issue(&self, user_id: UserId, lifetime: Duration) -> Result<IssuedRefreshToken, AuthError> {
        let issued = self.mint(user_id, lifetime)?;
        self.repository.insert(issued.token.clone())?;
        Ok(issued)
    }

    /// Look up the live token behind `secret`.
    pub fn verify(&self, secret: &str) -> Result<RefreshToken, AuthError> {
        if secret.is_empty() || secret.len() > MAX_SECRET_LEN {
            return Err(AuthError::RefreshTokenInvalid);
        }
        let token = self
            .repository
            .find_by_hash(&hash_secret(secret))?
            .ok_or(AuthError::RefreshTokenInvalid)?;
        if token.is_expired(self.clock.now()) {
            return Err(AuthError::RefreshTokenExpired);
        }
        Ok(token)
    }

    /// Exchange `secret` for a new token; the old one stops working.
    #[instrument(skip_all)]
    pub fn rotate(&self, secret: &str) -> Result<IssuedRefreshToken, AuthError> {
        let current = match self.verify(secret) {
            Err(AuthError::RefreshTokenExpired) => {
                // Expired rows are useless; drop them eagerly.
                if let Some(stale) = self.repository.find_by_hash(&hash_secret(secret))? {
                    self.repository.delete(stale.id)?;
                }
                return Err(AuthError::RefreshTokenExpired);
            }
            other => other?,
        };

        let next = self.mint(current.user_id, self.default_lifetime)?;
        if !self.repository.replace(current.id, next.token.clone())? {
            warn!(user_id = %current.user_id, token_id = %current.id, "refresh token replayed during rotation");
            return Err(AuthError::RefreshTokenReplayed);
        }
        Ok(next)
    }

    /// Revoke every token of `user_id`. Effective immediately.
    #[instrument(skip(self))]
    pub fn revoke_all(&self, user_id: UserId) -> Result<usize, AuthError> {
        let revoked = self.repository.delete_for_user(user_id)?;
        info!(%user_id, revoked, "refresh tokens revoked");
        Ok(revoked)
    }

    #[instrument(skip(self))]
    pub fn purge_expired(&self, now: DateTime<Utc>) -> Result<usize, AuthError> {
        let purged = self.repository.delete_expired(now)?;
        if purged > 0 {
            info!(purged, "purged expired refresh tokens");
        }
        Ok(purged)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tessera_core::ManualClock;

    fn store() -> (Arc<ManualClock>, Arc<InMemoryRefreshTokenRepository>, RefreshTokenStore) {
        let clock = Arc::new(ManualClock::starting_now());
        let repo = Arc::new(InMemoryRefreshTokenRepository::new());
        let store = RefreshTokenStore::new(repo.clone(), clock.clone(), &AuthConfig::default());
        (clock, repo, store)
    }

    #[test]
    fn secrets_are_opaque_and_only_hashes_are_stored() {
        let (_clock, repo, store) = store();
        let issued = store.issue(UserId::new(), Duration::hours(1)).unwrap();

        assert_eq!(issued.secret.len(), 43);
        assert!(issued.secret.len() <= MAX_SECRET_LEN);
        assert_ne!(issued.token.token_hash, issued.secret);
        assert!(repo.find_by_hash(&issued.secret).unwrap().is_none());
        assert_eq!(store.verify(&issued.secret).unwrap().id, issued.token.id);
    }

    #[test]
    fn non_positive_lifetime_uses_default() {
        let (clock, _repo, store) = store();
        let issued = store.issue(UserId::new(), Duration::zero()).unwrap();
        assert_eq!(
            issued.token.expires_at,
            clock.now() + Duration::seconds(DEFAULT_REFRESH_TOKEN_LIFETIME_SECS)
        );
    }

    #[test]
    fn rotation_invalidates_the_old_secret() {
        let (_clock, _repo, store) = store();
        let first = store.issue(UserId::new(), Duration::hours(1)).unwrap();

        let second = store.rotate(&first.secret).unwrap();
        assert_eq!(second.token.user_id, first.token.user_id);
        assert_eq!(store.rotate(&first.secret).unwrap_err(), AuthError::RefreshTokenInvalid);
        assert!(store.verify(&second.secret).is_ok());
    }

    /// Lets a competing rotation win between lookup and swap.
    struct RacingRepository {
        inner: InMemoryRefreshTokenRepository,
    }

    impl RefreshTokenRepository for RacingRepository {
        fn insert(&self, token: RefreshToken) -> Result<(), AuthError> {
            self.inner.insert(token)
        }

        fn find_by_hash(&self, token_hash: &str) -> Result<Option<RefreshToken>, AuthError> {
            self.inner.find_by_hash(token_hash)
        }

        fn replace(&self, expected: RefreshTokenId, replacement: RefreshToken) -> Result<bool, AuthError> {
            self.inner.delete(expected)?;
            self.inner.replace(expected, replacement)
        }

        fn delete(&self, id: RefreshTokenId) -> Result<bool, AuthError> {
            self.inner.delete(id)
        }

        fn delete_for_user(&self, user_id: UserId) -> Result<usize, AuthError> {
            self.inner.delete_for_user(user_id)
        }

        fn delete_expired(&self, now: DateTime<Utc>) -> Result<usize, AuthError> {
            self.inner.delete_expired(now)
        }
    }

    #[test]
    fn losing_the_swap_reports_replay() {
        let clock = Arc::new(ManualClock::starting_now());
        let repo = Arc::new(RacingRepository {
            inner: InMemoryRefreshTokenRepository::new(),
        });
        let store = RefreshTokenStore::new(repo.clone(), clock, &AuthConfig::default());
        let issued = store.issue(UserId::new(), Duration::hours(1)).unwrap();

        assert_eq!(store.rotate(&issued.secret).unwrap_err(), AuthError::RefreshTokenReplayed);
        assert!(repo.inner.is_empty());
    }

    #[test]
    fn revoke_all_kills_every_token_of_the_user() {
        let (_clock, repo, store) = store();
        let user = UserId::new();
        let other = store.issue(UserId::new(), Duration::hours(1)).unwrap();
        let a = store.issue(user, Duration::hours(1)).unwrap();
        let b = store.issue(user, Duration::hours(1)).unwrap();

        assert_eq!(store.revoke_all(user).unwrap(), 2);
        assert_eq!(store.verify(&a.secret).unwrap_err(), AuthError::RefreshTokenInvalid);
        assert_eq!(store.verify(&b.secret).unwrap_err(), AuthError::RefreshTokenInvalid);
        assert!(store.verify(&other.secret).is_ok());
        assert_eq!(repo.len(), 1);
    }

    #[test]
    fn expired_tokens_fail_and_get_purged() {
        let (clock, repo, store) = store();
        let issued = store.issue(UserId::new(), Duration::minutes(5)).unwrap();
        store.issue(UserId::new(), Duration::days(1)).unwrap();

        clock.advance(Duration::minutes(5) + Duration::seconds(1));
        assert_eq!(store.verify(&issued.secret).unwrap_err(), AuthError::RefreshTokenExpired);
        assert_eq!(store.purge_expired(clock.now()).unwrap(), 1);
        assert_eq!(repo.len(), 1);
    }

    #[test]
    fn token_is_still_valid_at_its_expiry_instant() {
        let (clock, _repo, store) = store();
        let issued = store.issue(UserId::new(), Duration::hours(1)).unwrap();

        clock.advance(Duration::hours(1));
        assert_eq!(clock.now(), issued.token.expires_at);
        assert!(store.verify(&issued.secret).is_ok());
        assert_eq!(store.purge_expired(clock.now()).unwrap(), 0);

        clock.advance(Duration::milliseconds(1));
        assert_eq!(store.verify(&issued.secret).unwrap_err(), AuthError::RefreshTokenExpired);
    }

    #[test]
    fn out_of_range_lifetime_is_a_validation_error() {
        let (_clock, repo, store) = store();
        let err = store.issue(UserId::new(), Duration::MAX).unwrap_err();
        assert!(matches!(err, AuthError::Validation { field: "lifetime", .. }));
        assert!(repo.is_empty());
    }

    #[test]
    fn oversized_secrets_are_rejected_without_lookup() {
        let (_clock, _repo, store) = store();
        let long = "x".repeat(MAX_SECRET_LEN + 1);
        assert_eq!(store.verify(&long).unwrap_err(), AuthError::RefreshTokenInvalid);
    }
}

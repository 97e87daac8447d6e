//! Signing key ownership, rotation and the published verification set.
//!
//! ## Rotation
//!
//! `rotate()` retires the active key and inserts a new active key in one store
//! operation, then swaps the in-process snapshot. Retired keys stay in the
//! published set for `key_grace_period`, which the config guarantees is longer
//! than any access token lifetime. Tokens signed just before a rotation
//! therefore keep verifying until they expire on their own.
//!
//! Purging retired keys past the grace period is a maintenance job
//! (`purge_expired`), never part of issuance or verification.

use std::sync::{Arc, Mutex, RwLock};

use chrono::{DateTime, Utc};
use jsonwebtoken::Algorithm;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use tessera_core::Clock;

use crate::config::AuthConfig;
use crate::error::AuthError;

/// Algorithm used for every signing key.
pub const SIGNING_ALGORITHM: Algorithm = Algorithm::HS256;

#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeyStatus {
    Active,
    Retired,
}

/// A signing key with its secret material.
///
/// Not serialisable; [`KeySetDocument`] is the only published form.
#[derive(Clone, PartialEq, Eq)]
pub struct SigningKey {
    pub id: String,
    material: Vec<u8>,
    pub created_at: DateTime<Utc>,
    pub status: KeyStatus,
    pub retired_at: Option<DateTime<Utc>>,
}

impl SigningKey {
    /// Generate a fresh active key from the OS random source.
    pub fn generate(material_len: usize, now: DateTime<Utc>) -> Self {
        let mut material = vec![0u8; material_len];
        rand::rngs::OsRng.fill_bytes(&mut material);
        Self {
            id: Uuid::now_v7().to_string(),
            material,
            created_at: now,
            status: KeyStatus::Active,
            retired_at: None,
        }
    }

    /// Rebuild a key loaded from storage.
    pub fn from_parts(
        id: impl Into<String>,
        material: Vec<u8>,
        created_at: DateTime<Utc>,
        status: KeyStatus,
        retired_at: Option<DateTime<Utc>>,
    ) -> Self {
        Self {
            id: id.into(),
            material,
            created_at,
            status,
            retired_at,
        }
    }

    pub fn material(&self) -> &[u8] {
        &self.material
    }

    pub fn is_active(&self) -> bool {
        self.status == KeyStatus::Active
    }

    /// Whether this key still belongs in the published verification set.
    pub fn is_published_at(&self, now: DateTime<Utc>, grace: chrono::Duration) -> bool {
        match (self.status, self.retired_at) {
            (KeyStatus::Active, _) => true,
            (KeyStatus::Retired, Some(retired_at)) => now < retired_at + grace,
            (KeyStatus::Retired, None) => false,
        }
    }

    fn retire(&mut self, at: DateTime<Utc>) {
        self.status = KeyStatus::Retired;
        self.retired_at = Some(at);
    }
}

impl core::fmt::Debug for SigningKey {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("SigningKey")
            .field("id", &self.id)
            .field("material", &"<redacted>")
            .field("created_at", &self.created_at)
            .field("status", &self.status)
            .field("retired_at", &self.retired_at)
            .finish()
    }
}

/// Persistence for signing keys.
pub trait SigningKeyStore: Send + Sync {
    fn load_all(&self) -> Result<Vec<SigningKey>, AuthError>;

    /// Atomically retire `retiring` (the current active key, if any) and
    /// insert `new_key` as the active key.
    ///
    /// Must fail without changes when `retiring` is not the active key, so
    /// two concurrent rotations cannot both succeed.
    fn rotate(
        &self,
        retiring: Option<&str>,
        retired_at: DateTime<Utc>,
        new_key: SigningKey,
    ) -> Result<(), AuthError>;

    /// Delete retired keys whose retirement happened before `cutoff`.
    fn delete_retired_before(&self, cutoff: DateTime<Utc>) -> Result<usize, AuthError>;
}

impl<S> SigningKeyStore for Arc<S>
where
    S: SigningKeyStore + ?Sized,
{
    fn load_all(&self) -> Result<Vec<SigningKey>, AuthError> {
        (**self).load_all()
    }

    fn rotate(
        &self,
        retiring: Option<&str>,
        retired_at: DateTime<Utc>,
        new_key: SigningKey,
    ) -> Result<(), AuthError> {
        (**self).rotate(retiring, retired_at, new_key)
    }

    fn delete_retired_before(&self, cutoff: DateTime<Utc>) -> Result<usize, AuthError> {
        (**self).delete_retired_before(cutoff)
    }
}

/// In-memory key store for tests/dev.
#[derive(Debug, Default)]
pub struct InMemorySigningKeyStore {
    keys: RwLock<Vec<SigningKey>>,
}

impl InMemorySigningKeyStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed the store with arbitrary rows (including invalid states).
    pub fn with_keys(keys: Vec<SigningKey>) -> Self {
        Self {
            keys: RwLock::new(keys),
        }
    }
}

impl SigningKeyStore for InMemorySigningKeyStore {
    fn load_all(&self) -> Result<Vec<SigningKey>, AuthError> {
        let keys = self
            .keys
            .read()
            .map_err(|_| AuthError::Storage("lock poisoned".into()))?;
        Ok(keys.clone())
    }

    fn rotate(
        &self,
        retiring: Option<&str>,
        retired_at: DateTime<Utc>,
        new_key: SigningKey,
    ) -> Result<(), AuthError> {
        let mut keys = self
            .keys
            .write()
            .map_err(|_| AuthError::Storage("lock poisoned".into()))?;

        let active: Vec<&str> = keys
            .iter()
            .filter(|k| k.is_active())
            .map(|k| k.id.as_str())
            .collect();

        match (retiring, active.as_slice()) {
            (None, []) => {}
            (Some(id), [current]) if *current == id => {}
            (_, found) => {
                return Err(AuthError::KeyringInvariant(format!(
                    "expected active key {retiring:?}, found {found:?}"
                )));
            }
        }

        if let Some(id) = retiring {
            if let Some(key) = keys.iter_mut().find(|k| k.id == id) {
                key.retire(retired_at);
            }
        }
        keys.push(new_key);
        Ok(())
    }

    fn delete_retired_before(&self, cutoff: DateTime<Utc>) -> Result<usize, AuthError> {
        let mut keys = self
            .keys
            .write()
            .map_err(|_| AuthError::Storage("lock poisoned".into()))?;
        let before = keys.len();
        keys.retain(|k| !matches!(k.retired_at, Some(at) if k.status == KeyStatus::Retired && at < cutoff));
        Ok(before - keys.len())
    }
}

/// Immutable view of the key set; replaced wholesale on rotation.
#[derive(Debug)]
struct KeySnapshot {
    active: SigningKey,
    retired: Vec<SigningKey>,
}

impl KeySnapshot {
    fn build(keys: Vec<SigningKey>) -> Result<Self, AuthError> {
        let (mut active, mut retired): (Vec<_>, Vec<_>) =
            keys.into_iter().partition(SigningKey::is_active);

        if active.len() != 1 {
            return Err(AuthError::KeyringInvariant(format!(
                "expected exactly one active signing key, found {}",
                active.len()
            )));
        }

        // Most recently retired first.
        retired.sort_by(|a, b| b.retired_at.cmp(&a.retired_at));
        Ok(Self {
            active: active.remove(0),
            retired,
        })
    }
}

/// Public, secret-free description of one verification key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PublishedKey {
    pub kid: String,
    pub kty: &'static str,
    pub alg: &'static str,
    #[serde(rename = "use")]
    pub key_use: &'static str,
    pub status: KeyStatus,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retired_at: Option<DateTime<Utc>>,
}

/// JWKS-style discovery document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct KeySetDocument {
    pub keys: Vec<PublishedKey>,
}

/// Owner of the signing keys.
pub struct SigningKeyring {
    store: Arc<dyn SigningKeyStore>,
    clock: Arc<dyn Clock>,
    config: AuthConfig,
    snapshot: RwLock<Arc<KeySnapshot>>,
    rotation: Mutex<()>,
}

impl SigningKeyring {
    /// Load the key set, creating the first active key if the store is empty.
    #[instrument(skip_all)]
    pub fn open(
        store: Arc<dyn SigningKeyStore>,
        clock: Arc<dyn Clock>,
        config: AuthConfig,
    ) -> Result<Self, AuthError> {
        config.validate()?;

        let mut keys = store.load_all()?;
        if keys.is_empty() {
            let first = SigningKey::generate(config.key_material_len, clock.now());
            info!(kid = %first.id, "no signing keys found; bootstrapping the first active key");
            store.rotate(None, clock.now(), first)?;
            keys = store.load_all()?;
        }

        let snapshot = KeySnapshot::build(keys).inspect_err(|e| {
            error!(error = %e, "signing key store is inconsistent");
        })?;

        Ok(Self {
            store,
            clock,
            config,
            snapshot: RwLock::new(Arc::new(snapshot)),
            rotation: Mutex::new(()),
        })
    }

    fn snapshot(&self) -> Arc<KeySnapshot> {
        match self.snapshot.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    fn publish(&self, snapshot: KeySnapshot) {
        let mut guard = match self.snapshot.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        *guard = Arc::new(snapshot);
    }

    /// The key new tokens are signed with.
    pub fn current_key(&self) -> SigningKey {
        self.snapshot().active.clone()
    }

    /// Every key a verifier must accept right now: the active key plus
    /// retired keys still inside the grace period.
    pub fn published_key_set(&self) -> Vec<SigningKey> {
        let snapshot = self.snapshot();
        let now = self.clock.now();
        let grace = self.config.key_grace_period();

        std::iter::once(&snapshot.active)
            .chain(snapshot.retired.iter())
            .filter(|k| k.is_published_at(now, grace))
            .cloned()
            .collect()
    }

    pub fn key_set_document(&self) -> KeySetDocument {
        KeySetDocument {
            keys: self
                .published_key_set()
                .into_iter()
                .map(|k| PublishedKey {
                    kid: k.id,
                    kty: "oct",
                    alg: "HS256",
                    key_use: "sig",
                    status: k.status,
                    created_at: k.created_at,
                    retired_at: k.retired_at,
                })
                .collect(),
        }
    }

    /// Retire the active key and make a new one active.
    ///
    /// When another instance sharing the store rotated first, the snapshot
    /// is reloaded and the rotation retried once against the fresh active key.
    #[instrument(skip(self))]
    pub fn rotate(&self) -> Result<SigningKey, AuthError> {
        let _guard = self
            .rotation
            .lock()
            .map_err(|_| AuthError::KeyringInvariant("rotation lock poisoned".into()))?;

        let retiring = self.snapshot().active.id.clone();
        match self.rotate_from(&retiring) {
            Err(AuthError::KeyringInvariant(reason)) => {
                self.reload()?;
                let fresh = self.snapshot().active.id.clone();
                if fresh == retiring {
                    return Err(AuthError::KeyringInvariant(reason));
                }
                debug!(stale_kid = %retiring, active_kid = %fresh, "key set changed underneath; retrying rotation");
                self.rotate_from(&fresh)
            }
            other => other,
        }
    }

    fn rotate_from(&self, retiring: &str) -> Result<SigningKey, AuthError> {
        let now = self.clock.now();
        let next = SigningKey::generate(self.config.key_material_len, now);

        self.store.rotate(Some(retiring), now, next.clone())?;
        let snapshot = KeySnapshot::build(self.store.load_all()?)?;
        self.publish(snapshot);

        info!(retired_kid = %retiring, active_kid = %next.id, "signing key rotated");
        Ok(next)
    }

    /// Like [`published_key_set`](Self::published_key_set), but reloads once
    /// when `kid` is not in the local snapshot.
    pub fn published_key_set_for(&self, kid: Option<&str>) -> Vec<SigningKey> {
        let keys = self.published_key_set();
        let Some(kid) = kid else {
            return keys;
        };
        if keys.iter().any(|k| k.id == kid) {
            return keys;
        }

        match self.reload() {
            Ok(()) => {
                debug!(kid, "reloaded key set for unknown key id");
                self.published_key_set()
            }
            Err(e) => {
                warn!(kid, error = %e, "key set reload failed");
                keys
            }
        }
    }

    /// Re-read the store, picking up rotations made by other instances.
    pub fn reload(&self) -> Result<(), AuthError> {
        let snapshot = KeySnapshot::build(self.store.load_all()?)?;
        self.publish(snapshot);
        Ok(())
    }

    /// Delete retired keys whose grace period has elapsed.
    #[instrument(skip(self))]
    pub fn purge_expired(&self) -> Result<usize, AuthError> {
        let cutoff = self.clock.now() - self.config.key_grace_period();
        let purged = self.store.delete_retired_before(cutoff)?;
        self.reload()?;
        if purged > 0 {
            info!(purged, "purged retired signing keys");
        } else {
            debug!("no retired signing keys past their grace period");
        }
        Ok(purged)
    }
}

impl core::fmt::Debug for SigningKeyring {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("SigningKeyring")
            .field("active", &self.snapshot().active.id)
            .finish_non_exhaustive()
    }
}

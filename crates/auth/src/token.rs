//! Access token issuance and verification.

use std::sync::Arc;

use chrono::{DateTime, SubsecRound, Utc};
use jsonwebtoken::errors::ErrorKind;
use jsonwebtoken::{DecodingKey, EncodingKey, Header, Validation};
use tracing::{debug, instrument, warn};
use uuid::Uuid;

use tessera_core::Clock;

use crate::claims::{AccessClaims, TokenValidationError, VerifiedClaims, validate_claims};
use crate::composer::ClaimsComposer;
use crate::config::AuthConfig;
use crate::error::AuthError;
use crate::keyring::{SIGNING_ALGORITHM, SigningKey, SigningKeyring};
use crate::principal::{Principal, PrincipalContext};

/// What the current login session has already proven.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct AuthSession {
    pub two_factor_verified: bool,
}

impl AuthSession {
    pub fn password_only() -> Self {
        Self::default()
    }

    pub fn two_factor_verified() -> Self {
        Self {
            two_factor_verified: true,
        }
    }
}

/// A signed access token and the metadata callers usually need next to it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignedToken {
    pub token: String,
    pub key_id: String,
    pub token_id: String,
    pub expires_at: DateTime<Utc>,
}

pub struct TokenService {
    composer: Arc<ClaimsComposer>,
    keyring: Arc<SigningKeyring>,
    clock: Arc<dyn Clock>,
    config: AuthConfig,
}

impl TokenService {
    pub fn new(
        composer: Arc<ClaimsComposer>,
        keyring: Arc<SigningKeyring>,
        clock: Arc<dyn Clock>,
        config: AuthConfig,
    ) -> Self {
        Self {
            composer,
            keyring,
            clock,
            config,
        }
    }

    pub fn keyring(&self) -> &Arc<SigningKeyring> {
        &self.keyring
    }

    /// Sign an access token for `principal` with the current key.
    #[instrument(skip_all, fields(user_id = %principal.user_id()))]
    pub fn issue_access_token(
        &self,
        principal: &Principal,
        session: &AuthSession,
    ) -> Result<SignedToken, AuthError> {
        if let Some(provider) = principal.user().two_factor {
            if !session.two_factor_verified {
                debug!(%provider, "second factor outstanding; token withheld");
                return Err(AuthError::TwoFactorRequired(provider));
            }
        }

        let set = self.composer.compose(principal)?;
        // JWT timestamps are whole seconds.
        let issued_at = self.clock.now().trunc_subsecs(0);
        let expires_at = issued_at + self.config.access_token_lifetime();
        let token_id = Uuid::now_v7().to_string();

        let claims = AccessClaims {
            sub: set.subject,
            username: set.username,
            email: set.email,
            team_id: set.team_id,
            tier: set.tier,
            position: set.position,
            leader: set.leader,
            iss: self.config.issuer.clone(),
            jti: token_id.clone(),
            issued_at,
            expires_at,
            extensions: set.extensions,
        };

        let key = self.keyring.current_key();
        let mut header = Header::new(SIGNING_ALGORITHM);
        header.kid = Some(key.id.clone());

        let token = jsonwebtoken::encode(&header, &claims, &EncodingKey::from_secret(key.material()))
            .map_err(|e| AuthError::Crypto(e.to_string()))?;

        Ok(SignedToken {
            token,
            key_id: key.id,
            token_id,
            expires_at,
        })
    }

    /// Check the signature against the published key set, then the issuer and
    /// the time window against the injected clock.
    pub fn verify(&self, token: &str) -> Result<VerifiedClaims, AuthError> {
        let header = jsonwebtoken::decode_header(token)
            .map_err(|e| AuthError::TokenInvalid(e.to_string()))?;
        if header.alg != SIGNING_ALGORITHM {
            return Err(AuthError::TokenInvalid(format!(
                "unsupported algorithm {:?}",
                header.alg
            )));
        }

        let mut validation = Validation::new(SIGNING_ALGORITHM);
        // Expiry is checked below with the injected clock.
        validation.validate_exp = false;
        validation.set_issuer(&[self.config.issuer.as_str()]);

        let claims = self.decode_with_published_keys(token, header.kid.as_deref(), &validation)?;

        validate_claims(&claims, self.clock.now()).map_err(|e| match e {
            TokenValidationError::Expired => AuthError::TokenExpired,
            other => AuthError::TokenInvalid(other.to_string()),
        })?;

        Ok(VerifiedClaims::new(claims))
    }

    fn decode_with_published_keys(
        &self,
        token: &str,
        kid: Option<&str>,
        validation: &Validation,
    ) -> Result<AccessClaims, AuthError> {
        let mut keys = self.keyring.published_key_set_for(kid);
        // Named key first, then everything else still published.
        if let Some(kid) = kid {
            keys.sort_by_key(|k: &SigningKey| k.id != kid);
        }

        for key in &keys {
            match jsonwebtoken::decode::<AccessClaims>(
                token,
                &DecodingKey::from_secret(key.material()),
                validation,
            ) {
                Ok(data) => return Ok(data.claims),
                Err(e) if matches!(e.kind(), ErrorKind::InvalidSignature) => continue,
                Err(e) => return Err(AuthError::TokenInvalid(e.to_string())),
            }
        }

        warn!(kid = ?kid, published = keys.len(), "token signature matches no published key");
        Err(AuthError::TokenInvalid(
            "signature does not match any published key".into(),
        ))
    }

    /// Turn an `Authorization` header value into a request principal.
    pub fn authenticate(&self, bearer: Option<&str>) -> Result<PrincipalContext, AuthError> {
        let raw = bearer.unwrap_or_default().trim();
        let token = match raw.strip_prefix("Bearer") {
            Some(rest) if rest.is_empty() || rest.starts_with(' ') => rest.trim(),
            _ => raw,
        };
        if token.is_empty() {
            return Err(AuthError::MissingCredential);
        }

        let verified = self.verify(token)?;
        Ok(PrincipalContext::from_verified(verified))
    }
}

impl core::fmt::Debug for TokenService {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("TokenService")
            .field("issuer", &self.config.issuer)
            .field("keyring", &self.keyring)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use tessera_core::{ManualClock, TeamId, UserId};

    use crate::keyring::InMemorySigningKeyStore;
    use crate::tier::{TenantTier, Team, TierMember};
    use crate::two_factor::TwoFactorProvider;
    use crate::UserAccount;

    struct Fixture {
        clock: Arc<ManualClock>,
        service: TokenService,
    }

    fn fixture() -> Fixture {
        let clock = Arc::new(ManualClock::starting_now());
        let config = AuthConfig::default();
        let keyring = SigningKeyring::open(
            Arc::new(InMemorySigningKeyStore::new()),
            clock.clone(),
            config.clone(),
        )
        .unwrap();
        let service = TokenService::new(
            Arc::new(ClaimsComposer::new(config.claim_prefix.clone())),
            Arc::new(keyring),
            clock.clone(),
            config,
        );
        Fixture { clock, service }
    }

    fn principal() -> Principal {
        let team = Team::new(TeamId::new(), "Acme", TenantTier::Maintenance, 1, 5).unwrap();
        let user = UserAccount::new(UserId::new(), team.id, "jane", "jane@acme.test", 3);
        Principal::resolve(user, team).unwrap()
    }

    #[test]
    fn token_verifies_until_it_expires() {
        let f = fixture();
        let p = principal();
        let signed = f
            .service
            .issue_access_token(&p, &AuthSession::password_only())
            .unwrap();

        let verified = f.service.verify(&signed.token).unwrap();
        assert_eq!(verified.claims().sub, p.user_id());
        assert_eq!(verified.claims().tier, TenantTier::Maintenance);
        assert_eq!(verified.claims().expires_at, signed.expires_at);

        f.clock.advance(Duration::minutes(15));
        assert_eq!(f.service.verify(&signed.token), Err(AuthError::TokenExpired));
    }

    #[test]
    fn rotated_key_verifies_until_grace_elapses() {
        let f = fixture();
        let signed = f
            .service
            .issue_access_token(&principal(), &AuthSession::password_only())
            .unwrap();

        f.service.keyring().rotate().unwrap();
        assert!(f.service.verify(&signed.token).is_ok());

        f.clock.advance(AuthConfig::default().key_grace_period());
        assert!(matches!(
            f.service.verify(&signed.token),
            Err(AuthError::TokenInvalid(_))
        ));
    }

    #[test]
    fn tokens_signed_after_rotation_use_the_new_key() {
        let f = fixture();
        let new_key = f.service.keyring().rotate().unwrap();
        let signed = f
            .service
            .issue_access_token(&principal(), &AuthSession::password_only())
            .unwrap();
        assert_eq!(signed.key_id, new_key.id);
        assert!(f.service.verify(&signed.token).is_ok());
    }

    #[test]
    fn tokens_signed_by_another_instance_verify_after_its_rotation() {
        let clock = Arc::new(ManualClock::starting_now());
        let config = AuthConfig::default();
        let store = Arc::new(InMemorySigningKeyStore::new());
        let service = |store: Arc<InMemorySigningKeyStore>| {
            let keyring =
                SigningKeyring::open(store, clock.clone(), config.clone()).unwrap();
            TokenService::new(
                Arc::new(ClaimsComposer::new(config.claim_prefix.clone())),
                Arc::new(keyring),
                clock.clone(),
                config.clone(),
            )
        };
        let issuer = service(store.clone());
        let verifier = service(store);

        issuer.keyring().rotate().unwrap();
        let signed = issuer
            .issue_access_token(&principal(), &AuthSession::password_only())
            .unwrap();

        assert!(verifier.verify(&signed.token).is_ok());
        assert_eq!(verifier.keyring().current_key().id, signed.key_id);
    }

    #[test]
    fn two_factor_accounts_need_a_verified_session() {
        let f = fixture();
        let team = Team::new(TeamId::new(), "Acme", TenantTier::Customer, 1, 5).unwrap();
        let mut user = UserAccount::new(UserId::new(), team.id, "jane", "jane@acme.test", 3);
        user.two_factor = Some(TwoFactorProvider::Sms);
        let p = Principal::resolve(user, team).unwrap();

        assert_eq!(
            f.service.issue_access_token(&p, &AuthSession::password_only()),
            Err(AuthError::TwoFactorRequired(TwoFactorProvider::Sms))
        );
        assert!(f
            .service
            .issue_access_token(&p, &AuthSession::two_factor_verified())
            .is_ok());
    }

    #[test]
    fn tampered_tokens_are_rejected() {
        let f = fixture();
        let signed = f
            .service
            .issue_access_token(&principal(), &AuthSession::password_only())
            .unwrap();
        let mut parts: Vec<&str> = signed.token.split('.').collect();
        parts[2] = "AAAA";
        let forged = parts.join(".");

        assert!(matches!(f.service.verify(&forged), Err(AuthError::TokenInvalid(_))));
        assert!(matches!(f.service.verify("not-a-jwt"), Err(AuthError::TokenInvalid(_))));
    }

    #[test]
    fn authenticate_builds_context_from_bearer_header() {
        let f = fixture();
        let p = principal();
        let signed = f
            .service
            .issue_access_token(&p, &AuthSession::password_only())
            .unwrap();

        let ctx = f
            .service
            .authenticate(Some(&format!("Bearer {}", signed.token)))
            .unwrap();
        assert_eq!(ctx.user_id(), p.user_id());
        assert_eq!(ctx.token_id(), signed.token_id);
        assert!(ctx.tier_at_least(TenantTier::Maintenance));

        assert_eq!(f.service.authenticate(None), Err(AuthError::MissingCredential));
        assert_eq!(
            f.service.authenticate(Some("Bearer ")),
            Err(AuthError::MissingCredential)
        );
    }
}

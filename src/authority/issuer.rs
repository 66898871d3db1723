//! Session issuance, refresh rotation and access token validation.
//!
//! Flow Overview:
//! 1) `issue_session` creates a `BASIC` session, signs an access token and stores the
//!    hash of a fresh refresh token with rotation counter 0.
//! 2) `refresh` hashes the presented token, finds its session through the index and
//!    runs the whole redemption inside the session transaction:
//!    - consumed token: reuse, the session is revoked and `REFRESH_REUSED` returned,
//!      unless it is an idempotent retry carrying the same key inside the retry window;
//!    - revoked or expired session: rejected, revoke wins over a concurrent refresh;
//!    - otherwise the successor pair is built first, then the old token is marked used.
//! 3) `validate_access_token` checks signature and expiry, then the session's revoked
//!    flag in the authoritative store.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::{collections::BTreeSet, sync::Arc};
use tracing::{info, warn};
use utoipa::ToSchema;

use super::{
    config::AuthorityConfig,
    error::{AuthError, AuthResult},
    store::{
        RefreshTokenRecord, RetryGrant, RevocationReason, Session, SessionEntry, SessionStore,
        slide_expiry,
    },
    token::AccessTokenCodec,
    types::{AssuranceLevel, PrincipalId, SessionId},
    utils::{generate_opaque_token, hash_token},
};

#[derive(Clone, Debug, Eq, PartialEq, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct AccessToken {
    pub token: String,
    pub expires_at: DateTime<Utc>,
}

#[derive(Clone, Debug, Eq, PartialEq, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct RefreshToken {
    pub token: String,
    pub rotation_counter: u64,
    pub expires_at: DateTime<Utc>,
}

#[derive(Clone, Debug, Eq, PartialEq, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct TokenPair {
    pub access_token: AccessToken,
    pub refresh_token: RefreshToken,
}

#[derive(Clone, Debug, Eq, PartialEq, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct IssuedSession {
    pub session: Session,
    pub access_token: AccessToken,
    pub refresh_token: RefreshToken,
}

/// Claims of a valid access token whose session is still live.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ValidatedAccess {
    pub principal_id: PrincipalId,
    pub session_id: SessionId,
    pub assurance_level: AssuranceLevel,
}

pub struct TokenIssuer {
    config: Arc<AuthorityConfig>,
    codec: AccessTokenCodec,
    store: Arc<SessionStore>,
}

impl TokenIssuer {
    #[must_use]
    pub fn new(
        config: Arc<AuthorityConfig>,
        codec: AccessTokenCodec,
        store: Arc<SessionStore>,
    ) -> Self {
        Self {
            config,
            codec,
            store,
        }
    }

    /// Create a session for a verified principal.
    ///
    /// # Errors
    /// Returns `Internal` if randomness or signing fails.
    pub fn issue_session(&self, principal_id: PrincipalId) -> AuthResult<IssuedSession> {
        let now = self.store.now();
        let session_id = SessionId::generate()?;
        let expires_at = (now + self.config.refresh_token_ttl())
            .min(now + self.config.session_max_lifetime());
        let session = Session {
            session_id: session_id.clone(),
            principal_id,
            created_at: now,
            last_refreshed_at: now,
            expires_at,
            assurance_level: AssuranceLevel::Basic,
            revoked: false,
            revoked_at: None,
            revocation_reason: None,
            observers: BTreeSet::new(),
        };

        let access_token = self.mint_access_token(&session, now)?;
        let refresh_token = generate_opaque_token()?;
        let refresh_expires_at = now + self.config.refresh_token_ttl();
        let record = RefreshTokenRecord {
            refresh_token_id: hash_token(&refresh_token),
            session_id: session_id.clone(),
            rotation_counter: 0,
            issued_at: now,
            expires_at: refresh_expires_at,
            used_at: None,
            replaced_by: None,
            retry: None,
        };
        self.store.insert(session.clone(), record)?;

        info!(principal_id = %principal_id, "Session issued");
        Ok(IssuedSession {
            session,
            access_token,
            refresh_token: RefreshToken {
                token: refresh_token,
                rotation_counter: 0,
                expires_at: refresh_expires_at,
            },
        })
    }

    /// Redeem a refresh token exactly once.
    ///
    /// # Errors
    /// `RefreshInvalid` for unknown tokens, `RefreshReused` for a consumed token
    /// (the session is revoked as a side effect), `SessionRevoked`, `SessionExpired`,
    /// or `Internal` if the successor cannot be built.
    pub fn refresh(
        &self,
        refresh_token: &str,
        idempotency_key: Option<&str>,
    ) -> AuthResult<TokenPair> {
        let refresh_token_id = hash_token(refresh_token.trim());
        let session_id = self
            .store
            .session_for_refresh(&refresh_token_id)
            .ok_or(AuthError::RefreshInvalid)?;

        let outcome = self.store.transact(&session_id, |entry, now| {
            self.redeem(entry, &refresh_token_id, idempotency_key, now)
        });

        match outcome {
            Ok(Redemption::Rotated {
                pair,
                successor_id,
                pruned,
            }) => {
                self.store.index_refresh(successor_id, session_id);
                self.store.unindex_refresh(&pruned);
                Ok(pair)
            }
            Ok(Redemption::Replayed(pair)) => {
                info!(session_id = %session_id, "Refresh retry answered idempotently");
                Ok(pair)
            }
            Err(AuthError::RefreshReused) => {
                warn!(session_id = %session_id, "Refresh token reuse detected, session revoked");
                Err(AuthError::RefreshReused)
            }
            Err(err) => Err(err),
        }
    }

    fn redeem(
        &self,
        entry: &mut SessionEntry,
        refresh_token_id: &str,
        idempotency_key: Option<&str>,
        now: DateTime<Utc>,
    ) -> AuthResult<Redemption> {
        let record = entry
            .refresh_tokens
            .get(refresh_token_id)
            .cloned()
            .ok_or(AuthError::RefreshInvalid)?;

        if let Some(used_at) = record.used_at {
            if !entry.session.revoked {
                if let Some(pair) =
                    self.retry_grant(entry, &record, used_at, idempotency_key, now)
                {
                    return Ok(Redemption::Replayed(pair));
                }
            }
            entry.mark_revoked(now, RevocationReason::RefreshReuse);
            return Err(AuthError::RefreshReused);
        }

        entry.session.ensure_active(now)?;
        if record.expires_at <= now {
            return Err(AuthError::SessionExpired);
        }

        // Build everything fallible before consuming the old token.
        let mut next = entry.session.clone();
        slide_expiry(
            &mut next,
            now,
            self.config.refresh_token_ttl(),
            self.config.session_max_lifetime(),
        );
        let access_token = self.mint_access_token(&next, now)?;
        let successor = generate_opaque_token()?;
        let successor_id = hash_token(&successor);
        let rotation_counter = record.rotation_counter + 1;
        let refresh_expires_at = (now + self.config.refresh_token_ttl()).min(next.expires_at);
        let pair = TokenPair {
            access_token,
            refresh_token: RefreshToken {
                token: successor,
                rotation_counter,
                expires_at: refresh_expires_at,
            },
        };

        if let Some(old) = entry.refresh_tokens.get_mut(refresh_token_id) {
            old.used_at = Some(now);
            old.replaced_by = Some(successor_id.clone());
            old.retry = idempotency_key.map(|key| RetryGrant {
                idempotency_key: key.to_string(),
                access_token: pair.access_token.token.clone(),
                access_token_expires_at: pair.access_token.expires_at,
                refresh_token: pair.refresh_token.token.clone(),
            });
        }
        entry.refresh_tokens.insert(
            successor_id.clone(),
            RefreshTokenRecord {
                refresh_token_id: successor_id.clone(),
                session_id: next.session_id.clone(),
                rotation_counter,
                issued_at: now,
                expires_at: refresh_expires_at,
                used_at: None,
                replaced_by: None,
                retry: None,
            },
        );
        entry.session.last_refreshed_at = next.last_refreshed_at;
        entry.session.expires_at = next.expires_at;

        let pruned = self.prune(entry, now);
        Ok(Redemption::Rotated {
            pair,
            successor_id,
            pruned,
        })
    }

    fn retry_grant(
        &self,
        entry: &SessionEntry,
        record: &RefreshTokenRecord,
        used_at: DateTime<Utc>,
        idempotency_key: Option<&str>,
        now: DateTime<Utc>,
    ) -> Option<TokenPair> {
        let key = idempotency_key?;
        let grant = record.retry.as_ref()?;
        if grant.idempotency_key != key || now - used_at > self.config.refresh_retry_window() {
            return None;
        }
        let successor = entry.refresh_tokens.get(record.replaced_by.as_deref()?)?;
        if successor.used_at.is_some() {
            return None;
        }
        Some(TokenPair {
            access_token: AccessToken {
                token: grant.access_token.clone(),
                expires_at: grant.access_token_expires_at,
            },
            refresh_token: RefreshToken {
                token: grant.refresh_token.clone(),
                rotation_counter: successor.rotation_counter,
                expires_at: successor.expires_at,
            },
        })
    }

    /// Drop retry grants past the window and consumed records past their expiry.
    fn prune(&self, entry: &mut SessionEntry, now: DateTime<Utc>) -> Vec<String> {
        let window = self.config.refresh_retry_window();
        for record in entry.refresh_tokens.values_mut() {
            if record.used_at.is_some_and(|used| now - used > window) {
                record.retry = None;
            }
        }
        let expired: Vec<String> = entry
            .refresh_tokens
            .values()
            .filter(|record| record.used_at.is_some() && record.expires_at <= now)
            .map(|record| record.refresh_token_id.clone())
            .collect();
        for id in &expired {
            entry.refresh_tokens.remove(id);
        }
        expired
    }

    /// Sign an access token reflecting the session's current assurance.
    ///
    /// # Errors
    /// Returns `Internal` if signing fails.
    pub fn mint_access_token(&self, session: &Session, now: DateTime<Utc>) -> AuthResult<AccessToken> {
        let expires_at = now + self.config.access_token_ttl();
        let token = self.codec.sign(
            session.principal_id,
            &session.session_id,
            session.assurance_level,
            now,
            expires_at,
        )?;
        Ok(AccessToken { token, expires_at })
    }

    /// Validate a bearer access token against signature, expiry and the store.
    ///
    /// # Errors
    /// `SignatureInvalid`, `TokenExpired`, `SessionRevoked` (also for purged
    /// sessions) or `SessionExpired`.
    pub fn validate_access_token(&self, token: &str) -> AuthResult<ValidatedAccess> {
        let now = self.store.now();
        let verified = self.codec.verify(token, now)?;
        let session = self
            .store
            .get(&verified.session_id)
            .ok_or(AuthError::SessionRevoked)?;
        if session.principal_id != verified.principal_id {
            return Err(AuthError::SignatureInvalid);
        }
        session.ensure_active(now)?;
        Ok(ValidatedAccess {
            principal_id: verified.principal_id,
            session_id: verified.session_id,
            assurance_level: verified.assurance_level,
        })
    }
}

enum Redemption {
    Rotated {
        pair: TokenPair,
        successor_id: String,
        pruned: Vec<String>,
    },
    Replayed(TokenPair),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::authority::{clock::ManualClock, token::SigningKeys};
    use anyhow::Result;
    use chrono::Duration;

    struct Harness {
        clock: Arc<ManualClock>,
        store: Arc<SessionStore>,
        issuer: TokenIssuer,
    }

    fn harness() -> Harness {
        let clock = Arc::new(ManualClock::at_unix(1_700_000_000));
        let config = Arc::new(AuthorityConfig::new().with_refresh_retry_window_seconds(30));
        let store = Arc::new(SessionStore::new(config.clone(), clock.clone()));
        let codec = AccessTokenCodec::new("ics".to_string(), SigningKeys::from_seed(&[3; 32]));
        Harness {
            clock,
            store: store.clone(),
            issuer: TokenIssuer::new(config, codec, store),
        }
    }

    #[test]
    fn issue_session_defaults() -> Result<()> {
        let h = harness();
        let issued = h.issuer.issue_session(PrincipalId::new())?;
        assert_eq!(issued.session.assurance_level, AssuranceLevel::Basic);
        assert!(issued.session.expires_at > issued.session.created_at);
        assert_eq!(
            issued.access_token.expires_at - issued.session.created_at,
            Duration::seconds(3600)
        );
        assert_eq!(issued.refresh_token.rotation_counter, 0);

        let validated = h.issuer.validate_access_token(&issued.access_token.token)?;
        assert_eq!(validated.session_id, issued.session.session_id);
        assert_eq!(validated.assurance_level, AssuranceLevel::Basic);
        Ok(())
    }

    #[test]
    fn refresh_rotates_and_old_token_is_single_use() -> Result<()> {
        let h = harness();
        let issued = h.issuer.issue_session(PrincipalId::new())?;

        h.clock.advance(Duration::seconds(10));
        let pair = h.issuer.refresh(&issued.refresh_token.token, None)?;
        assert_eq!(pair.refresh_token.rotation_counter, 1);
        assert_ne!(pair.refresh_token.token, issued.refresh_token.token);

        assert_eq!(
            h.issuer.refresh(&issued.refresh_token.token, None),
            Err(AuthError::RefreshReused)
        );
        let session = h
            .store
            .get(&issued.session.session_id)
            .ok_or_else(|| anyhow::anyhow!("session missing"))?;
        assert!(session.revoked);
        assert_eq!(session.revocation_reason, Some(RevocationReason::RefreshReuse));

        // The legitimate successor dies with the session.
        assert_eq!(
            h.issuer.refresh(&pair.refresh_token.token, None),
            Err(AuthError::SessionRevoked)
        );
        assert_eq!(
            h.issuer.validate_access_token(&pair.access_token.token),
            Err(AuthError::SessionRevoked)
        );
        Ok(())
    }

    #[test]
    fn idempotent_retry_returns_same_pair() -> Result<()> {
        let h = harness();
        let issued = h.issuer.issue_session(PrincipalId::new())?;

        let first = h.issuer.refresh(&issued.refresh_token.token, Some("req-1"))?;
        h.clock.advance(Duration::seconds(5));
        let retry = h.issuer.refresh(&issued.refresh_token.token, Some("req-1"))?;
        assert_eq!(first, retry);

        // A different key is reuse.
        assert_eq!(
            h.issuer.refresh(&issued.refresh_token.token, Some("req-2")),
            Err(AuthError::RefreshReused)
        );
        Ok(())
    }

    #[test]
    fn idempotent_retry_expires_with_window() -> Result<()> {
        let h = harness();
        let issued = h.issuer.issue_session(PrincipalId::new())?;
        h.issuer.refresh(&issued.refresh_token.token, Some("req-1"))?;
        h.clock.advance(Duration::seconds(31));
        assert_eq!(
            h.issuer.refresh(&issued.refresh_token.token, Some("req-1")),
            Err(AuthError::RefreshReused)
        );
        Ok(())
    }

    #[test]
    fn idempotent_retry_refused_once_successor_used() -> Result<()> {
        let h = harness();
        let issued = h.issuer.issue_session(PrincipalId::new())?;
        let first = h.issuer.refresh(&issued.refresh_token.token, Some("req-1"))?;
        h.issuer.refresh(&first.refresh_token.token, None)?;
        assert_eq!(
            h.issuer.refresh(&issued.refresh_token.token, Some("req-1")),
            Err(AuthError::RefreshReused)
        );
        Ok(())
    }

    #[test]
    fn unknown_refresh_token_is_invalid() {
        let h = harness();
        assert_eq!(
            h.issuer.refresh("not-a-token", None),
            Err(AuthError::RefreshInvalid)
        );
    }

    #[test]
    fn revoked_session_refuses_refresh() -> Result<()> {
        let h = harness();
        let issued = h.issuer.issue_session(PrincipalId::new())?;
        h.store
            .revoke(&issued.session.session_id, RevocationReason::Logout)?;
        assert_eq!(
            h.issuer.refresh(&issued.refresh_token.token, None),
            Err(AuthError::SessionRevoked)
        );
        Ok(())
    }

    #[test]
    fn expired_session_refuses_refresh_and_access() -> Result<()> {
        let h = harness();
        let issued = h.issuer.issue_session(PrincipalId::new())?;
        h.clock.advance(Duration::days(8));
        assert_eq!(
            h.issuer.refresh(&issued.refresh_token.token, None),
            Err(AuthError::SessionExpired)
        );
        assert_eq!(
            h.issuer.validate_access_token(&issued.access_token.token),
            Err(AuthError::TokenExpired)
        );
        Ok(())
    }

    #[test]
    fn refresh_extends_session_window() -> Result<()> {
        let h = harness();
        let issued = h.issuer.issue_session(PrincipalId::new())?;
        h.clock.advance(Duration::days(1));
        h.issuer.refresh(&issued.refresh_token.token, None)?;
        let session = h
            .store
            .get(&issued.session.session_id)
            .ok_or_else(|| anyhow::anyhow!("session missing"))?;
        assert_eq!(session.expires_at, issued.session.expires_at + Duration::days(1));
        assert_eq!(session.last_refreshed_at, issued.session.created_at + Duration::days(1));
        Ok(())
    }
}

//! Cross-application SSO coordination.
//!
//! Applications in the trust domain observe a session instead of re-authenticating
//! and query it through `check_session`. Reads go to the authoritative store unless a
//! snapshot cache is configured; cached snapshots are bounded by the configured TTL
//! and discarded as soon as the store's revocation epoch moves.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, warn};

use super::{
    config::AuthorityConfig,
    error::{AuthError, AuthResult},
    store::{RevocationNotice, RevocationReason, Session, SessionStore},
    types::{PrincipalId, SessionId},
};

const MAX_CACHED_SESSIONS: usize = 10_000;

struct CachedSession {
    session: Session,
    fetched_at: DateTime<Utc>,
    epoch: u64,
}

pub struct SsoCoordinator {
    config: Arc<AuthorityConfig>,
    store: Arc<SessionStore>,
    cache: DashMap<SessionId, CachedSession>,
}

impl SsoCoordinator {
    #[must_use]
    pub fn new(config: Arc<AuthorityConfig>, store: Arc<SessionStore>) -> Self {
        Self {
            config,
            store,
            cache: DashMap::new(),
        }
    }

    /// Record that `application_id` has encountered the session.
    ///
    /// # Errors
    /// `ApplicationNotTrusted` outside the trust domain, `SessionNotFound`,
    /// `SessionRevoked` or `SessionExpired`.
    pub fn observe(&self, session_id: &SessionId, application_id: &str) -> AuthResult<Session> {
        let application_id = application_id.trim();
        if application_id.is_empty() {
            return Err(AuthError::InvalidRequest(
                "application id is required".to_string(),
            ));
        }
        if !self.config.application_trusted(application_id) {
            warn!(application_id, "Observation from application outside trust domain");
            return Err(AuthError::ApplicationNotTrusted);
        }
        let session = self.store.transact(session_id, |entry, now| {
            entry.session.ensure_active(now)?;
            if entry.session.observers.insert(application_id.to_string()) {
                debug!(application_id, "Application joined session");
            }
            Ok(entry.session.clone())
        })?;
        self.cache.remove(session_id);
        Ok(session)
    }

    /// The query participating applications make instead of re-authenticating.
    ///
    /// # Errors
    /// `SessionNotFound`, `SessionRevoked` or `SessionExpired`.
    pub fn check_session(&self, session_id: &SessionId) -> AuthResult<Session> {
        let now = self.store.now();
        let session = match self.cached(session_id, now) {
            Some(session) => session,
            None => {
                let epoch = self.store.revocation_epoch();
                let session = self
                    .store
                    .get(session_id)
                    .ok_or(AuthError::SessionNotFound)?;
                self.remember(&session, now, epoch);
                session
            }
        };
        session.ensure_active(now)?;
        Ok(session)
    }

    /// Revoke the whole cross-application session.
    ///
    /// # Errors
    /// Returns `SessionNotFound` for an unknown id.
    pub fn logout_everywhere(&self, session_id: &SessionId) -> AuthResult<Session> {
        let session = self
            .store
            .revoke(session_id, RevocationReason::LogoutEverywhere)?;
        self.cache.remove(session_id);
        Ok(session)
    }

    /// Revoke every session a principal holds.
    pub fn logout_principal(&self, principal_id: PrincipalId) -> Vec<SessionId> {
        let revoked = self
            .store
            .revoke_all(principal_id, RevocationReason::LogoutEverywhere);
        for session_id in &revoked {
            self.cache.remove(session_id);
        }
        revoked
    }

    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<RevocationNotice> {
        self.store.subscribe()
    }

    /// Drop stale cache entries. Returns the number removed.
    pub fn sweep(&self) -> usize {
        let now = self.store.now();
        let epoch = self.store.revocation_epoch();
        let ttl = self.config.sso_cache_ttl();
        let before = self.cache.len();
        self.cache
            .retain(|_, cached| cached.epoch == epoch && now - cached.fetched_at < ttl);
        before.saturating_sub(self.cache.len())
    }

    fn cached(&self, session_id: &SessionId, now: DateTime<Utc>) -> Option<Session> {
        let ttl = self.config.sso_cache_ttl();
        if ttl <= chrono::Duration::zero() {
            return None;
        }
        let epoch = self.store.revocation_epoch();
        let cached = self.cache.get(session_id)?;
        (cached.epoch == epoch && now - cached.fetched_at < ttl).then(|| cached.session.clone())
    }

    fn remember(&self, session: &Session, now: DateTime<Utc>, epoch: u64) {
        if self.config.sso_cache_ttl() <= chrono::Duration::zero()
            || self.cache.len() >= MAX_CACHED_SESSIONS
        {
            return;
        }
        self.cache.insert(
            session.session_id.clone(),
            CachedSession {
                session: session.clone(),
                fetched_at: now,
                epoch,
            },
        );
    }
}

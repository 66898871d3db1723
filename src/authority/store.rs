//! Authoritative session store.
//!
//! Sessions live in a sharded map keyed by session id. Every mutation of one
//! session runs inside that session's entry guard, so refresh, step-up and revoke
//! on the same session serialize while unrelated sessions proceed in parallel.
//! Lock order is always the session entry first, then the secondary indexes; the
//! indexes are only read with their guards dropped before a session is locked.
//!
//! Revocations bump a store-wide epoch and publish a `RevocationNotice` for
//! observer-facing adapters.

use chrono::{DateTime, Utc};
use dashmap::{DashMap, DashSet};
use serde::Serialize;
use std::{
    collections::{BTreeSet, HashMap},
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
};
use tokio::sync::broadcast;
use tracing::{debug, info};
use utoipa::ToSchema;

use super::{
    clock::Clock,
    config::AuthorityConfig,
    error::{AuthError, AuthResult},
    types::{AssuranceLevel, ChallengeId, PrincipalId, SessionId},
};

const NOTICE_CHANNEL_CAPACITY: usize = 1024;

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum RevocationReason {
    Logout,
    LogoutEverywhere,
    RefreshReuse,
    PrincipalDeactivated,
}

/// Snapshot of a session record.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    #[schema(value_type = String)]
    pub session_id: SessionId,
    #[schema(value_type = String, format = Uuid)]
    pub principal_id: PrincipalId,
    pub created_at: DateTime<Utc>,
    pub last_refreshed_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub assurance_level: AssuranceLevel,
    pub revoked: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub revoked_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub revocation_reason: Option<RevocationReason>,
    /// Applications that have observed this session.
    pub observers: BTreeSet<String>,
}

impl Session {
    #[must_use]
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }

    /// `SessionRevoked` wins over `SessionExpired`.
    ///
    /// # Errors
    /// Returns the reason the session is no longer usable.
    pub fn ensure_active(&self, now: DateTime<Utc>) -> AuthResult<()> {
        if self.revoked {
            return Err(AuthError::SessionRevoked);
        }
        if self.is_expired(now) {
            return Err(AuthError::SessionExpired);
        }
        Ok(())
    }
}

/// Refresh token state. The raw token is never stored, only its hash.
#[derive(Clone, Debug)]
pub struct RefreshTokenRecord {
    pub refresh_token_id: String,
    pub session_id: SessionId,
    pub rotation_counter: u64,
    pub issued_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub used_at: Option<DateTime<Utc>>,
    pub replaced_by: Option<String>,
    pub(crate) retry: Option<RetryGrant>,
}

/// Successor pair kept for an idempotent retry of a redemption.
#[derive(Clone, Debug)]
pub(crate) struct RetryGrant {
    pub idempotency_key: String,
    pub access_token: String,
    pub access_token_expires_at: DateTime<Utc>,
    pub refresh_token: String,
}

/// Mutable state of one session, reachable only through `SessionStore::transact`.
#[derive(Debug)]
pub struct SessionEntry {
    pub session: Session,
    pub(crate) refresh_tokens: HashMap<String, RefreshTokenRecord>,
    pub(crate) pending_challenge: Option<ChallengeId>,
}

impl SessionEntry {
    /// Mark revoked. Returns false if it already was.
    pub fn mark_revoked(&mut self, now: DateTime<Utc>, reason: RevocationReason) -> bool {
        if self.session.revoked {
            return false;
        }
        self.session.revoked = true;
        self.session.revoked_at = Some(now);
        self.session.revocation_reason = Some(reason);
        self.pending_challenge = None;
        true
    }

    /// Raise the assurance level; never lowers it.
    pub fn upgrade_assurance(&mut self, level: AssuranceLevel) {
        if level > self.session.assurance_level {
            self.session.assurance_level = level;
        }
    }
}

#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RevocationNotice {
    pub session_id: SessionId,
    pub principal_id: PrincipalId,
    pub observers: BTreeSet<String>,
    pub reason: RevocationReason,
    pub revoked_at: DateTime<Utc>,
}

pub struct SessionStore {
    config: Arc<AuthorityConfig>,
    clock: Arc<dyn Clock>,
    sessions: DashMap<SessionId, SessionEntry>,
    by_principal: DashMap<PrincipalId, DashSet<SessionId>>,
    by_refresh: DashMap<String, SessionId>,
    revocation_epoch: AtomicU64,
    notices: broadcast::Sender<RevocationNotice>,
}

impl SessionStore {
    #[must_use]
    pub fn new(config: Arc<AuthorityConfig>, clock: Arc<dyn Clock>) -> Self {
        let (notices, _) = broadcast::channel(NOTICE_CHANNEL_CAPACITY);
        Self {
            config,
            clock,
            sessions: DashMap::new(),
            by_principal: DashMap::new(),
            by_refresh: DashMap::new(),
            revocation_epoch: AtomicU64::new(0),
            notices,
        }
    }

    #[must_use]
    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    /// Register a new session with its first refresh token.
    ///
    /// # Errors
    /// Returns `Internal` on a session id collision.
    pub fn insert(&self, session: Session, refresh: RefreshTokenRecord) -> AuthResult<()> {
        let session_id = session.session_id.clone();
        let principal_id = session.principal_id;
        let refresh_id = refresh.refresh_token_id.clone();
        match self.sessions.entry(session_id.clone()) {
            dashmap::mapref::entry::Entry::Occupied(_) => {
                return Err(AuthError::Internal("session id collision".to_string()));
            }
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(SessionEntry {
                    session,
                    refresh_tokens: HashMap::from([(refresh_id.clone(), refresh)]),
                    pending_challenge: None,
                });
                self.by_refresh.insert(refresh_id, session_id.clone());
            }
        }
        self.by_principal
            .entry(principal_id)
            .or_default()
            .insert(session_id);
        Ok(())
    }

    /// Create or update a session record. Assurance never decreases and a
    /// revoked session stays revoked.
    pub fn put(&self, session: Session) {
        let principal_id = session.principal_id;
        let session_id = session.session_id.clone();
        let mut newly_revoked = None;
        match self.sessions.entry(session_id.clone()) {
            dashmap::mapref::entry::Entry::Occupied(mut existing) => {
                let entry = existing.get_mut();
                let previous = entry.session.clone();
                entry.session = session;
                entry.upgrade_assurance(previous.assurance_level);
                if previous.revoked {
                    entry.session.revoked = true;
                    entry.session.revoked_at = previous.revoked_at;
                    entry.session.revocation_reason = previous.revocation_reason;
                } else if entry.session.revoked {
                    entry.pending_challenge = None;
                    newly_revoked = Some(notice_for(entry));
                }
            }
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(SessionEntry {
                    session,
                    refresh_tokens: HashMap::new(),
                    pending_challenge: None,
                });
            }
        }
        self.by_principal
            .entry(principal_id)
            .or_default()
            .insert(session_id);
        if let Some(notice) = newly_revoked {
            self.publish(notice);
        }
    }

    #[must_use]
    pub fn get(&self, session_id: &SessionId) -> Option<Session> {
        self.sessions
            .get(session_id)
            .map(|entry| entry.session.clone())
    }

    /// Run `apply` under the session's exclusive guard.
    ///
    /// The guard is released before any revocation notice is published.
    ///
    /// # Errors
    /// `SessionNotFound` if the session does not exist, otherwise whatever `apply` returns.
    pub fn transact<R>(
        &self,
        session_id: &SessionId,
        apply: impl FnOnce(&mut SessionEntry, DateTime<Utc>) -> AuthResult<R>,
    ) -> AuthResult<R> {
        let now = self.clock.now();
        let (result, notice) = {
            let mut entry = self
                .sessions
                .get_mut(session_id)
                .ok_or(AuthError::SessionNotFound)?;
            let was_revoked = entry.session.revoked;
            let result = apply(&mut entry, now);
            let notice = (!was_revoked && entry.session.revoked).then(|| notice_for(&entry));
            (result, notice)
        };
        if let Some(notice) = notice {
            self.publish(notice);
        }
        result
    }

    /// Revoke one session. Idempotent.
    ///
    /// # Errors
    /// Returns `SessionNotFound` for an unknown id.
    pub fn revoke(&self, session_id: &SessionId, reason: RevocationReason) -> AuthResult<Session> {
        self.transact(session_id, |entry, now| {
            entry.mark_revoked(now, reason);
            Ok(entry.session.clone())
        })
    }

    /// Revoke every session of a principal. Returns the ids newly revoked.
    pub fn revoke_all(&self, principal_id: PrincipalId, reason: RevocationReason) -> Vec<SessionId> {
        let session_ids: Vec<SessionId> = self
            .by_principal
            .get(&principal_id)
            .map(|ids| ids.iter().map(|id| id.key().clone()).collect())
            .unwrap_or_default();
        session_ids
            .into_iter()
            .filter(|session_id| {
                self.transact(session_id, |entry, now| Ok(entry.mark_revoked(now, reason)))
                    .unwrap_or(false)
            })
            .collect()
    }

    /// Slide the expiry window: `min(now + refreshTtl, createdAt + maxLifetime)`.
    ///
    /// # Errors
    /// `SessionNotFound`, `SessionRevoked` or `SessionExpired`.
    pub fn touch(&self, session_id: &SessionId) -> AuthResult<Session> {
        let refresh_ttl = self.config.refresh_token_ttl();
        let max_lifetime = self.config.session_max_lifetime();
        self.transact(session_id, |entry, now| {
            entry.session.ensure_active(now)?;
            slide_expiry(&mut entry.session, now, refresh_ttl, max_lifetime);
            Ok(entry.session.clone())
        })
    }

    /// Monotonic assurance upgrade of a live session.
    ///
    /// # Errors
    /// `SessionNotFound`, `SessionRevoked` or `SessionExpired`.
    pub fn upgrade_assurance(
        &self,
        session_id: &SessionId,
        level: AssuranceLevel,
    ) -> AuthResult<Session> {
        self.transact(session_id, |entry, now| {
            entry.session.ensure_active(now)?;
            entry.upgrade_assurance(level);
            Ok(entry.session.clone())
        })
    }

    /// Session owning a refresh token hash, if any.
    #[must_use]
    pub fn session_for_refresh(&self, refresh_token_id: &str) -> Option<SessionId> {
        self.by_refresh
            .get(refresh_token_id)
            .map(|session_id| session_id.clone())
    }

    pub(crate) fn index_refresh(&self, refresh_token_id: String, session_id: SessionId) {
        self.by_refresh.insert(refresh_token_id, session_id);
    }

    pub(crate) fn unindex_refresh(&self, refresh_token_ids: &[String]) {
        for id in refresh_token_ids {
            self.by_refresh.remove(id);
        }
    }

    /// Active (unrevoked, unexpired) session ids of a principal.
    #[must_use]
    pub fn active_sessions(&self, principal_id: PrincipalId) -> Vec<SessionId> {
        let now = self.clock.now();
        let session_ids: Vec<SessionId> = self
            .by_principal
            .get(&principal_id)
            .map(|ids| ids.iter().map(|id| id.key().clone()).collect())
            .unwrap_or_default();
        session_ids
            .into_iter()
            .filter(|id| {
                self.get(id)
                    .is_some_and(|session| session.ensure_active(now).is_ok())
            })
            .collect()
    }

    /// Drop sessions that expired or were revoked more than `grace` ago.
    pub fn purge_expired(&self, grace: chrono::Duration) -> usize {
        let cutoff = self.clock.now() - grace;
        let mut purged: Vec<(SessionId, PrincipalId, Vec<String>)> = Vec::new();
        self.sessions.retain(|session_id, entry| {
            let dead_since = if entry.session.revoked {
                entry.session.revoked_at
            } else {
                Some(entry.session.expires_at)
            };
            let keep = dead_since.is_none_or(|at| at > cutoff);
            if !keep {
                purged.push((
                    session_id.clone(),
                    entry.session.principal_id,
                    entry.refresh_tokens.keys().cloned().collect(),
                ));
            }
            keep
        });
        for (session_id, principal_id, refresh_ids) in &purged {
            self.unindex_refresh(refresh_ids);
            self.by_principal.remove_if(principal_id, |_, ids| {
                ids.remove(session_id);
                ids.is_empty()
            });
        }
        if !purged.is_empty() {
            debug!(count = purged.len(), "Purged dead sessions");
        }
        purged.len()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Sessions neither revoked nor expired.
    #[must_use]
    pub fn active_count(&self) -> usize {
        let now = self.clock.now();
        self.sessions
            .iter()
            .filter(|entry| !entry.session.revoked && !entry.session.is_expired(now))
            .count()
    }

    /// Incremented on every revocation.
    #[must_use]
    pub fn revocation_epoch(&self) -> u64 {
        self.revocation_epoch.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<RevocationNotice> {
        self.notices.subscribe()
    }

    fn publish(&self, notice: RevocationNotice) {
        self.revocation_epoch.fetch_add(1, Ordering::AcqRel);
        info!(
            session_id = %notice.session_id,
            principal_id = %notice.principal_id,
            reason = ?notice.reason,
            observers = notice.observers.len(),
            "Session revoked"
        );
        // No subscribers is not an error.
        let _ = self.notices.send(notice);
    }
}

pub(crate) fn slide_expiry(
    session: &mut Session,
    now: DateTime<Utc>,
    refresh_ttl: chrono::Duration,
    max_lifetime: chrono::Duration,
) {
    session.last_refreshed_at = now;
    session.expires_at = (now + refresh_ttl).min(session.created_at + max_lifetime);
}

fn notice_for(entry: &SessionEntry) -> RevocationNotice {
    RevocationNotice {
        session_id: entry.session.session_id.clone(),
        principal_id: entry.session.principal_id,
        observers: entry.session.observers.clone(),
        reason: entry
            .session
            .revocation_reason
            .unwrap_or(RevocationReason::Logout),
        revoked_at: entry.session.revoked_at.unwrap_or_default(),
    }
}

//! Step-up MFA gate.
//!
//! Per-session state machine:
//! `BASIC -> PENDING_MFA` when a challenge is issued,
//! `PENDING_MFA -> MFA_VERIFIED` when a valid code arrives before the challenge expires,
//! `PENDING_MFA -> BASIC` on timeout or mismatch. An already `MFA_VERIFIED` session is
//! never downgraded. A new challenge supersedes the pending one.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, info, warn};
use utoipa::ToSchema;

use super::{
    config::AuthorityConfig,
    error::{AuthError, AuthResult},
    issuer::{AccessToken, TokenIssuer},
    rate_limit::RateLimiter,
    store::{Session, SessionStore},
    types::{AssuranceLevel, ChallengeId, OperationClass, PrincipalId, SessionId},
};
use crate::totp::TotpService;

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, ToSchema)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ChallengeState {
    Pending,
    Completed,
    Failed,
    Expired,
}

#[derive(Clone, Debug)]
struct Challenge {
    session_id: SessionId,
    principal_id: PrincipalId,
    operation: String,
    expires_at: DateTime<Utc>,
    state: ChallengeState,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum StepUpDecision {
    /// The session already meets the operation's minimum.
    Passthrough { assurance_level: AssuranceLevel },
    Challenge {
        challenge_id: ChallengeId,
        expires_at: DateTime<Utc>,
    },
}

#[derive(Clone, Debug)]
pub struct StepUpCompletion {
    pub session: Session,
    pub access_token: AccessToken,
}

pub struct StepUpGate {
    config: Arc<AuthorityConfig>,
    store: Arc<SessionStore>,
    issuer: Arc<TokenIssuer>,
    totp: Arc<TotpService>,
    limiter: Arc<dyn RateLimiter>,
    challenges: DashMap<ChallengeId, Challenge>,
}

impl StepUpGate {
    #[must_use]
    pub fn new(
        config: Arc<AuthorityConfig>,
        store: Arc<SessionStore>,
        issuer: Arc<TokenIssuer>,
        totp: Arc<TotpService>,
        limiter: Arc<dyn RateLimiter>,
    ) -> Self {
        Self {
            config,
            store,
            issuer,
            totp,
            limiter,
            challenges: DashMap::new(),
        }
    }

    /// Decide whether `operation` needs a second factor on this session.
    ///
    /// # Errors
    /// `SessionNotFound`, `SessionRevoked`, `SessionExpired`, or `MfaNotEnrolled`
    /// when a challenge is needed but the principal has no confirmed factor.
    pub fn require_step_up(
        &self,
        session_id: &SessionId,
        operation: &str,
    ) -> AuthResult<StepUpDecision> {
        let operation = operation.trim();
        if operation.is_empty() {
            return Err(AuthError::InvalidRequest("operation is required".to_string()));
        }
        let required = self.config.step_up_policy().minimum_for(operation);
        let session = self
            .store
            .get(session_id)
            .ok_or(AuthError::SessionNotFound)?;
        session.ensure_active(self.store.now())?;

        if session.assurance_level >= required {
            return Ok(StepUpDecision::Passthrough {
                assurance_level: session.assurance_level,
            });
        }
        if !self.totp.is_enrolled(session.principal_id) {
            return Err(AuthError::MfaNotEnrolled);
        }

        // Registered before it becomes the session's pending challenge, so a
        // concurrent request can always find and supersede it.
        let challenge_id = ChallengeId::new();
        let expires_at = self.store.now() + self.config.mfa_challenge_ttl();
        self.challenges.insert(
            challenge_id,
            Challenge {
                session_id: session_id.clone(),
                principal_id: session.principal_id,
                operation: operation.to_string(),
                expires_at,
                state: ChallengeState::Pending,
            },
        );
        let swapped = self.store.transact(session_id, |entry, now| {
            entry.session.ensure_active(now)?;
            Ok(entry.pending_challenge.replace(challenge_id))
        });
        let superseded = match swapped {
            Ok(superseded) => superseded,
            Err(err) => {
                self.challenges.remove(&challenge_id);
                return Err(err);
            }
        };
        if let Some(previous) = superseded
            && let Some(mut challenge) = self.challenges.get_mut(&previous)
            && challenge.state == ChallengeState::Pending
        {
            challenge.state = ChallengeState::Failed;
        }
        info!(
            principal_id = %session.principal_id,
            challenge_id = %challenge_id,
            operation,
            "Step-up challenge issued"
        );
        Ok(StepUpDecision::Challenge {
            challenge_id,
            expires_at,
        })
    }

    /// Answer a challenge with a one-time code.
    ///
    /// # Errors
    /// `ChallengeNotFound`, `CodeExpired`, `CodeMismatch` (also for an already used
    /// challenge or code), `RateLimited`, or the session's revoked/expired state.
    pub fn complete_step_up(
        &self,
        challenge_id: ChallengeId,
        code: &str,
    ) -> AuthResult<StepUpCompletion> {
        let (session_id, principal_id, operation) = {
            let challenge = self
                .challenges
                .get(&challenge_id)
                .ok_or(AuthError::ChallengeNotFound)?;
            (
                challenge.session_id.clone(),
                challenge.principal_id,
                challenge.operation.clone(),
            )
        };
        self.limiter
            .allow(&format!("principal:{principal_id}"), OperationClass::MfaAttempt)?;

        let now = self.store.now();
        self.store
            .get(&session_id)
            .ok_or(AuthError::SessionNotFound)?
            .ensure_active(now)?;
        let verdict = {
            let mut challenge = self
                .challenges
                .get_mut(&challenge_id)
                .ok_or(AuthError::ChallengeNotFound)?;
            if challenge.state != ChallengeState::Pending {
                Err(AuthError::CodeMismatch)
            } else if challenge.expires_at <= now {
                challenge.state = ChallengeState::Expired;
                Err(AuthError::CodeExpired)
            } else {
                match self.totp.verify(principal_id, code) {
                    Ok(()) => {
                        challenge.state = ChallengeState::Completed;
                        Ok(())
                    }
                    Err(err) => {
                        challenge.state = ChallengeState::Failed;
                        Err(err)
                    }
                }
            }
        };

        if let Err(err) = verdict {
            self.clear_pending(&session_id, challenge_id);
            warn!(
                principal_id = %principal_id,
                challenge_id = %challenge_id,
                code = err.code(),
                "Step-up challenge failed"
            );
            return Err(err);
        }

        let session = self.store.transact(&session_id, |entry, now| {
            entry.session.ensure_active(now)?;
            if entry.pending_challenge == Some(challenge_id) {
                entry.pending_challenge = None;
            }
            entry.upgrade_assurance(AssuranceLevel::MfaVerified);
            Ok(entry.session.clone())
        })?;
        let access_token = self.issuer.mint_access_token(&session, now)?;
        info!(
            principal_id = %principal_id,
            challenge_id = %challenge_id,
            operation = %operation,
            "Step-up completed"
        );
        Ok(StepUpCompletion {
            session,
            access_token,
        })
    }

    #[must_use]
    pub fn challenge_state(&self, challenge_id: ChallengeId) -> Option<ChallengeState> {
        self.challenges
            .get(&challenge_id)
            .map(|challenge| challenge.state)
    }

    /// Drop challenges that are settled or expired. Returns the number removed.
    pub fn sweep(&self) -> usize {
        let now = self.store.now();
        let mut expired = Vec::new();
        let before = self.challenges.len();
        self.challenges.retain(|challenge_id, challenge| {
            let keep = challenge.state == ChallengeState::Pending && challenge.expires_at > now;
            if !keep && challenge.state == ChallengeState::Pending {
                expired.push((*challenge_id, challenge.session_id.clone()));
            }
            keep
        });
        for (challenge_id, session_id) in &expired {
            self.clear_pending(session_id, *challenge_id);
        }
        before.saturating_sub(self.challenges.len())
    }

    fn clear_pending(&self, session_id: &SessionId, challenge_id: ChallengeId) {
        let cleared = self.store.transact(session_id, |entry, _| {
            if entry.pending_challenge == Some(challenge_id) {
                entry.pending_challenge = None;
            }
            Ok(())
        });
        match cleared {
            Ok(()) | Err(AuthError::SessionNotFound) => {}
            Err(err) => {
                debug!(challenge_id = %challenge_id, code = err.code(), "Pending challenge not cleared");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        authority::{
            clock::ManualClock,
            config::StepUpPolicy,
            issuer::IssuedSession,
            rate_limit::NoopRateLimiter,
            store::RevocationReason,
            token::{AccessTokenCodec, SigningKeys},
        },
        totp::SeedCipher,
    };
    use anyhow::{Result, anyhow};
    use chrono::Duration;
    use std::{sync::Barrier, thread};
    use totp_rs::{Algorithm, Secret, TOTP};

    const START: i64 = 1_700_000_010;

    struct Harness {
        clock: Arc<ManualClock>,
        store: Arc<SessionStore>,
        issuer: Arc<TokenIssuer>,
        totp: Arc<TotpService>,
        gate: StepUpGate,
    }

    fn harness() -> Harness {
        let clock = Arc::new(ManualClock::at_unix(START));
        let config = Arc::new(
            AuthorityConfig::new()
                .with_step_up_policy(StepUpPolicy::new().require("x", AssuranceLevel::MfaVerified)),
        );
        let store = Arc::new(SessionStore::new(config.clone(), clock.clone()));
        let codec = AccessTokenCodec::new("ics".to_string(), SigningKeys::from_seed(&[9; 32]));
        let issuer = Arc::new(TokenIssuer::new(config.clone(), codec, store.clone()));
        let totp = Arc::new(TotpService::new(
            &config,
            SeedCipher::new([4u8; 32]),
            clock.clone(),
        ));
        let gate = StepUpGate::new(
            config,
            store.clone(),
            issuer.clone(),
            totp.clone(),
            Arc::new(NoopRateLimiter),
        );
        Harness {
            clock,
            store,
            issuer,
            totp,
            gate,
        }
    }

    fn code_at(secret_base32: &str, unix_seconds: i64) -> Result<String> {
        let secret = Secret::Encoded(secret_base32.to_string())
            .to_bytes()
            .map_err(|e| anyhow!("{e:?}"))?;
        let totp = TOTP::new(Algorithm::SHA1, 6, 1, 30, secret, None, "test".to_string())
            .map_err(|e| anyhow!("{e}"))?;
        Ok(totp.generate(u64::try_from(unix_seconds)?))
    }

    /// Enrolled principal with a fresh session; returns the base32 secret.
    fn enrolled(h: &Harness) -> Result<(IssuedSession, String)> {
        let issued = h.issuer.issue_session(PrincipalId::new())?;
        let enrollment = h.totp.enroll_begin(issued.session.principal_id, "user")?;
        h.totp.enroll_confirm(
            issued.session.principal_id,
            &code_at(&enrollment.secret_base32, START - 30)?,
        )?;
        Ok((issued, enrollment.secret_base32))
    }

    fn challenge_id(decision: StepUpDecision) -> Result<ChallengeId> {
        match decision {
            StepUpDecision::Challenge { challenge_id, .. } => Ok(challenge_id),
            StepUpDecision::Passthrough { .. } => Err(anyhow!("expected a challenge")),
        }
    }

    #[test]
    fn step_up_upgrades_and_code_is_single_use() -> Result<()> {
        let h = harness();
        let (issued, secret) = enrolled(&h)?;
        let session_id = &issued.session.session_id;

        let challenge = challenge_id(h.gate.require_step_up(session_id, "x")?)?;
        let code = code_at(&secret, START)?;
        let completion = h.gate.complete_step_up(challenge, &code)?;
        assert_eq!(completion.session.assurance_level, AssuranceLevel::MfaVerified);
        assert_eq!(
            h.issuer
                .validate_access_token(&completion.access_token.token)?
                .assurance_level,
            AssuranceLevel::MfaVerified
        );

        assert_eq!(
            h.gate.complete_step_up(challenge, &code).map(|_| ()),
            Err(AuthError::CodeMismatch)
        );

        // Already sufficient: no new challenge.
        assert_eq!(
            h.gate.require_step_up(session_id, "x")?,
            StepUpDecision::Passthrough {
                assurance_level: AssuranceLevel::MfaVerified
            }
        );
        Ok(())
    }

    #[test]
    fn concurrent_challenges_leave_one_pending() -> Result<()> {
        const REQUESTS: usize = 8;
        let h = harness();
        let (issued, _) = enrolled(&h)?;
        let session_id = &issued.session.session_id;

        for _ in 0..20 {
            let barrier = Barrier::new(REQUESTS);
            let challenges: Vec<ChallengeId> = thread::scope(|scope| {
                let handles: Vec<_> = (0..REQUESTS)
                    .map(|_| {
                        scope.spawn(|| {
                            barrier.wait();
                            h.gate.require_step_up(session_id, "x")
                        })
                    })
                    .collect();
                handles
                    .into_iter()
                    .map(|handle| handle.join().unwrap_or(Err(AuthError::Timeout)))
                    .map(|decision| decision.map_err(anyhow::Error::from).and_then(challenge_id))
                    .collect::<Result<_>>()
            })?;

            let pending: Vec<ChallengeId> = challenges
                .iter()
                .copied()
                .filter(|id| h.gate.challenge_state(*id) == Some(ChallengeState::Pending))
                .collect();
            assert_eq!(pending.len(), 1);
            let current = h
                .store
                .transact(session_id, |entry, _| Ok(entry.pending_challenge));
            assert_eq!(current, Ok(pending.first().copied()));
        }
        Ok(())
    }

    #[test]
    fn same_code_on_new_challenge_is_rejected() -> Result<()> {
        let h = harness();
        let (first, secret) = enrolled(&h)?;
        let second = h.issuer.issue_session(first.session.principal_id)?;
        let code = code_at(&secret, START)?;

        let a = challenge_id(h.gate.require_step_up(&first.session.session_id, "x")?)?;
        h.gate.complete_step_up(a, &code)?;
        let b = challenge_id(h.gate.require_step_up(&second.session.session_id, "x")?)?;
        assert_eq!(
            h.gate.complete_step_up(b, &code).map(|_| ()),
            Err(AuthError::CodeMismatch)
        );
        Ok(())
    }

    #[test]
    fn basic_operations_pass_through() -> Result<()> {
        let h = harness();
        let issued = h.issuer.issue_session(PrincipalId::new())?;
        assert_eq!(
            h.gate.require_step_up(&issued.session.session_id, "read_profile")?,
            StepUpDecision::Passthrough {
                assurance_level: AssuranceLevel::Basic
            }
        );
        Ok(())
    }

    #[test]
    fn challenge_needs_enrolled_factor() -> Result<()> {
        let h = harness();
        let issued = h.issuer.issue_session(PrincipalId::new())?;
        assert_eq!(
            h.gate.require_step_up(&issued.session.session_id, "x"),
            Err(AuthError::MfaNotEnrolled)
        );
        Ok(())
    }

    #[test]
    fn expired_challenge_returns_to_basic() -> Result<()> {
        let h = harness();
        let (issued, secret) = enrolled(&h)?;
        let challenge = challenge_id(h.gate.require_step_up(&issued.session.session_id, "x")?)?;

        h.clock.advance(Duration::seconds(301));
        let code = code_at(&secret, START + 301)?;
        assert_eq!(
            h.gate.complete_step_up(challenge, &code).map(|_| ()),
            Err(AuthError::CodeExpired)
        );
        assert_eq!(h.gate.challenge_state(challenge), Some(ChallengeState::Expired));
        let session = h
            .store
            .get(&issued.session.session_id)
            .ok_or_else(|| anyhow!("session missing"))?;
        assert_eq!(session.assurance_level, AssuranceLevel::Basic);
        Ok(())
    }

    #[test]
    fn mismatch_fails_challenge() -> Result<()> {
        let h = harness();
        let (issued, secret) = enrolled(&h)?;
        let challenge = challenge_id(h.gate.require_step_up(&issued.session.session_id, "x")?)?;
        assert_eq!(
            h.gate.complete_step_up(challenge, "000000").map(|_| ()),
            Err(AuthError::CodeMismatch)
        );
        assert_eq!(h.gate.challenge_state(challenge), Some(ChallengeState::Failed));
        assert_eq!(
            h.store
                .transact(&issued.session.session_id, |entry, _| Ok(entry.pending_challenge)),
            Ok(None)
        );

        // A failed challenge stays failed even with the right code.
        assert_eq!(
            h.gate
                .complete_step_up(challenge, &code_at(&secret, START)?)
                .map(|_| ()),
            Err(AuthError::CodeMismatch)
        );
        Ok(())
    }

    #[test]
    fn new_challenge_supersedes_pending() -> Result<()> {
        let h = harness();
        let (issued, secret) = enrolled(&h)?;
        let session_id = &issued.session.session_id;
        let first = challenge_id(h.gate.require_step_up(session_id, "x")?)?;
        let second = challenge_id(h.gate.require_step_up(session_id, "x")?)?;
        assert_eq!(h.gate.challenge_state(first), Some(ChallengeState::Failed));
        h.gate.complete_step_up(second, &code_at(&secret, START)?)?;
        Ok(())
    }

    #[test]
    fn unknown_challenge_and_revoked_session() -> Result<()> {
        let h = harness();
        assert_eq!(
            h.gate.complete_step_up(ChallengeId::new(), "123456").map(|_| ()),
            Err(AuthError::ChallengeNotFound)
        );

        let (issued, secret) = enrolled(&h)?;
        let challenge = challenge_id(h.gate.require_step_up(&issued.session.session_id, "x")?)?;
        h.store
            .revoke(&issued.session.session_id, RevocationReason::Logout)?;
        assert_eq!(
            h.gate
                .complete_step_up(challenge, &code_at(&secret, START)?)
                .map(|_| ()),
            Err(AuthError::SessionRevoked)
        );
        assert_eq!(
            h.gate.require_step_up(&issued.session.session_id, "x"),
            Err(AuthError::SessionRevoked)
        );
        Ok(())
    }

    #[test]
    fn sweep_removes_settled_challenges() -> Result<()> {
        let h = harness();
        let (issued, _) = enrolled(&h)?;
        let challenge = challenge_id(h.gate.require_step_up(&issued.session.session_id, "x")?)?;
        assert_eq!(h.gate.sweep(), 0);
        h.clock.advance(Duration::seconds(301));
        assert_eq!(h.gate.sweep(), 1);
        assert_eq!(h.gate.challenge_state(challenge), None);
        Ok(())
    }

    #[test]
    fn sweep_tolerates_purged_sessions() -> Result<()> {
        let h = harness();
        let (issued, _) = enrolled(&h)?;
        let challenge = challenge_id(h.gate.require_step_up(&issued.session.session_id, "x")?)?;
        h.store
            .revoke(&issued.session.session_id, RevocationReason::Logout)?;
        h.clock.advance(Duration::seconds(301));
        assert_eq!(h.store.purge_expired(Duration::zero()), 1);

        assert_eq!(h.gate.sweep(), 1);
        assert_eq!(h.gate.challenge_state(challenge), None);
        Ok(())
    }
}

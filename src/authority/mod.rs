//! Session and token lifecycle authority.
//!
//! Flow Overview:
//! 1) Login: `CredentialVerifier` (rate limit, lockout, primary factor) then
//!    `TokenIssuer::issue_session` registers a `BASIC` session in the `SessionStore`.
//! 2) Applications validate access tokens or call `check_session`; first contact from
//!    an application is recorded through `observe`.
//! 3) Refresh rotates the single-use refresh token inside the session transaction.
//! 4) Sensitive operations go through the `StepUpGate`, which upgrades the session to
//!    `MFA_VERIFIED` after a valid TOTP code.
//! 5) Logout revokes the whole session; every revocation is published to subscribers.
//!
//! Store, limiter and hashing work is synchronous. `Authority` runs each operation
//! on the blocking pool under the configured backend timeout and fails closed with
//! `Timeout`; work that overruns keeps running detached, so a refresh that commits
//! late is recoverable through its idempotency key.

pub mod clock;
pub mod config;
pub mod error;
pub mod issuer;
pub mod principal;
pub mod rate_limit;
pub mod sso;
pub mod step_up;
pub mod store;
pub mod token;
pub mod types;
pub(crate) mod utils;
pub mod verifier;

use chrono::Duration;
use secrecy::SecretString;
use std::{future::Future, sync::Arc};
use tokio::{sync::broadcast, task::JoinHandle};
use tracing::{debug, error, info};

use crate::totp::{SeedCipher, TotpEnrollment, TotpService};

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{AuthorityConfig, RateLimitPolicy, StepUpPolicy};
pub use error::{AuthError, AuthResult, ErrorKind};
pub use issuer::{AccessToken, IssuedSession, RefreshToken, TokenIssuer, TokenPair, ValidatedAccess};
pub use principal::{Principal, PrincipalDirectory};
pub use rate_limit::{FailureTracker, NoopRateLimiter, RateLimiter, TokenBucketLimiter};
pub use sso::SsoCoordinator;
pub use step_up::{ChallengeState, StepUpCompletion, StepUpDecision, StepUpGate};
pub use store::{RevocationNotice, RevocationReason, Session, SessionStore};
pub use token::{AccessTokenCodec, SigningKeys};
pub use types::{AssuranceLevel, ChallengeId, Factor, OperationClass, PrincipalId, SessionId};
pub use verifier::{Credential, CredentialVerifier, FederatedAssertion};

/// Dead sessions are kept this long so late callers still see `SESSION_REVOKED`.
const SESSION_PURGE_GRACE_SECONDS: i64 = 60 * 60;

/// Counts of entries removed by one janitor pass.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct SweepReport {
    pub sessions: usize,
    pub challenges: usize,
    pub enrollments: usize,
    pub rate_buckets: usize,
    pub lockouts: usize,
    pub cached_sessions: usize,
}

impl SweepReport {
    #[must_use]
    pub fn total(&self) -> usize {
        self.sessions
            + self.challenges
            + self.enrollments
            + self.rate_buckets
            + self.lockouts
            + self.cached_sessions
    }
}

pub struct Authority {
    config: Arc<AuthorityConfig>,
    directory: Arc<PrincipalDirectory>,
    limiter: Arc<dyn RateLimiter>,
    failures: Arc<FailureTracker>,
    verifier: Arc<CredentialVerifier>,
    store: Arc<SessionStore>,
    issuer: Arc<TokenIssuer>,
    sso: Arc<SsoCoordinator>,
    step_up: Arc<StepUpGate>,
    totp: Arc<TotpService>,
}

impl Authority {
    /// Assemble the authority with the token-bucket rate limiter.
    ///
    /// # Errors
    /// Returns an error if the configuration is invalid.
    pub fn new(
        config: AuthorityConfig,
        keys: SigningKeys,
        seed_cipher: SeedCipher,
        clock: Arc<dyn Clock>,
    ) -> anyhow::Result<Self> {
        let limiter: Arc<dyn RateLimiter> = Arc::new(TokenBucketLimiter::new(&config, clock.clone()));
        Self::with_rate_limiter(config, keys, seed_cipher, clock, limiter)
    }

    /// # Errors
    /// Returns an error if the configuration is invalid.
    pub fn with_rate_limiter(
        config: AuthorityConfig,
        keys: SigningKeys,
        seed_cipher: SeedCipher,
        clock: Arc<dyn Clock>,
        limiter: Arc<dyn RateLimiter>,
    ) -> anyhow::Result<Self> {
        config.validate()?;
        let config = Arc::new(config);
        let directory = Arc::new(PrincipalDirectory::new(clock.clone()));
        let failures = Arc::new(FailureTracker::new(&config, clock.clone()));
        let verifier = Arc::new(CredentialVerifier::new(
            config.clone(),
            directory.clone(),
            limiter.clone(),
            failures.clone(),
        ));
        let store = Arc::new(SessionStore::new(config.clone(), clock.clone()));
        let codec = AccessTokenCodec::new(config.token_issuer().to_string(), keys);
        let issuer = Arc::new(TokenIssuer::new(config.clone(), codec, store.clone()));
        let totp = Arc::new(TotpService::new(&config, seed_cipher, clock));
        let sso = Arc::new(SsoCoordinator::new(config.clone(), store.clone()));
        let step_up = Arc::new(StepUpGate::new(
            config.clone(),
            store.clone(),
            issuer.clone(),
            totp.clone(),
            limiter.clone(),
        ));
        Ok(Self {
            config,
            directory,
            limiter,
            failures,
            verifier,
            store,
            issuer,
            sso,
            step_up,
            totp,
        })
    }

    #[must_use]
    pub fn config(&self) -> &AuthorityConfig {
        &self.config
    }

    /// # Errors
    /// See `PrincipalDirectory::register`.
    pub async fn register(&self, username: &str, password: &SecretString) -> AuthResult<Principal> {
        self.bounded("register", self.directory.register(username, password))
            .await
    }

    /// Verify a primary factor and open a session.
    ///
    /// # Errors
    /// `RateLimited`, `LockedOut`, `InvalidCredential`, `Timeout` or `Internal`.
    pub async fn login(
        &self,
        credential: &Credential,
        client_ip: Option<&str>,
    ) -> AuthResult<IssuedSession> {
        let verifier = self.verifier.clone();
        let issuer = self.issuer.clone();
        let credential = credential.clone();
        let client_ip = client_ip.map(str::to_string);
        self.offload("login", move || {
            let verified = verifier.verify(&credential, client_ip.as_deref())?;
            issuer.issue_session(verified.principal_id)
        })
        .await
    }

    /// Rotate a refresh token. Only the client address is rate limited; repeated
    /// redemptions of one token must reach reuse detection.
    ///
    /// # Errors
    /// See `TokenIssuer::refresh`; also `RateLimited` and `Timeout`.
    pub async fn refresh(
        &self,
        refresh_token: &str,
        idempotency_key: Option<&str>,
        client_ip: Option<&str>,
    ) -> AuthResult<TokenPair> {
        let limiter = self.limiter.clone();
        let issuer = self.issuer.clone();
        let refresh_token = refresh_token.to_string();
        let idempotency_key = idempotency_key.map(str::to_string);
        let client_ip = client_ip.map(str::to_string);
        self.offload("refresh", move || {
            if let Some(ip) = client_ip {
                limiter.allow(&format!("ip:{ip}"), OperationClass::Refresh)?;
            }
            issuer.refresh(&refresh_token, idempotency_key.as_deref())
        })
        .await
    }

    /// # Errors
    /// See `TokenIssuer::validate_access_token`.
    pub async fn validate_access_token(&self, token: &str) -> AuthResult<ValidatedAccess> {
        let issuer = self.issuer.clone();
        let token = token.to_string();
        self.offload("validate_access_token", move || {
            issuer.validate_access_token(&token)
        })
        .await
    }

    /// # Errors
    /// See `SsoCoordinator::check_session`.
    pub async fn check_session(&self, session_id: &SessionId) -> AuthResult<Session> {
        let sso = self.sso.clone();
        let session_id = session_id.clone();
        self.offload("check_session", move || sso.check_session(&session_id))
            .await
    }

    /// # Errors
    /// See `SsoCoordinator::observe`.
    pub async fn observe(&self, session_id: &SessionId, application_id: &str) -> AuthResult<Session> {
        let sso = self.sso.clone();
        let session_id = session_id.clone();
        let application_id = application_id.to_string();
        self.offload("observe", move || sso.observe(&session_id, &application_id))
            .await
    }

    /// # Errors
    /// See `SsoCoordinator::logout_everywhere`.
    pub async fn logout_everywhere(&self, session_id: &SessionId) -> AuthResult<Session> {
        let sso = self.sso.clone();
        let session_id = session_id.clone();
        self.offload("logout_everywhere", move || {
            sso.logout_everywhere(&session_id)
        })
        .await
    }

    /// Revoke every session of a principal. Returns the number newly revoked.
    ///
    /// # Errors
    /// Returns `Timeout` if the store does not answer in time.
    pub async fn logout_principal(&self, principal_id: PrincipalId) -> AuthResult<usize> {
        let sso = self.sso.clone();
        self.offload("logout_principal", move || {
            Ok(sso.logout_principal(principal_id).len())
        })
        .await
    }

    /// # Errors
    /// See `StepUpGate::require_step_up`.
    pub async fn require_step_up(
        &self,
        session_id: &SessionId,
        operation: &str,
    ) -> AuthResult<StepUpDecision> {
        let step_up = self.step_up.clone();
        let session_id = session_id.clone();
        let operation = operation.to_string();
        self.offload("require_step_up", move || {
            step_up.require_step_up(&session_id, &operation)
        })
        .await
    }

    /// # Errors
    /// See `StepUpGate::complete_step_up`.
    pub async fn complete_step_up(
        &self,
        challenge_id: ChallengeId,
        code: &str,
    ) -> AuthResult<StepUpCompletion> {
        let step_up = self.step_up.clone();
        let code = code.to_string();
        self.offload("complete_step_up", move || {
            step_up.complete_step_up(challenge_id, &code)
        })
        .await
    }

    /// # Errors
    /// `InvalidRequest` for an unknown principal, `Internal` on crypto failure.
    pub async fn totp_enroll_begin(&self, principal_id: PrincipalId) -> AuthResult<TotpEnrollment> {
        let directory = self.directory.clone();
        let totp = self.totp.clone();
        self.offload("totp_enroll_begin", move || {
            let principal = directory
                .get(principal_id)
                .ok_or_else(|| AuthError::InvalidRequest("unknown principal".to_string()))?;
            let account_name = principal
                .username
                .unwrap_or_else(|| principal.principal_id.to_string());
            totp.enroll_begin(principal_id, &account_name)
        })
        .await
    }

    /// # Errors
    /// `MfaNotEnrolled` without a pending enrollment, `CodeMismatch`, `RateLimited`.
    pub async fn totp_enroll_confirm(&self, principal_id: PrincipalId, code: &str) -> AuthResult<()> {
        let limiter = self.limiter.clone();
        let directory = self.directory.clone();
        let totp = self.totp.clone();
        let code = code.to_string();
        self.offload("totp_enroll_confirm", move || {
            limiter.allow(&format!("principal:{principal_id}"), OperationClass::MfaAttempt)?;
            totp.enroll_confirm(principal_id, &code)?;
            directory.add_factor(principal_id, Factor::Totp)?;
            Ok(())
        })
        .await
    }

    /// # Errors
    /// See `PrincipalDirectory::link_federated`.
    pub async fn link_federated(
        &self,
        principal_id: PrincipalId,
        issuer: &str,
        subject: &str,
    ) -> AuthResult<Principal> {
        let directory = self.directory.clone();
        let issuer = issuer.to_string();
        let subject = subject.to_string();
        self.offload("link_federated", move || {
            directory.link_federated(principal_id, &issuer, &subject)
        })
        .await
    }

    /// Soft-delete a principal and revoke all of its sessions.
    ///
    /// # Errors
    /// `InvalidRequest` for an unknown principal.
    pub async fn deactivate_principal(&self, principal_id: PrincipalId) -> AuthResult<Principal> {
        let directory = self.directory.clone();
        let store = self.store.clone();
        self.offload("deactivate_principal", move || {
            let principal = directory.deactivate(principal_id)?;
            let revoked = store.revoke_all(principal_id, RevocationReason::PrincipalDeactivated);
            info!(principal_id = %principal_id, sessions = revoked.len(), "Principal deactivated");
            Ok(principal)
        })
        .await
    }

    #[must_use]
    pub fn principal(&self, principal_id: PrincipalId) -> Option<Principal> {
        self.directory.get(principal_id)
    }

    #[must_use]
    pub fn session_count(&self) -> usize {
        self.store.len()
    }

    #[must_use]
    pub fn active_session_count(&self) -> usize {
        self.store.active_count()
    }

    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<RevocationNotice> {
        self.sso.subscribe()
    }

    /// One janitor pass over every ephemeral structure.
    pub fn sweep(&self) -> SweepReport {
        SweepReport {
            sessions: self
                .store
                .purge_expired(Duration::seconds(SESSION_PURGE_GRACE_SECONDS)),
            challenges: self.step_up.sweep(),
            enrollments: self.totp.sweep(),
            rate_buckets: self.limiter.sweep(),
            lockouts: self.failures.sweep(),
            cached_sessions: self.sso.sweep(),
        }
    }

    /// Run `sweep` on a fixed cadence until the task is aborted.
    pub fn spawn_janitor(self: Arc<Self>, interval: std::time::Duration) -> JoinHandle<()> {
        let interval = if interval.is_zero() {
            std::time::Duration::from_secs(1)
        } else {
            interval
        };
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let report = self.sweep();
                if report.total() > 0 {
                    debug!(?report, "Janitor pass");
                }
            }
        })
    }

    /// Run synchronous work on the blocking pool under the backend timeout.
    async fn offload<T, F>(&self, operation: &'static str, work: F) -> AuthResult<T>
    where
        F: FnOnce() -> AuthResult<T> + Send + 'static,
        T: Send + 'static,
    {
        self.bounded(operation, async move {
            tokio::task::spawn_blocking(work)
                .await
                .map_err(|err| AuthError::Internal(format!("{operation} task failed: {err}")))?
        })
        .await
    }

    async fn bounded<T, F>(&self, operation: &'static str, future: F) -> AuthResult<T>
    where
        F: Future<Output = AuthResult<T>>,
    {
        match tokio::time::timeout(self.config.backend_timeout(), future).await {
            Ok(result) => {
                if let Err(AuthError::Internal(detail)) = &result {
                    error!(operation, "Internal failure: {detail}");
                }
                result
            }
            Err(_) => {
                error!(operation, "Backend timed out");
                Err(AuthError::Timeout)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Result;

    fn authority() -> Result<(Arc<ManualClock>, Authority)> {
        let clock = Arc::new(ManualClock::at_unix(1_700_000_010));
        let authority = Authority::new(
            AuthorityConfig::new().with_backend_timeout_ms(30_000),
            SigningKeys::from_seed(&[1; 32]),
            SeedCipher::new([2; 32]),
            clock.clone(),
        )?;
        Ok((clock, authority))
    }

    #[test]
    fn invalid_config_rejected() {
        let built = Authority::new(
            AuthorityConfig::new().with_lockout(0, 10),
            SigningKeys::from_seed(&[1; 32]),
            SeedCipher::new([2; 32]),
            Arc::new(SystemClock),
        );
        assert!(built.is_err());
    }

    #[tokio::test]
    async fn login_refresh_logout() -> Result<()> {
        let (_, authority) = authority()?;
        authority
            .register("alice", &SecretString::from("correct horse"))
            .await?;
        let issued = authority
            .login(
                &Credential::Password {
                    username: "alice".to_string(),
                    password: SecretString::from("correct horse"),
                },
                Some("10.0.0.1"),
            )
            .await?;
        assert_eq!(authority.session_count(), 1);

        let pair = authority
            .refresh(&issued.refresh_token.token, None, Some("10.0.0.1"))
            .await?;
        let access = authority
            .validate_access_token(&pair.access_token.token)
            .await?;
        assert_eq!(access.session_id, issued.session.session_id);

        authority.logout_everywhere(&issued.session.session_id).await?;
        assert_eq!(
            authority.check_session(&issued.session.session_id).await,
            Err(AuthError::SessionRevoked)
        );
        Ok(())
    }

    #[tokio::test]
    async fn deactivation_revokes_sessions() -> Result<()> {
        let (_, authority) = authority()?;
        let principal = authority
            .register("bob", &SecretString::from("correct horse"))
            .await?;
        let credential = Credential::Password {
            username: "bob".to_string(),
            password: SecretString::from("correct horse"),
        };
        let issued = authority.login(&credential, None).await?;
        authority.deactivate_principal(principal.principal_id).await?;
        assert_eq!(
            authority.check_session(&issued.session.session_id).await,
            Err(AuthError::SessionRevoked)
        );
        assert_eq!(
            authority.login(&credential, None).await.map(|_| ()),
            Err(AuthError::InvalidCredential)
        );
        Ok(())
    }

    #[tokio::test]
    async fn sweep_purges_dead_sessions() -> Result<()> {
        let (clock, authority) = authority()?;
        let issued = authority
            .login(
                &Credential::Federated(FederatedAssertion {
                    issuer: "https://idp.example".to_string(),
                    subject: "s-1".to_string(),
                    claims: serde_json::Map::new(),
                }),
                None,
            )
            .await?;
        authority.logout_everywhere(&issued.session.session_id).await?;
        assert_eq!(authority.sweep().sessions, 0);
        clock.advance(Duration::seconds(SESSION_PURGE_GRACE_SECONDS + 1));
        assert_eq!(authority.sweep().sessions, 1);
        assert_eq!(authority.session_count(), 0);
        Ok(())
    }

    #[tokio::test]
    async fn enrollment_adds_totp_factor() -> Result<()> {
        let (_, authority) = authority()?;
        let principal = authority
            .register("carol", &SecretString::from("correct horse"))
            .await?;
        let enrollment = authority.totp_enroll_begin(principal.principal_id).await?;
        assert!(enrollment.otpauth_url.contains("carol"));
        assert_eq!(
            authority
                .totp_enroll_confirm(principal.principal_id, "abcdef")
                .await,
            Err(AuthError::CodeMismatch)
        );
        assert!(
            authority
                .principal(principal.principal_id)
                .is_some_and(|p| !p.factors.contains(&Factor::Totp))
        );
        Ok(())
    }
}

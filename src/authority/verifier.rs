//! Primary factor verification.
//!
//! Flow Overview:
//! 1) Consult the rate limiter for the client and the claimed identity.
//! 2) Reserve the attempt with the lockout tracker; fail fast with `LOCKED_OUT` while
//!    the identity is locked, before any lookup.
//! 3) Password: Argon2id verification; unknown usernames are verified against a
//!    fixed dummy hash so both paths take the same time.
//! 4) Federated: the assertion is already cryptographically checked by the caller;
//!    only the issuer trust list is applied, and a first login creates the principal.
//! 5) Failures feed the lockout tracker; a success resets it.
//!
//! Verification blocks on hashing and the rate limiter; `Authority` runs it on the
//! blocking pool.

use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use serde_json::{Map, Value};
use std::{fmt, sync::Arc};
use tracing::{info, warn};

use super::{
    config::AuthorityConfig,
    error::{AuthError, AuthResult},
    principal::{self, PrincipalDirectory},
    rate_limit::{FailureTracker, RateLimiter},
    types::{Factor, OperationClass, PrincipalId},
};

/// Identity assertion handed in by the federation layer after signature validation.
#[derive(Clone, Debug, Deserialize)]
pub struct FederatedAssertion {
    pub issuer: String,
    pub subject: String,
    #[serde(default)]
    pub claims: Map<String, Value>,
}

#[derive(Clone)]
pub enum Credential {
    Password {
        username: String,
        password: SecretString,
    },
    Federated(FederatedAssertion),
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Password { username, .. } => f
                .debug_struct("Password")
                .field("username", username)
                .finish_non_exhaustive(),
            Self::Federated(assertion) => f.debug_tuple("Federated").field(assertion).finish(),
        }
    }
}

impl Credential {
    /// Lockout and rate-limit key for the claimed identity.
    fn identity_key(&self) -> String {
        match self {
            Self::Password { username, .. } => format!("user:{}", username.trim().to_lowercase()),
            Self::Federated(assertion) => {
                format!("federated:{}:{}", assertion.issuer, assertion.subject)
            }
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct VerifiedPrincipal {
    pub principal_id: PrincipalId,
    pub factor: Factor,
}

pub struct CredentialVerifier {
    config: Arc<AuthorityConfig>,
    directory: Arc<PrincipalDirectory>,
    limiter: Arc<dyn RateLimiter>,
    failures: Arc<FailureTracker>,
}

impl CredentialVerifier {
    #[must_use]
    pub fn new(
        config: Arc<AuthorityConfig>,
        directory: Arc<PrincipalDirectory>,
        limiter: Arc<dyn RateLimiter>,
        failures: Arc<FailureTracker>,
    ) -> Self {
        Self {
            config,
            directory,
            limiter,
            failures,
        }
    }

    /// Verify a primary factor.
    ///
    /// # Errors
    /// `RateLimited`, `LockedOut`, `InvalidCredential`, `InvalidRequest` for empty
    /// fields, or `Internal` when hashing infrastructure fails.
    pub fn verify(
        &self,
        credential: &Credential,
        client_ip: Option<&str>,
    ) -> AuthResult<VerifiedPrincipal> {
        let identity_key = credential.identity_key();
        if let Some(ip) = client_ip {
            self.limiter.allow(&format!("ip:{ip}"), OperationClass::Login)?;
        }
        self.limiter.allow(&identity_key, OperationClass::Login)?;

        let attempt = match self.failures.begin(&identity_key) {
            Ok(attempt) => attempt,
            Err(err) => {
                warn!(identity = %identity_key, "Login refused: locked out");
                return Err(err);
            }
        };

        let verified = match credential {
            Credential::Password { username, password } => {
                self.verify_password(username, password)?
            }
            Credential::Federated(assertion) => self.verify_federated(assertion)?,
        };

        match verified {
            Some(principal_id) => {
                attempt.succeeded();
                let factor = match credential {
                    Credential::Password { .. } => Factor::Password,
                    Credential::Federated(_) => Factor::Federated,
                };
                info!(principal_id = %principal_id, factor = ?factor, "Primary factor verified");
                Ok(VerifiedPrincipal {
                    principal_id,
                    factor,
                })
            }
            None => {
                attempt.failed();
                warn!(identity = %identity_key, "Primary factor rejected");
                Err(AuthError::InvalidCredential)
            }
        }
    }

    fn verify_password(
        &self,
        username: &str,
        password: &SecretString,
    ) -> AuthResult<Option<PrincipalId>> {
        if username.trim().is_empty() || password.expose_secret().is_empty() {
            return Err(AuthError::InvalidRequest(
                "username and password are required".to_string(),
            ));
        }

        let entry = self.directory.password_entry(username);
        let (stored_hash, principal) = match &entry {
            Some(entry) => (
                entry.password_hash.as_str(),
                (!entry.deactivated).then_some(entry.principal_id),
            ),
            None => (principal::dummy_hash()?, None),
        };
        let matches = principal::verify_password(password.expose_secret(), stored_hash);

        Ok(principal.filter(|_| matches))
    }

    fn verify_federated(&self, assertion: &FederatedAssertion) -> AuthResult<Option<PrincipalId>> {
        if assertion.issuer.trim().is_empty() || assertion.subject.trim().is_empty() {
            return Err(AuthError::InvalidRequest(
                "federated assertion needs issuer and subject".to_string(),
            ));
        }
        if !self.config.federation_issuer_trusted(&assertion.issuer) {
            warn!(issuer = %assertion.issuer, "Federated assertion from untrusted issuer");
            return Ok(None);
        }
        let principal = self
            .directory
            .find_or_create_federated(&assertion.issuer, &assertion.subject)?;
        Ok((!principal.deactivated).then_some(principal.principal_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::authority::{
        clock::ManualClock,
        config::RateLimitPolicy,
        rate_limit::{NoopRateLimiter, TokenBucketLimiter},
    };
    use anyhow::Result;
    use std::{sync::Barrier, thread};

    struct Harness {
        directory: Arc<PrincipalDirectory>,
        verifier: CredentialVerifier,
    }

    fn harness(config: AuthorityConfig, limiter: Option<Arc<dyn RateLimiter>>) -> Harness {
        let clock = Arc::new(ManualClock::at_unix(1_700_000_000));
        let config = Arc::new(config);
        let directory = Arc::new(PrincipalDirectory::new(clock.clone()));
        let limiter = limiter.unwrap_or_else(|| Arc::new(NoopRateLimiter));
        let failures = Arc::new(FailureTracker::new(&config, clock));
        Harness {
            directory: directory.clone(),
            verifier: CredentialVerifier::new(config, directory, limiter, failures),
        }
    }

    fn password(username: &str, password: &str) -> Credential {
        Credential::Password {
            username: username.to_string(),
            password: SecretString::from(password),
        }
    }

    #[tokio::test]
    async fn password_success_and_failure() -> Result<()> {
        let h = harness(AuthorityConfig::new(), None);
        let principal = h
            .directory
            .register("alice", &SecretString::from("correct horse"))
            .await?;

        let verified = h
            .verifier
            .verify(&password("Alice", "correct horse"), Some("10.0.0.1"))?;
        assert_eq!(verified.principal_id, principal.principal_id);
        assert_eq!(verified.factor, Factor::Password);

        assert_eq!(
            h.verifier.verify(&password("alice", "nope nope"), None),
            Err(AuthError::InvalidCredential)
        );
        assert_eq!(
            h.verifier.verify(&password("nobody", "whatever1"), None),
            Err(AuthError::InvalidCredential)
        );
        assert!(matches!(
            h.verifier.verify(&password("", ""), None),
            Err(AuthError::InvalidRequest(_))
        ));
        Ok(())
    }

    #[tokio::test]
    async fn lockout_applies_regardless_of_correctness() -> Result<()> {
        let h = harness(AuthorityConfig::new(), None);
        h.directory
            .register("bob", &SecretString::from("correct horse"))
            .await?;

        for _ in 0..5 {
            assert_eq!(
                h.verifier.verify(&password("bob", "wrong pass"), None),
                Err(AuthError::InvalidCredential)
            );
        }
        let sixth = h.verifier.verify(&password("bob", "correct horse"), None);
        assert!(matches!(sixth, Err(AuthError::LockedOut { .. })));
        Ok(())
    }

    #[tokio::test]
    async fn concurrent_wrong_guesses_stop_at_threshold() -> Result<()> {
        let h = harness(AuthorityConfig::new().with_lockout(5, 900), None);
        h.directory
            .register("frank", &SecretString::from("correct horse"))
            .await?;

        let barrier = Barrier::new(10);
        let outcomes: Vec<AuthResult<VerifiedPrincipal>> = thread::scope(|scope| {
            let handles: Vec<_> = (0..10)
                .map(|_| {
                    scope.spawn(|| {
                        barrier.wait();
                        h.verifier.verify(&password("frank", "wrong pass"), None)
                    })
                })
                .collect();
            handles
                .into_iter()
                .map(|handle| handle.join().unwrap_or(Err(AuthError::Timeout)))
                .collect()
        });

        let rejected = outcomes
            .iter()
            .filter(|outcome| **outcome == Err(AuthError::InvalidCredential))
            .count();
        let locked = outcomes
            .iter()
            .filter(|outcome| matches!(outcome, Err(AuthError::LockedOut { .. })))
            .count();
        assert_eq!(rejected, 5);
        assert_eq!(rejected + locked, 10);
        assert!(matches!(
            h.verifier.verify(&password("frank", "correct horse"), None),
            Err(AuthError::LockedOut { .. })
        ));
        Ok(())
    }

    #[tokio::test]
    async fn deactivated_principal_rejected() -> Result<()> {
        let h = harness(AuthorityConfig::new(), None);
        let principal = h
            .directory
            .register("carol", &SecretString::from("correct horse"))
            .await?;
        h.directory.deactivate(principal.principal_id)?;
        assert_eq!(
            h.verifier.verify(&password("carol", "correct horse"), None),
            Err(AuthError::InvalidCredential)
        );
        Ok(())
    }

    #[test]
    fn federated_login_creates_and_reuses_principal() -> Result<()> {
        let config =
            AuthorityConfig::new().with_trusted_federation_issuers(["https://idp.example"]);
        let h = harness(config, None);
        let assertion = FederatedAssertion {
            issuer: "https://idp.example".to_string(),
            subject: "ext-42".to_string(),
            claims: Map::new(),
        };
        let first = h
            .verifier
            .verify(&Credential::Federated(assertion.clone()), None)?;
        let second = h
            .verifier
            .verify(&Credential::Federated(assertion), None)?;
        assert_eq!(first.principal_id, second.principal_id);
        assert_eq!(first.factor, Factor::Federated);

        let untrusted = FederatedAssertion {
            issuer: "https://evil.example".to_string(),
            subject: "ext-42".to_string(),
            claims: Map::new(),
        };
        assert_eq!(
            h.verifier.verify(&Credential::Federated(untrusted), None),
            Err(AuthError::InvalidCredential)
        );
        Ok(())
    }

    #[test]
    fn limiter_runs_before_verification() -> Result<()> {
        let clock = Arc::new(ManualClock::at_unix(1_700_000_000));
        let config = AuthorityConfig::new()
            .with_rate_limit(OperationClass::Login, RateLimitPolicy::new(1, 60)?);
        let limiter: Arc<dyn RateLimiter> = Arc::new(TokenBucketLimiter::new(&config, clock));
        let h = harness(config, Some(limiter));

        let _ = h.verifier.verify(&password("dave", "whatever1"), Some("1.1.1.1"));
        let limited = h.verifier.verify(&password("erin", "whatever1"), Some("1.1.1.1"));
        assert!(matches!(limited, Err(AuthError::RateLimited { .. })));
        Ok(())
    }
}

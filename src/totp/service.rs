use anyhow::{Context, anyhow};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use rand::{RngCore, rngs::OsRng};
use serde::Serialize;
use std::sync::Arc;
use totp_rs::{Algorithm, TOTP};
use tracing::{info, warn};
use utoipa::ToSchema;
use uuid::Uuid;

use crate::{
    authority::{
        clock::Clock,
        config::AuthorityConfig,
        error::{AuthError, AuthResult},
        types::PrincipalId,
        utils::constant_time_eq,
    },
    totp::crypto::SeedCipher,
};

const SECRET_LEN: usize = 20;
const CODE_DIGITS: usize = 6;

#[derive(Clone, Debug, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct TotpEnrollment {
    pub credential_id: Uuid,
    pub secret_base32: String,
    pub otpauth_url: String,
}

struct StoredCredential {
    credential_id: Uuid,
    sealed_seed: Vec<u8>,
    created_at: DateTime<Utc>,
    last_used_step: Option<u64>,
}

/// TOTP factor: enrollment, encrypted seed storage and single-use verification.
pub struct TotpService {
    cipher: SeedCipher,
    clock: Arc<dyn Clock>,
    issuer: String,
    step_seconds: u64,
    skew_steps: u8,
    challenge_ttl: chrono::Duration,
    confirmed: DashMap<PrincipalId, StoredCredential>,
    pending: DashMap<PrincipalId, StoredCredential>,
}

impl TotpService {
    #[must_use]
    pub fn new(config: &AuthorityConfig, cipher: SeedCipher, clock: Arc<dyn Clock>) -> Self {
        Self {
            cipher,
            clock,
            issuer: config.token_issuer().to_string(),
            step_seconds: config.mfa_code_step_seconds(),
            skew_steps: config.mfa_code_skew_steps(),
            challenge_ttl: config.mfa_challenge_ttl(),
            confirmed: DashMap::new(),
            pending: DashMap::new(),
        }
    }

    /// Begins enrollment: generates a secret, encrypts it and keeps it pending
    /// until a first code confirms it. A newer enrollment replaces a pending one.
    ///
    /// # Errors
    /// Returns `Internal` if secret generation or encryption fails.
    pub fn enroll_begin(
        &self,
        principal_id: PrincipalId,
        account_name: &str,
    ) -> AuthResult<TotpEnrollment> {
        let mut secret = [0u8; SECRET_LEN];
        OsRng
            .try_fill_bytes(&mut secret)
            .context("failed to generate TOTP secret")?;

        let credential_id = Uuid::new_v4();
        let sealed_seed = self.cipher.encrypt(&secret, principal_id, credential_id)?;
        let totp = self.build(secret.to_vec(), account_name)?;

        self.pending.insert(
            principal_id,
            StoredCredential {
                credential_id,
                sealed_seed,
                created_at: self.clock.now(),
                last_used_step: None,
            },
        );
        info!(principal_id = %principal_id, credential_id = %credential_id, "TOTP enrollment started");

        Ok(TotpEnrollment {
            credential_id,
            secret_base32: totp.get_secret_base32(),
            otpauth_url: totp.get_url(),
        })
    }

    /// Confirms the pending credential with a first valid code.
    ///
    /// # Errors
    /// `MfaNotEnrolled` without a pending enrollment, `CodeMismatch` for a wrong code.
    pub fn enroll_confirm(&self, principal_id: PrincipalId, code: &str) -> AuthResult<()> {
        let now = self.clock.now();
        let (credential_id, step) = {
            let pending = self
                .pending
                .get(&principal_id)
                .ok_or(AuthError::MfaNotEnrolled)?;
            let seed =
                self.cipher
                    .decrypt(&pending.sealed_seed, principal_id, pending.credential_id)?;
            let step = self.matching_step(seed, code, now)?;
            (pending.credential_id, step)
        };
        let Some(step) = step else {
            warn!(principal_id = %principal_id, "TOTP enrollment confirmation failed");
            return Err(AuthError::CodeMismatch);
        };

        let Some((_, mut credential)) = self
            .pending
            .remove_if(&principal_id, |_, pending| pending.credential_id == credential_id)
        else {
            return Err(AuthError::MfaNotEnrolled);
        };
        credential.last_used_step = Some(step);
        self.confirmed.insert(principal_id, credential);
        info!(principal_id = %principal_id, credential_id = %credential_id, "TOTP enrollment confirmed");
        Ok(())
    }

    #[must_use]
    pub fn is_enrolled(&self, principal_id: PrincipalId) -> bool {
        self.confirmed.contains_key(&principal_id)
    }

    /// Verify a code against the confirmed credential. A code is accepted at most
    /// once: its time step must be newer than the last accepted one.
    ///
    /// # Errors
    /// `MfaNotEnrolled` without a confirmed credential, `CodeMismatch` otherwise.
    pub fn verify(&self, principal_id: PrincipalId, code: &str) -> AuthResult<()> {
        let now = self.clock.now();
        let mut credential = self
            .confirmed
            .get_mut(&principal_id)
            .ok_or(AuthError::MfaNotEnrolled)?;
        let seed = self.cipher.decrypt(
            &credential.sealed_seed,
            principal_id,
            credential.credential_id,
        )?;
        let Some(step) = self.matching_step(seed, code, now)? else {
            return Err(AuthError::CodeMismatch);
        };
        if credential.last_used_step.is_some_and(|last| step <= last) {
            warn!(principal_id = %principal_id, "TOTP code replay rejected");
            return Err(AuthError::CodeMismatch);
        }
        credential.last_used_step = Some(step);
        Ok(())
    }

    /// Drop pending enrollments older than the challenge TTL.
    pub fn sweep(&self) -> usize {
        let cutoff = self.clock.now() - self.challenge_ttl;
        let before = self.pending.len();
        self.pending.retain(|_, pending| pending.created_at > cutoff);
        before.saturating_sub(self.pending.len())
    }

    fn build(&self, secret: Vec<u8>, account_name: &str) -> anyhow::Result<TOTP> {
        let account_name = account_name.replace(':', "_");
        TOTP::new(
            Algorithm::SHA1,
            CODE_DIGITS,
            self.skew_steps,
            self.step_seconds,
            secret,
            Some(self.issuer.clone()),
            account_name,
        )
        .map_err(|e| anyhow!("TOTP init error: {e}"))
    }

    /// Time step within the skew window whose code equals `code`, if any.
    fn matching_step(
        &self,
        seed: Vec<u8>,
        code: &str,
        now: DateTime<Utc>,
    ) -> AuthResult<Option<u64>> {
        let code = code.trim();
        if code.len() != CODE_DIGITS || !code.bytes().all(|b| b.is_ascii_digit()) {
            return Ok(None);
        }
        let totp = self.build(seed, "verify")?;
        let now_secs = u64::try_from(now.timestamp()).unwrap_or(0);
        let current = now_secs / self.step_seconds;
        let skew = u64::from(self.skew_steps);

        let mut matched = None;
        for step in current.saturating_sub(skew)..=current.saturating_add(skew) {
            let candidate = totp.generate(step * self.step_seconds);
            if constant_time_eq(candidate.as_bytes(), code.as_bytes()) {
                matched = Some(step);
            }
        }
        Ok(matched)
    }
}

use anyhow::{Context, Result, anyhow};
use chacha20poly1305::{
    ChaCha20Poly1305, Key, Nonce,
    aead::{Aead, KeyInit, Payload},
};
use rand::{RngCore, rngs::OsRng};
use uuid::Uuid;

use crate::authority::types::PrincipalId;

const NONCE_LEN: usize = 12;

/// Encrypts TOTP seeds at rest with a process key, bound to principal and credential.
pub struct SeedCipher {
    key: [u8; 32],
}

impl SeedCipher {
    #[must_use]
    pub fn new(key: [u8; 32]) -> Self {
        Self { key }
    }

    /// # Errors
    /// Returns an error if the OS random source fails.
    pub fn generate() -> Result<Self> {
        let mut key = [0u8; 32];
        OsRng
            .try_fill_bytes(&mut key)
            .context("failed to generate seed key")?;
        Ok(Self::new(key))
    }

    /// Returns `nonce (12 bytes) || ciphertext`.
    ///
    /// # Errors
    /// Returns an error if encryption fails.
    #[allow(deprecated)]
    pub fn encrypt(
        &self,
        seed: &[u8],
        principal_id: PrincipalId,
        credential_id: Uuid,
    ) -> Result<Vec<u8>> {
        let cipher = ChaCha20Poly1305::new(Key::from_slice(&self.key));

        let mut nonce_bytes = [0u8; NONCE_LEN];
        OsRng
            .try_fill_bytes(&mut nonce_bytes)
            .context("failed to generate nonce")?;
        let aad = construct_aad(principal_id, credential_id);
        let ciphertext = cipher
            .encrypt(
                Nonce::from_slice(&nonce_bytes),
                Payload {
                    msg: seed,
                    aad: &aad,
                },
            )
            .map_err(|e| anyhow!("Encryption failure: {e}"))?;

        let mut sealed = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        sealed.extend_from_slice(&nonce_bytes);
        sealed.extend_from_slice(&ciphertext);
        Ok(sealed)
    }

    /// # Errors
    /// Returns an error if the data is truncated, tampered, or bound to other ids.
    #[allow(deprecated)]
    pub fn decrypt(
        &self,
        sealed: &[u8],
        principal_id: PrincipalId,
        credential_id: Uuid,
    ) -> Result<Vec<u8>> {
        if sealed.len() <= NONCE_LEN {
            return Err(anyhow!("Invalid ciphertext length"));
        }
        let (nonce_bytes, ciphertext) = sealed.split_at(NONCE_LEN);
        let cipher = ChaCha20Poly1305::new(Key::from_slice(&self.key));
        let aad = construct_aad(principal_id, credential_id);
        cipher
            .decrypt(
                Nonce::from_slice(nonce_bytes),
                Payload {
                    msg: ciphertext,
                    aad: &aad,
                },
            )
            .map_err(|e| anyhow!("Decryption failure: {e}"))
    }
}

fn construct_aad(principal_id: PrincipalId, credential_id: Uuid) -> Vec<u8> {
    format!("ics-totp-seed:v1|{principal_id}|{credential_id}").into_bytes()
}

//! Access token codec: PASETO `v4.public` (Ed25519 over PAE) with a `kid` footer.
//!
//! Tokens are signed here over the PAE signing input and verified with `pasetors`
//! against the active key or any retired verification key, then the issuer and
//! expiry claims are checked. Tokens are never stored.

use anyhow::{Context, anyhow};
use base64ct::{Base64UrlUnpadded, Encoding};
use chrono::{DateTime, SecondsFormat, Utc};
use ed25519_dalek::{Signer, SigningKey, VerifyingKey};
use pasetors::{
    Public,
    footer::Footer,
    keys::AsymmetricPublicKey,
    token::UntrustedToken,
    version4::{PublicToken, V4},
};
use rand::{RngCore, rngs::OsRng};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;

use super::{
    error::{AuthError, AuthResult},
    types::{AssuranceLevel, PrincipalId, SessionId},
};

const HEADER: &str = "v4.public.";
const SIGNATURE_LEN: usize = 64;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AccessTokenClaims {
    pub iss: String,
    /// Principal id.
    pub sub: String,
    /// Session id.
    pub sid: String,
    /// Assurance level at issue time.
    pub acr: AssuranceLevel,
    pub iat: String,
    pub exp: String,
    pub jti: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
struct TokenFooter {
    kid: String,
}

/// Decoded, verified access token.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct VerifiedAccessToken {
    pub principal_id: PrincipalId,
    pub session_id: SessionId,
    pub assurance_level: AssuranceLevel,
    pub issued_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

/// Active signing key plus retired keys still accepted for verification.
pub struct SigningKeys {
    active: SigningKey,
    active_kid: String,
    verifying: HashMap<String, VerifyingKey>,
}

impl SigningKeys {
    #[must_use]
    pub fn from_seed(seed: &[u8; 32]) -> Self {
        let active = SigningKey::from_bytes(seed);
        let verifying_key = active.verifying_key();
        let active_kid = key_id(&verifying_key);
        Self {
            active,
            verifying: HashMap::from([(active_kid.clone(), verifying_key)]),
            active_kid,
        }
    }

    /// Generate a fresh process-local key.
    ///
    /// # Errors
    /// Returns an error if the OS random source fails.
    pub fn generate() -> anyhow::Result<Self> {
        let mut seed = [0u8; 32];
        OsRng
            .try_fill_bytes(&mut seed)
            .context("failed to generate signing seed")?;
        Ok(Self::from_seed(&seed))
    }

    /// Keep accepting tokens signed by a previous key.
    #[must_use]
    pub fn with_retired(mut self, verifying_key: VerifyingKey) -> Self {
        self.verifying.insert(key_id(&verifying_key), verifying_key);
        self
    }

    #[must_use]
    pub fn active_kid(&self) -> &str {
        &self.active_kid
    }

    #[must_use]
    pub fn verifying_key(&self) -> VerifyingKey {
        self.active.verifying_key()
    }
}

/// Key id: base64url of the first 16 bytes of SHA-256 over the public key.
#[must_use]
pub fn key_id(verifying_key: &VerifyingKey) -> String {
    let digest = Sha256::digest(verifying_key.as_bytes());
    Base64UrlUnpadded::encode_string(&digest[..16])
}

pub struct AccessTokenCodec {
    issuer: String,
    keys: SigningKeys,
}

impl AccessTokenCodec {
    #[must_use]
    pub fn new(issuer: String, keys: SigningKeys) -> Self {
        Self { issuer, keys }
    }

    #[must_use]
    pub fn issuer(&self) -> &str {
        &self.issuer
    }

    /// Sign an access token for the given session snapshot.
    ///
    /// # Errors
    /// Returns `Internal` if claim encoding fails.
    pub fn sign(
        &self,
        principal_id: PrincipalId,
        session_id: &SessionId,
        assurance_level: AssuranceLevel,
        issued_at: DateTime<Utc>,
        expires_at: DateTime<Utc>,
    ) -> AuthResult<String> {
        let claims = AccessTokenClaims {
            iss: self.issuer.clone(),
            sub: principal_id.to_string(),
            sid: session_id.to_string(),
            acr: assurance_level,
            iat: issued_at.to_rfc3339_opts(SecondsFormat::Millis, true),
            exp: expires_at.to_rfc3339_opts(SecondsFormat::Millis, true),
            jti: ulid::Ulid::new().to_string(),
        };
        let footer = TokenFooter {
            kid: self.keys.active_kid.clone(),
        };
        let payload = serde_json::to_vec(&claims).context("failed to encode token claims")?;
        let footer = serde_json::to_vec(&footer).context("failed to encode token footer")?;
        let pre_auth = pae(&[HEADER.as_bytes(), &payload, &footer, b""]);
        let signature = self.keys.active.sign(&pre_auth);
        Ok(build_token(&payload, &footer, &signature.to_bytes()))
    }

    /// Verify signature, issuer and expiry.
    ///
    /// # Errors
    /// `SignatureInvalid` for anything malformed or unsigned by a known key,
    /// `TokenExpired` once `exp` has passed.
    pub fn verify(&self, token: &str, now: DateTime<Utc>) -> AuthResult<VerifiedAccessToken> {
        let untrusted = UntrustedToken::<Public, V4>::try_from(token.trim())
            .map_err(|_| AuthError::SignatureInvalid)?;
        let kid = footer_kid(untrusted.untrusted_footer())?;
        let key = self
            .keys
            .verifying
            .get(&kid)
            .ok_or(AuthError::SignatureInvalid)?;
        let public_key = AsymmetricPublicKey::<V4>::from(key.as_bytes().as_slice())
            .map_err(|err| AuthError::Internal(format!("unusable verification key: {err}")))?;
        let trusted = PublicToken::verify(&public_key, &untrusted, None, None)
            .map_err(|_| AuthError::SignatureInvalid)?;

        let claims: AccessTokenClaims =
            serde_json::from_str(trusted.payload()).map_err(|_| AuthError::SignatureInvalid)?;
        if claims.iss != self.issuer {
            return Err(AuthError::SignatureInvalid);
        }
        let issued_at = parse_time(&claims.iat)?;
        let expires_at = parse_time(&claims.exp)?;
        if expires_at <= now {
            return Err(AuthError::TokenExpired);
        }
        let principal_id = PrincipalId::parse(&claims.sub).ok_or(AuthError::SignatureInvalid)?;
        let session_id = SessionId::parse(&claims.sid).ok_or(AuthError::SignatureInvalid)?;
        Ok(VerifiedAccessToken {
            principal_id,
            session_id,
            assurance_level: claims.acr,
            issued_at,
            expires_at,
        })
    }
}

fn footer_kid(footer_bytes: &[u8]) -> AuthResult<String> {
    if footer_bytes.is_empty() {
        return Err(AuthError::SignatureInvalid);
    }
    let mut footer = Footer::new();
    footer
        .parse_bytes(footer_bytes)
        .map_err(|_| AuthError::SignatureInvalid)?;
    footer
        .get_claim("kid")
        .and_then(|value| value.as_str())
        .map(ToString::to_string)
        .ok_or(AuthError::SignatureInvalid)
}

fn parse_time(value: &str) -> AuthResult<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|time| time.with_timezone(&Utc))
        .map_err(|_| AuthError::SignatureInvalid)
}

fn build_token(payload: &[u8], footer: &[u8], signature: &[u8; SIGNATURE_LEN]) -> String {
    let mut message = Vec::with_capacity(payload.len() + signature.len());
    message.extend_from_slice(payload);
    message.extend_from_slice(signature);
    let body_b64 = Base64UrlUnpadded::encode_string(&message);
    let footer_b64 = Base64UrlUnpadded::encode_string(footer);
    format!("{HEADER}{body_b64}.{footer_b64}")
}

/// Pre-authentication encoding.
fn pae(pieces: &[&[u8]]) -> Vec<u8> {
    let mut out = Vec::new();
    out.extend_from_slice(&le64(pieces.len() as u64));
    for piece in pieces {
        out.extend_from_slice(&le64(piece.len() as u64));
        out.extend_from_slice(piece);
    }
    out
}

fn le64(value: u64) -> [u8; 8] {
    (value & 0x7fff_ffff_ffff_ffff).to_le_bytes()
}

/// Decode a base64 (standard or url-safe) 32-byte seed from configuration.
///
/// # Errors
/// Returns an error if the value is not valid base64 or not 32 bytes long.
pub fn decode_seed(value: &str) -> anyhow::Result<[u8; 32]> {
    use base64::Engine;
    let value = value.trim();
    let bytes = base64::engine::general_purpose::STANDARD
        .decode(value)
        .or_else(|_| base64::engine::general_purpose::URL_SAFE_NO_PAD.decode(value))
        .map_err(|err| anyhow!("seed is not valid base64: {err}"))?;
    bytes
        .try_into()
        .map_err(|bytes: Vec<u8>| anyhow!("seed must be 32 bytes, got {}", bytes.len()))
}

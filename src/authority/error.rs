//! Closed error taxonomy for the session authority.
//!
//! Every failure leaving the core is one of these variants. Infrastructure
//! errors are collapsed into `Internal` at the component boundary so raw
//! causes never cross the external interface.

use serde::{Deserialize, Serialize};
use thiserror::Error;
use utoipa::ToSchema;

/// Coarse classification callers switch on.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    InputValidation,
    Authentication,
    Conflict,
    RateLimited,
    NotFound,
    Internal,
}

#[derive(Clone, Debug, Eq, PartialEq, Error)]
pub enum AuthError {
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    #[error("invalid credential")]
    InvalidCredential,
    #[error("too many failed attempts")]
    LockedOut { retry_after_ms: u64 },
    #[error("principal already exists")]
    PrincipalExists,
    #[error("refresh token is not valid")]
    RefreshInvalid,
    #[error("refresh token was already redeemed")]
    RefreshReused,
    #[error("session expired")]
    SessionExpired,
    #[error("session revoked")]
    SessionRevoked,
    #[error("session not found")]
    SessionNotFound,
    #[error("access token expired")]
    TokenExpired,
    #[error("access token signature invalid")]
    SignatureInvalid,
    #[error("no second factor enrolled")]
    MfaNotEnrolled,
    #[error("challenge not found")]
    ChallengeNotFound,
    #[error("code expired")]
    CodeExpired,
    #[error("code mismatch")]
    CodeMismatch,
    #[error("application is not part of the trust domain")]
    ApplicationNotTrusted,
    #[error("rate limited")]
    RateLimited { retry_after_ms: u64 },
    #[error("backend timed out")]
    Timeout,
    #[error("internal error: {0}")]
    Internal(String),
}

impl AuthError {
    /// Stable machine-readable code.
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::InvalidRequest(_) => "INVALID_REQUEST",
            Self::InvalidCredential => "INVALID_CREDENTIAL",
            Self::LockedOut { .. } => "LOCKED_OUT",
            Self::PrincipalExists => "PRINCIPAL_EXISTS",
            Self::RefreshInvalid => "REFRESH_INVALID",
            Self::RefreshReused => "REFRESH_REUSED",
            Self::SessionExpired => "SESSION_EXPIRED",
            Self::SessionRevoked => "SESSION_REVOKED",
            Self::SessionNotFound => "SESSION_NOT_FOUND",
            Self::TokenExpired => "TOKEN_EXPIRED",
            Self::SignatureInvalid => "SIGNATURE_INVALID",
            Self::MfaNotEnrolled => "MFA_NOT_ENROLLED",
            Self::ChallengeNotFound => "CHALLENGE_NOT_FOUND",
            Self::CodeExpired => "CODE_EXPIRED",
            Self::CodeMismatch => "CODE_MISMATCH",
            Self::ApplicationNotTrusted => "APPLICATION_NOT_TRUSTED",
            Self::RateLimited { .. } => "RATE_LIMITED",
            Self::Timeout => "SERVER_ERROR",
            Self::Internal(_) => "INTERNAL",
        }
    }

    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::InvalidRequest(_) => ErrorKind::InputValidation,
            Self::InvalidCredential
            | Self::LockedOut { .. }
            | Self::RefreshInvalid
            | Self::SessionExpired
            | Self::SessionRevoked
            | Self::TokenExpired
            | Self::SignatureInvalid
            | Self::MfaNotEnrolled
            | Self::CodeExpired
            | Self::CodeMismatch
            | Self::ApplicationNotTrusted => ErrorKind::Authentication,
            Self::PrincipalExists | Self::RefreshReused => ErrorKind::Conflict,
            Self::RateLimited { .. } => ErrorKind::RateLimited,
            Self::SessionNotFound | Self::ChallengeNotFound => ErrorKind::NotFound,
            Self::Timeout | Self::Internal(_) => ErrorKind::Internal,
        }
    }

    /// Backoff hint carried by throttling outcomes.
    #[must_use]
    pub fn retry_after_ms(&self) -> Option<u64> {
        match self {
            Self::LockedOut { retry_after_ms } | Self::RateLimited { retry_after_ms } => {
                Some(*retry_after_ms)
            }
            _ => None,
        }
    }

    /// Message safe to show to the caller; internal detail is withheld.
    #[must_use]
    pub fn public_message(&self) -> String {
        match self {
            Self::Internal(_) => "internal error".to_string(),
            Self::Timeout => "service temporarily unavailable".to_string(),
            other => other.to_string(),
        }
    }
}

impl From<anyhow::Error> for AuthError {
    fn from(err: anyhow::Error) -> Self {
        Self::Internal(format!("{err:#}"))
    }
}

pub type AuthResult<T> = Result<T, AuthError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_are_stable() {
        assert_eq!(AuthError::RefreshReused.code(), "REFRESH_REUSED");
        assert_eq!(AuthError::SessionRevoked.code(), "SESSION_REVOKED");
        assert_eq!(AuthError::Timeout.code(), "SERVER_ERROR");
        assert_eq!(
            AuthError::RateLimited { retry_after_ms: 5 }.code(),
            "RATE_LIMITED"
        );
    }

    #[test]
    fn kinds_follow_taxonomy() {
        assert_eq!(
            AuthError::InvalidRequest("x".into()).kind(),
            ErrorKind::InputValidation
        );
        assert_eq!(AuthError::RefreshReused.kind(), ErrorKind::Conflict);
        assert_eq!(AuthError::ChallengeNotFound.kind(), ErrorKind::NotFound);
        assert_eq!(
            AuthError::LockedOut { retry_after_ms: 1 }.kind(),
            ErrorKind::Authentication
        );
        assert_eq!(AuthError::Timeout.kind(), ErrorKind::Internal);
    }

    #[test]
    fn internal_detail_is_not_public() {
        let err = AuthError::from(anyhow::anyhow!("disk on fire"));
        assert_eq!(err.kind(), ErrorKind::Internal);
        assert_eq!(err.public_message(), "internal error");
        assert!(err.to_string().contains("disk on fire"));
    }

    #[test]
    fn retry_hint_only_on_throttling() {
        assert_eq!(
            AuthError::LockedOut {
                retry_after_ms: 900
            }
            .retry_after_ms(),
            Some(900)
        );
        assert_eq!(AuthError::CodeMismatch.retry_after_ms(), None);
    }
}

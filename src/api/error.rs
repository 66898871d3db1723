//! HTTP rendering of `AuthError`.
//!
//! Every failure leaves as `{code, message, details?, requestId}`; throttling
//! outcomes also carry a `Retry-After` header in whole seconds.

use axum::{
    Json,
    http::{HeaderMap, HeaderValue, StatusCode, header::RETRY_AFTER},
    response::{IntoResponse, Response},
};
use serde::Serialize;
use tracing::error;
use utoipa::ToSchema;

use crate::authority::{AuthError, ErrorKind};

#[derive(Debug, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct ErrorDetails {
    pub retry_after_ms: u64,
}

#[derive(Debug, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct ErrorBody {
    pub code: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<ErrorDetails>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
}

#[derive(Debug)]
pub struct ApiError {
    error: AuthError,
    request_id: Option<String>,
}

impl ApiError {
    /// Attach the request id assigned by the request-id layer, if any.
    #[must_use]
    pub fn new(error: AuthError, headers: &HeaderMap) -> Self {
        Self {
            error,
            request_id: request_id(headers),
        }
    }

    #[must_use]
    pub fn error(&self) -> &AuthError {
        &self.error
    }
}

pub(crate) fn request_id(headers: &HeaderMap) -> Option<String> {
    headers
        .get("x-request-id")
        .and_then(|value| value.to_str().ok())
        .map(str::to_string)
}

#[must_use]
pub fn status_for(error: &AuthError) -> StatusCode {
    match error {
        AuthError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
        AuthError::SessionRevoked
        | AuthError::LockedOut { .. }
        | AuthError::ApplicationNotTrusted => StatusCode::FORBIDDEN,
        AuthError::SessionNotFound | AuthError::ChallengeNotFound => StatusCode::NOT_FOUND,
        AuthError::PrincipalExists | AuthError::RefreshReused => StatusCode::CONFLICT,
        AuthError::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
        AuthError::Timeout | AuthError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        _ => StatusCode::UNAUTHORIZED,
    }
}

/// Whole seconds, rounded up, never zero.
fn retry_after_seconds(millis: u64) -> u64 {
    millis.div_ceil(1000).max(1)
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = status_for(&self.error);
        if self.error.kind() == ErrorKind::Internal {
            error!(
                request_id = self.request_id.as_deref().unwrap_or("none"),
                code = self.error.code(),
                "Request failed: {}",
                self.error
            );
        }

        let retry_after_ms = self.error.retry_after_ms();
        let body = ErrorBody {
            code: self.error.code().to_string(),
            message: self.error.public_message(),
            details: retry_after_ms.map(|retry_after_ms| ErrorDetails { retry_after_ms }),
            request_id: self.request_id,
        };

        let mut response = (status, Json(body)).into_response();
        if let Some(millis) = retry_after_ms
            && let Ok(value) = HeaderValue::from_str(&retry_after_seconds(millis).to_string())
        {
            response.headers_mut().insert(RETRY_AFTER, value);
        }
        response
    }
}

//! Step-up and TOTP enrollment endpoints.

use axum::{
    Json,
    extract::{Extension, rejection::JsonRejection},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use utoipa::ToSchema;

use super::utils::{bearer_token, payload};
use crate::{
    api::{
        error::{ApiError, ErrorBody},
        state::ApiState,
    },
    authority::{
        AccessToken, AssuranceLevel, AuthError, AuthResult, Authority, ChallengeId, Session,
        StepUpDecision, ValidatedAccess,
    },
    totp::TotpEnrollment,
};

#[derive(Deserialize, ToSchema)]
pub struct ChallengeRequest {
    /// Operation the caller is about to perform, e.g. `change_password`.
    pub operation: String,
}

#[derive(Debug, Deserialize, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct ChallengeResponse {
    /// `PASSTHROUGH` or `CHALLENGE`.
    pub decision: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub assurance_level: Option<AssuranceLevel>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub challenge_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
}

impl From<StepUpDecision> for ChallengeResponse {
    fn from(decision: StepUpDecision) -> Self {
        match decision {
            StepUpDecision::Passthrough { assurance_level } => Self {
                decision: "PASSTHROUGH".to_string(),
                assurance_level: Some(assurance_level),
                challenge_id: None,
                expires_at: None,
            },
            StepUpDecision::Challenge {
                challenge_id,
                expires_at,
            } => Self {
                decision: "CHALLENGE".to_string(),
                assurance_level: None,
                challenge_id: Some(challenge_id.to_string()),
                expires_at: Some(expires_at),
            },
        }
    }
}

#[derive(Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct VerifyRequest {
    pub challenge_id: String,
    pub code: String,
}

#[derive(Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct VerifyResponse {
    pub session: Session,
    pub access_token: AccessToken,
}

#[derive(Deserialize, ToSchema)]
pub struct ConfirmRequest {
    pub code: String,
}

async fn authenticated(authority: &Authority, headers: &HeaderMap) -> AuthResult<ValidatedAccess> {
    let token = bearer_token(headers).ok_or(AuthError::InvalidCredential)?;
    authority.validate_access_token(token).await
}

#[utoipa::path(
    post,
    path = "/mfa/challenge",
    request_body = ChallengeRequest,
    responses(
        (status = 200, description = "Passthrough or a new challenge", body = ChallengeResponse),
        (status = 401, description = "Unauthenticated or no factor enrolled", body = ErrorBody),
        (status = 403, description = "Session revoked", body = ErrorBody)
    ),
    security(("bearer" = [])),
    tag = "mfa"
)]
pub async fn challenge(
    headers: HeaderMap,
    state: Extension<Arc<ApiState>>,
    request: Result<Json<ChallengeRequest>, JsonRejection>,
) -> Result<Json<ChallengeResponse>, ApiError> {
    let fail = |e| ApiError::new(e, &headers);
    let request = payload(request).map_err(fail)?;
    let authority = state.authority();
    let access = authenticated(authority, &headers).await.map_err(fail)?;
    let decision = authority
        .require_step_up(&access.session_id, &request.operation)
        .await
        .map_err(fail)?;
    Ok(Json(decision.into()))
}

#[utoipa::path(
    post,
    path = "/mfa/verify",
    request_body = VerifyRequest,
    responses(
        (status = 200, description = "Session upgraded to MFA_VERIFIED", body = VerifyResponse),
        (status = 401, description = "Code mismatch or expired", body = ErrorBody),
        (status = 404, description = "Unknown challenge", body = ErrorBody),
        (status = 429, description = "Rate limited", body = ErrorBody)
    ),
    tag = "mfa"
)]
pub async fn verify(
    headers: HeaderMap,
    state: Extension<Arc<ApiState>>,
    request: Result<Json<VerifyRequest>, JsonRejection>,
) -> Result<Json<VerifyResponse>, ApiError> {
    let fail = |e| ApiError::new(e, &headers);
    let request = payload(request).map_err(fail)?;
    let challenge_id = ChallengeId::parse(&request.challenge_id).ok_or_else(|| fail(AuthError::ChallengeNotFound))?;
    let completion = state
        .authority()
        .complete_step_up(challenge_id, &request.code)
        .await
        .map_err(fail)?;
    Ok(Json(VerifyResponse {
        session: completion.session,
        access_token: completion.access_token,
    }))
}

#[utoipa::path(
    post,
    path = "/mfa/totp/enroll",
    responses(
        (status = 200, description = "Enrollment started; confirm with a first code", body = TotpEnrollment),
        (status = 401, description = "Unauthenticated", body = ErrorBody)
    ),
    security(("bearer" = [])),
    tag = "mfa"
)]
pub async fn totp_enroll(
    headers: HeaderMap,
    state: Extension<Arc<ApiState>>,
) -> Result<Json<TotpEnrollment>, ApiError> {
    let fail = |e| ApiError::new(e, &headers);
    let authority = state.authority();
    let access = authenticated(authority, &headers).await.map_err(fail)?;
    let enrollment = authority
        .totp_enroll_begin(access.principal_id)
        .await
        .map_err(fail)?;
    Ok(Json(enrollment))
}

#[utoipa::path(
    post,
    path = "/mfa/totp/confirm",
    request_body = ConfirmRequest,
    responses(
        (status = 204, description = "Factor enrolled"),
        (status = 401, description = "Unauthenticated, no pending enrollment, or wrong code", body = ErrorBody),
        (status = 429, description = "Rate limited", body = ErrorBody)
    ),
    security(("bearer" = [])),
    tag = "mfa"
)]
pub async fn totp_confirm(
    headers: HeaderMap,
    state: Extension<Arc<ApiState>>,
    request: Result<Json<ConfirmRequest>, JsonRejection>,
) -> Result<Response, ApiError> {
    let fail = |e| ApiError::new(e, &headers);
    let request = payload(request).map_err(fail)?;
    let authority = state.authority();
    let access = authenticated(authority, &headers).await.map_err(fail)?;
    authority
        .totp_enroll_confirm(access.principal_id, &request.code)
        .await
        .map_err(fail)?;
    Ok(StatusCode::NO_CONTENT.into_response())
}

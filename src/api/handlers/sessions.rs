//! Session endpoints: login, refresh, current session and revocation.
//!
//! Login sets an `HttpOnly` cookie carrying the session id so browser-based
//! applications in the trust domain can query the session without a token.

use axum::{
    Json,
    extract::{Extension, rejection::JsonRejection},
    http::{HeaderMap, StatusCode, header::SET_COOKIE},
    response::{IntoResponse, Response},
};
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::sync::Arc;
use tracing::{error, warn};
use utoipa::ToSchema;

use super::utils::{
    APPLICATION_ID_HEADER, FEDERATION_KEY_HEADER, IDEMPOTENCY_KEY_HEADER, caller_session,
    clear_session_cookie, extract_client_ip, header_str, payload, set_session_cookie,
};
use crate::{
    api::{
        error::{ApiError, ErrorBody},
        state::ApiState,
    },
    authority::{
        AuthError, AuthResult, Credential, FederatedAssertion, IssuedSession, Session, TokenPair,
        utils::constant_time_eq,
    },
};

#[derive(Deserialize, ToSchema)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum LoginRequest {
    Password {
        username: String,
        #[schema(format = Password)]
        password: String,
    },
    /// Assertion already validated by the federation layer.
    Federated {
        issuer: String,
        subject: String,
        #[serde(default)]
        #[schema(value_type = Object)]
        claims: Map<String, Value>,
    },
}

#[derive(Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct RefreshRequest {
    pub refresh_token: String,
}

#[derive(Default, Deserialize, ToSchema)]
pub struct RevokeRequest {
    /// Revoke every session of the principal, not only this one.
    #[serde(default)]
    pub all: bool,
}

#[derive(Debug, Deserialize, Serialize, ToSchema)]
pub struct RevokeResponse {
    pub revoked: usize,
}

#[utoipa::path(
    post,
    path = "/sessions",
    request_body = LoginRequest,
    responses(
        (status = 200, description = "Session opened", body = IssuedSession),
        (status = 400, description = "Malformed request", body = ErrorBody),
        (status = 401, description = "Invalid credential", body = ErrorBody),
        (status = 403, description = "Locked out", body = ErrorBody),
        (status = 429, description = "Rate limited", body = ErrorBody)
    ),
    tag = "sessions"
)]
pub async fn login(
    headers: HeaderMap,
    state: Extension<Arc<ApiState>>,
    request: Result<Json<LoginRequest>, JsonRejection>,
) -> Result<Response, ApiError> {
    let fail = |e| ApiError::new(e, &headers);
    let credential = credential(&state, &headers, payload(request).map_err(fail)?).map_err(fail)?;
    let client_ip = extract_client_ip(&headers);

    let issued = state
        .authority()
        .login(&credential, client_ip.as_deref())
        .await
        .map_err(fail)?;

    let max_age = state
        .authority()
        .config()
        .refresh_token_ttl()
        .num_seconds();
    let mut response_headers = HeaderMap::new();
    match set_session_cookie(&issued.session.session_id, max_age, state.cookie_secure()) {
        Ok(cookie) => {
            response_headers.insert(SET_COOKIE, cookie);
        }
        Err(err) => error!("Failed to build session cookie: {err}"),
    }
    Ok((StatusCode::OK, response_headers, Json(issued)).into_response())
}

fn credential(state: &ApiState, headers: &HeaderMap, request: LoginRequest) -> AuthResult<Credential> {
    match request {
        LoginRequest::Password { username, password } => Ok(Credential::Password {
            username,
            password: SecretString::from(password),
        }),
        LoginRequest::Federated {
            issuer,
            subject,
            claims,
        } => {
            let presented = header_str(headers, FEDERATION_KEY_HEADER).unwrap_or_default();
            let accepted = state.federation_secret().is_some_and(|secret| {
                constant_time_eq(secret.expose_secret().as_bytes(), presented.as_bytes())
            });
            if !accepted {
                warn!(issuer, "Federated login refused: federation key missing or wrong");
                return Err(AuthError::InvalidCredential);
            }
            Ok(Credential::Federated(FederatedAssertion {
                issuer,
                subject,
                claims,
            }))
        }
    }
}

#[utoipa::path(
    post,
    path = "/sessions/refresh",
    request_body = RefreshRequest,
    params(
        ("Idempotency-Key" = Option<String>, Header, description = "Lets a client safely retry a refresh whose response was lost")
    ),
    responses(
        (status = 200, description = "Rotated token pair", body = TokenPair),
        (status = 401, description = "Unknown or expired refresh token", body = ErrorBody),
        (status = 403, description = "Session revoked", body = ErrorBody),
        (status = 409, description = "Refresh token reuse detected; session revoked", body = ErrorBody),
        (status = 429, description = "Rate limited", body = ErrorBody)
    ),
    tag = "sessions"
)]
pub async fn refresh(
    headers: HeaderMap,
    state: Extension<Arc<ApiState>>,
    request: Result<Json<RefreshRequest>, JsonRejection>,
) -> Result<Json<TokenPair>, ApiError> {
    let fail = |e| ApiError::new(e, &headers);
    let request = payload(request).map_err(fail)?;
    let client_ip = extract_client_ip(&headers);
    let pair = state
        .authority()
        .refresh(
            &request.refresh_token,
            header_str(&headers, IDEMPOTENCY_KEY_HEADER),
            client_ip.as_deref(),
        )
        .await
        .map_err(fail)?;
    Ok(Json(pair))
}

#[utoipa::path(
    get,
    path = "/sessions/current",
    params(
        ("x-ics-application-id" = Option<String>, Header, description = "Records the calling application as an observer of the session")
    ),
    responses(
        (status = 200, description = "Session is active", body = Session),
        (status = 401, description = "No credential, or session expired", body = ErrorBody),
        (status = 403, description = "Session revoked or application not trusted", body = ErrorBody),
        (status = 404, description = "Unknown session", body = ErrorBody)
    ),
    security(("bearer" = []), ("cookie" = [])),
    tag = "sessions"
)]
pub async fn current(
    headers: HeaderMap,
    state: Extension<Arc<ApiState>>,
) -> Result<Json<Session>, ApiError> {
    let fail = |e| ApiError::new(e, &headers);
    let authority = state.authority();
    let (session_id, _) = caller_session(authority, &headers).await.map_err(fail)?;
    let session = match header_str(&headers, APPLICATION_ID_HEADER) {
        Some(application_id) => authority.observe(&session_id, application_id).await,
        None => authority.check_session(&session_id).await,
    }
    .map_err(fail)?;
    Ok(Json(session))
}

#[utoipa::path(
    post,
    path = "/sessions/revoke",
    request_body(content = RevokeRequest, description = "Optional; defaults to revoking the current session"),
    responses(
        (status = 200, description = "Sessions revoked", body = RevokeResponse),
        (status = 401, description = "No credential", body = ErrorBody),
        (status = 404, description = "Unknown session", body = ErrorBody)
    ),
    security(("bearer" = []), ("cookie" = [])),
    tag = "sessions"
)]
pub async fn revoke(
    headers: HeaderMap,
    state: Extension<Arc<ApiState>>,
    request: Result<Json<RevokeRequest>, JsonRejection>,
) -> Result<Response, ApiError> {
    let fail = |e| ApiError::new(e, &headers);
    // An empty body means "this session only".
    let request = match request {
        Ok(Json(request)) => request,
        Err(JsonRejection::MissingJsonContentType(_)) => RevokeRequest::default(),
        Err(rejection) => return Err(fail(AuthError::InvalidRequest(rejection.body_text()))),
    };
    let authority = state.authority();
    let (session_id, principal_id) = caller_session(authority, &headers).await.map_err(fail)?;

    let revoked = if request.all {
        let principal_id = match principal_id {
            Some(principal_id) => principal_id,
            None => {
                authority
                    .check_session(&session_id)
                    .await
                    .map_err(fail)?
                    .principal_id
            }
        };
        authority.logout_principal(principal_id).await.map_err(fail)?
    } else {
        let session = authority.logout_everywhere(&session_id).await.map_err(fail)?;
        usize::from(session.revoked)
    };

    let mut response_headers = HeaderMap::new();
    if let Ok(cookie) = clear_session_cookie(state.cookie_secure()) {
        response_headers.insert(SET_COOKIE, cookie);
    }
    Ok((StatusCode::OK, response_headers, Json(RevokeResponse { revoked })).into_response())
}

//! Header helpers shared by the handlers: client address, bearer tokens and
//! the session cookie.

use axum::http::{
    HeaderMap, HeaderValue,
    header::{AUTHORIZATION, COOKIE, InvalidHeaderValue},
};
use axum::extract::rejection::JsonRejection;

use crate::authority::{AuthError, AuthResult, Authority, PrincipalId, SessionId};

pub const SESSION_COOKIE_NAME: &str = "ics_session";
pub const APPLICATION_ID_HEADER: &str = "x-ics-application-id";
pub const FEDERATION_KEY_HEADER: &str = "x-ics-federation-key";
pub const IDEMPOTENCY_KEY_HEADER: &str = "idempotency-key";

/// Extract a client IP for rate limiting from common proxy headers.
pub(crate) fn extract_client_ip(headers: &HeaderMap) -> Option<String> {
    let forwarded = headers
        .get("x-forwarded-for")
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.split(',').next())
        .map(str::trim)
        .filter(|value| !value.is_empty());
    if forwarded.is_some() {
        return forwarded.map(str::to_string);
    }
    headers
        .get("x-real-ip")
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(str::to_string)
}

pub(crate) fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|value| !value.is_empty())
}

pub(crate) fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    let value = headers.get(AUTHORIZATION)?.to_str().ok()?.trim();
    let token = value
        .strip_prefix("Bearer ")
        .or_else(|| value.strip_prefix("bearer "))?
        .trim();
    (!token.is_empty()).then_some(token)
}

pub(crate) fn session_cookie(headers: &HeaderMap) -> Option<SessionId> {
    headers
        .get_all(COOKIE)
        .iter()
        .filter_map(|header| header.to_str().ok())
        .flat_map(|value| value.split(';'))
        .filter_map(|pair| pair.trim().split_once('='))
        .find(|(key, _)| key.trim() == SESSION_COOKIE_NAME)
        .and_then(|(_, value)| SessionId::parse(value))
}

pub(crate) fn set_session_cookie(
    session_id: &SessionId,
    max_age_seconds: i64,
    secure: bool,
) -> Result<HeaderValue, InvalidHeaderValue> {
    let mut cookie = format!(
        "{SESSION_COOKIE_NAME}={}; Path=/; HttpOnly; SameSite=Strict; Max-Age={max_age_seconds}",
        session_id.as_str()
    );
    if secure {
        cookie.push_str("; Secure");
    }
    HeaderValue::from_str(&cookie)
}

pub(crate) fn clear_session_cookie(secure: bool) -> Result<HeaderValue, InvalidHeaderValue> {
    let mut cookie = format!("{SESSION_COOKIE_NAME}=; Path=/; HttpOnly; SameSite=Strict; Max-Age=0");
    if secure {
        cookie.push_str("; Secure");
    }
    HeaderValue::from_str(&cookie)
}

/// The caller's session: a bearer access token wins over the cookie.
/// The principal is known only when it came from a validated token.
pub(crate) async fn caller_session(
    authority: &Authority,
    headers: &HeaderMap,
) -> AuthResult<(SessionId, Option<PrincipalId>)> {
    if let Some(token) = bearer_token(headers) {
        let access = authority.validate_access_token(token).await?;
        return Ok((access.session_id, Some(access.principal_id)));
    }
    session_cookie(headers)
        .map(|session_id| (session_id, None))
        .ok_or(AuthError::InvalidCredential)
}

pub(crate) fn payload<T>(payload: Result<axum::Json<T>, JsonRejection>) -> AuthResult<T> {
    payload
        .map(|axum::Json(value)| value)
        .map_err(|rejection| AuthError::InvalidRequest(rejection.body_text()))
}

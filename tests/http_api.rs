use anyhow::{Result, anyhow};
use axum::{
    body::{Body, to_bytes},
    http::{Request, StatusCode, header},
    response::Response,
};
use ics_session::{
    api::{self, ApiState},
    authority::{
        AuthResult, Authority, AuthorityConfig, ManualClock, OperationClass, RateLimiter,
        SigningKeys,
    },
    totp::SeedCipher,
};
use serde_json::{Value, json};
use std::sync::Arc;
use tower::ServiceExt;

fn state() -> Result<Arc<ApiState>> {
    let authority = Authority::new(
        AuthorityConfig::new().with_backend_timeout_ms(30_000),
        SigningKeys::from_seed(&[11u8; 32]),
        SeedCipher::new([12u8; 32]),
        Arc::new(ManualClock::at_unix(1_700_000_010)),
    )?;
    Ok(Arc::new(
        ApiState::new(Arc::new(authority)).with_cookie_secure(false),
    ))
}

fn post(uri: &str, body: &Value) -> Result<Request<Body>> {
    Ok(Request::builder()
        .method("POST")
        .uri(uri)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(serde_json::to_vec(body)?))?)
}

async fn json(response: Response) -> Result<Value> {
    let bytes = to_bytes(response.into_body(), usize::MAX).await?;
    Ok(serde_json::from_slice(&bytes)?)
}

fn text<'a>(value: &'a Value, pointer: &str) -> Result<&'a str> {
    value
        .pointer(pointer)
        .and_then(Value::as_str)
        .ok_or_else(|| anyhow!("missing {pointer} in {value}"))
}

#[tokio::test]
async fn session_lifecycle_over_http() -> Result<()> {
    let state = state()?;
    let credentials = json!({"username": "frank", "password": "s3cret-passphrase"});

    let response = api::app(state.clone())
        .oneshot(post("/principals", &credentials)?)
        .await?;
    assert_eq!(response.status(), StatusCode::CREATED);

    let mut login = credentials.clone();
    login["type"] = json!("password");
    let response = api::app(state.clone())
        .oneshot(post("/sessions", &login)?)
        .await?;
    assert_eq!(response.status(), StatusCode::OK);
    let issued = json(response).await?;
    assert_eq!(text(&issued, "/session/assuranceLevel")?, "BASIC");
    let access_token = text(&issued, "/accessToken/token")?.to_string();
    let refresh_token = text(&issued, "/refreshToken/token")?.to_string();

    let response = api::app(state.clone())
        .oneshot(post("/sessions/refresh", &json!({"refreshToken": refresh_token}))?)
        .await?;
    assert_eq!(response.status(), StatusCode::OK);
    let rotated = json(response).await?;
    assert_eq!(
        rotated.pointer("/refreshToken/rotationCounter").and_then(Value::as_u64),
        Some(1)
    );

    let response = api::app(state.clone())
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/sessions/revoke")
                .header(header::AUTHORIZATION, format!("Bearer {access_token}"))
                .body(Body::empty())?,
        )
        .await?;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(json(response).await?["revoked"], json!(1));

    let response = api::app(state)
        .oneshot(
            Request::builder()
                .uri("/sessions/current")
                .header(header::AUTHORIZATION, format!("Bearer {access_token}"))
                .header("x-request-id", "support-ticket-42")
                .body(Body::empty())?,
        )
        .await?;
    assert_eq!(response.status(), StatusCode::FORBIDDEN);
    let body = json(response).await?;
    assert_eq!(text(&body, "/code")?, "SESSION_REVOKED");
    assert_eq!(text(&body, "/requestId")?, "support-ticket-42");
    Ok(())
}

#[tokio::test]
async fn unknown_refresh_token_is_rejected() -> Result<()> {
    let response = api::app(state()?)
        .oneshot(post("/sessions/refresh", &json!({"refreshToken": "nope"}))?)
        .await?;
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    assert_eq!(text(&json(response).await?, "/code")?, "REFRESH_INVALID");
    Ok(())
}

struct StalledLimiter;

impl RateLimiter for StalledLimiter {
    fn allow(&self, _key: &str, _operation: OperationClass) -> AuthResult<()> {
        std::thread::sleep(std::time::Duration::from_millis(1_500));
        Ok(())
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn stalled_backend_answers_server_error() -> Result<()> {
    let authority = Authority::with_rate_limiter(
        AuthorityConfig::new().with_backend_timeout_ms(100),
        SigningKeys::from_seed(&[11u8; 32]),
        SeedCipher::new([12u8; 32]),
        Arc::new(ManualClock::at_unix(1_700_000_010)),
        Arc::new(StalledLimiter),
    )?;
    let state = Arc::new(ApiState::new(Arc::new(authority)));

    let login = json!({"type": "password", "username": "grace", "password": "s3cret-passphrase"});
    let response = api::app(state).oneshot(post("/sessions", &login)?).await?;
    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    let body = json(response).await?;
    assert_eq!(text(&body, "/code")?, "SERVER_ERROR");
    Ok(())
}

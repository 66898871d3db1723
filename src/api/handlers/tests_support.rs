use anyhow::Result;
use axum::{Router, body::to_bytes, http::HeaderValue, response::Response};
use secrecy::SecretString;
use std::sync::Arc;

use crate::{
    api::{app, state::ApiState},
    authority::{
        Authority, AuthorityConfig, Credential, FederatedAssertion, IssuedSession, ManualClock,
        Principal, SigningKeys,
    },
    totp::SeedCipher,
};

pub(crate) struct TestApp {
    state: Arc<ApiState>,
    pub clock: Arc<ManualClock>,
}

impl TestApp {
    pub const START: i64 = 1_700_000_010;
    pub const FEDERATION_KEY: &'static str = "federation-test-key";

    pub fn new() -> Result<Self> {
        let clock = Arc::new(ManualClock::at_unix(Self::START));
        let authority = Authority::new(
            AuthorityConfig::new().with_backend_timeout_ms(30_000),
            SigningKeys::from_seed(&[7; 32]),
            SeedCipher::new([8; 32]),
            clock.clone(),
        )?;
        let state = ApiState::new(Arc::new(authority))
            .with_federation_secret(Some(SecretString::from(Self::FEDERATION_KEY)))
            .with_cookie_secure(false);
        Ok(Self {
            state: Arc::new(state),
            clock,
        })
    }

    pub fn router(&self) -> Router {
        app(self.state.clone())
    }

    pub fn authority(&self) -> &Authority {
        self.state.authority()
    }

    pub async fn register(&self, username: &str, password: &str) -> Result<Principal> {
        Ok(self
            .authority()
            .register(username, &SecretString::from(password))
            .await?)
    }

    pub async fn federated_login(&self, subject: &str) -> Result<IssuedSession> {
        let credential = Credential::Federated(FederatedAssertion {
            issuer: "https://idp.example".to_string(),
            subject: subject.to_string(),
            claims: serde_json::Map::new(),
        });
        Ok(self.authority().login(&credential, None).await?)
    }
}

pub(crate) async fn json_body(response: Response) -> Result<serde_json::Value> {
    let bytes = to_bytes(response.into_body(), usize::MAX).await?;
    Ok(serde_json::from_slice(&bytes)?)
}

pub(crate) fn header(response: &Response, name: &str) -> Option<HeaderValue> {
    response.headers().get(name).cloned()
}

use secrecy::SecretString;
use std::sync::Arc;

use crate::authority::Authority;

/// Shared state for the HTTP layer.
pub struct ApiState {
    authority: Arc<Authority>,
    federation_secret: Option<SecretString>,
    cookie_secure: bool,
}

impl ApiState {
    #[must_use]
    pub fn new(authority: Arc<Authority>) -> Self {
        Self {
            authority,
            federation_secret: None,
            cookie_secure: true,
        }
    }

    /// Shared secret the federation layer presents in `x-ics-federation-key`.
    /// Without one, federated logins over HTTP are refused.
    #[must_use]
    pub fn with_federation_secret(mut self, secret: Option<SecretString>) -> Self {
        self.federation_secret = secret;
        self
    }

    #[must_use]
    pub fn with_cookie_secure(mut self, secure: bool) -> Self {
        self.cookie_secure = secure;
        self
    }

    #[must_use]
    pub fn authority(&self) -> &Authority {
        &self.authority
    }

    #[must_use]
    pub fn federation_secret(&self) -> Option<&SecretString> {
        self.federation_secret.as_ref()
    }

    #[must_use]
    pub fn cookie_secure(&self) -> bool {
        self.cookie_secure
    }
}

use crate::{
    api::{self, ApiState},
    authority::{Authority, AuthorityConfig, SigningKeys, SystemClock, token::decode_seed},
    cli::telemetry,
    totp::SeedCipher,
};
use anyhow::{Context, Result, anyhow};
use ed25519_dalek::VerifyingKey;
use secrecy::{ExposeSecret, SecretString};
use std::{sync::Arc, time::Duration};
use tokio::signal;
use tracing::{info, warn};

#[derive(Debug)]
pub struct Args {
    pub port: u16,
    pub config: AuthorityConfig,
    pub signing_seed: Option<SecretString>,
    pub retired_keys: Vec<String>,
    pub mfa_seed_key: Option<SecretString>,
    pub federation_secret: Option<SecretString>,
    pub cookie_secure: bool,
    pub janitor_interval: Duration,
}

/// Execute the server action.
/// # Errors
/// Returns an error if key material is malformed or the server fails to start.
pub async fn execute(args: Args) -> Result<()> {
    let keys = signing_keys(args.signing_seed.as_ref(), &args.retired_keys)?;
    let seed_cipher = match &args.mfa_seed_key {
        Some(key) => SeedCipher::new(
            decode_seed(key.expose_secret()).context("invalid --mfa-seed-key")?,
        ),
        None => {
            warn!("No MFA seed key configured; TOTP enrollments will not survive a restart");
            SeedCipher::generate()?
        }
    };
    if args.federation_secret.is_none() {
        info!("No federation shared secret configured; federated logins over HTTP are refused");
    }

    let authority = Arc::new(
        Authority::new(args.config, keys, seed_cipher, Arc::new(SystemClock))
            .context("failed to assemble the session authority")?,
    );
    let janitor = authority.clone().spawn_janitor(args.janitor_interval);

    let state = ApiState::new(authority)
        .with_federation_secret(args.federation_secret)
        .with_cookie_secure(args.cookie_secure);

    let result = api::serve(args.port, Arc::new(state), shutdown_signal()).await;

    janitor.abort();
    telemetry::shutdown_tracer();
    result
}

fn signing_keys(seed: Option<&SecretString>, retired: &[String]) -> Result<SigningKeys> {
    let mut keys = match seed {
        Some(seed) => SigningKeys::from_seed(
            &decode_seed(seed.expose_secret()).context("invalid --token-signing-seed")?,
        ),
        None => {
            warn!("No token signing seed configured; access tokens will not survive a restart");
            SigningKeys::generate()?
        }
    };
    for encoded in retired {
        let bytes = decode_seed(encoded).context("invalid --token-retired-key")?;
        let verifying_key = VerifyingKey::from_bytes(&bytes)
            .map_err(|err| anyhow!("invalid --token-retired-key: {err}"))?;
        keys = keys.with_retired(verifying_key);
    }
    info!(kid = keys.active_kid(), "Access token signing key loaded");
    Ok(keys)
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = signal::ctrl_c().await {
            warn!("Failed to listen for Ctrl+C: {err}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(err) => {
                warn!("Failed to listen for SIGTERM: {err}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }
}

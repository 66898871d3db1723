//! Map validated CLI arguments to an action.
//!
//! The authority configuration is assembled and validated here so a bad flag
//! fails before the server binds its port.

use crate::{
    authority::{AuthorityConfig, OperationClass, StepUpPolicy},
    cli::{
        actions::{Action, server::Args},
        commands::{
            ARG_BACKEND_TIMEOUT_MS, ARG_JANITOR_INTERVAL_SECONDS, ARG_PORT, limits, mfa, required,
            tokens, trust,
        },
    },
};
use anyhow::{Context, Result};
use std::time::Duration;

/// Map validated CLI matches to a server action.
///
/// # Errors
/// Returns an error if an argument is malformed or the resulting configuration is invalid.
pub fn handler(matches: &clap::ArgMatches) -> Result<Action> {
    let tokens = tokens::Options::parse(matches)?;
    let mfa = mfa::Options::parse(matches)?;
    let limits = limits::Options::parse(matches)?;
    let trust = trust::Options::parse(matches)?;

    let mut config = AuthorityConfig::new()
        .with_token_issuer(tokens.issuer)
        .with_access_token_ttl_seconds(tokens.access_token_ttl_seconds)
        .with_refresh_token_ttl_seconds(tokens.refresh_token_ttl_seconds)
        .with_session_max_lifetime_seconds(tokens.session_max_lifetime_seconds)
        .with_refresh_retry_window_seconds(tokens.refresh_retry_window_seconds)
        .with_mfa_code_step_seconds(mfa.code_step_seconds)
        .with_mfa_code_skew_steps(mfa.code_skew_steps)
        .with_mfa_challenge_ttl_seconds(mfa.challenge_ttl_seconds)
        .with_rate_limit(OperationClass::Login, limits.login)
        .with_rate_limit(OperationClass::Refresh, limits.refresh)
        .with_rate_limit(OperationClass::MfaAttempt, limits.mfa)
        .with_backoff_ms(limits.backoff_base_ms, limits.backoff_max_ms)
        .with_lockout(limits.lockout_threshold, limits.lockout_seconds)
        .with_trusted_applications(trust.trusted_applications)
        .with_trusted_federation_issuers(trust.trusted_federation_issuers)
        .with_sso_cache_ttl_ms(trust.sso_cache_ttl_ms)
        .with_backend_timeout_ms(required(matches, ARG_BACKEND_TIMEOUT_MS)?);

    if !mfa.step_up_rules.is_empty() {
        let policy = mfa
            .step_up_rules
            .iter()
            .try_fold(StepUpPolicy::new(), |policy, rule| {
                policy
                    .with_rule(rule)
                    .with_context(|| format!("invalid --{}: {rule}", mfa::ARG_STEP_UP_POLICY))
            })?;
        config = config.with_step_up_policy(policy);
    }
    config.validate().context("invalid authority configuration")?;

    Ok(Action::Server(Args {
        port: required(matches, ARG_PORT)?,
        config,
        signing_seed: tokens.signing_seed,
        retired_keys: tokens.retired_keys,
        mfa_seed_key: mfa.seed_key,
        federation_secret: trust.federation_secret,
        cookie_secure: trust.cookie_secure,
        janitor_interval: Duration::from_secs(required(matches, ARG_JANITOR_INTERVAL_SECONDS)?),
    }))
}

use anyhow::Result;
use clap::{Arg, ArgAction, ArgMatches, Command};
use secrecy::SecretString;

use super::{required, secret};

pub const ARG_TRUSTED_APPLICATION: &str = "trusted-application";
pub const ARG_TRUSTED_FEDERATION_ISSUER: &str = "trusted-federation-issuer";
pub const ARG_FEDERATION_SHARED_SECRET: &str = "federation-shared-secret";
pub const ARG_SSO_CACHE_TTL_MS: &str = "sso-cache-ttl-ms";
pub const ARG_SESSION_COOKIE_INSECURE: &str = "session-cookie-insecure";

#[derive(Debug)]
pub struct Options {
    pub trusted_applications: Vec<String>,
    pub trusted_federation_issuers: Vec<String>,
    pub federation_secret: Option<SecretString>,
    pub sso_cache_ttl_ms: i64,
    pub cookie_secure: bool,
}

impl Options {
    /// # Errors
    /// Returns an error if a defaulted argument is missing.
    pub fn parse(matches: &ArgMatches) -> Result<Self> {
        let many = |id: &str| -> Vec<String> {
            matches
                .get_many::<String>(id)
                .map(|values| {
                    values
                        .map(|value| value.trim().to_string())
                        .filter(|value| !value.is_empty())
                        .collect()
                })
                .unwrap_or_default()
        };
        Ok(Self {
            trusted_applications: many(ARG_TRUSTED_APPLICATION),
            trusted_federation_issuers: many(ARG_TRUSTED_FEDERATION_ISSUER),
            federation_secret: secret(matches, ARG_FEDERATION_SHARED_SECRET),
            sso_cache_ttl_ms: required(matches, ARG_SSO_CACHE_TTL_MS)?,
            cookie_secure: !matches.get_flag(ARG_SESSION_COOKIE_INSECURE),
        })
    }
}

#[must_use]
pub fn with_args(command: Command) -> Command {
    command
        .arg(
            Arg::new(ARG_TRUSTED_APPLICATION)
                .long(ARG_TRUSTED_APPLICATION)
                .help("Application id allowed to observe sessions (repeatable; none = any)")
                .env("ICS_TRUSTED_APPLICATION")
                .value_delimiter(',')
                .action(ArgAction::Append),
        )
        .arg(
            Arg::new(ARG_TRUSTED_FEDERATION_ISSUER)
                .long(ARG_TRUSTED_FEDERATION_ISSUER)
                .help("Federation issuer accepted for login (repeatable; none = any)")
                .env("ICS_TRUSTED_FEDERATION_ISSUER")
                .value_delimiter(',')
                .action(ArgAction::Append),
        )
        .arg(
            Arg::new(ARG_FEDERATION_SHARED_SECRET)
                .long(ARG_FEDERATION_SHARED_SECRET)
                .help("Secret the federation layer sends in x-ics-federation-key")
                .long_help(
                    "Secret the federation layer sends in x-ics-federation-key. Federated logins over HTTP are refused when unset.",
                )
                .env("ICS_FEDERATION_SHARED_SECRET")
                .hide_env_values(true),
        )
        .arg(
            Arg::new(ARG_SSO_CACHE_TTL_MS)
                .long(ARG_SSO_CACHE_TTL_MS)
                .help("Session snapshot cache TTL for SSO checks in milliseconds (0 = off)")
                .env("ICS_SSO_CACHE_TTL_MS")
                .default_value("0")
                .value_parser(clap::value_parser!(i64).range(0..=86_400_000)),
        )
        .arg(
            Arg::new(ARG_SESSION_COOKIE_INSECURE)
                .long(ARG_SESSION_COOKIE_INSECURE)
                .help("Omit the Secure attribute on the session cookie (plain HTTP development)")
                .env("ICS_SESSION_COOKIE_INSECURE")
                .action(ArgAction::SetTrue),
        )
}

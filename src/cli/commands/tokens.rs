use anyhow::Result;
use clap::{Arg, ArgAction, ArgMatches, Command};
use secrecy::SecretString;

use super::{required, secret};

pub const ARG_TOKEN_ISSUER: &str = "token-issuer";
pub const ARG_TOKEN_SIGNING_SEED: &str = "token-signing-seed";
pub const ARG_TOKEN_RETIRED_KEY: &str = "token-retired-key";
pub const ARG_ACCESS_TOKEN_TTL_SECONDS: &str = "access-token-ttl-seconds";
pub const ARG_REFRESH_TOKEN_TTL_SECONDS: &str = "refresh-token-ttl-seconds";
pub const ARG_SESSION_MAX_LIFETIME_SECONDS: &str = "session-max-lifetime-seconds";
pub const ARG_REFRESH_RETRY_WINDOW_SECONDS: &str = "refresh-retry-window-seconds";

// Ten years.
const MAX_SECONDS: i64 = 315_360_000;

#[derive(Debug)]
pub struct Options {
    pub issuer: String,
    pub signing_seed: Option<SecretString>,
    pub retired_keys: Vec<String>,
    pub access_token_ttl_seconds: i64,
    pub refresh_token_ttl_seconds: i64,
    pub session_max_lifetime_seconds: i64,
    pub refresh_retry_window_seconds: i64,
}

impl Options {
    /// # Errors
    /// Returns an error if a defaulted argument is missing.
    pub fn parse(matches: &ArgMatches) -> Result<Self> {
        Ok(Self {
            issuer: required(matches, ARG_TOKEN_ISSUER)?,
            signing_seed: secret(matches, ARG_TOKEN_SIGNING_SEED),
            retired_keys: matches
                .get_many::<String>(ARG_TOKEN_RETIRED_KEY)
                .map(|keys| keys.cloned().collect())
                .unwrap_or_default(),
            access_token_ttl_seconds: required(matches, ARG_ACCESS_TOKEN_TTL_SECONDS)?,
            refresh_token_ttl_seconds: required(matches, ARG_REFRESH_TOKEN_TTL_SECONDS)?,
            session_max_lifetime_seconds: required(matches, ARG_SESSION_MAX_LIFETIME_SECONDS)?,
            refresh_retry_window_seconds: required(matches, ARG_REFRESH_RETRY_WINDOW_SECONDS)?,
        })
    }
}

#[must_use]
pub fn with_args(command: Command) -> Command {
    command
        .arg(
            Arg::new(ARG_TOKEN_ISSUER)
                .long(ARG_TOKEN_ISSUER)
                .help("Issuer claim placed in access tokens")
                .env("ICS_TOKEN_ISSUER")
                .default_value("ics"),
        )
        .arg(
            Arg::new(ARG_TOKEN_SIGNING_SEED)
                .long(ARG_TOKEN_SIGNING_SEED)
                .help("Base64 Ed25519 seed (32 bytes) for signing access tokens")
                .long_help(
                    "Base64 Ed25519 seed (32 bytes) for signing access tokens. When absent a key is generated per process and tokens do not survive a restart.",
                )
                .env("ICS_TOKEN_SIGNING_SEED")
                .hide_env_values(true),
        )
        .arg(
            Arg::new(ARG_TOKEN_RETIRED_KEY)
                .long(ARG_TOKEN_RETIRED_KEY)
                .help("Base64 Ed25519 public key still accepted for verification (repeatable)")
                .env("ICS_TOKEN_RETIRED_KEY")
                .value_delimiter(',')
                .action(ArgAction::Append),
        )
        .arg(
            Arg::new(ARG_ACCESS_TOKEN_TTL_SECONDS)
                .long(ARG_ACCESS_TOKEN_TTL_SECONDS)
                .help("Access token lifetime in seconds")
                .env("ICS_ACCESS_TOKEN_TTL_SECONDS")
                .default_value("3600")
                .value_parser(clap::value_parser!(i64).range(1..=MAX_SECONDS)),
        )
        .arg(
            Arg::new(ARG_REFRESH_TOKEN_TTL_SECONDS)
                .long(ARG_REFRESH_TOKEN_TTL_SECONDS)
                .help("Refresh token lifetime and sliding session window in seconds")
                .env("ICS_REFRESH_TOKEN_TTL_SECONDS")
                .default_value("604800")
                .value_parser(clap::value_parser!(i64).range(1..=MAX_SECONDS)),
        )
        .arg(
            Arg::new(ARG_SESSION_MAX_LIFETIME_SECONDS)
                .long(ARG_SESSION_MAX_LIFETIME_SECONDS)
                .help("Absolute session lifetime in seconds")
                .env("ICS_SESSION_MAX_LIFETIME_SECONDS")
                .default_value("2592000")
                .value_parser(clap::value_parser!(i64).range(1..=MAX_SECONDS)),
        )
        .arg(
            Arg::new(ARG_REFRESH_RETRY_WINDOW_SECONDS)
                .long(ARG_REFRESH_RETRY_WINDOW_SECONDS)
                .help("Window in which an idempotent refresh retry returns the same pair")
                .env("ICS_REFRESH_RETRY_WINDOW_SECONDS")
                .default_value("30")
                .value_parser(clap::value_parser!(i64).range(1..=MAX_SECONDS)),
        )
}

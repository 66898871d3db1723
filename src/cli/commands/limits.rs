use anyhow::{Context, Result};
use clap::{Arg, ArgMatches, Command};

use super::required;
use crate::authority::RateLimitPolicy;

pub const ARG_LOGIN_RATE_LIMIT: &str = "login-rate-limit";
pub const ARG_REFRESH_RATE_LIMIT: &str = "refresh-rate-limit";
pub const ARG_MFA_RATE_LIMIT: &str = "mfa-rate-limit";
pub const ARG_BACKOFF_BASE_MS: &str = "backoff-base-ms";
pub const ARG_BACKOFF_MAX_MS: &str = "backoff-max-ms";
pub const ARG_LOCKOUT_THRESHOLD: &str = "lockout-threshold";
pub const ARG_LOCKOUT_SECONDS: &str = "lockout-seconds";

#[derive(Debug)]
pub struct Options {
    pub login: RateLimitPolicy,
    pub refresh: RateLimitPolicy,
    pub mfa: RateLimitPolicy,
    pub backoff_base_ms: u64,
    pub backoff_max_ms: u64,
    pub lockout_threshold: u32,
    pub lockout_seconds: i64,
}

impl Options {
    /// # Errors
    /// Returns an error if a rate limit is not `burst/window_seconds`.
    pub fn parse(matches: &ArgMatches) -> Result<Self> {
        let policy = |id: &str| -> Result<RateLimitPolicy> {
            let value: String = required(matches, id)?;
            RateLimitPolicy::parse(&value).with_context(|| format!("invalid --{id}"))
        };
        Ok(Self {
            login: policy(ARG_LOGIN_RATE_LIMIT)?,
            refresh: policy(ARG_REFRESH_RATE_LIMIT)?,
            mfa: policy(ARG_MFA_RATE_LIMIT)?,
            backoff_base_ms: required(matches, ARG_BACKOFF_BASE_MS)?,
            backoff_max_ms: required(matches, ARG_BACKOFF_MAX_MS)?,
            lockout_threshold: required(matches, ARG_LOCKOUT_THRESHOLD)?,
            lockout_seconds: required(matches, ARG_LOCKOUT_SECONDS)?,
        })
    }
}

#[must_use]
pub fn with_args(command: Command) -> Command {
    command
        .arg(
            Arg::new(ARG_LOGIN_RATE_LIMIT)
                .long(ARG_LOGIN_RATE_LIMIT)
                .help("Login attempts per key as burst/window_seconds")
                .env("ICS_LOGIN_RATE_LIMIT")
                .default_value("10/60"),
        )
        .arg(
            Arg::new(ARG_REFRESH_RATE_LIMIT)
                .long(ARG_REFRESH_RATE_LIMIT)
                .help("Refresh attempts per key as burst/window_seconds")
                .env("ICS_REFRESH_RATE_LIMIT")
                .default_value("30/60"),
        )
        .arg(
            Arg::new(ARG_MFA_RATE_LIMIT)
                .long(ARG_MFA_RATE_LIMIT)
                .help("MFA code attempts per principal as burst/window_seconds")
                .env("ICS_MFA_RATE_LIMIT")
                .default_value("5/60"),
        )
        .arg(
            Arg::new(ARG_BACKOFF_BASE_MS)
                .long(ARG_BACKOFF_BASE_MS)
                .help("First retry hint after a rate-limit violation, in milliseconds")
                .env("ICS_BACKOFF_BASE_MS")
                .default_value("1000")
                .value_parser(clap::value_parser!(u64)),
        )
        .arg(
            Arg::new(ARG_BACKOFF_MAX_MS)
                .long(ARG_BACKOFF_MAX_MS)
                .help("Cap on the retry hint, in milliseconds")
                .env("ICS_BACKOFF_MAX_MS")
                .default_value("60000")
                .value_parser(clap::value_parser!(u64)),
        )
        .arg(
            Arg::new(ARG_LOCKOUT_THRESHOLD)
                .long(ARG_LOCKOUT_THRESHOLD)
                .help("Consecutive failed logins before an identity is locked")
                .env("ICS_LOCKOUT_THRESHOLD")
                .default_value("5")
                .value_parser(clap::value_parser!(u32)),
        )
        .arg(
            Arg::new(ARG_LOCKOUT_SECONDS)
                .long(ARG_LOCKOUT_SECONDS)
                .help("Lockout duration in seconds")
                .env("ICS_LOCKOUT_SECONDS")
                .default_value("900")
                .value_parser(clap::value_parser!(i64).range(1..=31_536_000)),
        )
}

use anyhow::Result;
use clap::{Arg, ArgAction, ArgMatches, Command};
use secrecy::SecretString;

use super::{required, secret};

pub const ARG_MFA_CODE_STEP_SECONDS: &str = "mfa-code-step-seconds";
pub const ARG_MFA_CODE_SKEW_STEPS: &str = "mfa-code-skew-steps";
pub const ARG_MFA_CHALLENGE_TTL_SECONDS: &str = "mfa-challenge-ttl-seconds";
pub const ARG_MFA_SEED_KEY: &str = "mfa-seed-key";
pub const ARG_STEP_UP_POLICY: &str = "step-up-policy";

#[derive(Debug)]
pub struct Options {
    pub code_step_seconds: u64,
    pub code_skew_steps: u8,
    pub challenge_ttl_seconds: i64,
    pub seed_key: Option<SecretString>,
    /// `operation=level` rules; empty keeps the built-in policy.
    pub step_up_rules: Vec<String>,
}

impl Options {
    /// # Errors
    /// Returns an error if a defaulted argument is missing.
    pub fn parse(matches: &ArgMatches) -> Result<Self> {
        Ok(Self {
            code_step_seconds: required(matches, ARG_MFA_CODE_STEP_SECONDS)?,
            code_skew_steps: required(matches, ARG_MFA_CODE_SKEW_STEPS)?,
            challenge_ttl_seconds: required(matches, ARG_MFA_CHALLENGE_TTL_SECONDS)?,
            seed_key: secret(matches, ARG_MFA_SEED_KEY),
            step_up_rules: matches
                .get_many::<String>(ARG_STEP_UP_POLICY)
                .map(|rules| rules.cloned().collect())
                .unwrap_or_default(),
        })
    }
}

#[must_use]
pub fn with_args(command: Command) -> Command {
    command
        .arg(
            Arg::new(ARG_MFA_CODE_STEP_SECONDS)
                .long(ARG_MFA_CODE_STEP_SECONDS)
                .help("TOTP time step in seconds")
                .env("ICS_MFA_CODE_STEP_SECONDS")
                .default_value("30")
                .value_parser(clap::value_parser!(u64)),
        )
        .arg(
            Arg::new(ARG_MFA_CODE_SKEW_STEPS)
                .long(ARG_MFA_CODE_SKEW_STEPS)
                .help("Accepted TOTP clock drift in steps (0-2)")
                .env("ICS_MFA_CODE_SKEW_STEPS")
                .default_value("1")
                .value_parser(clap::value_parser!(u8).range(0..=2)),
        )
        .arg(
            Arg::new(ARG_MFA_CHALLENGE_TTL_SECONDS)
                .long(ARG_MFA_CHALLENGE_TTL_SECONDS)
                .help("Lifetime of a step-up challenge in seconds")
                .env("ICS_MFA_CHALLENGE_TTL_SECONDS")
                .default_value("300")
                .value_parser(clap::value_parser!(i64).range(1..=86_400)),
        )
        .arg(
            Arg::new(ARG_MFA_SEED_KEY)
                .long(ARG_MFA_SEED_KEY)
                .help("Base64 32-byte key encrypting TOTP seeds at rest")
                .env("ICS_MFA_SEED_KEY")
                .hide_env_values(true),
        )
        .arg(
            Arg::new(ARG_STEP_UP_POLICY)
                .long(ARG_STEP_UP_POLICY)
                .help("Minimum assurance per operation as operation=level (repeatable)")
                .long_help(
                    "Minimum assurance per operation as operation=level, e.g. change_password=MFA_VERIFIED. Replaces the built-in policy when given.",
                )
                .env("ICS_STEP_UP_POLICY")
                .value_delimiter(',')
                .action(ArgAction::Append),
        )
}

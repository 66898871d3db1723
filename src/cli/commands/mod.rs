pub mod limits;
pub mod logging;
pub mod mfa;
pub mod tokens;
pub mod trust;

use anyhow::{Result, anyhow};
use clap::{
    Arg, ArgMatches, ColorChoice, Command,
    builder::styling::{AnsiColor, Effects, Styles},
};
use secrecy::SecretString;

pub const ARG_PORT: &str = "port";
pub const ARG_BACKEND_TIMEOUT_MS: &str = "backend-timeout-ms";
pub const ARG_JANITOR_INTERVAL_SECONDS: &str = "janitor-interval-seconds";

/// Read an argument that always carries a value (it has a default).
pub(crate) fn required<T>(matches: &ArgMatches, id: &str) -> Result<T>
where
    T: Clone + Send + Sync + 'static,
{
    matches
        .get_one::<T>(id)
        .cloned()
        .ok_or_else(|| anyhow!("missing required argument: --{id}"))
}

pub(crate) fn secret(matches: &ArgMatches, id: &str) -> Option<SecretString> {
    matches
        .get_one::<String>(id)
        .map(|value| value.trim())
        .filter(|value| !value.is_empty())
        .map(SecretString::from)
}

#[must_use]
pub fn new() -> Command {
    let styles = Styles::styled()
        .header(AnsiColor::Yellow.on_default() | Effects::BOLD)
        .usage(AnsiColor::Green.on_default() | Effects::BOLD)
        .literal(AnsiColor::Blue.on_default() | Effects::BOLD)
        .placeholder(AnsiColor::Green.on_default());

    let long_version: &'static str = Box::leak(
        format!("{} - {}", env!("CARGO_PKG_VERSION"), crate::GIT_COMMIT_HASH).into_boxed_str(),
    );

    let command = Command::new("ics-session")
        .about("Session and token lifecycle authority")
        .version(env!("CARGO_PKG_VERSION"))
        .long_version(long_version)
        .color(ColorChoice::Auto)
        .styles(styles)
        .arg(
            Arg::new(ARG_PORT)
                .short('p')
                .long(ARG_PORT)
                .help("Port to listen on")
                .default_value("8080")
                .env("ICS_PORT")
                .value_parser(clap::value_parser!(u16)),
        )
        .arg(
            Arg::new(ARG_BACKEND_TIMEOUT_MS)
                .long(ARG_BACKEND_TIMEOUT_MS)
                .help("Upper bound for a single authority operation in milliseconds")
                .env("ICS_BACKEND_TIMEOUT_MS")
                .default_value("2000")
                .value_parser(clap::value_parser!(u64)),
        )
        .arg(
            Arg::new(ARG_JANITOR_INTERVAL_SECONDS)
                .long(ARG_JANITOR_INTERVAL_SECONDS)
                .help("Interval between purges of expired sessions, challenges and limiter state")
                .env("ICS_JANITOR_INTERVAL_SECONDS")
                .default_value("60")
                .value_parser(clap::value_parser!(u64).range(1..)),
        );

    let command = tokens::with_args(command);
    let command = mfa::with_args(command);
    let command = limits::with_args(command);
    let command = trust::with_args(command);
    logging::with_args(command)
}

#[cfg(test)]
mod tests {
    use super::*;

    const ENV_KEYS: [&str; 8] = [
        "ICS_PORT",
        "ICS_LOG_LEVEL",
        "ICS_TOKEN_ISSUER",
        "ICS_TOKEN_SIGNING_SEED",
        "ICS_TRUSTED_APPLICATION",
        "ICS_LOGIN_RATE_LIMIT",
        "ICS_STEP_UP_POLICY",
        "ICS_SESSION_COOKIE_INSECURE",
    ];

    fn cleared() -> Vec<(&'static str, Option<&'static str>)> {
        ENV_KEYS.iter().map(|key| (*key, None)).collect()
    }

    #[test]
    fn test_new() {
        let command = new();

        assert_eq!(command.get_name(), "ics-session");
        assert_eq!(
            command.get_about().map(ToString::to_string),
            Some("Session and token lifecycle authority".to_string())
        );
        assert_eq!(
            command.get_version().map(ToString::to_string),
            Some(env!("CARGO_PKG_VERSION").to_string())
        );
    }

    #[test]
    fn test_defaults() {
        temp_env::with_vars(cleared(), || {
            let matches = new().get_matches_from(vec!["ics-session"]);
            assert_eq!(matches.get_one::<u16>(ARG_PORT).copied(), Some(8080));
            assert_eq!(
                matches
                    .get_one::<i64>(tokens::ARG_ACCESS_TOKEN_TTL_SECONDS)
                    .copied(),
                Some(3600)
            );
            assert_eq!(
                matches.get_one::<String>(limits::ARG_LOGIN_RATE_LIMIT).cloned(),
                Some("10/60".to_string())
            );
            assert!(secret(&matches, tokens::ARG_TOKEN_SIGNING_SEED).is_none());
            assert!(!matches.get_flag(trust::ARG_SESSION_COOKIE_INSECURE));
        });
    }

    #[test]
    fn test_check_args() {
        temp_env::with_vars(cleared(), || {
            let matches = new().get_matches_from(vec![
                "ics-session",
                "--port",
                "9090",
                "--trusted-application",
                "portal",
                "--trusted-application",
                "billing",
                "--step-up-policy",
                "export_data=MFA_VERIFIED",
                "--mfa-code-skew-steps",
                "2",
            ]);
            assert_eq!(matches.get_one::<u16>(ARG_PORT).copied(), Some(9090));
            let apps: Vec<&String> = matches
                .get_many::<String>(trust::ARG_TRUSTED_APPLICATION)
                .map(|values| values.collect())
                .unwrap_or_default();
            assert_eq!(apps, ["portal", "billing"]);
            assert_eq!(
                matches.get_one::<u8>(mfa::ARG_MFA_CODE_SKEW_STEPS).copied(),
                Some(2)
            );
        });
    }

    #[test]
    fn test_skew_out_of_range() {
        let result = new().try_get_matches_from(vec!["ics-session", "--mfa-code-skew-steps", "3"]);
        assert!(result.is_err());
    }

    #[test]
    fn test_check_env() {
        temp_env::with_vars(
            [
                ("ICS_PORT", Some("443")),
                ("ICS_LOG_LEVEL", Some("info")),
                ("ICS_TOKEN_ISSUER", Some("https://sso.example")),
                ("ICS_TOKEN_SIGNING_SEED", Some("c2VlZA==")),
                ("ICS_TRUSTED_APPLICATION", Some("portal,billing")),
                ("ICS_LOGIN_RATE_LIMIT", Some("3/10")),
                ("ICS_STEP_UP_POLICY", None),
                ("ICS_SESSION_COOKIE_INSECURE", Some("true")),
            ],
            || {
                let matches = new().get_matches_from(vec!["ics-session"]);
                assert_eq!(matches.get_one::<u16>(ARG_PORT).copied(), Some(443));
                assert_eq!(
                    matches.get_one::<u8>(logging::ARG_VERBOSITY).copied(),
                    Some(2)
                );
                assert_eq!(
                    matches.get_one::<String>(tokens::ARG_TOKEN_ISSUER).cloned(),
                    Some("https://sso.example".to_string())
                );
                assert!(secret(&matches, tokens::ARG_TOKEN_SIGNING_SEED).is_some());
                assert_eq!(
                    matches
                        .get_many::<String>(trust::ARG_TRUSTED_APPLICATION)
                        .map(Iterator::count),
                    Some(2)
                );
                assert!(matches.get_flag(trust::ARG_SESSION_COOKIE_INSECURE));
            },
        );
    }

    #[test]
    fn test_check_log_level_env() {
        let levels = ["error", "warn", "info", "debug", "trace"];
        for (index, &level) in levels.iter().enumerate() {
            temp_env::with_vars([("ICS_LOG_LEVEL", Some(level))], || {
                let matches = new().get_matches_from(vec!["ics-session"]);
                assert_eq!(
                    matches.get_one::<u8>(logging::ARG_VERBOSITY).copied(),
                    u8::try_from(index).ok()
                );
            });
        }
    }
}

//! Authority configuration: token lifetimes, MFA windows, rate limits and trust domain.

use anyhow::{Result, anyhow};
use chrono::Duration;
use std::collections::{BTreeMap, BTreeSet};

use super::types::{AssuranceLevel, OperationClass};

const DEFAULT_ACCESS_TOKEN_TTL_SECONDS: i64 = 60 * 60;
const DEFAULT_REFRESH_TOKEN_TTL_SECONDS: i64 = 7 * 24 * 60 * 60;
const DEFAULT_SESSION_MAX_LIFETIME_SECONDS: i64 = 30 * 24 * 60 * 60;
const DEFAULT_REFRESH_RETRY_WINDOW_SECONDS: i64 = 30;
const DEFAULT_MFA_CODE_STEP_SECONDS: u64 = 30;
const DEFAULT_MFA_CODE_SKEW_STEPS: u8 = 1;
const DEFAULT_MFA_CHALLENGE_TTL_SECONDS: i64 = 5 * 60;
const DEFAULT_LOCKOUT_THRESHOLD: u32 = 5;
const DEFAULT_LOCKOUT_SECONDS: i64 = 15 * 60;
const DEFAULT_BACKOFF_BASE_MS: u64 = 1_000;
const DEFAULT_BACKOFF_MAX_MS: u64 = 60_000;
const DEFAULT_BACKEND_TIMEOUT_MS: u64 = 2_000;
const DEFAULT_TOKEN_ISSUER: &str = "ics";

/// Token-bucket parameters for one operation class.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct RateLimitPolicy {
    burst: u32,
    window: Duration,
}

impl RateLimitPolicy {
    /// # Errors
    /// Returns an error if the burst or window is zero.
    pub fn new(burst: u32, window_seconds: i64) -> Result<Self> {
        if burst == 0 || window_seconds <= 0 {
            return Err(anyhow!("rate limit burst and window must be positive"));
        }
        let window = Duration::try_seconds(window_seconds)
            .ok_or_else(|| anyhow!("rate limit window out of range: {window_seconds}"))?;
        Ok(Self { burst, window })
    }

    /// Parse `burst/window_seconds`, e.g. `10/60`.
    ///
    /// # Errors
    /// Returns an error for malformed or non-positive values.
    pub fn parse(value: &str) -> Result<Self> {
        let (burst, window) = value
            .split_once('/')
            .ok_or_else(|| anyhow!("expected <burst>/<window_seconds>, got {value}"))?;
        let burst = burst
            .trim()
            .parse::<u32>()
            .map_err(|_| anyhow!("invalid burst in rate limit: {value}"))?;
        let window = window
            .trim()
            .parse::<i64>()
            .map_err(|_| anyhow!("invalid window in rate limit: {value}"))?;
        Self::new(burst, window)
    }

    #[must_use]
    pub fn burst(&self) -> u32 {
        self.burst
    }

    #[must_use]
    pub fn window(&self) -> Duration {
        self.window
    }
}

/// Minimum assurance per operation class; unlisted operations need `BASIC`.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct StepUpPolicy {
    minimums: BTreeMap<String, AssuranceLevel>,
}

impl StepUpPolicy {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn require(mut self, operation: &str, level: AssuranceLevel) -> Self {
        self.minimums
            .insert(operation.trim().to_ascii_lowercase(), level);
        self
    }

    /// Parse `operation=level`, e.g. `delete_account=mfa_verified`.
    ///
    /// # Errors
    /// Returns an error for malformed pairs or unknown levels.
    pub fn with_rule(self, rule: &str) -> Result<Self> {
        let (operation, level) = rule
            .split_once('=')
            .ok_or_else(|| anyhow!("expected <operation>=<level>, got {rule}"))?;
        if operation.trim().is_empty() {
            return Err(anyhow!("empty operation in step-up rule: {rule}"));
        }
        let level = AssuranceLevel::parse(level)
            .ok_or_else(|| anyhow!("unknown assurance level in step-up rule: {rule}"))?;
        Ok(self.require(operation, level))
    }

    #[must_use]
    pub fn minimum_for(&self, operation: &str) -> AssuranceLevel {
        self.minimums
            .get(&operation.trim().to_ascii_lowercase())
            .copied()
            .unwrap_or(AssuranceLevel::Basic)
    }
}

#[derive(Clone, Debug)]
pub struct AuthorityConfig {
    token_issuer: String,
    access_token_ttl: Duration,
    refresh_token_ttl: Duration,
    session_max_lifetime: Duration,
    refresh_retry_window: Duration,
    mfa_code_step_seconds: u64,
    mfa_code_skew_steps: u8,
    mfa_challenge_ttl: Duration,
    step_up_policy: StepUpPolicy,
    login_rate_limit: RateLimitPolicy,
    refresh_rate_limit: RateLimitPolicy,
    mfa_rate_limit: RateLimitPolicy,
    backoff_base_ms: u64,
    backoff_max_ms: u64,
    lockout_threshold: u32,
    lockout_duration: Duration,
    trusted_applications: BTreeSet<String>,
    trusted_federation_issuers: BTreeSet<String>,
    sso_cache_ttl: Duration,
    backend_timeout: std::time::Duration,
}

impl Default for AuthorityConfig {
    fn default() -> Self {
        Self::new()
    }
}

impl AuthorityConfig {
    #[must_use]
    pub fn new() -> Self {
        Self {
            token_issuer: DEFAULT_TOKEN_ISSUER.to_string(),
            access_token_ttl: Duration::seconds(DEFAULT_ACCESS_TOKEN_TTL_SECONDS),
            refresh_token_ttl: Duration::seconds(DEFAULT_REFRESH_TOKEN_TTL_SECONDS),
            session_max_lifetime: Duration::seconds(DEFAULT_SESSION_MAX_LIFETIME_SECONDS),
            refresh_retry_window: Duration::seconds(DEFAULT_REFRESH_RETRY_WINDOW_SECONDS),
            mfa_code_step_seconds: DEFAULT_MFA_CODE_STEP_SECONDS,
            mfa_code_skew_steps: DEFAULT_MFA_CODE_SKEW_STEPS,
            mfa_challenge_ttl: Duration::seconds(DEFAULT_MFA_CHALLENGE_TTL_SECONDS),
            step_up_policy: StepUpPolicy::new()
                .require("change_password", AssuranceLevel::MfaVerified)
                .require("delete_account", AssuranceLevel::MfaVerified),
            login_rate_limit: RateLimitPolicy {
                burst: 10,
                window: Duration::seconds(60),
            },
            refresh_rate_limit: RateLimitPolicy {
                burst: 30,
                window: Duration::seconds(60),
            },
            mfa_rate_limit: RateLimitPolicy {
                burst: 5,
                window: Duration::seconds(60),
            },
            backoff_base_ms: DEFAULT_BACKOFF_BASE_MS,
            backoff_max_ms: DEFAULT_BACKOFF_MAX_MS,
            lockout_threshold: DEFAULT_LOCKOUT_THRESHOLD,
            lockout_duration: Duration::seconds(DEFAULT_LOCKOUT_SECONDS),
            trusted_applications: BTreeSet::new(),
            trusted_federation_issuers: BTreeSet::new(),
            sso_cache_ttl: Duration::zero(),
            backend_timeout: std::time::Duration::from_millis(DEFAULT_BACKEND_TIMEOUT_MS),
        }
    }

    /// Reject configurations the authority cannot honor.
    ///
    /// # Errors
    /// Returns an error describing the first invalid setting.
    pub fn validate(&self) -> Result<()> {
        if self.access_token_ttl <= Duration::zero() {
            return Err(anyhow!("access token TTL must be positive"));
        }
        if self.refresh_token_ttl <= Duration::zero() {
            return Err(anyhow!("refresh token TTL must be positive"));
        }
        if self.session_max_lifetime < self.refresh_token_ttl {
            return Err(anyhow!(
                "session max lifetime must be at least the refresh token TTL"
            ));
        }
        if self.mfa_code_step_seconds == 0 {
            return Err(anyhow!("MFA code step must be positive"));
        }
        if self.mfa_code_skew_steps > 2 {
            return Err(anyhow!("MFA code skew must be at most 2 steps"));
        }
        if self.mfa_challenge_ttl <= Duration::zero() {
            return Err(anyhow!("MFA challenge TTL must be positive"));
        }
        if self.lockout_threshold == 0 {
            return Err(anyhow!("lockout threshold must be at least 1"));
        }
        if self.backoff_base_ms == 0 || self.backoff_max_ms < self.backoff_base_ms {
            return Err(anyhow!("backoff base must be positive and not above the cap"));
        }
        if self.backend_timeout.is_zero() {
            return Err(anyhow!("backend timeout must be positive"));
        }
        Ok(())
    }

    #[must_use]
    pub fn with_token_issuer(mut self, issuer: String) -> Self {
        self.token_issuer = issuer;
        self
    }

    #[must_use]
    pub fn with_access_token_ttl_seconds(mut self, seconds: i64) -> Self {
        self.access_token_ttl = Duration::seconds(seconds);
        self
    }

    #[must_use]
    pub fn with_refresh_token_ttl_seconds(mut self, seconds: i64) -> Self {
        self.refresh_token_ttl = Duration::seconds(seconds);
        self
    }

    #[must_use]
    pub fn with_session_max_lifetime_seconds(mut self, seconds: i64) -> Self {
        self.session_max_lifetime = Duration::seconds(seconds);
        self
    }

    #[must_use]
    pub fn with_refresh_retry_window_seconds(mut self, seconds: i64) -> Self {
        self.refresh_retry_window = Duration::seconds(seconds);
        self
    }

    #[must_use]
    pub fn with_mfa_code_step_seconds(mut self, seconds: u64) -> Self {
        self.mfa_code_step_seconds = seconds;
        self
    }

    #[must_use]
    pub fn with_mfa_code_skew_steps(mut self, steps: u8) -> Self {
        self.mfa_code_skew_steps = steps;
        self
    }

    #[must_use]
    pub fn with_mfa_challenge_ttl_seconds(mut self, seconds: i64) -> Self {
        self.mfa_challenge_ttl = Duration::seconds(seconds);
        self
    }

    #[must_use]
    pub fn with_step_up_policy(mut self, policy: StepUpPolicy) -> Self {
        self.step_up_policy = policy;
        self
    }

    #[must_use]
    pub fn with_rate_limit(mut self, operation: OperationClass, policy: RateLimitPolicy) -> Self {
        match operation {
            OperationClass::Login => self.login_rate_limit = policy,
            OperationClass::Refresh => self.refresh_rate_limit = policy,
            OperationClass::MfaAttempt => self.mfa_rate_limit = policy,
        }
        self
    }

    #[must_use]
    pub fn with_backoff_ms(mut self, base_ms: u64, max_ms: u64) -> Self {
        self.backoff_base_ms = base_ms;
        self.backoff_max_ms = max_ms;
        self
    }

    #[must_use]
    pub fn with_lockout(mut self, threshold: u32, seconds: i64) -> Self {
        self.lockout_threshold = threshold;
        self.lockout_duration = Duration::seconds(seconds);
        self
    }

    #[must_use]
    pub fn with_trusted_applications<I, S>(mut self, applications: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.trusted_applications = applications.into_iter().map(Into::into).collect();
        self
    }

    #[must_use]
    pub fn with_trusted_federation_issuers<I, S>(mut self, issuers: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.trusted_federation_issuers = issuers.into_iter().map(Into::into).collect();
        self
    }

    #[must_use]
    pub fn with_sso_cache_ttl_ms(mut self, millis: i64) -> Self {
        self.sso_cache_ttl = Duration::milliseconds(millis);
        self
    }

    #[must_use]
    pub fn with_backend_timeout_ms(mut self, millis: u64) -> Self {
        self.backend_timeout = std::time::Duration::from_millis(millis);
        self
    }

    #[must_use]
    pub fn token_issuer(&self) -> &str {
        &self.token_issuer
    }

    #[must_use]
    pub fn access_token_ttl(&self) -> Duration {
        self.access_token_ttl
    }

    #[must_use]
    pub fn refresh_token_ttl(&self) -> Duration {
        self.refresh_token_ttl
    }

    #[must_use]
    pub fn session_max_lifetime(&self) -> Duration {
        self.session_max_lifetime
    }

    #[must_use]
    pub fn refresh_retry_window(&self) -> Duration {
        self.refresh_retry_window
    }

    #[must_use]
    pub fn mfa_code_step_seconds(&self) -> u64 {
        self.mfa_code_step_seconds
    }

    #[must_use]
    pub fn mfa_code_skew_steps(&self) -> u8 {
        self.mfa_code_skew_steps
    }

    #[must_use]
    pub fn mfa_challenge_ttl(&self) -> Duration {
        self.mfa_challenge_ttl
    }

    #[must_use]
    pub fn step_up_policy(&self) -> &StepUpPolicy {
        &self.step_up_policy
    }

    #[must_use]
    pub fn rate_limit(&self, operation: OperationClass) -> RateLimitPolicy {
        match operation {
            OperationClass::Login => self.login_rate_limit,
            OperationClass::Refresh => self.refresh_rate_limit,
            OperationClass::MfaAttempt => self.mfa_rate_limit,
        }
    }

    #[must_use]
    pub fn backoff_base_ms(&self) -> u64 {
        self.backoff_base_ms
    }

    #[must_use]
    pub fn backoff_max_ms(&self) -> u64 {
        self.backoff_max_ms
    }

    #[must_use]
    pub fn lockout_threshold(&self) -> u32 {
        self.lockout_threshold
    }

    #[must_use]
    pub fn lockout_duration(&self) -> Duration {
        self.lockout_duration
    }

    /// Empty set means every application may observe sessions.
    #[must_use]
    pub fn application_trusted(&self, application_id: &str) -> bool {
        self.trusted_applications.is_empty() || self.trusted_applications.contains(application_id)
    }

    /// Empty set means assertions from any issuer are accepted.
    #[must_use]
    pub fn federation_issuer_trusted(&self, issuer: &str) -> bool {
        self.trusted_federation_issuers.is_empty()
            || self.trusted_federation_issuers.contains(issuer)
    }

    #[must_use]
    pub fn sso_cache_ttl(&self) -> Duration {
        self.sso_cache_ttl
    }

    #[must_use]
    pub fn backend_timeout(&self) -> std::time::Duration {
        self.backend_timeout
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_and_overrides() -> Result<()> {
        let config = AuthorityConfig::new();
        config.validate()?;
        assert_eq!(config.access_token_ttl(), Duration::seconds(3600));
        assert_eq!(config.mfa_code_step_seconds(), 30);
        assert_eq!(config.mfa_code_skew_steps(), 1);
        assert_eq!(config.lockout_threshold(), 5);
        assert_eq!(config.rate_limit(OperationClass::Login).burst(), 10);
        assert!(config.application_trusted("anything"));

        let config = config
            .with_access_token_ttl_seconds(120)
            .with_lockout(3, 60)
            .with_trusted_applications(["billing", "portal"])
            .with_rate_limit(OperationClass::MfaAttempt, RateLimitPolicy::parse("2/10")?);
        config.validate()?;
        assert_eq!(config.access_token_ttl(), Duration::seconds(120));
        assert_eq!(config.lockout_threshold(), 3);
        assert!(config.application_trusted("billing"));
        assert!(!config.application_trusted("intruder"));
        assert_eq!(config.rate_limit(OperationClass::MfaAttempt).burst(), 2);
        Ok(())
    }

    #[test]
    fn validate_rejects_bad_values() {
        assert!(AuthorityConfig::new().with_access_token_ttl_seconds(0).validate().is_err());
        assert!(AuthorityConfig::new().with_mfa_code_skew_steps(5).validate().is_err());
        assert!(AuthorityConfig::new().with_lockout(0, 60).validate().is_err());
        assert!(AuthorityConfig::new().with_backoff_ms(100, 10).validate().is_err());
        assert!(
            AuthorityConfig::new()
                .with_session_max_lifetime_seconds(10)
                .validate()
                .is_err()
        );
    }

    #[test]
    fn rate_limit_policy_parse() -> Result<()> {
        let policy = RateLimitPolicy::parse("10/60")?;
        assert_eq!(policy.burst(), 10);
        assert_eq!(policy.window(), Duration::seconds(60));
        assert!(RateLimitPolicy::parse("10").is_err());
        assert!(RateLimitPolicy::parse("0/60").is_err());
        assert!(RateLimitPolicy::parse("x/60").is_err());
        Ok(())
    }

    #[test]
    fn step_up_policy_rules() -> Result<()> {
        let policy = StepUpPolicy::new().with_rule("Export_Data=mfa_verified")?;
        assert_eq!(policy.minimum_for("export_data"), AssuranceLevel::MfaVerified);
        assert_eq!(policy.minimum_for("read"), AssuranceLevel::Basic);
        assert!(StepUpPolicy::new().with_rule("nope").is_err());
        assert!(StepUpPolicy::new().with_rule("x=platinum").is_err());
        Ok(())
    }
}

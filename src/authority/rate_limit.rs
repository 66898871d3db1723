//! Rate limiting and lockout for authentication flows.
//!
//! Flow Overview:
//! 1) Every auth operation asks `RateLimiter::allow` with a key (principal, client IP)
//!    and an operation class. Buckets refill continuously over the class window.
//! 2) A refused call counts as a consecutive violation; the retry hint doubles per
//!    violation from the configured base and stops at the cap.
//! 3) `FailureTracker` reserves each primary verification as an `Attempt`, counts the
//!    failures and locks the identity out once the threshold is reached.
//!
//! Both structures are sharded maps; no lock is held beyond a single entry update.

use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use std::sync::Arc;
use tracing::warn;

use super::{
    clock::Clock,
    config::{AuthorityConfig, RateLimitPolicy},
    error::{AuthError, AuthResult},
    types::OperationClass,
};

/// Retry delay after `violations` consecutive refusals.
#[must_use]
pub fn backoff_delay(base_ms: u64, max_ms: u64, violations: u32) -> u64 {
    if violations == 0 {
        return 0;
    }
    let factor = 1u64.checked_shl(violations - 1).unwrap_or(u64::MAX);
    base_ms.saturating_mul(factor).min(max_ms)
}

pub trait RateLimiter: Send + Sync {
    /// # Errors
    /// Returns `AuthError::RateLimited` with the backoff hint when the key is over budget.
    fn allow(&self, key: &str, operation: OperationClass) -> AuthResult<()>;

    /// Drop idle state. Returns the number of entries removed.
    fn sweep(&self) -> usize {
        0
    }
}

#[derive(Clone, Debug)]
pub struct NoopRateLimiter;

impl RateLimiter for NoopRateLimiter {
    fn allow(&self, _key: &str, _operation: OperationClass) -> AuthResult<()> {
        Ok(())
    }
}

#[derive(Debug)]
struct Bucket {
    tokens: f64,
    refilled_at: DateTime<Utc>,
    violations: u32,
}

pub struct TokenBucketLimiter {
    clock: Arc<dyn Clock>,
    login: RateLimitPolicy,
    refresh: RateLimitPolicy,
    mfa_attempt: RateLimitPolicy,
    backoff_base_ms: u64,
    backoff_max_ms: u64,
    buckets: DashMap<(String, OperationClass), Bucket>,
}

impl TokenBucketLimiter {
    #[must_use]
    pub fn new(config: &AuthorityConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            login: config.rate_limit(OperationClass::Login),
            refresh: config.rate_limit(OperationClass::Refresh),
            mfa_attempt: config.rate_limit(OperationClass::MfaAttempt),
            backoff_base_ms: config.backoff_base_ms(),
            backoff_max_ms: config.backoff_max_ms(),
            buckets: DashMap::new(),
        }
    }

    fn policy(&self, operation: OperationClass) -> RateLimitPolicy {
        match operation {
            OperationClass::Login => self.login,
            OperationClass::Refresh => self.refresh,
            OperationClass::MfaAttempt => self.mfa_attempt,
        }
    }

    fn refill(bucket: &mut Bucket, policy: RateLimitPolicy, now: DateTime<Utc>) {
        let elapsed_ms = (now - bucket.refilled_at).num_milliseconds().max(0);
        let window_ms = policy.window().num_milliseconds().max(1);
        #[allow(clippy::cast_precision_loss)]
        let gained = elapsed_ms as f64 * f64::from(policy.burst()) / window_ms as f64;
        bucket.tokens = (bucket.tokens + gained).min(f64::from(policy.burst()));
        bucket.refilled_at = now;
    }
}

impl RateLimiter for TokenBucketLimiter {
    fn allow(&self, key: &str, operation: OperationClass) -> AuthResult<()> {
        let policy = self.policy(operation);
        let now = self.clock.now();
        let mut bucket = self
            .buckets
            .entry((key.to_string(), operation))
            .or_insert_with(|| Bucket {
                tokens: f64::from(policy.burst()),
                refilled_at: now,
                violations: 0,
            });
        Self::refill(&mut bucket, policy, now);

        if bucket.tokens >= 1.0 {
            bucket.tokens -= 1.0;
            bucket.violations = 0;
            return Ok(());
        }

        bucket.violations = bucket.violations.saturating_add(1);
        let retry_after_ms =
            backoff_delay(self.backoff_base_ms, self.backoff_max_ms, bucket.violations);
        drop(bucket);
        warn!(
            operation = operation.as_str(),
            retry_after_ms, "Rate limit exceeded"
        );
        Err(AuthError::RateLimited { retry_after_ms })
    }

    fn sweep(&self) -> usize {
        let now = self.clock.now();
        let before = self.buckets.len();
        self.buckets.retain(|(_, operation), bucket| {
            let policy = self.policy(*operation);
            now - bucket.refilled_at < policy.window()
        });
        before.saturating_sub(self.buckets.len())
    }
}

#[derive(Debug)]
struct FailureState {
    failures: u32,
    in_flight: u32,
    first_failure_at: DateTime<Utc>,
    locked_until: Option<DateTime<Utc>>,
}

impl FailureState {
    fn new(now: DateTime<Utc>) -> Self {
        Self {
            failures: 0,
            in_flight: 0,
            first_failure_at: now,
            locked_until: None,
        }
    }

    fn is_idle(&self) -> bool {
        self.failures == 0 && self.in_flight == 0 && self.locked_until.is_none()
    }
}

/// Consecutive failed verifications per principal, with timed lockout.
///
/// Attempts are reserved before the credential is checked, so failures still in
/// flight count against the threshold.
pub struct FailureTracker {
    clock: Arc<dyn Clock>,
    threshold: u32,
    lockout: Duration,
    entries: DashMap<String, FailureState>,
}

impl FailureTracker {
    #[must_use]
    pub fn new(config: &AuthorityConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            threshold: config.lockout_threshold(),
            lockout: config.lockout_duration(),
            entries: DashMap::new(),
        }
    }

    /// Reserve one verification attempt for `key`.
    ///
    /// # Errors
    /// Returns `AuthError::LockedOut` while a lockout is active, or while the
    /// attempts already in flight could reach the threshold on their own.
    pub fn begin(self: &Arc<Self>, key: &str) -> AuthResult<Attempt> {
        let now = self.clock.now();
        let mut entry = self
            .entries
            .entry(key.to_string())
            .or_insert_with(|| FailureState::new(now));

        match entry.locked_until {
            Some(until) if until > now => {
                let retry_after_ms = millis(until - now);
                return Err(AuthError::LockedOut { retry_after_ms });
            }
            Some(_) => {
                entry.locked_until = None;
                entry.failures = 0;
                entry.first_failure_at = now;
            }
            None if now - entry.first_failure_at >= self.lockout => {
                entry.failures = 0;
                entry.first_failure_at = now;
            }
            None => {}
        }

        if entry.failures.saturating_add(entry.in_flight) >= self.threshold {
            warn!(
                failures = entry.failures,
                in_flight = entry.in_flight,
                "Attempt refused: pending failures would reach the lockout threshold"
            );
            return Err(AuthError::LockedOut {
                retry_after_ms: millis(self.lockout),
            });
        }
        entry.in_flight = entry.in_flight.saturating_add(1);
        Ok(Attempt {
            tracker: Arc::clone(self),
            key: key.to_string(),
            settled: false,
        })
    }

    fn settle(&self, key: &str, outcome: Option<bool>) -> bool {
        let now = self.clock.now();
        let Some(mut entry) = self.entries.get_mut(key) else {
            return false;
        };
        entry.in_flight = entry.in_flight.saturating_sub(1);
        let mut locked = false;
        match outcome {
            Some(true) => entry.failures = 0,
            Some(false) => {
                if entry.failures == 0 {
                    entry.first_failure_at = now;
                }
                entry.failures = entry.failures.saturating_add(1);
                if entry.locked_until.is_none() && entry.failures >= self.threshold {
                    entry.locked_until = Some(now + self.lockout);
                    warn!(failures = entry.failures, "Principal locked out");
                    locked = true;
                }
            }
            None => {}
        }
        drop(entry);
        self.entries.remove_if(key, |_, state| state.is_idle());
        locked
    }

    pub fn sweep(&self) -> usize {
        let now = self.clock.now();
        let before = self.entries.len();
        self.entries.retain(|_, state| {
            state.in_flight > 0
                || match state.locked_until {
                    Some(until) => until > now,
                    None => state.failures > 0 && now - state.first_failure_at < self.lockout,
                }
        });
        before.saturating_sub(self.entries.len())
    }
}

fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.num_milliseconds()).unwrap_or(0)
}

/// A reserved verification attempt. Dropping it unsettled releases the slot
/// without counting a failure.
#[must_use]
pub struct Attempt {
    tracker: Arc<FailureTracker>,
    key: String,
    settled: bool,
}

impl Attempt {
    /// The credential matched; the failure count resets.
    pub fn succeeded(mut self) {
        self.settled = true;
        self.tracker.settle(&self.key, Some(true));
    }

    /// The credential was rejected. Returns true when this failure triggered a lockout.
    pub fn failed(mut self) -> bool {
        self.settled = true;
        self.tracker.settle(&self.key, Some(false))
    }
}

impl Drop for Attempt {
    fn drop(&mut self) {
        if !self.settled {
            self.tracker.settle(&self.key, None);
        }
    }
}

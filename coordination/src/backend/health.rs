//! Per-backend health state machine.
//!
//! Tracks consecutive failures, a long cooldown after the failure threshold
//! is reached, and a short rate-limit window. Recovery is evaluated lazily
//! in [`BackendHealth::can_use_at`]; nothing runs in the background.
//!
//! Every mutating operation has an `_at(now)` variant so callers (and tests)
//! can drive the clock explicitly. The plain variants read
//! [`tokio::time::Instant::now`], which honours a paused test runtime.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use super::FailureKind;

/// Consecutive failures before a backend is disabled.
pub const DEFAULT_MAX_ERRORS: u32 = 2;
/// How long a disabled backend stays disabled after its last failure.
pub const DEFAULT_COOLDOWN: Duration = Duration::from_secs(180);
/// How long a rate-limited backend is skipped.
pub const DEFAULT_RATE_LIMIT_WINDOW: Duration = Duration::from_secs(60);

/// Thresholds shared by all trackers built from it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HealthPolicy {
    pub max_errors: u32,
    pub cooldown: Duration,
    pub rate_limit_window: Duration,
}

impl Default for HealthPolicy {
    fn default() -> Self {
        Self {
            max_errors: DEFAULT_MAX_ERRORS,
            cooldown: DEFAULT_COOLDOWN,
            rate_limit_window: DEFAULT_RATE_LIMIT_WINDOW,
        }
    }
}

impl HealthPolicy {
    /// Check the policy is internally consistent.
    pub fn validate(&self) -> Result<(), String> {
        if self.max_errors == 0 {
            return Err("max_errors must be >= 1".into());
        }
        if self.rate_limit_window >= self.cooldown {
            return Err(format!(
                "rate_limit_window ({:?}) must be shorter than cooldown ({:?})",
                self.rate_limit_window, self.cooldown
            ));
        }
        Ok(())
    }
}

/// Mutable health state of one backend.
#[derive(Debug, Clone)]
pub struct BackendHealth {
    available: bool,
    auth_disabled: bool,
    consecutive_errors: u32,
    last_error_at: Option<Instant>,
    rate_limited: bool,
    rate_limit_reset_at: Option<Instant>,
    last_failure: Option<FailureKind>,
    total_successes: u64,
    total_failures: u64,
    policy: HealthPolicy,
}

impl Default for BackendHealth {
    fn default() -> Self {
        Self::new(HealthPolicy::default())
    }
}

impl BackendHealth {
    pub fn new(policy: HealthPolicy) -> Self {
        Self {
            available: true,
            auth_disabled: false,
            consecutive_errors: 0,
            last_error_at: None,
            rate_limited: false,
            rate_limit_reset_at: None,
            last_failure: None,
            total_successes: 0,
            total_failures: 0,
            policy,
        }
    }

    pub fn policy(&self) -> &HealthPolicy {
        &self.policy
    }

    pub fn is_available(&self) -> bool {
        self.available
    }

    pub fn is_rate_limited(&self) -> bool {
        self.rate_limited
    }

    pub fn is_auth_disabled(&self) -> bool {
        self.auth_disabled
    }

    pub fn consecutive_errors(&self) -> u32 {
        self.consecutive_errors
    }

    pub fn can_use(&mut self) -> bool {
        self.can_use_at(Instant::now())
    }

    /// Whether the backend may be tried at `now`.
    ///
    /// Clears an expired rate-limit window and restores a disabled backend
    /// whose cooldown has elapsed. Auth-disabled backends never recover here.
    pub fn can_use_at(&mut self, now: Instant) -> bool {
        if self.rate_limited {
            match self.rate_limit_reset_at {
                Some(reset_at) if now < reset_at => return false,
                _ => {
                    self.rate_limited = false;
                    self.rate_limit_reset_at = None;
                }
            }
        }

        if self.available {
            return true;
        }
        if self.auth_disabled {
            return false;
        }

        let cooled = self
            .last_error_at
            .map(|at| now.saturating_duration_since(at) >= self.policy.cooldown)
            .unwrap_or(true);
        if cooled {
            self.available = true;
            self.consecutive_errors = 0;
            self.last_error_at = None;
        }
        cooled
    }

    pub fn record_success(&mut self) {
        self.available = true;
        self.consecutive_errors = 0;
        self.last_error_at = None;
        self.rate_limited = false;
        self.rate_limit_reset_at = None;
        self.total_successes += 1;
    }

    pub fn record_failure(&mut self, kind: FailureKind) {
        self.record_failure_at(kind, Instant::now());
    }

    pub fn record_failure_at(&mut self, kind: FailureKind, now: Instant) {
        self.consecutive_errors = self.consecutive_errors.saturating_add(1);
        self.last_error_at = Some(now);
        self.last_failure = Some(kind);
        self.total_failures += 1;

        match kind {
            FailureKind::AuthFailure => {
                self.auth_disabled = true;
                self.consecutive_errors = self.consecutive_errors.max(self.policy.max_errors);
            }
            FailureKind::RateLimit => {
                self.rate_limited = true;
                self.rate_limit_reset_at = Some(now + self.policy.rate_limit_window);
            }
            FailureKind::Generic => {}
        }

        if self.consecutive_errors >= self.policy.max_errors {
            self.available = false;
        }
    }

    /// Forget all failure state, including an auth disable.
    ///
    /// Used when the backend's credentials are reconfigured.
    pub fn reset(&mut self) {
        let policy = self.policy;
        let successes = self.total_successes;
        let failures = self.total_failures;
        *self = Self::new(policy);
        self.total_successes = successes;
        self.total_failures = failures;
    }

    pub fn snapshot(&self) -> HealthSnapshot {
        self.snapshot_at(Instant::now())
    }

    pub fn snapshot_at(&self, now: Instant) -> HealthSnapshot {
        let rate_limit_remaining_secs = self
            .rate_limit_reset_at
            .filter(|_| self.rate_limited)
            .map(|at| at.saturating_duration_since(now).as_secs());
        let cooldown_remaining_secs = if self.available || self.auth_disabled {
            None
        } else {
            self.last_error_at.map(|at| {
                (at + self.policy.cooldown)
                    .saturating_duration_since(now)
                    .as_secs()
            })
        };

        HealthSnapshot {
            available: self.available,
            auth_disabled: self.auth_disabled,
            consecutive_errors: self.consecutive_errors,
            max_errors: self.policy.max_errors,
            rate_limited: self.rate_limited,
            rate_limit_remaining_secs,
            cooldown_remaining_secs,
            last_failure: self.last_failure,
            total_successes: self.total_successes,
            total_failures: self.total_failures,
        }
    }
}

/// Serializable view of a backend's health.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthSnapshot {
    pub available: bool,
    pub auth_disabled: bool,
    pub consecutive_errors: u32,
    pub max_errors: u32,
    pub rate_limited: bool,
    pub rate_limit_remaining_secs: Option<u64>,
    pub cooldown_remaining_secs: Option<u64>,
    pub last_failure: Option<FailureKind>,
    pub total_successes: u64,
    pub total_failures: u64,
}

//! Rate limit policy, decision and key types.

use crate::error::RateLimitError;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt;
use std::net::IpAddr;
use std::time::Duration;

/// Longest window a policy may use.
pub const MAX_WINDOW: Duration = Duration::from_secs(366 * 24 * 60 * 60);

/// A validated `limit` per `window` policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RatePolicy {
    pub limit: u32,
    pub window: Duration,
}

impl RatePolicy {
    /// Build a policy, rejecting negative limits, empty windows and windows
    /// longer than [`MAX_WINDOW`].
    ///
    /// A limit of zero is valid and denies every request.
    pub fn new(limit: i64, window: Duration) -> Result<Self, RateLimitError> {
        if limit < 0 {
            return Err(RateLimitError::NegativeLimit(limit));
        }
        if window.is_zero() {
            return Err(RateLimitError::ZeroWindow);
        }
        if window > MAX_WINDOW {
            return Err(RateLimitError::WindowTooLong(window, MAX_WINDOW));
        }

        Ok(Self {
            limit: u32::try_from(limit).unwrap_or(u32::MAX),
            window,
        })
    }
}

/// Outcome of a single limiter check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RateDecision {
    pub allowed: bool,
    pub limit: u32,
    pub remaining: u32,
    pub reset_at: DateTime<Utc>,
}

impl RateDecision {
    /// Whole seconds until the window resets, rounded up.
    pub fn retry_after_secs(&self, now: DateTime<Utc>) -> u64 {
        let millis = (self.reset_at - now).num_milliseconds();
        if millis <= 0 {
            return 0;
        }
        (millis as u64).div_ceil(1000)
    }

    /// Reset time as a unix timestamp in seconds.
    pub fn reset_unix(&self) -> i64 {
        self.reset_at.timestamp()
    }
}

/// Limiter key: a scope (the protected operation) plus the caller identity.
///
/// Anonymous endpoints key by client IP, authenticated endpoints by subject id.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RateKey(String);

impl RateKey {
    pub fn client_ip(scope: &str, ip: IpAddr) -> Self {
        Self(format!("{}:{}", scope, ip))
    }

    pub fn subject(scope: &str, subject_id: &str) -> Self {
        Self(format!("{}:sub:{}", scope, subject_id))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RateKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

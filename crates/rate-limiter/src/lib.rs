//! Keyed fixed-window rate limiting.
//!
//! Each key owns one counter window. Buckets are created lazily on the
//! first check for a key and evicted by a background sweeper once idle,
//! which bounds memory for per-IP keys of unbounded cardinality.

mod clock;
mod error;
mod limiter;
mod types;

pub use clock::{Clock, ManualClock, SystemClock};
pub use error::RateLimitError;
pub use limiter::{RateLimiter, SweeperHandle};
pub use types::*;

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use std::net::{IpAddr, Ipv4Addr};
    use std::time::Duration;

    #[test]
    fn test_policy_rejects_negative_limit() {
        assert_eq!(
            RatePolicy::new(-1, Duration::from_secs(60)),
            Err(RateLimitError::NegativeLimit(-1))
        );
    }

    #[test]
    fn test_policy_rejects_zero_window() {
        assert_eq!(
            RatePolicy::new(5, Duration::ZERO),
            Err(RateLimitError::ZeroWindow)
        );
    }

    #[test]
    fn test_policy_rejects_window_too_long() {
        let too_long = MAX_WINDOW + Duration::from_secs(1);
        assert_eq!(
            RatePolicy::new(5, too_long),
            Err(RateLimitError::WindowTooLong(too_long, MAX_WINDOW))
        );
        assert!(RatePolicy::new(5, MAX_WINDOW).is_ok());
    }

    #[test]
    fn test_policy_allows_zero_limit() {
        let policy = RatePolicy::new(0, Duration::from_secs(60)).unwrap();
        assert_eq!(policy.limit, 0);
    }

    #[test]
    fn test_rate_key_formats() {
        let ip = IpAddr::V4(Ipv4Addr::new(203, 0, 113, 7));
        assert_eq!(RateKey::client_ip("activate", ip).as_str(), "activate:203.0.113.7");
        assert_eq!(RateKey::subject("profile", "user-1").to_string(), "profile:sub:user-1");
    }

    #[test]
    fn test_retry_after_rounds_up() {
        let now = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let decision = RateDecision {
            allowed: false,
            limit: 5,
            remaining: 0,
            reset_at: now + chrono::Duration::milliseconds(1500),
        };

        assert_eq!(decision.retry_after_secs(now), 2);
        assert_eq!(decision.retry_after_secs(decision.reset_at), 0);
        assert_eq!(decision.reset_unix(), now.timestamp() + 1);
    }

    #[test]
    fn test_decision_serialization() {
        let decision = RateDecision {
            allowed: true,
            limit: 5,
            remaining: 4,
            reset_at: Utc.with_ymd_and_hms(2024, 1, 1, 1, 0, 0).unwrap(),
        };
        let json = serde_json::to_string(&decision).unwrap();

        assert!(json.contains("\"allowed\":true"));
        assert!(json.contains("\"remaining\":4"));
        assert!(json.contains("\"reset_at\":\"2024-01-01T01:00:00Z\""));
    }

    #[test]
    fn test_manual_clock_shared_between_clones() {
        let clock = ManualClock::new(Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap());
        let other = clock.clone();

        other.advance(Duration::from_secs(90));

        assert_eq!(
            clock.now(),
            Utc.with_ymd_and_hms(2024, 1, 1, 0, 1, 30).unwrap()
        );
    }
}

//! Keyed fixed-window rate limiter.

use crate::clock::{Clock, SystemClock};
use crate::types::{RateDecision, RatePolicy};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

/// Buckets idle for this many windows are evicted by the sweeper.
const DEFAULT_IDLE_WINDOWS: u32 = 2;

/// Counter for one key.
#[derive(Debug, Clone)]
struct Bucket {
    count: u32,
    window_start: DateTime<Utc>,
    window: Duration,
}

/// Fixed-window rate limiter keyed by arbitrary strings.
///
/// Buckets live in a sharded map: a check holds only the shard lock of its
/// own key for the whole read-increment-compare sequence, so two concurrent
/// checks on one key can never both observe spare quota, and checks on
/// different keys rarely contend.
///
/// A window that has fully elapsed is replaced by a new one starting at the
/// current check. Bursts of up to `2 * limit` are possible across a window
/// boundary; memory is O(1) per key.
#[derive(Debug)]
pub struct RateLimiter {
    buckets: DashMap<String, Bucket>,
    clock: Arc<dyn Clock>,
    idle_windows: u32,
}

impl RateLimiter {
    /// Create a limiter reading time from `clock`.
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            buckets: DashMap::new(),
            clock,
            idle_windows: DEFAULT_IDLE_WINDOWS,
        }
    }

    /// Set how many whole windows a bucket may sit idle before eviction.
    pub fn with_idle_windows(mut self, idle_windows: u32) -> Self {
        self.idle_windows = idle_windows.max(1);
        self
    }

    /// Count one request against `key`.
    ///
    /// A negative `limit` is a configuration error and is denied, as is a
    /// window too long to place on the calendar.
    pub fn check(&self, key: &str, limit: i64, window: Duration) -> RateDecision {
        let now = self.clock.now();

        if limit < 0 {
            error!(key = %key, limit, "Negative rate limit configured, denying request");
            return RateDecision {
                allowed: false,
                limit: 0,
                remaining: 0,
                reset_at: window_end(now, window).unwrap_or(now),
            };
        }
        let limit = u32::try_from(limit).unwrap_or(u32::MAX);

        let Some(fresh_end) = window_end(now, window) else {
            error!(key = %key, ?window, "Rate limit window out of range, denying request");
            return RateDecision {
                allowed: false,
                limit,
                remaining: 0,
                reset_at: now,
            };
        };

        let mut bucket = self
            .buckets
            .entry(key.to_string())
            .or_insert_with(|| Bucket {
                count: 0,
                window_start: now,
                window,
            });

        bucket.window = window;
        let reset_at = match window_end(bucket.window_start, window) {
            Some(end) if now < end => end,
            _ => {
                bucket.count = 0;
                bucket.window_start = now;
                fresh_end
            }
        };

        bucket.count = bucket.count.saturating_add(1);
        let count = bucket.count;
        drop(bucket);

        if count > limit {
            debug!(key = %key, count, limit, "Rate limit window exhausted");
            RateDecision {
                allowed: false,
                limit,
                remaining: 0,
                reset_at,
            }
        } else {
            RateDecision {
                allowed: true,
                limit,
                remaining: limit - count,
                reset_at,
            }
        }
    }

    /// Count one request against `key` using a validated policy.
    pub fn check_policy(&self, key: &str, policy: &RatePolicy) -> RateDecision {
        self.check(key, i64::from(policy.limit), policy.window)
    }

    /// Current time as seen by this limiter.
    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    /// Remove buckets whose window started more than `idle_windows` windows ago.
    ///
    /// Returns the number of evicted buckets.
    pub fn sweep(&self) -> usize {
        let now = self.clock.now();
        let before = self.buckets.len();
        let idle_windows = i32::try_from(self.idle_windows).unwrap_or(i32::MAX);

        // A bucket whose idle deadline overflows is kept until the next sweep.
        self.buckets.retain(|_, bucket| {
            chrono::Duration::from_std(bucket.window)
                .ok()
                .and_then(|span| span.checked_mul(idle_windows))
                .and_then(|idle| bucket.window_start.checked_add_signed(idle))
                .map_or(true, |deadline| now < deadline)
        });

        let removed = before.saturating_sub(self.buckets.len());
        if removed > 0 {
            debug!("Evicted {} idle rate limit buckets", removed);
        }
        removed
    }

    /// Number of keys currently tracked.
    pub fn bucket_count(&self) -> usize {
        self.buckets.len()
    }

    /// Spawn a background task that sweeps idle buckets every `interval`.
    ///
    /// The task stops when the returned handle is shut down or dropped.
    pub fn spawn_sweeper(self: &Arc<Self>, interval: Duration) -> SweeperHandle {
        let limiter = Arc::clone(self);

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            // The first tick completes immediately.
            ticker.tick().await;

            loop {
                ticker.tick().await;
                limiter.sweep();
            }
        });

        info!("Rate limit sweeper started (interval={:?})", interval);
        SweeperHandle {
            handle: Some(handle),
        }
    }
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new(Arc::new(SystemClock))
    }
}

/// Owner of the sweeper task.
#[derive(Debug)]
pub struct SweeperHandle {
    handle: Option<JoinHandle<()>>,
}

impl SweeperHandle {
    /// Stop the sweeper and wait for the task to finish.
    pub async fn shutdown(mut self) {
        if let Some(handle) = self.handle.take() {
            handle.abort();
            let _ = handle.await;
            debug!("Rate limit sweeper stopped");
        }
    }
}

impl Drop for SweeperHandle {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }
}

/// End of a window starting at `start`, if it fits in a `DateTime`.
fn window_end(start: DateTime<Utc>, window: Duration) -> Option<DateTime<Utc>> {
    let span = chrono::Duration::from_std(window).ok()?;
    start.checked_add_signed(span)
}

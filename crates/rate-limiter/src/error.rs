//! Rate limiter errors.

use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RateLimitError {
    #[error("Rate limit must not be negative (got {0})")]
    NegativeLimit(i64),

    #[error("Rate limit window must be greater than zero")]
    ZeroWindow,

    #[error("Rate limit window {0:?} exceeds the maximum of {1:?}")]
    WindowTooLong(Duration, Duration),
}

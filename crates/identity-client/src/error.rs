//! Identity provider client errors.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum IdentityError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Identity provider request timed out")]
    Timeout,

    #[error("Rate limit exceeded")]
    RateLimit,

    #[error("Authentication failed")]
    Unauthorized,

    #[error("API error: {status} - {message}")]
    Api { status: u16, message: String },

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Invalid response: {0}")]
    InvalidResponse(String),
}

impl IdentityError {
    /// Whether the provider may have applied the request despite the error.
    pub fn is_ambiguous(&self) -> bool {
        match self {
            IdentityError::Timeout => true,
            IdentityError::Http(e) => e.is_timeout() || e.is_request(),
            IdentityError::Api { status, .. } => *status >= 500,
            _ => false,
        }
    }
}

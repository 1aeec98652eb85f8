//! Error types for the activation service.

use axum::http::{HeaderMap, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use rate_limiter::RateDecision;
use serde::Serialize;
use thiserror::Error;

/// Message returned for every token-validity failure.
pub const INVALID_TOKEN_MESSAGE: &str = "Invalid or expired activation token";

const PROVISIONING_MESSAGE: &str = "Activation could not be completed. Please try again.";
const RATE_LIMITED_MESSAGE: &str = "Too many activation attempts. Please try again later.";

/// Activation error types.
#[derive(Debug, Error)]
pub enum ActivationError {
    /// Token absent, expired or malformed.
    #[error("Invalid activation token")]
    InvalidToken,

    /// Another request consumed this token value first.
    #[error("Activation token already consumed")]
    AlreadyConsumed,

    #[error("Rate limit exceeded for key")]
    RateLimited {
        decision: RateDecision,
        retry_after_secs: u64,
    },

    #[error("Too many requests")]
    TooManyRequests { retry_after_secs: u64 },

    /// Account or profile creation failed; the token was restored.
    #[error("Provisioning failed: {0}")]
    Provisioning(String),

    /// Provisioning failed and the token could not be restored.
    #[error("Provisioning failed and rollback failed: {0}")]
    RollbackFailed(String),

    /// Never surfaced to clients; downgraded to a manual sign-in response.
    #[error("Credential issuance failed: {0}")]
    CredentialIssuance(String),

    #[error("Invalid registration: {0}")]
    InvalidRegistration(String),

    #[error("Registration not found: {0}")]
    NotFound(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Encryption error: {0}")]
    Encryption(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl ActivationError {
    /// Short machine-readable reason, used for audit metadata.
    pub fn reason(&self) -> &'static str {
        match self {
            ActivationError::InvalidToken => "invalid_token",
            ActivationError::AlreadyConsumed => "already_consumed",
            ActivationError::RateLimited { .. } => "rate_limited",
            ActivationError::TooManyRequests { .. } => "too_many_requests",
            ActivationError::Provisioning(_) => "provisioning_failed",
            ActivationError::RollbackFailed(_) => "rollback_failed",
            ActivationError::CredentialIssuance(_) => "credential_issuance_failed",
            ActivationError::InvalidRegistration(_) => "invalid_registration",
            ActivationError::NotFound(_) => "not_found",
            ActivationError::Storage(_) => "storage_error",
            ActivationError::Encryption(_) => "encryption_error",
            ActivationError::Internal(_) => "internal_error",
        }
    }

    /// Whether the client caused the failure.
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            ActivationError::InvalidToken
                | ActivationError::AlreadyConsumed
                | ActivationError::RateLimited { .. }
                | ActivationError::TooManyRequests { .. }
                | ActivationError::InvalidRegistration(_)
                | ActivationError::NotFound(_)
        )
    }
}

/// Error response body.
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub code: String,
    #[serde(rename = "retryAfter", skip_serializing_if = "Option::is_none")]
    pub retry_after: Option<u64>,
}

impl IntoResponse for ActivationError {
    fn into_response(self) -> Response {
        let mut headers = HeaderMap::new();
        let mut retry_after = None;

        // Token failures share one status, code and message.
        let (status, code, message) = match &self {
            ActivationError::InvalidToken | ActivationError::AlreadyConsumed => (
                StatusCode::BAD_REQUEST,
                "INVALID_TOKEN",
                INVALID_TOKEN_MESSAGE.to_string(),
            ),
            ActivationError::RateLimited {
                decision,
                retry_after_secs,
            } => {
                headers = rate_limit_headers(decision);
                headers.insert("Retry-After", HeaderValue::from(*retry_after_secs));
                retry_after = Some(*retry_after_secs);
                (
                    StatusCode::TOO_MANY_REQUESTS,
                    "RATE_LIMITED",
                    RATE_LIMITED_MESSAGE.to_string(),
                )
            }
            ActivationError::TooManyRequests { retry_after_secs } => {
                headers.insert("Retry-After", HeaderValue::from(*retry_after_secs));
                retry_after = Some(*retry_after_secs);
                (
                    StatusCode::TOO_MANY_REQUESTS,
                    "RATE_LIMITED",
                    RATE_LIMITED_MESSAGE.to_string(),
                )
            }
            ActivationError::InvalidRegistration(_) => (
                StatusCode::BAD_REQUEST,
                "INVALID_REGISTRATION",
                self.to_string(),
            ),
            ActivationError::NotFound(_) => {
                (StatusCode::NOT_FOUND, "NOT_FOUND", self.to_string())
            }
            ActivationError::Provisioning(_)
            | ActivationError::RollbackFailed(_)
            | ActivationError::CredentialIssuance(_) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "ACTIVATION_FAILED",
                PROVISIONING_MESSAGE.to_string(),
            ),
            ActivationError::Storage(_)
            | ActivationError::Encryption(_)
            | ActivationError::Internal(_) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "INTERNAL_ERROR",
                "Internal server error".to_string(),
            ),
        };

        let body = ErrorResponse {
            error: message,
            code: code.to_string(),
            retry_after,
        };

        (status, headers, Json(body)).into_response()
    }
}

/// `X-RateLimit-*` headers describing a limiter decision.
pub fn rate_limit_headers(decision: &RateDecision) -> HeaderMap {
    let mut headers = HeaderMap::new();
    headers.insert("X-RateLimit-Limit", HeaderValue::from(decision.limit));
    headers.insert("X-RateLimit-Remaining", HeaderValue::from(decision.remaining));
    headers.insert("X-RateLimit-Reset", HeaderValue::from(decision.reset_unix()));
    headers
}

impl From<std::io::Error> for ActivationError {
    fn from(e: std::io::Error) -> Self {
        ActivationError::Storage(e.to_string())
    }
}

impl From<serde_json::Error> for ActivationError {
    fn from(e: serde_json::Error) -> Self {
        ActivationError::Storage(format!("JSON serialization error: {}", e))
    }
}

impl From<aes_gcm::Error> for ActivationError {
    fn from(_: aes_gcm::Error) -> Self {
        ActivationError::Encryption("AES-GCM encryption/decryption failed".to_string())
    }
}

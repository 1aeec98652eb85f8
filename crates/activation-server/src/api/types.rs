//! API request and response types.

use crate::activation::ActivationOutcome;
use crate::registry::RegistryStats;
use serde::{Deserialize, Serialize};

/// Body of `POST /activate`.
#[derive(Debug, Deserialize)]
pub struct ActivateRequest {
    /// Activation secret from the emailed link. Missing is treated as empty.
    #[serde(default)]
    pub token: String,
}

/// Successful activation.
#[derive(Debug, Serialize, Deserialize, PartialEq)]
pub struct ActivateResponse {
    pub success: bool,

    /// One-time sign-in link
    #[serde(skip_serializing_if = "Option::is_none")]
    pub credential: Option<String>,

    /// Where the client should go next
    pub redirect: String,

    /// Instructions when no credential could be issued
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl From<ActivationOutcome> for ActivateResponse {
    fn from(outcome: ActivationOutcome) -> Self {
        Self {
            success: true,
            credential: outcome.credential,
            redirect: outcome.redirect,
            message: outcome.message,
        }
    }
}

/// Health check response.
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub registrations: RegistryStats,
    /// Keys currently tracked by the per-client limiter
    pub rate_limit_buckets: usize,
    /// Registrations stranded by a failed rollback since startup
    pub rollback_failures: u64,
    pub identity_provider_healthy: bool,
}

//! HTTP request handlers.

use super::middleware::client_ip;
use super::types::{ActivateRequest, ActivateResponse, HealthResponse};
use super::AppState;
use crate::activation::ActivationRequest;
use crate::error::{rate_limit_headers, ActivationError};
use axum::{
    extract::{rejection::JsonRejection, ConnectInfo, State},
    http::{header::USER_AGENT, HeaderMap},
    Json,
};
use std::net::SocketAddr;
use tracing::debug;

/// Health check endpoint.
pub async fn health(State(state): State<AppState>) -> Result<Json<HealthResponse>, ActivationError> {
    let registrations = state.service.store().stats().await?;
    let identity_provider_healthy = state.service.provider_healthy().await;

    Ok(Json(HealthResponse {
        status: "ok".to_string(),
        registrations,
        rate_limit_buckets: state.service.limiter().bucket_count(),
        rollback_failures: state.service.rollback_failures(),
        identity_provider_healthy,
    }))
}

/// Redeem an activation token.
///
/// A body that does not parse is treated like any other unusable token.
pub async fn activate(
    State(state): State<AppState>,
    connect_info: Option<ConnectInfo<SocketAddr>>,
    headers: HeaderMap,
    payload: Result<Json<ActivateRequest>, JsonRejection>,
) -> Result<(HeaderMap, Json<ActivateResponse>), ActivationError> {
    let token = match payload {
        Ok(Json(request)) => request.token,
        Err(rejection) => {
            debug!(error = %rejection, "Unreadable activation request body");
            String::new()
        }
    };

    let request = ActivationRequest {
        token,
        client_ip: client_ip(
            &headers,
            connect_info.map(|ConnectInfo(addr)| addr),
            state.trust_forwarded_headers,
        ),
        user_agent: headers
            .get(USER_AGENT)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string),
    };

    let outcome = state.service.activate(request).await?;

    Ok((rate_limit_headers(&outcome.rate), Json(outcome.into())))
}

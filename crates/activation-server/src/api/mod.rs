//! HTTP API for the activation service.

mod handlers;
mod middleware;
mod types;

pub use handlers::*;
pub use middleware::{client_ip, logging_middleware, rate_limit_middleware, RateLimitState};
pub use types::*;

use crate::activation::ActivationService;
use axum::{
    middleware as axum_middleware,
    routing::{get, post},
    Router,
};
use tower_http::trace::TraceLayer;

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    pub service: ActivationService,
    /// Believe X-Forwarded-For / X-Real-IP for the client address
    pub trust_forwarded_headers: bool,
}

impl AppState {
    pub fn new(service: ActivationService, trust_forwarded_headers: bool) -> Self {
        Self {
            service,
            trust_forwarded_headers,
        }
    }
}

/// Create the API router with the default global rate limit.
pub fn create_router(state: AppState) -> Router {
    create_router_with_rate_limit(state, RateLimitState::new(600))
}

/// Create the API router with a custom global rate limit.
pub fn create_router_with_rate_limit(state: AppState, rate_limit: RateLimitState) -> Router {
    Router::new()
        .route("/activate", post(handlers::activate))
        .layer(axum_middleware::from_fn_with_state(
            rate_limit,
            rate_limit_middleware,
        ))
        // Health check (no rate limiting)
        .route("/health", get(handlers::health))
        .layer(axum_middleware::from_fn(logging_middleware))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

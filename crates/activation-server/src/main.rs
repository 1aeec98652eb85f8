//! Activation Server - Entry point.

use activation_server::{
    activation::{ActivationService, ActivationSettings},
    api::{create_router_with_rate_limit, AppState, RateLimitState},
    audit::AuditLog,
    config::{Config, LogConfig, LogFormat},
    registry::{PersistentRegistry, Store},
};
use anyhow::Context;
use identity_client::IdentityClient;
use rate_limiter::{RateLimiter, SystemClock};
use secrecy::ExposeSecret;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::signal;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load configuration
    let config = Config::load().context("Failed to load configuration")?;

    // Initialize logging
    init_logging(&config.log);

    info!("Starting Activation Server");

    // Initialize storage
    let store = match (config.registry.persist, &config.registry.encryption_key) {
        (true, Some(key)) => {
            info!("Using encrypted registry at {:?}", config.registry.path);
            Store::encrypted(config.registry.path.clone(), key.expose_secret())
        }
        _ => {
            info!("Persistence disabled, using in-memory storage");
            Store::memory()
        }
    };

    // A snapshot we cannot read must not be silently replaced by an empty one.
    let registry = PersistentRegistry::load(store)
        .await
        .context("Failed to load registry")?;

    // Identity provider client
    let identity = Arc::new(
        IdentityClient::new(
            config.identity.base_url.clone(),
            config.identity.service_key.expose_secret().as_str(),
            config.identity.timeout,
        )
        .context("Failed to create identity provider client")?,
    );

    if identity.health_check().await {
        info!("Identity provider healthy at {}", config.identity.base_url);
    } else {
        warn!("Identity provider health check failed - will retry on requests");
    }

    // Per-client limiter and its sweeper
    let limiter = Arc::new(
        RateLimiter::new(Arc::new(SystemClock)).with_idle_windows(config.rate_limit.idle_windows),
    );
    let sweeper = limiter.spawn_sweeper(config.rate_limit.sweep_interval);

    let settings = ActivationSettings::from_config(&config)?;
    info!(
        "Activation policy: {} attempts per {:?} per client",
        settings.policy.limit, settings.policy.window
    );

    let service = ActivationService::new(
        Arc::new(registry),
        limiter,
        identity.clone(),
        identity,
        AuditLog::tracing(),
        settings,
    );

    let state = AppState::new(service, config.server.trust_forwarded_headers);
    let rate_limit = RateLimitState::new(config.rate_limit.global_per_minute);
    let app = create_router_with_rate_limit(state, rate_limit);

    // Bind to address
    let addr = SocketAddr::new(
        config
            .server
            .listen_addr
            .parse()
            .context("Invalid server.listen_addr")?,
        config.server.port,
    );

    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind to {}", addr))?;

    info!("Listening on {}", addr);

    // Run server
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async {
        let _ = signal::ctrl_c().await;
        info!("Shutdown signal received");
    })
    .await
    .context("Server error")?;

    sweeper.shutdown().await;
    info!("Shutting down...");
    Ok(())
}

fn init_logging(log: &LogConfig) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&log.level));

    let registry = tracing_subscriber::registry().with(filter);
    match log.format {
        LogFormat::Json => registry
            .with(tracing_subscriber::fmt::layer().json().with_current_span(true))
            .init(),
        LogFormat::Text => registry.with(tracing_subscriber::fmt::layer()).init(),
    }
}

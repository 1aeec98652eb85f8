//! Configuration for the activation server.

use anyhow::{bail, Context, Result};
use rate_limiter::RatePolicy;
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

/// Server configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,

    #[serde(default)]
    pub registry: RegistryConfig,

    pub identity: IdentityConfig,

    #[serde(default)]
    pub rate_limit: RateLimitConfig,

    #[serde(default)]
    pub activation: ActivationConfig,

    #[serde(default)]
    pub log: LogConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Bind address
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,

    #[serde(default = "default_port")]
    pub port: u16,

    /// Take the client IP from X-Forwarded-For / X-Real-IP. Only enable
    /// behind a proxy that overwrites these headers.
    #[serde(default)]
    pub trust_forwarded_headers: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RegistryConfig {
    /// Encrypted snapshot file
    #[serde(default = "default_registry_path")]
    pub path: PathBuf,

    /// Write snapshots to `path`; when off, registrations live in memory only
    #[serde(default = "default_true")]
    pub persist: bool,

    /// Secret the snapshot encryption key is derived from
    #[serde(default)]
    pub encryption_key: Option<SecretString>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct IdentityConfig {
    /// Identity provider base URL
    pub base_url: String,

    /// Service-role key for the admin API
    pub service_key: SecretString,

    /// Per-request timeout
    #[serde(default = "default_identity_timeout", with = "humantime_serde")]
    pub timeout: Duration,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RateLimitConfig {
    /// Global requests per minute across all clients
    #[serde(default = "default_global_rpm")]
    pub global_per_minute: u32,

    /// Activation attempts allowed per client per window
    #[serde(default = "default_activation_limit")]
    pub activation_limit: i64,

    /// Activation rate limit window
    #[serde(default = "default_activation_window", with = "humantime_serde")]
    pub activation_window: Duration,

    /// How often idle buckets are swept
    #[serde(default = "default_sweep_interval", with = "humantime_serde")]
    pub sweep_interval: Duration,

    /// Windows a bucket may sit idle before it is evicted
    #[serde(default = "default_idle_windows")]
    pub idle_windows: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ActivationConfig {
    /// Bound on account provisioning (ensure account + profile)
    #[serde(default = "default_provisioning_timeout", with = "humantime_serde")]
    pub provisioning_timeout: Duration,

    /// Bound on sign-in credential issuance
    #[serde(default = "default_credential_timeout", with = "humantime_serde")]
    pub credential_timeout: Duration,

    /// Bound on the identity provider health check made by `/health`
    #[serde(default = "default_health_check_timeout", with = "humantime_serde")]
    pub health_check_timeout: Duration,

    /// Redirect after activation once onboarding is complete
    #[serde(default = "default_home_path")]
    pub home_path: String,

    /// Redirect after activation while onboarding is outstanding
    #[serde(default = "default_onboarding_path")]
    pub onboarding_path: String,

    /// Redirect when the user must sign in manually
    #[serde(default = "default_sign_in_path")]
    pub sign_in_path: String,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LogConfig {
    /// Default filter directive, overridden by `RUST_LOG`
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Output format
    #[serde(default)]
    pub format: LogFormat,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
            port: default_port(),
            trust_forwarded_headers: false,
        }
    }
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            path: default_registry_path(),
            persist: true,
            encryption_key: None,
        }
    }
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            global_per_minute: default_global_rpm(),
            activation_limit: default_activation_limit(),
            activation_window: default_activation_window(),
            sweep_interval: default_sweep_interval(),
            idle_windows: default_idle_windows(),
        }
    }
}

impl Default for ActivationConfig {
    fn default() -> Self {
        Self {
            provisioning_timeout: default_provisioning_timeout(),
            credential_timeout: default_credential_timeout(),
            health_check_timeout: default_health_check_timeout(),
            home_path: default_home_path(),
            onboarding_path: default_onboarding_path(),
            sign_in_path: default_sign_in_path(),
        }
    }
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: LogFormat::default(),
        }
    }
}

fn default_listen_addr() -> String {
    "0.0.0.0".into()
}

fn default_port() -> u16 {
    8081
}

fn default_registry_path() -> PathBuf {
    PathBuf::from("/data/registrations.enc")
}

fn default_true() -> bool {
    true
}

fn default_identity_timeout() -> Duration {
    Duration::from_secs(10)
}

fn default_global_rpm() -> u32 {
    600
}

fn default_activation_limit() -> i64 {
    5
}

fn default_activation_window() -> Duration {
    Duration::from_secs(3600)
}

fn default_sweep_interval() -> Duration {
    Duration::from_secs(60)
}

fn default_idle_windows() -> u32 {
    2
}

fn default_provisioning_timeout() -> Duration {
    Duration::from_secs(15)
}

fn default_credential_timeout() -> Duration {
    Duration::from_secs(10)
}

fn default_health_check_timeout() -> Duration {
    Duration::from_secs(2)
}

fn default_home_path() -> String {
    "/".into()
}

fn default_onboarding_path() -> String {
    "/onboarding".into()
}

fn default_sign_in_path() -> String {
    "/".into()
}

fn default_log_level() -> String {
    "info".into()
}

impl Config {
    /// Read configuration from the environment (and `.env`, if present).
    ///
    /// Nested keys use `__`, e.g. `IDENTITY__BASE_URL`.
    pub fn load() -> Result<Self> {
        dotenvy::dotenv().ok();

        let source = config::Config::builder()
            .add_source(
                config::Environment::default()
                    .separator("__")
                    .try_parsing(false),
            )
            .build()
            .context("Failed to build configuration")?;

        Self::from_source(source)
    }

    /// Deserialize and validate an already assembled configuration.
    pub fn from_source(source: config::Config) -> Result<Self> {
        let config: Config = source
            .try_deserialize()
            .context("Failed to deserialize configuration")?;

        config.validate()?;
        Ok(config)
    }

    /// Reject configurations the server cannot run safely with.
    pub fn validate(&self) -> Result<()> {
        self.activation_policy()?;

        if self.rate_limit.global_per_minute == 0 {
            bail!("rate_limit.global_per_minute must be greater than zero");
        }
        if self.rate_limit.sweep_interval.is_zero() {
            bail!("rate_limit.sweep_interval must be greater than zero");
        }
        if self.identity.base_url.trim().is_empty() {
            bail!("identity.base_url must be set");
        }
        if self.identity.timeout.is_zero()
            || self.activation.provisioning_timeout.is_zero()
            || self.activation.credential_timeout.is_zero()
            || self.activation.health_check_timeout.is_zero()
        {
            bail!("timeouts must be greater than zero");
        }

        if self.registry.persist {
            let has_key = self
                .registry
                .encryption_key
                .as_ref()
                .is_some_and(|key| !key.expose_secret().is_empty());
            if !has_key {
                bail!("registry.encryption_key is required when registry.persist is enabled");
            }
        }

        Ok(())
    }

    /// The per-client activation attempt policy.
    pub fn activation_policy(&self) -> Result<RatePolicy> {
        RatePolicy::new(
            self.rate_limit.activation_limit,
            self.rate_limit.activation_window,
        )
        .context("Invalid activation rate limit")
    }
}

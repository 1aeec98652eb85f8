//! Single-use activation of pending registrations.
//!
//! An attempt moves through [`AttemptStage`]s: the per-client rate limit is
//! checked, the presented token is validated against its stored digest, the
//! token is consumed with a conditional write, the account is provisioned,
//! and finally a one-time sign-in credential is issued. Everything after
//! validation runs on its own task so a disconnecting client cannot abandon
//! a consumed token half way.

mod provider;
pub mod saga;
mod steps;

pub use provider::{AccountProvisioner, CredentialIssuer};
pub use steps::{activation_saga, ActivationContext, ConsumeToken, ProvisionAccount};

use crate::audit::{AuditEvent, AuditEventType, AuditLog};
use crate::config::Config;
use crate::error::ActivationError;
use crate::registry::{hash_secret, is_well_formed_token, Registration, RegistrationStore};
use chrono::{DateTime, Utc};
use rate_limiter::{RateDecision, RateKey, RateLimiter, RatePolicy};
use saga::{Compensation, Saga, SagaOutcome};
use serde::Serialize;
use serde_json::json;
use std::net::IpAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, instrument, warn};

/// Limiter scope for activation attempts.
pub const ACTIVATION_SCOPE: &str = "activate";

const MANUAL_SIGN_IN_MESSAGE: &str =
    "Your account is active. Please sign in to continue.";

/// Progress of a single activation attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AttemptStage {
    Received,
    RateChecked,
    TokenValidated,
    TokenConsumed,
    Provisioned,
    CredentialIssued,
}

/// Tunables for the activation pipeline.
#[derive(Debug, Clone)]
pub struct ActivationSettings {
    pub policy: RatePolicy,
    pub provisioning_timeout: Duration,
    pub credential_timeout: Duration,
    /// Bound on the provider health check behind `/health`
    pub health_check_timeout: Duration,
    pub home_path: String,
    pub onboarding_path: String,
    pub sign_in_path: String,
}

impl ActivationSettings {
    pub fn from_config(config: &Config) -> anyhow::Result<Self> {
        Ok(Self {
            policy: config.activation_policy()?,
            provisioning_timeout: config.activation.provisioning_timeout,
            credential_timeout: config.activation.credential_timeout,
            health_check_timeout: config.activation.health_check_timeout,
            home_path: config.activation.home_path.clone(),
            onboarding_path: config.activation.onboarding_path.clone(),
            sign_in_path: config.activation.sign_in_path.clone(),
        })
    }
}

impl Default for ActivationSettings {
    fn default() -> Self {
        Self {
            policy: RatePolicy {
                limit: 5,
                window: Duration::from_secs(3600),
            },
            provisioning_timeout: Duration::from_secs(15),
            credential_timeout: Duration::from_secs(10),
            health_check_timeout: Duration::from_secs(2),
            home_path: "/".into(),
            onboarding_path: "/onboarding".into(),
            sign_in_path: "/".into(),
        }
    }
}

/// One activation attempt as received from a client.
#[derive(Debug, Clone)]
pub struct ActivationRequest {
    pub token: String,
    pub client_ip: IpAddr,
    pub user_agent: Option<String>,
}

/// Successful activation.
#[derive(Debug, Clone)]
pub struct ActivationOutcome {
    /// One-time sign-in link; absent when the user must sign in manually
    pub credential: Option<String>,
    pub redirect: String,
    pub message: Option<String>,
    /// The limiter decision that admitted this attempt
    pub rate: RateDecision,
    /// Furthest stage reached
    pub stage: AttemptStage,
}

/// Result of matching a presented token against the registry.
enum TokenMatch {
    /// Live token, activation may proceed
    Live {
        registration: Registration,
        token_hash: String,
    },
    /// Token already used for a completed activation
    Activated(Registration),
}

/// Orchestrates activation attempts.
#[derive(Clone)]
pub struct ActivationService {
    inner: Arc<Inner>,
}

struct Inner {
    store: Arc<dyn RegistrationStore>,
    limiter: Arc<RateLimiter>,
    provisioner: Arc<dyn AccountProvisioner>,
    issuer: Arc<dyn CredentialIssuer>,
    audit: AuditLog,
    settings: ActivationSettings,
    saga: Saga<ActivationContext>,
    rollback_failures: AtomicU64,
}

impl ActivationService {
    pub fn new(
        store: Arc<dyn RegistrationStore>,
        limiter: Arc<RateLimiter>,
        provisioner: Arc<dyn AccountProvisioner>,
        issuer: Arc<dyn CredentialIssuer>,
        audit: AuditLog,
        settings: ActivationSettings,
    ) -> Self {
        let saga = activation_saga(
            store.clone(),
            provisioner.clone(),
            settings.provisioning_timeout,
        );

        Self {
            inner: Arc::new(Inner {
                store,
                limiter,
                provisioner,
                issuer,
                audit,
                settings,
                saga,
                rollback_failures: AtomicU64::new(0),
            }),
        }
    }

    pub fn store(&self) -> &Arc<dyn RegistrationStore> {
        &self.inner.store
    }

    pub fn limiter(&self) -> &Arc<RateLimiter> {
        &self.inner.limiter
    }

    /// Rollbacks that could not restore a token since startup. Each one is a
    /// stranded registration that needs operator attention.
    pub fn rollback_failures(&self) -> u64 {
        self.inner.rollback_failures.load(Ordering::Relaxed)
    }

    /// Check the identity provider; a check that does not answer in time
    /// counts as unhealthy.
    pub async fn provider_healthy(&self) -> bool {
        let timeout = self.inner.settings.health_check_timeout;
        match tokio::time::timeout(timeout, self.inner.provisioner.healthy()).await {
            Ok(healthy) => healthy,
            Err(_) => {
                warn!(?timeout, "Identity provider health check timed out");
                false
            }
        }
    }

    /// Activate the registration identified by `request.token`.
    #[instrument(skip(self, request), fields(client_ip = %request.client_ip))]
    pub async fn activate(
        &self,
        request: ActivationRequest,
    ) -> Result<ActivationOutcome, ActivationError> {
        let key = RateKey::client_ip(ACTIVATION_SCOPE, request.client_ip);
        let decision = self
            .inner
            .limiter
            .check_policy(key.as_str(), &self.inner.settings.policy);
        let now = self.inner.limiter.now();

        if !decision.allowed {
            let retry_after_secs = decision.retry_after_secs(now).max(1);
            info!(key = %key, retry_after_secs, "Activation rate limit exceeded");
            self.audit(
                &request,
                AuditEventType::RateLimitExceeded,
                None,
                json!({
                    "scope": ACTIVATION_SCOPE,
                    "limit": decision.limit,
                    "reset_at": decision.reset_at,
                }),
                now,
            );
            return Err(ActivationError::RateLimited {
                decision,
                retry_after_secs,
            });
        }

        self.audit(
            &request,
            AuditEventType::ActivationAttempted,
            None,
            json!({ "remaining": decision.remaining }),
            now,
        );

        // From here on the attempt runs to completion on its own task.
        let service = self.clone();
        let attempt = tokio::spawn(async move {
            service.run_attempt(request, decision, now).await
        });

        match attempt.await {
            Ok(result) => result,
            Err(e) => {
                error!(error = %e, "Activation task failed");
                Err(ActivationError::Internal(format!("activation task failed: {}", e)))
            }
        }
    }

    async fn run_attempt(
        &self,
        request: ActivationRequest,
        decision: RateDecision,
        now: DateTime<Utc>,
    ) -> Result<ActivationOutcome, ActivationError> {
        match self.validate(&request.token, now).await {
            Ok(TokenMatch::Live {
                registration,
                token_hash,
            }) => {
                self.consume_and_provision(&request, registration, token_hash, decision, now)
                    .await
            }
            Ok(TokenMatch::Activated(registration)) => Ok(self
                .already_activated(&request, &registration, decision, now)
                .await),
            Err((error, subject)) => {
                self.audit_failure(&request, subject.as_deref(), &error, now);
                Err(error)
            }
        }
    }

    /// Match the presented token. Every way a token can be unusable yields
    /// the same error, except a lost race which is reported as consumed.
    async fn validate(
        &self,
        token: &str,
        now: DateTime<Utc>,
    ) -> Result<TokenMatch, (ActivationError, Option<String>)> {
        if !is_well_formed_token(token) {
            return Err((ActivationError::InvalidToken, None));
        }

        let token_hash = hash_secret(token);
        let registration = self
            .inner
            .store
            .find_by_token_hash(&token_hash)
            .await
            .map_err(|e| (e, None))?
            .ok_or((ActivationError::InvalidToken, None))?;

        let subject = Some(registration.id.clone());

        if !registration.link_unexpired_at(now) {
            return Err((ActivationError::InvalidToken, subject));
        }

        let live = registration.activation_token_hash.as_deref() == Some(token_hash.as_str());
        match (live, registration.is_activated()) {
            (true, false) => Ok(TokenMatch::Live {
                registration,
                token_hash,
            }),
            (false, true) => Ok(TokenMatch::Activated(registration)),
            // Consumed but not yet activated: another attempt is in flight.
            (false, false) => Err((ActivationError::AlreadyConsumed, subject)),
            (true, true) => Err((ActivationError::InvalidToken, subject)),
        }
    }

    async fn consume_and_provision(
        &self,
        request: &ActivationRequest,
        registration: Registration,
        token_hash: String,
        decision: RateDecision,
        now: DateTime<Utc>,
    ) -> Result<ActivationOutcome, ActivationError> {
        let registration_id = registration.id.clone();
        let mut ctx = ActivationContext::new(registration, token_hash, now);

        match self.inner.saga.run(&mut ctx).await {
            SagaOutcome::Completed => {}
            SagaOutcome::Failed {
                step,
                error,
                compensation,
            } => {
                return Err(self.saga_failed(request, &registration_id, step, error, compensation, now));
            }
        }

        let account_id = ctx.account_id.clone().unwrap_or_default();
        let redirect = self.redirect_for(&account_id).await;

        let (credential, message, stage) = match self
            .issue_credential(&ctx.registration.email, &redirect)
            .await
        {
            Ok(link) => (Some(link), None, AttemptStage::CredentialIssued),
            Err(e) => {
                warn!(registration_id = %registration_id, error = %e, "Credential issuance failed, falling back to manual sign-in");
                self.audit(
                    request,
                    AuditEventType::CredentialIssuanceDegraded,
                    Some(&registration_id),
                    json!({ "error": e.to_string() }),
                    now,
                );
                (None, Some(MANUAL_SIGN_IN_MESSAGE.to_string()), AttemptStage::Provisioned)
            }
        };

        let redirect = if credential.is_some() {
            redirect
        } else {
            self.inner.settings.sign_in_path.clone()
        };

        info!(registration_id = %registration_id, "Registration activated");
        self.audit(
            request,
            AuditEventType::ActivationSucceeded,
            Some(&registration_id),
            json!({
                "credential_issued": credential.is_some(),
                "redirect": redirect,
            }),
            now,
        );

        Ok(ActivationOutcome {
            credential,
            redirect,
            message,
            rate: decision,
            stage,
        })
    }

    fn saga_failed(
        &self,
        request: &ActivationRequest,
        registration_id: &str,
        step: &'static str,
        error: ActivationError,
        compensation: Compensation,
        now: DateTime<Utc>,
    ) -> ActivationError {
        match compensation {
            Compensation::NotRequired => {
                self.audit_failure(request, Some(registration_id), &error, now);
                error
            }
            Compensation::Applied => {
                warn!(registration_id = %registration_id, step, error = %error, "Activation rolled back, token restored");
                self.audit(
                    request,
                    AuditEventType::ActivationRolledBack,
                    Some(registration_id),
                    json!({ "step": step, "error": error.to_string() }),
                    now,
                );
                self.audit_failure(request, Some(registration_id), &error, now);
                error
            }
            Compensation::Failed(rollback_error) => {
                self.inner.rollback_failures.fetch_add(1, Ordering::Relaxed);
                error!(
                    alert = true,
                    registration_id = %registration_id,
                    step,
                    error = %error,
                    rollback_error = %rollback_error,
                    "Activation rollback failed, registration is stranded"
                );
                self.audit(
                    request,
                    AuditEventType::ActivationRollbackFailed,
                    Some(registration_id),
                    json!({
                        "step": step,
                        "error": error.to_string(),
                        "rollback_error": rollback_error.to_string(),
                    }),
                    now,
                );
                let error = ActivationError::RollbackFailed(format!(
                    "{} (rollback: {})",
                    error, rollback_error
                ));
                self.audit_failure(request, Some(registration_id), &error, now);
                error
            }
        }
    }

    /// A token that already completed activation: report success again
    /// without touching anything.
    async fn already_activated(
        &self,
        request: &ActivationRequest,
        registration: &Registration,
        decision: RateDecision,
        now: DateTime<Utc>,
    ) -> ActivationOutcome {
        let account_id = registration.account_id.clone().unwrap_or_default();
        let redirect = self.redirect_for(&account_id).await;

        info!(registration_id = %registration.id, "Registration already activated");
        self.audit(
            request,
            AuditEventType::ActivationSucceeded,
            Some(&registration.id),
            json!({ "already_activated": true, "redirect": redirect }),
            now,
        );

        ActivationOutcome {
            credential: None,
            redirect,
            message: None,
            rate: decision,
            stage: AttemptStage::Provisioned,
        }
    }

    /// Onboarding path until the profile says onboarding is done.
    async fn redirect_for(&self, account_id: &str) -> String {
        let settings = &self.inner.settings;
        if account_id.is_empty() {
            return settings.onboarding_path.clone();
        }

        let completed = tokio::time::timeout(
            settings.credential_timeout,
            self.inner.provisioner.onboarding_completed(account_id),
        )
        .await;

        match completed {
            Ok(Ok(true)) => settings.home_path.clone(),
            Ok(Ok(false)) => settings.onboarding_path.clone(),
            Ok(Err(e)) => {
                warn!(error = %e, "Could not read onboarding state");
                settings.onboarding_path.clone()
            }
            Err(_) => {
                warn!("Timed out reading onboarding state");
                settings.onboarding_path.clone()
            }
        }
    }

    async fn issue_credential(
        &self,
        email: &str,
        redirect: &str,
    ) -> Result<String, ActivationError> {
        let timeout = self.inner.settings.credential_timeout;
        match tokio::time::timeout(timeout, self.inner.issuer.issue_sign_in_link(email, redirect)).await {
            Ok(Ok(link)) => Ok(link),
            Ok(Err(e)) => Err(ActivationError::CredentialIssuance(e.to_string())),
            Err(_) => Err(ActivationError::CredentialIssuance(format!(
                "timed out after {:?}",
                timeout
            ))),
        }
    }

    fn audit_failure(
        &self,
        request: &ActivationRequest,
        subject: Option<&str>,
        error: &ActivationError,
        now: DateTime<Utc>,
    ) {
        if error.is_client_error() {
            info!(reason = error.reason(), "Activation rejected");
        } else {
            error!(reason = error.reason(), error = %error, "Activation failed");
        }

        let mut metadata = json!({ "reason": error.reason() });
        if !error.is_client_error() {
            metadata["detail"] = json!(error.to_string());
        }
        self.audit(request, AuditEventType::ActivationFailed, subject, metadata, now);
    }

    fn audit(
        &self,
        request: &ActivationRequest,
        event_type: AuditEventType,
        subject: Option<&str>,
        metadata: serde_json::Value,
        now: DateTime<Utc>,
    ) {
        let mut event = AuditEvent::new(event_type, now)
            .client(Some(request.client_ip.to_string()), request.user_agent.clone())
            .metadata(metadata);
        if let Some(id) = subject {
            event = event.subject(id);
        }
        self.inner.audit.record(event);
    }
}

//! The activation saga: consume the token, then provision the account.

use super::provider::AccountProvisioner;
use super::saga::{Saga, SagaStep};
use crate::error::ActivationError;
use crate::registry::{Registration, RegistrationStore};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, instrument, warn};

/// State threaded through the activation saga.
#[derive(Debug, Clone)]
pub struct ActivationContext {
    pub registration: Registration,
    pub token_hash: String,
    pub now: DateTime<Utc>,
    /// Set once the account exists at the identity provider
    pub account_id: Option<String>,
}

impl ActivationContext {
    pub fn new(registration: Registration, token_hash: String, now: DateTime<Utc>) -> Self {
        Self {
            registration,
            token_hash,
            now,
            account_id: None,
        }
    }
}

/// Build the saga for one activation.
pub fn activation_saga(
    store: Arc<dyn RegistrationStore>,
    provisioner: Arc<dyn AccountProvisioner>,
    provisioning_timeout: Duration,
) -> Saga<ActivationContext> {
    Saga::new()
        .step(ConsumeToken {
            store: store.clone(),
        })
        .step(ProvisionAccount {
            store,
            provisioner,
            timeout: provisioning_timeout,
        })
}

/// Clear the live token with a conditional write. Losing the race is
/// terminal and leaves nothing to undo.
pub struct ConsumeToken {
    store: Arc<dyn RegistrationStore>,
}

#[async_trait]
impl SagaStep<ActivationContext> for ConsumeToken {
    fn name(&self) -> &'static str {
        "consume_token"
    }

    #[instrument(skip_all, fields(registration_id = %ctx.registration.id))]
    async fn execute(&self, ctx: &mut ActivationContext) -> Result<(), ActivationError> {
        let consumed = self
            .store
            .compare_and_swap_token(&ctx.registration.id, Some(&ctx.token_hash), None)
            .await?;

        if !consumed {
            info!("Token already consumed by a concurrent request");
            return Err(ActivationError::AlreadyConsumed);
        }
        Ok(())
    }
}

/// Create the account and profile, then mark the registration activated.
///
/// Compensation puts the consumed token back so the same link can be
/// retried. Nothing at the identity provider is undone: both writes are
/// idempotent and the retry repeats them.
pub struct ProvisionAccount {
    store: Arc<dyn RegistrationStore>,
    provisioner: Arc<dyn AccountProvisioner>,
    timeout: Duration,
}

impl ProvisionAccount {
    async fn bounded<T, F>(&self, call: &str, fut: F) -> Result<T, ActivationError>
    where
        F: Future<Output = Result<T, identity_client::IdentityError>> + Send,
    {
        match tokio::time::timeout(self.timeout, fut).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e)) if e.is_ambiguous() => {
                warn!(call, error = %e, ambiguous = true, "Provider outcome unknown");
                Err(ActivationError::Provisioning(format!(
                    "{}: {} (outcome unknown)",
                    call, e
                )))
            }
            Ok(Err(e)) => Err(ActivationError::Provisioning(format!("{}: {}", call, e))),
            // The provider may still apply the request after we stop waiting.
            Err(_) => Err(ActivationError::Provisioning(format!(
                "{}: timed out after {:?} (outcome unknown)",
                call, self.timeout
            ))),
        }
    }
}

#[async_trait]
impl SagaStep<ActivationContext> for ProvisionAccount {
    fn name(&self) -> &'static str {
        "provision_account"
    }

    #[instrument(skip_all, fields(registration_id = %ctx.registration.id))]
    async fn execute(&self, ctx: &mut ActivationContext) -> Result<(), ActivationError> {
        let registration = &ctx.registration;

        let account_id = self
            .bounded(
                "ensure_account",
                self.provisioner
                    .ensure_account(&registration.id, &registration.email),
            )
            .await?;

        self.bounded(
            "upsert_profile",
            self.provisioner
                .upsert_profile(&account_id, &registration.email, &registration.id),
        )
        .await?;

        self.store
            .mark_activated(&registration.id, &account_id, ctx.now)
            .await?;

        info!(account_id = %account_id, "Account provisioned");
        ctx.account_id = Some(account_id);
        Ok(())
    }

    fn compensates(&self) -> bool {
        true
    }

    async fn compensate(&self, ctx: &ActivationContext) -> Result<(), ActivationError> {
        let restored = self
            .store
            .compare_and_swap_token(&ctx.registration.id, None, Some(&ctx.token_hash))
            .await
            .map_err(|e| ActivationError::RollbackFailed(e.to_string()))?;

        if restored {
            Ok(())
        } else {
            Err(ActivationError::RollbackFailed(
                "token slot changed before it could be restored".into(),
            ))
        }
    }
}

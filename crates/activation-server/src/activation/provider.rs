//! Downstream identity provider seams used by activation.

use async_trait::async_trait;
use identity_client::{
    EnsureUserRequest, IdentityClient, IdentityError, Profile, SignInLinkRequest,
};

/// Creates the durable account and profile for an activated registration.
///
/// Both writes are keyed so that repeating them is harmless.
#[async_trait]
pub trait AccountProvisioner: Send + Sync {
    /// Create or fetch the verified account; returns its id.
    async fn ensure_account(&self, registration_id: &str, email: &str)
        -> Result<String, IdentityError>;

    async fn upsert_profile(
        &self,
        account_id: &str,
        email: &str,
        registration_id: &str,
    ) -> Result<(), IdentityError>;

    /// Whether the account holder has finished onboarding.
    async fn onboarding_completed(&self, account_id: &str) -> Result<bool, IdentityError>;

    /// Whether the provider is reachable.
    async fn healthy(&self) -> bool {
        true
    }
}

/// Issues one-time sign-in credentials.
#[async_trait]
pub trait CredentialIssuer: Send + Sync {
    async fn issue_sign_in_link(&self, email: &str, redirect_to: &str)
        -> Result<String, IdentityError>;
}

#[async_trait]
impl AccountProvisioner for IdentityClient {
    async fn ensure_account(
        &self,
        registration_id: &str,
        email: &str,
    ) -> Result<String, IdentityError> {
        let user = self
            .ensure_user(&EnsureUserRequest::verified(registration_id, email))
            .await?;
        Ok(user.id)
    }

    async fn upsert_profile(
        &self,
        account_id: &str,
        email: &str,
        registration_id: &str,
    ) -> Result<(), IdentityError> {
        IdentityClient::upsert_profile(
            self,
            &Profile::for_registration(account_id, email, registration_id),
        )
        .await?;
        Ok(())
    }

    async fn onboarding_completed(&self, account_id: &str) -> Result<bool, IdentityError> {
        Ok(self
            .get_profile(account_id)
            .await?
            .map(|profile| profile.onboarding_completed)
            .unwrap_or(false))
    }

    async fn healthy(&self) -> bool {
        self.health_check().await
    }
}

#[async_trait]
impl CredentialIssuer for IdentityClient {
    async fn issue_sign_in_link(
        &self,
        email: &str,
        redirect_to: &str,
    ) -> Result<String, IdentityError> {
        let link = self
            .generate_sign_in_link(&SignInLinkRequest::magic_link(email, redirect_to))
            .await?;
        Ok(link.action_link)
    }
}

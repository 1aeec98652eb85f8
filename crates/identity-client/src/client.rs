//! Hosted identity provider HTTP client.

use crate::error::IdentityError;
use crate::types::*;
use reqwest::{Client, RequestBuilder, StatusCode};
use secrecy::{ExposeSecret, SecretString};
use std::time::Duration;
use tracing::{debug, instrument, warn};
use urlencoding::encode;

/// Identity provider admin API client.
///
/// The service key is stored using `SecretString` to prevent accidental
/// exposure in logs or debug output. Every request is bounded by the
/// timeout given at construction; nothing is retried here.
#[derive(Clone)]
pub struct IdentityClient {
    client: Client,
    base_url: String,
    service_key: SecretString,
}

impl IdentityClient {
    /// Create a new identity provider client.
    pub fn new(
        base_url: impl Into<String>,
        service_key: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self, IdentityError> {
        let client = Client::builder().timeout(timeout).build()?;

        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            service_key: SecretString::new(service_key.into()),
        })
    }

    /// Create the verified user for `request.external_id`, or return the
    /// existing one. Safe to repeat.
    #[instrument(skip(self, request), fields(external_id = %request.external_id))]
    pub async fn ensure_user(&self, request: &EnsureUserRequest) -> Result<User, IdentityError> {
        let url = format!(
            "{}/admin/users/{}",
            self.base_url,
            encode(&request.external_id)
        );

        let response = self
            .authorized(self.client.put(url))
            .json(request)
            .send()
            .await
            .map_err(map_send_error)?;

        self.handle_response(response).await
    }

    /// Insert or replace the profile row for `profile.user_id`.
    #[instrument(skip(self, profile), fields(user_id = %profile.user_id))]
    pub async fn upsert_profile(&self, profile: &Profile) -> Result<Profile, IdentityError> {
        let url = format!("{}/rest/profiles/{}", self.base_url, encode(&profile.user_id));

        let response = self
            .authorized(self.client.put(url))
            .header("Prefer", "resolution=merge-duplicates")
            .json(profile)
            .send()
            .await
            .map_err(map_send_error)?;

        self.handle_response(response).await
    }

    /// Fetch the profile row, `None` if the user has none yet.
    #[instrument(skip(self))]
    pub async fn get_profile(&self, user_id: &str) -> Result<Option<Profile>, IdentityError> {
        let url = format!("{}/rest/profiles/{}", self.base_url, encode(user_id));

        let response = self
            .authorized(self.client.get(url))
            .send()
            .await
            .map_err(map_send_error)?;

        if response.status() == StatusCode::NOT_FOUND {
            debug!("No profile found");
            return Ok(None);
        }

        self.handle_response(response).await.map(Some)
    }

    /// Generate a one-time sign-in link.
    #[instrument(skip(self, request))]
    pub async fn generate_sign_in_link(
        &self,
        request: &SignInLinkRequest,
    ) -> Result<SignInLink, IdentityError> {
        let response = self
            .authorized(self.client.post(format!("{}/admin/generate_link", self.base_url)))
            .json(request)
            .send()
            .await
            .map_err(map_send_error)?;

        let link: SignInLink = self.handle_response(response).await?;
        if link.action_link.is_empty() {
            return Err(IdentityError::InvalidResponse(
                "empty action_link in generated link".into(),
            ));
        }

        Ok(link)
    }

    /// Health check - returns true if the provider is reachable.
    pub async fn health_check(&self) -> bool {
        self.client
            .get(format!("{}/health", self.base_url))
            .send()
            .await
            .map(|r| r.status().is_success())
            .unwrap_or(false)
    }

    fn authorized(&self, builder: RequestBuilder) -> RequestBuilder {
        let key = self.service_key.expose_secret();
        builder
            .header("Authorization", format!("Bearer {}", key))
            .header("apikey", key.as_str())
    }

    /// Handle HTTP response, converting errors appropriately.
    async fn handle_response<T: serde::de::DeserializeOwned>(
        &self,
        response: reqwest::Response,
    ) -> Result<T, IdentityError> {
        let status = response.status();

        if status.is_success() {
            let body = response.text().await.map_err(map_send_error)?;
            debug!(%status, bytes = body.len(), "Identity provider response");
            serde_json::from_str(&body).map_err(IdentityError::from)
        } else {
            Err(self.extract_error(response).await)
        }
    }

    /// Extract error information from failed response.
    async fn extract_error(&self, response: reqwest::Response) -> IdentityError {
        let status = response.status();

        match status {
            StatusCode::TOO_MANY_REQUESTS => {
                warn!("Identity provider rate limit exceeded");
                IdentityError::RateLimit
            }
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
                warn!("Identity provider rejected service key");
                IdentityError::Unauthorized
            }
            _ => {
                let message = response
                    .text()
                    .await
                    .unwrap_or_else(|_| "Unknown error".into());
                IdentityError::Api {
                    status: status.as_u16(),
                    message,
                }
            }
        }
    }
}

fn map_send_error(e: reqwest::Error) -> IdentityError {
    if e.is_timeout() {
        IdentityError::Timeout
    } else {
        IdentityError::Http(e)
    }
}

//! Request and response types for the identity provider admin API.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Create-or-fetch a verified user, keyed by our registration id.
#[derive(Debug, Clone, Serialize)]
pub struct EnsureUserRequest {
    pub email: String,
    pub email_confirmed: bool,
    #[serde(skip)]
    pub external_id: String,
}

impl EnsureUserRequest {
    pub fn verified(external_id: impl Into<String>, email: impl Into<String>) -> Self {
        Self {
            email: email.into(),
            email_confirmed: true,
            external_id: external_id.into(),
        }
    }
}

/// A user account held by the identity provider.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct User {
    pub id: String,
    pub email: String,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
}

/// Profile row keyed by the provider's user id.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Profile {
    pub user_id: String,
    pub email: String,
    #[serde(default)]
    pub registration_id: Option<String>,
    #[serde(default)]
    pub onboarding_completed: bool,
}

impl Profile {
    pub fn for_registration(
        user_id: impl Into<String>,
        email: impl Into<String>,
        registration_id: impl Into<String>,
    ) -> Self {
        Self {
            user_id: user_id.into(),
            email: email.into(),
            registration_id: Some(registration_id.into()),
            onboarding_completed: false,
        }
    }
}

/// Kind of one-time link to generate.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LinkKind {
    Magiclink,
}

/// Request for a one-time sign-in link.
#[derive(Debug, Clone, Serialize)]
pub struct SignInLinkRequest {
    #[serde(rename = "type")]
    pub kind: LinkKind,
    pub email: String,
    pub redirect_to: String,
}

impl SignInLinkRequest {
    pub fn magic_link(email: impl Into<String>, redirect_to: impl Into<String>) -> Self {
        Self {
            kind: LinkKind::Magiclink,
            email: email.into(),
            redirect_to: redirect_to.into(),
        }
    }
}

/// Generated one-time sign-in link.
#[derive(Debug, Clone, Deserialize)]
pub struct SignInLink {
    pub action_link: String,
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
}

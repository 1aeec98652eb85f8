//! Pending registrations and their single-use activation tokens.

mod encrypted;
mod memory;
mod store;

pub use encrypted::{EncryptedStore, MemoryStore, Store};
pub use memory::{Registry, RegistryStats};
pub use store::{PersistentRegistry, RegistrationStore};

use crate::error::ActivationError;
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use chrono::{DateTime, Utc};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Upper bound on presented token length; longer input is malformed.
pub const MAX_TOKEN_LEN: usize = 256;

/// Random bytes in a generated activation token.
const TOKEN_BYTES: usize = 32;

/// Lifecycle of a registration. Transitions only move forward.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "lowercase")]
pub enum RegistrationStatus {
    /// Signed up, awaiting approval or activation
    Pending,
    /// Approved by an operator; activation link may have been sent
    Approved,
    /// Activation completed, account provisioned
    Activated,
}

impl RegistrationStatus {
    /// Whether moving from `self` to `next` keeps the lifecycle monotonic.
    pub fn can_transition_to(self, next: RegistrationStatus) -> bool {
        next > self
    }
}

/// A pending (or completed) registration.
///
/// Only the SHA-256 digest of the activation token is ever stored.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Registration {
    /// Opaque primary key
    pub id: String,

    /// Normalized (lower-cased) email, unique across the registry
    pub email: String,

    pub status: RegistrationStatus,

    /// Digest of the live activation token, if an unconsumed link exists
    pub activation_token_hash: Option<String>,

    /// Expiry of the activation link; kept after consumption
    pub activation_token_expires_at: Option<DateTime<Utc>>,

    /// Digest of the last consumed token, so a re-presented link can be recognized
    #[serde(default)]
    pub consumed_token_hash: Option<String>,

    pub activated_at: Option<DateTime<Utc>>,

    /// Identity provider user id, set on activation
    #[serde(default)]
    pub account_id: Option<String>,

    pub created_at: DateTime<Utc>,
}

impl Registration {
    /// Create a new pending registration for `email`.
    pub fn new_pending(email: &str) -> Result<Self, ActivationError> {
        let email = normalize_email(email).map_err(ActivationError::InvalidRegistration)?;

        Ok(Self {
            id: uuid::Uuid::new_v4().to_string(),
            email,
            status: RegistrationStatus::Pending,
            activation_token_hash: None,
            activation_token_expires_at: None,
            consumed_token_hash: None,
            activated_at: None,
            account_id: None,
            created_at: Utc::now(),
        })
    }

    pub fn is_activated(&self) -> bool {
        self.status == RegistrationStatus::Activated
    }

    /// Whether the activation link is still within its lifetime at `now`.
    pub fn link_unexpired_at(&self, now: DateTime<Utc>) -> bool {
        self.activation_token_expires_at
            .map(|expires_at| now < expires_at)
            .unwrap_or(false)
    }

    /// Check the activated-record invariant: activated implies a timestamp
    /// and no live token.
    pub fn is_consistent(&self) -> bool {
        if self.activation_token_hash.is_some() && self.activation_token_expires_at.is_none() {
            return false;
        }
        !self.is_activated()
            || (self.activated_at.is_some() && self.activation_token_hash.is_none())
    }
}

/// A freshly generated activation secret.
///
/// The raw value only exists long enough to be put into the activation link;
/// the registry keeps its digest.
pub struct ActivationToken(String);

impl ActivationToken {
    /// Generate 256 bits of randomness, base64url encoded.
    pub fn generate() -> Self {
        let mut bytes = [0u8; TOKEN_BYTES];
        rand::rngs::OsRng.fill_bytes(&mut bytes);
        Self(URL_SAFE_NO_PAD.encode(bytes))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn hash(&self) -> String {
        hash_secret(&self.0)
    }
}

impl fmt::Debug for ActivationToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("ActivationToken([REDACTED])")
    }
}

/// Hash a secret using SHA-256.
pub fn hash_secret(secret: &str) -> String {
    use sha2::{Digest, Sha256};
    let mut hasher = Sha256::new();
    hasher.update(secret.as_bytes());
    hex::encode(hasher.finalize())
}

/// Whether a presented token could possibly be one we issued.
pub fn is_well_formed_token(token: &str) -> bool {
    !token.is_empty()
        && token.len() <= MAX_TOKEN_LEN
        && token.chars().all(|c| c.is_ascii_graphic())
}

/// Normalize an email address: trimmed and lower-cased.
pub fn normalize_email(email: &str) -> Result<String, String> {
    let email = email.trim().to_lowercase();

    let (local, domain) = email
        .split_once('@')
        .ok_or_else(|| "Email must contain '@'".to_string())?;

    if local.is_empty() || domain.is_empty() {
        return Err("Email must have a local part and a domain".into());
    }

    if domain.contains('@') {
        return Err("Email must contain exactly one '@'".into());
    }

    if email.chars().any(char::is_whitespace) {
        return Err("Email must not contain whitespace".into());
    }

    Ok(email)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hash_secret() {
        let hash1 = hash_secret("test");
        let hash2 = hash_secret("test");
        let hash3 = hash_secret("different");

        assert_eq!(hash1, hash2);
        assert_ne!(hash1, hash3);
        assert_eq!(hash1.len(), 64); // SHA-256 produces 32 bytes = 64 hex chars
    }

    #[test]
    fn test_normalize_email() {
        assert_eq!(
            normalize_email("  Ada.Lovelace@Example.COM "),
            Ok("ada.lovelace@example.com".into())
        );
        assert!(normalize_email("no-at-sign").is_err());
        assert!(normalize_email("@example.com").is_err());
        assert!(normalize_email("ada@").is_err());
        assert!(normalize_email("a@b@c").is_err());
        assert!(normalize_email("ada lovelace@example.com").is_err());
    }

    #[test]
    fn test_generated_tokens_are_distinct_and_well_formed() {
        let a = ActivationToken::generate();
        let b = ActivationToken::generate();

        assert_ne!(a.as_str(), b.as_str());
        // 32 bytes base64url without padding
        assert_eq!(a.as_str().len(), 43);
        assert!(is_well_formed_token(a.as_str()));
        assert_eq!(a.hash(), hash_secret(a.as_str()));
        assert_eq!(format!("{:?}", a), "ActivationToken([REDACTED])");
    }

    #[test]
    fn test_token_shape_checks() {
        assert!(is_well_formed_token("abc123"));
        assert!(is_well_formed_token("xyz"));
        assert!(!is_well_formed_token(""));
        assert!(!is_well_formed_token("has space"));
        assert!(!is_well_formed_token("tab\there"));
        assert!(!is_well_formed_token(&"a".repeat(MAX_TOKEN_LEN + 1)));
    }

    #[test]
    fn test_status_transitions_are_monotonic() {
        use RegistrationStatus::*;

        assert!(Pending.can_transition_to(Approved));
        assert!(Pending.can_transition_to(Activated));
        assert!(Approved.can_transition_to(Activated));
        assert!(!Activated.can_transition_to(Pending));
        assert!(!Approved.can_transition_to(Pending));
        assert!(!Pending.can_transition_to(Pending));
    }

    #[test]
    fn test_new_pending_registration() {
        let registration = Registration::new_pending("Ada@Example.com").unwrap();

        assert_eq!(registration.email, "ada@example.com");
        assert_eq!(registration.status, RegistrationStatus::Pending);
        assert!(registration.activation_token_hash.is_none());
        assert!(registration.is_consistent());
        assert!(!registration.link_unexpired_at(Utc::now()));
    }

    #[test]
    fn test_registration_status_serialization() {
        let json = serde_json::to_string(&RegistrationStatus::Pending).unwrap();
        assert_eq!(json, "\"pending\"");

        let json = serde_json::to_string(&RegistrationStatus::Activated).unwrap();
        assert_eq!(json, "\"activated\"");
    }
}

//! Shared fakes and fixtures for activation tests.

#![allow(dead_code)]

use activation_server::activation::{AccountProvisioner, CredentialIssuer};
use activation_server::audit::{AuditLog, MemoryAuditSink};
use activation_server::registry::{hash_secret, RegistryStats};
use activation_server::{
    ActivationError, ActivationRequest, ActivationService, ActivationSettings, PersistentRegistry,
    Registration, RegistrationStore,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use identity_client::IdentityError;
use rate_limiter::{Clock, ManualClock, RateLimiter};
use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::Semaphore;

pub const CLIENT_IP: &str = "203.0.113.7";

/// In-process identity provider with call counters and switchable failures.
#[derive(Default)]
pub struct FakeIdentity {
    pub ensure_calls: AtomicUsize,
    pub profile_calls: AtomicUsize,
    pub link_calls: AtomicUsize,
    pub fail_ensure: AtomicBool,
    pub fail_links: AtomicBool,
    pub onboarding_done: AtomicBool,
    /// Health checks never answer
    pub stall_health: AtomicBool,
    /// When set, `ensure_account` waits for a permit
    pub gate: Option<Arc<Semaphore>>,
    accounts: Mutex<HashMap<String, String>>,
    profiles: Mutex<HashMap<String, String>>,
}

impl FakeIdentity {
    pub fn gated(gate: Arc<Semaphore>) -> Self {
        Self {
            gate: Some(gate),
            ..Self::default()
        }
    }

    pub fn accounts(&self) -> usize {
        self.accounts.lock().unwrap().len()
    }

    pub fn profiles(&self) -> usize {
        self.profiles.lock().unwrap().len()
    }
}

#[async_trait]
impl AccountProvisioner for FakeIdentity {
    async fn ensure_account(
        &self,
        registration_id: &str,
        _email: &str,
    ) -> Result<String, IdentityError> {
        self.ensure_calls.fetch_add(1, Ordering::SeqCst);

        if let Some(gate) = &self.gate {
            gate.acquire().await.unwrap().forget();
        }

        if self.fail_ensure.load(Ordering::SeqCst) {
            return Err(IdentityError::Api {
                status: 500,
                message: "account store unavailable".into(),
            });
        }

        let mut accounts = self.accounts.lock().unwrap();
        let id = accounts
            .entry(registration_id.to_string())
            .or_insert_with(|| format!("acct-{}", registration_id))
            .clone();
        Ok(id)
    }

    async fn upsert_profile(
        &self,
        account_id: &str,
        email: &str,
        _registration_id: &str,
    ) -> Result<(), IdentityError> {
        self.profile_calls.fetch_add(1, Ordering::SeqCst);
        self.profiles
            .lock()
            .unwrap()
            .insert(account_id.to_string(), email.to_string());
        Ok(())
    }

    async fn onboarding_completed(&self, _account_id: &str) -> Result<bool, IdentityError> {
        Ok(self.onboarding_done.load(Ordering::SeqCst))
    }

    async fn healthy(&self) -> bool {
        if self.stall_health.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
        true
    }
}

#[async_trait]
impl CredentialIssuer for FakeIdentity {
    async fn issue_sign_in_link(
        &self,
        email: &str,
        redirect_to: &str,
    ) -> Result<String, IdentityError> {
        let n = self.link_calls.fetch_add(1, Ordering::SeqCst);

        if self.fail_links.load(Ordering::SeqCst) {
            return Err(IdentityError::Timeout);
        }
        Ok(format!(
            "https://id.example.com/verify?email={}&next={}&n={}",
            email, redirect_to, n
        ))
    }
}

/// Store wrapper that refuses to restore tokens, so rollbacks fail.
pub struct NoRestoreStore {
    pub inner: PersistentRegistry,
}

#[async_trait]
impl RegistrationStore for NoRestoreStore {
    async fn insert(&self, registration: Registration) -> Result<(), ActivationError> {
        self.inner.insert(registration).await
    }

    async fn get(&self, id: &str) -> Result<Option<Registration>, ActivationError> {
        self.inner.get(id).await
    }

    async fn find_by_token_hash(
        &self,
        token_hash: &str,
    ) -> Result<Option<Registration>, ActivationError> {
        self.inner.find_by_token_hash(token_hash).await
    }

    async fn approve(&self, id: &str) -> Result<(), ActivationError> {
        self.inner.approve(id).await
    }

    async fn attach_token(
        &self,
        id: &str,
        token_hash: &str,
        expires_at: DateTime<Utc>,
    ) -> Result<(), ActivationError> {
        self.inner.attach_token(id, token_hash, expires_at).await
    }

    async fn compare_and_swap_token(
        &self,
        id: &str,
        expected: Option<&str>,
        new: Option<&str>,
    ) -> Result<bool, ActivationError> {
        if new.is_some() {
            return Err(ActivationError::Storage("disk full".into()));
        }
        self.inner.compare_and_swap_token(id, expected, new).await
    }

    async fn mark_activated(
        &self,
        id: &str,
        account_id: &str,
        at: DateTime<Utc>,
    ) -> Result<(), ActivationError> {
        self.inner.mark_activated(id, account_id, at).await
    }

    async fn stats(&self) -> Result<RegistryStats, ActivationError> {
        self.inner.stats().await
    }
}

/// An activation service wired to fakes and a manual clock.
pub struct Harness {
    pub service: ActivationService,
    pub store: Arc<dyn RegistrationStore>,
    pub identity: Arc<FakeIdentity>,
    pub audit: MemoryAuditSink,
    pub clock: ManualClock,
}

impl Harness {
    pub fn new() -> Self {
        Self::with(FakeIdentity::default(), ActivationSettings::default())
    }

    pub fn with(identity: FakeIdentity, settings: ActivationSettings) -> Self {
        Self::with_store(
            Arc::new(PersistentRegistry::in_memory()),
            identity,
            settings,
        )
    }

    pub fn with_store(
        store: Arc<dyn RegistrationStore>,
        identity: FakeIdentity,
        settings: ActivationSettings,
    ) -> Self {
        let clock = ManualClock::default();
        let identity = Arc::new(identity);
        let audit = MemoryAuditSink::new();
        let limiter = Arc::new(RateLimiter::new(Arc::new(clock.clone())));

        let service = ActivationService::new(
            store.clone(),
            limiter,
            identity.clone(),
            identity.clone(),
            AuditLog::new(Arc::new(audit.clone())),
            settings,
        );

        Self {
            service,
            store,
            identity,
            audit,
            clock,
        }
    }

    /// Insert an approved registration whose link is `token`, valid for `ttl`.
    pub async fn seed(&self, email: &str, token: &str, ttl: chrono::Duration) -> String {
        let registration = Registration::new_pending(email).unwrap();
        let id = registration.id.clone();
        self.store.insert(registration).await.unwrap();
        self.store.approve(&id).await.unwrap();
        self.store
            .attach_token(&id, &hash_secret(token), self.clock.now() + ttl)
            .await
            .unwrap();
        id
    }

    pub async fn registration(&self, id: &str) -> Registration {
        self.store.get(id).await.unwrap().unwrap()
    }
}

/// Settings with a limit high enough not to interfere.
pub fn unlimited_settings() -> ActivationSettings {
    let mut settings = ActivationSettings::default();
    settings.policy.limit = 10_000;
    settings
}

pub fn request(token: &str) -> ActivationRequest {
    request_from(token, CLIENT_IP.parse().unwrap())
}

pub fn request_from(token: &str, client_ip: IpAddr) -> ActivationRequest {
    ActivationRequest {
        token: token.to_string(),
        client_ip,
        user_agent: Some("integration-test".into()),
    }
}

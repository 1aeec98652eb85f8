//! Shared, persisted access to the registry.

use super::{Registration, Registry, RegistryStats, Store};
use crate::error::ActivationError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;
use tracing::{debug, error};

/// Registration storage used by the activation pipeline.
///
/// `compare_and_swap_token` is the only way to consume or restore a token;
/// implementations must make it atomic with respect to concurrent callers.
#[async_trait]
pub trait RegistrationStore: Send + Sync {
    async fn insert(&self, registration: Registration) -> Result<(), ActivationError>;

    async fn get(&self, id: &str) -> Result<Option<Registration>, ActivationError>;

    /// Look up a registration by live or consumed token digest.
    async fn find_by_token_hash(
        &self,
        token_hash: &str,
    ) -> Result<Option<Registration>, ActivationError>;

    async fn approve(&self, id: &str) -> Result<(), ActivationError>;

    async fn attach_token(
        &self,
        id: &str,
        token_hash: &str,
        expires_at: DateTime<Utc>,
    ) -> Result<(), ActivationError>;

    /// Swap the live token digest from `expected` to `new`. `Ok(false)`
    /// means another writer got there first.
    async fn compare_and_swap_token(
        &self,
        id: &str,
        expected: Option<&str>,
        new: Option<&str>,
    ) -> Result<bool, ActivationError>;

    async fn mark_activated(
        &self,
        id: &str,
        account_id: &str,
        at: DateTime<Utc>,
    ) -> Result<(), ActivationError>;

    async fn stats(&self) -> Result<RegistryStats, ActivationError>;
}

/// Registry guarded by a lock and written through to a [`Store`].
///
/// Writes are persisted while the write lock is held. If the snapshot
/// cannot be saved the in-memory change is reverted and the error returned,
/// so memory never runs ahead of disk.
pub struct PersistentRegistry {
    registry: RwLock<Registry>,
    store: Store,
}

impl PersistentRegistry {
    pub fn new(registry: Registry, store: Store) -> Self {
        Self {
            registry: RwLock::new(registry),
            store,
        }
    }

    /// Load the last snapshot from `store`.
    pub async fn load(store: Store) -> Result<Self, ActivationError> {
        let registry = store.load().await?;
        Ok(Self::new(registry, store))
    }

    /// Non-persisted registry, for tests.
    pub fn in_memory() -> Self {
        Self::new(Registry::new(), Store::memory())
    }

    /// Apply `op` to the record `id` and persist if it changed anything.
    async fn mutate<T, F>(&self, id: &str, op: F) -> Result<T, ActivationError>
    where
        F: FnOnce(&mut Registry) -> Result<T, ActivationError> + Send,
        T: Send,
    {
        let mut registry = self.registry.write().await;
        let previous = registry.get(id).cloned();

        let value = op(&mut registry)?;

        if registry.get(id) == previous.as_ref() {
            return Ok(value);
        }

        if let Err(e) = self.store.save(&registry).await {
            error!(registration_id = %id, error = %e, "Failed to persist registry, reverting");
            registry.restore(id, previous);
            return Err(e);
        }

        debug!(registration_id = %id, "Registry persisted");
        Ok(value)
    }
}

#[async_trait]
impl RegistrationStore for PersistentRegistry {
    async fn insert(&self, registration: Registration) -> Result<(), ActivationError> {
        let id = registration.id.clone();
        self.mutate(&id, move |registry| registry.insert(registration))
            .await
    }

    async fn get(&self, id: &str) -> Result<Option<Registration>, ActivationError> {
        Ok(self.registry.read().await.get(id).cloned())
    }

    async fn find_by_token_hash(
        &self,
        token_hash: &str,
    ) -> Result<Option<Registration>, ActivationError> {
        Ok(self
            .registry
            .read()
            .await
            .find_by_token_hash(token_hash)
            .cloned())
    }

    async fn approve(&self, id: &str) -> Result<(), ActivationError> {
        self.mutate(id, |registry| registry.approve(id)).await
    }

    async fn attach_token(
        &self,
        id: &str,
        token_hash: &str,
        expires_at: DateTime<Utc>,
    ) -> Result<(), ActivationError> {
        self.mutate(id, |registry| {
            registry.attach_token(id, token_hash, expires_at)
        })
        .await
    }

    async fn compare_and_swap_token(
        &self,
        id: &str,
        expected: Option<&str>,
        new: Option<&str>,
    ) -> Result<bool, ActivationError> {
        self.mutate(id, |registry| {
            Ok(registry.compare_and_swap_token(id, expected, new))
        })
        .await
    }

    async fn mark_activated(
        &self,
        id: &str,
        account_id: &str,
        at: DateTime<Utc>,
    ) -> Result<(), ActivationError> {
        self.mutate(id, |registry| registry.mark_activated(id, account_id, at))
            .await
    }

    async fn stats(&self) -> Result<RegistryStats, ActivationError> {
        Ok(self.registry.read().await.stats())
    }
}

//! Encrypted registry snapshots on disk.
//!
//! A snapshot is the JSON form of the whole [`Registry`], sealed with
//! AES-256-GCM. Layout: `[version: 1][nonce: 12][ciphertext + tag]`.

use super::Registry;
use crate::error::ActivationError;
use aes_gcm::{
    aead::{Aead, KeyInit},
    Aes256Gcm, Key, Nonce,
};
use rand::RngCore;
use sha2::{Digest, Sha256};
use std::path::PathBuf;
use tokio::fs;
use tracing::{debug, info, warn};

const KEY_DERIVATION_CONTEXT: &str = "activation-server/registry";

const SNAPSHOT_VERSION: u8 = 1;
const NONCE_LEN: usize = 12;
const HEADER_LEN: usize = 1 + NONCE_LEN;

/// Registry snapshot file sealed with a 256-bit key.
pub struct EncryptedStore {
    path: PathBuf,
    key: [u8; 32],
}

impl EncryptedStore {
    pub fn with_key(path: PathBuf, key: [u8; 32]) -> Self {
        Self { path, key }
    }

    /// Key the store from an operator secret. A restart with the same
    /// secret reads the previous snapshot.
    pub fn from_secret(path: PathBuf, secret: &str) -> Self {
        Self::with_key(path, derive_key(secret))
    }

    /// Replace the snapshot. Readers see either the old or the new file.
    pub async fn save(&self, registry: &Registry) -> Result<(), ActivationError> {
        let sealed = seal(&serde_json::to_vec(registry)?, &self.key)?;

        if let Some(dir) = self.path.parent() {
            fs::create_dir_all(dir).await?;
        }

        let staging = self.path.with_extension("tmp");
        fs::write(&staging, &sealed).await?;
        fs::rename(&staging, &self.path).await?;

        debug!(path = ?self.path, bytes = sealed.len(), "Registry snapshot written");
        Ok(())
    }

    /// Read the snapshot; a missing file is an empty registry.
    pub async fn load(&self) -> Result<Registry, ActivationError> {
        let sealed = match fs::read(&self.path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                info!(path = ?self.path, "No registry snapshot yet, starting empty");
                return Ok(Registry::new());
            }
            Err(e) => return Err(e.into()),
        };

        let plaintext = open(&sealed, &self.key).map_err(|e| {
            ActivationError::Encryption(format!(
                "cannot open registry snapshot ({}); was the encryption key changed?",
                e
            ))
        })?;
        let registry: Registry = serde_json::from_slice(&plaintext)?;

        info!(path = ?self.path, records = registry.count(), "Registry snapshot loaded");
        Ok(registry)
    }
}

/// Keeps nothing; every load starts empty.
pub struct MemoryStore;

impl MemoryStore {
    pub async fn save(&self, _registry: &Registry) -> Result<(), ActivationError> {
        Ok(())
    }

    pub async fn load(&self) -> Result<Registry, ActivationError> {
        Ok(Registry::new())
    }
}

/// Where registry snapshots go.
pub enum Store {
    Encrypted(EncryptedStore),
    /// Nothing survives a restart
    Memory(MemoryStore),
}

impl Store {
    pub fn encrypted(path: PathBuf, secret: &str) -> Self {
        Store::Encrypted(EncryptedStore::from_secret(path, secret))
    }

    pub fn memory() -> Self {
        warn!("Registry is not persisted; registrations are lost on restart");
        Store::Memory(MemoryStore)
    }

    pub async fn save(&self, registry: &Registry) -> Result<(), ActivationError> {
        match self {
            Store::Encrypted(store) => store.save(registry).await,
            Store::Memory(store) => store.save(registry).await,
        }
    }

    pub async fn load(&self) -> Result<Registry, ActivationError> {
        match self {
            Store::Encrypted(store) => store.load().await,
            Store::Memory(store) => store.load().await,
        }
    }
}

/// SHA-256 over the derivation context followed by the secret.
fn derive_key(secret: &str) -> [u8; 32] {
    let digest = Sha256::new()
        .chain_update(KEY_DERIVATION_CONTEXT.as_bytes())
        .chain_update(secret.as_bytes())
        .finalize();

    let mut key = [0u8; 32];
    key.copy_from_slice(&digest);
    key
}

fn seal(plaintext: &[u8], key: &[u8; 32]) -> Result<Vec<u8>, ActivationError> {
    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key));

    let mut nonce = [0u8; NONCE_LEN];
    rand::thread_rng().fill_bytes(&mut nonce);
    let ciphertext = cipher.encrypt(Nonce::from_slice(&nonce), plaintext)?;

    let mut sealed = Vec::with_capacity(HEADER_LEN + ciphertext.len());
    sealed.push(SNAPSHOT_VERSION);
    sealed.extend_from_slice(&nonce);
    sealed.extend_from_slice(&ciphertext);
    Ok(sealed)
}

fn open(sealed: &[u8], key: &[u8; 32]) -> Result<Vec<u8>, ActivationError> {
    if sealed.len() < HEADER_LEN {
        return Err(ActivationError::Encryption("snapshot truncated".into()));
    }
    if sealed[0] != SNAPSHOT_VERSION {
        return Err(ActivationError::Encryption(format!(
            "unsupported snapshot version {}",
            sealed[0]
        )));
    }

    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key));
    let nonce = Nonce::from_slice(&sealed[1..HEADER_LEN]);
    Ok(cipher.decrypt(nonce, &sealed[HEADER_LEN..])?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::Registration;
    use tempfile::TempDir;

    const KEY: [u8; 32] = [7u8; 32];

    #[test]
    fn test_seal_then_open() {
        let sealed = seal(b"registrations", &KEY).unwrap();

        assert_eq!(sealed[0], SNAPSHOT_VERSION);
        assert_eq!(sealed.len(), HEADER_LEN + b"registrations".len() + 16);
        assert_eq!(open(&sealed, &KEY).unwrap(), b"registrations");
    }

    #[test]
    fn test_open_rejects_wrong_key() {
        let sealed = seal(b"registrations", &KEY).unwrap();
        assert!(open(&sealed, &[8u8; 32]).is_err());
    }

    #[test]
    fn test_open_rejects_damaged_snapshots() {
        let sealed = seal(b"registrations", &KEY).unwrap();

        let mut flipped = sealed.clone();
        let last = flipped.len() - 1;
        flipped[last] ^= 0x01;
        assert!(open(&flipped, &KEY).is_err());

        let mut future = sealed.clone();
        future[0] = SNAPSHOT_VERSION + 1;
        assert!(open(&future, &KEY).is_err());

        assert!(open(&sealed[..HEADER_LEN - 1], &KEY).is_err());
    }

    #[test]
    fn test_same_secret_same_key() {
        assert_eq!(derive_key("secret"), derive_key("secret"));
        assert_ne!(derive_key("secret"), derive_key("other"));
    }

    #[tokio::test]
    async fn test_snapshot_survives_restart() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested").join("registrations.enc");

        let mut registry = Registry::new();
        let registration = Registration::new_pending("ada@example.com").unwrap();
        let id = registration.id.clone();
        registry.insert(registration).unwrap();

        EncryptedStore::from_secret(path.clone(), "operator-secret")
            .save(&registry)
            .await
            .unwrap();

        let on_disk = std::fs::read(&path).unwrap();
        assert!(!String::from_utf8_lossy(&on_disk).contains("ada@example.com"));
        assert!(!path.with_extension("tmp").exists());

        let reopened = EncryptedStore::from_secret(path.clone(), "operator-secret")
            .load()
            .await
            .unwrap();
        assert_eq!(reopened.get(&id), registry.get(&id));

        let rekeyed = EncryptedStore::from_secret(path, "another-secret").load().await;
        assert!(matches!(rekeyed, Err(ActivationError::Encryption(_))));
    }

    #[tokio::test]
    async fn test_missing_snapshot_is_empty() {
        let dir = TempDir::new().unwrap();
        let store = Store::encrypted(dir.path().join("absent.enc"), "secret");

        assert_eq!(store.load().await.unwrap().count(), 0);
    }

    #[tokio::test]
    async fn test_memory_store_forgets() {
        let store = Store::memory();

        let mut registry = Registry::new();
        registry
            .insert(Registration::new_pending("ada@example.com").unwrap())
            .unwrap();
        store.save(&registry).await.unwrap();

        assert_eq!(store.load().await.unwrap().count(), 0);
    }
}

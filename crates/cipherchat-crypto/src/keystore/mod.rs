//! Key store.
//!
//! Holds the local identity key pair and one durable shared-secret record
//! per conversation in `SQLite`.

mod db;
mod models;
mod queries;

use std::path::Path;
use std::time::Duration;

use base64::{Engine, engine::general_purpose::STANDARD as BASE64};
use cipherchat_core::IdentityPolicy;
use cipherchat_core::db::{duration_millis, unix_timestamp_millis};
use tokio::sync::RwLock;
use tracing::{debug, info};
use zeroize::Zeroizing;

pub use db::{DatabaseError, KeyDatabase};
pub use models::{IdentityRecord, StoredKeyRecord};

use crate::error::CryptoError;
use crate::identity::IdentityKeyPair;
use crate::primitives::{self, SymmetricKey};

/// Identity and per-conversation key storage.
pub struct KeyStore {
    db: KeyDatabase,
    policy: IdentityPolicy,
    identity: RwLock<Option<IdentityKeyPair>>,
}

impl KeyStore {
    /// Open (or create) the key database at `path`.
    pub async fn open(path: &Path, policy: IdentityPolicy) -> Result<Self, CryptoError> {
        let db = KeyDatabase::open(path)
            .await
            .map_err(|e| CryptoError::Initialization(format!("key database: {e}")))?;
        Ok(Self::with_database(db, policy))
    }

    /// Open a key store backed by an in-memory database.
    pub async fn open_in_memory(policy: IdentityPolicy) -> Result<Self, CryptoError> {
        let db = KeyDatabase::open_in_memory()
            .await
            .map_err(|e| CryptoError::Initialization(format!("key database: {e}")))?;
        Ok(Self::with_database(db, policy))
    }

    pub fn with_database(db: KeyDatabase, policy: IdentityPolicy) -> Self {
        Self {
            db,
            policy,
            identity: RwLock::new(None),
        }
    }

    pub const fn policy(&self) -> IdentityPolicy {
        self.policy
    }

    pub const fn database(&self) -> &KeyDatabase {
        &self.db
    }

    /// Return the identity key pair, creating it on first use.
    ///
    /// With the persistent policy a stored identity is loaded before a new
    /// one is generated, and a generated one is saved.
    pub async fn generate_identity(&self) -> Result<IdentityKeyPair, CryptoError> {
        let mut slot = self.identity.write().await;
        if let Some(existing) = slot.as_ref() {
            return Ok(existing.clone());
        }

        let identity = match self.policy {
            IdentityPolicy::Ephemeral => IdentityKeyPair::generate(),
            IdentityPolicy::Persistent => self.load_or_create_persistent_identity().await?,
        };
        info!(
            policy = ?self.policy,
            fingerprint = %identity.fingerprint(),
            "Identity key pair ready"
        );

        *slot = Some(identity.clone());
        Ok(identity)
    }

    async fn load_or_create_persistent_identity(&self) -> Result<IdentityKeyPair, CryptoError> {
        if let Some(record) = self.db.load_identity().await? {
            let secret = Zeroizing::new(
                BASE64
                    .decode(&record.secret_key)
                    .map_err(|e| CryptoError::KeyGeneration(format!("stored identity: {e}")))?,
            );
            return IdentityKeyPair::from_secret_bytes(&secret)
                .map_err(|e| CryptoError::KeyGeneration(format!("stored identity: {e}")));
        }

        let identity = IdentityKeyPair::generate();
        let secret = Zeroizing::new(identity.secret_bytes());
        let encoded = Zeroizing::new(BASE64.encode(secret.as_slice()));
        self.db
            .save_identity(&encoded, unix_timestamp_millis())
            .await?;
        Ok(identity)
    }

    /// The current identity, if one has been generated.
    pub async fn identity(&self) -> Option<IdentityKeyPair> {
        self.identity.read().await.clone()
    }

    /// Base64 public half of the current identity.
    pub async fn public_key_base64(&self) -> Option<String> {
        self.identity
            .read()
            .await
            .as_ref()
            .map(|kp| primitives::export_public_key(kp.public_key()))
    }

    /// Store a conversation's shared secret, replacing any previous one.
    pub async fn store_conversation_key(
        &self,
        conversation_id: &str,
        secret: &SymmetricKey,
    ) -> Result<(), CryptoError> {
        let encoded = Zeroizing::new(secret.to_base64());
        self.db
            .upsert_conversation_key(conversation_id, &encoded, unix_timestamp_millis())
            .await?;
        debug!(conversation_id, "Conversation key stored");
        Ok(())
    }

    /// Load a conversation's shared secret and mark it used.
    pub async fn get_conversation_key(
        &self,
        conversation_id: &str,
    ) -> Result<Option<SymmetricKey>, CryptoError> {
        let Some(record) = self
            .db
            .touch_conversation_key(conversation_id, unix_timestamp_millis())
            .await?
        else {
            return Ok(None);
        };
        let key_data = Zeroizing::new(record.key_data);
        SymmetricKey::from_base64(&key_data)
            .map(Some)
            .map_err(|e| {
                CryptoError::Storage(DatabaseError::Query(format!(
                    "corrupt key for {conversation_id}: {e}"
                )))
            })
    }

    /// Delete a conversation's key. Returns whether one existed.
    pub async fn remove_conversation_key(&self, conversation_id: &str) -> Result<bool, CryptoError> {
        Ok(self.db.delete_conversation_key(conversation_id).await?)
    }

    /// Replace the stored secret with one derived from it and a fresh salt.
    pub async fn rotate_conversation_key(
        &self,
        conversation_id: &str,
    ) -> Result<SymmetricKey, CryptoError> {
        let current = self.get_conversation_key(conversation_id).await?.ok_or_else(|| {
            CryptoError::KeyRotation {
                conversation_id: conversation_id.to_string(),
                reason: "no stored key".to_string(),
            }
        })?;

        let salt = primitives::random_salt();
        let rotated = primitives::derive_key_from_material(current.as_bytes(), &salt).map_err(
            |e| CryptoError::KeyRotation {
                conversation_id: conversation_id.to_string(),
                reason: e.to_string(),
            },
        )?;

        self.store_conversation_key(conversation_id, &rotated).await?;
        info!(conversation_id, "Stored conversation key rotated");
        Ok(rotated)
    }

    /// Delete keys not used within `max_age`. Returns the number removed.
    pub async fn prune_older_than(&self, max_age: Duration) -> Result<u64, CryptoError> {
        let cutoff = unix_timestamp_millis().saturating_sub(duration_millis(max_age));
        let removed = self.db.delete_keys_unused_since(cutoff).await?;
        if removed > 0 {
            info!(removed, "Pruned unused conversation keys");
        }
        Ok(removed)
    }

    pub async fn conversation_count(&self) -> Result<u64, CryptoError> {
        let count = self.db.count_conversation_keys().await?;
        Ok(u64::try_from(count).unwrap_or_default())
    }

    /// Delete every stored key and forget the identity.
    pub async fn clear_all(&self) -> Result<(), CryptoError> {
        let mut slot = self.identity.write().await;
        self.db.delete_all().await?;
        *slot = None;
        info!("Key store cleared");
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::panic, clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::primitives::KEY_SIZE;

    async fn test_store() -> KeyStore {
        KeyStore::open_in_memory(IdentityPolicy::Ephemeral)
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn generate_identity_is_idempotent() {
        let store = test_store().await;
        assert!(store.identity().await.is_none());

        let first = store.generate_identity().await.unwrap();
        let second = store.generate_identity().await.unwrap();
        assert_eq!(first.public_bytes(), second.public_bytes());
        assert_eq!(
            store.public_key_base64().await.unwrap(),
            primitives::export_public_key(first.public_key())
        );
    }

    #[tokio::test]
    async fn ephemeral_identity_is_not_persisted() {
        let store = test_store().await;
        store.generate_identity().await.unwrap();
        assert!(store.db.load_identity().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn persistent_identity_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("keys.db");

        let first = {
            let store = KeyStore::open(&path, IdentityPolicy::Persistent).await.unwrap();
            store.generate_identity().await.unwrap()
        };
        let store = KeyStore::open(&path, IdentityPolicy::Persistent).await.unwrap();
        let second = store.generate_identity().await.unwrap();
        assert_eq!(first.public_bytes(), second.public_bytes());
    }

    #[tokio::test]
    async fn store_get_remove_conversation_key() {
        let store = test_store().await;
        let key = SymmetricKey::from_bytes([3u8; KEY_SIZE]);

        assert!(store.get_conversation_key("c1").await.unwrap().is_none());
        store.store_conversation_key("c1", &key).await.unwrap();
        assert_eq!(store.get_conversation_key("c1").await.unwrap(), Some(key));
        assert_eq!(store.conversation_count().await.unwrap(), 1);

        assert!(store.remove_conversation_key("c1").await.unwrap());
        assert!(store.get_conversation_key("c1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn rotate_replaces_stored_key() {
        let store = test_store().await;
        let key = SymmetricKey::from_bytes([3u8; KEY_SIZE]);
        store.store_conversation_key("c1", &key).await.unwrap();

        let rotated = store.rotate_conversation_key("c1").await.unwrap();
        assert_ne!(rotated, key);
        assert_eq!(store.get_conversation_key("c1").await.unwrap(), Some(rotated));
    }

    #[tokio::test]
    async fn rotation_keeps_the_creation_time() {
        let store = test_store().await;
        let encoded = SymmetricKey::from_bytes([3u8; KEY_SIZE]).to_base64();
        store
            .db
            .upsert_conversation_key("c1", &encoded, 1_000)
            .await
            .unwrap();

        store.rotate_conversation_key("c1").await.unwrap();
        store
            .store_conversation_key("c1", &SymmetricKey::from_bytes([4u8; KEY_SIZE]))
            .await
            .unwrap();

        let record = store.db.touch_conversation_key("c1", 2_000).await.unwrap().unwrap();
        assert_eq!(record.created_at, 1_000);
    }

    #[tokio::test]
    async fn in_memory_keys_survive_a_recycled_connection() {
        use sqlx::Connection;

        let store = test_store().await;
        let key = SymmetricKey::from_bytes([5u8; KEY_SIZE]);
        store.store_conversation_key("c1", &key).await.unwrap();

        let conn = store.db.pool().acquire().await.unwrap();
        conn.detach().close().await.unwrap();

        assert_eq!(store.get_conversation_key("c1").await.unwrap(), Some(key));
        store.rotate_conversation_key("c1").await.unwrap();
    }

    #[tokio::test]
    async fn rotate_without_key_fails() {
        let store = test_store().await;
        let err = store.rotate_conversation_key("c1").await.unwrap_err();
        assert_eq!(err.code(), "KEY_ROTATION_ERROR");
        assert_eq!(err.conversation_id(), Some("c1"));
    }

    #[tokio::test]
    async fn prune_keeps_recently_used_keys() {
        let store = test_store().await;
        store
            .store_conversation_key("c1", &SymmetricKey::from_bytes([1u8; KEY_SIZE]))
            .await
            .unwrap();
        store
            .db
            .upsert_conversation_key("stale", "AAAA", 0)
            .await
            .unwrap();

        let removed = store
            .prune_older_than(Duration::from_secs(60))
            .await
            .unwrap();
        assert_eq!(removed, 1);
        assert_eq!(store.conversation_count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn clear_all_forgets_identity_and_keys() {
        let store = test_store().await;
        let before = store.generate_identity().await.unwrap();
        store
            .store_conversation_key("c1", &SymmetricKey::from_bytes([1u8; KEY_SIZE]))
            .await
            .unwrap();

        store.clear_all().await.unwrap();
        assert!(store.identity().await.is_none());
        assert_eq!(store.conversation_count().await.unwrap(), 0);

        let after = store.generate_identity().await.unwrap();
        assert_ne!(before.public_bytes(), after.public_bytes());
    }
}

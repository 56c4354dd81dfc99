//! Session manager: the public face of the engine.
//!
//! [`SessionManager`] ties the key store, the ratchet engine and the live
//! conversation sessions together. Every operation on a conversation first
//! takes that conversation's async lock, so work on one conversation is
//! serialised while different conversations proceed concurrently. The
//! ratchet engine lock is only ever held for synchronous work.

mod events;
mod repository;

pub use events::{ConversationExport, CryptoEvent, EncryptionStatus, HealthReport, PruneReport};
pub use repository::{ConversationRepository, ConversationSession, InMemoryConversationRepository};

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use cipherchat_core::config::{default_database_path, load_config};
use cipherchat_core::{CryptoConfig, IdentityPolicy};
use cipherchat_core::db::{duration_millis, unix_timestamp_millis};
use tokio::sync::{Mutex, RwLock, broadcast};
use tracing::{debug, info, warn};

use crate::codec::MessageCodec;
use crate::envelope::{Envelope, KeyExchangeOffer};
use crate::error::{CryptoError, ProtocolError};
use crate::keystore::KeyStore;
use crate::primitives;
use crate::ratchet::RatchetEngine;

/// Coordinates key exchange, encryption and maintenance for all conversations.
pub struct SessionManager {
    config: CryptoConfig,
    local_user_id: String,
    key_store: Arc<KeyStore>,
    repository: Arc<dyn ConversationRepository>,
    ratchet: Mutex<RatchetEngine>,
    conversation_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
    statuses: RwLock<HashMap<String, EncryptionStatus>>,
    event_tx: broadcast::Sender<CryptoEvent>,
}

impl SessionManager {
    pub fn new(
        config: CryptoConfig,
        key_store: Arc<KeyStore>,
        repository: Arc<dyn ConversationRepository>,
        local_user_id: impl Into<String>,
    ) -> Self {
        let codec = MessageCodec::new(config.max_sequence_number, config.replay_window);
        let ratchet = RatchetEngine::new(codec, config.max_skip);
        let (event_tx, _) = broadcast::channel(config.event_capacity.max(1));

        Self {
            config,
            local_user_id: local_user_id.into(),
            key_store,
            repository,
            ratchet: Mutex::new(ratchet),
            conversation_locks: Mutex::new(HashMap::new()),
            statuses: RwLock::new(HashMap::new()),
            event_tx,
        }
    }

    /// Build a manager with the key store the configuration points at.
    ///
    /// Without a `database_path` keys live in an in-memory database.
    pub async fn open(
        config: CryptoConfig,
        local_user_id: impl Into<String>,
    ) -> Result<Self, CryptoError> {
        config
            .validate()
            .map_err(|e| CryptoError::Initialization(e.to_string()))?;

        let key_store = match &config.database_path {
            Some(path) => KeyStore::open(path, config.identity).await?,
            None => KeyStore::open_in_memory(config.identity).await?,
        };
        Ok(Self::new(
            config,
            Arc::new(key_store),
            Arc::new(InMemoryConversationRepository::new()),
            local_user_id,
        ))
    }

    /// [`Self::open`] with storage forced into memory.
    pub async fn in_memory(
        mut config: CryptoConfig,
        local_user_id: impl Into<String>,
    ) -> Result<Self, CryptoError> {
        config.database_path = None;
        Self::open(config, local_user_id).await
    }

    /// [`Self::open`] with configuration resolved from the settings files
    /// and environment.
    ///
    /// A persistent identity without an explicit `database_path` uses the
    /// platform data directory.
    pub async fn load(
        project_dir: Option<&Path>,
        local_user_id: impl Into<String>,
    ) -> Result<Self, CryptoError> {
        let mut config =
            load_config(project_dir).map_err(|e| CryptoError::Initialization(e.to_string()))?;
        if config.identity == IdentityPolicy::Persistent && config.database_path.is_none() {
            config.database_path = default_database_path();
        }
        Self::open(config, local_user_id).await
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CryptoEvent> {
        self.event_tx.subscribe()
    }

    pub fn local_user_id(&self) -> &str {
        &self.local_user_id
    }

    pub const fn config(&self) -> &CryptoConfig {
        &self.config
    }

    pub fn key_store(&self) -> &KeyStore {
        &self.key_store
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// Check the random source and make sure an identity key pair exists.
    pub async fn initialize(&self) -> Result<(), CryptoError> {
        let identity = match self.try_initialize().await {
            Ok(identity) => identity,
            Err(err) => {
                self.report(&err);
                return Err(err);
            }
        };

        info!(
            user = %self.local_user_id,
            fingerprint = %identity.fingerprint(),
            "Crypto engine initialized"
        );
        self.emit(CryptoEvent::Initialized {
            public_key: primitives::export_public_key(identity.public_key()),
        });
        Ok(())
    }

    async fn try_initialize(&self) -> Result<crate::identity::IdentityKeyPair, CryptoError> {
        primitives::is_supported().map_err(|e| CryptoError::Initialization(e.to_string()))?;
        self.key_store
            .generate_identity()
            .await
            .map_err(|e| CryptoError::Initialization(e.to_string()))
    }

    pub async fn is_initialized(&self) -> bool {
        self.key_store.identity().await.is_some()
    }

    /// Base64 public identity key, once initialized.
    pub async fn local_public_key(&self) -> Option<String> {
        self.key_store.public_key_base64().await
    }

    // =========================================================================
    // Key exchange
    // =========================================================================

    /// Produce the offer to send to the peer of `conversation_id`.
    pub async fn start_key_exchange(
        &self,
        conversation_id: &str,
    ) -> Result<KeyExchangeOffer, CryptoError> {
        let lock = self.conversation_lock(conversation_id).await;
        let _guard = lock.lock().await;

        self.set_status(conversation_id, EncryptionStatus::Initializing)
            .await;
        let Some(public_key) = self.key_store.public_key_base64().await else {
            let err = CryptoError::KeyExchange {
                conversation_id: conversation_id.to_string(),
                reason: "identity key pair not generated".to_string(),
            };
            self.set_status(conversation_id, EncryptionStatus::Error)
                .await;
            self.report(&err);
            return Err(err);
        };

        let offer = KeyExchangeOffer {
            conversation_id: conversation_id.to_string(),
            public_key,
            sender: self.local_user_id.clone(),
            timestamp: unix_timestamp_millis(),
        };
        self.set_status(conversation_id, EncryptionStatus::KeyExchangePending)
            .await;
        self.emit(CryptoEvent::KeyExchangeStarted {
            conversation_id: conversation_id.to_string(),
        });
        info!(conversation_id, "Key exchange started");
        Ok(offer)
    }

    /// Establish the session from the peer's public key.
    ///
    /// A second exchange for the same conversation replaces the first.
    pub async fn complete_key_exchange(
        &self,
        conversation_id: &str,
        remote_public_key: &str,
        is_initiator: bool,
    ) -> Result<(), CryptoError> {
        let lock = self.conversation_lock(conversation_id).await;
        let _guard = lock.lock().await;

        self.set_status(conversation_id, EncryptionStatus::Initializing)
            .await;
        if let Err(reason) = self
            .try_complete_key_exchange(conversation_id, remote_public_key, is_initiator)
            .await
        {
            self.set_status(conversation_id, EncryptionStatus::Error)
                .await;
            let err = CryptoError::KeyExchange {
                conversation_id: conversation_id.to_string(),
                reason,
            };
            self.report(&err);
            return Err(err);
        }

        self.set_status(conversation_id, EncryptionStatus::Active)
            .await;
        self.emit(CryptoEvent::KeyExchangeCompleted {
            conversation_id: conversation_id.to_string(),
            is_initiator,
        });
        info!(conversation_id, is_initiator, "Key exchange completed");
        Ok(())
    }

    async fn try_complete_key_exchange(
        &self,
        conversation_id: &str,
        remote_public_key: &str,
        is_initiator: bool,
    ) -> Result<(), String> {
        let identity = self
            .key_store
            .identity()
            .await
            .ok_or_else(|| "identity key pair not generated".to_string())?;
        let remote = primitives::import_public_key(remote_public_key)
            .map_err(|e| format!("remote public key: {e}"))?;
        let shared_secret = primitives::derive_shared_secret(identity.secret(), &remote)
            .map_err(|e| format!("shared secret: {e}"))?;

        self.key_store
            .store_conversation_key(conversation_id, &shared_secret)
            .await
            .map_err(|e| e.to_string())?;

        self.ratchet
            .lock()
            .await
            .initialize(
                conversation_id,
                &shared_secret,
                &identity,
                remote,
                is_initiator,
            )
            .map_err(|e| format!("ratchet: {e}"))?;

        self.repository.put(ConversationSession {
            conversation_id: conversation_id.to_string(),
            shared_secret,
            remote_public_key: remote,
            sequence_number: 0,
            initialized: true,
            last_rotation_at: SystemTime::now(),
            is_initiator,
        });
        Ok(())
    }

    // =========================================================================
    // Messages
    // =========================================================================

    /// Encrypt a chat message, rotating the conversation key first when due.
    pub async fn encrypt_message(
        &self,
        plaintext: &str,
        conversation_id: &str,
        sender: &str,
    ) -> Result<Envelope, CryptoError> {
        let lock = self.session_lock(conversation_id).await?;
        let _guard = lock.lock().await;

        let mut session = self.active_session(conversation_id).await?;

        let rotation_due = self
            .ratchet
            .lock()
            .await
            .codec()
            .should_rotate(conversation_id, self.config.key_rotation_interval());
        if rotation_due {
            self.rotate_locked(conversation_id, &mut session).await?;
        }

        let result = self
            .ratchet
            .lock()
            .await
            .encrypt(conversation_id, sender, plaintext.as_bytes());
        match result {
            Ok(envelope) => {
                session.sequence_number = envelope.sequence_number;
                self.repository.put(session);
                debug!(
                    conversation_id,
                    sequence = envelope.sequence_number,
                    "Message encrypted"
                );
                self.emit(CryptoEvent::MessageEncrypted {
                    conversation_id: conversation_id.to_string(),
                    sequence_number: envelope.sequence_number,
                });
                Ok(envelope)
            }
            Err(source) => {
                let err = CryptoError::Encryption {
                    conversation_id: conversation_id.to_string(),
                    source,
                };
                self.report(&err);
                Err(err)
            }
        }
    }

    /// Decrypt an incoming envelope into the chat message text.
    pub async fn decrypt_message(&self, envelope: &Envelope) -> Result<String, CryptoError> {
        let conversation_id = envelope.conversation_id.as_str();
        let lock = self.session_lock(conversation_id).await?;
        let _guard = lock.lock().await;

        self.active_session(conversation_id).await?;

        let result = self.ratchet.lock().await.decrypt_with(envelope, |bytes| {
            String::from_utf8(bytes)
                .map_err(|_| ProtocolError::InvalidPayload("not valid UTF-8".to_string()))
        });
        match result {
            Ok(plaintext) => {
                debug!(
                    conversation_id,
                    sequence = envelope.sequence_number,
                    "Message decrypted"
                );
                self.emit(CryptoEvent::MessageDecrypted {
                    conversation_id: conversation_id.to_string(),
                    sequence_number: envelope.sequence_number,
                });
                Ok(plaintext)
            }
            Err(source) => {
                let err = CryptoError::Decryption {
                    conversation_id: conversation_id.to_string(),
                    source,
                };
                self.report(&err);
                Err(err)
            }
        }
    }

    // =========================================================================
    // Rotation and teardown
    // =========================================================================

    /// Start a new sending epoch and refresh the stored conversation key.
    pub async fn rotate_conversation_key(&self, conversation_id: &str) -> Result<(), CryptoError> {
        let lock = self.session_lock(conversation_id).await?;
        let _guard = lock.lock().await;

        let mut session = self.active_session(conversation_id).await?;
        self.rotate_locked(conversation_id, &mut session).await
    }

    async fn rotate_locked(
        &self,
        conversation_id: &str,
        session: &mut ConversationSession,
    ) -> Result<(), CryptoError> {
        if let Err(err) = self.try_rotate(conversation_id, session).await {
            self.report(&err);
            return Err(err);
        }

        self.repository.put(session.clone());
        info!(conversation_id, "Conversation key rotated");
        self.emit(CryptoEvent::KeyRotated {
            conversation_id: conversation_id.to_string(),
        });
        Ok(())
    }

    /// Refresh the stored key, then step the ratchet. A failure in either
    /// leaves the stored key, the ratchet and the session as they were.
    async fn try_rotate(
        &self,
        conversation_id: &str,
        session: &mut ConversationSession,
    ) -> Result<(), CryptoError> {
        // A pruned record is restored from the live session before rotating.
        let previous = match self.key_store.get_conversation_key(conversation_id).await? {
            Some(key) => key,
            None => {
                self.key_store
                    .store_conversation_key(conversation_id, &session.shared_secret)
                    .await?;
                session.shared_secret.clone()
            }
        };
        let rotated = self
            .key_store
            .rotate_conversation_key(conversation_id)
            .await?;

        let stepped = self.ratchet.lock().await.rotate(conversation_id);
        if let Err(e) = stepped {
            self.key_store
                .store_conversation_key(conversation_id, &previous)
                .await?;
            return Err(CryptoError::KeyRotation {
                conversation_id: conversation_id.to_string(),
                reason: e.to_string(),
            });
        }

        session.shared_secret = rotated;
        session.last_rotation_at = SystemTime::now();
        Ok(())
    }

    /// Forget everything about a conversation. Safe to call repeatedly.
    pub async fn clear_conversation_keys(&self, conversation_id: &str) -> Result<(), CryptoError> {
        let lock = self
            .conversation_locks
            .lock()
            .await
            .get(conversation_id)
            .cloned()
            .unwrap_or_default();
        let guard = lock.lock().await;

        self.ratchet.lock().await.clear(conversation_id);
        self.repository.remove(conversation_id);
        let removed = self.key_store.remove_conversation_key(conversation_id).await;

        let previous = self.statuses.write().await.remove(conversation_id);
        self.release_lock(conversation_id, &lock).await;
        drop(guard);
        if previous.is_some_and(|s| s != EncryptionStatus::NotInitialized) {
            self.emit(CryptoEvent::StatusChanged {
                conversation_id: conversation_id.to_string(),
                status: EncryptionStatus::NotInitialized,
            });
        }

        if let Err(e) = removed {
            let err = CryptoError::Cleanup {
                conversation_id: conversation_id.to_string(),
                reason: e.to_string(),
            };
            self.report(&err);
            return Err(err);
        }

        info!(conversation_id, "Conversation keys cleared");
        self.emit(CryptoEvent::ConversationCleared {
            conversation_id: conversation_id.to_string(),
        });
        Ok(())
    }

    /// Wipe every key, session and status, including the identity.
    pub async fn clear_all_data(&self) -> Result<(), CryptoError> {
        if let Err(err) = self.key_store.clear_all().await {
            self.report(&err);
            return Err(err);
        }

        self.ratchet.lock().await.clear_all();
        self.repository.clear();
        self.statuses.write().await.clear();
        self.conversation_locks
            .lock()
            .await
            .retain(|_, lock| Arc::strong_count(lock) > 1);

        info!("All crypto data cleared");
        self.emit(CryptoEvent::AllDataCleared);
        Ok(())
    }

    // =========================================================================
    // Status and maintenance
    // =========================================================================

    pub async fn encryption_status(&self, conversation_id: &str) -> EncryptionStatus {
        self.statuses
            .read()
            .await
            .get(conversation_id)
            .copied()
            .unwrap_or_default()
    }

    pub async fn is_conversation_secure(&self, conversation_id: &str) -> bool {
        self.encryption_status(conversation_id).await == EncryptionStatus::Active
    }

    /// Diagnostic snapshot of a conversation. Contains no key material.
    pub async fn export_conversation_state(
        &self,
        conversation_id: &str,
    ) -> Option<ConversationExport> {
        let session = self.repository.get(conversation_id)?;
        let ratchet_state = self.ratchet.lock().await.export_state(conversation_id);

        Some(ConversationExport {
            conversation_id: conversation_id.to_string(),
            encryption_status: self.encryption_status(conversation_id).await,
            last_rotation: session
                .last_rotation_at
                .duration_since(UNIX_EPOCH)
                .map_or(0, duration_millis),
            sequence_number: session.sequence_number,
            is_initiator: session.is_initiator,
            ratchet_state,
            timestamp: unix_timestamp_millis(),
        })
    }

    /// Drop unused stored keys and stale cached skipped keys.
    pub async fn prune_stale_keys(&self) -> Result<PruneReport, CryptoError> {
        let stored_keys_removed = match self
            .key_store
            .prune_older_than(self.config.key_max_age())
            .await
        {
            Ok(removed) => removed,
            Err(err) => {
                self.report(&err);
                return Err(err);
            }
        };

        let mut ratchet = self.ratchet.lock().await;
        let ids = ratchet.conversation_ids();
        let skipped_keys_removed = ids
            .iter()
            .map(|id| ratchet.prune_skipped_keys(id, self.config.skipped_key_window))
            .sum();
        drop(ratchet);

        Ok(PruneReport {
            stored_keys_removed,
            skipped_keys_removed,
        })
    }

    /// Read-only consistency scan of the engine.
    pub async fn perform_health_check(&self) -> HealthReport {
        let mut issues = Vec::new();

        if let Err(e) = primitives::is_supported() {
            issues.push(format!("Secure random source unavailable: {e}"));
        }
        if self.key_store.identity().await.is_none() {
            issues.push("Key store has no identity key pair".to_string());
        }
        if let Err(e) = self.key_store.conversation_count().await {
            issues.push(format!("Key database unavailable: {e}"));
        }

        let ids = self.repository.ids();
        let ratchet = self.ratchet.lock().await;
        for id in &ids {
            if !self.repository.get(id).is_some_and(|s| s.initialized) {
                issues.push(format!("Conversation {id} is not properly initialized"));
            }
            if !ratchet.is_initialized(id) {
                issues.push(format!("Ratchet missing for conversation {id}"));
            }
        }
        drop(ratchet);

        HealthReport {
            is_healthy: issues.is_empty(),
            issues,
            conversation_count: ids.len(),
        }
    }

    // =========================================================================
    // Internals
    // =========================================================================

    async fn conversation_lock(&self, conversation_id: &str) -> Arc<Mutex<()>> {
        self.conversation_locks
            .lock()
            .await
            .entry(conversation_id.to_string())
            .or_default()
            .clone()
    }

    /// Lock of a conversation that has a session. Unknown ids get no entry.
    async fn session_lock(&self, conversation_id: &str) -> Result<Arc<Mutex<()>>, CryptoError> {
        if self.repository.get(conversation_id).is_none() {
            return Err(CryptoError::NotInitialized {
                conversation_id: conversation_id.to_string(),
            });
        }
        Ok(self.conversation_lock(conversation_id).await)
    }

    /// Drop the map entry for `lock` unless someone else still holds or awaits it.
    async fn release_lock(&self, conversation_id: &str, lock: &Arc<Mutex<()>>) {
        let mut locks = self.conversation_locks.lock().await;
        let unused = locks
            .get(conversation_id)
            .is_some_and(|held| Arc::ptr_eq(held, lock) && Arc::strong_count(lock) <= 2);
        if unused {
            locks.remove(conversation_id);
        }
    }

    async fn active_session(
        &self,
        conversation_id: &str,
    ) -> Result<ConversationSession, CryptoError> {
        let active = self.is_conversation_secure(conversation_id).await;
        match self.repository.get(conversation_id) {
            Some(session) if active && session.initialized => Ok(session),
            _ => Err(CryptoError::NotInitialized {
                conversation_id: conversation_id.to_string(),
            }),
        }
    }

    async fn set_status(&self, conversation_id: &str, status: EncryptionStatus) {
        let previous = self
            .statuses
            .write()
            .await
            .insert(conversation_id.to_string(), status);
        if previous != Some(status) {
            self.emit(CryptoEvent::StatusChanged {
                conversation_id: conversation_id.to_string(),
                status,
            });
        }
    }

    fn report(&self, err: &CryptoError) {
        warn!(
            code = err.code(),
            conversation_id = err.conversation_id().unwrap_or("-"),
            error = %err,
            "Crypto operation failed"
        );
        self.emit(CryptoEvent::Error {
            conversation_id: err.conversation_id().map(str::to_string),
            code: err.code(),
            message: err.to_string(),
        });
    }

    /// Fire-and-forget; no subscribers is fine.
    fn emit(&self, event: CryptoEvent) {
        let _ = self.event_tx.send(event);
    }
}

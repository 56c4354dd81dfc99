//! Crypto error types.
//!
//! Three layers: [`PrimitiveError`] for a single cipher/KDF call,
//! [`ProtocolError`] for message-level rejections, and [`CryptoError`] for
//! the public API, tagged with the conversation it concerns.

use cipherchat_core::db::DatabaseError;

/// Errors from a single primitive operation.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PrimitiveError {
    #[error("Invalid key format: {0}")]
    InvalidKeyFormat(String),

    #[error("Authentication failed: ciphertext, nonce or associated data was modified")]
    AuthenticationFailed,

    #[error("Invalid nonce length: expected {expected}, got {actual}")]
    InvalidNonceLength { expected: usize, actual: usize },

    #[error("Key derivation failed: {0}")]
    KeyDerivation(String),

    #[error("Encryption failed: {0}")]
    Encryption(String),

    #[error("Secure random source unavailable: {0}")]
    RandomUnavailable(String),
}

/// Message-level rejections raised by the codec and the ratchet.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProtocolError {
    #[error(transparent)]
    Primitive(#[from] PrimitiveError),

    #[error("Sequence number {sequence} was already received (possible replay)")]
    ReplayDetected { sequence: u32 },

    #[error("Message {sequence} is older than receiving counter {receiving_counter}")]
    MessageTooOld { sequence: u32, receiving_counter: u32 },

    #[error("Skipping {requested} messages exceeds the limit of {max_skip}")]
    TooManySkippedMessages { requested: u64, max_skip: u32 },

    #[error("Ratchet not initialized")]
    NotInitialized,

    #[error("Invalid envelope: {0}")]
    InvalidEnvelope(String),

    #[error("Message payload rejected: {0}")]
    InvalidPayload(String),
}

/// Errors surfaced by the public engine API.
#[derive(Debug, thiserror::Error)]
pub enum CryptoError {
    #[error("Initialization failed: {0}")]
    Initialization(String),

    #[error("Key generation failed: {0}")]
    KeyGeneration(String),

    #[error("Key exchange failed for {conversation_id}: {reason}")]
    KeyExchange {
        conversation_id: String,
        reason: String,
    },

    #[error("Encryption failed for {conversation_id}: {source}")]
    Encryption {
        conversation_id: String,
        source: ProtocolError,
    },

    #[error("Decryption failed for {conversation_id}: {source}")]
    Decryption {
        conversation_id: String,
        source: ProtocolError,
    },

    #[error("Key rotation failed for {conversation_id}: {reason}")]
    KeyRotation {
        conversation_id: String,
        reason: String,
    },

    #[error("Storage error: {0}")]
    Storage(#[from] DatabaseError),

    #[error("Cleanup failed for {conversation_id}: {reason}")]
    Cleanup {
        conversation_id: String,
        reason: String,
    },

    #[error("Conversation {conversation_id} is not initialized for encryption")]
    NotInitialized { conversation_id: String },

    #[error("Invalid envelope: {0}")]
    InvalidEnvelope(String),
}

impl CryptoError {
    /// Stable machine-readable code, as delivered in error events.
    pub const fn code(&self) -> &'static str {
        match self {
            Self::Initialization(_) => "INIT_ERROR",
            Self::KeyGeneration(_) => "KEY_GENERATION_ERROR",
            Self::KeyExchange { .. } => "KEY_EXCHANGE_ERROR",
            Self::Encryption { .. } => "ENCRYPTION_ERROR",
            Self::Decryption { .. } => "DECRYPTION_ERROR",
            Self::KeyRotation { .. } => "KEY_ROTATION_ERROR",
            Self::Storage(_) => "STORAGE_ERROR",
            Self::Cleanup { .. } => "CLEANUP_ERROR",
            Self::NotInitialized { .. } => "NOT_INITIALIZED",
            Self::InvalidEnvelope(_) => "INVALID_ENVELOPE",
        }
    }

    /// The conversation this error concerns, when there is one.
    pub fn conversation_id(&self) -> Option<&str> {
        match self {
            Self::KeyExchange {
                conversation_id, ..
            }
            | Self::Encryption {
                conversation_id, ..
            }
            | Self::Decryption {
                conversation_id, ..
            }
            | Self::KeyRotation {
                conversation_id, ..
            }
            | Self::Cleanup {
                conversation_id, ..
            }
            | Self::NotInitialized { conversation_id } => Some(conversation_id),
            Self::Initialization(_)
            | Self::KeyGeneration(_)
            | Self::Storage(_)
            | Self::InvalidEnvelope(_) => None,
        }
    }

    /// The message-level cause of an encryption or decryption failure.
    pub const fn protocol_error(&self) -> Option<&ProtocolError> {
        match self {
            Self::Encryption { source, .. } | Self::Decryption { source, .. } => Some(source),
            _ => None,
        }
    }
}

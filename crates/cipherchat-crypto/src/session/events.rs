//! Status, events and reports published by the session manager.

use serde::Serialize;

use crate::ratchet::RatchetSnapshot;

/// Encryption lifecycle of one conversation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum EncryptionStatus {
    #[default]
    NotInitialized,
    Initializing,
    KeyExchangePending,
    Active,
    Error,
}

impl EncryptionStatus {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::NotInitialized => "not_initialized",
            Self::Initializing => "initializing",
            Self::KeyExchangePending => "key_exchange_pending",
            Self::Active => "active",
            Self::Error => "error",
        }
    }
}

impl std::fmt::Display for EncryptionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Notifications broadcast to subscribers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CryptoEvent {
    Initialized {
        public_key: String,
    },
    StatusChanged {
        conversation_id: String,
        status: EncryptionStatus,
    },
    KeyExchangeStarted {
        conversation_id: String,
    },
    KeyExchangeCompleted {
        conversation_id: String,
        is_initiator: bool,
    },
    MessageEncrypted {
        conversation_id: String,
        sequence_number: u32,
    },
    MessageDecrypted {
        conversation_id: String,
        sequence_number: u32,
    },
    KeyRotated {
        conversation_id: String,
    },
    ConversationCleared {
        conversation_id: String,
    },
    AllDataCleared,
    Error {
        conversation_id: Option<String>,
        code: &'static str,
        message: String,
    },
}

/// Result of a read-only consistency scan.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthReport {
    pub is_healthy: bool,
    pub issues: Vec<String>,
    pub conversation_count: usize,
}

/// Counts removed by a maintenance pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PruneReport {
    pub stored_keys_removed: u64,
    pub skipped_keys_removed: usize,
}

/// Non-secret diagnostic view of one conversation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationExport {
    pub conversation_id: String,
    pub encryption_status: EncryptionStatus,
    /// Milliseconds since the Unix epoch.
    pub last_rotation: i64,
    pub sequence_number: u32,
    pub is_initiator: bool,
    pub ratchet_state: Option<RatchetSnapshot>,
    pub timestamp: i64,
}

//! Key database models.

/// One conversation's shared secret as stored on disk.
#[derive(Clone, sqlx::FromRow)]
pub struct StoredKeyRecord {
    pub conversation_id: String,
    /// Base64 key material.
    pub key_data: String,
    /// Milliseconds since the Unix epoch.
    pub created_at: i64,
    pub last_used: i64,
}

impl std::fmt::Debug for StoredKeyRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StoredKeyRecord")
            .field("conversation_id", &self.conversation_id)
            .field("key_data", &"[REDACTED]")
            .field("created_at", &self.created_at)
            .field("last_used", &self.last_used)
            .finish()
    }
}

/// The persisted identity secret.
#[derive(Clone, sqlx::FromRow)]
pub struct IdentityRecord {
    /// Base64 X25519 secret key.
    pub secret_key: String,
    pub created_at: i64,
}

//! Live conversation sessions.

use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};
use std::time::SystemTime;

use x25519_dalek::PublicKey;

use crate::primitives::SymmetricKey;

/// Established encryption context of one conversation.
#[derive(Debug, Clone)]
pub struct ConversationSession {
    pub conversation_id: String,
    pub shared_secret: SymmetricKey,
    pub remote_public_key: PublicKey,
    /// Sequence number of the last message sent.
    pub sequence_number: u32,
    pub initialized: bool,
    pub last_rotation_at: SystemTime,
    pub is_initiator: bool,
}

/// Storage for live sessions, one per conversation id.
///
/// Calls are short and synchronous; implementations must not block on I/O.
pub trait ConversationRepository: Send + Sync {
    fn get(&self, conversation_id: &str) -> Option<ConversationSession>;

    /// Insert or replace the session for its conversation id.
    fn put(&self, session: ConversationSession);

    fn remove(&self, conversation_id: &str) -> Option<ConversationSession>;

    fn ids(&self) -> Vec<String>;

    fn clear(&self);
}

/// Process-local [`ConversationRepository`].
#[derive(Debug, Default)]
pub struct InMemoryConversationRepository {
    sessions: RwLock<HashMap<String, ConversationSession>>,
}

impl InMemoryConversationRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ConversationRepository for InMemoryConversationRepository {
    fn get(&self, conversation_id: &str) -> Option<ConversationSession> {
        self.sessions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(conversation_id)
            .cloned()
    }

    fn put(&self, session: ConversationSession) {
        self.sessions
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(session.conversation_id.clone(), session);
    }

    fn remove(&self, conversation_id: &str) -> Option<ConversationSession> {
        self.sessions
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(conversation_id)
    }

    fn ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self
            .sessions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect();
        ids.sort();
        ids
    }

    fn clear(&self) {
        self.sessions
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }
}

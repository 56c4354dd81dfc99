//! Cipherchat E2E Encryption Engine
//!
//! End-to-end encryption for chat conversations: the relay and the chat
//! backend only ever see envelopes.
//!
//! ## Crypto primitives
//!
//! - **Identity**: X25519 key pair per manager, ephemeral or persisted
//! - **Key exchange**: X25519 ECDH → HKDF-SHA256 → per-conversation shared secret
//! - **Session**: Double Ratchet with one root chain per direction, so either
//!   side may rotate without waiting for the other
//! - **Encryption**: ChaCha20-Poly1305 AEAD, random 12-byte nonce, header
//!   fields bound as associated data
//! - **Storage**: shared secrets in `SQLite`, rotated with Argon2id
//!
//! ## Layers
//!
//! [`primitives`] → [`codec`] (framing, sequence numbers, replay window) →
//! [`ratchet`] → [`session::SessionManager`], with [`keystore`] alongside.

pub mod codec;
pub mod envelope;
pub mod error;
pub mod identity;
pub mod keystore;
pub mod primitives;
pub mod ratchet;
pub mod session;

pub use codec::{Frame, MessageCodec, ReplayWindow};
pub use envelope::{Envelope, KeyExchangeOffer, RatchetHeader};
pub use error::{CryptoError, PrimitiveError, ProtocolError};
pub use identity::{IdentityKeyPair, KeyPair, fingerprint_of};
pub use keystore::KeyStore;
pub use primitives::{KEY_SIZE, NONCE_SIZE, SymmetricKey};
pub use ratchet::{RatchetEngine, RatchetSnapshot};
pub use session::{
    ConversationExport, ConversationRepository, ConversationSession, CryptoEvent,
    EncryptionStatus, HealthReport, InMemoryConversationRepository, PruneReport, SessionManager,
};

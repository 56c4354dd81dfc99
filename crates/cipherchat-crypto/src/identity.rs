//! X25519 key pairs.
//!
//! The same type serves as the long-lived identity key of a manager and as
//! the short-lived ratchet key pairs of a conversation.

use rand::rngs::OsRng;
use x25519_dalek::{PublicKey, StaticSecret};
use zeroize::Zeroize;

use crate::error::PrimitiveError;
use crate::primitives::KEY_SIZE;

/// An X25519 key pair.
#[derive(Clone)]
pub struct KeyPair {
    secret: StaticSecret,
    public: PublicKey,
}

/// The manager's long-lived key pair, exchanged in key-exchange offers.
pub type IdentityKeyPair = KeyPair;

impl std::fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyPair")
            .field("public", &hex::encode(self.public.as_bytes()))
            .field("secret", &"[REDACTED]")
            .finish()
    }
}

impl KeyPair {
    /// Generate a new random key pair.
    pub fn generate() -> Self {
        let secret = StaticSecret::random_from_rng(OsRng);
        let public = PublicKey::from(&secret);
        Self { secret, public }
    }

    /// Reconstruct from raw 32-byte secret key bytes.
    pub fn from_secret_bytes(bytes: &[u8]) -> Result<Self, PrimitiveError> {
        let mut arr = <[u8; KEY_SIZE]>::try_from(bytes).map_err(|_| {
            PrimitiveError::InvalidKeyFormat(format!(
                "expected {KEY_SIZE} secret bytes, got {}",
                bytes.len()
            ))
        })?;
        let secret = StaticSecret::from(arr);
        let public = PublicKey::from(&secret);
        arr.zeroize();
        Ok(Self { secret, public })
    }

    pub const fn public_key(&self) -> &PublicKey {
        &self.public
    }

    pub fn public_bytes(&self) -> [u8; KEY_SIZE] {
        *self.public.as_bytes()
    }

    /// Raw secret bytes. Callers must zeroize their copy.
    pub fn secret_bytes(&self) -> [u8; KEY_SIZE] {
        self.secret.to_bytes()
    }

    pub const fn secret(&self) -> &StaticSecret {
        &self.secret
    }

    /// Colon-separated SHA-256 fingerprint of the public key, safe to log.
    pub fn fingerprint(&self) -> String {
        fingerprint_of(self.public.as_bytes())
    }
}

/// Compute a colon-separated hex fingerprint from raw public key bytes.
pub fn fingerprint_of(pubkey_bytes: &[u8; KEY_SIZE]) -> String {
    use sha2::{Digest, Sha256};
    Sha256::digest(pubkey_bytes)
        .iter()
        .map(|b| format!("{b:02x}"))
        .collect::<Vec<_>>()
        .join(":")
}

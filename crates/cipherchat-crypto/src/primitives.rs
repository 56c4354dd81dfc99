//! Primitive provider.
//!
//! Uniform, stateless wrappers over the platform primitives:
//! X25519 key agreement, ChaCha20-Poly1305 AEAD, HKDF-SHA256, Argon2id and
//! the OS random number generator. Nothing here knows about conversations.

use argon2::{Algorithm, Argon2, Params, Version};
use base64::{Engine, engine::general_purpose::STANDARD as BASE64};
use chacha20poly1305::aead::{Aead, KeyInit, Payload};
use chacha20poly1305::{ChaCha20Poly1305, Key, Nonce};
use hkdf::Hkdf;
use rand::RngCore;
use rand::rngs::OsRng;
use sha2::Sha256;
use subtle::ConstantTimeEq;
use x25519_dalek::{PublicKey, StaticSecret};
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::error::PrimitiveError;
use crate::identity::KeyPair;

/// Size of every symmetric key and of an X25519 public key.
pub const KEY_SIZE: usize = 32;

/// Nonce size for ChaCha20-Poly1305.
pub const NONCE_SIZE: usize = 12;

/// Salt size for [`derive_key_from_material`].
pub const SALT_SIZE: usize = 16;

/// HKDF salt for domain separation of ECDH outputs (recommended by RFC 5869).
const HKDF_SALT: &[u8] = b"cipherchat-e2e-hkdf-salt-v1";

/// HKDF info string for shared-secret derivation.
const HKDF_INFO: &[u8] = b"cipherchat-e2e-shared-secret-v1";

/// Argon2id cost parameters (memory in KiB, passes, lanes).
const ARGON2_M_COST: u32 = 19 * 1024;
const ARGON2_T_COST: u32 = 2;
const ARGON2_P_COST: u32 = 1;

/// A 32-byte symmetric key, zeroized on drop.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct SymmetricKey([u8; KEY_SIZE]);

impl SymmetricKey {
    pub const fn from_bytes(bytes: [u8; KEY_SIZE]) -> Self {
        Self(bytes)
    }

    pub const fn as_bytes(&self) -> &[u8; KEY_SIZE] {
        &self.0
    }

    /// Encode for durable storage.
    pub fn to_base64(&self) -> String {
        BASE64.encode(self.0)
    }

    /// Decode stored key material.
    pub fn from_base64(encoded: &str) -> Result<Self, PrimitiveError> {
        let mut bytes = BASE64
            .decode(encoded)
            .map_err(|e| PrimitiveError::InvalidKeyFormat(e.to_string()))?;
        let result = <[u8; KEY_SIZE]>::try_from(bytes.as_slice())
            .map(Self)
            .map_err(|_| {
                PrimitiveError::InvalidKeyFormat(format!(
                    "expected {KEY_SIZE} bytes, got {}",
                    bytes.len()
                ))
            });
        bytes.zeroize();
        result
    }
}

impl PartialEq for SymmetricKey {
    fn eq(&self, other: &Self) -> bool {
        self.0.ct_eq(&other.0).into()
    }
}

impl Eq for SymmetricKey {}

impl std::fmt::Debug for SymmetricKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("SymmetricKey([REDACTED])")
    }
}

/// Check that the secure random source delivers bytes.
pub fn is_supported() -> Result<(), PrimitiveError> {
    let mut sample = [0u8; KEY_SIZE];
    OsRng
        .try_fill_bytes(&mut sample)
        .map_err(|e| PrimitiveError::RandomUnavailable(e.to_string()))
}

/// Generate a fresh X25519 key pair.
pub fn generate_key_pair() -> KeyPair {
    KeyPair::generate()
}

/// Encode a public key for the wire.
pub fn export_public_key(public: &PublicKey) -> String {
    BASE64.encode(public.as_bytes())
}

/// Decode a wire public key, rejecting malformed and low-order points.
pub fn import_public_key(encoded: &str) -> Result<PublicKey, PrimitiveError> {
    let bytes = BASE64
        .decode(encoded.trim())
        .map_err(|e| PrimitiveError::InvalidKeyFormat(e.to_string()))?;
    public_key_from_bytes(&bytes)
}

/// Build a public key from raw bytes, with the same checks as [`import_public_key`].
pub fn public_key_from_bytes(bytes: &[u8]) -> Result<PublicKey, PrimitiveError> {
    let arr = <[u8; KEY_SIZE]>::try_from(bytes).map_err(|_| {
        PrimitiveError::InvalidKeyFormat(format!(
            "expected {KEY_SIZE} bytes, got {}",
            bytes.len()
        ))
    })?;
    let public = PublicKey::from(arr);

    // A clamped scalar clears the small-order component, so only a
    // low-order point yields an all-zero shared secret here.
    let check = StaticSecret::random_from_rng(OsRng);
    if !check.diffie_hellman(&public).was_contributory() {
        return Err(PrimitiveError::InvalidKeyFormat(
            "low-order public key".to_string(),
        ));
    }
    Ok(public)
}

/// X25519 ECDH followed by HKDF-SHA256.
pub fn derive_shared_secret(
    local_secret: &StaticSecret,
    remote_public: &PublicKey,
) -> Result<SymmetricKey, PrimitiveError> {
    let shared = local_secret.diffie_hellman(remote_public);
    if !shared.was_contributory() {
        return Err(PrimitiveError::InvalidKeyFormat(
            "non-contributory key agreement".to_string(),
        ));
    }
    let mut key = [0u8; KEY_SIZE];
    hkdf_expand(HKDF_SALT, shared.as_bytes(), HKDF_INFO, &mut key)?;
    Ok(SymmetricKey(key))
}

/// HKDF-SHA256 extract-and-expand into `out`.
pub fn hkdf_expand(
    salt: &[u8],
    input_key_material: &[u8],
    info: &[u8],
    out: &mut [u8],
) -> Result<(), PrimitiveError> {
    let hk = Hkdf::<Sha256>::new(Some(salt), input_key_material);
    hk.expand(info, out)
        .map_err(|e| PrimitiveError::KeyDerivation(e.to_string()))
}

/// ChaCha20-Poly1305 encryption. The returned ciphertext includes the 16-byte tag.
pub fn aead_encrypt(
    plaintext: &[u8],
    key: &SymmetricKey,
    nonce: &[u8; NONCE_SIZE],
    aad: &[u8],
) -> Result<Vec<u8>, PrimitiveError> {
    let cipher = ChaCha20Poly1305::new(Key::from_slice(key.as_bytes()));
    cipher
        .encrypt(
            Nonce::from_slice(nonce),
            Payload {
                msg: plaintext,
                aad,
            },
        )
        .map_err(|e| PrimitiveError::Encryption(e.to_string()))
}

/// ChaCha20-Poly1305 decryption; any tampering yields `AuthenticationFailed`.
pub fn aead_decrypt(
    ciphertext: &[u8],
    key: &SymmetricKey,
    nonce: &[u8],
    aad: &[u8],
) -> Result<Vec<u8>, PrimitiveError> {
    if nonce.len() != NONCE_SIZE {
        return Err(PrimitiveError::InvalidNonceLength {
            expected: NONCE_SIZE,
            actual: nonce.len(),
        });
    }
    let cipher = ChaCha20Poly1305::new(Key::from_slice(key.as_bytes()));
    cipher
        .decrypt(
            Nonce::from_slice(nonce),
            Payload {
                msg: ciphertext,
                aad,
            },
        )
        .map_err(|_| PrimitiveError::AuthenticationFailed)
}

/// Derive a key from arbitrary material with Argon2id and fixed cost parameters.
pub fn derive_key_from_material(
    material: &[u8],
    salt: &[u8],
) -> Result<SymmetricKey, PrimitiveError> {
    let params = Params::new(ARGON2_M_COST, ARGON2_T_COST, ARGON2_P_COST, Some(KEY_SIZE))
        .map_err(|e| PrimitiveError::KeyDerivation(e.to_string()))?;
    let argon2 = Argon2::new(Algorithm::Argon2id, Version::V0x13, params);
    let mut key = [0u8; KEY_SIZE];
    argon2
        .hash_password_into(material, salt, &mut key)
        .map_err(|e| PrimitiveError::KeyDerivation(e.to_string()))?;
    Ok(SymmetricKey(key))
}

/// Fresh random nonce.
pub fn random_nonce() -> [u8; NONCE_SIZE] {
    let mut nonce = [0u8; NONCE_SIZE];
    OsRng.fill_bytes(&mut nonce);
    nonce
}

/// Fresh random salt.
pub fn random_salt() -> [u8; SALT_SIZE] {
    let mut salt = [0u8; SALT_SIZE];
    OsRng.fill_bytes(&mut salt);
    salt
}

//! Wire types: the encrypted message envelope and the key-exchange offer.
//!
//! [`Envelope`] is a closed, validated structure. Its JSON form uses the
//! camelCase field names of the chat transport and is checked on the way in:
//! base64 payloads, a 12-byte nonce, a well-formed ratchet key.

use base64::{Engine, engine::general_purpose::STANDARD as BASE64};
use serde::{Deserialize, Serialize};
use x25519_dalek::PublicKey;

use crate::error::ProtocolError;
use crate::primitives::{self, KEY_SIZE, NONCE_SIZE};

const AAD_LABEL: &[u8] = b"cipherchat-envelope-v1";

/// Ratchet metadata carried by every message of a ratcheted conversation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RatchetHeader {
    /// The sender's current ratchet public key.
    pub public_key: PublicKey,
    /// Messages the sender sent in its previous sending epoch.
    pub previous_counter: u32,
}

impl RatchetHeader {
    pub fn key_bytes(&self) -> [u8; KEY_SIZE] {
        *self.public_key.as_bytes()
    }
}

/// An encrypted message as it travels between peers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "WireEnvelope", into = "WireEnvelope")]
pub struct Envelope {
    /// AEAD output, tag included.
    pub ciphertext: Vec<u8>,
    pub nonce: [u8; NONCE_SIZE],
    pub sequence_number: u32,
    pub conversation_id: String,
    /// Milliseconds since the Unix epoch.
    pub timestamp: i64,
    pub sender: String,
    pub ratchet: Option<RatchetHeader>,
}

impl Envelope {
    pub fn to_json(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(|e| ProtocolError::InvalidEnvelope(e.to_string()))
    }

    pub fn from_json(json: &str) -> Result<Self, ProtocolError> {
        serde_json::from_str(json).map_err(|e| ProtocolError::InvalidEnvelope(e.to_string()))
    }

    /// Associated data the ciphertext is bound to.
    pub fn associated_data(&self) -> Vec<u8> {
        associated_data(
            &self.conversation_id,
            &self.sender,
            self.sequence_number,
            self.timestamp,
            self.ratchet.as_ref(),
        )
    }
}

/// Length-prefixed encoding of every envelope field except the ciphertext and nonce.
pub fn associated_data(
    conversation_id: &str,
    sender: &str,
    sequence_number: u32,
    timestamp: i64,
    ratchet: Option<&RatchetHeader>,
) -> Vec<u8> {
    let mut aad = Vec::with_capacity(
        AAD_LABEL.len() + conversation_id.len() + sender.len() + 16 + 1 + KEY_SIZE + 4,
    );
    aad.extend_from_slice(AAD_LABEL);
    push_field(&mut aad, conversation_id.as_bytes());
    push_field(&mut aad, sender.as_bytes());
    aad.extend_from_slice(&sequence_number.to_be_bytes());
    aad.extend_from_slice(&timestamp.to_be_bytes());
    match ratchet {
        Some(header) => {
            aad.push(1);
            aad.extend_from_slice(header.public_key.as_bytes());
            aad.extend_from_slice(&header.previous_counter.to_be_bytes());
        }
        None => aad.push(0),
    }
    aad
}

#[allow(clippy::cast_possible_truncation)]
fn push_field(buf: &mut Vec<u8>, field: &[u8]) {
    buf.extend_from_slice(&(field.len() as u32).to_be_bytes());
    buf.extend_from_slice(field);
}

/// JSON shape of an [`Envelope`].
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireEnvelope {
    encrypted_content: String,
    nonce: String,
    sequence_number: u32,
    conversation_id: String,
    timestamp: i64,
    sender: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    ratchet_public_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    previous_counter: Option<u32>,
}

impl TryFrom<WireEnvelope> for Envelope {
    type Error = ProtocolError;

    fn try_from(wire: WireEnvelope) -> Result<Self, Self::Error> {
        if wire.conversation_id.is_empty() {
            return Err(ProtocolError::InvalidEnvelope(
                "conversationId must not be empty".into(),
            ));
        }

        let ciphertext = BASE64
            .decode(&wire.encrypted_content)
            .map_err(|e| ProtocolError::InvalidEnvelope(format!("encryptedContent: {e}")))?;
        let nonce_bytes = BASE64
            .decode(&wire.nonce)
            .map_err(|e| ProtocolError::InvalidEnvelope(format!("nonce: {e}")))?;
        let nonce = <[u8; NONCE_SIZE]>::try_from(nonce_bytes.as_slice()).map_err(|_| {
            ProtocolError::InvalidEnvelope(format!(
                "nonce must be {NONCE_SIZE} bytes, got {}",
                nonce_bytes.len()
            ))
        })?;

        let ratchet = match (wire.ratchet_public_key, wire.previous_counter) {
            (Some(key), previous) => Some(RatchetHeader {
                public_key: primitives::import_public_key(&key)
                    .map_err(|e| ProtocolError::InvalidEnvelope(format!("ratchetPublicKey: {e}")))?,
                previous_counter: previous.unwrap_or(0),
            }),
            (None, Some(_)) => {
                return Err(ProtocolError::InvalidEnvelope(
                    "previousCounter requires ratchetPublicKey".into(),
                ));
            }
            (None, None) => None,
        };

        Ok(Self {
            ciphertext,
            nonce,
            sequence_number: wire.sequence_number,
            conversation_id: wire.conversation_id,
            timestamp: wire.timestamp,
            sender: wire.sender,
            ratchet,
        })
    }
}

impl From<Envelope> for WireEnvelope {
    fn from(envelope: Envelope) -> Self {
        Self {
            encrypted_content: BASE64.encode(&envelope.ciphertext),
            nonce: BASE64.encode(envelope.nonce),
            sequence_number: envelope.sequence_number,
            conversation_id: envelope.conversation_id,
            timestamp: envelope.timestamp,
            sender: envelope.sender,
            ratchet_public_key: envelope
                .ratchet
                .map(|h| primitives::export_public_key(&h.public_key)),
            previous_counter: envelope.ratchet.map(|h| h.previous_counter),
        }
    }
}

/// The first message of a key exchange, carrying the offerer's public key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KeyExchangeOffer {
    pub conversation_id: String,
    /// Base64 X25519 public key.
    pub public_key: String,
    pub sender: String,
    /// Milliseconds since the Unix epoch.
    pub timestamp: i64,
}

impl KeyExchangeOffer {
    pub fn to_json(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(|e| ProtocolError::InvalidEnvelope(e.to_string()))
    }

    pub fn from_json(json: &str) -> Result<Self, ProtocolError> {
        serde_json::from_str(json).map_err(|e| ProtocolError::InvalidEnvelope(e.to_string()))
    }
}

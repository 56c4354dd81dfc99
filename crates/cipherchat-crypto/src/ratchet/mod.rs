//! Ratchet engine.
//!
//! Keeps a Double Ratchet per conversation and drives the [`MessageCodec`]
//! with the message keys it derives. All receive-side work runs on a copy of
//! the conversation state that is committed only once the message decrypts.

mod state;

use std::collections::HashMap;

use serde::Serialize;
use tracing::debug;
use x25519_dalek::PublicKey;

use crate::codec::{Frame, MessageCodec};
use crate::envelope::{Envelope, RatchetHeader};
use crate::error::{PrimitiveError, ProtocolError};
use crate::identity::KeyPair;
use crate::primitives::{self, SymmetricKey};

use state::{RatchetState, ReceivingEpoch};

/// Non-secret view of a conversation's ratchet, for diagnostics.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RatchetSnapshot {
    pub conversation_id: String,
    pub local_ratchet_key: String,
    pub remote_ratchet_key: String,
    pub sending_counter: u32,
    pub receiving_counter: u32,
    pub previous_sending_counter: u32,
    pub skipped_key_count: usize,
    pub next_sequence_number: u32,
}

/// Double Ratchet sessions for all conversations.
#[derive(Debug)]
pub struct RatchetEngine {
    codec: MessageCodec,
    max_skip: u32,
    states: HashMap<String, RatchetState>,
}

impl RatchetEngine {
    pub fn new(codec: MessageCodec, max_skip: u32) -> Self {
        Self {
            codec,
            max_skip,
            states: HashMap::new(),
        }
    }

    pub const fn codec(&self) -> &MessageCodec {
        &self.codec
    }

    pub const fn codec_mut(&mut self) -> &mut MessageCodec {
        &mut self.codec
    }

    /// Create (or replace) the ratchet of a conversation.
    ///
    /// Exactly one side of a conversation should be the initiator; it takes a
    /// sending step at once so its first message already uses a fresh key.
    pub fn initialize(
        &mut self,
        conversation_id: &str,
        shared_secret: &SymmetricKey,
        local_identity: &KeyPair,
        remote_public_key: PublicKey,
        is_initiator: bool,
    ) -> Result<(), ProtocolError> {
        let mut state = RatchetState::new(shared_secret, local_identity, remote_public_key);
        if is_initiator {
            state.send_step()?;
        }

        self.codec.clear(conversation_id);
        self.codec.record_rotation(conversation_id);
        self.states.insert(conversation_id.to_string(), state);
        debug!(conversation_id, is_initiator, "Ratchet initialized");
        Ok(())
    }

    pub fn is_initialized(&self, conversation_id: &str) -> bool {
        self.states.contains_key(conversation_id)
    }

    pub fn conversation_ids(&self) -> Vec<String> {
        self.states.keys().cloned().collect()
    }

    /// Encrypt the next message of a conversation.
    pub fn encrypt(
        &mut self,
        conversation_id: &str,
        sender: &str,
        plaintext: &[u8],
    ) -> Result<Envelope, ProtocolError> {
        let mut state = self
            .states
            .get(conversation_id)
            .ok_or(ProtocolError::NotInitialized)?
            .clone();

        if state.sending_counter >= self.codec.max_sequence_number() {
            state.send_step()?;
            self.codec.reset_sequence(conversation_id);
            debug!(conversation_id, "Sequence space exhausted, ratchet stepped");
        }

        let header = RatchetHeader {
            public_key: *state.sending.key_pair.public_key(),
            previous_counter: state.previous_sending_counter,
        };
        let message_key = state.next_sending_key()?;
        let envelope = self.codec.encrypt(
            plaintext,
            &message_key,
            Frame {
                conversation_id,
                sender,
                ratchet: Some(header),
            },
        )?;

        self.states.insert(conversation_id.to_string(), state);
        Ok(envelope)
    }

    /// Decrypt an incoming envelope, ratcheting forward when it carries a new key.
    pub fn decrypt(&mut self, envelope: &Envelope) -> Result<Vec<u8>, ProtocolError> {
        self.decrypt_with(envelope, Ok)
    }

    /// Decrypt an incoming envelope and hand the plaintext to `accept`.
    ///
    /// The conversation state advances only if `accept` succeeds too, so a
    /// payload the caller rejects leaves the message undelivered and its key
    /// unconsumed.
    pub fn decrypt_with<T>(
        &mut self,
        envelope: &Envelope,
        accept: impl FnOnce(Vec<u8>) -> Result<T, ProtocolError>,
    ) -> Result<T, ProtocolError> {
        let conversation_id = envelope.conversation_id.as_str();
        let current = self
            .states
            .get(conversation_id)
            .ok_or(ProtocolError::NotInitialized)?;
        let header = envelope.ratchet.ok_or_else(|| {
            ProtocolError::InvalidEnvelope("missing ratchet header".to_string())
        })?;
        self.codec.verify_sequence_number(envelope)?;

        let epoch = header.key_bytes();
        let sequence = envelope.sequence_number;

        if let Some(cached) = current.skipped.get(&epoch, sequence).cloned() {
            let accepted = accept(self.codec.open(envelope, &cached)?)?;
            if let Some(state) = self.states.get_mut(conversation_id) {
                state.skipped.remove(&epoch, sequence);
            }
            self.codec.record_received(envelope);
            debug!(conversation_id, sequence, "Decrypted with cached skipped key");
            return Ok(accepted);
        }

        let mut working = current.clone();
        if working.knows_remote(&header.public_key) {
            let message_key = working.receiving_key(&header.public_key, sequence, self.max_skip)?;
            let accepted = accept(self.codec.open(envelope, &message_key)?)?;
            self.commit(envelope, working);
            return Ok(accepted);
        }

        if sequence > self.max_skip {
            return Err(ProtocolError::TooManySkippedMessages {
                requested: u64::from(sequence),
                max_skip: self.max_skip,
            });
        }
        working.skip_current(header.previous_counter, self.max_skip)?;

        // The peer derived its epoch from one of our key pairs and one of the
        // roots it knows we hold.
        let mut last_error = ProtocolError::Primitive(PrimitiveError::AuthenticationFailed);
        for base in working.receiving_roots() {
            for own in working.own_epochs() {
                let candidate = ReceivingEpoch::derive(&own.key_pair, &base, header.public_key)?;
                let message_key = candidate.peek_key(sequence)?;
                let plaintext = match self.codec.open(envelope, &message_key) {
                    Ok(plaintext) => plaintext,
                    Err(err) => {
                        last_error = err;
                        continue;
                    }
                };

                working.adopt(candidate, own.key_pair.public_key());
                working.receiving_key(&header.public_key, sequence, self.max_skip)?;
                working.send_step()?;
                let accepted = accept(plaintext)?;

                self.codec.reset_sequence(conversation_id);
                self.commit(envelope, working);
                debug!(conversation_id, sequence, "Ratchet stepped on new peer key");
                return Ok(accepted);
            }
        }
        Err(last_error)
    }

    fn commit(&mut self, envelope: &Envelope, state: RatchetState) {
        self.codec.record_received(envelope);
        self.states.insert(envelope.conversation_id.clone(), state);
    }

    /// Start a new sending epoch without waiting for the peer.
    pub fn rotate(&mut self, conversation_id: &str) -> Result<(), ProtocolError> {
        let state = self
            .states
            .get_mut(conversation_id)
            .ok_or(ProtocolError::NotInitialized)?;
        let mut next = state.clone();
        next.send_step()?;
        *state = next;

        self.codec.reset_sequence(conversation_id);
        self.codec.record_rotation(conversation_id);
        debug!(conversation_id, "Ratchet rotated");
        Ok(())
    }

    pub fn skipped_key_count(&self, conversation_id: &str) -> usize {
        self.states
            .get(conversation_id)
            .map_or(0, |s| s.skipped.len())
    }

    /// Drop cached skipped keys far behind the receiving counter. Returns how many went.
    pub fn prune_skipped_keys(&mut self, conversation_id: &str, keep_window: u32) -> usize {
        self.states
            .get_mut(conversation_id)
            .map_or(0, |s| s.prune_skipped(keep_window))
    }

    pub fn export_state(&self, conversation_id: &str) -> Option<RatchetSnapshot> {
        let state = self.states.get(conversation_id)?;
        Some(RatchetSnapshot {
            conversation_id: conversation_id.to_string(),
            local_ratchet_key: primitives::export_public_key(state.sending.key_pair.public_key()),
            remote_ratchet_key: primitives::export_public_key(state.receiving_public_key()),
            sending_counter: state.sending_counter,
            receiving_counter: state.receiving.counter,
            previous_sending_counter: state.previous_sending_counter,
            skipped_key_count: state.skipped.len(),
            next_sequence_number: self.codec.next_sequence_number(conversation_id),
        })
    }

    /// Drop the ratchet of a conversation, keeping its codec history.
    pub fn reset(&mut self, conversation_id: &str) -> bool {
        self.states.remove(conversation_id).is_some()
    }

    /// Drop the ratchet and all codec state of a conversation.
    pub fn clear(&mut self, conversation_id: &str) {
        self.states.remove(conversation_id);
        self.codec.clear(conversation_id);
    }

    pub fn clear_all(&mut self) {
        self.states.clear();
        self.codec.clear_all();
    }
}

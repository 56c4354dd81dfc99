//! Message codec.
//!
//! Frames plaintext into [`Envelope`]s and back. Owns per-conversation
//! outgoing sequence numbers, the anti-replay receive window and the time of
//! the last key rotation. Keys are supplied by the caller.

use std::collections::{HashMap, HashSet, VecDeque};
use std::time::{Duration, SystemTime};

use cipherchat_core::db::unix_timestamp_millis;
use tracing::warn;

use crate::envelope::{Envelope, RatchetHeader, associated_data};
use crate::error::ProtocolError;
use crate::primitives::{self, KEY_SIZE, SymmetricKey};

/// Replay-window entry: the sender's epoch key (if any) and a sequence number.
type WindowEntry = (Option<[u8; KEY_SIZE]>, u32);

/// Fixed-capacity set of recently received messages, oldest evicted first.
#[derive(Debug, Clone, Default)]
pub struct ReplayWindow {
    order: VecDeque<WindowEntry>,
    seen: HashSet<WindowEntry>,
}

impl ReplayWindow {
    pub fn contains(&self, epoch: Option<[u8; KEY_SIZE]>, sequence: u32) -> bool {
        self.seen.contains(&(epoch, sequence))
    }

    /// Record an entry, evicting the oldest ones beyond `capacity`.
    pub fn insert(&mut self, epoch: Option<[u8; KEY_SIZE]>, sequence: u32, capacity: usize) {
        if !self.seen.insert((epoch, sequence)) {
            return;
        }
        self.order.push_back((epoch, sequence));
        while self.order.len() > capacity {
            if let Some(evicted) = self.order.pop_front() {
                self.seen.remove(&evicted);
            }
        }
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }
}

/// Per-message framing input for [`MessageCodec::encrypt`].
#[derive(Debug, Clone, Copy)]
pub struct Frame<'a> {
    pub conversation_id: &'a str,
    pub sender: &'a str,
    pub ratchet: Option<RatchetHeader>,
}

#[derive(Debug, Clone, Default)]
struct CodecState {
    next_sequence: u32,
    window: ReplayWindow,
    last_rotation: Option<SystemTime>,
}

/// Sequence numbering, replay protection and AEAD framing for all conversations.
#[derive(Debug, Clone)]
pub struct MessageCodec {
    max_sequence_number: u32,
    window_capacity: usize,
    conversations: HashMap<String, CodecState>,
}

impl MessageCodec {
    pub fn new(max_sequence_number: u32, window_capacity: usize) -> Self {
        Self {
            max_sequence_number,
            window_capacity,
            conversations: HashMap::new(),
        }
    }

    pub const fn max_sequence_number(&self) -> u32 {
        self.max_sequence_number
    }

    /// The sequence number the next `encrypt` for this conversation will use.
    pub fn next_sequence_number(&self, conversation_id: &str) -> u32 {
        self.conversations
            .get(conversation_id)
            .map_or(0, |s| s.next_sequence)
    }

    /// Restart outgoing numbering at 0.
    pub fn reset_sequence(&mut self, conversation_id: &str) {
        self.state_mut(conversation_id).next_sequence = 0;
    }

    /// Encrypt `plaintext` under `key` into a new envelope.
    ///
    /// The sequence number is consumed only when encryption succeeds.
    pub fn encrypt(
        &mut self,
        plaintext: &[u8],
        key: &SymmetricKey,
        frame: Frame<'_>,
    ) -> Result<Envelope, ProtocolError> {
        let sequence_number = self.next_sequence_number(frame.conversation_id);
        let timestamp = unix_timestamp_millis();
        let nonce = primitives::random_nonce();
        let aad = associated_data(
            frame.conversation_id,
            frame.sender,
            sequence_number,
            timestamp,
            frame.ratchet.as_ref(),
        );

        let ciphertext = primitives::aead_encrypt(plaintext, key, &nonce, &aad)?;

        let max = self.max_sequence_number;
        self.state_mut(frame.conversation_id).next_sequence = if sequence_number >= max {
            1
        } else {
            sequence_number + 1
        };

        Ok(Envelope {
            ciphertext,
            nonce,
            sequence_number,
            conversation_id: frame.conversation_id.to_string(),
            timestamp,
            sender: frame.sender.to_string(),
            ratchet: frame.ratchet,
        })
    }

    /// Reject an envelope whose sequence number is already in the receive window.
    pub fn verify_sequence_number(&self, envelope: &Envelope) -> Result<(), ProtocolError> {
        let epoch = envelope.ratchet.map(|h| h.key_bytes());
        let replayed = self
            .conversations
            .get(&envelope.conversation_id)
            .is_some_and(|s| s.window.contains(epoch, envelope.sequence_number));
        if replayed {
            warn!(
                conversation_id = %envelope.conversation_id,
                sequence = envelope.sequence_number,
                "Replayed message rejected"
            );
            return Err(ProtocolError::ReplayDetected {
                sequence: envelope.sequence_number,
            });
        }
        Ok(())
    }

    /// Verify, decrypt, then record the sequence number.
    ///
    /// Nothing is recorded when decryption fails.
    pub fn decrypt(
        &mut self,
        envelope: &Envelope,
        key: &SymmetricKey,
    ) -> Result<Vec<u8>, ProtocolError> {
        let plaintext = self.open(envelope, key)?;
        self.record_received(envelope);
        Ok(plaintext)
    }

    /// Verify and decrypt without recording anything.
    pub fn open(&self, envelope: &Envelope, key: &SymmetricKey) -> Result<Vec<u8>, ProtocolError> {
        self.verify_sequence_number(envelope)?;
        Ok(primitives::aead_decrypt(
            &envelope.ciphertext,
            key,
            &envelope.nonce,
            &envelope.associated_data(),
        )?)
    }

    /// Add an accepted envelope to the receive window.
    pub fn record_received(&mut self, envelope: &Envelope) {
        let capacity = self.window_capacity;
        self.state_mut(&envelope.conversation_id).window.insert(
            envelope.ratchet.map(|h| h.key_bytes()),
            envelope.sequence_number,
            capacity,
        );
    }

    /// Number of entries in a conversation's receive window.
    pub fn window_len(&self, conversation_id: &str) -> usize {
        self.conversations
            .get(conversation_id)
            .map_or(0, |s| s.window.len())
    }

    pub fn record_rotation(&mut self, conversation_id: &str) {
        self.record_rotation_at(conversation_id, SystemTime::now());
    }

    pub fn record_rotation_at(&mut self, conversation_id: &str, at: SystemTime) {
        self.state_mut(conversation_id).last_rotation = Some(at);
    }

    pub fn last_rotation(&self, conversation_id: &str) -> Option<SystemTime> {
        self.conversations
            .get(conversation_id)
            .and_then(|s| s.last_rotation)
    }

    /// Whether at least `interval` has passed since the last rotation.
    pub fn should_rotate(&self, conversation_id: &str, interval: Duration) -> bool {
        self.should_rotate_at(conversation_id, interval, SystemTime::now())
    }

    /// [`Self::should_rotate`] against an explicit clock reading.
    ///
    /// A conversation without a recorded rotation is due. A clock that moved
    /// backwards is never due.
    pub fn should_rotate_at(
        &self,
        conversation_id: &str,
        interval: Duration,
        now: SystemTime,
    ) -> bool {
        self.last_rotation(conversation_id).is_none_or(|last| {
            now.duration_since(last)
                .is_ok_and(|elapsed| elapsed >= interval)
        })
    }

    /// Forget counters, window and rotation time of one conversation.
    pub fn clear(&mut self, conversation_id: &str) {
        self.conversations.remove(conversation_id);
    }

    pub fn clear_all(&mut self) {
        self.conversations.clear();
    }

    fn state_mut(&mut self, conversation_id: &str) -> &mut CodecState {
        self.conversations
            .entry(conversation_id.to_string())
            .or_default()
    }
}

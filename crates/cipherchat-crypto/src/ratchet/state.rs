//! Per-conversation ratchet state and its key derivation chains.

use std::collections::{HashMap, VecDeque};

use x25519_dalek::PublicKey;
use zeroize::Zeroizing;

use crate::error::{PrimitiveError, ProtocolError};
use crate::identity::KeyPair;
use crate::primitives::{self, KEY_SIZE, SymmetricKey};

const ROOT_SALT: &[u8] = b"cipherchat-ratchet-root-v1";
const ROOT_INFO: &[u8] = b"cipherchat-ratchet-root-chain";
const CHAIN_SALT: &[u8] = b"cipherchat-ratchet-chain-v1";

const MESSAGE_KEY_TAG: u8 = 0x01;
const CHAIN_KEY_TAG: u8 = 0x02;

/// Superseded epochs kept per direction: our key pairs a peer may still
/// answer, and peer epochs that may still deliver late messages.
const RETAINED_EPOCHS: usize = 8;

/// `KDF_RK`: mix a DH output into a root key, yielding a new root and a chain key.
pub(crate) fn kdf_root(
    root: &SymmetricKey,
    dh_output: &[u8; KEY_SIZE],
) -> Result<(SymmetricKey, SymmetricKey), PrimitiveError> {
    let mut salt = Zeroizing::new(Vec::with_capacity(ROOT_SALT.len() + KEY_SIZE));
    salt.extend_from_slice(ROOT_SALT);
    salt.extend_from_slice(root.as_bytes());

    let mut okm = Zeroizing::new([0u8; 2 * KEY_SIZE]);
    primitives::hkdf_expand(&salt, dh_output, ROOT_INFO, okm.as_mut_slice())?;

    let mut new_root = [0u8; KEY_SIZE];
    let mut chain = [0u8; KEY_SIZE];
    new_root.copy_from_slice(&okm[..KEY_SIZE]);
    chain.copy_from_slice(&okm[KEY_SIZE..]);
    Ok((SymmetricKey::from_bytes(new_root), SymmetricKey::from_bytes(chain)))
}

/// Message key for `counter` in the chain.
pub(crate) fn message_key(
    chain: &SymmetricKey,
    counter: u32,
) -> Result<SymmetricKey, PrimitiveError> {
    let mut info = [0u8; 5];
    info[0] = MESSAGE_KEY_TAG;
    info[1..].copy_from_slice(&counter.to_be_bytes());
    chain_derive(chain, &info)
}

/// Next chain key.
pub(crate) fn advance_chain(chain: &SymmetricKey) -> Result<SymmetricKey, PrimitiveError> {
    chain_derive(chain, &[CHAIN_KEY_TAG])
}

fn chain_derive(chain: &SymmetricKey, info: &[u8]) -> Result<SymmetricKey, PrimitiveError> {
    let mut out = [0u8; KEY_SIZE];
    primitives::hkdf_expand(CHAIN_SALT, chain.as_bytes(), info, &mut out)?;
    Ok(SymmetricKey::from_bytes(out))
}

/// Raw X25519 output between one of our key pairs and a peer key.
fn dh(own: &KeyPair, remote: &PublicKey) -> Result<Zeroizing<[u8; KEY_SIZE]>, PrimitiveError> {
    let shared = own.secret().diffie_hellman(remote);
    if !shared.was_contributory() {
        return Err(PrimitiveError::InvalidKeyFormat(
            "non-contributory ratchet key".to_string(),
        ));
    }
    Ok(Zeroizing::new(*shared.as_bytes()))
}

type SkippedId = ([u8; KEY_SIZE], u32);

/// Message keys derived ahead of delivery, keyed by sender ratchet key and counter.
///
/// Bounded: inserting past the capacity evicts the oldest entries.
#[derive(Debug, Clone, Default)]
pub(crate) struct SkippedKeys {
    keys: HashMap<SkippedId, SymmetricKey>,
    order: VecDeque<SkippedId>,
}

impl SkippedKeys {
    pub(crate) fn get(&self, epoch: &[u8; KEY_SIZE], counter: u32) -> Option<&SymmetricKey> {
        self.keys.get(&(*epoch, counter))
    }

    pub(crate) fn remove(&mut self, epoch: &[u8; KEY_SIZE], counter: u32) {
        self.keys.remove(&(*epoch, counter));
    }

    pub(crate) fn insert(
        &mut self,
        epoch: [u8; KEY_SIZE],
        counter: u32,
        key: SymmetricKey,
        capacity: usize,
    ) {
        if self.keys.insert((epoch, counter), key).is_none() {
            self.order.push_back((epoch, counter));
        }
        while self.keys.len() > capacity {
            match self.order.pop_front() {
                Some(oldest) => {
                    self.keys.remove(&oldest);
                }
                None => break,
            }
        }
        if self.order.len() > capacity.saturating_mul(2) {
            let keys = &self.keys;
            self.order.retain(|id| keys.contains_key(id));
        }
    }

    /// Keep only the entries for which `keep` returns true.
    pub(crate) fn retain(&mut self, mut keep: impl FnMut(&[u8; KEY_SIZE], u32) -> bool) -> usize {
        let before = self.keys.len();
        self.keys.retain(|(epoch, counter), _| keep(epoch, *counter));
        let keys = &self.keys;
        self.order.retain(|id| keys.contains_key(id));
        before - self.keys.len()
    }

    pub(crate) fn len(&self) -> usize {
        self.keys.len()
    }
}

/// One of our sending epochs: its ratchet key pair and the root it produced.
#[derive(Debug, Clone)]
pub(crate) struct SendingEpoch {
    pub(crate) key_pair: KeyPair,
    pub(crate) root: SymmetricKey,
}

/// One peer epoch we have received from, with its own receiving chain.
#[derive(Debug, Clone)]
pub(crate) struct ReceivingEpoch {
    pub(crate) public_key: PublicKey,
    pub(crate) root: SymmetricKey,
    pub(crate) chain_key: SymmetricKey,
    pub(crate) counter: u32,
}

impl ReceivingEpoch {
    /// The epoch a peer opens with `remote`, derived from `base` and our key pair `own`.
    pub(crate) fn derive(
        own: &KeyPair,
        base: &SymmetricKey,
        remote: PublicKey,
    ) -> Result<Self, PrimitiveError> {
        let dh_output = dh(own, &remote)?;
        let (root, chain_key) = kdf_root(base, &dh_output)?;
        Ok(Self {
            public_key: remote,
            root,
            chain_key,
            counter: 0,
        })
    }

    /// Message key for `sequence` without advancing the chain.
    pub(crate) fn peek_key(&self, sequence: u32) -> Result<SymmetricKey, PrimitiveError> {
        let mut chain = self.chain_key.clone();
        for _ in self.counter..sequence {
            chain = advance_chain(&chain)?;
        }
        message_key(&chain, sequence)
    }

    /// Cache this chain's keys up to `until` (exclusive) in `skipped`.
    fn skip_until(
        &mut self,
        until: u32,
        skipped: &mut SkippedKeys,
        capacity: usize,
    ) -> Result<(), PrimitiveError> {
        let epoch = *self.public_key.as_bytes();
        while self.counter < until {
            let key = message_key(&self.chain_key, self.counter)?;
            skipped.insert(epoch, self.counter, key, capacity);
            self.chain_key = advance_chain(&self.chain_key)?;
            self.counter += 1;
        }
        Ok(())
    }
}

/// Double Ratchet state for one conversation.
///
/// Each direction keeps its own root chains. A sending step mixes a fresh key
/// pair with the peer's last known key into the root of our newest epoch the
/// peer has answered, so every epoch the peer has not yet seen can be derived
/// on its own: reordered or entirely lost epochs do not stall the ones after.
/// Received peer epochs keep their chains, so late messages of an earlier
/// epoch still decrypt.
#[derive(Debug, Clone)]
pub(crate) struct RatchetState {
    /// Root new sending epochs are derived from.
    pub(crate) acknowledged_root: SymmetricKey,
    /// Our key pair the peer most recently answered.
    pub(crate) acknowledged_key: PublicKey,
    pub(crate) sending: SendingEpoch,
    /// Superseded sending epochs, newest first.
    pub(crate) retained: VecDeque<SendingEpoch>,
    pub(crate) sending_chain_key: SymmetricKey,
    pub(crate) sending_counter: u32,
    pub(crate) previous_sending_counter: u32,
    /// The peer epoch we received most recently.
    pub(crate) receiving: ReceivingEpoch,
    /// Earlier peer epochs, newest first.
    pub(crate) previous_receiving: VecDeque<ReceivingEpoch>,
    pub(crate) skipped: SkippedKeys,
}

impl RatchetState {
    /// State with every root and chain set to the shared secret and the
    /// identity key pairs as the first ratchet keys.
    pub(crate) fn new(
        shared_secret: &SymmetricKey,
        local_identity: &KeyPair,
        remote_public_key: PublicKey,
    ) -> Self {
        Self {
            acknowledged_root: shared_secret.clone(),
            acknowledged_key: *local_identity.public_key(),
            sending: SendingEpoch {
                key_pair: local_identity.clone(),
                root: shared_secret.clone(),
            },
            retained: VecDeque::new(),
            sending_chain_key: shared_secret.clone(),
            sending_counter: 0,
            previous_sending_counter: 0,
            receiving: ReceivingEpoch {
                public_key: remote_public_key,
                root: shared_secret.clone(),
                chain_key: shared_secret.clone(),
                counter: 0,
            },
            previous_receiving: VecDeque::new(),
            skipped: SkippedKeys::default(),
        }
    }

    pub(crate) fn receiving_public_key(&self) -> &PublicKey {
        &self.receiving.public_key
    }

    /// Start a new sending epoch with a fresh key pair.
    ///
    /// A step taken before anything was sent keeps the previous counter of
    /// the last epoch that carried messages.
    pub(crate) fn send_step(&mut self) -> Result<(), PrimitiveError> {
        let fresh = KeyPair::generate();
        let dh_output = dh(&fresh, &self.receiving.public_key)?;
        let (root, chain) = kdf_root(&self.acknowledged_root, &dh_output)?;

        if self.sending_counter > 0 {
            self.previous_sending_counter = self.sending_counter;
        }
        self.sending_chain_key = chain;
        self.sending_counter = 0;

        let previous = std::mem::replace(
            &mut self.sending,
            SendingEpoch {
                key_pair: fresh,
                root,
            },
        );
        self.retained.push_front(previous);
        self.retained.truncate(RETAINED_EPOCHS);
        Ok(())
    }

    /// Our sending epochs a peer may have answered, newest first.
    pub(crate) fn own_epochs(&self) -> Vec<SendingEpoch> {
        std::iter::once(&self.sending)
            .chain(self.retained.iter())
            .cloned()
            .collect()
    }

    /// Roots a peer may have derived its next epoch from, newest first.
    pub(crate) fn receiving_roots(&self) -> Vec<SymmetricKey> {
        std::iter::once(&self.receiving)
            .chain(self.previous_receiving.iter())
            .map(|epoch| epoch.root.clone())
            .collect()
    }

    /// Whether `remote` opened an epoch we already receive on.
    pub(crate) fn knows_remote(&self, remote: &PublicKey) -> bool {
        self.receiving.public_key == *remote
            || self
                .previous_receiving
                .iter()
                .any(|epoch| epoch.public_key == *remote)
    }

    /// Make `epoch` the current receiving epoch. `answered` is our key pair
    /// the peer derived it with, which the peer has therefore seen.
    pub(crate) fn adopt(&mut self, epoch: ReceivingEpoch, answered: &PublicKey) {
        let previous = std::mem::replace(&mut self.receiving, epoch);
        self.previous_receiving.push_front(previous);
        self.previous_receiving.truncate(RETAINED_EPOCHS);
        self.acknowledge(answered);
    }

    /// Derive new sending epochs from the root of `answered` unless a newer
    /// one of ours was already answered.
    fn acknowledge(&mut self, answered: &PublicKey) {
        let epochs = self.own_epochs();
        let position = |key: &PublicKey| {
            epochs
                .iter()
                .position(|epoch| epoch.key_pair.public_key() == key)
        };
        let Some(new_position) = position(answered) else {
            return;
        };
        let newer = position(&self.acknowledged_key).is_none_or(|old| new_position <= old);
        if newer {
            self.acknowledged_root = epochs[new_position].root.clone();
            self.acknowledged_key = *answered;
        }
    }

    /// Derive the next sending message key and advance the chain.
    pub(crate) fn next_sending_key(&mut self) -> Result<SymmetricKey, PrimitiveError> {
        let key = message_key(&self.sending_chain_key, self.sending_counter)?;
        self.sending_chain_key = advance_chain(&self.sending_chain_key)?;
        self.sending_counter = self.sending_counter.saturating_add(1);
        Ok(key)
    }

    /// Cache keys of the current receiving chain up to `until`, at most
    /// `max_skip` of them.
    ///
    /// `until` is the peer's count for its previous epoch. That epoch need not
    /// be the one we hold, so the count is a hint and is capped instead of
    /// rejected.
    pub(crate) fn skip_current(&mut self, until: u32, max_skip: u32) -> Result<(), PrimitiveError> {
        let until = until.min(self.receiving.counter.saturating_add(max_skip));
        let capacity = usize::try_from(max_skip).unwrap_or(usize::MAX).max(1);
        self.receiving
            .skip_until(until, &mut self.skipped, capacity)
    }

    /// Derive the key for `sequence` in the epoch opened by `remote`,
    /// caching any gap before it.
    pub(crate) fn receiving_key(
        &mut self,
        remote: &PublicKey,
        sequence: u32,
        max_skip: u32,
    ) -> Result<SymmetricKey, ProtocolError> {
        let Self {
            receiving,
            previous_receiving,
            skipped,
            ..
        } = self;
        let epoch = std::iter::once(receiving)
            .chain(previous_receiving.iter_mut())
            .find(|epoch| epoch.public_key == *remote)
            .ok_or_else(|| ProtocolError::InvalidEnvelope("unknown ratchet key".to_string()))?;

        if sequence < epoch.counter {
            return Err(ProtocolError::MessageTooOld {
                sequence,
                receiving_counter: epoch.counter,
            });
        }
        let gap = sequence - epoch.counter;
        if gap > max_skip {
            return Err(ProtocolError::TooManySkippedMessages {
                requested: u64::from(gap),
                max_skip,
            });
        }

        let capacity = usize::try_from(max_skip).unwrap_or(usize::MAX).max(1);
        epoch.skip_until(sequence, skipped, capacity)?;
        let key = message_key(&epoch.chain_key, sequence)?;
        epoch.chain_key = advance_chain(&epoch.chain_key)?;
        epoch.counter = sequence.saturating_add(1);
        Ok(key)
    }

    /// Drop cached keys of the current receiving epoch more than `keep_window`
    /// counters behind, and every cached key of earlier epochs.
    pub(crate) fn prune_skipped(&mut self, keep_window: u32) -> usize {
        let current = *self.receiving.public_key.as_bytes();
        let floor = self.receiving.counter.saturating_sub(keep_window);
        self.skipped
            .retain(|epoch, counter| *epoch == current && counter >= floor)
    }
}

#[cfg(test)]
#[allow(clippy::panic, clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;

    fn secret() -> SymmetricKey {
        SymmetricKey::from_bytes([5u8; KEY_SIZE])
    }

    #[test]
    fn chain_derivation_is_one_way_and_counter_bound() {
        let chain = secret();
        let next = advance_chain(&chain).unwrap();
        let k0 = message_key(&chain, 0).unwrap();
        let k1 = message_key(&chain, 1).unwrap();

        assert_ne!(next, chain);
        assert_ne!(k0, k1);
        assert_ne!(k0, next);
        assert_eq!(message_key(&chain, 0).unwrap(), k0);
    }

    #[test]
    fn root_kdf_depends_on_root_and_dh_output() {
        let (r1, c1) = kdf_root(&secret(), &[1u8; KEY_SIZE]).unwrap();
        let (r2, _) = kdf_root(&secret(), &[2u8; KEY_SIZE]).unwrap();
        let (r3, _) = kdf_root(&SymmetricKey::from_bytes([6u8; KEY_SIZE]), &[1u8; KEY_SIZE]).unwrap();
        assert_ne!(r1, c1);
        assert_ne!(r1, r2);
        assert_ne!(r1, r3);
    }

    fn states() -> (RatchetState, KeyPair, RatchetState, KeyPair) {
        let alice_id = KeyPair::generate();
        let bob_id = KeyPair::generate();
        let alice = RatchetState::new(&secret(), &alice_id, *bob_id.public_key());
        let bob = RatchetState::new(&secret(), &bob_id, *alice_id.public_key());
        (alice, alice_id, bob, bob_id)
    }

    #[test]
    fn send_and_receive_steps_agree() {
        let (mut alice, _, bob, bob_id) = states();

        alice.send_step().unwrap();
        let epoch = ReceivingEpoch::derive(
            &bob_id,
            &bob.receiving.root,
            *alice.sending.key_pair.public_key(),
        )
        .unwrap();

        assert_eq!(alice.sending_chain_key, epoch.chain_key);
        assert_eq!(alice.sending.root, epoch.root);
    }

    #[test]
    fn unanswered_steps_share_the_acknowledged_root() {
        let (mut alice, _, bob, bob_id) = states();

        alice.send_step().unwrap();
        alice.next_sending_key().unwrap();
        alice.send_step().unwrap();
        let second = alice.sending.clone();
        alice.send_step().unwrap();

        // Each unanswered epoch derives from the same base, so the second
        // one is reachable without the first.
        let epoch = ReceivingEpoch::derive(
            &bob_id,
            &bob.receiving.root,
            *second.key_pair.public_key(),
        )
        .unwrap();
        assert_eq!(epoch.root, second.root);
        assert_eq!(alice.retained.len(), 3);
        assert_eq!(alice.previous_sending_counter, 1);
    }

    #[test]
    fn answer_moves_the_acknowledged_root_forward_only() {
        let (mut alice, alice_id, _, _) = states();
        alice.send_step().unwrap();
        let first = alice.sending.clone();
        alice.send_step().unwrap();
        let second = alice.sending.clone();

        alice.acknowledge(second.key_pair.public_key());
        assert_eq!(alice.acknowledged_root, second.root);

        alice.acknowledge(first.key_pair.public_key());
        alice.acknowledge(alice_id.public_key());
        assert_eq!(alice.acknowledged_root, second.root);
        assert_eq!(alice.acknowledged_key, *second.key_pair.public_key());
    }

    #[test]
    fn step_after_sending_records_previous_counter() {
        let (mut alice, _, _, _) = states();

        alice.send_step().unwrap();
        alice.next_sending_key().unwrap();
        alice.next_sending_key().unwrap();
        let chain_before = alice.sending_chain_key.clone();
        alice.send_step().unwrap();

        assert_eq!(alice.previous_sending_counter, 2);
        assert_eq!(alice.sending_counter, 0);
        assert_ne!(alice.sending_chain_key, chain_before);
    }

    #[test]
    fn adopted_epochs_keep_their_chains() {
        let (mut alice, _, mut bob, bob_id) = states();
        let original = *bob.receiving_public_key();

        alice.send_step().unwrap();
        let remote = *alice.sending.key_pair.public_key();
        let epoch = ReceivingEpoch::derive(&bob_id, &bob.receiving.root, remote).unwrap();
        bob.adopt(epoch, bob_id.public_key());

        assert_eq!(*bob.receiving_public_key(), remote);
        assert!(bob.knows_remote(&original));
        assert!(bob.knows_remote(&remote));
        assert_eq!(bob.receiving_roots().len(), 2);
        bob.receiving_key(&original, 0, 10).unwrap();
    }

    #[test]
    fn peek_matches_the_advanced_chain() {
        let kp = KeyPair::generate();
        let mut state = RatchetState::new(&secret(), &kp, *kp.public_key());
        let peeked = state.receiving.peek_key(3).unwrap();
        let remote = *kp.public_key();
        assert_eq!(state.receiving_key(&remote, 3, 10).unwrap(), peeked);
    }

    #[test]
    fn receiving_key_caches_gap_and_rejects_old() {
        let kp = KeyPair::generate();
        let remote = *kp.public_key();
        let mut state = RatchetState::new(&secret(), &kp, remote);

        let k2 = state.receiving_key(&remote, 2, 10).unwrap();
        assert_eq!(state.skipped.len(), 2);
        let chain = advance_chain(&advance_chain(&secret()).unwrap()).unwrap();
        assert_eq!(k2, message_key(&chain, 2).unwrap());

        assert!(matches!(
            state.receiving_key(&remote, 1, 10),
            Err(ProtocolError::MessageTooOld { sequence: 1, receiving_counter: 3 })
        ));
    }

    #[test]
    fn previous_count_hint_is_capped() {
        let kp = KeyPair::generate();
        let mut state = RatchetState::new(&secret(), &kp, *kp.public_key());

        state.skip_current(50, 10).unwrap();
        assert_eq!(state.skipped.len(), 10);
        assert_eq!(state.receiving.counter, 10);
    }

    #[test]
    fn gap_beyond_max_skip_is_rejected() {
        let kp = KeyPair::generate();
        let mut state = RatchetState::new(&secret(), &kp, *kp.public_key());

        let remote = *kp.public_key();
        assert_eq!(
            state.receiving_key(&remote, 11, 10).unwrap_err(),
            ProtocolError::TooManySkippedMessages {
                requested: 11,
                max_skip: 10
            }
        );
    }

    #[test]
    fn skipped_cache_evicts_oldest_past_capacity() {
        let mut skipped = SkippedKeys::default();
        for counter in 0..5 {
            skipped.insert([1u8; KEY_SIZE], counter, secret(), 3);
        }
        assert_eq!(skipped.len(), 3);
        assert!(skipped.get(&[1u8; KEY_SIZE], 0).is_none());
        assert!(skipped.get(&[1u8; KEY_SIZE], 4).is_some());
    }

    #[test]
    fn prune_drops_old_epochs_and_far_counters() {
        let kp = KeyPair::generate();
        let remote = *kp.public_key();
        let mut state = RatchetState::new(&secret(), &kp, remote);
        state.receiving_key(&remote, 20, 100).unwrap();
        state
            .skipped
            .insert([9u8; KEY_SIZE], 0, secret(), 100);

        let removed = state.prune_skipped(5);
        // Counters 0..=15 of the current epoch plus the foreign entry.
        assert_eq!(removed, 17);
        assert_eq!(state.skipped.len(), 4);
    }
}

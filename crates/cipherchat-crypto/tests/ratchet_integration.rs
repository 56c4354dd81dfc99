#![allow(clippy::unwrap_used)] // Integration tests use unwrap for brevity

//! Integration tests for the ratchet engine.
//!
//! Two engines talk through envelopes only: ordering, loss, rotation on
//! either side and crossing traffic.

use cipherchat_crypto::primitives::{self, SymmetricKey};
use cipherchat_crypto::{Envelope, KeyPair, MessageCodec, ProtocolError, RatchetEngine};

const CONV: &str = "conv-1";

struct Peers {
    alice: RatchetEngine,
    bob: RatchetEngine,
}

fn engine(max_skip: u32, replay_window: usize) -> RatchetEngine {
    RatchetEngine::new(MessageCodec::new(2_147_483_647, replay_window), max_skip)
}

fn peers(max_skip: u32) -> Peers {
    peers_with(max_skip, 1000)
}

/// Alice initiates, Bob responds, both from the same identity exchange.
fn peers_with(max_skip: u32, replay_window: usize) -> Peers {
    let alice_id = KeyPair::generate();
    let bob_id = KeyPair::generate();
    let alice_secret: SymmetricKey =
        primitives::derive_shared_secret(alice_id.secret(), bob_id.public_key()).unwrap();
    let bob_secret =
        primitives::derive_shared_secret(bob_id.secret(), alice_id.public_key()).unwrap();
    assert_eq!(alice_secret, bob_secret);

    let mut alice = engine(max_skip, replay_window);
    let mut bob = engine(max_skip, replay_window);
    alice
        .initialize(CONV, &alice_secret, &alice_id, *bob_id.public_key(), true)
        .unwrap();
    bob.initialize(CONV, &bob_secret, &bob_id, *alice_id.public_key(), false)
        .unwrap();
    Peers { alice, bob }
}

fn send(engine: &mut RatchetEngine, sender: &str, text: &str) -> Envelope {
    engine.encrypt(CONV, sender, text.as_bytes()).unwrap()
}

fn recv(engine: &mut RatchetEngine, envelope: &Envelope) -> String {
    String::from_utf8(engine.decrypt(envelope).unwrap()).unwrap()
}

#[test]
fn in_order_roundtrip_both_directions() {
    let Peers { mut alice, mut bob } = peers(1000);

    for round in 0..5 {
        let a = send(&mut alice, "alice", &format!("ping {round}"));
        assert_eq!(recv(&mut bob, &a), format!("ping {round}"));
        let b = send(&mut bob, "bob", &format!("pong {round}"));
        assert_eq!(recv(&mut alice, &b), format!("pong {round}"));
    }
}

#[test]
fn sequence_numbers_are_unique_within_an_epoch() {
    let Peers { mut alice, .. } = peers(1000);
    let mut seen = std::collections::HashSet::new();
    for i in 0..50 {
        let env = send(&mut alice, "alice", &format!("m{i}"));
        assert!(seen.insert(env.sequence_number));
    }
}

#[test]
fn replay_is_rejected() {
    let Peers { mut alice, mut bob } = peers(1000);
    let env = send(&mut alice, "alice", "once");

    assert_eq!(recv(&mut bob, &env), "once");
    assert_eq!(
        bob.decrypt(&env).unwrap_err(),
        ProtocolError::ReplayDetected { sequence: 0 }
    );
}

#[test]
fn out_of_order_delivery_uses_each_skipped_key_once() {
    let Peers { mut alice, mut bob } = peers(1000);
    let envs: Vec<Envelope> = (0..5).map(|i| send(&mut alice, "alice", &format!("m{i}"))).collect();

    for i in [0, 1, 2, 4] {
        assert_eq!(recv(&mut bob, &envs[i]), format!("m{i}"));
    }
    assert_eq!(bob.skipped_key_count(CONV), 1);

    assert_eq!(recv(&mut bob, &envs[3]), "m3");
    assert_eq!(bob.skipped_key_count(CONV), 0);
    assert!(matches!(
        bob.decrypt(&envs[3]),
        Err(ProtocolError::ReplayDetected { sequence: 3 })
    ));
}

#[test]
fn message_older_than_the_chain_is_rejected() {
    // A one-entry window has forgotten `first` by the time it is redelivered.
    let Peers { mut alice, mut bob } = peers_with(1000, 1);
    let first = send(&mut alice, "alice", "first");
    let second = send(&mut alice, "alice", "second");
    recv(&mut bob, &first);
    recv(&mut bob, &second);

    assert_eq!(
        bob.decrypt(&first).unwrap_err(),
        ProtocolError::MessageTooOld {
            sequence: 0,
            receiving_counter: 2
        }
    );
}

#[test]
fn skip_beyond_bound_fails_and_leaves_state_unchanged() {
    let Peers { mut alice, mut bob } = peers(10);
    let envs: Vec<Envelope> = (0..12).map(|i| send(&mut alice, "alice", &format!("m{i}"))).collect();
    let before = bob.export_state(CONV).unwrap();

    assert_eq!(
        bob.decrypt(&envs[11]).unwrap_err(),
        ProtocolError::TooManySkippedMessages {
            requested: 11,
            max_skip: 10
        }
    );
    assert_eq!(bob.export_state(CONV).unwrap(), before);
    assert_eq!(bob.skipped_key_count(CONV), 0);

    assert_eq!(recv(&mut bob, &envs[0]), "m0");
    assert_eq!(recv(&mut bob, &envs[11]), "m11");
    assert_eq!(bob.skipped_key_count(CONV), 10);
}

#[test]
fn one_sided_rotation_is_decryptable() {
    let Peers { mut alice, mut bob } = peers(1000);
    let before = send(&mut alice, "alice", "before");
    assert_eq!(recv(&mut bob, &before), "before");

    alice.rotate(CONV).unwrap();
    alice.rotate(CONV).unwrap();
    let after = send(&mut alice, "alice", "after");
    assert_ne!(after.ratchet.unwrap().public_key, before.ratchet.unwrap().public_key);
    assert_eq!(after.sequence_number, 0);
    assert_eq!(recv(&mut bob, &after), "after");

    let reply = send(&mut bob, "bob", "reply");
    assert_eq!(recv(&mut alice, &reply), "reply");
}

#[test]
fn rotation_before_any_traffic() {
    let Peers { mut alice, mut bob } = peers(1000);
    bob.rotate(CONV).unwrap();

    let from_bob = send(&mut bob, "bob", "hello");
    assert_eq!(recv(&mut alice, &from_bob), "hello");
    let from_alice = send(&mut alice, "alice", "hi");
    assert_eq!(recv(&mut bob, &from_alice), "hi");
}

#[test]
fn crossing_rotations_are_decryptable() {
    let Peers { mut alice, mut bob } = peers(1000);
    let opener = send(&mut alice, "alice", "opener");
    recv(&mut bob, &opener);

    alice.rotate(CONV).unwrap();
    bob.rotate(CONV).unwrap();
    let x = send(&mut alice, "alice", "x");
    let y = send(&mut bob, "bob", "y");

    assert_eq!(recv(&mut bob, &x), "x");
    assert_eq!(recv(&mut alice, &y), "y");

    // Both sides keep going after the crossing.
    let z = send(&mut alice, "alice", "z");
    let w = send(&mut bob, "bob", "w");
    assert_eq!(recv(&mut alice, &w), "w");
    assert_eq!(recv(&mut bob, &z), "z");
}

#[test]
fn crossing_messages_without_rotation() {
    let Peers { mut alice, mut bob } = peers(1000);
    let a1 = send(&mut alice, "alice", "a1");
    let b1 = send(&mut bob, "bob", "b1");
    let a2 = send(&mut alice, "alice", "a2");

    assert_eq!(recv(&mut alice, &b1), "b1");
    assert_eq!(recv(&mut bob, &a1), "a1");
    assert_eq!(recv(&mut bob, &a2), "a2");

    let b2 = send(&mut bob, "bob", "b2");
    assert_eq!(recv(&mut alice, &b2), "b2");
}

#[test]
fn late_message_from_previous_epoch() {
    let Peers { mut alice, mut bob } = peers(1000);
    let m0 = send(&mut alice, "alice", "m0");
    let m1 = send(&mut alice, "alice", "m1");
    recv(&mut bob, &m0);

    alice.rotate(CONV).unwrap();
    let n0 = send(&mut alice, "alice", "n0");
    assert_eq!(n0.ratchet.unwrap().previous_counter, 2);

    assert_eq!(recv(&mut bob, &n0), "n0");
    assert_eq!(bob.skipped_key_count(CONV), 1);
    assert_eq!(recv(&mut bob, &m1), "m1");
    assert_eq!(bob.skipped_key_count(CONV), 0);
}

#[test]
fn previous_epoch_count_beyond_bound_is_capped() {
    let Peers { mut alice, mut bob } = peers(5);
    let first = send(&mut alice, "alice", "first");
    recv(&mut bob, &first);
    for i in 0..7 {
        send(&mut alice, "alice", &format!("lost {i}"));
    }
    alice.rotate(CONV).unwrap();
    let next = send(&mut alice, "alice", "next");
    assert_eq!(next.ratchet.unwrap().previous_counter, 8);

    assert_eq!(recv(&mut bob, &next), "next");
    assert_eq!(bob.skipped_key_count(CONV), 5);
}

#[test]
fn new_epoch_starting_beyond_bound_is_rejected() {
    let Peers { mut alice, mut bob } = peers(5);
    let envs: Vec<Envelope> = (0..7).map(|i| send(&mut alice, "alice", &format!("m{i}"))).collect();
    let before = bob.export_state(CONV).unwrap();

    assert_eq!(
        bob.decrypt(&envs[6]).unwrap_err(),
        ProtocolError::TooManySkippedMessages {
            requested: 6,
            max_skip: 5
        }
    );
    assert_eq!(bob.export_state(CONV).unwrap(), before);
}

#[test]
fn rotation_overtaken_by_the_next_epoch() {
    let Peers { mut alice, mut bob } = peers(1000);
    let m0 = send(&mut alice, "alice", "m0");
    alice.rotate(CONV).unwrap();
    let m1 = send(&mut alice, "alice", "m1");

    assert_eq!(recv(&mut bob, &m1), "m1");
    assert_eq!(recv(&mut bob, &m0), "m0");

    let m2 = send(&mut alice, "alice", "m2");
    assert_eq!(recv(&mut bob, &m2), "m2");
    let reply = send(&mut bob, "bob", "reply");
    assert_eq!(recv(&mut alice, &reply), "reply");
}

#[test]
fn reordering_across_several_rotations() {
    let Peers { mut alice, mut bob } = peers(1000);
    let mut envs = Vec::new();
    for epoch in 0..4 {
        envs.push(send(&mut alice, "alice", &format!("e{epoch} a")));
        envs.push(send(&mut alice, "alice", &format!("e{epoch} b")));
        alice.rotate(CONV).unwrap();
    }

    for i in [7, 2, 5, 0, 6, 1, 3, 4] {
        let epoch = i / 2;
        let part = if i % 2 == 0 { "a" } else { "b" };
        assert_eq!(recv(&mut bob, &envs[i]), format!("e{epoch} {part}"));
    }
}

#[test]
fn wholly_lost_epoch_does_not_stall_later_ones() {
    let Peers { mut alice, mut bob } = peers(1000);
    let opener = send(&mut alice, "alice", "opener");
    recv(&mut bob, &opener);
    let answer = send(&mut bob, "bob", "answer");
    recv(&mut alice, &answer);

    // Every message of this epoch is dropped in transit.
    send(&mut alice, "alice", "lost");
    alice.rotate(CONV).unwrap();

    for i in 0..5 {
        let env = send(&mut alice, "alice", &format!("after {i}"));
        assert_eq!(recv(&mut bob, &env), format!("after {i}"));
    }
    let reply = send(&mut bob, "bob", "still here");
    assert_eq!(recv(&mut alice, &reply), "still here");
}

#[test]
fn lost_epochs_on_both_sides() {
    let Peers { mut alice, mut bob } = peers(1000);
    recv(&mut bob, &send(&mut alice, "alice", "hello"));

    send(&mut bob, "bob", "lost b");
    bob.rotate(CONV).unwrap();
    send(&mut alice, "alice", "lost a");
    alice.rotate(CONV).unwrap();
    send(&mut alice, "alice", "lost again");
    alice.rotate(CONV).unwrap();

    let a = send(&mut alice, "alice", "a");
    let b = send(&mut bob, "bob", "b");
    assert_eq!(recv(&mut alice, &b), "b");
    assert_eq!(recv(&mut bob, &a), "a");

    let c = send(&mut alice, "alice", "c");
    assert_eq!(recv(&mut bob, &c), "c");
    let d = send(&mut bob, "bob", "d");
    assert_eq!(recv(&mut alice, &d), "d");
}

#[test]
fn old_epoch_cannot_be_reopened_after_its_keys_are_used() {
    let Peers { mut alice, mut bob } = peers_with(1000, 1);
    let first = send(&mut alice, "alice", "first");
    recv(&mut bob, &first);
    recv(&mut alice, &send(&mut bob, "bob", "reply"));
    let second = send(&mut alice, "alice", "second");
    recv(&mut bob, &second);

    assert_eq!(
        bob.decrypt(&first).unwrap_err(),
        ProtocolError::MessageTooOld {
            sequence: 0,
            receiving_counter: 1
        }
    );
}

#[test]
fn prune_drops_far_skipped_keys() {
    let Peers { mut alice, mut bob } = peers(1000);
    let envs: Vec<Envelope> = (0..30).map(|i| send(&mut alice, "alice", &format!("m{i}"))).collect();
    recv(&mut bob, &envs[29]);
    assert_eq!(bob.skipped_key_count(CONV), 29);

    // Receiving counter is 30; keep counters 20..=28.
    assert_eq!(bob.prune_skipped_keys(CONV, 10), 20);
    assert_eq!(bob.skipped_key_count(CONV), 9);
    assert_eq!(recv(&mut bob, &envs[25]), "m25");
}

#[test]
fn reinitialize_replaces_the_session() {
    let Peers { mut alice, mut bob } = peers(1000);
    recv(&mut bob, &send(&mut alice, "alice", "old"));

    let Peers {
        alice: mut fresh_alice,
        ..
    } = peers(1000);
    let foreign = send(&mut fresh_alice, "alice", "foreign");
    assert!(bob.decrypt(&foreign).is_err());

    // A session established again from scratch works as new.
    let alice_id = KeyPair::generate();
    let bob_id = KeyPair::generate();
    let secret = primitives::derive_shared_secret(alice_id.secret(), bob_id.public_key()).unwrap();
    alice
        .initialize(CONV, &secret, &alice_id, *bob_id.public_key(), true)
        .unwrap();
    bob.initialize(CONV, &secret, &bob_id, *alice_id.public_key(), false)
        .unwrap();
    let env = send(&mut alice, "alice", "new");
    assert_eq!(env.sequence_number, 0);
    assert_eq!(recv(&mut bob, &env), "new");
}

#[test]
fn clear_is_idempotent() {
    let Peers { mut alice, .. } = peers(1000);
    alice.clear(CONV);
    alice.clear(CONV);
    assert!(!alice.is_initialized(CONV));
    assert_eq!(
        alice.encrypt(CONV, "alice", b"x").unwrap_err(),
        ProtocolError::NotInitialized
    );
}

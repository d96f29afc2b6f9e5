//! Property-based tests for the ratchet session and the stream cipher.
//!
//! Arbitrary delivery orders, chunk sizes and hostile inputs must never break decryption of
//! honest traffic or make the parsers panic.

use proptest::prelude::*;
use ratchet_channel::keys::KeyPair;
use ratchet_channel::{
    DecryptError, KeyPair as _, RatchetConfig, SignalRatchetSession, StreamCipher, StreamConfig,
    SymmetricKey,
};
use rand_core::OsRng;

fn sessions() -> (SignalRatchetSession, SignalRatchetSession) {
    let bob_pair = KeyPair::new(&mut OsRng);
    let bob_public = *bob_pair.public();
    let alice = SignalRatchetSession::new(RatchetConfig::default()).unwrap();
    let bob = SignalRatchetSession::new(RatchetConfig::default()).unwrap();
    alice.init_alice(&[3; 32], bob_public).unwrap();
    bob.init_bob(&[3; 32], bob_pair).unwrap();
    (alice, bob)
}

/// A permutation of `0..len`.
fn delivery_order(max_len: usize) -> impl Strategy<Value = Vec<usize>> {
    (1..=max_len).prop_flat_map(|len| Just((0..len).collect::<Vec<_>>()).prop_shuffle())
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    /// Every message of a chain decrypts exactly once, whatever the delivery order.
    #[test]
    fn prop_any_delivery_order_decrypts(order in delivery_order(12)) {
        let (alice, bob) = sessions();
        let sent: Vec<_> = (0..order.len())
            .map(|i| alice.encrypt(format!("message {i}").as_bytes()).unwrap())
            .collect();

        for &i in &order {
            let pt = bob.decrypt(&sent[i]).unwrap();
            prop_assert_eq!(pt, format!("message {i}").into_bytes());
        }
        for message in &sent {
            prop_assert_eq!(bob.decrypt(message), Err(DecryptError::Replay));
        }
        prop_assert_eq!(bob.stats().skipped_keys, 0);
    }

    /// Messages of an old chain still decrypt after the conversation moved on.
    #[test]
    fn prop_late_messages_across_ratchet_steps(late in 1usize..6, rounds in 1usize..4) {
        let (alice, bob) = sessions();
        let first = alice.encrypt(b"first").unwrap();
        let delayed: Vec<_> = (0..late).map(|_| alice.encrypt(b"late").unwrap()).collect();
        bob.decrypt(&first).unwrap();

        for _ in 0..rounds {
            let reply = bob.encrypt(b"reply").unwrap();
            alice.decrypt(&reply).unwrap();
            let next = alice.encrypt(b"next").unwrap();
            bob.decrypt(&next).unwrap();
        }
        for message in delayed.iter().rev() {
            prop_assert_eq!(bob.decrypt(message).unwrap(), b"late".to_vec());
        }
    }

    /// Arbitrary bytes are rejected without panicking and without harming the session.
    #[test]
    fn prop_garbage_is_rejected(garbage in prop::collection::vec(any::<u8>(), 0..200)) {
        let (alice, bob) = sessions();
        prop_assert!(bob.decrypt_bytes(&garbage).is_err());
        let m = alice.encrypt(b"still fine").unwrap();
        prop_assert_eq!(bob.decrypt(&m).unwrap(), b"still fine".to_vec());
    }

    /// Chunking is invisible to the receiver.
    #[test]
    fn prop_stream_reassembles(
        data in prop::collection::vec(any::<u8>(), 0..4096),
        chunk_size in 1u32..600,
    ) {
        let config = StreamConfig { chunk_size, ..StreamConfig::default() };
        let key = SymmetricKey::from_bytes([9; 32]);
        let sender = StreamCipher::new(config.clone()).unwrap();
        let receiver = StreamCipher::new(config).unwrap();
        sender.init(&key, 1);
        receiver.init(&key, 1);

        let wire = sender.encrypt(&data).unwrap();
        let expected_chunks = data.len().div_ceil(chunk_size as usize).max(1) as u64;
        prop_assert_eq!(sender.stats().chunks_encrypted, expected_chunks);
        prop_assert_eq!(receiver.decrypt(&wire).unwrap(), data);
    }

    /// Arbitrary bytes never decrypt as a stream and never panic.
    #[test]
    fn prop_stream_garbage_is_rejected(garbage in prop::collection::vec(any::<u8>(), 1..512)) {
        let cipher = StreamCipher::new(StreamConfig::default()).unwrap();
        cipher.init(&SymmetricKey::from_bytes([1; 32]), 1);
        prop_assert!(cipher.decrypt(&garbage).is_err());
    }
}

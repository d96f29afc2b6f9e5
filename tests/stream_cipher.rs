//! Bulk-data encryption: chunking, key rotation and tamper detection, both on a bare
//! `StreamCipher` and through a `SecureChannel`.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use ratchet_channel::keys::KeyPair;
use ratchet_channel::sync::{ChunkHeader, CHUNK_HEADER_LEN};
use ratchet_channel::{
    ChannelConfig, ChannelError, KeyAgreement, KeyPair as _, SignalSecureChannel, StreamCipher,
    StreamConfig, StreamError, SymmetricKey, NONCE_LEN, TAG_LEN,
};
use rand_core::OsRng;

fn master(byte: u8) -> SymmetricKey {
    SymmetricKey::from_bytes([byte; 32])
}

fn cipher_pair(config: &StreamConfig, generation: u64) -> (StreamCipher, StreamCipher) {
    let sender = StreamCipher::new(config.clone()).unwrap();
    let receiver = StreamCipher::new(config.clone()).unwrap();
    sender.init(&master(generation as u8), generation);
    receiver.init(&master(generation as u8), generation);
    (sender, receiver)
}

fn headers(mut wire: &[u8]) -> Vec<ChunkHeader> {
    let mut out = Vec::new();
    while !wire.is_empty() {
        let header = ChunkHeader::from_bytes(wire).unwrap();
        wire = &wire[CHUNK_HEADER_LEN + NONCE_LEN + header.chunk_size as usize + TAG_LEN..];
        out.push(header);
    }
    out
}

#[test]
fn large_payload_is_split_into_chunks() {
    let (sender, receiver) = cipher_pair(&StreamConfig::default(), 1);
    let data: Vec<u8> = (0..150 * 1024).map(|i| (i % 251) as u8).collect();

    let wire = sender.encrypt(&data).unwrap();
    let chunks = headers(&wire);
    assert_eq!(chunks.len(), 3);
    assert_eq!(
        chunks.iter().map(|h| h.chunk_size).collect::<Vec<_>>(),
        vec![65536, 65536, 22528]
    );
    assert_eq!(
        chunks.iter().map(|h| h.chunk_index).collect::<Vec<_>>(),
        vec![0, 1, 2]
    );
    assert!(chunks.iter().all(|h| h.key_generation == 1 && h.flags == 0));

    assert_eq!(receiver.decrypt(&wire).unwrap(), data);
    assert_eq!(sender.stats().chunks_encrypted, 3);
    assert_eq!(receiver.stats().bytes_decrypted, data.len() as u64);
}

#[test]
fn chunk_indices_continue_across_calls() {
    let (sender, receiver) = cipher_pair(&StreamConfig::default(), 1);
    let first = sender.encrypt(b"first").unwrap();
    let second = sender.encrypt(b"second").unwrap();
    assert_eq!(headers(&second)[0].chunk_index, 1);

    // independently authenticated chunks may be decrypted in any order
    assert_eq!(receiver.decrypt(&second).unwrap(), b"second");
    assert_eq!(receiver.decrypt(&first).unwrap(), b"first");
}

#[test]
fn rotation_keeps_exactly_one_previous_generation() {
    let config = StreamConfig::default();
    let (sender, receiver) = cipher_pair(&config, 4);
    let gen4 = sender.encrypt(b"generation four").unwrap();

    sender.update_key(&master(5), 5).unwrap();
    receiver.update_key(&master(5), 5).unwrap();
    let gen5 = sender.encrypt(b"generation five").unwrap();
    assert_eq!(headers(&gen5)[0].chunk_index, 0);
    assert_eq!(receiver.decrypt(&gen4).unwrap(), b"generation four");
    assert_eq!(receiver.decrypt(&gen5).unwrap(), b"generation five");

    receiver.update_key(&master(6), 6).unwrap();
    assert_eq!(receiver.decrypt(&gen5).unwrap(), b"generation five");
    assert_eq!(receiver.decrypt(&gen4), Err(StreamError::UnknownGeneration(4)));
    assert_eq!(receiver.previous_generation(), Some(5));
    assert_eq!(receiver.stats().rotations, 2);
}

#[test]
fn every_single_bit_flip_is_detected() {
    let (sender, receiver) = cipher_pair(&StreamConfig::default(), 9);
    // one previous generation so flips of the generation field may land on a known key
    receiver.update_key(&master(10), 10).unwrap();
    let wire = sender.encrypt(&[0x5a; 32]).unwrap();
    assert_eq!(receiver.decrypt(&wire).unwrap(), vec![0x5a; 32]);

    for byte in 0..wire.len() {
        for bit in 0..8 {
            let mut tampered = wire.clone();
            tampered[byte] ^= 1 << bit;
            let result = receiver.decrypt(&tampered);
            assert!(result.is_err(), "flip of bit {bit} in byte {byte} accepted");
            if byte >= CHUNK_HEADER_LEN {
                assert_eq!(result, Err(StreamError::AuthenticationFailed));
            }
        }
    }
    assert_eq!(receiver.stats().chunks_decrypted, 1);
}

#[test]
fn truncated_and_trailing_bytes_are_rejected() {
    let (sender, receiver) = cipher_pair(&StreamConfig::default(), 1);
    let wire = sender.encrypt(b"some payload").unwrap();
    for cut in [1, CHUNK_HEADER_LEN - 1, CHUNK_HEADER_LEN + 5, wire.len() - 1] {
        assert_eq!(
            receiver.decrypt(&wire[..cut]),
            Err(StreamError::Incomplete),
            "prefix of {cut} bytes"
        );
    }
    let mut trailing = wire.clone();
    trailing.push(0);
    assert_eq!(receiver.decrypt(&trailing), Err(StreamError::Incomplete));
}

#[test]
fn rotation_callback_reports_generations() {
    let (sender, _receiver) = cipher_pair(&StreamConfig::default(), 1);
    let seen = Arc::new(AtomicU64::new(0));
    let calls = Arc::new(AtomicU64::new(0));
    {
        let seen = Arc::clone(&seen);
        let calls = Arc::clone(&calls);
        sender.set_rotation_callback(move |generation| {
            seen.store(generation, Ordering::SeqCst);
            calls.fetch_add(1, Ordering::SeqCst);
        });
    }
    sender.update_key(&master(2), 2).unwrap();
    sender.update_key(&master(7), 7).unwrap();
    assert_eq!(seen.load(Ordering::SeqCst), 7);
    assert_eq!(calls.load(Ordering::SeqCst), 2);

    // rejected updates do not notify
    assert!(sender.update_key(&master(3), 3).is_err());
    sender.clear_rotation_callback();
    sender.update_key(&master(8), 8).unwrap();
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

#[test]
fn byte_threshold_triggers_rotation() {
    let config = StreamConfig {
        chunk_size: 1024,
        rotation_bytes: 4096,
        rotation_interval_secs: 3600,
    };
    let (sender, _receiver) = cipher_pair(&config, 1);
    sender.encrypt(&[0; 4096]).unwrap();
    assert!(!sender.needs_rotation());
    sender.encrypt(&[0; 1]).unwrap();
    assert!(sender.needs_rotation());
    sender.update_key(&master(2), 2).unwrap();
    assert!(!sender.needs_rotation());
}

#[test]
fn channel_streams_follow_ratchet_steps() {
    let config = ChannelConfig::default();
    let secret = b"Output of a key agreement.......".to_vec();
    let bob_pair = KeyPair::new(&mut OsRng);
    let agreement = KeyAgreement::new(secret.clone(), *bob_pair.public());
    let alice = SignalSecureChannel::initiator(config.clone(), agreement).unwrap();
    let bob = SignalSecureChannel::responder(config, &secret, bob_pair).unwrap();

    let payload: Vec<u8> = (0..100_000u32).map(|i| (i % 256) as u8).collect();
    for round in 0..3 {
        let hello = alice.encrypt_message(b"next").unwrap();
        bob.decrypt_message(&hello).unwrap();
        let data = alice.encrypt_stream(&payload).unwrap();
        assert_eq!(bob.decrypt_stream(&data).unwrap(), payload, "round {round}");

        let reply = bob.encrypt_message(b"ok").unwrap();
        alice.decrypt_message(&reply).unwrap();
        let data = bob.encrypt_stream(&payload).unwrap();
        assert_eq!(alice.decrypt_stream(&data).unwrap(), payload, "round {round}");
    }

    // a frame two generations old is gone for good
    let stale = {
        let hello = alice.encrypt_message(b"again").unwrap();
        let data = alice.encrypt_stream(b"old").unwrap();
        bob.decrypt_message(&hello).unwrap();
        data
    };
    let reply = bob.encrypt_message(b"ok").unwrap();
    alice.decrypt_message(&reply).unwrap();
    let hello = alice.encrypt_message(b"and again").unwrap();
    bob.decrypt_message(&hello).unwrap();
    assert!(matches!(
        bob.decrypt_stream(&stale),
        Err(ChannelError::Stream(StreamError::UnknownGeneration(_)))
    ));
}

//! Chunked authenticated encryption of bulk data under keys derived from the ratchet's session
//! master key.
//!
//! Wire format, repeated for every chunk with no outer framing:
//!
//! ```text
//! key_generation u64 LE ‖ chunk_index u32 LE ‖ chunk_size u32 LE ‖ flags u32 LE ‖ nonce (12) ‖ ct ‖ tag (16)
//! ```
//!
//! The 20 header bytes are the associated data of their chunk.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Instant;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, trace, warn};

use crate::aead::{self, AeadError, OVERHEAD};
use crate::config::{ConfigError, StreamConfig};
use crate::kdf;
use crate::keys::SymmetricKey;

/// Length of a serialized [`ChunkHeader`]
pub const CHUNK_HEADER_LEN: usize = 8 + 4 + 4 + 4;

/// Callback invoked with the new generation after every [`StreamCipher::update_key`]
pub type RotationCallback = Arc<dyn Fn(u64) + Send + Sync>;

/// Stream cipher errors. None of them changes the cipher's state.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Error)]
pub enum StreamError {
    /// `init` has not been called
    #[error("stream cipher has no key")]
    NotInitialized,
    /// The buffer ends inside a chunk header or chunk body
    #[error("incomplete chunk")]
    Incomplete,
    /// A chunk header announces more plaintext than the configured chunk size
    #[error("chunk of {0} bytes exceeds the configured chunk size")]
    ChunkTooLarge(u32),
    /// Tag mismatch on a chunk: corrupted header, nonce, ciphertext or tag
    #[error("chunk authentication failed")]
    AuthenticationFailed,
    /// The chunk's generation is neither the current nor the previous key
    #[error("no key for generation {0}")]
    UnknownGeneration(u64),
    /// `update_key` was called with a generation not above the current one
    #[error("generation {new} is not newer than current generation {current}")]
    StaleGeneration {
        /// generation of the current key
        current: u64,
        /// rejected generation
        new: u64,
    },
}

/// Per-chunk header, authenticated as associated data.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ChunkHeader {
    /// generation of the key the chunk is encrypted under
    pub key_generation: u64,
    /// position of the chunk within the output of one key
    pub chunk_index: u32,
    /// plaintext length of the chunk
    pub chunk_size: u32,
    /// reserved, always zero when produced by this crate
    pub flags: u32,
}

impl ChunkHeader {
    /// The 20-byte little-endian layout
    pub fn to_bytes(&self) -> [u8; CHUNK_HEADER_LEN] {
        let mut out = [0u8; CHUNK_HEADER_LEN];
        out[..8].copy_from_slice(&self.key_generation.to_le_bytes());
        out[8..12].copy_from_slice(&self.chunk_index.to_le_bytes());
        out[12..16].copy_from_slice(&self.chunk_size.to_le_bytes());
        out[16..].copy_from_slice(&self.flags.to_le_bytes());
        out
    }

    /// Parse the front of `bytes`.
    ///
    /// # Errors
    /// `StreamError::Incomplete` when fewer than [`CHUNK_HEADER_LEN`] bytes are available
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, StreamError> {
        let Some(header) = bytes.get(..CHUNK_HEADER_LEN) else {
            return Err(StreamError::Incomplete);
        };
        let u32_at = |at: usize| {
            let mut b = [0u8; 4];
            b.copy_from_slice(&header[at..at + 4]);
            u32::from_le_bytes(b)
        };
        let mut generation = [0u8; 8];
        generation.copy_from_slice(&header[..8]);
        Ok(Self {
            key_generation: u64::from_le_bytes(generation),
            chunk_index: u32_at(8),
            chunk_size: u32_at(12),
            flags: u32_at(16),
        })
    }
}

/// A derived chunk key of one generation.
pub struct StreamKey {
    key: SymmetricKey,
    generation: u64,
    created_at: Instant,
    bytes_encrypted: u64,
}

impl StreamKey {
    fn derive(master_key: &SymmetricKey, generation: u64) -> Self {
        Self {
            key: kdf::stream_key(master_key, generation),
            generation,
            created_at: Instant::now(),
            bytes_encrypted: 0,
        }
    }

    /// generation this key belongs to
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// bytes encrypted under this key so far
    pub fn bytes_encrypted(&self) -> u64 {
        self.bytes_encrypted
    }
}

impl core::fmt::Debug for StreamKey {
    fn fmt(&self, f: &mut core::fmt::Formatter) -> core::fmt::Result {
        write!(
            f,
            "StreamKey {{ key: <hidden bytes>, generation: {}, age: {:?}, bytes_encrypted: {} }}",
            self.generation,
            self.created_at.elapsed(),
            self.bytes_encrypted
        )
    }
}

/// Counters of one [`StreamCipher`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct StreamStats {
    /// plaintext bytes encrypted
    pub bytes_encrypted: u64,
    /// plaintext bytes decrypted
    pub bytes_decrypted: u64,
    /// chunks produced
    pub chunks_encrypted: u64,
    /// chunks verified and decrypted
    pub chunks_decrypted: u64,
    /// successful `update_key` calls
    pub rotations: u64,
    /// generation of the current key, 0 before `init`
    pub current_generation: u64,
}

#[derive(Default)]
struct StreamState {
    current: Option<StreamKey>,
    previous: Option<StreamKey>,
    chunk_index: u32,
    stats: StreamStats,
}

impl StreamState {
    fn key_for(&self, generation: u64) -> Result<&SymmetricKey, StreamError> {
        [self.current.as_ref(), self.previous.as_ref()]
            .into_iter()
            .flatten()
            .find(|k| k.generation == generation)
            .map(|k| &k.key)
            .ok_or(StreamError::UnknownGeneration(generation))
    }
}

/// Encrypts and decrypts bulk data as a sequence of independently authenticated chunks.
///
/// Holds at most two keys: the current one, used for encryption, and the previous one, kept so
/// chunks in flight under the last generation still decrypt after a rotation. All operations
/// are serialized behind one lock.
pub struct StreamCipher {
    config: StreamConfig,
    state: Mutex<StreamState>,
    on_rotation: Mutex<Option<RotationCallback>>,
}

impl core::fmt::Debug for StreamCipher {
    fn fmt(&self, f: &mut core::fmt::Formatter) -> core::fmt::Result {
        let state = self.lock();
        f.debug_struct("StreamCipher")
            .field("config", &self.config)
            .field("current", &state.current)
            .field("previous", &state.previous)
            .field("chunk_index", &state.chunk_index)
            .finish_non_exhaustive()
    }
}

impl StreamCipher {
    /// A cipher without key; call [`init`](Self::init) before use.
    ///
    /// # Errors
    /// `ConfigError::Invalid` when `config` fails [`StreamConfig::validate`]
    pub fn new(config: StreamConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self {
            config,
            state: Mutex::new(StreamState::default()),
            on_rotation: Mutex::new(None),
        })
    }

    fn lock(&self) -> MutexGuard<'_, StreamState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Key the cipher for `generation`, discarding any earlier keys.
    pub fn init(&self, master_key: &SymmetricKey, generation: u64) {
        let mut state = self.lock();
        state.previous = None;
        state.current = Some(StreamKey::derive(master_key, generation));
        state.chunk_index = 0;
        state.stats.current_generation = generation;
        debug!(target: "ratchet_channel::stream", generation, "Stream cipher initialized");
    }

    /// Rotate to `generation`: the current key becomes the previous one (the old previous key is
    /// erased) and the outgoing chunk index restarts at zero. The rotation callback, if any, runs
    /// after the lock is released.
    ///
    /// # Errors
    /// - `NotInitialized` before `init`
    /// - `StaleGeneration` when `generation` is not above the current generation
    pub fn update_key(
        &self,
        master_key: &SymmetricKey,
        generation: u64,
    ) -> Result<(), StreamError> {
        {
            let mut state = self.lock();
            let current = state.current.as_ref().ok_or(StreamError::NotInitialized)?.generation;
            if generation <= current {
                return Err(StreamError::StaleGeneration {
                    current,
                    new: generation,
                });
            }
            let next = StreamKey::derive(master_key, generation);
            state.previous = state.current.replace(next);
            state.chunk_index = 0;
            state.stats.rotations += 1;
            state.stats.current_generation = generation;
        }
        debug!(target: "ratchet_channel::stream", generation, "Stream key rotated");

        let callback = self
            .on_rotation
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        if let Some(callback) = callback {
            callback(generation);
        }
        Ok(())
    }

    /// Register `callback`, replacing any earlier one.
    pub fn set_rotation_callback<F>(&self, callback: F)
    where
        F: Fn(u64) + Send + Sync + 'static,
    {
        *self.on_rotation.lock().unwrap_or_else(PoisonError::into_inner) = Some(Arc::new(callback));
    }

    /// Remove the rotation callback.
    pub fn clear_rotation_callback(&self) {
        *self.on_rotation.lock().unwrap_or_else(PoisonError::into_inner) = None;
    }

    /// Encrypt `data` as one or more chunks of at most `chunk_size` plaintext bytes. Empty input
    /// yields a single empty chunk.
    ///
    /// # Errors
    /// `NotInitialized` before `init`
    #[allow(clippy::cast_possible_truncation)]
    pub fn encrypt(&self, data: &[u8]) -> Result<Vec<u8>, StreamError> {
        let mut state = self.lock();
        let StreamState {
            current,
            chunk_index,
            stats,
            ..
        } = &mut *state;
        let key = current.as_mut().ok_or(StreamError::NotInitialized)?;

        let chunk_size = self.config.chunk_size as usize;
        let chunk_count = data.len().div_ceil(chunk_size).max(1);
        let mut out = Vec::with_capacity(data.len() + chunk_count * (CHUNK_HEADER_LEN + OVERHEAD));
        let chunks: Box<dyn Iterator<Item = &[u8]>> = if data.is_empty() {
            Box::new(core::iter::once(data))
        } else {
            Box::new(data.chunks(chunk_size))
        };
        for chunk in chunks {
            let header = ChunkHeader {
                key_generation: key.generation,
                chunk_index: *chunk_index,
                chunk_size: chunk.len() as u32,
                flags: 0,
            };
            let header_bytes = header.to_bytes();
            out.extend_from_slice(&header_bytes);
            out.extend_from_slice(&aead::encrypt(&key.key, chunk, &header_bytes));
            *chunk_index = chunk_index.wrapping_add(1);
        }

        let len = data.len() as u64;
        key.bytes_encrypted += len;
        stats.bytes_encrypted += len;
        stats.chunks_encrypted += chunk_count as u64;
        trace!(
            target: "ratchet_channel::stream",
            generation = key.generation,
            chunks = chunk_count,
            len = data.len(),
            "Encrypted stream data"
        );
        Ok(out)
    }

    /// Decrypt a concatenation of chunks. The first failing chunk fails the whole call and no
    /// plaintext is returned. Empty input decrypts to empty output.
    ///
    /// # Errors
    /// `Incomplete`, `ChunkTooLarge`, `UnknownGeneration` or `AuthenticationFailed` for the
    /// first bad chunk
    pub fn decrypt(&self, data: &[u8]) -> Result<Vec<u8>, StreamError> {
        let mut state = self.lock();
        let mut out = Vec::with_capacity(data.len());
        let mut chunks = 0u64;
        let mut rest = data;
        while !rest.is_empty() {
            let header = ChunkHeader::from_bytes(rest).inspect_err(|_| {
                warn!(
                    target: "ratchet_channel::stream",
                    remaining = rest.len(),
                    "Incomplete chunk header"
                );
            })?;
            if header.chunk_size > self.config.chunk_size {
                warn!(
                    target: "ratchet_channel::stream",
                    size = header.chunk_size,
                    "Oversized chunk"
                );
                return Err(StreamError::ChunkTooLarge(header.chunk_size));
            }
            let total = CHUNK_HEADER_LEN + OVERHEAD + header.chunk_size as usize;
            if rest.len() < total {
                warn!(
                    target: "ratchet_channel::stream",
                    needed = total,
                    remaining = rest.len(),
                    "Incomplete chunk"
                );
                return Err(StreamError::Incomplete);
            }
            let key = state.key_for(header.key_generation).inspect_err(|_| {
                warn!(
                    target: "ratchet_channel::stream",
                    generation = header.key_generation,
                    "Chunk under unknown generation"
                );
            })?;
            let (header_bytes, body) = rest[..total].split_at(CHUNK_HEADER_LEN);
            let plaintext = aead::decrypt(key, body, header_bytes).map_err(|e| {
                warn!(
                    target: "ratchet_channel::stream",
                    generation = header.key_generation,
                    index = header.chunk_index,
                    "Chunk authentication failed"
                );
                match e {
                    AeadError::Truncated => StreamError::Incomplete,
                    AeadError::AuthenticationFailed => StreamError::AuthenticationFailed,
                }
            })?;
            out.extend_from_slice(&plaintext);
            chunks += 1;
            rest = &rest[total..];
        }

        state.stats.bytes_decrypted += out.len() as u64;
        state.stats.chunks_decrypted += chunks;
        trace!(target: "ratchet_channel::stream", chunks, len = out.len(), "Decrypted stream data");
        Ok(out)
    }

    /// `true` when the current key has encrypted more than `rotation_bytes` or is older than the
    /// rotation interval. `false` before `init`.
    pub fn needs_rotation(&self) -> bool {
        let state = self.lock();
        state.current.as_ref().is_some_and(|key| {
            key.bytes_encrypted > self.config.rotation_bytes
                || key.created_at.elapsed() > self.config.rotation_interval()
        })
    }

    /// Generation of the current key, `None` before `init`
    pub fn current_generation(&self) -> Option<u64> {
        self.lock().current.as_ref().map(StreamKey::generation)
    }

    /// Generation of the retained previous key, if any
    pub fn previous_generation(&self) -> Option<u64> {
        self.lock().previous.as_ref().map(StreamKey::generation)
    }

    /// Counters
    pub fn stats(&self) -> StreamStats {
        self.lock().stats
    }

    /// The policy this cipher was created with
    pub fn config(&self) -> &StreamConfig {
        &self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU64, Ordering};

    fn master(byte: u8) -> SymmetricKey {
        SymmetricKey::from_bytes([byte; 32])
    }

    fn small_chunks() -> StreamConfig {
        StreamConfig {
            chunk_size: 16,
            ..StreamConfig::default()
        }
    }

    #[test]
    fn invalid_config_is_rejected() {
        let zero_chunks = StreamConfig {
            chunk_size: 0,
            ..StreamConfig::default()
        };
        assert!(matches!(
            StreamCipher::new(zero_chunks),
            Err(ConfigError::Invalid(_))
        ));
        let zero_bytes = StreamConfig {
            rotation_bytes: 0,
            ..StreamConfig::default()
        };
        assert!(matches!(
            StreamCipher::new(zero_bytes),
            Err(ConfigError::Invalid(_))
        ));
    }

    #[test]
    fn chunk_header_layout() {
        let header = ChunkHeader {
            key_generation: 0x0102_0304_0506_0708,
            chunk_index: 9,
            chunk_size: 0x100,
            flags: 0,
        };
        let bytes = header.to_bytes();
        assert_eq!(
            bytes,
            [8, 7, 6, 5, 4, 3, 2, 1, 9, 0, 0, 0, 0, 1, 0, 0, 0, 0, 0, 0]
        );
        assert_eq!(ChunkHeader::from_bytes(&bytes), Ok(header));
        assert_eq!(
            ChunkHeader::from_bytes(&bytes[..19]),
            Err(StreamError::Incomplete)
        );
    }

    #[test]
    fn uninitialized_cipher() {
        let cipher = StreamCipher::new(StreamConfig::default()).unwrap();
        assert_eq!(cipher.encrypt(b"x"), Err(StreamError::NotInitialized));
        assert_eq!(
            cipher.update_key(&master(1), 1),
            Err(StreamError::NotInitialized)
        );
        assert!(!cipher.needs_rotation());
        assert_eq!(cipher.current_generation(), None);
    }

    #[test]
    fn chunks_and_indices() {
        let cipher = StreamCipher::new(small_chunks()).unwrap();
        cipher.init(&master(1), 5);
        let data: Vec<u8> = (0..40).collect();
        let out = cipher.encrypt(&data).unwrap();
        assert_eq!(out.len(), 40 + 3 * (CHUNK_HEADER_LEN + OVERHEAD));

        let first = ChunkHeader::from_bytes(&out).unwrap();
        assert_eq!((first.key_generation, first.chunk_index, first.chunk_size), (5, 0, 16));
        let third =
            ChunkHeader::from_bytes(&out[2 * (16 + CHUNK_HEADER_LEN + OVERHEAD)..]).unwrap();
        assert_eq!((third.chunk_index, third.chunk_size), (2, 8));

        // indices continue across calls
        let more = cipher.encrypt(b"abc").unwrap();
        assert_eq!(ChunkHeader::from_bytes(&more).unwrap().chunk_index, 3);

        assert_eq!(cipher.decrypt(&out).unwrap(), data);
        let stats = cipher.stats();
        assert_eq!(stats.chunks_encrypted, 4);
        assert_eq!(stats.chunks_decrypted, 3);
        assert_eq!(stats.bytes_encrypted, 43);
        assert_eq!(stats.bytes_decrypted, 40);
    }

    #[test]
    fn empty_input() {
        let cipher = StreamCipher::new(StreamConfig::default()).unwrap();
        cipher.init(&master(1), 1);
        let out = cipher.encrypt(b"").unwrap();
        assert_eq!(out.len(), CHUNK_HEADER_LEN + OVERHEAD);
        assert_eq!(cipher.decrypt(&out).unwrap(), b"");
        assert_eq!(cipher.decrypt(b"").unwrap(), b"");
    }

    #[test]
    fn update_key_rejects_stale_generation() {
        let cipher = StreamCipher::new(StreamConfig::default()).unwrap();
        cipher.init(&master(1), 4);
        assert_eq!(
            cipher.update_key(&master(2), 4),
            Err(StreamError::StaleGeneration { current: 4, new: 4 })
        );
        assert_eq!(cipher.current_generation(), Some(4));
        assert_eq!(cipher.stats().rotations, 0);
    }

    #[test]
    fn update_key_resets_chunk_index_and_notifies() {
        let cipher = StreamCipher::new(StreamConfig::default()).unwrap();
        let seen = Arc::new(AtomicU64::new(0));
        let sink = seen.clone();
        cipher.set_rotation_callback(move |g| sink.store(g, Ordering::SeqCst));
        cipher.init(&master(1), 1);
        cipher.encrypt(b"a").unwrap();
        cipher.update_key(&master(2), 2).unwrap();
        assert_eq!(seen.load(Ordering::SeqCst), 2);
        let out = cipher.encrypt(b"b").unwrap();
        let header = ChunkHeader::from_bytes(&out).unwrap();
        assert_eq!((header.key_generation, header.chunk_index), (2, 0));
        assert_eq!(cipher.previous_generation(), Some(1));

        cipher.clear_rotation_callback();
        cipher.update_key(&master(3), 3).unwrap();
        assert_eq!(seen.load(Ordering::SeqCst), 2);
        assert_eq!(cipher.stats().rotations, 2);
    }

    #[test]
    fn callback_may_use_the_cipher() {
        let cipher = Arc::new(StreamCipher::new(StreamConfig::default()).unwrap());
        let inner = Arc::downgrade(&cipher);
        let observed = Arc::new(AtomicU64::new(0));
        let sink = observed.clone();
        cipher.set_rotation_callback(move |_| {
            if let Some(cipher) = inner.upgrade() {
                sink.store(cipher.current_generation().unwrap_or(0), Ordering::SeqCst);
            }
        });
        cipher.init(&master(1), 1);
        cipher.update_key(&master(2), 7).unwrap();
        assert_eq!(observed.load(Ordering::SeqCst), 7);
    }

    #[test]
    fn oversized_chunk_is_rejected() {
        let big = StreamCipher::new(StreamConfig::default()).unwrap();
        big.init(&master(1), 1);
        let out = big.encrypt(&[0u8; 64]).unwrap();

        let small = StreamCipher::new(small_chunks()).unwrap();
        small.init(&master(1), 1);
        assert_eq!(small.decrypt(&out), Err(StreamError::ChunkTooLarge(64)));
    }

    #[test]
    fn truncated_stream_is_incomplete() {
        let cipher = StreamCipher::new(small_chunks()).unwrap();
        cipher.init(&master(1), 1);
        let out = cipher.encrypt(&[7u8; 20]).unwrap();
        assert_eq!(
            cipher.decrypt(&out[..out.len() - 1]),
            Err(StreamError::Incomplete)
        );
        assert_eq!(cipher.decrypt(&out[..10]), Err(StreamError::Incomplete));
        assert_eq!(cipher.stats().chunks_decrypted, 0);
    }

    #[test]
    fn needs_rotation_after_byte_threshold() {
        let cipher = StreamCipher::new(StreamConfig {
            chunk_size: 1024,
            rotation_bytes: 100,
            rotation_interval_secs: 3600,
        })
        .unwrap();
        cipher.init(&master(1), 1);
        cipher.encrypt(&[0u8; 100]).unwrap();
        assert!(!cipher.needs_rotation());
        cipher.encrypt(&[0u8; 1]).unwrap();
        assert!(cipher.needs_rotation());
        cipher.update_key(&master(2), 2).unwrap();
        assert!(!cipher.needs_rotation());
    }

    #[test]
    fn different_masters_do_not_interoperate() {
        let a = StreamCipher::new(StreamConfig::default()).unwrap();
        let b = StreamCipher::new(StreamConfig::default()).unwrap();
        a.init(&master(1), 1);
        b.init(&master(2), 1);
        let out = a.encrypt(b"secret").unwrap();
        assert_eq!(b.decrypt(&out), Err(StreamError::AuthenticationFailed));
    }
}

//! Encrypted daemon/client sessions: a Double Ratchet control channel plus a chunked stream cipher
//! for bulk data, keyed from the ratchet's session master keys.
//!
//! [`RatchetSession`] carries small control messages with per-message keys, forward secrecy and
//! post-compromise security. Every DH ratchet step also yields a session master key;
//! [`StreamCipher`] derives per-generation chunk keys from those and encrypts arbitrarily large
//! payloads in authenticated chunks. [`SecureChannel`] keeps the two in step.

#![warn(clippy::pedantic)]
#![warn(missing_docs)]

extern crate alloc;

pub mod aead;
pub mod channel;
mod common;
pub mod config;
pub mod kdf;
pub mod keys;
/// skipped message key storage
pub mod msg_key_cache;
pub mod provider;
pub mod replay;
pub mod sync;

pub use channel::{ChannelError, KeyAgreement, SecureChannel};
pub use common::{
    Counter, CryptoProvider, DRError, DecryptError, EncryptUninit, EncryptedMessage, Header,
    KeyPair, HEADER_LEN, NONCE_LEN, PUBLIC_KEY_LEN, TAG_LEN,
};
pub use config::{ChannelConfig, ConfigError, RatchetConfig, StreamConfig};
pub use keys::{PublicKey, SymmetricKey};
pub use provider::SignalCryptoProvider;
pub use sync::{
    DoubleRatchet, RatchetSession, RatchetStats, SessionKeys, StreamCipher, StreamError,
    StreamStats, LOCAL_GENERATION_FLAG,
};

/// Ratchet session using X25519, HKDF-SHA256 and ChaCha20-Poly1305
pub type SignalRatchetSession = RatchetSession<SignalCryptoProvider>;

/// Secure channel using X25519, HKDF-SHA256 and ChaCha20-Poly1305
pub type SignalSecureChannel = SecureChannel<SignalCryptoProvider>;

use core::{fmt::Debug, hash::Hash};
use rand_core::{CryptoRng, RngCore};
use thiserror::Error;

use crate::keys::SymmetricKey;

/// Message Counter (as seen in the header)
pub type Counter = u32;

/// Length of a serialized ratchet public key
pub const PUBLIC_KEY_LEN: usize = 32;

/// Length of a serialized [`Header`]: public key, previous chain length and message number
pub const HEADER_LEN: usize = PUBLIC_KEY_LEN + 4 + 4;

/// Length of the AEAD nonce carried in front of every ciphertext
pub const NONCE_LEN: usize = 12;

/// Length of the AEAD authentication tag appended to every ciphertext
pub const TAG_LEN: usize = 16;

/// General Errors
#[derive(Clone, Copy, Debug, PartialEq, Eq, Error)]
pub enum DRError {
    /// Key is invalid or cannot be processed
    #[error("Key is invalid or cannot be processed")]
    InvalidKey,
    /// The shared secret handed over by the key agreement is empty or degenerate
    #[error("Shared secret is empty or malformed")]
    InvalidSharedSecret,
    /// A DH ratchet step was requested before any remote public key is known
    #[error("No remote ratchet key is known yet")]
    NoRemoteKey,
}

/// Error that occurs on encryption before the sending chain is initialized.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Error)]
#[error("Encrypt not yet initialized (you must receive a message first)")]
pub struct EncryptUninit;

/// Error that may occur during `ratchet_decrypt`
///
/// A decryption error never changes the ratchet state.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Error)]
pub enum DecryptError {
    /// Could not verify-decrypt the ciphertext + associated data + header
    #[error("Error during verify-decrypting")]
    DecryptFailure,

    /// Could not find the message key required for decryption
    ///
    /// Note that this implementation is not always able to detect when an old `MessageKey` can't
    /// be found: a `DecryptFailure` may be triggered instead.
    #[error("Could not find the message key required for decryption")]
    MessageKeyNotFound,

    /// Header message counter is too large (either `n` or `pn`)
    #[error("Header message counter is too large")]
    SkipTooLarge,

    /// The `(public key, message number)` pair was already consumed
    #[error("Message was already received")]
    Replay,

    /// The wire bytes are too short or the header cannot be parsed
    #[error("Message header or ciphertext is malformed")]
    MalformedMessage,

    /// No ratchet state exists yet
    #[error("Ratchet session is not initialized")]
    NotInitialized,
}

/// The Header that should be sent alongside the ciphertext.
///
/// The Header contains the information for the `DoubleRatchet` to find the correct `MessageKey` to
/// decrypt the message. It is generated by `ratchet_encrypt`.
///
/// Wire layout (40 bytes): `dh ‖ pn (u32 BE) ‖ n (u32 BE)`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Header<PublicKey> {
    /// The public half of the key-pair of the sender
    pub dh: PublicKey,

    /// Counts the number of messages that have been sent in the current symmetric ratchet
    pub n: Counter,

    /// Counts the number of messages that have been sent in the previous symmetric ratchet
    pub pn: Counter,
}

impl<PK: AsRef<[u8]>> Header<PK> {
    /// Serialize into the fixed 40-byte wire layout.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(HEADER_LEN);
        self.extend_bytes_into(&mut bytes);
        bytes
    }

    fn extend_bytes_into(&self, v: &mut Vec<u8>) {
        v.extend_from_slice(self.dh.as_ref());
        v.extend_from_slice(&self.pn.to_be_bytes());
        v.extend_from_slice(&self.n.to_be_bytes());
    }

    /// Parse a header from exactly [`HEADER_LEN`] bytes, building the public key with
    /// `parse_key` (usually `CryptoProvider::new_public_key`).
    ///
    /// # Errors
    /// `DecryptError::MalformedMessage` on a wrong length or a rejected public key
    pub fn decode_with<F>(bytes: &[u8], parse_key: F) -> Result<Self, DecryptError>
    where
        F: FnOnce(&[u8]) -> Result<PK, DRError>,
    {
        if bytes.len() != HEADER_LEN {
            return Err(DecryptError::MalformedMessage);
        }
        let (dh, counters) = bytes.split_at(PUBLIC_KEY_LEN);
        let dh = parse_key(dh).map_err(|_| DecryptError::MalformedMessage)?;
        let mut pn = [0u8; 4];
        pn.copy_from_slice(&counters[..4]);
        let mut n = [0u8; 4];
        n.copy_from_slice(&counters[4..]);
        Ok(Self {
            dh,
            n: Counter::from_be_bytes(n),
            pn: Counter::from_be_bytes(pn),
        })
    }

    // Header bytes followed by the caller supplied associated data: the AEAD associated data.
    pub(crate) fn associated_data(&self, ad: &[u8]) -> Vec<u8> {
        let mut v = Vec::with_capacity(HEADER_LEN + ad.len());
        self.extend_bytes_into(&mut v);
        v.extend_from_slice(ad);
        v
    }
}

/// A ratchet message as it travels over the control channel.
///
/// `ciphertext` is `nonce ‖ ct ‖ tag` as produced by the AEAD engine.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EncryptedMessage<PublicKey> {
    /// Ratchet header, authenticated as associated data
    pub header: Header<PublicKey>,
    /// Nonce, ciphertext and tag
    pub ciphertext: Vec<u8>,
}

impl<PK: AsRef<[u8]>> EncryptedMessage<PK> {
    /// Smallest valid encoding: a header plus nonce and tag around an empty plaintext
    pub const MIN_LEN: usize = HEADER_LEN + NONCE_LEN + TAG_LEN;

    /// `header ‖ ciphertext`
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(HEADER_LEN + self.ciphertext.len());
        self.header.extend_bytes_into(&mut bytes);
        bytes.extend_from_slice(&self.ciphertext);
        bytes
    }

    /// Inverse of [`to_bytes`](Self::to_bytes).
    ///
    /// # Errors
    /// `DecryptError::MalformedMessage` when `bytes` is shorter than [`Self::MIN_LEN`] or the
    /// header cannot be parsed
    pub fn decode_with<F>(bytes: &[u8], parse_key: F) -> Result<Self, DecryptError>
    where
        F: FnOnce(&[u8]) -> Result<PK, DRError>,
    {
        if bytes.len() < Self::MIN_LEN {
            return Err(DecryptError::MalformedMessage);
        }
        let (header, ciphertext) = bytes.split_at(HEADER_LEN);
        Ok(Self {
            header: Header::decode_with(header, parse_key)?,
            ciphertext: ciphertext.to_vec(),
        })
    }
}

/// Provider of the required cryptographic types and functions.
///
/// The implementer of this trait provides the `DoubleRatchet` with the required external functions
/// as given in the [specification].
///
/// # Security considerations
///
/// The details of the `CryptoProvider` are critical for providing security of the communication.
/// The `DoubleRatchet` can only guarantee security of communication when instantiated with a
/// `CryptoProvider` with secure types and functions. See
/// [`SignalCryptoProvider`](crate::provider::SignalCryptoProvider) for the provider used by
/// default.
///
/// [specification]: https://signal.org/docs/specifications/doubleratchet/#external-functions
pub trait CryptoProvider {
    /// A public key for use in the Diffie-Hellman calculation.
    ///
    /// It is assumed that a `PublicKey` holds a valid key, so if any verification is required the
    /// constructor of this type would be a good place to do so. Its byte form must be
    /// [`PUBLIC_KEY_LEN`] long.
    type PublicKey: AsRef<[u8]> + Clone + Eq + Hash + Debug + Send + Sync;

    /// A private/public key-pair for use in the Diffie-Hellman calculation.
    type KeyPair: KeyPair<PublicKey = Self::PublicKey> + Send;

    /// The result of a Diffie-Hellman calculation.
    type SharedSecret;

    /// A `RootKey` is used in the outer Diffie-Hellman ratchet.
    type RootKey: Send;

    /// A `ChainKey` is used in the inner symmetric ratchets.
    type ChainKey: Send;

    /// A `MessageKey` is used to encrypt/decrypt messages.
    type MessageKey: Clone + Send;

    /// Creates a `PublicKey` from its wire bytes
    ///
    /// # Errors
    /// `DRError::InvalidKey` when the bytes do not form a usable key
    fn new_public_key(key: &[u8]) -> Result<Self::PublicKey, DRError>;

    /// Turns the key-agreement output into the initial `RootKey`
    ///
    /// # Errors
    /// `DRError::InvalidSharedSecret` when the secret is empty or degenerate
    fn new_root_key(shared_secret: &[u8]) -> Result<Self::RootKey, DRError>;

    /// Perform the Diffie-Hellman operation.
    ///
    /// # Errors
    /// `DRError::InvalidKey` when the result is not contributory (low-order remote key)
    fn diffie_hellman(us: &Self::KeyPair, them: &Self::PublicKey)
        -> Result<Self::SharedSecret, DRError>;

    /// Derive a new root-key/chain-key pair from the old root-key and a fresh shared secret.
    fn kdf_rk(
        root_key: &Self::RootKey,
        shared_secret: &Self::SharedSecret,
    ) -> (Self::RootKey, Self::ChainKey);

    /// Derive a new chain-key/message-key pair from the old chain-key.
    fn kdf_ck(chain_key: &Self::ChainKey) -> (Self::ChainKey, Self::MessageKey);

    /// Derive the session master key handed to the stream layer for the root key at
    /// position `generation` of the root-key sequence.
    fn kdf_session(root_key: &Self::RootKey, generation: u64) -> SymmetricKey;

    /// Authenticate-encrypt the plaintext and associated data.
    ///
    /// This method MUST authenticate `associated_data`, because it contains the header bytes.
    fn encrypt(key: &Self::MessageKey, plaintext: &[u8], associated_data: &[u8]) -> Vec<u8>;

    /// Verify-decrypt the ciphertext and associated data.
    ///
    /// # Errors
    /// `DecryptError::DecryptFailure` on any authentication failure
    fn decrypt(
        key: &Self::MessageKey,
        ciphertext: &[u8],
        associated_data: &[u8],
    ) -> Result<Vec<u8>, DecryptError>;
}

/// A private-/public-key pair
///
/// This trait is required for `CryptoProvider::KeyPair`
pub trait KeyPair {
    /// Type of the public half of the key pair
    ///
    /// This type should be equal to `CryptoProvider::PublicKey`
    type PublicKey;

    /// Generate a new random `KeyPair`
    fn new<R: CryptoRng + RngCore>(rng: &mut R) -> Self;

    /// Get a reference to the public half of the key pair
    fn public(&self) -> &Self::PublicKey;
}

// Required information for updating the state after successful decryption
pub(crate) enum Diff<CP: CryptoProvider> {
    // Key was found amongst old key
    OldKey,

    // Key was part of the current receive chain
    CurrentChain(CP::ChainKey, Vec<CP::MessageKey>),

    // Key was part of the next receive chain: a full DH ratchet step
    NextChain(Box<NextChain<CP>>),
}

pub(crate) struct NextChain<CP: CryptoProvider> {
    // remaining keys of the chain being retired, starting at the current `nr`
    pub(crate) prev_mks: Vec<CP::MessageKey>,
    // keys skipped in the new receive chain, starting at 0
    pub(crate) mks: Vec<CP::MessageKey>,
    pub(crate) ckr: CP::ChainKey,
    pub(crate) dhs: CP::KeyPair,
    pub(crate) rk: CP::RootKey,
    pub(crate) cks: CP::ChainKey,
    pub(crate) peer_session_key: SymmetricKey,
    pub(crate) session_key: SymmetricKey,
}

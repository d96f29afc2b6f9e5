//! Binding of the control-channel ratchet and the bulk-data stream cipher into one session.
//!
//! The key agreement itself (handshake, signatures, identity keys) happens elsewhere; this module
//! only consumes its output: a shared secret and, for the initiator, the responder's public key.

use thiserror::Error;
use tracing::{debug, trace};
use zeroize::Zeroizing;

use crate::{
    config::{ChannelConfig, ConfigError},
    sync::{RatchetSession, StreamCipher, StreamError},
    CryptoProvider, DRError, DecryptError, EncryptUninit,
};

/// Errors of [`SecureChannel`]
#[derive(Debug, Error)]
pub enum ChannelError {
    /// rejected configuration
    #[error(transparent)]
    Config(#[from] ConfigError),
    /// ratchet initialization failed
    #[error(transparent)]
    Ratchet(#[from] DRError),
    /// no sending chain yet
    #[error(transparent)]
    Encrypt(#[from] EncryptUninit),
    /// control message rejected
    #[error(transparent)]
    Decrypt(#[from] DecryptError),
    /// bulk data rejected
    #[error(transparent)]
    Stream(#[from] StreamError),
}

/// Output of the external key agreement.
pub struct KeyAgreement<PK> {
    shared_secret: Zeroizing<Vec<u8>>,
    remote_public: PK,
}

impl<PK> KeyAgreement<PK> {
    /// `shared_secret` is zeroed when the agreement is dropped.
    pub fn new(shared_secret: Vec<u8>, remote_public: PK) -> Self {
        Self {
            shared_secret: Zeroizing::new(shared_secret),
            remote_public,
        }
    }

    /// the agreed secret
    pub fn shared_secret(&self) -> &[u8] {
        &self.shared_secret
    }

    /// the responder's ratchet public key
    pub fn remote_public(&self) -> &PK {
        &self.remote_public
    }
}

impl<PK: core::fmt::Debug> core::fmt::Debug for KeyAgreement<PK> {
    fn fmt(&self, f: &mut core::fmt::Formatter) -> core::fmt::Result {
        write!(
            f,
            "KeyAgreement {{ shared_secret: <hidden bytes>, remote_public: {:?} }}",
            self.remote_public
        )
    }
}

/// One ratchet session plus one stream cipher kept keyed from it.
///
/// Every DH ratchet step yields two new session master keys: the one the other party now sends
/// with and our own. [`sync_stream_keys`](Self::sync_stream_keys) feeds them to the stream cipher
/// in that order, so the cipher encrypts under our newest generation and still decrypts the
/// other party's.
pub struct SecureChannel<CP: CryptoProvider + 'static> {
    session: RatchetSession<CP>,
    stream: StreamCipher,
}

impl<CP: CryptoProvider> core::fmt::Debug for SecureChannel<CP> {
    fn fmt(&self, f: &mut core::fmt::Formatter) -> core::fmt::Result {
        f.debug_struct("SecureChannel")
            .field("session", &self.session)
            .field("stream", &self.stream)
            .finish()
    }
}

impl<CP: CryptoProvider> SecureChannel<CP> {
    /// The party that knows the responder's public key and sends the first control message.
    ///
    /// # Errors
    /// `Config` for an invalid `config`, `Ratchet` when the agreement output is unusable
    pub fn initiator(
        config: ChannelConfig,
        agreement: KeyAgreement<CP::PublicKey>,
    ) -> Result<Self, ChannelError> {
        let channel = Self::new(config)?;
        let KeyAgreement {
            shared_secret,
            remote_public,
        } = agreement;
        channel.session.init_alice(&shared_secret, remote_public)?;
        channel.sync_stream_keys()?;
        Ok(channel)
    }

    /// The party owning `keypair`; it can send once the first control message arrived.
    ///
    /// # Errors
    /// `Config` for an invalid `config`, `Ratchet` when `shared_secret` is unusable
    pub fn responder(
        config: ChannelConfig,
        shared_secret: &[u8],
        keypair: CP::KeyPair,
    ) -> Result<Self, ChannelError> {
        let channel = Self::new(config)?;
        channel.session.init_bob(shared_secret, keypair)?;
        channel.sync_stream_keys()?;
        Ok(channel)
    }

    fn new(config: ChannelConfig) -> Result<Self, ChannelError> {
        config.validate()?;
        Ok(Self {
            session: RatchetSession::new(config.ratchet)?,
            stream: StreamCipher::new(config.stream)?,
        })
    }

    /// Encrypt a control message into its wire form.
    ///
    /// # Errors
    /// `Encrypt` before the sending chain exists
    pub fn encrypt_message(&self, plaintext: &[u8]) -> Result<Vec<u8>, ChannelError> {
        Ok(self.session.encrypt(plaintext)?.to_bytes())
    }

    /// Decrypt a control message and move the stream cipher to any generation it unlocked.
    ///
    /// # Errors
    /// `Decrypt` when the message is rejected
    pub fn decrypt_message(&self, wire: &[u8]) -> Result<Vec<u8>, ChannelError> {
        let plaintext = self.session.decrypt_bytes(wire)?;
        self.sync_stream_keys()?;
        Ok(plaintext)
    }

    /// Encrypt bulk data under the newest stream generation.
    ///
    /// # Errors
    /// `Stream` on cipher failure
    pub fn encrypt_stream(&self, data: &[u8]) -> Result<Vec<u8>, ChannelError> {
        Ok(self.stream.encrypt(data)?)
    }

    /// Decrypt bulk data produced by the other party.
    ///
    /// # Errors
    /// `Stream` for incomplete, oversized, forged or unknown-generation chunks
    pub fn decrypt_stream(&self, data: &[u8]) -> Result<Vec<u8>, ChannelError> {
        Ok(self.stream.decrypt(data)?)
    }

    /// Feed ratchet generations newer than the stream's current one into the stream cipher,
    /// the other party's key first. Returns whether the stream was re-keyed.
    ///
    /// Only generations both parties derive are fed; keys of forced ratchet steps stay local.
    ///
    /// # Errors
    /// `Stream` if the stream cipher refuses a key
    pub fn sync_stream_keys(&self) -> Result<bool, ChannelError> {
        let Some(keys) = self.session.session_keys() else {
            return Ok(false);
        };
        let mut rekeyed = false;
        let candidates = keys
            .peer
            .iter()
            .map(|(generation, key)| (*generation, key))
            .chain(core::iter::once((keys.generation, &keys.own)));
        for (generation, key) in candidates {
            match self.stream.current_generation() {
                None => self.stream.init(key, generation),
                Some(current) if generation > current => {
                    match self.stream.update_key(key, generation) {
                        // another thread got there first
                        Ok(()) | Err(StreamError::StaleGeneration { .. }) => {}
                        Err(e) => return Err(e.into()),
                    }
                }
                Some(_) => continue,
            }
            rekeyed = true;
        }
        if rekeyed {
            debug!(
                target: "ratchet_channel::channel",
                generation = keys.generation,
                "Stream keys synchronized with ratchet"
            );
        }
        Ok(rekeyed)
    }

    /// When the stream cipher reports that rotation is due, move it to the newest ratchet
    /// generation. Returns whether a rotation took place.
    ///
    /// New generations only come from DH ratchet steps, so when the stream already uses the
    /// newest one the rotation has to wait for the next control message from the other party.
    ///
    /// # Errors
    /// `Stream` if the stream cipher refuses a key
    pub fn rotate_if_needed(&self) -> Result<bool, ChannelError> {
        if !self.stream.needs_rotation() {
            return Ok(false);
        }
        let rotated = self.sync_stream_keys()?;
        if !rotated {
            trace!(
                target: "ratchet_channel::channel",
                generation = self.stream.current_generation(),
                "Stream rotation due, waiting for a ratchet step"
            );
        }
        Ok(rotated)
    }

    /// Current local ratchet public key
    pub fn public_key(&self) -> Option<CP::PublicKey> {
        self.session.public_key()
    }

    /// The control-channel session
    pub fn session(&self) -> &RatchetSession<CP> {
        &self.session
    }

    /// The bulk-data cipher
    pub fn stream(&self) -> &StreamCipher {
        &self.stream
    }

    /// Drop the ratchet state. Stream keys stay until the channel is dropped.
    pub fn close(&self) {
        self.session.close();
    }
}

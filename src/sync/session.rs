use std::sync::{Mutex, MutexGuard, PoisonError};

use rand_core::OsRng;
#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};
use tracing::{debug, trace, warn};

use crate::{
    config::{ConfigError, RatchetConfig},
    keys::SymmetricKey, sync::DoubleRatchet, CryptoProvider, DRError,
    DecryptError, EncryptUninit, EncryptedMessage,
};

/// Counters describing the traffic of one [`RatchetSession`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct RatchetStats {
    /// messages encrypted
    pub messages_encrypted: u64,
    /// messages decrypted and authenticated
    pub messages_decrypted: u64,
    /// decryptions rejected for any reason other than replay
    pub decrypt_failures: u64,
    /// messages rejected because they were already received
    pub replays_rejected: u64,
    /// DH ratchet steps, received and forced
    pub ratchet_steps: u64,
    /// forced DH ratchet steps
    pub forced_steps: u64,
    /// position of the newest root key, flagged when it came from a forced step
    pub session_key_generation: u64,
    /// skipped message keys currently cached
    pub skipped_keys: usize,
}

/// A consistent snapshot of the session master keys both parties can derive.
///
/// Keys from forced ratchet steps never appear here.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SessionKeys {
    /// position of `own` in the root-key sequence
    pub generation: u64,
    /// session master key of the newest shared root key
    pub own: SymmetricKey,
    /// generation and session master key the other party sends with, if known
    pub peer: Option<(u64, SymmetricKey)>,
}

struct Inner<CP: CryptoProvider + 'static> {
    ratchet: Option<DoubleRatchet<CP>>,
    stats: RatchetStats,
}

/// Thread-safe Double Ratchet session: one per daemon/client connection.
///
/// Starts uninitialized; `init_alice` or `init_bob` moves it to the ready state. Every
/// operation takes the session lock for its whole duration, so calls from different threads are
/// serialized. A decryption either commits all of its state changes or none.
///
/// ```
/// use ratchet_channel::{keys, KeyPair, RatchetConfig, SignalRatchetSession};
///
/// let shared_secret = [7u8; 32];
/// let bob_pair = keys::KeyPair::new(&mut rand_core::OsRng);
/// let bob_public = *bob_pair.public();
///
/// let alice = SignalRatchetSession::new(RatchetConfig::default()).unwrap();
/// let bob = SignalRatchetSession::new(RatchetConfig::default()).unwrap();
/// alice.init_alice(&shared_secret, bob_public).unwrap();
/// bob.init_bob(&shared_secret, bob_pair).unwrap();
///
/// let wire = alice.encrypt(b"hello").unwrap().to_bytes();
/// assert_eq!(bob.decrypt_bytes(&wire).unwrap(), b"hello");
/// ```
pub struct RatchetSession<CP: CryptoProvider + 'static> {
    config: RatchetConfig,
    inner: Mutex<Inner<CP>>,
}

impl<CP: CryptoProvider> core::fmt::Debug for RatchetSession<CP> {
    fn fmt(&self, f: &mut core::fmt::Formatter) -> core::fmt::Result {
        let inner = self.lock();
        f.debug_struct("RatchetSession")
            .field("config", &self.config)
            .field("ratchet", &inner.ratchet)
            .field("stats", &inner.stats)
            .finish()
    }
}

impl<CP: CryptoProvider> RatchetSession<CP> {
    /// A new, uninitialized session.
    ///
    /// # Errors
    /// `ConfigError::Invalid` when `config` fails [`RatchetConfig::validate`]
    pub fn new(config: RatchetConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self {
            config,
            inner: Mutex::new(Inner {
                ratchet: None,
                stats: RatchetStats::default(),
            }),
        })
    }

    // State is only written after all fallible work succeeded, so a poisoned lock still guards
    // a consistent value.
    fn lock(&self) -> MutexGuard<'_, Inner<CP>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Initialize as the party that sends the first message.
    ///
    /// Any previous state of this session is discarded. On failure the session keeps its
    /// previous state.
    ///
    /// # Errors
    /// see [`DoubleRatchet::new_alice`]
    pub fn init_alice(
        &self,
        shared_secret: &[u8],
        bob_public: CP::PublicKey,
    ) -> Result<(), DRError> {
        let ratchet =
            DoubleRatchet::new_alice(shared_secret, bob_public, &self.config, &mut OsRng)
                .inspect_err(|e| {
                    warn!(target: "ratchet_channel::session", error = %e, "init_alice rejected");
                })?;
        debug!(
            target: "ratchet_channel::session",
            public_key = ?ratchet.public_key(),
            generation = ratchet.session_key_generation(),
            "Initialized session as initiator (Alice)"
        );
        self.install(ratchet);
        Ok(())
    }

    /// Initialize as the party that receives the first message.
    ///
    /// # Errors
    /// see [`DoubleRatchet::new_bob`]
    pub fn init_bob(
        &self,
        shared_secret: &[u8],
        bob_keypair: CP::KeyPair,
    ) -> Result<(), DRError> {
        let ratchet = DoubleRatchet::new_bob(shared_secret, bob_keypair, &self.config)
            .inspect_err(|e| {
                warn!(target: "ratchet_channel::session", error = %e, "init_bob rejected");
            })?;
        debug!(
            target: "ratchet_channel::session",
            public_key = ?ratchet.public_key(),
            "Initialized session as responder (Bob)"
        );
        self.install(ratchet);
        Ok(())
    }

    fn install(&self, ratchet: DoubleRatchet<CP>) {
        let mut inner = self.lock();
        inner.stats = RatchetStats {
            session_key_generation: ratchet.session_key_generation(),
            ..RatchetStats::default()
        };
        inner.ratchet = Some(ratchet);
    }

    /// `encrypt_with_ad` with empty associated data
    ///
    /// # Errors
    /// `EncryptUninit` before the sending chain exists
    pub fn encrypt(
        &self,
        plaintext: &[u8],
    ) -> Result<EncryptedMessage<CP::PublicKey>, EncryptUninit> {
        self.encrypt_with_ad(plaintext, &[])
    }

    /// Encrypt `plaintext`, authenticating `associated_data` alongside the header.
    ///
    /// # Errors
    /// `EncryptUninit` when the session is not initialized or has no sending chain yet
    pub fn encrypt_with_ad(
        &self,
        plaintext: &[u8],
        associated_data: &[u8],
    ) -> Result<EncryptedMessage<CP::PublicKey>, EncryptUninit> {
        let mut inner = self.lock();
        let Inner { ratchet, stats } = &mut *inner;
        let ratchet = ratchet.as_mut().ok_or(EncryptUninit)?;
        let (header, ciphertext) = ratchet.ratchet_encrypt(plaintext, associated_data)?;
        stats.messages_encrypted += 1;
        trace!(
            target: "ratchet_channel::session",
            n = header.n,
            pn = header.pn,
            len = plaintext.len(),
            "Encrypted message"
        );
        Ok(EncryptedMessage { header, ciphertext })
    }

    /// `decrypt_with_ad` with empty associated data
    ///
    /// # Errors
    /// see [`decrypt_with_ad`](Self::decrypt_with_ad)
    pub fn decrypt(
        &self,
        message: &EncryptedMessage<CP::PublicKey>,
    ) -> Result<Vec<u8>, DecryptError> {
        self.decrypt_with_ad(message, &[])
    }

    /// Parse a wire message (`header ‖ nonce ‖ ct ‖ tag`) and decrypt it.
    ///
    /// # Errors
    /// `MalformedMessage` for undecodable input, otherwise see
    /// [`decrypt_with_ad`](Self::decrypt_with_ad)
    pub fn decrypt_bytes(&self, bytes: &[u8]) -> Result<Vec<u8>, DecryptError> {
        let message = match EncryptedMessage::decode_with(bytes, CP::new_public_key) {
            Ok(message) => message,
            Err(e) => {
                self.lock().stats.decrypt_failures += 1;
                warn!(target: "ratchet_channel::session", len = bytes.len(), "Malformed message");
                return Err(e);
            }
        };
        self.decrypt(&message)
    }

    /// Verify-decrypt `message`. State changes (chain advance, DH ratchet step, skipped keys,
    /// replay record) are committed only when authentication succeeds.
    ///
    /// # Errors
    /// - `NotInitialized` before `init_alice`/`init_bob`
    /// - any [`DecryptError`] from [`DoubleRatchet::ratchet_decrypt`]
    pub fn decrypt_with_ad(
        &self,
        message: &EncryptedMessage<CP::PublicKey>,
        associated_data: &[u8],
    ) -> Result<Vec<u8>, DecryptError> {
        let mut inner = self.lock();
        let Inner { ratchet, stats } = &mut *inner;
        let ratchet = ratchet.as_mut().ok_or(DecryptError::NotInitialized)?;
        let header = &message.header;
        let steps_before = ratchet.ratchet_steps();
        match ratchet.ratchet_decrypt(header, &message.ciphertext, associated_data, &mut OsRng) {
            Ok(pt) => {
                stats.messages_decrypted += 1;
                stats.ratchet_steps = ratchet.ratchet_steps();
                stats.session_key_generation = ratchet.session_key_generation();
                stats.skipped_keys = ratchet.skipped_keys();
                if ratchet.ratchet_steps() != steps_before {
                    debug!(
                        target: "ratchet_channel::session",
                        remote = ?header.dh,
                        generation = ratchet.session_key_generation(),
                        "DH ratchet step"
                    );
                }
                trace!(
                    target: "ratchet_channel::session",
                    n = header.n,
                    pn = header.pn,
                    len = pt.len(),
                    "Decrypted message"
                );
                Ok(pt)
            }
            Err(e) => {
                if e == DecryptError::Replay {
                    stats.replays_rejected += 1;
                } else {
                    stats.decrypt_failures += 1;
                }
                warn!(
                    target: "ratchet_channel::session",
                    error = %e,
                    remote = ?header.dh,
                    n = header.n,
                    "Rejected message"
                );
                Err(e)
            }
        }
    }

    /// Replace the local ratchet key pair and derive a new sending chain and session master key
    /// against the current remote key. See [`DoubleRatchet::force_ratchet_step`].
    ///
    /// # Errors
    /// `DRError::NoRemoteKey` when uninitialized or before any remote key is known
    pub fn force_ratchet_step(&self) -> Result<(), DRError> {
        let mut inner = self.lock();
        let Inner { ratchet, stats } = &mut *inner;
        let ratchet = ratchet.as_mut().ok_or(DRError::NoRemoteKey)?;
        ratchet.force_ratchet_step(&mut OsRng)?;
        stats.ratchet_steps = ratchet.ratchet_steps();
        stats.forced_steps = ratchet.forced_steps();
        stats.session_key_generation = ratchet.session_key_generation();
        warn!(
            target: "ratchet_channel::session",
            forced_steps = ratchet.forced_steps(),
            shared_generation = ratchet.shared_session_master_key().0,
            "Forced ratchet step, the peer can not follow this sending chain"
        );
        Ok(())
    }

    /// Session master key of the newest root key, if initialized
    pub fn session_master_key(&self) -> Option<SymmetricKey> {
        self.lock()
            .ratchet
            .as_ref()
            .map(|r| r.session_master_key().clone())
    }

    /// Generation of [`session_master_key`](Self::session_master_key), if initialized
    pub fn session_key_generation(&self) -> Option<u64> {
        self.lock()
            .ratchet
            .as_ref()
            .map(DoubleRatchet::session_key_generation)
    }

    /// The other party's newest session master key and its generation, if known
    pub fn peer_session_master_key(&self) -> Option<(u64, SymmetricKey)> {
        let inner = self.lock();
        let (generation, key) = inner.ratchet.as_ref()?.peer_session_master_key()?;
        Some((generation, key.clone()))
    }

    /// Own and peer session master keys read under one lock acquisition
    pub fn session_keys(&self) -> Option<SessionKeys> {
        let inner = self.lock();
        let ratchet = inner.ratchet.as_ref()?;
        let (generation, own) = ratchet.shared_session_master_key();
        Some(SessionKeys {
            generation,
            own: own.clone(),
            peer: ratchet
                .peer_session_master_key()
                .map(|(g, k)| (g, k.clone())),
        })
    }

    /// Current local ratchet public key, if initialized
    pub fn public_key(&self) -> Option<CP::PublicKey> {
        self.lock().ratchet.as_ref().map(|r| r.public_key().clone())
    }

    /// Is a sending chain available?
    pub fn can_encrypt(&self) -> bool {
        self.lock()
            .ratchet
            .as_ref()
            .is_some_and(DoubleRatchet::can_encrypt)
    }

    /// Has `init_alice` or `init_bob` succeeded?
    pub fn is_initialized(&self) -> bool {
        self.lock().ratchet.is_some()
    }

    /// Traffic counters
    pub fn stats(&self) -> RatchetStats {
        self.lock().stats
    }

    /// The limits this session was created with
    pub fn config(&self) -> &RatchetConfig {
        &self.config
    }

    /// Drop the ratchet state (all key material is zeroed) and return to the uninitialized state.
    pub fn close(&self) {
        let mut inner = self.lock();
        if inner.ratchet.take().is_some() {
            debug!(target: "ratchet_channel::session", "Session closed");
        }
    }
}

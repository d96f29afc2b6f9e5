use core::fmt;
use rand_core::{CryptoRng, RngCore};

use crate::{
    common::{Diff, NextChain},
    config::RatchetConfig,
    keys::SymmetricKey,
    msg_key_cache::{DefaultKeyStore, MessageKeyCache},
    replay::ReplayGuard,
    Counter, CryptoProvider, DRError, DecryptError, EncryptUninit, Header, KeyPair,
};

/// The `DoubleRatchet` can encrypt/decrypt messages while providing forward secrecy and
/// post-compromise security.
///
/// The `DoubleRatchet` struct provides an implementation of the Double Ratchet Algorithm as
/// defined in its [specification]. After initialization (with `new_alice` or `new_bob`) the user
/// can interact with the `DoubleRatchet` using the `ratchet_encrypt` and `ratchet_decrypt`
/// methods, which automatically takes care of deriving the correct keys and updating the internal
/// state.
///
/// Besides message keys, every root key the ratchet derives also yields a session master key
/// for the bulk-data layer. Root keys are numbered from the initial root (generation 0) onward;
/// both parties derive the same root at the same position, so equal generations always denote
/// equal session master keys. Roots from [`force_ratchet_step`](Self::force_ratchet_step) are
/// known to one side only and are numbered apart, with [`LOCAL_GENERATION_FLAG`] set.
///
/// # Initialization
///
/// The "Alice" or "Bob" role follows from the design of the authenticated key exchange that is
/// used to initialize the secure communications channel: Alice knows Bob's public key and sends
/// the first message, Bob can only reply after receiving it.
///
/// # Provided security
///
/// Conditional on the correct implementation of the `CryptoProvider`, the `DoubleRatchet` provides
/// confidentiality of the plaintext and authentication of both the ciphertext and associated data.
/// It does not provide anonymity, as the headers have to be sent in plain text and are sufficient
/// for identifying the communicating parties.
///
/// Forward secrecy preserves confidentiality of old messages in case of a device compromise. The
/// `DoubleRatchet` derives a fresh key for every message: the sender deletes it immediately after
/// encrypting and the receiver deletes it immediately after successful decryption. Messages may
/// arrive out of order, in which case the receiver derives and stores the keys for the skipped
/// messages. See [secure deletion] for further discussion.
///
/// Post-compromise security restores confidentiality of new messages in case of a past device
/// compromise. The `DoubleRatchet` generates a fresh `KeyPair` whenever it receives a new ratchet
/// key from the other party. See [recovery from compromise].
///
/// # Examples
///
/// ```
/// use rand_core::OsRng;
/// use ratchet_channel::{keys, DoubleRatchet, EncryptUninit, KeyPair, RatchetConfig, SignalCryptoProvider};
///
/// type DR = DoubleRatchet<SignalCryptoProvider>;
/// let config = RatchetConfig::default();
/// let shared_secret = [42u8; 32];
/// let bobs_keypair = keys::KeyPair::new(&mut OsRng);
/// let bobs_public_key = *bobs_keypair.public();
///
/// // Alice and Bob have agreed on `shared_secret` and `bobs_public_key`
/// let mut alice = DR::new_alice(&shared_secret, bobs_public_key, &config, &mut OsRng).unwrap();
/// let mut bob = DR::new_bob(&shared_secret, bobs_keypair, &config).unwrap();
///
/// // Bob cannot send to Alice
/// assert_eq!(Err(EncryptUninit), bob.ratchet_encrypt(b"Hi Alice", b"B2A"));
///
/// // Alice can send to Bob
/// let (head, ct) = alice.ratchet_encrypt(b"Hello Bob", b"A2B").unwrap();
/// let pt = bob.ratchet_decrypt(&head, &ct, b"A2B", &mut OsRng).unwrap();
/// assert_eq!(&pt[..], b"Hello Bob");
///
/// // Now Bob can send to Alice
/// let (head, ct) = bob.ratchet_encrypt(b"Hi Alice", b"B2A").unwrap();
/// let pt = alice.ratchet_decrypt(&head, &ct, b"B2A", &mut OsRng).unwrap();
/// assert_eq!(&pt[..], b"Hi Alice");
/// ```
///
/// [specification]: https://signal.org/docs/specifications/doubleratchet/#double-ratchet-1
/// [secure deletion]: https://signal.org/docs/specifications/doubleratchet/#secure-deletion
/// [recovery from compromise]: https://signal.org/docs/specifications/doubleratchet/#recovery-from-compromise
pub struct DoubleRatchet<CP: CryptoProvider + 'static> {
    dhs: CP::KeyPair,
    dhr: Option<CP::PublicKey>,
    rk: CP::RootKey,
    cks: Option<CP::ChainKey>,
    ckr: Option<CP::ChainKey>,
    ns: Counter,
    nr: Counter,
    pn: Counter,
    msg_key_cache: Box<dyn MessageKeyCache<CP>>,
    received: ReplayGuard<CP::PublicKey>,
    max_skip: usize,
    session_key: SymmetricKey,
    peer_session_key: Option<(u64, SymmetricKey)>,
    generation: u64,
    local_session_key: Option<(u64, SymmetricKey)>,
    forced_steps: u64,
    ratchet_steps: u64,
}

/// Set in the generation of every session master key derived by a forced ratchet step.
///
/// Shared generations count up from zero and never reach this bit, so a local key can not share a
/// number with a key the other party derives.
pub const LOCAL_GENERATION_FLAG: u64 = 1 << 63;

impl<CP: CryptoProvider> fmt::Debug for DoubleRatchet<CP> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "DoubleRatchet {{ dhs: {:?}, dhr: {:?}, ns: {:?}, nr: {:?}, pn: {:?}, generation: {}, \
             forced_steps: {}, ratchet_steps: {}, message_key_cache: {:?} }}",
            self.dhs.public(),
            self.dhr,
            self.ns,
            self.nr,
            self.pn,
            self.session_key_generation(),
            self.forced_steps,
            self.ratchet_steps,
            self.msg_key_cache
        )
    }
}

impl<CP: CryptoProvider> DoubleRatchet<CP> {
    /// Initialize "Alice": the sender of the first message.
    ///
    /// This implements `RatchetInitAlice` as defined in the [specification]: after initialization
    /// Alice must send a message to Bob before he is able to provide a reply.
    ///
    /// # Security considerations
    ///
    /// For security, initialization through `new_alice` has the following requirements:
    ///  - `shared_secret` must be both *confidential* and *authenticated*
    ///  - `them` must be *authenticated*
    ///
    /// # Errors
    /// - `DRError::InvalidSharedSecret` for an empty or all-zero `shared_secret`
    /// - `DRError::InvalidKey` when `them` yields a non-contributory DH result
    ///
    /// [specification]: https://signal.org/docs/specifications/doubleratchet/#initialization
    pub fn new_alice<R: CryptoRng + RngCore>(
        shared_secret: &[u8],
        them: CP::PublicKey,
        config: &RatchetConfig,
        rng: &mut R,
    ) -> Result<Self, DRError> {
        let rk0 = CP::new_root_key(shared_secret)?;
        let dhs = CP::KeyPair::new(rng);
        let (rk, cks) = CP::kdf_rk(&rk0, &CP::diffie_hellman(&dhs, &them)?);
        Ok(Self {
            dhs,
            dhr: Some(them),
            session_key: CP::kdf_session(&rk, 1),
            peer_session_key: Some((0, CP::kdf_session(&rk0, 0))),
            rk,
            cks: Some(cks),
            ckr: None,
            ns: 0,
            nr: 0,
            pn: 0,
            msg_key_cache: Box::new(DefaultKeyStore::new(config.max_skipped_keys)),
            received: ReplayGuard::new(config.replay_window),
            max_skip: config.max_skip,
            generation: 1,
            local_session_key: None,
            forced_steps: 0,
            ratchet_steps: 0,
        })
    }

    /// Initialize "Bob": the receiver of the first message.
    ///
    /// This implements `RatchetInitBob` as defined in the [specification]: after initialization
    /// Bob must receive a message from Alice before he can send his first message.
    ///
    /// # Security considerations
    ///
    /// For security, initialization through `new_bob` has the following requirements:
    ///  - `shared_secret` must be both *confidential* and *authenticated*
    ///  - the private key of `us` must remain secret on Bob's device
    ///
    /// # Errors
    /// `DRError::InvalidSharedSecret` for an empty or all-zero `shared_secret`
    ///
    /// [specification]: https://signal.org/docs/specifications/doubleratchet/#initialization
    pub fn new_bob(
        shared_secret: &[u8],
        us: CP::KeyPair,
        config: &RatchetConfig,
    ) -> Result<Self, DRError> {
        let rk = CP::new_root_key(shared_secret)?;
        Ok(Self {
            dhs: us,
            dhr: None,
            session_key: CP::kdf_session(&rk, 0),
            peer_session_key: None,
            rk,
            cks: None,
            ckr: None,
            ns: 0,
            nr: 0,
            pn: 0,
            msg_key_cache: Box::new(DefaultKeyStore::new(config.max_skipped_keys)),
            received: ReplayGuard::new(config.replay_window),
            max_skip: config.max_skip,
            generation: 0,
            local_session_key: None,
            forced_steps: 0,
            ratchet_steps: 0,
        })
    }

    /// the `MessageKeyCache` instance currently in use
    pub fn message_key_cache(&self) -> &dyn MessageKeyCache<CP> {
        self.msg_key_cache.as_ref()
    }

    /// sets the `MessageKeyCache` instance for use as part of skipped messages.
    /// Keys held by the previous cache are dropped.
    pub fn set_message_key_cache(&mut self, cache: Box<dyn MessageKeyCache<CP>>) {
        self.msg_key_cache = cache;
    }

    /// The current public key that can be shared with the other party
    pub fn public_key(&self) -> &CP::PublicKey {
        self.dhs.public()
    }

    /// maximum number of message keys a single decryption may derive
    pub fn max_skip(&self) -> usize {
        self.max_skip
    }

    /// number of skipped message keys currently cached
    pub fn skipped_keys(&self) -> usize {
        self.msg_key_cache.len()
    }

    /// Are we initialized such that we can encrypt messages?
    pub fn can_encrypt(&self) -> bool {
        self.cks.is_some()
    }

    /// Session master key of the newest root key, including a local one from a forced step
    pub fn session_master_key(&self) -> &SymmetricKey {
        self.local_session_key
            .as_ref()
            .map_or(&self.session_key, |(_, k)| k)
    }

    /// Generation of [`session_master_key`](Self::session_master_key). Carries
    /// [`LOCAL_GENERATION_FLAG`] after a forced step.
    pub fn session_key_generation(&self) -> u64 {
        self.local_session_key
            .as_ref()
            .map_or(self.generation, |(g, _)| *g)
    }

    /// Generation and session master key of the newest root key the other party can derive too.
    /// Forced steps do not move it.
    pub fn shared_session_master_key(&self) -> (u64, &SymmetricKey) {
        (self.generation, &self.session_key)
    }

    /// Generation and session master key of the newest root key the other party sends with, if
    /// known. This is one position below the shared generation.
    pub fn peer_session_master_key(&self) -> Option<(u64, &SymmetricKey)> {
        self.peer_session_key.as_ref().map(|(g, k)| (*g, k))
    }

    /// Number of forced ratchet steps taken so far
    pub fn forced_steps(&self) -> u64 {
        self.forced_steps
    }

    /// Number of DH ratchet steps taken so far
    pub fn ratchet_steps(&self) -> u64 {
        self.ratchet_steps
    }

    /// Encrypt the `plaintext`, ratchet forward and return the (header, ciphertext) pair.
    ///
    /// Implements `RatchetEncrypt` as defined in the [specification]. The header should be sent
    /// along the ciphertext in order for the recipient to be able to `ratchet_decrypt`. The
    /// ciphertext authenticates the `plaintext`, the header and the `associated_data`.
    ///
    /// # Errors
    /// `EncryptUninit` when no sending chain exists yet (Bob before his first received message)
    ///
    /// [specification]: https://signal.org/docs/specifications/doubleratchet/#encrypting-messages
    pub fn ratchet_encrypt(
        &mut self,
        plaintext: &[u8],
        associated_data: &[u8],
    ) -> Result<(Header<CP::PublicKey>, Vec<u8>), EncryptUninit> {
        let cks = self.cks.as_ref().ok_or(EncryptUninit)?;
        let (cks, mk) = CP::kdf_ck(cks);
        let h = Header {
            dh: self.dhs.public().clone(),
            n: self.ns,
            pn: self.pn,
        };
        let ct = CP::encrypt(&mk, plaintext, &h.associated_data(associated_data));
        self.cks = Some(cks);
        self.ns = self.ns.wrapping_add(1);
        Ok((h, ct))
    }

    /// Verify-decrypt the `ciphertext`, update `self` and return the plaintext.
    ///
    /// Implements `RatchetDecrypt` as defined in the [specification]. Decryption of the ciphertext
    /// includes verifying the authenticity of the `header`, `ciphertext` and `associated_data`.
    ///
    /// `self` is automatically updated upon successful decryption. This includes ratcheting
    /// forward the receiving key-chain and DH key-chain (if necessary), storing the
    /// `MessageKeys` of any skipped messages so these messages can be decrypted if they arrive out
    /// of order, and recording the `(header.dh, header.n)` pair so it is never accepted again.
    ///
    /// Returns a `DecryptError` when the plaintext could not be decrypted: `self` remains
    /// unchanged in that case. `rng` is only used for the fresh `KeyPair` of a DH ratchet step.
    ///
    /// # Errors
    /// - `Replay` when the message was already received
    /// - `SkipTooLarge` when more than `max_skip` keys would have to be derived
    /// - `MessageKeyNotFound` when the key was consumed or evicted
    /// - `MalformedMessage` when the header key is unusable
    /// - `DecryptFailure` when authentication fails
    ///
    /// [specification]: https://signal.org/docs/specifications/doubleratchet/#decrypting-messages-1
    pub fn ratchet_decrypt<R: CryptoRng + RngCore>(
        &mut self,
        header: &Header<CP::PublicKey>,
        ciphertext: &[u8],
        associated_data: &[u8],
        rng: &mut R,
    ) -> Result<Vec<u8>, DecryptError> {
        if self.received.contains(&header.dh, header.n) {
            return Err(DecryptError::Replay);
        }
        let ad = header.associated_data(associated_data);
        let (diff, pt) = self.try_decrypt(header, ciphertext, &ad, rng)?;
        self.update(diff, header);
        Ok(pt)
    }

    /// Replace the local ratchet key pair and derive a new sending chain against the current
    /// remote key.
    ///
    /// This re-keys the local side only. The other party holds a different root key, so it can
    /// not derive the new sending chain: control messages sent afterwards fail to decrypt on its
    /// side until both parties re-establish the session. The session master key of the new root
    /// is kept apart from the shared sequence under a generation with
    /// [`LOCAL_GENERATION_FLAG`] set, and [`shared_session_master_key`] does not move, so keys
    /// derived for the bulk-data layer stay in step with the peer. Regular rotation happens on
    /// its own with every received DH ratchet step.
    ///
    /// [`shared_session_master_key`]: Self::shared_session_master_key
    ///
    /// # Errors
    /// - `DRError::NoRemoteKey` before any remote ratchet key is known
    /// - `DRError::InvalidKey` if the remote key yields a non-contributory DH result
    pub fn force_ratchet_step<R: CryptoRng + RngCore>(
        &mut self,
        rng: &mut R,
    ) -> Result<(), DRError> {
        let dhr = self.dhr.as_ref().ok_or(DRError::NoRemoteKey)?;
        let dhs = CP::KeyPair::new(rng);
        let (rk, cks) = CP::kdf_rk(&self.rk, &CP::diffie_hellman(&dhs, dhr)?);
        let forced_steps = self.forced_steps.saturating_add(1);
        let generation = LOCAL_GENERATION_FLAG | forced_steps;
        self.local_session_key = Some((generation, CP::kdf_session(&rk, generation)));
        self.dhs = dhs;
        self.rk = rk;
        self.cks = Some(cks);
        self.pn = self.ns;
        self.ns = 0;
        self.forced_steps = forced_steps;
        self.ratchet_steps += 1;
        Ok(())
    }

    // The actual decryption. Gets a (non-mutable) reference to self to ensure that the state is
    // not changed. Upon successful decryption the state must be updated. The minimum amount of work
    // is done in order to retrieve the correct `MessageKey`: the returned `Diff` object contains
    // the result of that work to avoid doing the work again.
    fn try_decrypt<R: CryptoRng + RngCore>(
        &self,
        h: &Header<CP::PublicKey>,
        ct: &[u8],
        ad: &[u8],
        rng: &mut R,
    ) -> Result<(Diff<CP>, Vec<u8>), DecryptError> {
        use Diff::{CurrentChain, NextChain as Next, OldKey};
        if let Some(mk) = self.msg_key_cache.get(&h.dh, h.n) {
            return Ok((OldKey, CP::decrypt(&mk, ct, ad)?));
        }
        if self.dhr.as_ref() == Some(&h.dh) {
            let ckr = self.ckr.as_ref().ok_or(DecryptError::MessageKeyNotFound)?;
            let (ckr, mks, mk) = Self::skip_message_keys(ckr, self.get_current_skip(h)?);
            return Ok((CurrentChain(ckr, mks), CP::decrypt(&mk, ct, ad)?));
        }

        let (prev_skip, skip) = self.get_next_skip(h)?;
        let prev_mks = match self.ckr.as_ref() {
            Some(ckr) if prev_skip > 0 => {
                let (_, mut mks, mk) = Self::skip_message_keys(ckr, prev_skip - 1);
                mks.push(mk);
                mks
            }
            _ => Vec::new(),
        };
        let dh = CP::diffie_hellman(&self.dhs, &h.dh).map_err(|_| DecryptError::MalformedMessage)?;
        let (rk, ckr) = CP::kdf_rk(&self.rk, &dh);
        let (ckr, mks, mk) = Self::skip_message_keys(&ckr, skip);
        let pt = CP::decrypt(&mk, ct, ad)?;

        // authenticated: finish the DH ratchet step with a fresh sending chain
        let dhs = CP::KeyPair::new(rng);
        let dh = CP::diffie_hellman(&dhs, &h.dh).map_err(|_| DecryptError::MalformedMessage)?;
        let (next_rk, cks) = CP::kdf_rk(&rk, &dh);
        // two roots per received step: the peer's sending root, then ours
        let generation = self.generation.saturating_add(2);
        let next = NextChain {
            prev_mks,
            mks,
            ckr,
            dhs,
            peer_session_key: CP::kdf_session(&rk, generation - 1),
            session_key: CP::kdf_session(&next_rk, generation),
            rk: next_rk,
            cks,
        };
        Ok((Next(Box::new(next)), pt))
    }

    // Calculate how many messages should be skipped in the current receive chain to get the
    // required `MessageKey`. Also check if `h` is valid.
    fn get_current_skip(&self, h: &Header<CP::PublicKey>) -> Result<usize, DecryptError> {
        let skip = h
            .n
            .checked_sub(self.nr)
            .ok_or(DecryptError::MessageKeyNotFound)? as usize;
        if skip >= self.max_skip {
            Err(DecryptError::SkipTooLarge)
        } else {
            Ok(skip)
        }
    }

    // Calculate how many messages should be skipped at the end of the current receive chain and
    // in the next receive chain to get the required `MessageKey`. Also check if `h` is valid.
    fn get_next_skip(&self, h: &Header<CP::PublicKey>) -> Result<(usize, usize), DecryptError> {
        // without malicious participants this error can only be triggered if the local MessageKey
        // has already been deleted.
        let prev_skip = if self.ckr.is_some() {
            h.pn
                .checked_sub(self.nr)
                .ok_or(DecryptError::MessageKeyNotFound)? as usize
        } else {
            0
        };
        let skip = h.n as usize;
        if prev_skip.saturating_add(skip) >= self.max_skip {
            Err(DecryptError::SkipTooLarge)
        } else {
            Ok((prev_skip, skip))
        }
    }

    // Update the internal state. Assumes that the validity of `h` has already been checked.
    fn update(&mut self, diff: Diff<CP>, h: &Header<CP::PublicKey>) {
        use Diff::{CurrentChain, NextChain, OldKey};
        match diff {
            OldKey => {
                self.msg_key_cache.remove(&h.dh, h.n);
            }
            CurrentChain(ckr, mks) => {
                self.msg_key_cache.extend(&h.dh, self.nr, mks);
                self.ckr = Some(ckr);
                self.nr = h.n.saturating_add(1);
            }
            NextChain(next) => {
                let next = *next;
                if let Some(dhr) = self.dhr.as_ref() {
                    self.msg_key_cache.extend(dhr, self.nr, next.prev_mks);
                }
                self.pn = self.ns;
                self.ns = 0;
                self.nr = h.n.saturating_add(1);
                self.dhr = Some(h.dh.clone());
                self.dhs = next.dhs;
                self.rk = next.rk;
                self.cks = Some(next.cks);
                self.ckr = Some(next.ckr);
                self.msg_key_cache.extend(&h.dh, 0, next.mks);
                // the receiving root takes generation + 1, the new sending root generation + 2
                let generation = self.generation.saturating_add(2);
                self.session_key = next.session_key;
                self.peer_session_key = Some((generation - 1, next.peer_session_key));
                self.generation = generation;
                self.local_session_key = None;
                self.ratchet_steps += 1;
            }
        }
        self.received.record(&h.dh, h.n);
    }

    // Do `skip + 1` ratchet steps in the receive chain. Return the last ChainKey, the `skip`
    // MessageKeys passed over and the MessageKey of the last step.
    fn skip_message_keys(
        ck: &CP::ChainKey,
        skip: usize,
    ) -> (CP::ChainKey, Vec<CP::MessageKey>, CP::MessageKey) {
        let mut mks = Vec::with_capacity(skip);
        let (mut ck, mut mk) = CP::kdf_ck(ck);
        for _ in 0..skip {
            mks.push(mk);
            (ck, mk) = CP::kdf_ck(&ck);
        }
        (ck, mks, mk)
    }
}

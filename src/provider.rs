//! The `SignalCryptoProvider`: X25519 for the DH ratchet, HKDF-SHA256 / HMAC-SHA256 for the
//! root and chain KDFs and ChaCha20-Poly1305 for message encryption.
//!
//! Unlike the recommended algorithms of the [specification], the message key is used directly
//! as the AEAD key with a random nonce, so a `MessageKey` is a single 32-byte
//! [`SymmetricKey`]. This keeps symmetric ratcheting cheap when a message arrives out of
//! order (or a malicious message with a high skip value arrives as part of a
//! denial-of-service attempt).
//!
//! [specification]: https://signal.org/docs/specifications/doubleratchet/#recommended-cryptographic-algorithms

use x25519_dalek::SharedSecret;

use crate::aead;
use crate::common::{self, DRError, DecryptError};
use crate::kdf;
use crate::keys::{KeyPair, PublicKey, SymmetricKey};

/// Default provider used by [`SignalRatchetSession`](crate::SignalRatchetSession).
#[derive(Clone, Copy, Debug, Default)]
pub struct SignalCryptoProvider;

impl common::CryptoProvider for SignalCryptoProvider {
    type PublicKey = PublicKey;
    type KeyPair = KeyPair;
    type SharedSecret = SharedSecret;

    type RootKey = SymmetricKey;
    type ChainKey = SymmetricKey;
    type MessageKey = SymmetricKey;

    fn new_public_key(key: &[u8]) -> Result<PublicKey, DRError> {
        PublicKey::try_from(key)
    }

    fn new_root_key(shared_secret: &[u8]) -> Result<SymmetricKey, DRError> {
        kdf::initial_root_key(shared_secret)
    }

    fn diffie_hellman(us: &KeyPair, them: &PublicKey) -> Result<SharedSecret, DRError> {
        let shared = us.private().diffie_hellman(them.inner());
        if shared.was_contributory() {
            Ok(shared)
        } else {
            Err(DRError::InvalidKey)
        }
    }

    fn kdf_rk(rk: &SymmetricKey, s: &SharedSecret) -> (SymmetricKey, SymmetricKey) {
        kdf::kdf_rk(rk, s.as_bytes())
    }

    fn kdf_ck(ck: &SymmetricKey) -> (SymmetricKey, SymmetricKey) {
        kdf::kdf_ck(ck)
    }

    fn kdf_session(rk: &SymmetricKey, generation: u64) -> SymmetricKey {
        kdf::session_master_key(rk, generation)
    }

    fn encrypt(key: &SymmetricKey, pt: &[u8], ad: &[u8]) -> Vec<u8> {
        aead::encrypt(key, pt, ad)
    }

    fn decrypt(key: &SymmetricKey, ct: &[u8], ad: &[u8]) -> Result<Vec<u8>, DecryptError> {
        aead::decrypt(key, ct, ad).map_err(|_| DecryptError::DecryptFailure)
    }
}

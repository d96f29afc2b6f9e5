//! Message encryption using `ChaCha20-Poly1305`
//!
//! The nonce is drawn from the OS random number generator for every call and travels in
//! front of the ciphertext: `nonce (12) ‖ ciphertext ‖ tag (16)`.

use chacha20poly1305::{
    aead::{Aead, KeyInit, Payload},
    ChaCha20Poly1305, Key, Nonce,
};
use rand_core::{OsRng, RngCore};
use thiserror::Error;

use crate::common::{NONCE_LEN, TAG_LEN};
use crate::keys::SymmetricKey;

/// Failures of the AEAD engine. Both fail closed: no plaintext is returned.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Error)]
pub enum AeadError {
    /// Input shorter than nonce plus tag
    #[error("ciphertext is truncated")]
    Truncated,
    /// Tag mismatch: wrong key, wrong associated data or tampered bytes
    #[error("authentication failed")]
    AuthenticationFailed,
}

/// Size overhead added by [`encrypt`]
pub const OVERHEAD: usize = NONCE_LEN + TAG_LEN;

/// Encrypt `plaintext` under `key`, authenticating `associated_data`.
///
/// Returns `nonce ‖ ciphertext ‖ tag`.
pub fn encrypt(key: &SymmetricKey, plaintext: &[u8], associated_data: &[u8]) -> Vec<u8> {
    let mut nonce = [0u8; NONCE_LEN];
    OsRng.fill_bytes(&mut nonce);

    let cipher = ChaCha20Poly1305::new(Key::from_slice(key.as_bytes()));
    let payload = Payload {
        msg: plaintext,
        aad: associated_data,
    };
    let Ok(ciphertext) = cipher.encrypt(Nonce::from_slice(&nonce), payload) else {
        unreachable!("ChaCha20-Poly1305 encryption cannot fail with valid inputs");
    };

    let mut out = Vec::with_capacity(NONCE_LEN + ciphertext.len());
    out.extend_from_slice(&nonce);
    out.extend_from_slice(&ciphertext);
    out
}

/// Verify and decrypt `nonce ‖ ciphertext ‖ tag`.
///
/// # Errors
///
/// - `Truncated`: input shorter than [`OVERHEAD`]
/// - `AuthenticationFailed`: tag does not verify under `key` and `associated_data`
pub fn decrypt(
    key: &SymmetricKey,
    data: &[u8],
    associated_data: &[u8],
) -> Result<Vec<u8>, AeadError> {
    if data.len() < OVERHEAD {
        return Err(AeadError::Truncated);
    }
    let (nonce, ciphertext) = data.split_at(NONCE_LEN);
    let cipher = ChaCha20Poly1305::new(Key::from_slice(key.as_bytes()));
    let payload = Payload {
        msg: ciphertext,
        aad: associated_data,
    };
    cipher
        .decrypt(Nonce::from_slice(nonce), payload)
        .map_err(|_| AeadError::AuthenticationFailed)
}

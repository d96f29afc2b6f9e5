//! Key derivation primitives.
//!
//! All functions are pure and deterministic. HKDF-SHA256 is used for every derivation that
//! mixes in fresh input, HMAC-SHA256 for the symmetric chain step.
//!
//! ```text
//! shared secret ──initial_root_key──▶ RK0
//! RKi ─┬─kdf_rk(DH)──▶ RKi+1, CK
//!      └─session_master_key(i)──▶ SMKi ──stream_key(i)──▶ chunk key
//! CK ──kdf_ck──▶ CK', MK
//! ```

use hkdf::Hkdf;
use hmac::{Hmac, Mac};
use sha2::Sha256;
use zeroize::Zeroizing;

use crate::common::DRError;
use crate::keys::{SymmetricKey, KEY_LEN};

type HmacSha256 = Hmac<Sha256>;

/// Label for the root key output of [`kdf_rk`]
pub const ROOT_KEY_LABEL: &[u8] = b"RatchetChannel/v1/RootKey";

/// Label for the chain key output of [`kdf_rk`]
pub const CHAIN_KEY_LABEL: &[u8] = b"RatchetChannel/v1/ChainKey";

/// Label used when the shared secret has to be condensed into a root key
pub const INITIAL_ROOT_KEY_LABEL: &[u8] = b"RatchetChannel/v1/InitialRootKey";

/// Label for session master keys
pub const SESSION_MASTER_KEY_LABEL: &[u8] = b"RatchetChannel/v1/SessionMasterKey";

/// Label for stream chunk keys
pub const STREAM_KEY_LABEL: &[u8] = b"RatchetChannel/v1/StreamChunkKey";

// kdf_ck constants, as recommended for Signal
const MESSAGE_KEY_SEED: u8 = 0x01;
const CHAIN_KEY_SEED: u8 = 0x02;

fn expand(hkdf: &Hkdf<Sha256>, info: &[u8]) -> SymmetricKey {
    let mut okm = Zeroizing::new([0u8; KEY_LEN]);
    let Ok(()) = hkdf.expand(info, &mut okm[..]) else {
        unreachable!("32 bytes is a valid HKDF-SHA256 output length");
    };
    SymmetricKey::from_bytes(*okm)
}

fn hmac(key: &[u8], input: &[u8]) -> SymmetricKey {
    let Ok(mut mac) = <HmacSha256 as Mac>::new_from_slice(key) else {
        unreachable!("HMAC accepts keys of any length");
    };
    mac.update(input);
    let mut out = Zeroizing::new([0u8; KEY_LEN]);
    out.copy_from_slice(&mac.finalize().into_bytes());
    SymmetricKey::from_bytes(*out)
}

/// Root-key KDF: `(root_key', chain_key)` from the current root key and a DH output.
///
/// The root key is the HKDF salt, the DH output the input key material. Both outputs are
/// expanded from the same PRK under distinct labels.
pub fn kdf_rk(root_key: &SymmetricKey, dh_output: &[u8]) -> (SymmetricKey, SymmetricKey) {
    let prk = Hkdf::<Sha256>::new(Some(root_key.as_bytes()), dh_output);
    (expand(&prk, ROOT_KEY_LABEL), expand(&prk, CHAIN_KEY_LABEL))
}

/// Chain-key KDF: `(chain_key', message_key)`.
pub fn kdf_ck(chain_key: &SymmetricKey) -> (SymmetricKey, SymmetricKey) {
    let mk = hmac(chain_key.as_bytes(), &[MESSAGE_KEY_SEED]);
    let ck = hmac(chain_key.as_bytes(), &[CHAIN_KEY_SEED]);
    (ck, mk)
}

/// Turn a key-agreement output into the first root key.
///
/// A 32-byte secret is used as is, any other length is condensed with HKDF.
///
/// # Errors
/// `DRError::InvalidSharedSecret` for an empty or all-zero secret
pub fn initial_root_key(shared_secret: &[u8]) -> Result<SymmetricKey, DRError> {
    if shared_secret.iter().all(|b| *b == 0) {
        return Err(DRError::InvalidSharedSecret);
    }
    if shared_secret.len() == KEY_LEN {
        return SymmetricKey::from_slice(shared_secret);
    }
    let prk = Hkdf::<Sha256>::new(None, shared_secret);
    Ok(expand(&prk, INITIAL_ROOT_KEY_LABEL))
}

/// Session master key for the root key at position `generation`.
pub fn session_master_key(root_key: &SymmetricKey, generation: u64) -> SymmetricKey {
    let prk = Hkdf::<Sha256>::new(Some(&generation.to_le_bytes()), root_key.as_bytes());
    expand(&prk, SESSION_MASTER_KEY_LABEL)
}

/// Stream chunk key for `generation`, derived from that generation's session master key.
pub fn stream_key(master_key: &SymmetricKey, generation: u64) -> SymmetricKey {
    let prk = Hkdf::<Sha256>::new(Some(&generation.to_le_bytes()), master_key.as_bytes());
    expand(&prk, STREAM_KEY_LABEL)
}

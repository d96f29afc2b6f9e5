//! Key material: 32-byte symmetric keys and X25519 key pairs.
//!
//! Every type holding secret bytes is zeroed when dropped, and none of them print secret
//! bytes through `Debug`.

use core::fmt;
use core::hash::{Hash, Hasher};
use rand_core::{CryptoRng, RngCore};
use subtle::ConstantTimeEq;
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::common::{self, DRError, PUBLIC_KEY_LEN};

/// Length of every symmetric key used by the crate
pub const KEY_LEN: usize = 32;

/// A 256-bit symmetric key (root, chain, message, session master or stream key).
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct SymmetricKey([u8; KEY_LEN]);

impl SymmetricKey {
    /// Wrap raw key bytes.
    pub fn from_bytes(bytes: [u8; KEY_LEN]) -> Self {
        Self(bytes)
    }

    /// Copy a key out of a slice.
    ///
    /// # Errors
    /// `DRError::InvalidKey` if `bytes` is not exactly [`KEY_LEN`] long
    pub fn from_slice(bytes: &[u8]) -> Result<Self, DRError> {
        let bytes: [u8; KEY_LEN] = bytes.try_into().map_err(|_| DRError::InvalidKey)?;
        Ok(Self(bytes))
    }

    /// Borrow the raw key bytes.
    pub fn as_bytes(&self) -> &[u8; KEY_LEN] {
        &self.0
    }
}

impl AsRef<[u8]> for SymmetricKey {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl PartialEq for SymmetricKey {
    fn eq(&self, other: &Self) -> bool {
        self.0.ct_eq(&other.0).into()
    }
}

impl Eq for SymmetricKey {}

impl fmt::Debug for SymmetricKey {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "SymmetricKey(<hidden bytes>)")
    }
}

/// An X25519 public key.
#[derive(Clone, Copy)]
pub struct PublicKey(x25519_dalek::PublicKey);

impl PublicKey {
    /// Build a public key from its 32 wire bytes.
    pub fn from_bytes(bytes: [u8; PUBLIC_KEY_LEN]) -> Self {
        Self(x25519_dalek::PublicKey::from(bytes))
    }

    /// The 32 wire bytes.
    pub fn to_bytes(&self) -> [u8; PUBLIC_KEY_LEN] {
        self.0.to_bytes()
    }

    pub(crate) fn inner(&self) -> &x25519_dalek::PublicKey {
        &self.0
    }
}

impl TryFrom<&[u8]> for PublicKey {
    type Error = DRError;

    fn try_from(bytes: &[u8]) -> Result<Self, Self::Error> {
        let bytes: [u8; PUBLIC_KEY_LEN] = bytes.try_into().map_err(|_| DRError::InvalidKey)?;
        Ok(Self::from_bytes(bytes))
    }
}

impl Eq for PublicKey {}

impl PartialEq for PublicKey {
    fn eq(&self, other: &PublicKey) -> bool {
        self.0.as_bytes() == other.0.as_bytes()
    }
}

impl Hash for PublicKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.0.as_bytes().hash(state);
    }
}

impl<'a> From<&'a x25519_dalek::StaticSecret> for PublicKey {
    fn from(private: &'a x25519_dalek::StaticSecret) -> PublicKey {
        PublicKey(x25519_dalek::PublicKey::from(private))
    }
}

impl AsRef<[u8]> for PublicKey {
    fn as_ref(&self) -> &[u8] {
        self.0.as_bytes()
    }
}

impl fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "PublicKey(")?;
        for b in &self.0.as_bytes()[..8] {
            write!(f, "{b:02x}")?;
        }
        write!(f, "..)")
    }
}

/// An X25519 key pair. The private half is zeroed on drop.
pub struct KeyPair {
    private: x25519_dalek::StaticSecret,
    public: PublicKey,
}

impl KeyPair {
    /// Rebuild a key pair from a private key supplied by a key-provisioning collaborator.
    pub fn from_private_bytes(mut private: [u8; 32]) -> Self {
        let secret = x25519_dalek::StaticSecret::from(private);
        private.zeroize();
        let public = PublicKey::from(&secret);
        KeyPair {
            private: secret,
            public,
        }
    }

    pub(crate) fn private(&self) -> &x25519_dalek::StaticSecret {
        &self.private
    }
}

impl fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "KeyPair {{ private (bytes): <hidden bytes>, public: {:?} }}",
            self.public
        )
    }
}

impl common::KeyPair for KeyPair {
    type PublicKey = PublicKey;

    fn new<R: CryptoRng + RngCore>(rng: &mut R) -> KeyPair {
        let private = x25519_dalek::StaticSecret::random_from_rng(rng);
        let public = PublicKey::from(&private);
        KeyPair { private, public }
    }

    fn public(&self) -> &PublicKey {
        &self.public
    }
}

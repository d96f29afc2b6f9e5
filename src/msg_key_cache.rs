use alloc::collections::VecDeque;
use core::fmt::{self, Debug};

use crate::{Counter, CryptoProvider};

/// Upper limit on the receive chain ratchet steps when trying to decrypt. Prevents a
/// denial-of-service attack where the attacker announces a huge message number.
pub const DEFAULT_MAX_SKIP: usize = 1000;

/// Maximum amount of skipped message keys that can be stored
pub const DEFAULT_MKS_CAPACITY: usize = 1000;

/// A `MessageKeyCache` holds the skipped `MessageKey`s.
///
/// When messages can arrive out of order, the `DoubleRatchet` must store the `MessageKeys`
/// corresponding to the messages that were skipped over. See also the [specification] for further
/// discussion.
///
/// [specification]: https://signal.org/docs/specifications/doubleratchet/#deletion-of-skipped-message-keys
pub trait MessageKeyCache<CP: CryptoProvider>: Debug + Send {
    /// maximum number of entries held at once
    fn max_capacity(&self) -> usize;

    /// number of entries currently held
    fn len(&self) -> usize;

    /// `true` when no key is cached
    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Get the `MessageKey` at `(dh, n)` if it is stored
    fn get(&self, dh: &CP::PublicKey, n: Counter) -> Option<CP::MessageKey>;

    /// Extend the storage with `mks`
    ///
    /// Keys are stored at `dh` and `n` counting upwards:
    ///   (dh, n  ): mks[0]
    ///   (dh, n+1): mks[1]
    ///   ...
    ///
    /// When the cache is full the oldest entries are evicted.
    fn extend(&mut self, dh: &CP::PublicKey, n: Counter, mks: Vec<CP::MessageKey>);

    /// Remove the `MessageKey` at index `(dh, n)`
    fn remove(&mut self, dh: &CP::PublicKey, n: Counter) -> Option<CP::MessageKey>;
}

/// One cached key of a skipped message
pub struct SkippedKey<CP: CryptoProvider> {
    /// ratchet public key of the chain the message belongs to
    pub dh: CP::PublicKey,
    /// message number inside that chain
    pub n: Counter,
    /// the message key itself
    pub key: CP::MessageKey,
}

///
/// Default implementation for `MessageKeyCache`: an insertion-ordered queue.
///
pub struct DefaultKeyStore<CP: CryptoProvider> {
    entries: VecDeque<SkippedKey<CP>>,
    max_capacity: usize,
}

impl<CP: CryptoProvider> fmt::Debug for DefaultKeyStore<CP> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "KeyStore {{ entries: {}, max_capacity: {} }}",
            self.entries.len(),
            self.max_capacity
        )
    }
}

impl<CP: CryptoProvider> DefaultKeyStore<CP> {
    /// new instance holding at most `max_capacity` keys
    #[must_use]
    pub fn new(max_capacity: usize) -> Self {
        Self {
            entries: VecDeque::new(),
            max_capacity,
        }
    }

    fn position(&self, dh: &CP::PublicKey, n: Counter) -> Option<usize> {
        self.entries.iter().position(|e| e.n == n && e.dh == *dh)
    }
}

impl<CP: CryptoProvider> Default for DefaultKeyStore<CP> {
    fn default() -> Self {
        Self::new(DEFAULT_MKS_CAPACITY)
    }
}

impl<CP: CryptoProvider + 'static> MessageKeyCache<CP> for DefaultKeyStore<CP> {
    fn max_capacity(&self) -> usize {
        self.max_capacity
    }

    fn len(&self) -> usize {
        self.entries.len()
    }

    fn get(&self, dh: &CP::PublicKey, n: Counter) -> Option<CP::MessageKey> {
        self.position(dh, n).map(|i| self.entries[i].key.clone())
    }

    fn extend(&mut self, dh: &CP::PublicKey, n: Counter, mks: Vec<CP::MessageKey>) {
        for (n, key) in (n..).zip(mks) {
            if self.max_capacity == 0 {
                return;
            }
            while self.entries.len() >= self.max_capacity {
                self.entries.pop_front();
            }
            self.entries.push_back(SkippedKey {
                dh: dh.clone(),
                n,
                key,
            });
        }
    }

    fn remove(&mut self, dh: &CP::PublicKey, n: Counter) -> Option<CP::MessageKey> {
        let i = self.position(dh, n)?;
        self.entries.remove(i).map(|e| e.key)
    }
}

//! Anti-replay bookkeeping: which `(remote ratchet key, message number)` pairs were consumed.

use alloc::collections::VecDeque;
use core::hash::Hash;
use hashbrown::{HashMap, HashSet};

use crate::Counter;

/// Default number of remote ratchet keys whose consumed message numbers are remembered
pub const DEFAULT_REPLAY_WINDOW: usize = 64;

/// Records consumed message numbers per remote ratchet key.
///
/// Only the `window` most recently seen remote keys are tracked; messages on older chains
/// cannot be decrypted anyway once their skipped keys are gone.
#[derive(Debug)]
pub struct ReplayGuard<K> {
    seen: HashMap<K, Consumed>,
    order: VecDeque<K>,
    window: usize,
}

// Message numbers below `floor` are all consumed; `above` holds the consumed ones past the first
// gap. In-order delivery keeps `above` empty.
#[derive(Debug, Default)]
struct Consumed {
    floor: u64,
    above: HashSet<Counter>,
}

impl Consumed {
    fn contains(&self, n: Counter) -> bool {
        u64::from(n) < self.floor || self.above.contains(&n)
    }

    fn insert(&mut self, n: Counter) -> bool {
        if self.contains(n) {
            return false;
        }
        self.above.insert(n);
        while Counter::try_from(self.floor).is_ok_and(|f| self.above.remove(&f)) {
            self.floor += 1;
        }
        true
    }
}

impl<K: Hash + Eq + Clone> ReplayGuard<K> {
    /// Guard remembering up to `window` remote keys (at least one).
    pub fn new(window: usize) -> Self {
        Self {
            seen: HashMap::new(),
            order: VecDeque::new(),
            window: window.max(1),
        }
    }

    /// Has `(key, n)` already been consumed?
    pub fn contains(&self, key: &K, n: Counter) -> bool {
        self.seen.get(key).is_some_and(|c| c.contains(n))
    }

    /// Mark `(key, n)` consumed. Returns `false` if it already was.
    pub fn record(&mut self, key: &K, n: Counter) -> bool {
        if let Some(consumed) = self.seen.get_mut(key) {
            return consumed.insert(n);
        }
        while self.order.len() >= self.window {
            if let Some(old) = self.order.pop_front() {
                self.seen.remove(&old);
            }
        }
        self.order.push_back(key.clone());
        let mut consumed = Consumed::default();
        consumed.insert(n);
        self.seen.insert(key.clone(), consumed);
        true
    }

    /// Number of remote keys currently tracked
    pub fn tracked_keys(&self) -> usize {
        self.order.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_record_is_rejected() {
        let mut guard = ReplayGuard::new(4);
        assert!(!guard.contains(&"a", 1));
        assert!(guard.record(&"a", 1));
        assert!(guard.contains(&"a", 1));
        assert!(!guard.record(&"a", 1));
        assert!(!guard.contains(&"b", 1));
    }

    #[test]
    fn window_drops_oldest_key() {
        let mut guard = ReplayGuard::new(2);
        guard.record(&"a", 0);
        guard.record(&"b", 0);
        guard.record(&"c", 0);
        assert_eq!(guard.tracked_keys(), 2);
        assert!(!guard.contains(&"a", 0));
        assert!(guard.contains(&"b", 0));
        assert!(guard.contains(&"c", 0));
    }

    #[test]
    fn in_order_delivery_keeps_no_exceptions() {
        let mut guard = ReplayGuard::new(1);
        for n in 0..10_000 {
            assert!(guard.record(&"a", n));
        }
        let consumed = &guard.seen[&"a"];
        assert_eq!(consumed.floor, 10_000);
        assert!(consumed.above.is_empty());
        assert!(guard.contains(&"a", 0));
        assert!(guard.contains(&"a", 9_999));
        assert!(!guard.contains(&"a", 10_000));
    }

    #[test]
    fn gaps_are_remembered_until_filled() {
        let mut guard = ReplayGuard::new(1);
        assert!(guard.record(&"a", 0));
        assert!(guard.record(&"a", 3));
        assert!(guard.record(&"a", 2));
        assert_eq!(guard.seen[&"a"].floor, 1);
        assert_eq!(guard.seen[&"a"].above.len(), 2);
        assert!(!guard.contains(&"a", 1));
        assert!(!guard.record(&"a", 3));

        assert!(guard.record(&"a", 1));
        assert_eq!(guard.seen[&"a"].floor, 4);
        assert!(guard.seen[&"a"].above.is_empty());
        assert!(!guard.record(&"a", 2));
    }

    #[test]
    fn last_message_number_is_tracked() {
        let mut guard = ReplayGuard::new(1);
        assert!(guard.record(&"a", Counter::MAX));
        assert!(guard.contains(&"a", Counter::MAX));
        assert!(!guard.record(&"a", Counter::MAX));
    }
}

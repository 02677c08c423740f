use crate::placeholder::Placeholder;

use parking_lot::Mutex;
use std::collections::HashMap;

/// An identifier correlating one distributed exchange without central coordination.
///
/// The `tag` scopes unrelated concurrent exchanges (one tag per barrier generation, broadcast
/// instance, array, ...), the `id` names the specific datum or barrier instance under that tag.
/// A key must be unique per logical exchange while the exchange is live, reusing a live key is a
/// caller error. A key may be reused once the prior exchange under it has completed.
#[derive(
    serde::Serialize, serde::Deserialize, Copy, Clone, Debug, Eq, PartialEq, Hash, Default,
)]
pub struct DistKey {
    pub tag: u64,
    pub id: u64,
}

impl DistKey {
    pub fn new(tag: u64, id: u64) -> DistKey {
        DistKey { tag: tag, id: id }
    }
}

struct CacheEntry {
    slot: Placeholder<Vec<u8>>,
    produced: bool,
    consumed: bool,
}

/// The per-PE table correlating [DistKey]s with placeholders for values that may be produced
/// locally or delivered from a remote PE.
///
/// An entry is created lazily on first reference from either side of the exchange, a `get`
/// issued before the matching `set` returns an unsatisfied placeholder without busy waiting.
/// Entries are single-shot, the table forgets a key once both sides have touched it.
///
/// The table is mutated concurrently by local worker threads and incoming-message handlers. The
/// table lock is held only to locate an entry, per-key synchronization happens on the entry's
/// placeholder.
pub(crate) struct DistCache {
    entries: Mutex<HashMap<DistKey, CacheEntry>>,
}

impl DistCache {
    pub(crate) fn new() -> DistCache {
        DistCache {
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Satisfy the entry for `key`, creating it if no consumer has asked for it yet.
    ///
    /// Setting a live key twice is a fatal error.
    pub(crate) fn set(&self, key: DistKey, data: Vec<u8>) {
        let slot = {
            let mut entries = self.entries.lock();
            match entries.get_mut(&key) {
                Some(entry) => {
                    assert!(
                        !entry.produced,
                        "cache key {:?} set more than once while live",
                        key
                    );
                    entry.produced = true;
                    let slot = entry.slot.clone();
                    if entry.consumed {
                        entries.remove(&key);
                    }
                    slot
                }
                None => {
                    let entry = CacheEntry {
                        slot: Placeholder::new(),
                        produced: true,
                        consumed: false,
                    };
                    let slot = entry.slot.clone();
                    entries.insert(key, entry);
                    slot
                }
            }
        };
        // assign outside the table lock so callbacks never contend with unrelated keys
        slot.set(data);
    }

    /// Return the placeholder for `key`, creating an unsatisfied entry if none exists.
    ///
    /// Non-blocking, the caller decides whether to wait on the placeholder or attach a
    /// continuation to it.
    pub(crate) fn get(&self, key: DistKey) -> Placeholder<Vec<u8>> {
        let mut entries = self.entries.lock();
        match entries.get_mut(&key) {
            Some(entry) => {
                entry.consumed = true;
                let slot = entry.slot.clone();
                if entry.produced {
                    entries.remove(&key);
                }
                slot
            }
            None => {
                let entry = CacheEntry {
                    slot: Placeholder::new(),
                    produced: false,
                    consumed: true,
                };
                let slot = entry.slot.clone();
                entries.insert(key, entry);
                slot
            }
        }
    }

    /// The number of live entries, exposed for teardown diagnostics
    pub(crate) fn len(&self) -> usize {
        self.entries.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn get_after_set_resolves_immediately() {
        let cache = DistCache::new();
        cache.set(DistKey::new(1, 0), vec![5, 6]);
        let slot = cache.get(DistKey::new(1, 0));
        assert!(slot.probe());
        assert_eq!(slot.get(), vec![5, 6]);
        assert_eq!(cache.len(), 0);
    }

    #[test]
    fn get_before_set_resolves_on_set() {
        let cache = DistCache::new();
        let slot = cache.get(DistKey::new(2, 7));
        assert!(!slot.probe());
        cache.set(DistKey::new(2, 7), vec![9]);
        assert!(slot.probe());
        assert_eq!(slot.get(), vec![9]);
        assert_eq!(cache.len(), 0);
    }

    #[test]
    fn independent_keys_do_not_interfere() {
        let cache = DistCache::new();
        let a = cache.get(DistKey::new(1, 0));
        let b = cache.get(DistKey::new(1, 1));
        cache.set(DistKey::new(1, 1), vec![1]);
        assert!(!a.probe());
        assert!(b.probe());
    }

    #[test]
    fn key_may_be_reused_after_completion() {
        let cache = DistCache::new();
        cache.set(DistKey::new(3, 3), vec![1]);
        assert_eq!(cache.get(DistKey::new(3, 3)).get(), vec![1]);
        cache.set(DistKey::new(3, 3), vec![2]);
        assert_eq!(cache.get(DistKey::new(3, 3)).get(), vec![2]);
    }

    #[test]
    #[should_panic]
    fn double_set_of_live_key_panics() {
        let cache = DistCache::new();
        cache.set(DistKey::new(4, 0), vec![1]);
        cache.set(DistKey::new(4, 0), vec![2]);
    }
}

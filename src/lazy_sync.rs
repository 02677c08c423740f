use crate::dist_cache::DistKey;
use crate::group::GroupId;

use parking_lot::Mutex;
use std::collections::HashMap;

pub(crate) type SyncOp = Box<dyn FnOnce() + Send>;

struct SyncEntry {
    arrived: usize,
    op: Option<SyncOp>,
}

/// The per-PE table of in-flight lazy synchronizations, keyed by ([DistKey], [GroupId]).
///
/// A lazy sync is an asynchronous, key-scoped barrier: each member's arrival increments the
/// count, and the arrival that completes the count fires the locally registered action exactly
/// once and discards the instance. The local arrival is counted without a message, every other
/// member's arrival reaches this table through an incoming notification task.
///
/// A key may be reused for a new sync once the prior instance has fired. There is no
/// cancellation, an instance whose key never completes leaks and blocks dependents, which is a
/// caller obligation rather than a runtime-enforced property.
pub(crate) struct SyncRegistry {
    table: Mutex<HashMap<(DistKey, GroupId), SyncEntry>>,
}

impl SyncRegistry {
    pub(crate) fn new() -> SyncRegistry {
        SyncRegistry {
            table: Mutex::new(HashMap::new()),
        }
    }

    /// Record one arrival for `(key, group)` out of `expected`, registering `op` when the
    /// arrival is the local one.
    ///
    /// Returns the registered action if this arrival completed the count, for the caller to run
    /// outside the table lock. Arriving twice locally for a live key is a fatal error.
    pub(crate) fn arrive(
        &self,
        key: DistKey,
        group: GroupId,
        expected: usize,
        op: Option<SyncOp>,
    ) -> Option<SyncOp> {
        let mut table = self.table.lock();
        let entry = table
            .entry((key, group))
            .or_insert(SyncEntry {
                arrived: 0,
                op: None,
            });
        if op.is_some() {
            assert!(
                entry.op.is_none(),
                "duplicate local arrival for live sync key {:?}",
                key
            );
            entry.op = op;
        }
        entry.arrived += 1;
        assert!(
            entry.arrived <= expected,
            "sync key {:?} over-arrived: {:?} of {:?}",
            key,
            entry.arrived,
            expected
        );
        if entry.arrived == expected {
            let entry = table.remove(&(key, group)).unwrap();
            let op = entry.op;
            assert!(
                op.is_some(),
                "sync key {:?} completed without a local arrival",
                key
            );
            op
        } else {
            None
        }
    }

    /// The number of pending instances, exposed for teardown diagnostics
    pub(crate) fn len(&self) -> usize {
        self.table.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::group::Group;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn key(id: u64) -> DistKey {
        DistKey::new(9, id)
    }

    fn gid() -> GroupId {
        Group::new(vec![0, 1, 2]).id()
    }

    #[test]
    fn fires_only_on_final_arrival() {
        let registry = SyncRegistry::new();
        let fired = Arc::new(AtomicUsize::new(0));
        let fired2 = fired.clone();

        assert!(registry.arrive(key(0), gid(), 3, None).is_none());
        let op: SyncOp = Box::new(move || {
            fired2.fetch_add(1, Ordering::SeqCst);
        });
        assert!(registry.arrive(key(0), gid(), 3, Some(op)).is_none());
        assert_eq!(fired.load(Ordering::SeqCst), 0);

        let op = registry.arrive(key(0), gid(), 3, None).unwrap();
        op();
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert_eq!(registry.len(), 0);
    }

    #[test]
    fn singleton_group_fires_immediately() {
        let registry = SyncRegistry::new();
        let op = registry
            .arrive(key(1), gid(), 1, Some(Box::new(|| {})))
            .expect("single-member sync must complete on the local arrival");
        op();
    }

    #[test]
    fn key_reuse_after_firing() {
        let registry = SyncRegistry::new();
        registry
            .arrive(key(2), gid(), 1, Some(Box::new(|| {})))
            .unwrap()();
        // the instance was discarded, the key is free again
        assert!(registry
            .arrive(key(2), gid(), 2, Some(Box::new(|| {})))
            .is_none());
        assert_eq!(registry.len(), 1);
    }

    #[test]
    #[should_panic]
    fn double_local_arrival_panics() {
        let registry = SyncRegistry::new();
        let _ = registry.arrive(key(3), gid(), 3, Some(Box::new(|| {})));
        let _ = registry.arrive(key(3), gid(), 3, Some(Box::new(|| {})));
    }
}

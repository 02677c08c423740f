use crate::dist_cache::DistKey;
use crate::fabric::FabricComm;
use crate::group::{binary_tree, Group, GroupId};
use crate::placeholder::Placeholder;
use crate::tessellar_world::WorldInner;
use crate::Dist;

use std::sync::Arc;
use tracing::trace;

/// The operations a PE may ask another PE to perform, carried as bincode envelopes over the
/// fabric. The communicator is the only producer of these.
#[derive(serde::Serialize, serde::Deserialize, Debug)]
pub(crate) enum RemoteOp {
    /// Satisfy the destination's cache entry for `key`
    CacheSet {
        key: DistKey,
        #[serde(with = "serde_bytes")]
        data: Vec<u8>,
    },
    /// One step of a world broadcast: cache the value locally and forward to the tree children
    Bcast {
        key: DistKey,
        #[serde(with = "serde_bytes")]
        data: Vec<u8>,
        root: usize,
    },
    /// One step of a group broadcast, resolved against the destination's group registry
    GroupBcast {
        group: GroupId,
        key: DistKey,
        #[serde(with = "serde_bytes")]
        data: Vec<u8>,
        group_root: usize,
    },
    /// One member of a lazy sync has arrived
    SyncArrive {
        key: DistKey,
        group: GroupId,
        size: usize,
    },
    /// Request a tile of a registered array, to be sent back once it is assigned
    FetchTile {
        tag: u64,
        index: usize,
        reply_to: usize,
    },
}

/// The facade composing the distributed cache, groups, and lazy synchronization into
/// point-to-point delivery of values by key, tree-based broadcast, and asynchronous barriers.
///
/// A communicator is a cheap handle onto its world and may be cloned freely. All operations
/// assume reliable, eventually-delivered messaging, there is no retry layer, and a lost or
/// never-produced value stalls its dependents indefinitely.
#[derive(Clone)]
pub struct Communicator {
    pub(crate) inner: Arc<WorldInner>,
}

impl Communicator {
    pub(crate) fn new(inner: Arc<WorldInner>) -> Communicator {
        Communicator { inner: inner }
    }

    /// The id of this PE
    pub fn my_pe(&self) -> usize {
        self.inner.my_pe
    }

    /// The number of PEs in the world
    pub fn num_pes(&self) -> usize {
        self.inner.num_pes
    }

    /// Deliver `value` into `dest`'s cache under `key`.
    ///
    /// When `dest` is the calling PE the local cache entry is satisfied directly and no message
    /// is sent.
    pub fn send<T: Dist>(&self, dest: usize, key: DistKey, value: &T) {
        let data = crate::serialize(value).expect("failed to serialize value for send");
        self.send_bytes(dest, key, data);
    }

    /// Like [send][Communicator::send], but deferring until `value` is assigned.
    ///
    /// When the placeholder is not yet satisfied a one-shot readiness callback performs the send
    /// instead of blocking the caller.
    pub fn send_when_ready<T: Dist>(&self, dest: usize, key: DistKey, value: &Placeholder<T>) {
        let comm = self.clone();
        value.on_ready(move |value| comm.send(dest, key, &value));
    }

    /// The placeholder for the value delivered (now or later) under `key`, deserialized on
    /// satisfaction. Non-blocking.
    pub fn recv<T: Dist>(&self, key: DistKey) -> Placeholder<T> {
        typed(self.inner.cache.get(key))
    }

    /// Broadcast the value held by `value` from PE `root` to every PE of the world.
    ///
    /// On the root the value is forwarded down a binary spanning tree once it is ready. On every
    /// other PE `value` must be unset and is assigned from the incoming broadcast. A no-op for a
    /// world of one PE.
    pub fn bcast<T: Dist>(&self, key: DistKey, value: &Placeholder<T>, root: usize) {
        let num_pes = self.num_pes();
        assert!(root < num_pes, "invalid root pe: {:?}", root);
        assert!(
            self.my_pe() == root || !value.probe(),
            "broadcast value already set on non-root pe {:?}",
            self.my_pe()
        );
        if num_pes == 1 {
            return;
        }
        if self.my_pe() == root {
            let inner = self.inner.clone();
            value.on_ready(move |value| {
                let data =
                    crate::serialize(&value).expect("failed to serialize broadcast value");
                bcast_children(&inner, key, data, root);
            });
        } else {
            let value = value.clone();
            self.inner.cache.get(key).on_ready(move |data| {
                value.set(
                    crate::deserialize(&data).expect("failed to deserialize broadcast value"),
                );
            });
        }
    }

    /// Broadcast within `group`, with `group_root` given as a group-local rank.
    ///
    /// The calling PE must be a member. Forwarding PEs that receive a step for a group they have
    /// not registered yet defer through the group registry instead of failing.
    pub fn bcast_group<T: Dist>(
        &self,
        key: DistKey,
        value: &Placeholder<T>,
        group_root: usize,
        group: &Arc<Group>,
    ) {
        assert!(
            group_root < group.size(),
            "invalid group root: {:?}",
            group_root
        );
        let my_rank = group
            .group_rank(self.my_pe())
            .unwrap_or_else(|| panic!("pe {:?} is not a member of the broadcast group", self.my_pe()));
        assert!(
            my_rank == group_root || !value.probe(),
            "broadcast value already set on non-root pe {:?}",
            self.my_pe()
        );
        if group.size() == 1 {
            return;
        }
        if my_rank == group_root {
            let inner = self.inner.clone();
            let group = group.clone();
            value.on_ready(move |value| {
                let data =
                    crate::serialize(&value).expect("failed to serialize broadcast value");
                group_bcast_children(&inner, &group, key, data, group_root);
            });
        } else {
            let value = value.clone();
            self.inner.cache.get(key).on_ready(move |data| {
                value.set(
                    crate::deserialize(&data).expect("failed to deserialize broadcast value"),
                );
            });
        }
    }

    /// Register `op` to run locally exactly once, after every PE of the world has called
    /// `lazy_sync` with the same `key`.
    ///
    /// Keys must be unique per sync while the sync is live and may be reused after the action
    /// has fired.
    pub fn lazy_sync<F>(&self, key: DistKey, op: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let group = self.inner.world_group.clone();
        self.lazy_sync_group(key, op, &group);
    }

    /// Like [lazy_sync][Communicator::lazy_sync], scoped to the members of `group`
    pub fn lazy_sync_group<F>(&self, key: DistKey, op: F, group: &Arc<Group>)
    where
        F: FnOnce() + Send + 'static,
    {
        let me = self.my_pe();
        assert!(
            group.contains(me),
            "lazy sync called from pe {:?} outside group {:?}",
            me,
            group.id()
        );
        // the local arrival is counted without a message
        if let Some(op) = self
            .inner
            .syncs
            .arrive(key, group.id(), group.size(), Some(Box::new(op)))
        {
            op();
        }
        for &member in group.members() {
            if member != me {
                self.remote(
                    member,
                    RemoteOp::SyncArrive {
                        key: key,
                        group: group.id(),
                        size: group.size(),
                    },
                );
            }
        }
    }

    pub(crate) fn send_bytes(&self, dest: usize, key: DistKey, data: Vec<u8>) {
        if dest == self.my_pe() {
            // skip the message and satisfy the entry immediately
            self.inner.cache.set(key, data);
        } else {
            self.remote(dest, RemoteOp::CacheSet { key: key, data: data });
        }
    }

    /// Ask `owner` to send tile `index` of array `tag` back to this PE once it is assigned
    pub(crate) fn request_tile(&self, owner: usize, tag: u64, index: usize) {
        trace!(
            "pe {:?} requesting tile {:?} of array {:?} from pe {:?}",
            self.my_pe(),
            index,
            tag,
            owner
        );
        self.remote(
            owner,
            RemoteOp::FetchTile {
                tag: tag,
                index: index,
                reply_to: self.my_pe(),
            },
        );
    }

    fn remote(&self, dest: usize, op: RemoteOp) {
        let env = crate::serialize(&op).expect("failed to serialize envelope");
        self.inner.fabric.send(dest, env);
    }
}

/// View a cache entry's byte placeholder as a typed placeholder
fn typed<T: Dist>(bytes: Placeholder<Vec<u8>>) -> Placeholder<T> {
    let value = Placeholder::new();
    let slot = value.clone();
    bytes.on_ready(move |data| {
        slot.set(crate::deserialize(&data).expect("failed to deserialize cached value"));
    });
    value
}

fn bcast_children(inner: &Arc<WorldInner>, key: DistKey, data: Vec<u8>, root: usize) {
    let tree = binary_tree(inner.my_pe, root, inner.num_pes);
    for child in [tree.child0, tree.child1].into_iter().flatten() {
        let env = crate::serialize(&RemoteOp::Bcast {
            key: key,
            data: data.clone(),
            root: root,
        })
        .expect("failed to serialize envelope");
        inner.fabric.send(child, env);
    }
}

fn group_bcast_children(
    inner: &Arc<WorldInner>,
    group: &Group,
    key: DistKey,
    data: Vec<u8>,
    group_root: usize,
) {
    let my_rank = group
        .group_rank(inner.my_pe)
        .expect("group broadcast step delivered to a pe outside the group");
    let tree = group.make_tree(my_rank, group_root);
    for child in [tree.child0, tree.child1].into_iter().flatten() {
        let env = crate::serialize(&RemoteOp::GroupBcast {
            group: group.id(),
            key: key,
            data: data.clone(),
            group_root: group_root,
        })
        .expect("failed to serialize envelope");
        inner.fabric.send(group.world_rank(child), env);
    }
}

/// Execute one incoming envelope on the receiving PE, on a worker thread
pub(crate) fn handle_remote_op(inner: &Arc<WorldInner>, src: usize, op: RemoteOp) {
    trace!("pe {:?} handling {:?} from pe {:?}", inner.my_pe, op, src);
    match op {
        RemoteOp::CacheSet { key, data } => {
            inner.cache.set(key, data);
        }
        RemoteOp::Bcast { key, data, root } => {
            inner.cache.set(key, data.clone());
            bcast_children(inner, key, data, root);
        }
        RemoteOp::GroupBcast {
            group,
            key,
            data,
            group_root,
        } => {
            inner.cache.set(key, data.clone());
            let forward_inner = inner.clone();
            inner.groups.lookup(group).on_ready(move |group| {
                group_bcast_children(&forward_inner, &group, key, data, group_root);
            });
        }
        RemoteOp::SyncArrive { key, group, size } => {
            if let Some(op) = inner.syncs.arrive(key, group, size, None) {
                op();
            }
        }
        RemoteOp::FetchTile {
            tag,
            index,
            reply_to,
        } => {
            let comm = Communicator::new(inner.clone());
            inner.lookup_array(tag).on_ready(move |serve| {
                serve(&comm, index, reply_to);
            });
        }
    }
}

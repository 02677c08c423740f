use crate::placeholder::Placeholder;

use parking_lot::Mutex;
use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::Hasher;
use std::sync::Arc;

/// The stable identifier of a [Group], derived deterministically from its membership.
///
/// Every PE computes the same identifier for the same member list without communication, so
/// group-scoped messages can name their group before the receiver has registered it locally.
#[derive(serde::Serialize, serde::Deserialize, Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub struct GroupId(u64);

/// The position of a PE within the balanced binary spanning tree used for broadcast fan-out.
///
/// All ranks are group-local. Absent children mark a leaf.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct BcastTree {
    pub parent: Option<usize>,
    pub child0: Option<usize>,
    pub child1: Option<usize>,
}

/// Compute the parent and up to two children of `me` in a balanced binary spanning tree of
/// `size` nodes rooted at `root`, by arithmetic on ranks alone.
pub(crate) fn binary_tree(me: usize, root: usize, size: usize) -> BcastTree {
    assert!(me < size && root < size);
    // positions are heap indices after shifting the ranks so the root lands at zero
    let shifted = (me + size - root) % size;
    let parent = if shifted == 0 {
        None
    } else {
        Some(((shifted - 1) / 2 + root) % size)
    };
    let child = |k: usize| {
        let pos = 2 * shifted + k;
        if pos < size {
            Some((pos + root) % size)
        } else {
            None
        }
    };
    BcastTree {
        parent: parent,
        child0: child(1),
        child1: child(2),
    }
}

/// A named, ordered subset of the PEs of a world.
///
/// A group maps group-local ranks onto world ranks and back, and carries the broadcast-tree
/// topology for group-scoped collectives. Membership is fixed at construction, all PEs of a
/// world construct identical replicas of a group (in the same SPMD order) and register them with
/// their world so that group-scoped traffic can resolve the membership on arrival.
#[derive(Debug)]
pub struct Group {
    members: Vec<usize>,
    index: HashMap<usize, usize>,
    id: GroupId,
}

impl Group {
    /// Construct a group from an ordered list of world ranks.
    ///
    /// The position of a rank in `members` is its group-local rank. Panics on an empty list or a
    /// duplicate member.
    pub fn new(members: Vec<usize>) -> Group {
        assert!(!members.is_empty(), "cannot construct an empty group");
        let mut index = HashMap::with_capacity(members.len());
        for (group_rank, world_rank) in members.iter().enumerate() {
            let prev = index.insert(*world_rank, group_rank);
            assert!(
                prev.is_none(),
                "duplicate member {:?} in group {:?}",
                world_rank,
                members
            );
        }
        let id = Group::derive_id(&members);
        Group {
            members: members,
            index: index,
            id: id,
        }
    }

    fn derive_id(members: &[usize]) -> GroupId {
        // fixed-key hasher, identical on every pe for the same membership
        let mut hasher = DefaultHasher::new();
        hasher.write_u64(members.len() as u64);
        for member in members {
            hasher.write_u64(*member as u64);
        }
        GroupId(hasher.finish())
    }

    /// The number of PEs in the group
    pub fn size(&self) -> usize {
        self.members.len()
    }

    /// The stable identifier shared by all replicas of this group
    pub fn id(&self) -> GroupId {
        self.id
    }

    /// Convert a group-local rank into the world id space
    pub fn world_rank(&self, group_rank: usize) -> usize {
        self.members[group_rank]
    }

    /// Convert a world rank into the group-local id space, `None` when the PE is not a member
    pub fn group_rank(&self, world_rank: usize) -> Option<usize> {
        self.index.get(&world_rank).copied()
    }

    /// Whether `world_rank` is a member of this group
    pub fn contains(&self, world_rank: usize) -> bool {
        self.index.contains_key(&world_rank)
    }

    /// The ordered membership, in world ranks
    pub fn members(&self) -> &[usize] {
        &self.members
    }

    /// The broadcast-tree position of group-local rank `group_rank` for a broadcast rooted at
    /// group-local rank `root`
    pub fn make_tree(&self, group_rank: usize, root: usize) -> BcastTree {
        binary_tree(group_rank, root, self.members.len())
    }
}

/// The per-world table resolving [GroupId]s to registered group replicas.
///
/// Registration satisfies a placeholder, so a group-scoped message arriving before the local
/// replica has been registered defers via a readiness callback instead of failing.
pub(crate) struct GroupRegistry {
    table: Mutex<HashMap<GroupId, Placeholder<Arc<Group>>>>,
}

impl GroupRegistry {
    pub(crate) fn new() -> GroupRegistry {
        GroupRegistry {
            table: Mutex::new(HashMap::new()),
        }
    }

    /// Register the local replica of `group`, satisfying any deferred lookups.
    pub(crate) fn register(&self, group: Arc<Group>) {
        let slot = self
            .table
            .lock()
            .entry(group.id())
            .or_insert_with(Placeholder::new)
            .clone();
        assert!(
            !slot.probe(),
            "group {:?} registered more than once",
            group.id()
        );
        slot.set(group);
    }

    /// The placeholder for the group registered (now or later) under `id`
    pub(crate) fn lookup(&self, id: GroupId) -> Placeholder<Arc<Group>> {
        self.table
            .lock()
            .entry(id)
            .or_insert_with(Placeholder::new)
            .clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rank_mapping_round_trips() {
        let group = Group::new(vec![4, 1, 7]);
        assert_eq!(group.size(), 3);
        assert_eq!(group.world_rank(0), 4);
        assert_eq!(group.world_rank(2), 7);
        assert_eq!(group.group_rank(1), Some(1));
        assert_eq!(group.group_rank(7), Some(2));
        assert_eq!(group.group_rank(0), None);
        assert!(group.contains(4));
        assert!(!group.contains(2));
    }

    #[test]
    fn id_is_deterministic_per_membership() {
        let a = Group::new(vec![0, 2, 5]);
        let b = Group::new(vec![0, 2, 5]);
        let c = Group::new(vec![0, 5, 2]);
        assert_eq!(a.id(), b.id());
        assert_ne!(a.id(), c.id()); // order is part of the identity
    }

    #[test]
    fn tree_is_consistent_for_all_sizes_and_roots() {
        for size in 1..=8 {
            for root in 0..size {
                let mut reached = vec![false; size];
                for me in 0..size {
                    let tree = binary_tree(me, root, size);
                    if me == root {
                        assert_eq!(tree.parent, None);
                    } else {
                        // my parent must list me among its children
                        let parent = tree.parent.unwrap();
                        let up = binary_tree(parent, root, size);
                        assert!(
                            up.child0 == Some(me) || up.child1 == Some(me),
                            "size {:?} root {:?} me {:?}",
                            size,
                            root,
                            me
                        );
                    }
                    for child in [tree.child0, tree.child1].into_iter().flatten() {
                        assert!(!reached[child], "rank {:?} reached twice", child);
                        reached[child] = true;
                    }
                }
                reached[root] = true;
                assert!(reached.iter().all(|r| *r), "size {:?} root {:?}", size, root);
            }
        }
    }

    #[test]
    fn registry_defers_lookup_until_registration() {
        let registry = GroupRegistry::new();
        let group = Arc::new(Group::new(vec![0, 1]));
        let slot = registry.lookup(group.id());
        assert!(!slot.probe());
        registry.register(group.clone());
        assert_eq!(slot.get().id(), group.id());
    }

    #[test]
    #[should_panic]
    fn duplicate_members_panic() {
        Group::new(vec![0, 1, 1]);
    }
}

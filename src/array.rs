use crate::comm::Communicator;
use crate::dist_cache::DistKey;
use crate::placeholder::Placeholder;
use crate::pmap::{Distribution, LocalIndices, ProcMap};
use crate::shape::TileShape;
use crate::tessellar_world::TessellarWorld;
use crate::Dist;

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::warn;

struct ArrayInner<T> {
    world: TessellarWorld,
    shape: TileShape,
    pmap: Arc<ProcMap>,
    tiles: Mutex<HashMap<usize, Placeholder<T>>>,
    remote: Mutex<HashMap<usize, Placeholder<T>>>,
    tag: u64,
}

impl<T: Dist> ArrayInner<T> {
    fn local_slot(&self, tile: usize) -> Placeholder<T> {
        assert!(
            self.pmap.is_local(tile),
            "tile {:?} is owned by pe {:?}, not pe {:?}",
            tile,
            self.pmap.owner(tile),
            self.pmap.my_pe()
        );
        self.tiles
            .lock()
            .entry(tile)
            .or_insert_with(Placeholder::new)
            .clone()
    }
}

impl<T> Drop for ArrayInner<T> {
    fn drop(&mut self) {
        self.world.inner.deregister_array(self.tag);
    }
}

/// A block-tiled array distributed over the PEs of a world.
///
/// Each PE owns the tiles its replicated [ProcMap] assigns to it and holds one placeholder per
/// owned tile. Tile placeholders are assigned exactly once, by local computation or by
/// [set][DistArray::set], after which the array is immutable for that index. [find][DistArray::find]
/// returns a tile's placeholder regardless of ownership, transparently requesting a copy from
/// the owner for non-local indices. Structural queries ([is_zero][DistArray::is_zero],
/// [is_local][DistArray::is_local], [owner][DistArray::owner]) never fetch data.
///
/// Arrays are constructed collectively: every PE of the world constructs the array with the
/// same geometry, in the same SPMD order, which keeps the arrays' exchange tags consistent
/// across PEs without communication.
pub struct DistArray<T> {
    inner: Arc<ArrayInner<T>>,
}

impl<T> Clone for DistArray<T> {
    fn clone(&self) -> Self {
        DistArray {
            inner: self.inner.clone(),
        }
    }
}

impl<T> std::fmt::Debug for DistArray<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "DistArray {{ tag: {:?}, num_tiles: {:?}, dense: {:?} }}",
            self.inner.tag,
            self.inner.pmap.num_tiles(),
            self.inner.shape.is_dense()
        )
    }
}

impl<T: Dist> DistArray<T> {
    /// Construct an array of `num_tiles` tiles distributed by `dist`, with sparsity `shape`
    pub fn new(
        world: &TessellarWorld,
        num_tiles: usize,
        shape: TileShape,
        dist: Distribution,
    ) -> DistArray<T> {
        let pmap = Arc::new(
            ProcMap::new(num_tiles, world.num_pes(), world.my_pe(), dist)
                .expect("invalid array geometry"),
        );
        DistArray::with_pmap(world, shape, pmap)
    }

    /// Construct an array over an existing process map, sharing the tile ownership of the
    /// arrays the map came from
    pub fn with_pmap(world: &TessellarWorld, shape: TileShape, pmap: Arc<ProcMap>) -> DistArray<T> {
        assert!(
            shape.validate(pmap.num_tiles()),
            "shape reports {:?} tiles but the array has {:?}",
            shape.num_tiles(),
            pmap.num_tiles()
        );
        assert!(
            pmap.num_pes() == world.num_pes() && pmap.my_pe() == world.my_pe(),
            "process map does not match the world geometry"
        );
        let tag = world.inner.alloc_tag();
        let inner = Arc::new(ArrayInner {
            world: world.clone(),
            shape: shape,
            pmap: pmap,
            tiles: Mutex::new(HashMap::new()),
            remote: Mutex::new(HashMap::new()),
            tag: tag,
        });
        // serve remote fetch requests, replying once the requested tile is assigned
        let serve = Arc::downgrade(&inner);
        world.inner.register_array(
            tag,
            Arc::new(
                move |comm: &Communicator, index: usize, reply_to: usize| match serve.upgrade() {
                    Some(inner) => {
                        let key = DistKey::new(inner.tag, index as u64);
                        let comm = comm.clone();
                        inner
                            .local_slot(index)
                            .on_ready(move |tile| comm.send(reply_to, key, &tile));
                    }
                    None => {
                        warn!("dropping tile fetch for index {:?} of a dropped array", index);
                    }
                },
            ),
        );
        DistArray { inner: inner }
    }

    /// The placeholder for tile `tile`, triggering a remote fetch when the tile is not local.
    ///
    /// Repeated finds of the same non-local tile share one fetch. The tile must not be
    /// structurally zero, absent tiles have no data to find.
    pub fn find(&self, tile: usize) -> Placeholder<T> {
        assert!(
            !self.is_zero(tile),
            "tile {:?} is structurally zero and holds no data",
            tile
        );
        if self.is_local(tile) {
            self.inner.local_slot(tile)
        } else {
            let mut remote = self.inner.remote.lock();
            if let Some(slot) = remote.get(&tile) {
                return slot.clone();
            }
            let comm = self.inner.world.communicator();
            let slot = comm.recv(DistKey::new(self.inner.tag, tile as u64));
            comm.request_tile(self.owner(tile), self.inner.tag, tile);
            remote.insert(tile, slot.clone());
            slot
        }
    }

    /// Assign tile `tile`, exactly once. The tile must be owned by the calling PE and must not
    /// be structurally zero.
    pub fn set(&self, tile: usize, value: T) {
        assert!(
            !self.is_zero(tile),
            "tile {:?} is structurally zero and cannot be stored",
            tile
        );
        self.inner.local_slot(tile).set(value);
    }

    /// Assign tile `tile` from a placeholder, deferring until the value is ready
    pub fn set_when_ready(&self, tile: usize, value: &Placeholder<T>) {
        let this = self.clone();
        value.on_ready(move |value| this.set(tile, value));
    }

    /// Whether tile `tile` is treated as structurally absent
    pub fn is_zero(&self, tile: usize) -> bool {
        self.inner.shape.is_zero(tile)
    }

    /// Whether tile `tile` is owned by the calling PE
    pub fn is_local(&self, tile: usize) -> bool {
        self.inner.pmap.is_local(tile)
    }

    /// The PE owning tile `tile`
    pub fn owner(&self, tile: usize) -> usize {
        self.inner.pmap.owner(tile)
    }

    /// Iterate over the tile indices owned by the calling PE
    pub fn local_indices(&self) -> LocalIndices {
        self.inner.pmap.local_indices()
    }

    pub fn num_tiles(&self) -> usize {
        self.inner.pmap.num_tiles()
    }

    pub fn world(&self) -> &TessellarWorld {
        &self.inner.world
    }

    pub fn shape(&self) -> &TileShape {
        &self.inner.shape
    }

    pub fn pmap(&self) -> &Arc<ProcMap> {
        &self.inner.pmap
    }
}

//! Tessellar is an investigation of asynchronous tasking runtimes for block-tiled distributed
//! arrays in the Rust systems programming language, with a focus on sparsity-aware evaluation.
//!
//! Tessellar coordinates computation across a fixed set of cooperating processes (PEs) that
//! jointly own a large, block-partitioned array. No single PE holds the whole array; each owns a
//! deterministic subset of tiles and fetches, combines, and redistributes tiles produced by
//! remote PEs while overlapping computation with communication.
//!
//! The runtime is built from a small set of cooperating layers.
//! First, a replicated [ProcMap][crate::ProcMap] gives every PE a consistent answer to "who owns
//! tile i" without communication, and a [TileShape][crate::TileShape] records which tiles are
//! treated as structurally zero.
//! Second, a per-PE distributed cache correlates application-chosen [DistKey][crate::DistKey]s
//! with single-assignment [Placeholder][crate::Placeholder]s, so a value produced on one PE
//! becomes visible by logical name on another without either knowing the other's internal state.
//! Third, a [Communicator][crate::Communicator] composes the cache with binary-tree broadcast
//! over the world or an arbitrary [Group][crate::Group], and key-scoped lazy synchronization.
//! Finally, the evaluation functions in [dist_eval][crate::dist_eval] spawn one local task per
//! required tile and aggregate per-tile magnitudes into the result array's shape.
//!
//! Tessellar relies on transport providers called Fabrics to move envelopes between PEs.
//! Currently one such fabric exists, wiring N in-process ranks through channels ("channel"),
//! useful for emulating distributed environments on a single node.
//!
//! EXAMPLES
//! --------
//!
//! # Constructing a tessellar world instance
//! ```
//! use tessellar::Backend;
//! fn main() {
//!     let world = tessellar::TessellarWorldBuilder::new()
//!         .with_backend(Default::default()) // the channel fabric is the default backend
//!         .build();
//!     println!("I am pe {:?} of {:?}", world.my_pe(), world.num_pes());
//! }
//! ```
//!
//! # Exchanging a value by key between two PEs
//! ```
//! use tessellar::DistKey;
//!
//! fn main() {
//!     let worlds = tessellar::TessellarWorldBuilder::new().build_cluster(2);
//!     for world in worlds {
//!         std::thread::spawn(move || {
//!             let comm = world.communicator();
//!             let key = DistKey::new(1, 0);
//!             if world.my_pe() == 0 {
//!                 comm.send(1, key, &42usize);
//!             } else {
//!                 assert_eq!(comm.recv::<usize>(key).get(), 42);
//!             }
//!             world.barrier();
//!         });
//!     }
//! }
//! ```

#[macro_use]
extern crate lazy_static;

pub mod env_var;
pub use env_var::config;

mod array;
mod comm;
mod dist_cache;
pub mod dist_eval;
mod fabric;
mod group;
mod lazy_sync;
mod placeholder;
mod pmap;
mod scheduler;
mod shape;
mod tessellar_world;

pub use crate::array::DistArray;
pub use crate::comm::Communicator;
pub use crate::dist_cache::DistKey;
pub use crate::fabric::Backend;
pub use crate::group::{BcastTree, Group, GroupId};
pub use crate::placeholder::Placeholder;
pub use crate::pmap::{Distribution, LocalIndices, MapError, ProcMap};
pub use crate::scheduler::ExecutorType;
pub use crate::shape::{SparsityPolicy, TileShape};
pub use crate::tessellar_world::{TessellarWorld, TessellarWorldBuilder};

use bincode::Options;

/// Marker for payloads that can ride in a distributed exchange.
///
/// This is a blanket impl, any type satisfying the bounds can be cached, sent, broadcast, and
/// stored as a tile.
pub trait Dist:
    serde::ser::Serialize + serde::de::DeserializeOwned + Clone + Send + Sync + 'static
{
}
impl<T: serde::ser::Serialize + serde::de::DeserializeOwned + Clone + Send + Sync + 'static> Dist
    for T
{
}

lazy_static! {
    pub(crate) static ref BINCODE: bincode::config::WithOtherTrailing<bincode::DefaultOptions, bincode::config::AllowTrailing> =
        bincode::DefaultOptions::new().allow_trailing_bytes();
}

pub(crate) fn serialize<T: ?Sized>(obj: &T) -> Result<Vec<u8>, anyhow::Error>
where
    T: serde::Serialize,
{
    Ok(BINCODE.serialize(obj)?)
}

pub(crate) fn deserialize<'a, T>(bytes: &'a [u8]) -> Result<T, anyhow::Error>
where
    T: serde::Deserialize<'a>,
{
    Ok(BINCODE.deserialize(bytes)?)
}

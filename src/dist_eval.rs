//! Sparsity-aware distributed evaluation of elementwise tile operations.
//!
//! Each function spawns one local task per locally required tile of its operand arrays, gated
//! on the operand placeholders through readiness callbacks rather than blocking waits. Dense
//! evaluation returns immediately with the result tiles materializing asynchronously. Sparse
//! evaluation additionally applies a per-tile skip test, aggregates the per-tile magnitudes the
//! kernel reports into a replicated result [TileShape], and only publishes tiles the new shape
//! keeps, so it fences locally before returning.
//!
//! Under [Union][SparsityPolicy::Union] policy a kept tile may have operands whose shape
//! declares it zero, those operands are presented to the kernel as `None` instead of being
//! fetched. The kernel decides what stands in for them, which keeps the identity-element choice
//! with the numeric operation.

use crate::array::DistArray;
use crate::dist_cache::DistKey;
use crate::env_var::config;
use crate::placeholder::Placeholder;
use crate::shape::{SparsityPolicy, TileShape};
use crate::tessellar_world::{TessellarWorld, WorldInner};
use crate::Dist;

use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

fn check_geometry<T: Dist, U: Dist>(left: &DistArray<T>, right: &DistArray<U>) {
    assert!(
        left.num_tiles() == right.num_tiles(),
        "arrays with mismatched tilings: {:?} vs {:?} tiles",
        left.num_tiles(),
        right.num_tiles()
    );
    assert!(
        left.pmap().same_geometry(right.pmap()),
        "arrays with mismatched process maps"
    );
}

fn result_threshold(shapes: &[&TileShape]) -> f32 {
    shapes
        .iter()
        .find_map(|shape| shape.threshold())
        .unwrap_or_else(|| config().zero_threshold)
}

/// Apply `op` to every tile of a dense array, producing a new dense array over the same
/// process map.
///
/// Returns immediately, result tiles are assigned as their tasks complete and are covered by
/// the world's [wait_all][TessellarWorld::wait_all].
pub fn foreach<T, R, Op>(arg: &DistArray<T>, op: Op) -> DistArray<R>
where
    T: Dist,
    R: Dist,
    Op: Fn(&T) -> R + Send + Sync + 'static,
{
    assert!(
        arg.shape().is_dense(),
        "dense evaluation over a sparse array"
    );
    let world = arg.world();
    let result: DistArray<R> =
        DistArray::with_pmap(world, TileShape::dense(arg.num_tiles()), arg.pmap().clone());
    let op = Arc::new(op);
    for index in arg.local_indices() {
        let inner = world.inner.clone();
        let op = op.clone();
        let result = result.clone();
        inner.task_started();
        let spawn_inner = inner.clone();
        arg.find(index).on_ready(move |tile| {
            spawn_inner.scheduler_submit(Box::new(move || {
                result.set(index, op(&tile));
                inner.task_done();
            }));
        });
    }
    result
}

/// Apply a binary `op` tile-wise over two dense arrays sharing one tiling
pub fn foreach_binary<T, U, R, Op>(
    left: &DistArray<T>,
    right: &DistArray<U>,
    op: Op,
) -> DistArray<R>
where
    T: Dist,
    U: Dist,
    R: Dist,
    Op: Fn(&T, &U) -> R + Send + Sync + 'static,
{
    check_geometry(left, right);
    assert!(
        left.shape().is_dense() && right.shape().is_dense(),
        "dense evaluation over a sparse array"
    );
    let world = left.world();
    let result: DistArray<R> = DistArray::with_pmap(
        world,
        TileShape::dense(left.num_tiles()),
        left.pmap().clone(),
    );
    let op = Arc::new(op);
    for index in left.local_indices() {
        let inner = world.inner.clone();
        let op = op.clone();
        let result = result.clone();
        inner.task_started();
        let spawn_inner = inner.clone();
        let right_tile = right.find(index);
        left.find(index).on_ready(move |left_tile| {
            right_tile.on_ready(move |right_tile| {
                spawn_inner.scheduler_submit(Box::new(move || {
                    result.set(index, op(&left_tile, &right_tile));
                    inner.task_done();
                }));
            });
        });
    }
    result
}

/// Modify each tile of a dense array in place.
///
/// When `fence` is true this PE's outstanding activity on the array is fenced first, so no
/// concurrent reader observes a half-updated tile. Only disable the fence if no other task is
/// still reading the data.
pub fn foreach_inplace<T, Op>(arg: &mut DistArray<T>, op: Op, fence: bool)
where
    T: Dist,
    Op: Fn(&T) -> T + Send + Sync + 'static,
{
    if fence {
        arg.world().fence();
    }
    let result = foreach(arg, op);
    *arg = result;
}

/// Apply `op` to every non-zero tile of a sparse array, publishing a freshly computed shape.
///
/// The kernel returns the result tile together with its magnitude. Magnitudes are aggregated
/// into the replicated result shape, and tiles the new shape reports zero are never stored.
/// Blocks until the local tile tasks have completed and the result shape is agreed on.
pub fn sparse_foreach<T, R, Op>(arg: &DistArray<T>, op: Op) -> DistArray<R>
where
    T: Dist,
    R: Dist,
    Op: Fn(&T) -> (R, f32) + Send + Sync + 'static,
{
    let world = arg.world().clone();
    let num_tiles = arg.num_tiles();
    let norms = Arc::new(Mutex::new(vec![0.0f32; num_tiles]));
    let completed = Arc::new(AtomicUsize::new(0));
    let mut pending: Vec<(usize, Placeholder<R>)> = Vec::new();
    let op = Arc::new(op);
    for index in arg.local_indices() {
        if arg.is_zero(index) {
            continue;
        }
        let slot = Placeholder::new();
        pending.push((index, slot.clone()));
        let inner = world.inner.clone();
        let op = op.clone();
        let norms = norms.clone();
        let completed = completed.clone();
        arg.find(index).on_ready(move |tile| {
            inner.scheduler_submit(Box::new(move || {
                let (result_tile, norm) = op(&tile);
                norms.lock()[index] += norm;
                slot.set(result_tile);
                completed.fetch_add(1, Ordering::SeqCst);
            }));
        });
    }
    let threshold = result_threshold(&[arg.shape()]);
    finish_sparse(&world, arg.pmap().clone(), threshold, norms, completed, pending)
}

/// Apply a binary `op` tile-wise over two sparse arrays under the given sparsity policy.
///
/// Under `Intersection` a tile is skipped as soon as either operand reports it zero. Under
/// `Union` a tile is skipped only when both operands report it zero, and a declared-zero
/// operand of a kept tile reaches the kernel as `None` rather than being fetched.
pub fn sparse_foreach_binary<T, U, R, Op>(
    left: &DistArray<T>,
    right: &DistArray<U>,
    op: Op,
    policy: SparsityPolicy,
) -> DistArray<R>
where
    T: Dist,
    U: Dist,
    R: Dist,
    Op: Fn(Option<&T>, Option<&U>) -> (R, f32) + Send + Sync + 'static,
{
    check_geometry(left, right);
    let world = left.world().clone();
    let num_tiles = left.num_tiles();
    let norms = Arc::new(Mutex::new(vec![0.0f32; num_tiles]));
    let completed = Arc::new(AtomicUsize::new(0));
    let mut pending: Vec<(usize, Placeholder<R>)> = Vec::new();
    let op = Arc::new(op);
    for index in left.local_indices() {
        let left_zero = left.is_zero(index);
        let right_zero = right.is_zero(index);
        let skip = match policy {
            SparsityPolicy::Intersection => left_zero || right_zero,
            SparsityPolicy::Union => left_zero && right_zero,
        };
        if skip {
            continue;
        }
        let slot = Placeholder::new();
        pending.push((index, slot.clone()));
        let inner = world.inner.clone();
        let op = op.clone();
        let norms = norms.clone();
        let completed = completed.clone();
        let compute = move |left_tile: Option<T>, right_tile: Option<U>| {
            inner.scheduler_submit(Box::new(move || {
                let (result_tile, norm) = op(left_tile.as_ref(), right_tile.as_ref());
                norms.lock()[index] += norm;
                slot.set(result_tile);
                completed.fetch_add(1, Ordering::SeqCst);
            }));
        };
        match (left_zero, right_zero) {
            (false, false) => {
                let right_tile = right.find(index);
                left.find(index).on_ready(move |left_tile| {
                    right_tile
                        .on_ready(move |right_tile| compute(Some(left_tile), Some(right_tile)));
                });
            }
            (false, true) => {
                left.find(index)
                    .on_ready(move |left_tile| compute(Some(left_tile), None));
            }
            (true, false) => {
                right
                    .find(index)
                    .on_ready(move |right_tile| compute(None, Some(right_tile)));
            }
            (true, true) => unreachable!(),
        }
    }
    let threshold = result_threshold(&[left.shape(), right.shape()]);
    finish_sparse(
        &world,
        left.pmap().clone(),
        threshold,
        norms,
        completed,
        pending,
    )
}

/// Modify each non-zero tile of a sparse array in place, recomputing the array's shape from
/// the magnitudes the kernel reports.
pub fn sparse_foreach_inplace<T, Op>(arg: &mut DistArray<T>, op: Op, fence: bool)
where
    T: Dist,
    Op: Fn(&T) -> (T, f32) + Send + Sync + 'static,
{
    if fence {
        arg.world().fence();
    }
    let result = sparse_foreach(arg, op);
    *arg = result;
}

/// Fence the spawned tile tasks, agree on the result shape world-wide, and publish the tiles
/// the new shape keeps.
fn finish_sparse<R: Dist>(
    world: &TessellarWorld,
    pmap: Arc<crate::pmap::ProcMap>,
    threshold: f32,
    norms: Arc<Mutex<Vec<f32>>>,
    completed: Arc<AtomicUsize>,
    pending: Vec<(usize, Placeholder<R>)>,
) -> DistArray<R> {
    // a local fence with no message cost: every spawned task bumps the counter exactly once
    let spawned = pending.len();
    world.inner.block_until("tile evaluation", || {
        completed.load(Ordering::SeqCst) == spawned
    });
    let local_norms = norms.lock().clone();
    let shape = reduce_shape(world.inner.clone(), local_norms, threshold);
    let result: DistArray<R> = DistArray::with_pmap(world, shape, pmap);
    for (index, slot) in pending {
        if !result.is_zero(index) {
            let tile = slot
                .try_get()
                .expect("tile not assigned after the evaluation fence");
            result.set(index, tile);
        }
        // tiles that reduced to structural zero are dropped, never stored
    }
    result
}

/// Reduce the per-PE norm contributions to PE 0, build the shape there, and tree-broadcast it
/// back so every PE publishes against an identical replica.
fn reduce_shape(inner: Arc<WorldInner>, mut local_norms: Vec<f32>, threshold: f32) -> TileShape {
    if inner.num_pes == 1 {
        return TileShape::from_norms(local_norms, threshold);
    }
    let comm = crate::comm::Communicator::new(inner.clone());
    let tag = inner.alloc_tag();
    // ids under the reduction tag: one per contributing pe, plus one for the shape broadcast
    let shape_id = u64::MAX;
    if inner.my_pe == 0 {
        for pe in 1..inner.num_pes {
            let contribution: Placeholder<Vec<f32>> = comm.recv(DistKey::new(tag, pe as u64));
            let ready = contribution.clone();
            inner.block_until("norm contributions", || ready.probe());
            let contribution = contribution.try_get().unwrap();
            for (norm, remote) in local_norms.iter_mut().zip(contribution) {
                *norm += remote;
            }
        }
        let shape = TileShape::from_norms(local_norms, threshold);
        let slot = Placeholder::ready(shape.clone());
        comm.bcast(DistKey::new(tag, shape_id), &slot, 0);
        shape
    } else {
        comm.send(0, DistKey::new(tag, inner.my_pe as u64), &local_norms);
        let slot: Placeholder<TileShape> = Placeholder::new();
        comm.bcast(DistKey::new(tag, shape_id), &slot, 0);
        let ready = slot.clone();
        inner.block_until("result shape broadcast", || ready.probe());
        slot.try_get().unwrap()
    }
}

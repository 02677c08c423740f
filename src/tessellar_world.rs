use crate::comm::Communicator;
use crate::dist_cache::{DistCache, DistKey};
use crate::env_var::config;
use crate::fabric::{create_fabric_cluster, Backend, Fabric, FabricComm};
use crate::group::{Group, GroupRegistry};
use crate::lazy_sync::SyncRegistry;
use crate::placeholder::Placeholder;
use crate::scheduler::{create_scheduler, ExecutorType, Scheduler, SchedulerQueue, Task};

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, warn};

// the barrier owns tag 0, everything else allocates from the world's tag counter
const TAG_BARRIER: u64 = 0;
const FIRST_FREE_TAG: u64 = 1;

/// A function serving remote fetch requests for one registered array: (communicator, tile
/// index, requesting pe)
pub(crate) type ArrayFetchFn = Arc<dyn Fn(&Communicator, usize, usize) + Send + Sync>;

/// The per-PE runtime state: scheduler, fabric endpoint, and the tables correlating
/// asynchronous deliveries (cache, sync instances, group and array registries).
///
/// This is the "global mutable per-process state" of the runtime, scoped to the world object
/// instead of a language-level global: created at world startup, torn down at shutdown.
pub(crate) struct WorldInner {
    pub(crate) my_pe: usize,
    pub(crate) num_pes: usize,
    pub(crate) scheduler: Scheduler,
    pub(crate) fabric: Arc<Fabric>,
    pub(crate) cache: DistCache,
    pub(crate) syncs: SyncRegistry,
    pub(crate) groups: GroupRegistry,
    pub(crate) world_group: Arc<Group>,
    arrays: Mutex<HashMap<u64, Placeholder<ArrayFetchFn>>>,
    next_tag: AtomicU64,
    barrier_epoch: AtomicU64,
    outstanding: Arc<AtomicUsize>,
}

impl WorldInner {
    /// Submit a tracked task, visible to [wait_all][WorldInner::wait_all]
    pub(crate) fn spawn_task(&self, task: Task) {
        self.task_started();
        let outstanding = self.outstanding.clone();
        self.scheduler.submit_task(Box::new(move || {
            task();
            outstanding.fetch_sub(1, Ordering::SeqCst);
        }));
    }

    /// Submit an untracked task, for callers that account for completion themselves
    pub(crate) fn scheduler_submit(&self, task: Task) {
        self.scheduler.submit_task(task);
    }

    pub(crate) fn task_started(&self) {
        self.outstanding.fetch_add(1, Ordering::SeqCst);
    }

    pub(crate) fn task_done(&self) {
        self.outstanding.fetch_sub(1, Ordering::SeqCst);
    }

    /// Allocate a fresh exchange tag. All PEs allocate in the same SPMD order, so the tags of a
    /// collectively constructed object agree across the world without communication.
    pub(crate) fn alloc_tag(&self) -> u64 {
        self.next_tag.fetch_add(1, Ordering::SeqCst)
    }

    pub(crate) fn register_array(&self, tag: u64, serve: ArrayFetchFn) {
        let slot = self
            .arrays
            .lock()
            .entry(tag)
            .or_insert_with(Placeholder::new)
            .clone();
        assert!(!slot.probe(), "array tag {:?} registered more than once", tag);
        slot.set(serve);
    }

    /// The fetch handler registered (now or later) under `tag`. A request racing ahead of the
    /// owner's SPMD construction of the array defers here instead of failing.
    pub(crate) fn lookup_array(&self, tag: u64) -> Placeholder<ArrayFetchFn> {
        self.arrays
            .lock()
            .entry(tag)
            .or_insert_with(Placeholder::new)
            .clone()
    }

    pub(crate) fn deregister_array(&self, tag: u64) {
        self.arrays.lock().remove(&tag);
    }

    /// Help execute queued tasks on the calling thread until `cond` holds, printing a potential
    /// deadlock warning if it does not hold within the configured timeout.
    pub(crate) fn block_until<F>(&self, what: &str, cond: F)
    where
        F: Fn() -> bool,
    {
        let mut timer = Instant::now();
        while !cond() {
            self.scheduler.exec_task();
            if timer.elapsed().as_secs_f64() > config().deadlock_warning_timeout {
                println!(
                    "[{:?}] [TESSELLAR WARNING] Potential deadlock detected.\n\
                    Waiting for {} has not completed for {} seconds.\n\
                    Collective operations require all PEs associated with the distributed object to enter the call, \
                    and exchange keys that are never satisfied block dependents indefinitely.\n\
                    The deadlock timeout can be set via the TESSELLAR_DEADLOCK_WARNING_TIMEOUT environment variable",
                    self.my_pe,
                    what,
                    config().deadlock_warning_timeout,
                );
                timer = Instant::now();
            }
            std::thread::yield_now();
        }
    }

    /// Block until all tasks spawned on this PE have completed. Purely local, no message cost.
    pub(crate) fn wait_all(&self) {
        self.block_until("outstanding local tasks", || {
            self.outstanding.load(Ordering::SeqCst) == 0
        });
    }

    fn destroy(&self) {
        debug!("pe {:?} tearing down world", self.my_pe);
        self.fabric.shutdown();
        self.scheduler.shutdown();
        if self.cache.len() > 0 || self.syncs.len() > 0 {
            warn!(
                "pe {:?} torn down with {:?} unconsumed cache entries and {:?} pending syncs",
                self.my_pe,
                self.cache.len(),
                self.syncs.len()
            );
        }
        self.arrays.lock().clear();
    }
}

/// A blocking barrier over the whole world, implemented as a lazy sync on a reserved tag.
///
/// Each barrier instance is keyed by a generation counter, which stays consistent across PEs
/// because barriers are collective.
pub(crate) fn world_barrier(inner: &Arc<WorldInner>) {
    let epoch = inner.barrier_epoch.fetch_add(1, Ordering::SeqCst);
    let key = DistKey::new(TAG_BARRIER, epoch);
    let done = Arc::new(AtomicBool::new(false));
    let done2 = done.clone();
    Communicator::new(inner.clone()).lazy_sync(key, move || {
        done2.store(true, Ordering::SeqCst);
    });
    inner.block_until("barrier", || done.load(Ordering::SeqCst));
}

/// An abstraction representing all the PEs (processing elements) within a given distributed
/// execution.
///
/// Constructing a TessellarWorld is necessary to perform any remote operations or distributed
/// communications. A world hands out the [Communicator][crate::Communicator] for key-addressed
/// exchange, spawns local tasks, and provides the whole-world synchronization primitives
/// ([barrier][TessellarWorld::barrier], [wait_all][TessellarWorld::wait_all]) that
/// [DistArray][crate::DistArray]s and the evaluation functions build on.
pub struct TessellarWorld {
    pub(crate) inner: Arc<WorldInner>,
    ref_cnt: Arc<AtomicUsize>,
}

impl std::fmt::Debug for TessellarWorld {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "TessellarWorld {{ my_pe: {:?}, num_pes: {:?} }}",
            self.inner.my_pe, self.inner.num_pes
        )
    }
}

impl TessellarWorld {
    /// Returns the id of this PE (roughly equivalent to MPI Rank)
    pub fn my_pe(&self) -> usize {
        self.inner.my_pe
    }

    /// Returns number of PEs in this execution
    pub fn num_pes(&self) -> usize {
        self.inner.num_pes
    }

    /// The communicator used to exchange values, broadcast, and lazily synchronize by key
    pub fn communicator(&self) -> Communicator {
        Communicator::new(self.inner.clone())
    }

    /// The group containing every PE of the world, in rank order
    pub fn world_group(&self) -> Arc<Group> {
        self.inner.world_group.clone()
    }

    /// Construct and register a group from an ordered list of world ranks.
    ///
    /// Every PE of the world must create the group (with identical membership, in the same SPMD
    /// order) before group-scoped collectives that reach it can resolve locally.
    pub fn create_group(&self, members: Vec<usize>) -> Arc<Group> {
        for member in &members {
            assert!(*member < self.num_pes(), "invalid pe: {:?}", member);
        }
        let group = Arc::new(Group::new(members));
        self.inner.groups.register(group.clone());
        group
    }

    /// Spawn a task on this PE's work queues, tracked by [wait_all][TessellarWorld::wait_all]
    pub fn spawn<F>(&self, task: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.inner.spawn_task(Box::new(task));
    }

    /// Block until all tasks spawned on this PE have completed
    pub fn wait_all(&self) {
        self.inner.wait_all();
    }

    /// Fence this PE's outstanding asynchronous activity. Local, no message cost.
    pub fn fence(&self) {
        self.inner.wait_all();
    }

    /// Block until every PE of the world has entered the barrier
    pub fn barrier(&self) {
        world_barrier(&self.inner);
    }
}

impl Clone for TessellarWorld {
    fn clone(&self) -> Self {
        self.ref_cnt.fetch_add(1, Ordering::SeqCst);
        TessellarWorld {
            inner: self.inner.clone(),
            ref_cnt: self.ref_cnt.clone(),
        }
    }
}

impl Drop for TessellarWorld {
    fn drop(&mut self) {
        let cnt = self.ref_cnt.fetch_sub(1, Ordering::SeqCst);
        if cnt == 1 {
            // quiesce collectively before tearing down local state
            self.inner.wait_all();
            world_barrier(&self.inner);
            self.inner.destroy();
        }
    }
}

/// An implementation of the Builder design pattern, used to construct an instance of a
/// TessellarWorld.
///
/// Allows for customizing the way the world is built. Currently this includes being able to
/// specify the fabric [Backend][crate::Backend] and workpool scheduler type.
///
/// # Examples
///
///```
/// use tessellar::{TessellarWorldBuilder, Backend, ExecutorType};
///
/// let world = TessellarWorldBuilder::new()
///     .with_backend(Backend::Channel)
///     .with_executor(ExecutorType::WorkStealing)
///     .build();
///```
#[derive(Debug)]
pub struct TessellarWorldBuilder {
    backend: Backend,
    executor: ExecutorType,
    threads: usize,
}

impl TessellarWorldBuilder {
    /// Construct a new tessellar world builder
    pub fn new() -> TessellarWorldBuilder {
        TessellarWorldBuilder {
            backend: Default::default(),
            executor: Default::default(),
            threads: config().threads,
        }
    }

    /// Specify the fabric backend to use for this execution
    pub fn with_backend(mut self, backend: Backend) -> TessellarWorldBuilder {
        self.backend = backend;
        self
    }

    /// Specify the scheduler to use for this execution
    pub fn with_executor(mut self, executor: ExecutorType) -> TessellarWorldBuilder {
        self.executor = executor;
        self
    }

    /// Specify the number of worker threads per PE, overriding TESSELLAR_THREADS
    pub fn with_threads(mut self, threads: usize) -> TessellarWorldBuilder {
        self.threads = threads;
        self
    }

    /// Instantiate a single-PE TessellarWorld object
    pub fn build(self) -> TessellarWorld {
        self.build_cluster(1).pop().unwrap()
    }

    /// Instantiate the `num_pes` connected single-process PEs of a job.
    ///
    /// Each returned world is one rank of the job and is typically driven by its own thread.
    pub fn build_cluster(self, num_pes: usize) -> Vec<TessellarWorld> {
        debug!(
            "building {:?} pe cluster, backend {:?}, executor {:?}",
            num_pes, self.backend, self.executor
        );
        let fabrics = create_fabric_cluster(self.backend, num_pes);
        fabrics
            .into_iter()
            .map(|fabric| {
                let status = Arc::new(AtomicU8::new(0));
                let panic = Arc::new(AtomicU8::new(0));
                let scheduler =
                    create_scheduler(self.executor, self.threads, status, panic);
                let my_pe = fabric.my_pe();
                let backend = fabric.backend();
                let world_group = Arc::new(Group::new((0..num_pes).collect()));
                let inner = Arc::new(WorldInner {
                    my_pe: my_pe,
                    num_pes: num_pes,
                    scheduler: scheduler,
                    fabric: Arc::new(fabric),
                    cache: DistCache::new(),
                    syncs: SyncRegistry::new(),
                    groups: GroupRegistry::new(),
                    world_group: world_group.clone(),
                    arrays: Mutex::new(HashMap::new()),
                    next_tag: AtomicU64::new(FIRST_FREE_TAG),
                    barrier_epoch: AtomicU64::new(0),
                    outstanding: Arc::new(AtomicUsize::new(0)),
                });
                inner.groups.register(world_group);
                inner.fabric.start(Arc::downgrade(&inner));
                debug!(
                    "pe {:?} of {:?} world ready over the {:?} fabric",
                    my_pe, num_pes, backend
                );
                TessellarWorld {
                    inner: inner,
                    ref_cnt: Arc::new(AtomicUsize::new(1)),
                }
            })
            .collect()
    }
}

impl Default for TessellarWorldBuilder {
    fn default() -> Self {
        TessellarWorldBuilder::new()
    }
}

use enum_dispatch::enum_dispatch;
use std::sync::atomic::AtomicU8;
use std::sync::Arc;

pub(crate) mod work_stealing;
use work_stealing::WorkStealing;

/// A non-preemptive unit of work, run exactly once on some worker thread of the owning PE
pub(crate) type Task = Box<dyn FnOnce() + Send>;

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[repr(u8)]
pub(crate) enum SchedulerStatus {
    Active = 0,
    Finished = 1,
}

/// The available worker thread scheduling algorithms
#[derive(Debug, Clone, Copy)]
pub enum ExecutorType {
    WorkStealing,
}

impl Default for ExecutorType {
    fn default() -> Self {
        match crate::config().executor.as_str() {
            "work_stealing" => ExecutorType::WorkStealing,
            other => panic!("unknown executor '{}'", other),
        }
    }
}

#[enum_dispatch(SchedulerQueue)]
#[derive(Debug)]
pub(crate) enum Scheduler {
    WorkStealing,
}

#[enum_dispatch]
pub(crate) trait SchedulerQueue {
    /// Submit a task to the shared work queue
    fn submit_task(&self, task: Task);
    /// Submit a task ahead of the normal work queue (the runtime's priority flag, used for
    /// incoming-message handlers and broadcast forwarding)
    fn submit_immediate_task(&self, task: Task);
    /// Execute at most one queued task on the calling thread, so blocked callers can help
    /// drain the queues instead of spinning
    fn exec_task(&self);
    /// Mark the pool finished and help drain until all workers have exited
    fn shutdown(&self);
    fn active(&self) -> bool;
    fn num_workers(&self) -> usize;
}

pub(crate) fn create_scheduler(
    executor: ExecutorType,
    num_workers: usize,
    status: Arc<AtomicU8>,
    panic: Arc<AtomicU8>,
) -> Scheduler {
    match executor {
        ExecutorType::WorkStealing => {
            Scheduler::WorkStealing(WorkStealing::new(num_workers, status, panic))
        }
    }
}

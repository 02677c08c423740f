use crate::env_var::config;
use crate::scheduler::{SchedulerQueue, SchedulerStatus, Task};

use core_affinity::CoreId;
use crossbeam::deque::Worker;
use rand::prelude::*;
use std::panic;
use std::process;
use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use tracing::{debug, trace};

struct WorkStealingThread {
    imm_inj: Arc<crossbeam::deque::Injector<Task>>,
    work_inj: Arc<crossbeam::deque::Injector<Task>>,
    work_stealers: Vec<crossbeam::deque::Stealer<Task>>,
    work_q: Worker<Task>,
    work_flag: Arc<AtomicU8>,
    status: Arc<AtomicU8>,
    panic: Arc<AtomicU8>,
}

impl WorkStealingThread {
    fn run(
        worker: WorkStealingThread,
        active_cnt: Arc<AtomicUsize>,
        ids: Arc<Vec<CoreId>>,
        tid: usize,
    ) -> thread::JoinHandle<()> {
        let builder = thread::Builder::new().name("worker_thread".into());
        builder
            .spawn(move || {
                let id = ids[tid % ids.len()];
                trace!(
                    "WorkStealing worker thread running {:?} core: {:?}",
                    std::thread::current().id(),
                    id
                );
                core_affinity::set_for_current(id);
                active_cnt.fetch_add(1, Ordering::SeqCst);
                let mut rng = rand::thread_rng();
                let t = rand::distributions::Uniform::from(0..worker.work_stealers.len());
                while worker.panic.load(Ordering::SeqCst) == 0
                    && (worker.status.load(Ordering::SeqCst) == SchedulerStatus::Active as u8
                        || !(worker.work_q.is_empty()
                            && worker.work_inj.is_empty()
                            && worker.imm_inj.is_empty()))
                {
                    let omsg = if !worker.imm_inj.is_empty() {
                        worker.imm_inj.steal().success()
                    } else {
                        worker.work_q.pop().or_else(|| {
                            if worker
                                .work_flag
                                .compare_exchange(0, 1, Ordering::SeqCst, Ordering::Relaxed)
                                == Ok(0)
                            {
                                let ret = worker
                                    .work_inj
                                    .steal_batch_and_pop(&worker.work_q)
                                    .success();
                                worker.work_flag.store(0, Ordering::SeqCst);
                                ret
                            } else {
                                worker.work_stealers[t.sample(&mut rng)].steal().success()
                            }
                        })
                    };
                    if let Some(task) = omsg {
                        task();
                    }
                    std::thread::yield_now();
                }
                active_cnt.fetch_sub(1, Ordering::SeqCst);
                // println!("WorkStealing worker thread shutting down");
            })
            .unwrap()
    }
}

pub(crate) struct WorkStealing {
    num_threads: usize,
    threads: Vec<thread::JoinHandle<()>>,
    imm_inj: Arc<crossbeam::deque::Injector<Task>>,
    work_inj: Arc<crossbeam::deque::Injector<Task>>,
    work_stealers: Vec<crossbeam::deque::Stealer<Task>>,
    work_flag: Arc<AtomicU8>,
    status: Arc<AtomicU8>,
    active_cnt: Arc<AtomicUsize>,
    panic: Arc<AtomicU8>,
}

impl std::fmt::Debug for WorkStealing {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "WorkStealing {{ num_threads: {:?}, active: {:?} }}",
            self.num_threads,
            self.active_cnt.load(Ordering::SeqCst)
        )
    }
}

impl SchedulerQueue for WorkStealing {
    fn submit_task(&self, task: Task) {
        self.work_inj.push(task);
    }

    fn submit_immediate_task(&self, task: Task) {
        self.imm_inj.push(task);
    }

    fn exec_task(&self) {
        let mut rng = rand::thread_rng();
        let t = rand::distributions::Uniform::from(0..self.work_stealers.len());
        let ret = if !self.imm_inj.is_empty() {
            self.imm_inj.steal().success()
        } else if self
            .work_flag
            .compare_exchange(0, 1, Ordering::SeqCst, Ordering::Relaxed)
            == Ok(0)
        {
            let ret = self.work_inj.steal().success();
            self.work_flag.store(0, Ordering::SeqCst);
            ret
        } else {
            self.work_stealers[t.sample(&mut rng)].steal().success()
        };
        if let Some(task) = ret {
            task();
        }
    }

    fn shutdown(&self) {
        debug!("work stealing shutting down");
        self.status
            .store(SchedulerStatus::Finished as u8, Ordering::SeqCst);
        let mut timer = std::time::Instant::now();
        while self.panic.load(Ordering::SeqCst) == 0 && self.active_cnt.load(Ordering::Relaxed) > 0
        {
            // help drain whatever the workers have not picked up yet
            self.exec_task();
            if timer.elapsed().as_secs_f64() > config().deadlock_warning_timeout {
                println!(
                    "[TESSELLAR WARNING] shutdown stalled, work inj size {:?} imm inj size {:?}",
                    self.work_inj.len(),
                    self.imm_inj.len()
                );
                timer = std::time::Instant::now();
            }
            std::thread::yield_now();
        }
        debug!("work stealing shut down");
    }

    fn active(&self) -> bool {
        self.status.load(Ordering::SeqCst) == SchedulerStatus::Active as u8
    }

    fn num_workers(&self) -> usize {
        self.num_threads
    }
}

impl WorkStealing {
    pub(crate) fn new(
        num_workers: usize,
        status: Arc<AtomicU8>,
        panic: Arc<AtomicU8>,
    ) -> WorkStealing {
        let mut ws = WorkStealing {
            num_threads: std::cmp::max(1, num_workers),
            threads: Vec::new(),
            imm_inj: Arc::new(crossbeam::deque::Injector::new()),
            work_inj: Arc::new(crossbeam::deque::Injector::new()),
            work_stealers: Vec::new(),
            work_flag: Arc::new(AtomicU8::new(0)),
            status: status,
            active_cnt: Arc::new(AtomicUsize::new(0)),
            panic: panic,
        };
        ws.init();
        ws
    }

    fn init(&mut self) {
        let mut work_workers: Vec<Worker<Task>> = vec![];
        for _i in 0..self.num_threads {
            let work_worker: Worker<Task> = Worker::new_fifo();
            self.work_stealers.push(work_worker.stealer());
            work_workers.push(work_worker);
        }

        let orig_hook = panic::take_hook();
        panic::set_hook(Box::new(move |panic_info| {
            // a panic anywhere in the runtime is fatal for the whole process
            orig_hook(panic_info);
            process::exit(1);
        }));

        let core_ids = Arc::new(match core_affinity::get_core_ids() {
            Some(core_ids) => core_ids,
            None => {
                vec![core_affinity::CoreId { id: 0 }]
            }
        });
        for tid in 0..self.num_threads {
            let work_worker = work_workers.pop().unwrap();
            let worker = WorkStealingThread {
                imm_inj: self.imm_inj.clone(),
                work_inj: self.work_inj.clone(),
                work_stealers: self.work_stealers.clone(),
                work_q: work_worker,
                work_flag: self.work_flag.clone(),
                status: self.status.clone(),
                panic: self.panic.clone(),
            };
            self.threads.push(WorkStealingThread::run(
                worker,
                self.active_cnt.clone(),
                core_ids.clone(),
                tid,
            ));
        }
        while self.active_cnt.load(Ordering::SeqCst) != self.threads.len() {
            std::thread::yield_now();
        }
    }
}

impl Drop for WorkStealing {
    fn drop(&mut self) {
        while let Some(thread) = self.threads.pop() {
            if thread.thread().id() != std::thread::current().id() {
                let _res = thread.join();
            }
        }
        // println!("WorkStealing scheduler dropped");
    }
}

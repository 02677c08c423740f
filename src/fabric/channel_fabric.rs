use crate::comm;
use crate::fabric::{Backend, FabricComm};
use crate::scheduler::SchedulerQueue;
use crate::tessellar_world::WorldInner;

use crossbeam::channel::{unbounded, Receiver, Sender};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Weak;
use std::thread;
use tracing::{debug, trace, warn};

// every cluster gets a fresh job id so independent clusters never share state
static NEXT_JOB_ID: AtomicU64 = AtomicU64::new(0);

enum WireMsg {
    Op { src: usize, data: Vec<u8> },
    Shutdown,
}

/// An in-process fabric wiring the N ranks of a job through channels.
///
/// Each rank owns one receiving channel endpoint and a sender to every rank of the job,
/// giving reliable, in-order delivery per sender/receiver pair. One receiver thread per rank
/// decodes incoming envelopes and submits the handler as a high-priority task to that rank's
/// scheduler.
pub(crate) struct ChannelFabric {
    my_pe: usize,
    num_pes: usize,
    job: u64,
    txs: Vec<Sender<WireMsg>>,
    rx: Mutex<Option<Receiver<WireMsg>>>,
    receiver: Mutex<Option<thread::JoinHandle<()>>>,
}

impl ChannelFabric {
    /// Construct the `num_pes` connected endpoints of a fresh job
    pub(crate) fn cluster(num_pes: usize) -> Vec<ChannelFabric> {
        assert!(num_pes > 0);
        let job = NEXT_JOB_ID.fetch_add(1, Ordering::SeqCst);
        let mut txs = Vec::with_capacity(num_pes);
        let mut rxs = Vec::with_capacity(num_pes);
        for _pe in 0..num_pes {
            let (tx, rx) = unbounded();
            txs.push(tx);
            rxs.push(rx);
        }
        rxs.into_iter()
            .enumerate()
            .map(|(pe, rx)| ChannelFabric {
                my_pe: pe,
                num_pes: num_pes,
                job: job,
                txs: txs.clone(),
                rx: Mutex::new(Some(rx)),
                receiver: Mutex::new(None),
            })
            .collect()
    }
}

impl FabricComm for ChannelFabric {
    fn my_pe(&self) -> usize {
        self.my_pe
    }

    fn num_pes(&self) -> usize {
        self.num_pes
    }

    fn send(&self, dest: usize, data: Vec<u8>) {
        assert!(dest < self.num_pes, "invalid pe: {:?}", dest);
        trace!(
            "job {:?} pe {:?} sending {:?} bytes to pe {:?}",
            self.job,
            self.my_pe,
            data.len(),
            dest
        );
        self.txs[dest]
            .send(WireMsg::Op {
                src: self.my_pe,
                data: data,
            })
            .expect("envelope sent to a shut down pe");
    }

    fn start(&self, world: Weak<WorldInner>) {
        let rx = self
            .rx
            .lock()
            .take()
            .expect("channel fabric started more than once");
        let my_pe = self.my_pe;
        let job = self.job;
        let builder = thread::Builder::new().name("fabric_recv".into());
        let handle = builder
            .spawn(move || {
                debug!("job {:?} pe {:?} receiver thread running", job, my_pe);
                for msg in rx.iter() {
                    match msg {
                        WireMsg::Op { src, data } => {
                            let world = match world.upgrade() {
                                Some(world) => world,
                                None => {
                                    warn!(
                                        "job {:?} pe {:?} dropping envelope from {:?}, world torn down",
                                        job, my_pe, src
                                    );
                                    break;
                                }
                            };
                            let op = crate::deserialize(&data)
                                .expect("malformed envelope on channel fabric");
                            let handler_world = world.clone();
                            world.scheduler.submit_immediate_task(Box::new(move || {
                                comm::handle_remote_op(&handler_world, src, op);
                            }));
                        }
                        WireMsg::Shutdown => break,
                    }
                }
                debug!("job {:?} pe {:?} receiver thread exiting", job, my_pe);
            })
            .unwrap();
        *self.receiver.lock() = Some(handle);
    }

    fn shutdown(&self) {
        // the sentinel drains behind anything already queued for this pe
        let _ = self.txs[self.my_pe].send(WireMsg::Shutdown);
        if let Some(handle) = self.receiver.lock().take() {
            let _res = handle.join();
        }
    }

    fn backend(&self) -> Backend {
        Backend::Channel
    }
}

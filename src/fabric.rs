use crate::tessellar_world::WorldInner;

use enum_dispatch::enum_dispatch;
use std::sync::Weak;

pub(crate) mod channel_fabric;
use channel_fabric::ChannelFabric;

/// The list of available fabric backends, used to specify how envelopes are transfered
/// between PEs
#[derive(
    serde::Serialize, serde::Deserialize, Debug, PartialEq, Eq, Ord, PartialOrd, Hash, Clone, Copy,
)]
pub enum Backend {
    /// The Channel backend -- multi pe single process execution, emulating a distributed
    /// environment through in-process channels
    Channel,
}

impl Default for Backend {
    fn default() -> Self {
        match crate::config().backend.as_str() {
            "channel" => Backend::Channel,
            other => panic!("unknown fabric backend '{}'", other),
        }
    }
}

#[enum_dispatch(FabricComm)]
pub(crate) enum Fabric {
    Channel(ChannelFabric),
}

#[enum_dispatch]
pub(crate) trait FabricComm {
    fn my_pe(&self) -> usize;
    fn num_pes(&self) -> usize;
    /// Deliver an encoded envelope to `dest`. Delivery is reliable and in order per
    /// sender/receiver pair.
    fn send(&self, dest: usize, data: Vec<u8>);
    /// Spawn the receiver thread feeding this PE's scheduler with incoming handler tasks
    fn start(&self, world: Weak<WorldInner>);
    /// Stop the receiver thread. Envelopes already queued locally are still handed to the
    /// scheduler first.
    fn shutdown(&self);
    fn backend(&self) -> Backend;
}

/// Construct the connected fabric endpoints of an `num_pes`-rank job
pub(crate) fn create_fabric_cluster(backend: Backend, num_pes: usize) -> Vec<Fabric> {
    match backend {
        Backend::Channel => ChannelFabric::cluster(num_pes)
            .into_iter()
            .map(Fabric::Channel)
            .collect(),
    }
}

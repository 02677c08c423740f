use std::sync::Arc;

use tessellar::{Backend, TessellarWorld, TessellarWorldBuilder};

pub fn init() {
    let _ = tracing_subscriber::fmt::try_init();
}

/// Build an `num_pes`-rank channel cluster and drive each rank's world from its own thread.
///
/// Worker pools are kept small since every rank of the job shares one test process.
#[allow(dead_code)]
pub fn run_cluster<F>(num_pes: usize, f: F)
where
    F: Fn(TessellarWorld) + Send + Sync + 'static,
{
    init();
    let worlds = TessellarWorldBuilder::new()
        .with_backend(Backend::Channel)
        .with_threads(2)
        .build_cluster(num_pes);
    let f = Arc::new(f);
    let mut ranks = Vec::new();
    for world in worlds {
        let f = f.clone();
        let builder = std::thread::Builder::new().name(format!("pe{}", world.my_pe()));
        ranks.push(builder.spawn(move || f(world)).unwrap());
    }
    for rank in ranks {
        rank.join().expect("rank thread panicked");
    }
}

mod common;

use serial_test::serial;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tessellar::{Backend, DistKey, TessellarWorldBuilder};

/// Every member registers an action under one key, the action must fire exactly once per
/// member and only after all `num_pes` members have arrived.
fn sync_fires_once_after_all(num_pes: usize) {
    common::init();
    let worlds = TessellarWorldBuilder::new()
        .with_backend(Backend::Channel)
        .with_threads(2)
        .build_cluster(num_pes);
    let arrived = Arc::new(AtomicUsize::new(0));
    let fired = Arc::new(AtomicUsize::new(0));
    let mut ranks = Vec::new();
    for world in worlds {
        let arrived = arrived.clone();
        let fired = fired.clone();
        ranks.push(std::thread::spawn(move || {
            let comm = world.communicator();
            // stagger the arrivals so late members are genuinely late
            std::thread::sleep(Duration::from_millis(world.my_pe() as u64 * 7));
            arrived.fetch_add(1, Ordering::SeqCst);
            let expected = world.num_pes();
            let done = Arc::new(AtomicBool::new(false));
            let done2 = done.clone();
            comm.lazy_sync(DistKey::new(60, 0), move || {
                assert_eq!(
                    arrived.load(Ordering::SeqCst),
                    expected,
                    "action fired before every member arrived"
                );
                fired.fetch_add(1, Ordering::SeqCst);
                done2.store(true, Ordering::SeqCst);
            });
            while !done.load(Ordering::SeqCst) {
                std::thread::yield_now();
            }
            world.barrier();
        }));
    }
    for rank in ranks {
        rank.join().expect("rank thread panicked");
    }
    assert_eq!(fired.load(Ordering::SeqCst), num_pes);
}

#[test]
#[serial]
fn lazy_sync_one_member() {
    sync_fires_once_after_all(1);
}

#[test]
#[serial]
fn lazy_sync_two_members() {
    sync_fires_once_after_all(2);
}

#[test]
#[serial]
fn lazy_sync_five_members() {
    sync_fires_once_after_all(5);
}

#[test]
#[serial]
fn lazy_sync_key_reuse_after_firing() {
    common::run_cluster(2, |world| {
        let comm = world.communicator();
        for round in 0..3 {
            let done = Arc::new(AtomicBool::new(false));
            let done2 = done.clone();
            comm.lazy_sync(DistKey::new(61, 0), move || {
                done2.store(true, Ordering::SeqCst);
            });
            while !done.load(Ordering::SeqCst) {
                std::thread::yield_now();
            }
            // the instance was discarded, the same key is free for the next round
            world.barrier();
            let _ = round;
        }
    });
}

#[test]
#[serial]
fn lazy_sync_scoped_to_a_subgroup() {
    common::run_cluster(3, |world| {
        let comm = world.communicator();
        let group = world.create_group(vec![0, 2]);
        if group.contains(world.my_pe()) {
            let done = Arc::new(AtomicBool::new(false));
            let done2 = done.clone();
            comm.lazy_sync_group(
                DistKey::new(62, 0),
                move || {
                    done2.store(true, Ordering::SeqCst);
                },
                &group,
            );
            while !done.load(Ordering::SeqCst) {
                std::thread::yield_now();
            }
        }
        // pe 1 never participates and the sync still completes
        world.barrier();
    });
}

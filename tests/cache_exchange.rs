mod common;

use serial_test::serial;
use std::time::Duration;
use tessellar::{DistArray, DistKey, Distribution, Placeholder, TileShape};

#[test]
#[serial]
fn recv_after_send_resolves_immediately() {
    common::run_cluster(2, |world| {
        let comm = world.communicator();
        // a self send satisfies the local cache entry directly, no message involved
        let key = DistKey::new(10, world.my_pe() as u64);
        comm.send(world.my_pe(), key, &(world.my_pe() * 3));
        let slot = comm.recv::<usize>(key);
        assert!(slot.probe(), "value sent before recv must resolve immediately");
        assert_eq!(slot.get(), world.my_pe() * 3);
        world.barrier();
    });
}

#[test]
#[serial]
fn recv_before_send_resolves_on_delivery() {
    common::run_cluster(2, |world| {
        let comm = world.communicator();
        let key = DistKey::new(11, 0);
        if world.my_pe() == 0 {
            let slot = comm.recv::<String>(key);
            assert!(!slot.probe());
            assert_eq!(slot.get(), "tile payload");
        } else {
            std::thread::sleep(Duration::from_millis(20));
            comm.send(0, key, &"tile payload".to_string());
        }
        world.barrier();
    });
}

#[test]
#[serial]
fn send_when_ready_defers_until_assignment() {
    common::run_cluster(2, |world| {
        let comm = world.communicator();
        let key = DistKey::new(12, 0);
        if world.my_pe() == 0 {
            let value: Placeholder<Vec<u32>> = Placeholder::new();
            comm.send_when_ready(1, key, &value);
            // nothing has been sent yet, the callback fires on assignment
            std::thread::sleep(Duration::from_millis(20));
            value.set(vec![5, 6, 7]);
        } else {
            assert_eq!(comm.recv::<Vec<u32>>(key).get(), vec![5, 6, 7]);
        }
        world.barrier();
    });
}

#[test]
#[serial]
fn remote_find_fetches_the_owner_tile() {
    common::run_cluster(2, |world| {
        let array: DistArray<Vec<f64>> =
            DistArray::new(&world, 4, TileShape::dense(4), Distribution::Block);
        for index in array.local_indices() {
            array.set(index, vec![index as f64; 3]);
        }
        // tiles 0,1 live on pe 0 and tiles 2,3 on pe 1
        let probe_index = if world.my_pe() == 0 { 3 } else { 0 };
        assert!(!array.is_local(probe_index));
        let tile = array.find(probe_index).get();
        assert_eq!(tile, vec![probe_index as f64; 3]);
        // repeated finds share the fetched copy
        assert!(array.find(probe_index).probe());
        world.barrier();
    });
}

#[test]
#[serial]
fn fetch_of_a_not_yet_assigned_tile_replies_on_set() {
    common::run_cluster(2, |world| {
        let array: DistArray<u64> =
            DistArray::new(&world, 2, TileShape::dense(2), Distribution::Block);
        if world.my_pe() == 0 {
            // ask for pe 1's tile before pe 1 has assigned it
            let slot = array.find(1);
            assert_eq!(slot.get(), 99);
        } else {
            std::thread::sleep(Duration::from_millis(20));
            array.set(1, 99);
        }
        world.barrier();
    });
}

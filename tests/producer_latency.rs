mod common;

use std::collections::BTreeSet;
use std::thread;
use std::time::{Duration, Instant};

use kyrocommit::{Field, FlagChanges, IdChanges};

use common::{id, World};

#[test]
fn producers_do_not_wait_for_a_slow_store() {
    let world = World::with_defaults();
    let slow = world.cache.create(id(1, 1)).unwrap();
    let busy = world.cache.create(id(1, 2)).unwrap();
    world.manager.flush().unwrap();

    let (entered_tx, entered_rx) = crossbeam_channel::bounded(16);
    world.store.stall_commits(Duration::from_millis(500), entered_tx);
    slow.set_field(&Field::new("name"), "sluggish").unwrap();
    world.manager.start().unwrap();

    // The worker is now inside a 500ms storage call.
    entered_rx.recv_timeout(Duration::from_secs(5)).unwrap();

    let name = Field::new("name");
    let fields = BTreeSet::from([name.clone()]);
    let started = Instant::now();
    for i in 0..1000_i64 {
        world
            .manager
            .notify(busy.id(), &fields, &FlagChanges::new(), &IdChanges::new());
        busy.set_field(&name, i).unwrap();
    }
    let elapsed = started.elapsed();
    assert!(
        elapsed < Duration::from_millis(400),
        "producers blocked for {elapsed:?} behind a stalled commit"
    );

    world.manager.stop();
}

#[test]
fn concurrent_producers_merge_into_one_diff() {
    let world = World::with_defaults();
    let shared = world.cache.create(id(1, 1)).unwrap();
    world.manager.flush().unwrap();

    let producers: Vec<_> = (0..4)
        .map(|p| {
            let handle = shared.clone();
            thread::spawn(move || {
                for i in 0..250_i64 {
                    handle.set_field(&Field::new(format!("slot{p}")), i).unwrap();
                }
            })
        })
        .collect();
    for producer in producers {
        producer.join().unwrap();
    }

    assert_eq!(world.manager.pending_counts().updates, 1);
    let report = world.manager.flush().unwrap();
    assert_eq!(report.committed, 1);
    assert_eq!(world.store.stored(shared.id()).unwrap().fields.len(), 4);
}

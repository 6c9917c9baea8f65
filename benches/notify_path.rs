use std::collections::BTreeSet;
use std::hint::black_box;
use std::sync::Arc;
use std::time::Instant;

use criterion::{criterion_group, criterion_main, Criterion, Throughput};

use kyrocommit::{
    ChangeListener, CommitConfig, EntityCache, EntityId, Field, FlagChanges, IdChanges, IdDelta,
    InMemoryDurableStore, PendingChanges, SiteId, UpdateManager,
};

fn id(local: u64) -> EntityId {
    EntityId::new(SiteId::new(1), local)
}

fn manager() -> (Arc<EntityCache>, UpdateManager) {
    let pending = Arc::new(PendingChanges::new());
    let cache = Arc::new(EntityCache::new(Arc::clone(&pending) as Arc<dyn ChangeListener>));
    let manager = UpdateManager::new(
        pending,
        Arc::clone(&cache),
        Arc::new(InMemoryDurableStore::new()),
        CommitConfig::default(),
    )
    .unwrap();
    (cache, manager)
}

fn bench_notify_merge(c: &mut Criterion) {
    c.bench_function("notify/merge_fields", |b| {
        let (_cache, manager) = manager();
        let fields = BTreeSet::from([Field::new("name"), Field::new("weight")]);
        let flags = FlagChanges::new();
        let ids = IdChanges::new();
        let mut i = 0u64;
        b.iter(|| {
            i = (i + 1) % 1024;
            manager.notify(black_box(id(i)), &fields, &flags, &ids);
        });
    });
}

fn bench_notify_id_delta(c: &mut Criterion) {
    let mut group = c.benchmark_group("notify_ids");
    group.throughput(Throughput::Elements(1));

    group.bench_function("toggle_reference", |b| {
        b.iter_custom(|iters| {
            let (_cache, manager) = manager();
            let field = Field::new("exits");
            let fields = BTreeSet::from([field.clone()]);
            let flags = FlagChanges::new();
            let add = IdChanges::from([(field.clone(), IdDelta::added([id(2)]))]);
            let remove = IdChanges::from([(field, IdDelta::removed([id(2)]))]);

            let start = Instant::now();
            for n in 0..iters {
                let ids = if n % 2 == 0 { &add } else { &remove };
                manager
                    .try_notify(id(1), &fields, &flags, black_box(ids))
                    .unwrap();
            }
            start.elapsed()
        });
    });
    group.finish();
}

fn bench_handle_mutation(c: &mut Criterion) {
    let mut group = c.benchmark_group("handle_mutation");
    group.throughput(Throughput::Elements(1));

    group.bench_function("set_field", |b| {
        let (cache, _manager) = manager();
        let handle = cache.create(id(1)).unwrap();
        let name = Field::new("counter");
        let mut n = 0_i64;
        b.iter(|| {
            n += 1;
            handle.set_field(&name, black_box(n)).unwrap();
        });
    });

    group.bench_function("flush_100_dirty", |b| {
        b.iter_custom(|iters| {
            let (cache, manager) = manager();
            let handles: Vec<_> = (0..100).map(|i| cache.create(id(i)).unwrap()).collect();
            let name = Field::new("counter");
            let mut total = std::time::Duration::ZERO;
            for n in 0..iters {
                for handle in &handles {
                    handle.set_field(&name, n as i64).unwrap();
                }
                let start = Instant::now();
                manager.flush().unwrap();
                total += start.elapsed();
            }
            total
        });
    });
    group.finish();
}

criterion_group!(
    notify_path,
    bench_notify_merge,
    bench_notify_id_delta,
    bench_handle_mutation
);
criterion_main!(notify_path);

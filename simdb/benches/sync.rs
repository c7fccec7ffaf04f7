use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};

use simdb::{Component, PlainColumn, Repository, SyncOptions};

#[derive(Debug, Clone, Copy, Default)]
struct Pos {
    x: f32,
    y: f32,
    z: f32,
}

impl Component for Pos {
    type Storage = PlainColumn<Self>;
}

fn seeded(entities: usize) -> Repository {
    let mut repo = Repository::new();
    repo.register_component::<Pos>().unwrap();
    for i in 0..entities {
        let e = repo.create_entity();
        repo.add_component(
            e,
            Pos {
                x: i as f32,
                y: 0.0,
                z: 0.0,
            },
        )
        .unwrap();
    }
    repo
}

fn bench_full_sync(c: &mut Criterion) {
    let mut group = c.benchmark_group("full_sync");
    for &entities in &[10_000usize, 100_000] {
        let live = seeded(entities);
        group.bench_with_input(
            BenchmarkId::from_parameter(entities),
            &entities,
            |b, _| {
                b.iter_batched(
                    || live.replica(),
                    |mut replica| {
                        replica.sync_from(&live, &SyncOptions::full()).unwrap();
                        black_box(replica)
                    },
                    criterion::BatchSize::LargeInput,
                );
            },
        );
    }
    group.finish();
}

fn bench_incremental_sync(c: &mut Criterion) {
    // One dirty chunk out of ~100: the steady-state cost of change tracking.
    let mut live = seeded(100_000);
    let target = live.query().with::<Pos>().entities()[0];
    let mut replica = live.replica();
    replica.sync_from(&live, &SyncOptions::full()).unwrap();

    c.bench_function("incremental_sync_one_dirty_chunk", |b| {
        b.iter(|| {
            live.tick();
            live.get_component_rw::<Pos>(target).unwrap().x += 1.0;
            replica.sync_from(&live, &SyncOptions::full()).unwrap();
        });
    });
}

criterion_group!(benches, bench_full_sync, bench_incremental_sync);
criterion_main!(benches);

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use ne16_format::{EntrySpec, ImageBuilder, SegmentSpec};
use ne16_loader::{AddressSpace, Arena, LoaderConfig, MemoryOpener, StubSegmentHost};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

fn bench_churn(c: &mut Criterion) {
    let mut group = c.benchmark_group("arena_churn");

    for max_size in [64usize, 1024, 8192] {
        group.bench_with_input(BenchmarkId::new("allocate_free", max_size), &max_size, |b, &max_size| {
            b.iter(|| {
                let mut rng = StdRng::seed_from_u64(1);
                let mut arena = Arena::new(1 << 20).unwrap();
                let mut live = Vec::with_capacity(256);
                for _ in 0..2000 {
                    if live.len() < 64 || rng.gen_bool(0.5) {
                        if let Ok(ptr) = arena.allocate(rng.gen_range(1..max_size)) {
                            live.push(ptr);
                        }
                    } else {
                        let ptr = live.swap_remove(rng.gen_range(0..live.len()));
                        arena.free(ptr).unwrap();
                    }
                }
                black_box(arena.largest_free())
            });
        });
    }

    group.finish();
}

fn bench_load_chain(c: &mut Criterion) {
    let opener = MemoryOpener::new();
    let depth = 16;
    for i in 0..depth {
        let mut builder = ImageBuilder::new(format!("M{i}"))
            .segment(SegmentSpec::code(vec![0x90; 256]))
            .entry(EntrySpec::Moveable { segment: 1, offset: 0x10 })
            .export(format!("PROC{i}"), 1);
        if i + 1 < depth {
            builder = builder.reference(format!("M{}", i + 1));
        }
        opener.insert(&format!("M{i}.DLL"), builder.build().unwrap());
    }

    c.bench_function("load_dependency_chain", |b| {
        b.iter(|| {
            let space = AddressSpace::new(
                LoaderConfig::default(),
                Box::new(opener.clone()),
                Box::new(StubSegmentHost::new()),
            )
            .unwrap();
            let root = space.load_module(black_box("M0.DLL"), None).unwrap();
            black_box(space.resolve_entry(root, 1).unwrap())
        });
    });
}

criterion_group!(benches, bench_churn, bench_load_chain);
criterion_main!(benches);

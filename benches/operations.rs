//! Insert and search throughput.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use proximum::{Index, IndexConfig, StoreConfig};
use tempfile::tempdir;
use uuid::Uuid;

const DIM: usize = 64;

fn config(dir: &std::path::Path) -> IndexConfig {
    IndexConfig {
        capacity: 100_000,
        chunk_size: 256,
        store: StoreConfig::at(Uuid::new_v4(), dir.join("kv.redb")),
        mmap_dir: Some(dir.to_path_buf()),
        ..IndexConfig::new(DIM)
    }
}

fn make_vector(seed: u64) -> Vec<f32> {
    (0..DIM)
        .map(|i| (seed as f32 * 0.7 + i as f32 * 0.31).sin())
        .collect()
}

fn bench_insert(c: &mut Criterion) {
    c.bench_function("insert_1", |b| {
        let dir = tempdir().unwrap();
        let mut index = Index::create(config(dir.path())).unwrap();
        let mut seed = 0u64;
        b.iter(|| {
            index = index.insert(black_box(&make_vector(seed))).unwrap();
            seed += 1;
        });
    });
}

fn bench_search(c: &mut Criterion) {
    let mut group = c.benchmark_group("search");
    for size in [1_000u64, 10_000] {
        let dir = tempdir().unwrap();
        let vecs: Vec<Vec<f32>> = (0..size).map(make_vector).collect();
        let index = Index::create(config(dir.path()))
            .unwrap()
            .insert_batch(&vecs, None, Default::default())
            .unwrap();
        group.bench_with_input(BenchmarkId::from_parameter(size), &size, |b, _| {
            let mut seed = 0u64;
            b.iter(|| {
                let query = make_vector(seed % size);
                seed += 1;
                black_box(index.search(&query, 10).unwrap())
            });
        });
    }
    group.finish();
}

criterion_group!(benches, bench_insert, bench_search);
criterion_main!(benches);

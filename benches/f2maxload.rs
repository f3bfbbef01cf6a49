use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use f2maxload::{BitMatrixHash, BucketHasher, Distribution, KeySet, SpaceSaving};
use rand::prelude::*;

const KEYS: usize = 16_384;

fn bench_hash(c: &mut Criterion) {
    let mut group = c.benchmark_group("BitMatrixHash");
    group.throughput(Throughput::Elements(KEYS as u64));
    let mut rng = StdRng::seed_from_u64(42);

    // Single-key path against the byte-table batch path
    for u in [32, 64, 128, 256] {
        let keys = KeySet::generate(&Distribution::Uniform, u, KEYS, &mut rng).unwrap();
        let h = BitMatrixHash::new(20, u, 42).unwrap();

        group.bench_with_input(BenchmarkId::new("hash_one", u), &keys, |b, keys| {
            b.iter(|| {
                let mut acc = 0;
                for key in keys.iter() {
                    acc ^= h.hash_one(black_box(key)).unwrap();
                }
                acc
            });
        });

        let mut out = Vec::with_capacity(KEYS);
        group.bench_with_input(BenchmarkId::new("hash_many", u), &keys, |b, keys| {
            b.iter(|| {
                out.clear();
                h.hash_many_into(black_box(keys.as_slice()), &mut out).unwrap();
                out.len()
            });
        });
    }
    group.finish();
}

fn bench_space_saving(c: &mut Criterion) {
    let mut group = c.benchmark_group("SpaceSaving Ingest");
    let mut rng = StdRng::seed_from_u64(42);
    let n = 1 << 18;
    group.throughput(Throughput::Elements(n as u64));

    // 2^20 buckets, so small tables keep evicting
    let buckets: Vec<u64> = (0..n).map(|_| rng.gen_range(0..1u64 << 20)).collect();
    for k in [64, 1_024, 50_000] {
        group.bench_with_input(BenchmarkId::from_parameter(k), &k, |b, &k| {
            b.iter(|| {
                let mut tracker = SpaceSaving::new(k);
                tracker.ingest_batch(black_box(&buckets));
                tracker.upper_bound()
            });
        });
    }
    group.finish();
}

fn bench_chunk_size(c: &mut Criterion) {
    let mut group = c.benchmark_group("Hash and Track (chunk size)");
    let mut rng = StdRng::seed_from_u64(42);
    let keys = KeySet::generate(&Distribution::Uniform, 64, 1 << 17, &mut rng).unwrap();
    let h = BitMatrixHash::new(16, 64, 7).unwrap();
    group.throughput(Throughput::Elements(keys.len() as u64));

    for chunk in [256, 4_096, 16_384, 65_536] {
        group.bench_with_input(BenchmarkId::from_parameter(chunk), &chunk, |b, &chunk| {
            b.iter(|| {
                f2maxload::track_max_load(&h, keys.as_slice(), 4_096, chunk)
                    .unwrap()
                    .upper_bound()
            });
        });
    }
    group.finish();
}

criterion_group!(benches, bench_hash, bench_space_saving, bench_chunk_size);
criterion_main!(benches);

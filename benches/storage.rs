//! Micro benchmarks for the paged storage stack.

use criterion::{black_box, criterion_group, criterion_main, BatchSize, Criterion, Throughput};
use rand::seq::SliceRandom;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use tempfile::TempDir;

use quarry::btree::PagedBTree;
use quarry::hash::PagedHashTable;
use quarry::paged::{AccessMode, BufferPool, PagedFile, PagedFileOptions};
use quarry::PAGE_SIZE;

const INSERT_COUNT: u64 = 16_384;
const LOOKUP_SAMPLES: usize = 2_048;

fn file_options() -> PagedFileOptions {
    PagedFileOptions {
        initial_size: 1_024 * PAGE_SIZE as u64,
        truncate: true,
        direct_io: false,
        fsync_on_write: false,
        file_id: 1,
    }
}

struct FreshTree {
    _dir: TempDir,
    tree: PagedBTree,
}

impl FreshTree {
    fn new() -> FreshTree {
        let dir = TempDir::new().unwrap();
        let tree = PagedBTree::open(dir.path().join("bench.db"), 256, file_options()).unwrap();
        FreshTree { _dir: dir, tree }
    }
}

fn bench_btree(c: &mut Criterion) {
    let mut group = c.benchmark_group("btree");
    group.sample_size(20);

    group.throughput(Throughput::Elements(INSERT_COUNT));
    group.bench_function("sequential_insert", |b| {
        b.iter_batched(
            FreshTree::new,
            |fixture| {
                for key in 0..INSERT_COUNT {
                    fixture.tree.insert(key, key).unwrap();
                }
                fixture
            },
            BatchSize::LargeInput,
        )
    });

    group.throughput(Throughput::Elements(LOOKUP_SAMPLES as u64));
    group.bench_function("random_find", |b| {
        let fixture = FreshTree::new();
        for key in 0..INSERT_COUNT {
            fixture.tree.insert(key, key).unwrap();
        }
        let mut keys: Vec<u64> = (0..INSERT_COUNT).collect();
        keys.shuffle(&mut ChaCha8Rng::seed_from_u64(3));
        keys.truncate(LOOKUP_SAMPLES);
        b.iter(|| {
            for &key in &keys {
                black_box(fixture.tree.find(key).unwrap());
            }
        })
    });

    group.finish();
}

fn bench_hash(c: &mut Criterion) {
    let mut group = c.benchmark_group("hash");
    group.sample_size(20);

    group.throughput(Throughput::Elements(INSERT_COUNT));
    group.bench_function("insert", |b| {
        b.iter_batched(
            || {
                let dir = TempDir::new().unwrap();
                let table =
                    PagedHashTable::create(dir.path().join("bench.db"), 1_024, 256, file_options())
                        .unwrap();
                (dir, table)
            },
            |(dir, table)| {
                for key in 0..INSERT_COUNT {
                    table.insert(key, key).unwrap();
                }
                (dir, table)
            },
            BatchSize::LargeInput,
        )
    });

    group.throughput(Throughput::Elements(LOOKUP_SAMPLES as u64));
    group.bench_function("search", |b| {
        let dir = TempDir::new().unwrap();
        let table =
            PagedHashTable::create(dir.path().join("bench.db"), 1_024, 256, file_options())
                .unwrap();
        for key in 0..INSERT_COUNT {
            table.insert(key, key).unwrap();
        }
        b.iter(|| {
            for key in 0..LOOKUP_SAMPLES as u64 {
                black_box(table.search(key).unwrap());
            }
        })
    });

    group.finish();
}

fn bench_pool(c: &mut Criterion) {
    let mut group = c.benchmark_group("pool");
    group.throughput(Throughput::Elements(1));

    group.bench_function("pin_hit", |b| {
        let dir = TempDir::new().unwrap();
        let file = PagedFile::open(dir.path().join("bench.db"), file_options()).unwrap();
        let pool = BufferPool::new(file, 64).unwrap();
        pool.pin(1, AccessMode::Read).unwrap();
        b.iter(|| black_box(pool.pin(1, AccessMode::Read).unwrap()))
    });

    group.bench_function("pin_churn", |b| {
        let dir = TempDir::new().unwrap();
        let file = PagedFile::open(dir.path().join("bench.db"), file_options()).unwrap();
        let pool = BufferPool::new(file, 8).unwrap();
        let mut page = 1u32;
        b.iter(|| {
            page = page % 64 + 1;
            black_box(pool.pin(page, AccessMode::Read).unwrap())
        })
    });

    group.finish();
}

criterion_group!(benches, bench_btree, bench_hash, bench_pool);
criterion_main!(benches);

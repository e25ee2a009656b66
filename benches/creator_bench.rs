//! Benchmarks for screendb
//!
//! Run with: cargo bench

use criterion::{black_box, criterion_group, criterion_main, BatchSize, Criterion};
use screendb::creator::DatabaseCreator;
use screendb::hash::{content_hash, HashIndex};
use screendb::record::{DerivedRecord, Record};
use screendb::store::{CreationMode, MemoryStore, SqliteStore};

fn sample_record(n: u64) -> Record {
    let features = [(1u16, 12u32), (2, 4), (5, 1)].into_iter().collect();
    let derived = (0..4)
        .map(|i| DerivedRecord::new(vec![i as u8; 64], features.clone()))
        .collect();
    Record::new(format!("C1=CC=CC=C1-{}", n).into_bytes(), derived)
}

fn benchmark_content_hash(c: &mut Criterion) {
    let payload = vec![0x5au8; 256];
    c.bench_function("content_hash_256b", |b| {
        b.iter(|| black_box(content_hash(black_box(&payload))))
    });
}

fn benchmark_hash_index(c: &mut Criterion) {
    let index = HashIndex::from_pairs((0..100_000u64).map(|h| (h, h as i64)));
    c.bench_function("hash_index_lookup", |b| {
        let mut h = 0u64;
        b.iter(|| {
            h = (h + 7919) % 200_000;
            black_box(index.contains(h))
        })
    });
}

fn benchmark_process_memory(c: &mut Criterion) {
    let records: Vec<Record> = (0..1_000).map(sample_record).collect();
    c.bench_function("process_1k_memory", |b| {
        b.iter_batched(
            || {
                DatabaseCreator::with_store("bench", MemoryStore::new(), CreationMode::Create, false)
                    .unwrap()
            },
            |mut db| {
                for record in &records {
                    black_box(db.process(record));
                }
            },
            BatchSize::SmallInput,
        )
    });
}

fn benchmark_process_sqlite(c: &mut Criterion) {
    let records: Vec<Record> = (0..1_000).map(sample_record).collect();
    c.bench_function("process_1k_sqlite_in_memory", |b| {
        b.iter_batched(
            || {
                let store = SqliteStore::open_in_memory().unwrap();
                DatabaseCreator::with_store("bench", store, CreationMode::Create, false).unwrap()
            },
            |mut db| {
                for record in &records {
                    black_box(db.process(record));
                }
            },
            BatchSize::SmallInput,
        )
    });
}

criterion_group!(
    benches,
    benchmark_content_hash,
    benchmark_hash_index,
    benchmark_process_memory,
    benchmark_process_sqlite
);
criterion_main!(benches);

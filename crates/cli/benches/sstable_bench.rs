use codec::{key_with_version, ValueStruct};
use criterion::{criterion_group, criterion_main, BatchSize, Criterion};
use sstable::{Table, TableBuilder, TableOptions};
use std::path::Path;
use tempfile::tempdir;

const N_KEYS: usize = 10_000;
const VALUE_SIZE: usize = 100;

fn write_table(path: &Path) {
    let mut builder = TableBuilder::new(TableOptions::default());
    let value = ValueStruct::new(vec![b'x'; VALUE_SIZE], 0, 0);
    for i in 0..N_KEYS {
        let key = key_with_version(format!("key{:06}", i).as_bytes(), i as u64 + 1);
        builder.add(&key, &value, false);
    }
    builder.finish(path).unwrap();
}

fn sstable_write_benchmark(c: &mut Criterion) {
    c.bench_function("sstable_write_10k", |b| {
        b.iter_batched(
            || {
                let dir = tempdir().unwrap();
                let path = dir.path().join("00001.sst");
                (dir, path)
            },
            |(_dir, path)| write_table(&path),
            BatchSize::SmallInput,
        );
    });
}

fn sstable_get_hit_benchmark(c: &mut Criterion) {
    c.bench_function("sstable_get_hit_10k", |b| {
        b.iter_batched(
            || {
                let dir = tempdir().unwrap();
                let path = dir.path().join("00001.sst");
                write_table(&path);
                let table = Table::open(&path, 1, None).unwrap();
                (dir, table)
            },
            |(_dir, table)| {
                for i in 0..N_KEYS {
                    let key = key_with_version(format!("key{:06}", i).as_bytes(), u64::MAX);
                    assert!(table.get(&key).unwrap().is_some());
                }
            },
            BatchSize::LargeInput,
        );
    });
}

fn sstable_get_miss_benchmark(c: &mut Criterion) {
    c.bench_function("sstable_get_miss_10k", |b| {
        b.iter_batched(
            || {
                let dir = tempdir().unwrap();
                let path = dir.path().join("00001.sst");
                write_table(&path);
                let table = Table::open(&path, 1, None).unwrap();
                (dir, table)
            },
            |(_dir, table)| {
                for i in 0..N_KEYS {
                    let key = key_with_version(format!("missing{:06}", i).as_bytes(), u64::MAX);
                    assert!(table.get(&key).unwrap().is_none());
                }
            },
            BatchSize::LargeInput,
        );
    });
}

criterion_group!(
    benches,
    sstable_write_benchmark,
    sstable_get_hit_benchmark,
    sstable_get_miss_benchmark
);
criterion_main!(benches);

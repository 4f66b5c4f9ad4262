use criterion::{criterion_group, criterion_main, BatchSize, Criterion};
use engine::{Db, Entry, IteratorOptions, Options};
use tempfile::{tempdir, TempDir};

const N_KEYS: usize = 5_000;

fn open(dir: &TempDir) -> Db {
    let opts = Options::new(dir.path())
        .with_mem_table_size(1 << 20)
        .with_wal_sync(false);
    Db::open(opts).unwrap()
}

fn filled() -> (TempDir, Db) {
    let dir = tempdir().unwrap();
    let db = open(&dir);
    for i in 0..N_KEYS {
        db.set(Entry::new(format!("key{:06}", i), vec![b'x'; 100]))
            .unwrap();
    }
    db.flush().unwrap();
    (dir, db)
}

fn db_set_benchmark(c: &mut Criterion) {
    c.bench_function("db_set_5k", |b| {
        b.iter_batched(
            || {
                let dir = tempdir().unwrap();
                let db = open(&dir);
                (dir, db)
            },
            |(_dir, db)| {
                for i in 0..N_KEYS {
                    db.set(Entry::new(format!("key{:06}", i), vec![b'x'; 100]))
                        .unwrap();
                }
            },
            BatchSize::SmallInput,
        );
    });
}

fn db_set_large_value_benchmark(c: &mut Criterion) {
    c.bench_function("db_set_8k_values_1k", |b| {
        b.iter_batched(
            || {
                let dir = tempdir().unwrap();
                let db = open(&dir);
                (dir, db)
            },
            |(_dir, db)| {
                for i in 0..1_000 {
                    db.set(Entry::new(format!("key{:06}", i), vec![b'x'; 8 << 10]))
                        .unwrap();
                }
            },
            BatchSize::SmallInput,
        );
    });
}

fn db_get_benchmark(c: &mut Criterion) {
    let (_dir, db) = filled();
    c.bench_function("db_get_from_tables_5k", |b| {
        b.iter(|| {
            for i in 0..N_KEYS {
                db.get(format!("key{:06}", i).as_bytes()).unwrap();
            }
        });
    });
}

fn db_scan_benchmark(c: &mut Criterion) {
    let (_dir, db) = filled();
    c.bench_function("db_scan_5k", |b| {
        b.iter(|| {
            let mut it = db.new_iterator(IteratorOptions::default()).unwrap();
            it.rewind();
            let mut n = 0;
            while it.valid() {
                n += 1;
                it.next();
            }
            it.close().unwrap();
            assert_eq!(n, N_KEYS);
        });
    });
}

criterion_group!(
    benches,
    db_set_benchmark,
    db_set_large_value_benchmark,
    db_get_benchmark,
    db_scan_benchmark
);
criterion_main!(benches);

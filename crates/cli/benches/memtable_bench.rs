use codec::{key_with_version, ValueStruct};
use criterion::{criterion_group, criterion_main, BatchSize, Criterion};
use memtable::SkipList;
use std::sync::Arc;
use std::thread;

const N_KEYS: usize = 10_000;
const ARENA_SIZE: usize = 8 << 20;

fn filled_list() -> SkipList {
    let list = SkipList::new(ARENA_SIZE).unwrap();
    let value = ValueStruct::new(vec![b'x'; 100], 0, 0);
    for i in 0..N_KEYS {
        list.add(&key_with_version(format!("key{:06}", i).as_bytes(), 1), &value)
            .unwrap();
    }
    list
}

fn skiplist_insert_benchmark(c: &mut Criterion) {
    c.bench_function("skiplist_insert_10k", |b| {
        b.iter_batched(
            || SkipList::new(ARENA_SIZE).unwrap(),
            |list| {
                let value = ValueStruct::new(vec![b'x'; 100], 0, 0);
                for i in 0..N_KEYS {
                    list.add(&key_with_version(format!("key{:06}", i).as_bytes(), 1), &value)
                        .unwrap();
                }
            },
            BatchSize::SmallInput,
        );
    });
}

fn skiplist_get_benchmark(c: &mut Criterion) {
    let list = filled_list();
    c.bench_function("skiplist_get_10k", |b| {
        b.iter(|| {
            for i in 0..N_KEYS {
                let key = key_with_version(format!("key{:06}", i).as_bytes(), u64::MAX);
                assert!(list.get(&key).is_some());
            }
        });
    });
}

fn skiplist_concurrent_insert_benchmark(c: &mut Criterion) {
    c.bench_function("skiplist_insert_4_threads_10k", |b| {
        b.iter_batched(
            || Arc::new(SkipList::new(ARENA_SIZE).unwrap()),
            |list| {
                let handles: Vec<_> = (0..4)
                    .map(|t| {
                        let list = Arc::clone(&list);
                        thread::spawn(move || {
                            let value = ValueStruct::new(vec![b'x'; 100], 0, 0);
                            for i in (t..N_KEYS).step_by(4) {
                                let key = key_with_version(format!("key{:06}", i).as_bytes(), 1);
                                list.add(&key, &value).unwrap();
                            }
                        })
                    })
                    .collect();
                for h in handles {
                    h.join().unwrap();
                }
            },
            BatchSize::SmallInput,
        );
    });
}

criterion_group!(
    benches,
    skiplist_insert_benchmark,
    skiplist_get_benchmark,
    skiplist_concurrent_insert_benchmark
);
criterion_main!(benches);

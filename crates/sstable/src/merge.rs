//! Heap-based merge over any number of [`KvIterator`]s.
//!
//! Sources are given newest first: when two sources hold the same internal
//! key, the one with the lower index wins and the others are skipped. Keys
//! that differ only in version are all emitted, newest version first, so
//! callers decide which versions to keep.

use std::cmp::Ordering;
use std::collections::BinaryHeap;

use codec::{compare_keys, Error, KvIterator, ValueStruct};

/// A pending key from one source.
struct HeapEntry {
    key: Vec<u8>,
    source: usize,
    reversed: bool,
}

impl PartialEq for HeapEntry {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for HeapEntry {}

impl PartialOrd for HeapEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for HeapEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        // BinaryHeap pops the greatest entry. Ascending merges want the
        // smallest key first, descending the largest; on a tie the lower
        // source index is greater so it pops first.
        let by_key = if self.reversed {
            compare_keys(&self.key, &other.key)
        } else {
            compare_keys(&other.key, &self.key)
        };
        by_key.then_with(|| other.source.cmp(&self.source))
    }
}

pub struct MergeIterator {
    iters: Vec<Box<dyn KvIterator + Send>>,
    heap: BinaryHeap<HeapEntry>,
    reversed: bool,
}

impl MergeIterator {
    /// `iters` must all run in the direction given by `reversed`, newest
    /// source first. The merge is unpositioned until `rewind` or `seek`.
    pub fn new(iters: Vec<Box<dyn KvIterator + Send>>, reversed: bool) -> Self {
        Self {
            heap: BinaryHeap::with_capacity(iters.len()),
            iters,
            reversed,
        }
    }

    fn push(&mut self, source: usize) {
        let it = &self.iters[source];
        if it.valid() {
            self.heap.push(HeapEntry {
                key: it.key().to_vec(),
                source,
                reversed: self.reversed,
            });
        }
    }

    fn rebuild(&mut self) {
        self.heap.clear();
        for source in 0..self.iters.len() {
            self.push(source);
        }
    }
}

impl KvIterator for MergeIterator {
    fn next(&mut self) {
        let top = match self.heap.pop() {
            Some(top) => top,
            None => return,
        };
        self.iters[top.source].next();
        self.push(top.source);

        // Older copies of the same internal key.
        while self.heap.peek().map_or(false, |p| p.key == top.key) {
            if let Some(dup) = self.heap.pop() {
                self.iters[dup.source].next();
                self.push(dup.source);
            }
        }
    }

    fn rewind(&mut self) {
        for it in &mut self.iters {
            it.rewind();
        }
        self.rebuild();
    }

    fn seek(&mut self, key: &[u8]) {
        for it in &mut self.iters {
            it.seek(key);
        }
        self.rebuild();
    }

    fn key(&self) -> &[u8] {
        match self.heap.peek() {
            Some(top) => &top.key,
            None => &[],
        }
    }

    fn value(&self) -> ValueStruct {
        match self.heap.peek() {
            Some(top) => self.iters[top.source].value(),
            None => ValueStruct::default(),
        }
    }

    fn valid(&self) -> bool {
        !self.heap.is_empty()
    }

    fn take_error(&mut self) -> Option<Error> {
        self.iters.iter_mut().find_map(|it| it.take_error())
    }
}

use std::sync::Arc;

use codec::{parse_version, KvIterator, ValueStruct};

use crate::SkipList;

/// Bi-directional cursor over a [`SkipList`].
///
/// Holds an `Arc` to the list, so the arena stays alive for as long as any
/// iterator over it exists.
pub struct SkipListIterator {
    list: Arc<SkipList>,
    node: u32,
}

impl SkipListIterator {
    pub fn new(list: Arc<SkipList>) -> Self {
        Self { list, node: 0 }
    }

    #[must_use]
    pub fn valid(&self) -> bool {
        self.node != 0
    }

    pub fn key(&self) -> &[u8] {
        self.list.key_of(self.node)
    }

    pub fn value(&self) -> ValueStruct {
        let mut vs = self.list.value_of(self.node);
        vs.version = parse_version(self.key());
        vs
    }

    pub fn next(&mut self) {
        debug_assert!(self.valid());
        self.node = self.list.next_of(self.node, 0);
    }

    pub fn prev(&mut self) {
        debug_assert!(self.valid());
        let key = self.key().to_vec();
        self.node = self.list.find_near(&key, true, false).unwrap_or(0);
    }

    /// First entry with key `>= target`.
    pub fn seek(&mut self, target: &[u8]) {
        self.node = self.list.find_near(target, false, true).unwrap_or(0);
    }

    /// Last entry with key `<= target`.
    pub fn seek_for_prev(&mut self, target: &[u8]) {
        self.node = self.list.find_near(target, true, true).unwrap_or(0);
    }

    pub fn seek_to_first(&mut self) {
        self.node = self.list.next_of(self.list.head(), 0);
    }

    pub fn seek_to_last(&mut self) {
        self.node = self.list.find_last().unwrap_or(0);
    }
}

/// [`KvIterator`] adapter over a skip list in one fixed direction.
pub struct UniIterator {
    iter: SkipListIterator,
    reversed: bool,
}

impl UniIterator {
    pub fn new(list: Arc<SkipList>, reversed: bool) -> Self {
        Self {
            iter: SkipListIterator::new(list),
            reversed,
        }
    }
}

impl KvIterator for UniIterator {
    fn next(&mut self) {
        if self.reversed {
            self.iter.prev();
        } else {
            self.iter.next();
        }
    }

    fn rewind(&mut self) {
        if self.reversed {
            self.iter.seek_to_last();
        } else {
            self.iter.seek_to_first();
        }
    }

    fn seek(&mut self, key: &[u8]) {
        if self.reversed {
            self.iter.seek_for_prev(key);
        } else {
            self.iter.seek(key);
        }
    }

    fn key(&self) -> &[u8] {
        self.iter.key()
    }

    fn value(&self) -> ValueStruct {
        self.iter.value()
    }

    fn valid(&self) -> bool {
        self.iter.valid()
    }
}

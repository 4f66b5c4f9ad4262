//! User-facing iteration over the whole database.

use std::cmp::Ordering;
use std::sync::Arc;

use codec::{key_with_version, now_secs, parse_key, Entry, Error, KvIterator, Result, ValueStruct};
use sstable::MergeIterator;

use crate::db::DbInner;

/// Options for [`Db::new_iterator`](crate::Db::new_iterator).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IteratorOptions {
    /// Only keys starting with this prefix are returned. Empty means all.
    pub prefix: Vec<u8>,
    pub ascending: bool,
}

impl Default for IteratorOptions {
    fn default() -> Self {
        Self {
            prefix: Vec::new(),
            ascending: true,
        }
    }
}

impl IteratorOptions {
    pub fn with_prefix(mut self, prefix: impl Into<Vec<u8>>) -> Self {
        self.prefix = prefix.into();
        self
    }

    pub fn descending(mut self) -> Self {
        self.ascending = false;
        self
    }
}

/// Yields the newest live version of every key, in key order.
///
/// Deleted and expired keys are skipped and value pointers are resolved.
/// The iterator sees memtables and tables as they were when it was
/// created; writes made afterwards may or may not show up.
///
/// ```text
/// let mut it = db.new_iterator(IteratorOptions::default())?;
/// it.rewind();
/// while let Some(entry) = it.item() {
///     ...
///     it.next();
/// }
/// it.close()?;
/// ```
pub struct DbIterator {
    inner: Arc<DbInner>,
    merge: MergeIterator,
    opts: IteratorOptions,
    item: Option<Entry>,
    err: Option<Error>,
}

impl DbIterator {
    pub(crate) fn new(inner: Arc<DbInner>, merge: MergeIterator, opts: IteratorOptions) -> Self {
        Self {
            inner,
            merge,
            opts,
            item: None,
            err: None,
        }
    }

    /// Positions at the first key of the prefix range in iteration order.
    pub fn rewind(&mut self) {
        self.err = None;
        if self.opts.ascending {
            if self.opts.prefix.is_empty() {
                self.merge.rewind();
            } else {
                self.merge.seek(&key_with_version(&self.opts.prefix, u64::MAX));
            }
        } else {
            match prefix_successor(&self.opts.prefix) {
                // Smallest internal key of the successor: every key below it
                // sorts before the end of the range.
                Some(end) => self.merge.seek(&key_with_version(&end, u64::MAX)),
                None => self.merge.rewind(),
            }
        }
        self.settle();
    }

    /// Positions at the first key `>= key` (ascending) or `<= key`
    /// (descending), clamped to the prefix range.
    pub fn seek(&mut self, key: &[u8]) {
        self.err = None;
        if self.opts.ascending {
            let target = if key < self.opts.prefix.as_slice() {
                self.opts.prefix.as_slice()
            } else {
                key
            };
            self.merge.seek(&key_with_version(target, u64::MAX));
        } else {
            match prefix_successor(&self.opts.prefix) {
                Some(end) if key >= end.as_slice() => {
                    self.merge.seek(&key_with_version(&end, u64::MAX))
                }
                _ => self.merge.seek(&key_with_version(key, 0)),
            }
        }
        self.settle();
    }

    pub fn valid(&self) -> bool {
        self.item.is_some()
    }

    /// The current entry, or `None` once the range is exhausted.
    pub fn item(&self) -> Option<&Entry> {
        self.item.as_ref()
    }

    pub fn next(&mut self) {
        if self.item.is_some() {
            self.settle();
        }
    }

    /// Releases the iterator, returning the error that ended iteration, if
    /// any.
    pub fn close(mut self) -> Result<()> {
        match self.err.take() {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Advances the merge to the next visible key and loads it into `item`.
    fn settle(&mut self) {
        self.item = None;
        let now = now_secs();
        while self.merge.valid() {
            let raw = parse_key(self.merge.key()).to_vec();
            if !raw.starts_with(&self.opts.prefix) {
                let before_range = match raw.as_slice().cmp(self.opts.prefix.as_slice()) {
                    Ordering::Less => self.opts.ascending,
                    _ => !self.opts.ascending,
                };
                if before_range {
                    self.merge.next();
                    continue;
                }
                break;
            }

            let vs = self.take_group(&raw);
            if vs.is_deleted_or_expired(now) {
                continue;
            }
            match self.inner.resolve(&raw, vs) {
                Ok(entry) => {
                    self.item = Some(entry);
                    return;
                }
                // Value moved by GC after the merge read it.
                Err(Error::Retry) => match self.inner.get(&raw) {
                    Ok(entry) => {
                        self.item = Some(entry);
                        return;
                    }
                    Err(Error::NotFound) => continue,
                    Err(e) => {
                        self.err = Some(e);
                        return;
                    }
                },
                Err(e) => {
                    self.err = Some(e);
                    return;
                }
            }
        }
        if let Some(e) = self.merge.take_error() {
            self.err = Some(e);
        }
    }

    /// Consumes every version of `raw` and returns the newest. Ascending
    /// merges emit it first, descending merges last.
    fn take_group(&mut self, raw: &[u8]) -> ValueStruct {
        let mut vs = self.merge.value();
        self.merge.next();
        while self.merge.valid() && parse_key(self.merge.key()) == raw {
            if !self.opts.ascending {
                vs = self.merge.value();
            }
            self.merge.next();
        }
        vs
    }
}

/// Smallest key greater than every key starting with `prefix`, or `None`
/// if there is none (empty or all `0xff`).
fn prefix_successor(prefix: &[u8]) -> Option<Vec<u8>> {
    let mut end = prefix.to_vec();
    while let Some(last) = end.pop() {
        if last < u8::MAX {
            end.push(last + 1);
            return Some(end);
        }
    }
    None
}

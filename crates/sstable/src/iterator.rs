//! Iterators over one table and over a run of disjoint tables.

use std::cmp::Ordering as CmpOrdering;
use std::sync::Arc;

use codec::{compare_keys, parse_version, Error, KvIterator, Result, ValueStruct};

use crate::format::Block;
use crate::Table;

struct Position {
    block_idx: usize,
    block: Arc<Block>,
    entry: usize,
}

/// Uni-directional iterator over a single table.
///
/// Created unpositioned; call `rewind` or `seek` first.
pub struct TableIterator {
    table: Arc<Table>,
    reversed: bool,
    pos: Option<Position>,
    err: Option<Error>,
}

impl TableIterator {
    pub fn new(table: Arc<Table>, reversed: bool) -> Self {
        Self {
            table,
            reversed,
            pos: None,
            err: None,
        }
    }

    pub fn table(&self) -> &Arc<Table> {
        &self.table
    }

    fn set(&mut self, res: Result<Option<(usize, Arc<Block>, usize)>>) {
        self.pos = match res {
            Ok(found) => found.map(|(block_idx, block, entry)| Position {
                block_idx,
                block,
                entry,
            }),
            Err(e) => {
                self.err = Some(e);
                None
            }
        };
    }

    fn load_first(&mut self, block_idx: usize) {
        let res = self.table.block(block_idx).map(|b| Some((block_idx, b, 0)));
        self.set(res);
    }

    fn load_last(&mut self, block_idx: usize) {
        let res = self.table.block(block_idx).map(|b| {
            let last = b.len() - 1;
            Some((block_idx, b, last))
        });
        self.set(res);
    }
}

impl KvIterator for TableIterator {
    fn next(&mut self) {
        let (block_idx, entry, len) = match &self.pos {
            Some(p) => (p.block_idx, p.entry, p.block.len()),
            None => return,
        };
        if !self.reversed {
            if entry + 1 < len {
                if let Some(p) = self.pos.as_mut() {
                    p.entry += 1;
                }
            } else if block_idx + 1 < self.table.block_count() {
                self.load_first(block_idx + 1);
            } else {
                self.pos = None;
            }
        } else if entry > 0 {
            if let Some(p) = self.pos.as_mut() {
                p.entry -= 1;
            }
        } else if block_idx > 0 {
            self.load_last(block_idx - 1);
        } else {
            self.pos = None;
        }
    }

    fn rewind(&mut self) {
        self.err = None;
        if !self.reversed {
            self.load_first(0);
        } else {
            self.load_last(self.table.block_count() - 1);
        }
    }

    fn seek(&mut self, key: &[u8]) {
        self.err = None;
        let res = if !self.reversed {
            self.table.seek_ge(key)
        } else {
            self.table.seek_le(key)
        };
        self.set(res);
    }

    fn key(&self) -> &[u8] {
        match &self.pos {
            Some(p) => p.block.key(p.entry),
            None => &[],
        }
    }

    fn value(&self) -> ValueStruct {
        match &self.pos {
            Some(p) => {
                // Cells are validated when the block is decoded.
                let mut vs = ValueStruct::decode(p.block.value(p.entry)).unwrap_or_default();
                vs.version = parse_version(p.block.key(p.entry));
                vs
            }
            None => ValueStruct::default(),
        }
    }

    fn valid(&self) -> bool {
        self.pos.is_some()
    }

    fn take_error(&mut self) -> Option<Error> {
        self.err.take()
    }
}

/// Iterates a run of tables with disjoint key ranges, sorted by min key.
pub struct ConcatIterator {
    tables: Vec<Arc<Table>>,
    reversed: bool,
    idx: usize,
    cur: Option<TableIterator>,
    err: Option<Error>,
}

impl ConcatIterator {
    pub fn new(tables: Vec<Arc<Table>>, reversed: bool) -> Self {
        Self {
            tables,
            reversed,
            idx: 0,
            cur: None,
            err: None,
        }
    }

    fn open(&mut self, idx: usize) -> &mut TableIterator {
        self.idx = idx;
        let it = TableIterator::new(Arc::clone(&self.tables[idx]), self.reversed);
        self.cur.insert(it)
    }

    /// Moves to the neighbouring table in iteration order, if any.
    fn advance_table(&mut self) -> bool {
        if let Some(e) = self.cur.as_mut().and_then(|c| c.take_error()) {
            self.err.get_or_insert(e);
            self.cur = None;
            return false;
        }
        let next = if !self.reversed {
            Some(self.idx + 1).filter(|&i| i < self.tables.len())
        } else {
            self.idx.checked_sub(1)
        };
        match next {
            Some(i) => {
                self.open(i).rewind();
                true
            }
            None => {
                self.cur = None;
                false
            }
        }
    }

    fn settle(&mut self) {
        while self.cur.as_ref().map_or(false, |c| !c.valid()) {
            if !self.advance_table() {
                break;
            }
        }
    }
}

impl KvIterator for ConcatIterator {
    fn next(&mut self) {
        if let Some(cur) = self.cur.as_mut() {
            cur.next();
            self.settle();
        }
    }

    fn rewind(&mut self) {
        self.err = None;
        if self.tables.is_empty() {
            self.cur = None;
            return;
        }
        let first = if !self.reversed { 0 } else { self.tables.len() - 1 };
        self.open(first).rewind();
        self.settle();
    }

    fn seek(&mut self, key: &[u8]) {
        self.err = None;
        let idx = if !self.reversed {
            let i = self
                .tables
                .partition_point(|t| compare_keys(t.max_key(), key) == CmpOrdering::Less);
            Some(i).filter(|&i| i < self.tables.len())
        } else {
            self.tables
                .partition_point(|t| compare_keys(t.min_key(), key) != CmpOrdering::Greater)
                .checked_sub(1)
        };
        match idx {
            Some(i) => {
                self.open(i).seek(key);
                self.settle();
            }
            None => self.cur = None,
        }
    }

    fn key(&self) -> &[u8] {
        match &self.cur {
            Some(c) => c.key(),
            None => &[],
        }
    }

    fn value(&self) -> ValueStruct {
        match &self.cur {
            Some(c) => c.value(),
            None => ValueStruct::default(),
        }
    }

    fn valid(&self) -> bool {
        self.cur.as_ref().map_or(false, |c| c.valid())
    }

    fn take_error(&mut self) -> Option<Error> {
        self.err
            .take()
            .or_else(|| self.cur.as_mut().and_then(|c| c.take_error()))
    }
}

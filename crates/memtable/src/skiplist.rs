//! Lock-free skip list stored in an [`Arena`].
//!
//! Nodes are addressed by arena offsets. A node is never removed; inserting
//! an existing internal key overwrites its value cell in place. New nodes
//! are linked bottom-up with a compare-and-swap on each predecessor's tower
//! slot, so readers never block and always observe a sorted list.
//!
//! Node layout (offsets relative to the node start):
//!
//! ```text
//! 0   value      u64  (value_offset << 32 | value_size), atomic
//! 8   key_offset u32
//! 12  key_size u16 | height u16
//! 16  tower      [u32; height], atomic, 0 = nil
//! ```

use std::cmp::Ordering as CmpOrdering;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};

use codec::{compare_keys, parse_version, same_key, Error, Result, ValueStruct};
use rand::Rng;

use crate::arena::{Arena, MAX_HEIGHT, NODE_HEADER};

/// Probability of growing a tower by one more level is roughly 1/3.
const HEIGHT_INCREASE: u32 = u32::MAX / 3;

pub struct SkipList {
    height: AtomicU32,
    head: u32,
    arena: Arena,
    len: AtomicUsize,
}

impl SkipList {
    /// Creates an empty list whose arena starts with `arena_size` bytes.
    pub fn new(arena_size: usize) -> Result<Self> {
        let arena = Arena::new(arena_size);
        let head = new_node(&arena, &[], &ValueStruct::default(), MAX_HEIGHT)?;
        Ok(Self {
            height: AtomicU32::new(1),
            head,
            arena,
            len: AtomicUsize::new(0),
        })
    }

    /// Inserts `key` (an internal key) with `value`, or overwrites the value
    /// of an identical key in place.
    pub fn add(&self, key: &[u8], value: &ValueStruct) -> Result<()> {
        if key.len() > u16::MAX as usize {
            return Err(Error::InvalidArgument(format!(
                "key of {} bytes exceeds {} bytes",
                key.len(),
                u16::MAX
            )));
        }

        let list_height = self.height() as usize;
        let mut prev = [0u32; MAX_HEIGHT + 1];
        let mut next = [0u32; MAX_HEIGHT + 1];
        prev[list_height] = self.head;
        for i in (0..list_height).rev() {
            let (p, n) = self.find_splice_for_level(key, prev[i + 1], i);
            if p == n {
                return self.set_value(p, value);
            }
            prev[i] = p;
            next[i] = n;
        }

        let height = random_height();
        let x = new_node(&self.arena, key, value, height)?;

        let mut list_height = self.height();
        while height as u32 > list_height {
            match self.height.compare_exchange(
                list_height,
                height as u32,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => break,
                Err(h) => list_height = h,
            }
        }

        for i in 0..height {
            loop {
                if prev[i] == 0 {
                    // The list grew past the height seen during the splice search.
                    let (p, n) = self.find_splice_for_level(key, self.head, i);
                    prev[i] = p;
                    next[i] = n;
                }
                self.tower(x, i).store(next[i], Ordering::Relaxed);
                if self
                    .tower(prev[i], i)
                    .compare_exchange(next[i], x, Ordering::AcqRel, Ordering::Acquire)
                    .is_ok()
                {
                    break;
                }
                let (p, n) = self.find_splice_for_level(key, prev[i], i);
                if p == n {
                    // Only reachable on level 0: a racing insert of the same key won.
                    return self.set_value(p, value);
                }
                prev[i] = p;
                next[i] = n;
            }
        }
        self.len.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Newest value for the raw key of `key` whose version is `<=` the
    /// version in `key`.
    pub fn get(&self, key: &[u8]) -> Option<ValueStruct> {
        let n = self.find_near(key, false, true)?;
        let found = self.key_of(n);
        if !same_key(key, found) {
            return None;
        }
        let mut vs = self.value_of(n);
        vs.version = parse_version(found);
        Some(vs)
    }

    /// Value stored under exactly `key`.
    pub fn search(&self, key: &[u8]) -> Option<ValueStruct> {
        let n = self.find_near(key, false, true)?;
        let found = self.key_of(n);
        if found != key {
            return None;
        }
        let mut vs = self.value_of(n);
        vs.version = parse_version(found);
        Some(vs)
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.next_of(self.head, 0) == 0
    }

    /// Number of distinct internal keys linked so far.
    #[must_use]
    pub fn len(&self) -> usize {
        self.len.load(Ordering::Relaxed)
    }

    /// Bytes used in the arena.
    #[must_use]
    pub fn mem_size(&self) -> usize {
        self.arena.size()
    }

    pub(crate) fn height(&self) -> u32 {
        self.height.load(Ordering::Acquire)
    }

    pub(crate) fn head(&self) -> u32 {
        self.head
    }

    /// Finds the node nearest to `key`.
    ///
    /// | less  | allow_equal | result                 |
    /// |-------|-------------|------------------------|
    /// | false | true        | first node `>= key`    |
    /// | false | false       | first node `> key`     |
    /// | true  | true        | last node `<= key`     |
    /// | true  | false       | last node `< key`      |
    pub(crate) fn find_near(&self, key: &[u8], less: bool, allow_equal: bool) -> Option<u32> {
        let mut x = self.head;
        let mut level = self.height() as usize - 1;
        loop {
            let next = self.next_of(x, level);
            if next == 0 {
                if level > 0 {
                    level -= 1;
                    continue;
                }
                if !less || x == self.head {
                    return None;
                }
                return Some(x);
            }

            match compare_keys(key, self.key_of(next)) {
                CmpOrdering::Greater => {
                    x = next;
                }
                CmpOrdering::Equal => {
                    if allow_equal {
                        return Some(next);
                    }
                    if !less {
                        return non_nil(self.next_of(next, 0));
                    }
                    if level > 0 {
                        level -= 1;
                        continue;
                    }
                    if x == self.head {
                        return None;
                    }
                    return Some(x);
                }
                CmpOrdering::Less => {
                    if level > 0 {
                        level -= 1;
                        continue;
                    }
                    if !less {
                        return Some(next);
                    }
                    if x == self.head {
                        return None;
                    }
                    return Some(x);
                }
            }
        }
    }

    /// Last node in the list.
    pub(crate) fn find_last(&self) -> Option<u32> {
        let mut n = self.head;
        let mut level = self.height() as usize - 1;
        loop {
            let next = self.next_of(n, level);
            if next != 0 {
                n = next;
                continue;
            }
            if level == 0 {
                if n == self.head {
                    return None;
                }
                return Some(n);
            }
            level -= 1;
        }
    }

    /// Returns `(before, next)` bracketing `key` on `level`, or `(n, n)` if
    /// `n` holds exactly `key`.
    fn find_splice_for_level(&self, key: &[u8], mut before: u32, level: usize) -> (u32, u32) {
        loop {
            let next = self.next_of(before, level);
            if next == 0 {
                return (before, 0);
            }
            match compare_keys(key, self.key_of(next)) {
                CmpOrdering::Equal => return (next, next),
                CmpOrdering::Less => return (before, next),
                CmpOrdering::Greater => before = next,
            }
        }
    }

    // ---- Node accessors ----

    fn tower(&self, node: u32, level: usize) -> &AtomicU32 {
        self.arena
            .atomic_u32(node + NODE_HEADER as u32 + (level as u32) * 4)
    }

    pub(crate) fn next_of(&self, node: u32, level: usize) -> u32 {
        self.tower(node, level).load(Ordering::Acquire)
    }

    pub(crate) fn key_of(&self, node: u32) -> &[u8] {
        let key_offset = self.arena.atomic_u32(node + 8).load(Ordering::Relaxed);
        let packed = self.arena.atomic_u32(node + 12).load(Ordering::Relaxed);
        self.arena.get_key(key_offset, (packed & 0xffff) as u16)
    }

    /// Value cell of `node`, without the version.
    pub(crate) fn value_of(&self, node: u32) -> ValueStruct {
        let packed = self.arena.atomic_u64(node).load(Ordering::Acquire);
        let (off, size) = decode_value(packed);
        self.arena.get_val(off, size)
    }

    fn set_value(&self, node: u32, value: &ValueStruct) -> Result<()> {
        let (off, size) = self.arena.put_val(value)?;
        self.arena
            .atomic_u64(node)
            .store(encode_value(off, size), Ordering::Release);
        Ok(())
    }
}

impl std::fmt::Debug for SkipList {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SkipList")
            .field("height", &self.height())
            .field("len", &self.len())
            .field("arena", &self.arena)
            .finish()
    }
}

fn new_node(arena: &Arena, key: &[u8], value: &ValueStruct, height: usize) -> Result<u32> {
    let node = arena.put_node(height)?;
    let key_offset = arena.put_key(key)?;
    let (val_off, val_size) = arena.put_val(value)?;
    arena.atomic_u32(node + 8).store(key_offset, Ordering::Relaxed);
    arena
        .atomic_u32(node + 12)
        .store((key.len() as u32) | ((height as u32) << 16), Ordering::Relaxed);
    arena
        .atomic_u64(node)
        .store(encode_value(val_off, val_size), Ordering::Relaxed);
    for level in 0..height {
        arena
            .atomic_u32(node + NODE_HEADER as u32 + (level as u32) * 4)
            .store(0, Ordering::Relaxed);
    }
    Ok(node)
}

fn random_height() -> usize {
    let mut rng = rand::thread_rng();
    let mut h = 1;
    while h < MAX_HEIGHT && rng.gen::<u32>() < HEIGHT_INCREASE {
        h += 1;
    }
    h
}

fn encode_value(off: u32, size: u32) -> u64 {
    ((off as u64) << 32) | size as u64
}

fn decode_value(v: u64) -> (u32, u32) {
    ((v >> 32) as u32, v as u32)
}

fn non_nil(off: u32) -> Option<u32> {
    if off == 0 {
        None
    } else {
        Some(off)
    }
}

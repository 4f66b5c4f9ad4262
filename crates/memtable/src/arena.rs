//! Offset-addressed bump allocator backing the skip list.
//!
//! The arena exposes a single logical address space of `u32` offsets made of
//! chunks laid end to end. Allocation is a lock-free `fetch_add` on the
//! current chunk's cursor; only when a chunk is exhausted does a thread take
//! the growth mutex and append a new chunk. Chunks are never moved or freed
//! while the arena lives, so every offset handed out stays valid and every
//! slice borrowed from the arena stays readable.
//!
//! Offset 0 is never handed out and serves as the nil pointer.
//!
//! All `unsafe` of the memtable crate lives in this file.

use std::ptr;
use std::sync::atomic::{AtomicPtr, AtomicU32, AtomicU64, AtomicUsize, Ordering};

use codec::{Error, Result, ValueStruct};
use parking_lot::Mutex;

/// Tallest tower a node may have.
pub const MAX_HEIGHT: usize = 20;

/// `value: u64 | key_offset: u32 | key_size: u16 | height: u16`
pub(crate) const NODE_HEADER: usize = 16;
/// A node with a full tower.
pub const MAX_NODE_SIZE: usize = NODE_HEADER + MAX_HEIGHT * 4;

const NODE_ALIGN: usize = 8;
const MAX_CHUNKS: usize = 48;
const MAX_CHUNK_SIZE: usize = 1 << 30;
const ADDRESS_LIMIT: u64 = u32::MAX as u64;

/// Fixed layout of a value cell inside the arena: `meta | expires_at LE | value`.
const VAL_HEADER: usize = 1 + 8;

struct Chunk {
    base: u64,
    len: usize,
    data: *mut u64,
    words: usize,
    used: AtomicUsize,
}

impl Chunk {
    fn alloc(base: u64, len: usize) -> Box<Chunk> {
        let words = (len + 7) / 8;
        let buf: Box<[u64]> = vec![0u64; words].into_boxed_slice();
        let data = Box::into_raw(buf) as *mut u64;
        Box::new(Chunk {
            base,
            len: words * 8,
            data,
            words,
            used: AtomicUsize::new(0),
        })
    }

    fn end(&self) -> u64 {
        self.base + self.len as u64
    }

    fn contains(&self, off: u64, len: usize) -> bool {
        off >= self.base && off + len as u64 <= self.end()
    }

    /// Caller guarantees `contains(off, _)`.
    unsafe fn ptr_at(&self, off: u64) -> *mut u8 {
        (self.data as *mut u8).add((off - self.base) as usize)
    }
}

impl Drop for Chunk {
    fn drop(&mut self) {
        // SAFETY: `data`/`words` came from `Box::into_raw` of a boxed slice
        // of exactly `words` elements in `Chunk::alloc`.
        unsafe {
            drop(Box::from_raw(ptr::slice_from_raw_parts_mut(
                self.data, self.words,
            )));
        }
    }
}

/// Growable, non-relocating arena addressed by `u32` offsets.
pub struct Arena {
    chunks: Vec<AtomicPtr<Chunk>>,
    current: AtomicUsize,
    allocated: AtomicUsize,
    grow_lock: Mutex<()>,
}

impl Arena {
    /// Creates an arena whose first chunk holds `initial_size` bytes.
    ///
    /// A memtable sized below `initial_size` never triggers growth.
    pub fn new(initial_size: usize) -> Self {
        let size = initial_size.clamp(MAX_NODE_SIZE * 4, MAX_CHUNK_SIZE);
        let first = Chunk::alloc(0, size);
        // Reserve the first word so no allocation ever starts at offset 0.
        first.used.store(NODE_ALIGN, Ordering::Relaxed);

        let chunks: Vec<AtomicPtr<Chunk>> = (0..MAX_CHUNKS)
            .map(|_| AtomicPtr::new(ptr::null_mut()))
            .collect();
        chunks[0].store(Box::into_raw(first), Ordering::Release);

        Self {
            chunks,
            current: AtomicUsize::new(0),
            allocated: AtomicUsize::new(NODE_ALIGN),
            grow_lock: Mutex::new(()),
        }
    }

    /// Bytes handed out so far, including alignment padding.
    #[must_use]
    pub fn size(&self) -> usize {
        self.allocated.load(Ordering::Relaxed)
    }

    /// Number of chunks backing the address space.
    #[must_use]
    pub fn chunk_count(&self) -> usize {
        self.current.load(Ordering::Acquire) + 1
    }

    /// Reserves `size` bytes aligned to `align` (at most 8) and returns the offset.
    pub fn allocate(&self, size: usize, align: usize) -> Result<u32> {
        debug_assert!(align.is_power_of_two() && align <= NODE_ALIGN);
        let need = size + align - 1;
        if need > MAX_CHUNK_SIZE {
            return Err(Error::CapacityExceeded(format!(
                "arena allocation of {} bytes exceeds chunk limit",
                size
            )));
        }

        loop {
            let idx = self.current.load(Ordering::Acquire);
            let chunk = self.chunk(idx);
            let start = chunk.used.fetch_add(need, Ordering::AcqRel);
            if start + need <= chunk.len {
                let mask = align as u64 - 1;
                let aligned = (chunk.base + start as u64 + mask) & !mask;
                self.allocated.fetch_add(need, Ordering::Relaxed);
                return Ok(aligned as u32);
            }
            self.grow(idx, need)?;
        }
    }

    /// Appends a chunk after `idx` unless another thread already did.
    fn grow(&self, idx: usize, need: usize) -> Result<()> {
        let _guard = self.grow_lock.lock();
        if self.current.load(Ordering::Acquire) != idx {
            return Ok(());
        }

        let next = idx + 1;
        if next >= MAX_CHUNKS {
            return Err(Error::CapacityExceeded("arena chunk table is full".into()));
        }

        let old = self.chunk(idx);
        let base = old.end();
        let want = round_up8((old.len * 2).max(need)).min(MAX_CHUNK_SIZE);
        let room = (ADDRESS_LIMIT.saturating_sub(base) as usize) & !(NODE_ALIGN - 1);
        let len = want.min(room);
        if len < need {
            return Err(Error::CapacityExceeded(
                "arena address space exhausted".into(),
            ));
        }

        let chunk = Chunk::alloc(base, len);
        self.chunks[next].store(Box::into_raw(chunk), Ordering::Release);
        self.current.store(next, Ordering::Release);
        Ok(())
    }

    fn chunk(&self, idx: usize) -> &Chunk {
        let p = self.chunks[idx].load(Ordering::Acquire);
        debug_assert!(!p.is_null());
        // SAFETY: slots up to `current` are published before `current` moves
        // and stay alive until the arena is dropped.
        unsafe { &*p }
    }

    fn locate(&self, off: u64, len: usize) -> &Chunk {
        let last = self.current.load(Ordering::Acquire);
        for idx in (0..=last).rev() {
            let chunk = self.chunk(idx);
            if chunk.contains(off, len) {
                return chunk;
            }
        }
        panic!("arena access at {}+{} is out of bounds", off, len);
    }

    fn bytes(&self, off: u32, len: usize) -> &[u8] {
        if len == 0 {
            return &[];
        }
        let chunk = self.locate(off as u64, len);
        // SAFETY: the range lies inside one live chunk and was fully written
        // before its offset was published to readers.
        unsafe { std::slice::from_raw_parts(chunk.ptr_at(off as u64), len) }
    }

    fn write(&self, off: u32, src: &[u8]) {
        if src.is_empty() {
            return;
        }
        let chunk = self.locate(off as u64, src.len());
        // SAFETY: `off` was just returned by `allocate` for `src.len()` bytes,
        // so no other thread can observe this range yet.
        unsafe { ptr::copy_nonoverlapping(src.as_ptr(), chunk.ptr_at(off as u64), src.len()) }
    }

    /// Allocates a node with a tower of `height` links.
    pub fn put_node(&self, height: usize) -> Result<u32> {
        let size = MAX_NODE_SIZE - (MAX_HEIGHT - height) * 4;
        self.allocate(size, NODE_ALIGN)
    }

    /// Copies `key` into the arena.
    pub fn put_key(&self, key: &[u8]) -> Result<u32> {
        let off = self.allocate(key.len(), 1)?;
        self.write(off, key);
        Ok(off)
    }

    /// Copies a value cell into the arena, returning `(offset, size)`.
    pub fn put_val(&self, v: &ValueStruct) -> Result<(u32, u32)> {
        let size = VAL_HEADER + v.value.len();
        let size32 = u32::try_from(size)
            .map_err(|_| Error::InvalidArgument(format!("value of {} bytes is too large", size)))?;
        let off = self.allocate(size, 1)?;
        let mut header = [0u8; VAL_HEADER];
        header[0] = v.meta;
        header[1..].copy_from_slice(&v.expires_at.to_le_bytes());
        self.write(off, &header);
        self.write(off + VAL_HEADER as u32, &v.value);
        Ok((off, size32))
    }

    pub fn get_key(&self, off: u32, size: u16) -> &[u8] {
        self.bytes(off, size as usize)
    }

    /// Decodes the value cell at `off`. The version is left at 0.
    pub fn get_val(&self, off: u32, size: u32) -> ValueStruct {
        let buf = self.bytes(off, size as usize);
        assert!(buf.len() >= VAL_HEADER, "arena value cell at {} is truncated", off);
        let mut expires = [0u8; 8];
        expires.copy_from_slice(&buf[1..VAL_HEADER]);
        ValueStruct {
            meta: buf[0],
            value: buf[VAL_HEADER..].to_vec(),
            expires_at: u64::from_le_bytes(expires),
            version: 0,
        }
    }

    pub fn atomic_u32(&self, off: u32) -> &AtomicU32 {
        assert!(off % 4 == 0, "unaligned u32 access at {}", off);
        let chunk = self.locate(off as u64, 4);
        // SAFETY: in bounds, 4-aligned (chunk bases are 8-aligned), and all
        // concurrent accesses to node fields go through atomics.
        unsafe { &*(chunk.ptr_at(off as u64) as *const AtomicU32) }
    }

    pub fn atomic_u64(&self, off: u32) -> &AtomicU64 {
        assert!(off % 8 == 0, "unaligned u64 access at {}", off);
        let chunk = self.locate(off as u64, 8);
        // SAFETY: as for `atomic_u32`, with 8-byte alignment.
        unsafe { &*(chunk.ptr_at(off as u64) as *const AtomicU64) }
    }
}

impl Drop for Arena {
    fn drop(&mut self) {
        for slot in &self.chunks {
            let p = slot.swap(ptr::null_mut(), Ordering::AcqRel);
            if !p.is_null() {
                // SAFETY: produced by `Box::into_raw` and released exactly once here.
                unsafe { drop(Box::from_raw(p)) };
            }
        }
    }
}

impl std::fmt::Debug for Arena {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Arena")
            .field("allocated", &self.size())
            .field("chunks", &self.chunk_count())
            .finish()
    }
}

fn round_up8(n: usize) -> usize {
    (n + 7) & !7
}

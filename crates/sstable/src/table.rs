use std::cmp::Ordering as CmpOrdering;
use std::fs::{self, File};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use cache::Cache;
use codec::{check_internal_key, compare_keys, parse_key, parse_version, same_key};
use codec::{Error, Result, ValueStruct};
use memmap2::Mmap;

use crate::format::{crc32, read_trailer, Block, TableIndex};

/// Shared cache of decoded data blocks, keyed by table id and block index.
pub type BlockCache = Cache<Arc<Block>>;

/// Smallest possible file: empty index length, checksum and checksum length.
const MIN_TABLE_SIZE: u64 = 12;

/// An open, memory-mapped SSTable.
///
/// Tables are shared as `Arc<Table>`; every reader and iterator holds a
/// clone, so the mapping lives as long as the last user. Compaction marks
/// superseded tables obsolete and the file is removed when the last
/// reference is dropped.
pub struct Table {
    fid: u64,
    path: PathBuf,
    mmap: Mmap,
    index: TableIndex,
    checksum: u32,
    min_key: Vec<u8>,
    max_key: Vec<u8>,
    cache: Option<Arc<BlockCache>>,
    obsolete: AtomicBool,
}

impl Table {
    /// Maps `path` and validates its trailer and index.
    ///
    /// # Errors
    ///
    /// A truncated file, a checksum mismatch or a malformed index is
    /// [`Error::Corruption`].
    pub fn open(path: &Path, fid: u64, cache: Option<Arc<BlockCache>>) -> Result<Self> {
        let file = File::open(path)?;
        let len = file.metadata()?.len();
        if len < MIN_TABLE_SIZE {
            return Err(Error::Corruption(format!(
                "table {} is truncated ({} bytes)",
                path.display(),
                len
            )));
        }
        // SAFETY: table files are written once, renamed into place and never
        // modified afterwards; the mapping is read-only.
        let mmap = unsafe { Mmap::map(&file)? };

        let (index_bytes, index_start) = read_trailer(&mmap)?;
        let checksum = crc32(index_bytes);
        let index = TableIndex::decode(index_bytes)?;
        if index.blocks.is_empty() {
            return Err(Error::corruption("table index lists no blocks"));
        }
        for h in &index.blocks {
            check_internal_key(&h.first_key)?;
            let end = h.offset as u64 + h.size as u64;
            if end > index_start as u64 {
                return Err(Error::Corruption(format!(
                    "block at {} overruns the data section",
                    h.offset
                )));
            }
        }

        let min_key = index.blocks[0].first_key.clone();
        let mut table = Self {
            fid,
            path: path.to_path_buf(),
            mmap,
            index,
            checksum,
            min_key,
            max_key: Vec::new(),
            cache,
            obsolete: AtomicBool::new(false),
        };

        // The index only records first keys; the true maximum comes from the
        // last entry of the last block.
        let last = table.read_block(table.index.blocks.len() - 1)?;
        table.max_key = last.key(last.len() - 1).to_vec();
        Ok(table)
    }

    #[must_use]
    pub fn fid(&self) -> u64 {
        self.fid
    }

    /// CRC32 of the index, as stored in the trailer.
    #[must_use]
    pub fn checksum(&self) -> u32 {
        self.checksum
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Smallest internal key in the table.
    pub fn min_key(&self) -> &[u8] {
        &self.min_key
    }

    /// Largest internal key in the table.
    pub fn max_key(&self) -> &[u8] {
        &self.max_key
    }

    /// File size in bytes.
    #[must_use]
    pub fn size(&self) -> u64 {
        self.mmap.len() as u64
    }

    #[must_use]
    pub fn stale_data_size(&self) -> u64 {
        self.index.stale_data_size as u64
    }

    #[must_use]
    pub fn max_version(&self) -> u64 {
        self.index.max_version
    }

    #[must_use]
    pub fn key_count(&self) -> u32 {
        self.index.key_count
    }

    #[must_use]
    pub fn block_count(&self) -> usize {
        self.index.blocks.len()
    }

    #[must_use]
    pub fn has_bloom(&self) -> bool {
        self.index.bloom.is_some()
    }

    /// Bloom check on a raw key. Always true when the table has no filter.
    #[must_use]
    pub fn may_contain(&self, raw_key: &[u8]) -> bool {
        match &self.index.bloom {
            Some(bf) => bf.may_contain(raw_key),
            None => true,
        }
    }

    /// True if the raw key range `[min, max]` intersects this table.
    #[must_use]
    pub fn overlaps(&self, min: &[u8], max: &[u8]) -> bool {
        parse_key(&self.min_key) <= parse_key(max) && parse_key(min) <= parse_key(&self.max_key)
    }

    /// Schedules the file for deletion once the last reference is dropped.
    pub fn mark_obsolete(&self) {
        self.obsolete.store(true, Ordering::Release);
    }

    /// Newest version of the raw key of `key` at or below its version.
    pub fn get(&self, key: &[u8]) -> Result<Option<ValueStruct>> {
        check_internal_key(key)?;
        if !self.may_contain(parse_key(key)) {
            return Ok(None);
        }
        let (_, block, entry) = match self.seek_ge(key)? {
            Some(pos) => pos,
            None => return Ok(None),
        };
        let found = block.key(entry);
        if !same_key(found, key) {
            return Ok(None);
        }
        let mut vs = ValueStruct::decode(block.value(entry))?;
        vs.version = parse_version(found);
        Ok(Some(vs))
    }

    /// Position of the first entry `>= key`, or `None` past the end.
    pub(crate) fn seek_ge(&self, key: &[u8]) -> Result<Option<(usize, Arc<Block>, usize)>> {
        let mut idx = self.block_for(key).unwrap_or(0);
        loop {
            let block = self.block(idx)?;
            let entry = lower_bound(&block, key);
            if entry < block.len() {
                return Ok(Some((idx, block, entry)));
            }
            idx += 1;
            if idx >= self.block_count() {
                return Ok(None);
            }
        }
    }

    /// Position of the last entry `<= key`, or `None` before the start.
    pub(crate) fn seek_le(&self, key: &[u8]) -> Result<Option<(usize, Arc<Block>, usize)>> {
        let idx = match self.block_for(key) {
            Some(idx) => idx,
            None => return Ok(None),
        };
        let block = self.block(idx)?;
        let upper = block_partition(&block, |k| compare_keys(k, key) != CmpOrdering::Greater);
        match upper.checked_sub(1) {
            Some(entry) => Ok(Some((idx, block, entry))),
            None => Err(Error::Corruption(format!(
                "table {:05} block {} disagrees with its index key",
                self.fid, idx
            ))),
        }
    }

    /// Last block whose first key is `<= key`.
    fn block_for(&self, key: &[u8]) -> Option<usize> {
        let n = self
            .index
            .blocks
            .partition_point(|b| compare_keys(&b.first_key, key) != CmpOrdering::Greater);
        n.checked_sub(1)
    }

    /// Loads block `idx` through the block cache.
    pub fn block(&self, idx: usize) -> Result<Arc<Block>> {
        let key = cache_key(self.fid, idx);
        if let Some(cache) = &self.cache {
            if let Some(block) = cache.get(&key) {
                return Ok(block);
            }
        }
        let block = self.read_block(idx)?;
        if let Some(cache) = &self.cache {
            cache.set(&key, Arc::clone(&block));
        }
        Ok(block)
    }

    fn read_block(&self, idx: usize) -> Result<Arc<Block>> {
        let h = self
            .index
            .blocks
            .get(idx)
            .ok_or_else(|| Error::InvalidArgument(format!("block {} out of range", idx)))?;
        let start = h.offset as usize;
        let raw = &self.mmap[start..start + h.size as usize];
        let block = Block::decode(raw, self.index.compressed()).map_err(|e| match e {
            Error::Corruption(msg) => {
                Error::Corruption(format!("table {:05} block {}: {}", self.fid, idx, msg))
            }
            other => other,
        })?;
        if block.is_empty() {
            return Err(Error::Corruption(format!(
                "table {:05} block {} is empty",
                self.fid, idx
            )));
        }
        Ok(Arc::new(block))
    }
}

impl Drop for Table {
    fn drop(&mut self) {
        if !self.obsolete.load(Ordering::Acquire) {
            return;
        }
        if let Some(cache) = &self.cache {
            for idx in 0..self.index.blocks.len() {
                cache.del(&cache_key(self.fid, idx));
            }
        }
        match fs::remove_file(&self.path) {
            Ok(()) => tracing::debug!(fid = self.fid, "removed obsolete table"),
            Err(e) => tracing::warn!(fid = self.fid, error = %e, "failed to remove obsolete table"),
        }
    }
}

impl std::fmt::Debug for Table {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Table")
            .field("fid", &self.fid)
            .field("size", &self.size())
            .field("blocks", &self.block_count())
            .field("keys", &self.key_count())
            .finish()
    }
}

fn cache_key(fid: u64, idx: usize) -> [u8; 12] {
    let mut key = [0u8; 12];
    key[..8].copy_from_slice(&fid.to_be_bytes());
    key[8..].copy_from_slice(&(idx as u32).to_be_bytes());
    key
}

/// First entry index `>= key`.
pub(crate) fn lower_bound(block: &Block, key: &[u8]) -> usize {
    block_partition(block, |k| compare_keys(k, key) == CmpOrdering::Less)
}

fn block_partition<F>(block: &Block, pred: F) -> usize
where
    F: Fn(&[u8]) -> bool,
{
    let (mut lo, mut hi) = (0, block.len());
    while lo < hi {
        let mid = lo + (hi - lo) / 2;
        if pred(block.key(mid)) {
            lo = mid + 1;
        } else {
            hi = mid;
        }
    }
    lo
}

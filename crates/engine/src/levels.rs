//! Level manager: the on-disk part of the tree.
//!
//! ```text
//! L0   flushed tables, may overlap, ascending fid (newest last)
//! L1+  disjoint tables sorted by min key, each level `multiplier` x larger
//! ```
//!
//! Every table change goes through the manifest first and is then applied to
//! the in-memory level lists, both under the manifest lock.

use std::cmp::Ordering as CmpOrdering;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use codec::{compare_keys, parse_key, Error, KvIterator, Result, ValueStruct};
use config::Options;
use parking_lot::{Mutex, RwLock};
use sstable::{
    parse_table_file_name, table_file_name, BlockCache, ConcatIterator, Table, TableBuilder,
    TableIterator, TableOptions,
};

use crate::compaction::CompactStatus;
use crate::manifest::Manifest;
use crate::mem_table::MemTable;

/// Per-level numbers reported by [`LevelManager::levels_summary`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LevelSummary {
    pub level: usize,
    pub tables: usize,
    pub size: u64,
    pub stale_size: u64,
}

pub(crate) struct LevelManager {
    pub(crate) dir: PathBuf,
    pub(crate) opts: Options,
    pub(crate) levels: Vec<RwLock<Vec<Arc<Table>>>>,
    pub(crate) manifest: Mutex<Manifest>,
    pub(crate) cache: Option<Arc<BlockCache>>,
    next_fid: AtomicU64,
    pub(crate) status: CompactStatus,
}

impl LevelManager {
    /// Loads the manifest and opens every table it lists. Table files the
    /// manifest does not know about are leftovers of an interrupted flush or
    /// compaction and are removed.
    pub fn open(opts: &Options) -> Result<Self> {
        let dir = opts.work_dir.clone();
        fs::create_dir_all(&dir)?;
        let manifest = Manifest::load_or_create(&dir)?;
        let cache = (opts.cache_size > 0).then(|| Arc::new(BlockCache::new(opts.cache_size)));

        let mut levels: Vec<Vec<Arc<Table>>> = vec![Vec::new(); opts.max_level_num];
        let mut max_fid = 0;
        for meta in &manifest.entries {
            if meta.level >= levels.len() {
                return Err(Error::InvalidArgument(format!(
                    "table {:05} is at level {} but only {} levels are configured",
                    meta.fid, meta.level, opts.max_level_num
                )));
            }
            let path = dir.join(table_file_name(meta.fid));
            if !path.exists() {
                return Err(Error::Corruption(format!(
                    "manifest lists missing table {}",
                    path.display()
                )));
            }
            let table = Table::open(&path, meta.fid, cache.clone())?;
            if table.checksum() != meta.checksum {
                return Err(Error::Corruption(format!(
                    "table {} has index checksum {:08x}, manifest expects {:08x}",
                    path.display(),
                    table.checksum(),
                    meta.checksum
                )));
            }
            levels[meta.level].push(Arc::new(table));
            max_fid = max_fid.max(meta.fid);
        }
        for (level, tables) in levels.iter_mut().enumerate() {
            sort_level(level, tables);
        }

        let known: Vec<u64> = manifest.entries.iter().map(|e| e.fid).collect();
        remove_stray_tables(&dir, &known)?;

        let next_fid = manifest.next_fid.max(max_fid + 1).max(1);
        tracing::info!(
            tables = known.len(),
            next_fid,
            dir = %dir.display(),
            "levels loaded"
        );

        Ok(Self {
            status: CompactStatus::new(opts.max_level_num),
            levels: levels.into_iter().map(RwLock::new).collect(),
            manifest: Mutex::new(manifest),
            next_fid: AtomicU64::new(next_fid),
            opts: opts.clone(),
            cache,
            dir,
        })
    }

    pub(crate) fn table_options(&self) -> TableOptions {
        TableOptions {
            block_size: self.opts.block_size,
            bloom_false_positive: self.opts.bloom_false_positive,
            compression: self.opts.compression,
            table_size: self.opts.sstable_max_size as usize,
        }
    }

    /// Hands out a file id shared by tables and WALs.
    pub fn reserve_fid(&self) -> u64 {
        self.next_fid.fetch_add(1, Ordering::SeqCst)
    }

    /// Makes sure ids below `fid` are never handed out.
    pub fn bump_fid(&self, fid: u64) {
        self.next_fid.fetch_max(fid, Ordering::SeqCst);
    }

    pub(crate) fn next_fid(&self) -> u64 {
        self.next_fid.load(Ordering::SeqCst)
    }

    /// Highest version stored in any table.
    pub fn max_version(&self) -> u64 {
        self.levels
            .iter()
            .flat_map(|l| l.read().iter().map(|t| t.max_version()).collect::<Vec<_>>())
            .max()
            .unwrap_or(0)
    }

    /// Newest value of the raw key of `key` at or below its version.
    ///
    /// A level without the key moves the search one level down; any other
    /// error stops it.
    pub fn get(&self, key: &[u8]) -> Result<ValueStruct> {
        for level in 0..self.levels.len() {
            let found = if level == 0 {
                self.get_level_zero(key)
            } else {
                self.get_sorted_level(level, key)
            };
            match found {
                Err(Error::NotFound) => continue,
                other => return other,
            }
        }
        Err(Error::NotFound)
    }

    fn get_level_zero(&self, key: &[u8]) -> Result<ValueStruct> {
        let tables = self.levels[0].read().clone();
        for table in tables.iter().rev() {
            if let Some(vs) = table.get(key)? {
                return Ok(vs);
            }
        }
        Err(Error::NotFound)
    }

    fn get_sorted_level(&self, level: usize, key: &[u8]) -> Result<ValueStruct> {
        let table = {
            let tables = self.levels[level].read();
            let raw = parse_key(key);
            let idx = tables.partition_point(|t| parse_key(t.max_key()) < raw);
            match tables.get(idx) {
                Some(t) if parse_key(t.min_key()) <= raw => Arc::clone(t),
                _ => return Err(Error::NotFound),
            }
        };
        table.get(key)?.ok_or(Error::NotFound)
    }

    /// Writes `mem` to a level 0 table named after its fid and records it.
    /// An empty memtable produces no table.
    pub fn flush(&self, mem: &MemTable) -> Result<()> {
        if mem.is_empty() {
            return Ok(());
        }
        let now = codec::now_secs();
        let mut builder = TableBuilder::new(self.table_options());
        let mut it = mem.iter(false);
        it.rewind();
        let mut prev_raw: Vec<u8> = Vec::new();
        let mut first = true;
        while it.valid() {
            let key = it.key();
            let vs = it.value();
            let older = !first && parse_key(key) == prev_raw.as_slice();
            builder.add(key, &vs, older || vs.is_deleted_or_expired(now));
            if !older {
                prev_raw.clear();
                prev_raw.extend_from_slice(parse_key(key));
            }
            first = false;
            it.next();
        }

        let fid = mem.fid();
        let path = self.dir.join(table_file_name(fid));
        let size = builder.finish(&path)?;
        let table = Arc::new(Table::open(&path, fid, self.cache.clone())?);

        let mut manifest = self.manifest.lock();
        let backup = manifest.clone();
        manifest.add(fid, 0, table.checksum());
        manifest.next_fid = self.next_fid();
        if let Err(e) = manifest.save() {
            *manifest = backup;
            table.mark_obsolete();
            return Err(e);
        }
        self.levels[0].write().push(Arc::clone(&table));
        drop(manifest);

        tracing::info!(
            fid,
            size,
            keys = table.key_count(),
            "memtable flushed to level 0"
        );
        Ok(())
    }

    /// One iterator per table in level 0 (newest first) and one per deeper
    /// level, in lookup order.
    pub fn iterators(&self, reversed: bool) -> Vec<Box<dyn KvIterator + Send>> {
        let mut out: Vec<Box<dyn KvIterator + Send>> = Vec::new();
        for table in self.levels[0].read().iter().rev() {
            out.push(Box::new(TableIterator::new(Arc::clone(table), reversed)));
        }
        for level in &self.levels[1..] {
            let tables = level.read().clone();
            if !tables.is_empty() {
                out.push(Box::new(ConcatIterator::new(tables, reversed)));
            }
        }
        out
    }

    /// True if any level below `level` holds the raw key of `key`.
    pub(crate) fn overlaps_below(&self, level: usize, key: &[u8]) -> bool {
        self.levels[level + 1..].iter().any(|l| {
            let tables = l.read();
            let raw = parse_key(key);
            let idx = tables.partition_point(|t| parse_key(t.max_key()) < raw);
            tables.get(idx).map_or(false, |t| t.overlaps(key, key))
        })
    }

    /// True if the manifest lists table `fid`.
    pub fn has_table(&self, fid: u64) -> bool {
        self.manifest.lock().entries.iter().any(|e| e.fid == fid)
    }

    pub fn table_count(&self, level: usize) -> usize {
        self.levels.get(level).map_or(0, |l| l.read().len())
    }

    pub fn levels_summary(&self) -> Vec<LevelSummary> {
        self.levels
            .iter()
            .enumerate()
            .map(|(level, tables)| {
                let tables = tables.read();
                LevelSummary {
                    level,
                    tables: tables.len(),
                    size: tables.iter().map(|t| t.size()).sum(),
                    stale_size: tables.iter().map(|t| t.stale_data_size()).sum(),
                }
            })
            .collect()
    }

    /// Sum of key counts over all tables, older versions included.
    pub fn key_count(&self) -> u64 {
        self.levels
            .iter()
            .map(|l| l.read().iter().map(|t| t.key_count() as u64).sum::<u64>())
            .sum()
    }

    /// Persists the manifest and releases every table and cached block.
    pub fn close(&self) -> Result<()> {
        {
            let mut manifest = self.manifest.lock();
            manifest.next_fid = self.next_fid();
            manifest.save()?;
        }
        for level in &self.levels {
            level.write().clear();
        }
        if let Some(cache) = &self.cache {
            cache.clear();
        }
        Ok(())
    }
}

/// Level 0 by fid, deeper levels by min key.
pub(crate) fn sort_level(level: usize, tables: &mut [Arc<Table>]) {
    if level == 0 {
        tables.sort_by_key(|t| t.fid());
    } else {
        tables.sort_by(|a, b| compare_keys(a.min_key(), b.min_key()));
    }
}

pub(crate) fn check_disjoint(tables: &[Arc<Table>]) -> bool {
    tables
        .windows(2)
        .all(|w| compare_keys(w[0].max_key(), w[1].min_key()) == CmpOrdering::Less)
}

fn remove_stray_tables(dir: &Path, known: &[u64]) -> Result<()> {
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let name = entry.file_name();
        let name = match name.to_str() {
            Some(n) => n,
            None => continue,
        };
        let stray = match parse_table_file_name(name) {
            Some(fid) => !known.contains(&fid),
            None => name.ends_with(".sst.tmp"),
        };
        if stray {
            tracing::warn!(file = name, "removing table not listed in the manifest");
            fs::remove_file(entry.path())?;
        }
    }
    Ok(())
}

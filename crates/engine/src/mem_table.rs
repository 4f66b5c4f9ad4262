//! One memtable generation: a skip list plus the WAL that backs it.
//!
//! Generation `fid` logs to `{fid:05}.wal` and, once flushed, becomes table
//! `{fid:05}.sst`. The WAL is deleted only after that table is recorded in
//! the manifest.

use std::fs::{self, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use codec::{key_with_version, Entry, Result, ValueStruct};
use memtable::{SkipList, UniIterator, MAX_NODE_SIZE};
use parking_lot::Mutex;
use wal::{WalReader, WalWriter};

pub fn wal_file_name(fid: u64) -> String {
    format!("{:05}.wal", fid)
}

pub fn parse_wal_file_name(name: &str) -> Option<u64> {
    name.strip_suffix(".wal")?.parse().ok()
}

pub(crate) struct MemTable {
    fid: u64,
    list: Arc<SkipList>,
    /// `None` once the generation is sealed.
    wal: Mutex<Option<WalWriter>>,
    wal_path: PathBuf,
}

/// What replaying one WAL produced.
pub(crate) struct Recovered {
    pub mem: MemTable,
    pub max_version: u64,
    pub records: usize,
}

impl MemTable {
    /// Starts a fresh generation with an empty WAL.
    pub fn create(dir: &Path, fid: u64, arena_size: usize, sync: bool) -> Result<Self> {
        let wal_path = dir.join(wal_file_name(fid));
        let writer = WalWriter::create(&wal_path, sync)?;
        Ok(Self {
            fid,
            list: Arc::new(SkipList::new(arena_size)?),
            wal: Mutex::new(Some(writer)),
            wal_path,
        })
    }

    /// Rebuilds a sealed generation from its WAL, cutting off a torn tail.
    pub fn recover(dir: &Path, fid: u64, arena_size: usize) -> Result<Recovered> {
        let wal_path = dir.join(wal_file_name(fid));
        let list = Arc::new(SkipList::new(arena_size)?);
        let mut max_version = 0;
        let mut failed = None;

        let stats = WalReader::open(&wal_path)?.replay(|entry| {
            if failed.is_some() {
                return;
            }
            max_version = max_version.max(entry.version);
            let key = key_with_version(&entry.key, entry.version);
            if let Err(e) = list.add(&key, &entry.value_struct()) {
                failed = Some(e);
            }
        })?;
        if let Some(e) = failed {
            return Err(e);
        }

        if stats.truncated_tail {
            tracing::warn!(
                fid,
                valid_len = stats.valid_len,
                "discarding damaged wal tail"
            );
            let f = OpenOptions::new().write(true).open(&wal_path)?;
            f.set_len(stats.valid_len)?;
            f.sync_all()?;
        }

        Ok(Recovered {
            mem: Self {
                fid,
                list,
                wal: Mutex::new(None),
                wal_path,
            },
            max_version,
            records: stats.records,
        })
    }

    pub fn fid(&self) -> u64 {
        self.fid
    }

    /// Logs `entry` and inserts it. `entry.version` must already be set.
    pub fn set(&self, entry: &Entry) -> Result<()> {
        if let Some(w) = self.wal.lock().as_mut() {
            w.append(entry)?;
        }
        self.list
            .add(&key_with_version(&entry.key, entry.version), &entry.value_struct())
    }

    /// Newest version of the raw key of `key` at or below its version.
    pub fn get(&self, key: &[u8]) -> Option<ValueStruct> {
        self.list.get(key)
    }

    pub fn is_empty(&self) -> bool {
        self.list.is_empty()
    }

    pub fn len(&self) -> usize {
        self.list.len()
    }

    pub fn mem_size(&self) -> usize {
        self.list.mem_size()
    }

    /// True if adding `entry` would take the arena past `limit`.
    pub fn is_full(&self, entry: &Entry, limit: usize) -> bool {
        // Node tower, key with version, value cell header and alignment slack.
        let need = MAX_NODE_SIZE + entry.estimate_size() + 16;
        !self.is_empty() && self.mem_size() + need > limit
    }

    pub fn iter(&self, reversed: bool) -> UniIterator {
        UniIterator::new(Arc::clone(&self.list), reversed)
    }

    /// Syncs and closes the WAL writer; later `set`s only touch the list.
    pub fn seal(&self) -> Result<()> {
        if let Some(mut w) = self.wal.lock().take() {
            w.sync_to_disk()?;
        }
        Ok(())
    }

    pub fn sync_wal(&self) -> Result<()> {
        if let Some(w) = self.wal.lock().as_mut() {
            w.sync_to_disk()?;
        }
        Ok(())
    }

    /// Removes the WAL once the generation is durable elsewhere.
    pub fn delete_wal(&self) -> Result<()> {
        self.wal.lock().take();
        match fs::remove_file(&self.wal_path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

impl std::fmt::Debug for MemTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemTable")
            .field("fid", &self.fid)
            .field("entries", &self.len())
            .field("mem_size", &self.mem_size())
            .finish()
    }
}

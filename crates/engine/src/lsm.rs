//! The LSM tree: one mutable memtable, a queue of immutables waiting for
//! flush, and the levels below them.
//!
//! ```text
//! write:  write_lock -> (rotate?) -> WAL append -> skip list insert
//! read:   mutable -> immutables (newest first) -> L0 (newest first) -> L1..
//! flush:  oldest immutable -> L0 table -> manifest -> pop -> delete WAL
//! ```
//!
//! Writers are serialized by `write_lock`; readers never take it. When
//! `num_memtables - 1` immutables are already queued a writer waits on
//! `flushed` for up to `write_stall_timeout` before giving up.

use std::collections::VecDeque;
use std::fs;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use codec::{key_with_version, Entry, Error, KvIterator, Result, ValueStruct};
use config::Options;
use crossbeam::channel::{self, Receiver, Sender};
use parking_lot::{Condvar, Mutex, MutexGuard, RwLock};

use crate::levels::LevelManager;
use crate::mem_table::{parse_wal_file_name, wal_file_name, MemTable};
use crate::stats::Counters;

struct MemState {
    mutable: Arc<MemTable>,
    /// Oldest first.
    immutables: VecDeque<Arc<MemTable>>,
}

pub(crate) struct Lsm {
    opts: Options,
    dir: PathBuf,
    pub(crate) levels: LevelManager,
    state: RwLock<MemState>,
    write_lock: Mutex<()>,
    flush_lock: Mutex<()>,
    flushed: Condvar,
    version: AtomicU64,
    flush_tx: Sender<()>,
    flush_rx: Receiver<()>,
    pub(crate) counters: Counters,
}

impl Lsm {
    /// Loads the levels and replays every WAL left in the work directory.
    /// Replayed generations are queued for flush behind a fresh memtable.
    pub fn open(opts: &Options) -> Result<Self> {
        let dir = opts.work_dir.clone();
        let levels = LevelManager::open(opts)?;

        let mut wal_fids = Vec::new();
        for entry in fs::read_dir(&dir)? {
            let entry = entry?;
            if let Some(fid) = entry.file_name().to_str().and_then(parse_wal_file_name) {
                wal_fids.push(fid);
            }
        }
        wal_fids.sort_unstable();
        if let Some(&last) = wal_fids.last() {
            levels.bump_fid(last + 1);
        }

        let mut max_version = levels.max_version();
        let mut immutables = VecDeque::new();
        for fid in wal_fids {
            if levels.has_table(fid) {
                // Flushed, but the WAL was not removed before the crash.
                fs::remove_file(dir.join(wal_file_name(fid)))?;
                continue;
            }
            let recovered = MemTable::recover(&dir, fid, opts.mem_table_size)?;
            max_version = max_version.max(recovered.max_version);
            if recovered.mem.is_empty() {
                recovered.mem.delete_wal()?;
                continue;
            }
            tracing::info!(fid, records = recovered.records, "replayed wal");
            immutables.push_back(Arc::new(recovered.mem));
        }

        let mutable = MemTable::create(
            &dir,
            levels.reserve_fid(),
            opts.mem_table_size,
            opts.wal_sync,
        )?;
        let (flush_tx, flush_rx) = channel::bounded(1);
        if !immutables.is_empty() {
            let _ = flush_tx.try_send(());
        }
        tracing::info!(
            version = max_version,
            immutables = immutables.len(),
            "lsm opened"
        );

        Ok(Self {
            opts: opts.clone(),
            dir,
            levels,
            state: RwLock::new(MemState {
                mutable: Arc::new(mutable),
                immutables,
            }),
            write_lock: Mutex::new(()),
            flush_lock: Mutex::new(()),
            flushed: Condvar::new(),
            version: AtomicU64::new(max_version),
            flush_tx,
            flush_rx,
            counters: Counters::default(),
        })
    }

    /// Fires whenever a memtable is queued for flush.
    pub fn flush_signal(&self) -> &Receiver<()> {
        &self.flush_rx
    }

    pub fn version(&self) -> u64 {
        self.version.load(Ordering::SeqCst)
    }

    /// Stamps `entry` with the next version and writes it.
    pub fn set(&self, entry: Entry) -> Result<()> {
        let mut guard = self.write_lock.lock();
        self.write_locked(&mut guard, entry)
    }

    /// Reads the newest value of `key` and writes whatever `f` returns, with
    /// no other write in between. Returns whether anything was written.
    pub fn set_with<F>(&self, key: &[u8], f: F) -> Result<bool>
    where
        F: FnOnce(Option<ValueStruct>) -> Option<Entry>,
    {
        let mut guard = self.write_lock.lock();
        let current = match self.get(key) {
            Ok(vs) => Some(vs),
            Err(Error::NotFound) => None,
            Err(e) => return Err(e),
        };
        match f(current) {
            Some(entry) => {
                self.write_locked(&mut guard, entry)?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    fn write_locked(&self, guard: &mut MutexGuard<'_, ()>, mut entry: Entry) -> Result<()> {
        self.make_room(guard, &entry)?;
        entry.version = self.version.fetch_add(1, Ordering::SeqCst) + 1;
        let mem = Arc::clone(&self.state.read().mutable);
        mem.set(&entry)
    }

    /// Rotates the mutable memtable if `entry` does not fit, waiting for a
    /// free immutable slot first.
    fn make_room(&self, guard: &mut MutexGuard<'_, ()>, entry: &Entry) -> Result<()> {
        let full = self
            .state
            .read()
            .mutable
            .is_full(entry, self.opts.mem_table_size);
        if !full {
            return Ok(());
        }

        let slots = self.opts.num_memtables.saturating_sub(1).max(1);
        let deadline = Instant::now() + self.opts.write_stall_timeout;
        let mut stalled = false;
        loop {
            let queued = self.state.read().immutables.len();
            if queued < slots {
                break;
            }
            if !stalled {
                stalled = true;
                Counters::bump(&self.counters.stalls);
                tracing::debug!(queued, "write stalled waiting for flush");
                let _ = self.flush_tx.try_send(());
            }
            if self.flushed.wait_until(guard, deadline).timed_out()
                && self.state.read().immutables.len() >= slots
            {
                return Err(Error::CapacityExceeded(format!(
                    "{} memtables waiting for flush after {:?}",
                    queued, self.opts.write_stall_timeout
                )));
            }
        }
        self.rotate()
    }

    /// Seals the mutable memtable and queues it. Caller holds `write_lock`.
    fn rotate(&self) -> Result<()> {
        let fid = self.levels.reserve_fid();
        let fresh = Arc::new(MemTable::create(
            &self.dir,
            fid,
            self.opts.mem_table_size,
            self.opts.wal_sync,
        )?);
        let current = Arc::clone(&self.state.read().mutable);
        current.seal()?;
        let mut state = self.state.write();
        let old = std::mem::replace(&mut state.mutable, fresh);
        tracing::debug!(fid = old.fid(), entries = old.len(), "memtable rotated");
        state.immutables.push_back(old);
        drop(state);
        let _ = self.flush_tx.try_send(());
        Ok(())
    }

    /// Newest value of raw `key`, tombstones included.
    pub fn get(&self, key: &[u8]) -> Result<ValueStruct> {
        let lookup = key_with_version(key, u64::MAX);
        let (mutable, immutables) = {
            let state = self.state.read();
            let imms: Vec<Arc<MemTable>> = state.immutables.iter().rev().cloned().collect();
            (Arc::clone(&state.mutable), imms)
        };
        if let Some(vs) = mutable.get(&lookup) {
            return Ok(vs);
        }
        for mem in &immutables {
            if let Some(vs) = mem.get(&lookup) {
                return Ok(vs);
            }
        }
        self.levels.get(&lookup)
    }

    /// Flushes queued immutables, oldest first. Returns how many were flushed.
    pub fn flush_immutables(&self) -> Result<usize> {
        let _flush = self.flush_lock.lock();
        let mut flushed = 0;
        loop {
            let front = match self.state.read().immutables.front() {
                Some(mem) => Arc::clone(mem),
                None => break,
            };
            self.levels.flush(&front)?;
            {
                let _writes = self.write_lock.lock();
                let mut state = self.state.write();
                if state.immutables.front().map(|m| m.fid()) == Some(front.fid()) {
                    state.immutables.pop_front();
                }
            }
            self.flushed.notify_all();
            front.delete_wal()?;
            Counters::bump(&self.counters.flushes);
            flushed += 1;
        }
        Ok(flushed)
    }

    /// Queues the mutable memtable, if it holds anything, and flushes
    /// everything queued.
    pub fn force_flush(&self) -> Result<usize> {
        {
            let _writes = self.write_lock.lock();
            let empty = self.state.read().mutable.is_empty();
            if !empty {
                self.rotate()?;
            }
        }
        self.flush_immutables()
    }

    /// Memtable iterators in lookup order followed by the level iterators.
    pub fn iterators(&self, reversed: bool) -> Vec<Box<dyn KvIterator + Send>> {
        let mut out: Vec<Box<dyn KvIterator + Send>> = Vec::new();
        {
            let state = self.state.read();
            out.push(Box::new(state.mutable.iter(reversed)));
            for mem in state.immutables.iter().rev() {
                out.push(Box::new(mem.iter(reversed)));
            }
        }
        out.extend(self.levels.iterators(reversed));
        out
    }

    /// `(immutables queued, bytes in the mutable memtable, entries in memory)`.
    pub fn memory_usage(&self) -> (usize, usize, u64) {
        let state = self.state.read();
        let entries = state.mutable.len()
            + state.immutables.iter().map(|m| m.len()).sum::<usize>();
        (
            state.immutables.len(),
            state.mutable.mem_size(),
            entries as u64,
        )
    }

    pub fn sync_wal(&self) -> Result<()> {
        let mem = Arc::clone(&self.state.read().mutable);
        mem.sync_wal()
    }

    /// Blocks background flushes until the guard is dropped.
    #[cfg(test)]
    pub(crate) fn pause_flushes(&self) -> MutexGuard<'_, ()> {
        self.flush_lock.lock()
    }

    /// Flushes every memtable and closes the levels.
    pub fn close(&self) -> Result<()> {
        self.force_flush()?;
        {
            let _writes = self.write_lock.lock();
            let state = self.state.read();
            if state.mutable.is_empty() {
                state.mutable.delete_wal()?;
            }
        }
        self.levels.close()
    }
}

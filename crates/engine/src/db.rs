//! The public database handle.

use std::fs;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use codec::{now_secs, Entry, Error, Result, ValuePtr, ValueStruct, BIT_DELETE, BIT_VALUE_POINTER};
use config::Options;
use parking_lot::Mutex;
use sstable::MergeIterator;
use vlog::{GcStats, ValueIndex, ValueLog, VlogOptions};

use crate::closer::{Closer, TaskHandle};
use crate::iterator::{DbIterator, IteratorOptions};
use crate::lsm::Lsm;
use crate::stats::{Counters, Stats};

/// Longest raw key: the skip list stores key lengths as `u16`, including
/// the 8-byte version suffix.
pub const MAX_KEY_SIZE: usize = u16::MAX as usize - 8;

/// How often a read follows a value pointer into a segment that GC just
/// removed before giving up.
const MAX_READ_RETRIES: usize = 8;

const MIN_BACKOFF: Duration = Duration::from_millis(50);
const MAX_BACKOFF: Duration = Duration::from_secs(5);

pub(crate) struct DbInner {
    pub(crate) opts: Options,
    pub(crate) lsm: Lsm,
    pub(crate) vlog: ValueLog,
    closed: AtomicBool,
}

/// An open DriftKV database.
///
/// All methods take `&self`; a `Db` can be shared across threads behind an
/// `Arc`. Dropping it closes it.
///
/// # Example
///
/// ```rust,no_run
/// use codec::Entry;
/// use engine::{Db, Options};
///
/// let db = Db::open(Options::new("data")).unwrap();
/// db.set(Entry::new("name", "Alice")).unwrap();
/// assert_eq!(db.get(b"name").unwrap().value, b"Alice");
/// db.close().unwrap();
/// ```
pub struct Db {
    inner: Arc<DbInner>,
    closer: Mutex<Closer>,
}

impl Db {
    /// Opens (or creates) the database in `opts.work_dir`, recovering
    /// tables, WALs and the value log, and starts the background tasks.
    pub fn open(opts: Options) -> Result<Self> {
        opts.validate()?;
        fs::create_dir_all(&opts.work_dir)?;
        let lsm = Lsm::open(&opts)?;
        let vlog = ValueLog::open(
            &opts.work_dir,
            VlogOptions {
                file_size: opts.value_log_file_size,
                sync: opts.wal_sync,
            },
        )?;
        let inner = Arc::new(DbInner {
            opts,
            lsm,
            vlog,
            closed: AtomicBool::new(false),
        });

        let mut closer = Closer::new();
        let tasks: [(&str, fn(Arc<DbInner>, TaskHandle)); 3] = [
            ("drift-compact", run_flush_and_compaction),
            ("drift-vlog-gc", run_value_log_gc_loop),
            ("drift-stats", run_stats_loop),
        ];
        for (name, task) in tasks {
            let inner = Arc::clone(&inner);
            closer.spawn(name, move |handle| task(inner, handle))?;
        }

        tracing::info!(
            dir = %inner.opts.work_dir.display(),
            version = inner.lsm.version(),
            "database opened"
        );
        Ok(Self {
            inner,
            closer: Mutex::new(closer),
        })
    }

    pub fn options(&self) -> &Options {
        &self.inner.opts
    }

    /// Writes `entry`. Values longer than `value_threshold` go to the value
    /// log and the tree stores a pointer to them.
    pub fn set(&self, entry: Entry) -> Result<()> {
        self.inner.check_open()?;
        self.inner.set(entry)
    }

    /// Newest live value of `key`.
    ///
    /// # Errors
    ///
    /// [`Error::NotFound`] if the key was never written, was deleted, or has
    /// expired.
    pub fn get(&self, key: &[u8]) -> Result<Entry> {
        self.inner.check_open()?;
        self.inner.get(key)
    }

    /// Writes a tombstone for `key`.
    pub fn delete(&self, key: &[u8]) -> Result<()> {
        self.inner.check_open()?;
        self.inner.set(Entry::tombstone(key))
    }

    /// A merged view over memtables and levels; see [`DbIterator`].
    pub fn new_iterator(&self, opts: IteratorOptions) -> Result<DbIterator> {
        self.inner.check_open()?;
        let reversed = !opts.ascending;
        let merge = MergeIterator::new(self.inner.lsm.iterators(reversed), reversed);
        Ok(DbIterator::new(Arc::clone(&self.inner), merge, opts))
    }

    /// Rotates the memtable and writes every queued memtable to level 0.
    pub fn flush(&self) -> Result<()> {
        self.inner.check_open()?;
        self.inner.lsm.force_flush()?;
        Ok(())
    }

    /// Compacts level 0 into level 1, then keeps compacting until no level
    /// is over its target.
    pub fn compact(&self) -> Result<()> {
        self.inner.check_open()?;
        let passes = self.inner.lsm.levels.compact_all()?;
        Counters::add(&self.inner.lsm.counters.compactions, passes as u64);
        Ok(())
    }

    /// Collects the oldest sealed value log segment, if there is one.
    pub fn run_value_log_gc(&self) -> Result<Option<GcStats>> {
        self.inner.check_open()?;
        self.inner.run_value_log_gc()
    }

    pub fn stats(&self) -> Stats {
        self.inner.stats()
    }

    /// Stops the background tasks, flushes the memtables and closes the
    /// levels and the value log. A second call does nothing.
    pub fn close(&self) -> Result<()> {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.closer.lock().close();
        self.inner.lsm.close()?;
        self.inner.vlog.close()?;
        tracing::info!(dir = %self.inner.opts.work_dir.display(), "database closed");
        Ok(())
    }

    /// Stops the background tasks and marks the handle closed without
    /// flushing, leaving WALs behind as a crash would.
    #[cfg(test)]
    pub(crate) fn crash(self) {
        self.inner.closed.store(true, Ordering::SeqCst);
        self.closer.lock().close();
        let _ = self.inner.lsm.sync_wal();
    }

    #[cfg(test)]
    pub(crate) fn inner(&self) -> &DbInner {
        &self.inner
    }
}

impl Drop for Db {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            tracing::warn!(error = %e, "closing database on drop failed");
        }
    }
}

impl std::fmt::Debug for Db {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Db")
            .field("work_dir", &self.inner.opts.work_dir)
            .field("closed", &self.inner.closed.load(Ordering::Relaxed))
            .field("stats", &self.inner.stats())
            .finish()
    }
}

impl DbInner {
    fn check_open(&self) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::Closed);
        }
        Ok(())
    }

    fn set(&self, mut entry: Entry) -> Result<()> {
        if entry.key.is_empty() {
            return Err(Error::InvalidArgument("key is empty".into()));
        }
        if entry.key.len() > MAX_KEY_SIZE {
            return Err(Error::InvalidArgument(format!(
                "key of {} bytes exceeds {} bytes",
                entry.key.len(),
                MAX_KEY_SIZE
            )));
        }
        entry.meta &= BIT_DELETE;
        entry.version = 0;

        if entry.is_deleted() {
            entry.value.clear();
            Counters::bump(&self.lsm.counters.deletes);
        } else {
            if entry.value.len() > self.opts.value_threshold {
                let ptr = self.vlog.write(&entry)?;
                entry.value = ptr.encode().to_vec();
                entry.meta |= BIT_VALUE_POINTER;
                Counters::bump(&self.lsm.counters.vlog_writes);
            }
            Counters::bump(&self.lsm.counters.sets);
        }
        self.lsm.set(entry)
    }

    pub(crate) fn get(&self, key: &[u8]) -> Result<Entry> {
        Counters::bump(&self.lsm.counters.gets);
        let res = self.get_resolved(key);
        if matches!(res, Err(Error::NotFound)) {
            Counters::bump(&self.lsm.counters.get_misses);
        }
        res
    }

    fn get_resolved(&self, key: &[u8]) -> Result<Entry> {
        for _ in 0..MAX_READ_RETRIES {
            let vs = self.lsm.get(key)?;
            if vs.is_deleted_or_expired(now_secs()) {
                return Err(Error::NotFound);
            }
            match self.resolve(key, vs) {
                Err(Error::Retry) => continue,
                other => return other,
            }
        }
        Err(Error::Retry)
    }

    /// Builds the caller-facing entry, reading the value log if `vs` holds
    /// a pointer.
    pub(crate) fn resolve(&self, key: &[u8], vs: ValueStruct) -> Result<Entry> {
        let mut entry = Entry {
            key: key.to_vec(),
            value: vs.value,
            expires_at: vs.expires_at,
            meta: vs.meta & !BIT_VALUE_POINTER,
            version: vs.version,
        };
        if vs.meta & BIT_VALUE_POINTER != 0 {
            let ptr = ValuePtr::decode(&entry.value)?;
            entry.value = self.vlog.read(&ptr)?;
        }
        Ok(entry)
    }

    fn run_value_log_gc(&self) -> Result<Option<GcStats>> {
        let res = self.vlog.run_gc(self)?;
        if res.is_some() {
            Counters::bump(&self.lsm.counters.gc_runs);
        }
        Ok(res)
    }

    pub(crate) fn stats(&self) -> Stats {
        let mut stats = Stats::default();
        self.lsm.counters.fill(&mut stats);
        let (immutables, memtable_size, in_memory) = self.lsm.memory_usage();
        stats.immutables = immutables;
        stats.memtable_size = memtable_size;
        stats.entry_num = in_memory + self.lsm.levels.key_count();
        stats.levels = self.lsm.levels.levels_summary();
        stats.vlog_segments = self.vlog.segment_ids().len();
        stats.max_version = self.lsm.version();
        stats
    }
}

impl ValueIndex for DbInner {
    fn current_pointer(&self, key: &[u8]) -> Result<Option<ValuePtr>> {
        let vs = match self.lsm.get(key) {
            Ok(vs) => vs,
            Err(Error::NotFound) => return Ok(None),
            Err(e) => return Err(e),
        };
        if vs.is_deleted_or_expired(now_secs()) || !vs.is_value_pointer() {
            return Ok(None);
        }
        ValuePtr::decode(&vs.value).map(Some)
    }

    fn rewrite_pointer(&self, key: &[u8], old: ValuePtr, new: ValuePtr) -> Result<bool> {
        self.lsm.set_with(key, |current| {
            let current = current?;
            if !current.is_value_pointer() || current.is_deleted() {
                return None;
            }
            if ValuePtr::decode(&current.value).ok()? != old {
                return None;
            }
            Some(Entry {
                key: key.to_vec(),
                value: new.encode().to_vec(),
                expires_at: current.expires_at,
                meta: BIT_VALUE_POINTER,
                version: 0,
            })
        })
    }

    fn sync(&self) -> Result<()> {
        self.lsm.sync_wal()
    }
}

/// Flushes queued memtables and compacts while any level is over target.
/// Failures are retried with exponential backoff.
fn run_flush_and_compaction(inner: Arc<DbInner>, handle: TaskHandle) {
    let mut backoff = MIN_BACKOFF;
    loop {
        crossbeam::select! {
            recv(handle.closed()) -> _ => return,
            recv(inner.lsm.flush_signal()) -> _ => {},
            default(inner.opts.compaction_interval) => {},
        }
        match background_pass(&inner, &handle) {
            Ok(()) => backoff = MIN_BACKOFF,
            Err(e) => {
                tracing::warn!(error = %e, retry_in = ?backoff, "flush or compaction failed");
                if handle.wait(backoff) {
                    return;
                }
                backoff = (backoff * 2).min(MAX_BACKOFF);
            }
        }
    }
}

fn background_pass(inner: &DbInner, handle: &TaskHandle) -> Result<()> {
    inner.lsm.flush_immutables()?;
    while !handle.is_closed() && inner.lsm.levels.compact_once()? {
        Counters::bump(&inner.lsm.counters.compactions);
    }
    Ok(())
}

fn run_value_log_gc_loop(inner: Arc<DbInner>, handle: TaskHandle) {
    while !handle.wait(inner.opts.gc_interval) {
        match inner.run_value_log_gc() {
            Ok(Some(stats)) => tracing::debug!(?stats, "value log gc pass"),
            Ok(None) => {}
            Err(e) => tracing::warn!(error = %e, "value log gc failed"),
        }
    }
}

fn run_stats_loop(inner: Arc<DbInner>, handle: TaskHandle) {
    while !handle.wait(inner.opts.stats_interval) {
        let stats = inner.stats();
        tracing::debug!(
            entries = stats.entry_num,
            sets = stats.sets,
            gets = stats.gets,
            immutables = stats.immutables,
            vlog_segments = stats.vlog_segments,
            "stats"
        );
    }
}

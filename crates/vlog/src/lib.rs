//! # Value log
//!
//! Key/value separation for DriftKV: values above the engine's threshold are
//! appended here and the LSM tree stores a 16-byte [`ValuePtr`] instead.
//!
//! The log is a series of segment files `{fid:05}.vlog`; only the newest one
//! is written. When it grows past `file_size` a new segment is started.
//!
//! ## Garbage collection
//!
//! [`ValueLog::run_gc`] picks the oldest sealed segment and asks the index,
//! record by record, whether the key still points at that record. Live
//! records are appended to the head of the log and the index pointer is
//! swapped with [`ValueIndex::rewrite_pointer`], which only succeeds if no
//! newer write landed in between. The segment is then deleted; readers still
//! holding a pointer into it get `Error::Retry` and look the key up again.
//!
//! A write that fails after the value log append leaves an orphaned record.
//! Nothing points at it, so the next GC of that segment drops it.

mod segment;

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use codec::{now_secs, Entry, Error, Result, ValuePtr};
use parking_lot::{Mutex, RwLock};

pub use segment::{
    decode_record, encode_record, parse_segment_file_name, scan, segment_file_name, ScanStats,
};
use segment::{ActiveSegment, Segment};

/// What GC needs from the LSM tree.
pub trait ValueIndex: Send + Sync {
    /// The pointer the newest version of `key` holds, if that version is a
    /// live value-log pointer.
    fn current_pointer(&self, key: &[u8]) -> Result<Option<ValuePtr>>;

    /// Makes `key` point at `new` if it still points at `old`. Returns
    /// whether the swap happened.
    fn rewrite_pointer(&self, key: &[u8], old: ValuePtr, new: ValuePtr) -> Result<bool>;

    /// Makes every rewrite so far durable. Called before a collected
    /// segment is deleted.
    fn sync(&self) -> Result<()> {
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct VlogOptions {
    /// Rotate the active segment once it exceeds this many bytes.
    pub file_size: u64,
    /// Fsync after every write.
    pub sync: bool,
}

impl Default for VlogOptions {
    fn default() -> Self {
        Self {
            file_size: 64 << 20,
            sync: false,
        }
    }
}

/// Outcome of one GC pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GcStats {
    pub fid: u64,
    pub moved: usize,
    pub dropped: usize,
}

struct State {
    /// Read handles for every segment, including the active one.
    segments: BTreeMap<u64, Arc<Segment>>,
    active: ActiveSegment,
}

pub struct ValueLog {
    dir: PathBuf,
    opts: VlogOptions,
    state: RwLock<State>,
    /// One GC at a time.
    gc_lock: Mutex<()>,
}

impl ValueLog {
    /// Opens the log in `dir`, trimming a torn record from the newest segment.
    pub fn open(dir: &Path, mut opts: VlogOptions) -> Result<Self> {
        fs::create_dir_all(dir)?;
        opts.file_size = opts.file_size.clamp(1, u32::MAX as u64);

        let mut fids = Vec::new();
        for entry in fs::read_dir(dir)? {
            let entry = entry?;
            if let Some(fid) = entry.file_name().to_str().and_then(parse_segment_file_name) {
                fids.push(fid);
            }
        }
        fids.sort_unstable();

        let active_fid = match fids.last() {
            Some(&fid) => {
                let path = dir.join(segment_file_name(fid));
                let stats = scan(&path, |_, _, _| Ok(()))?;
                if stats.truncated_tail {
                    let f = fs::OpenOptions::new().write(true).open(&path)?;
                    f.set_len(stats.valid_len)?;
                    f.sync_all()?;
                }
                fid
            }
            None => 1,
        };
        let active = ActiveSegment::open(dir, active_fid)?;

        let mut segments = BTreeMap::new();
        if !fids.contains(&active_fid) {
            fids.push(active_fid);
        }
        for fid in fids {
            segments.insert(fid, Arc::new(Segment::open(dir, fid)?));
        }
        tracing::info!(
            segments = segments.len(),
            active = active_fid,
            "value log opened"
        );

        Ok(Self {
            dir: dir.to_path_buf(),
            opts,
            state: RwLock::new(State { segments, active }),
            gc_lock: Mutex::new(()),
        })
    }

    /// Appends `entry` and returns a pointer to its record.
    pub fn write(&self, entry: &Entry) -> Result<ValuePtr> {
        let record = encode_record(entry)?;
        if record.len() as u64 > u32::MAX as u64 {
            return Err(Error::InvalidArgument(format!(
                "value of {} bytes is too large for the value log",
                entry.value.len()
            )));
        }

        let mut state = self.state.write();
        if state.active.size > 0 && state.active.size + record.len() as u64 > self.opts.file_size {
            self.rotate(&mut state)?;
        }
        let offset = state.active.append(&record)?;
        if self.opts.sync {
            state.active.sync()?;
        }
        Ok(ValuePtr {
            fid: state.active.fid,
            offset: offset as u32,
            len: record.len() as u32,
        })
    }

    fn rotate(&self, state: &mut State) -> Result<()> {
        state.active.sync()?;
        let fid = state.active.fid + 1;
        state.active = ActiveSegment::open(&self.dir, fid)?;
        state.segments.insert(fid, Arc::new(Segment::open(&self.dir, fid)?));
        tracing::debug!(fid, "value log rotated");
        Ok(())
    }

    /// Reads the value `ptr` points at.
    pub fn read(&self, ptr: &ValuePtr) -> Result<Vec<u8>> {
        Ok(self.read_entry(ptr)?.value)
    }

    /// Reads the whole record `ptr` points at.
    ///
    /// # Errors
    ///
    /// `Error::Retry` if the segment was garbage collected. `Corruption` if
    /// the record fails its checksum or names a segment that is missing
    /// but newer than the oldest live one; GC only ever removes the oldest.
    pub fn read_entry(&self, ptr: &ValuePtr) -> Result<Entry> {
        let segment = {
            let state = self.state.read();
            match state.segments.get(&ptr.fid) {
                Some(s) => Arc::clone(s),
                None if state.segments.keys().next().map_or(false, |&o| ptr.fid < o) => {
                    return Err(Error::Retry)
                }
                None => {
                    return Err(Error::Corruption(format!(
                        "value pointer into unknown segment {:05}",
                        ptr.fid
                    )))
                }
            }
        };
        let buf = match segment.read_at(ptr.offset as u64, ptr.len as usize) {
            Ok(buf) => buf,
            // Deleted between the lookup and the read.
            Err(Error::Io(e)) if !segment.path().exists() => {
                tracing::debug!(fid = ptr.fid, error = %e, "segment vanished during read");
                return Err(Error::Retry);
            }
            Err(e) => return Err(e),
        };
        segment::decode_record(&buf)
    }

    pub fn sync(&self) -> Result<()> {
        self.state.write().active.sync()
    }

    /// Ids of every segment, oldest first.
    pub fn segment_ids(&self) -> Vec<u64> {
        self.state.read().segments.keys().copied().collect()
    }

    pub fn active_fid(&self) -> u64 {
        self.state.read().active.fid
    }

    /// Collects the oldest sealed segment. Returns `None` when only the
    /// active segment exists.
    pub fn run_gc(&self, index: &dyn ValueIndex) -> Result<Option<GcStats>> {
        let _gc = self.gc_lock.lock();

        let victim = {
            let state = self.state.read();
            let active = state.active.fid;
            state
                .segments
                .values()
                .find(|s| s.fid() != active)
                .map(Arc::clone)
        };
        let victim = match victim {
            Some(v) => v,
            None => return Ok(None),
        };

        let now = now_secs();
        let mut stats = GcStats {
            fid: victim.fid(),
            moved: 0,
            dropped: 0,
        };
        scan(victim.path(), |entry, offset, len| {
            let old = ValuePtr {
                fid: victim.fid(),
                offset: offset as u32,
                len,
            };
            if entry.is_deleted() || entry.is_expired(now) {
                stats.dropped += 1;
                return Ok(());
            }
            if index.current_pointer(&entry.key)? != Some(old) {
                stats.dropped += 1;
                return Ok(());
            }
            let new = self.write(&entry)?;
            if index.rewrite_pointer(&entry.key, old, new)? {
                stats.moved += 1;
            } else {
                // Overwritten meanwhile; the copy is garbage for a later pass.
                stats.dropped += 1;
            }
            Ok(())
        })?;
        self.sync()?;
        index.sync()?;

        self.state.write().segments.remove(&victim.fid());
        fs::remove_file(victim.path())?;
        tracing::info!(
            fid = stats.fid,
            moved = stats.moved,
            dropped = stats.dropped,
            "value log segment collected"
        );
        Ok(Some(stats))
    }

    /// Syncs the active segment.
    pub fn close(&self) -> Result<()> {
        self.sync()
    }
}

#[cfg(test)]
mod tests;

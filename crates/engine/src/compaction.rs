//! Leveled compaction.
//!
//! Each pass scores the levels, claims the best level pair in
//! [`CompactStatus`], merges the inputs with a [`MergeIterator`] and installs
//! the outputs:
//!
//! ```text
//! L0 -> L1   all of L0 + every overlapping L1 table
//! Li -> Li+1 the Li table with the most stale data + overlapping Li+1 tables
//! ```
//!
//! Only the newest version of each raw key survives. Tombstones and expired
//! entries are dropped when no level below the target still holds the key.
//! Outputs are made durable first; the manifest is then rewritten once and
//! the level lists swapped, so a failure anywhere leaves the inputs in place.

use std::sync::Arc;

use codec::{compare_keys, now_secs, parse_key, KvIterator, Result};
use parking_lot::{Condvar, Mutex};
use sstable::{table_file_name, ConcatIterator, MergeIterator, Table, TableBuilder, TableIterator};

use crate::levels::{check_disjoint, sort_level, LevelManager};

/// Tracks which levels are taking part in a running compaction.
pub(crate) struct CompactStatus {
    busy: Mutex<Vec<bool>>,
    freed: Condvar,
}

/// Holds levels `from` and `from + 1` until dropped.
pub(crate) struct Claim<'a> {
    status: &'a CompactStatus,
    from: usize,
}

impl CompactStatus {
    pub fn new(levels: usize) -> Self {
        Self {
            busy: Mutex::new(vec![false; levels]),
            freed: Condvar::new(),
        }
    }

    /// Claims `from` and `from + 1` if neither is busy.
    pub fn try_claim(&self, from: usize) -> Option<Claim<'_>> {
        let mut busy = self.busy.lock();
        if busy[from] || busy[from + 1] {
            return None;
        }
        busy[from] = true;
        busy[from + 1] = true;
        Some(Claim { status: self, from })
    }

    /// Claims `from` and `from + 1`, waiting for running compactions.
    pub fn claim(&self, from: usize) -> Claim<'_> {
        let mut busy = self.busy.lock();
        while busy[from] || busy[from + 1] {
            self.freed.wait(&mut busy);
        }
        busy[from] = true;
        busy[from + 1] = true;
        Claim { status: self, from }
    }
}

impl Drop for Claim<'_> {
    fn drop(&mut self) {
        let mut busy = self.status.busy.lock();
        busy[self.from] = false;
        busy[self.from + 1] = false;
        self.status.freed.notify_all();
    }
}

/// Inputs of one compaction.
struct CompactDef {
    from: usize,
    to: usize,
    top: Vec<Arc<Table>>,
    bottom: Vec<Arc<Table>>,
}

impl CompactDef {
    fn input_fids(&self) -> Vec<u64> {
        self.top.iter().chain(&self.bottom).map(|t| t.fid()).collect()
    }
}

impl LevelManager {
    /// Target size of `level` (>= 1).
    pub(crate) fn target_size(&self, level: usize) -> u64 {
        let mut size = self.opts.base_level_size;
        for _ in 1..level {
            size = size.saturating_mul(self.opts.level_size_multiplier);
        }
        size
    }

    /// `(level, score)` for every level that can compact downwards, best
    /// first.
    pub(crate) fn scores(&self) -> Vec<(usize, f64)> {
        let last = self.levels.len() - 1;
        let mut out: Vec<(usize, f64)> = (0..last)
            .map(|level| {
                let tables = self.levels[level].read();
                let score = if level == 0 {
                    tables.len() as f64 / self.opts.num_level_zero_tables as f64
                } else {
                    let size: u64 = tables.iter().map(|t| t.size()).sum();
                    size as f64 / self.target_size(level) as f64
                };
                (level, score)
            })
            .collect();
        out.sort_by(|a, b| b.1.total_cmp(&a.1));
        out
    }

    /// Runs one compaction on the best scoring level that is not busy.
    /// Returns false when no level needs work.
    pub(crate) fn compact_once(&self) -> Result<bool> {
        for (level, score) in self.scores() {
            if score < 1.0 {
                break;
            }
            if let Some(claim) = self.status.try_claim(level) {
                let done = self.compact_level(level)?;
                drop(claim);
                if done {
                    return Ok(true);
                }
            }
        }
        Ok(false)
    }

    /// Drains level 0 into level 1 whatever its score, then compacts until
    /// no level scores 1 or more. Returns the number of passes run.
    pub(crate) fn compact_all(&self) -> Result<usize> {
        let mut passes = 0;
        if self.table_count(0) > 0 {
            let _claim = self.status.claim(0);
            if self.compact_level(0)? {
                passes += 1;
            }
        }
        loop {
            let next = self
                .scores()
                .into_iter()
                .find(|&(_, score)| score >= 1.0)
                .map(|(level, _)| level);
            let level = match next {
                Some(level) => level,
                None => return Ok(passes),
            };
            let _claim = self.status.claim(level);
            if !self.compact_level(level)? {
                return Ok(passes);
            }
            passes += 1;
        }
    }

    /// Compacts `from` into `from + 1`. The caller holds the claim.
    pub(crate) fn compact_level(&self, from: usize) -> Result<bool> {
        let def = match self.pick(from) {
            Some(def) => def,
            None => return Ok(false),
        };
        self.run(def)?;
        Ok(true)
    }

    fn pick(&self, from: usize) -> Option<CompactDef> {
        let to = from + 1;
        let top: Vec<Arc<Table>> = if from == 0 {
            self.levels[0].read().clone()
        } else {
            let tables = self.levels[from].read();
            let best = tables.iter().max_by(|a, b| {
                a.stale_data_size()
                    .cmp(&b.stale_data_size())
                    .then_with(|| compare_keys(b.min_key(), a.min_key()))
            })?;
            vec![Arc::clone(best)]
        };
        if top.is_empty() {
            return None;
        }

        let min = top
            .iter()
            .map(|t| t.min_key())
            .min_by(|a, b| compare_keys(a, b))?
            .to_vec();
        let max = top
            .iter()
            .map(|t| t.max_key())
            .max_by(|a, b| compare_keys(a, b))?
            .to_vec();
        let bottom = self.levels[to]
            .read()
            .iter()
            .filter(|t| t.overlaps(&min, &max))
            .cloned()
            .collect();

        Some(CompactDef {
            from,
            to,
            top,
            bottom,
        })
    }

    fn run(&self, def: CompactDef) -> Result<()> {
        let mut iters: Vec<Box<dyn KvIterator + Send>> = Vec::new();
        // Newest source first: level 0 by descending fid, then the target.
        for table in def.top.iter().rev() {
            iters.push(Box::new(TableIterator::new(Arc::clone(table), false)));
        }
        if !def.bottom.is_empty() {
            iters.push(Box::new(ConcatIterator::new(def.bottom.clone(), false)));
        }
        let mut merge = MergeIterator::new(iters, false);
        merge.rewind();

        let outputs = self.merge_into_tables(&mut merge, def.to)?;
        self.install(&def, outputs)
    }

    fn merge_into_tables(&self, merge: &mut MergeIterator, to: usize) -> Result<Vec<Arc<Table>>> {
        let now = now_secs();
        let mut outputs: Vec<Arc<Table>> = Vec::new();
        let mut builder: Option<TableBuilder> = None;
        let mut last_raw: Option<Vec<u8>> = None;
        let mut dropped = 0usize;

        let result = (|| -> Result<()> {
            while merge.valid() {
                let key = merge.key().to_vec();
                let raw = parse_key(&key);
                if last_raw.as_deref() == Some(raw) {
                    // Older version of a key already written.
                    dropped += 1;
                    merge.next();
                    continue;
                }
                last_raw = Some(raw.to_vec());

                let vs = merge.value();
                let dead = vs.is_deleted_or_expired(now);
                if dead && !self.overlaps_below(to, &key) {
                    dropped += 1;
                    merge.next();
                    continue;
                }
                let b = builder.get_or_insert_with(|| TableBuilder::new(self.table_options()));
                b.add(&key, &vs, dead);
                if b.reached_capacity() {
                    if let Some(full) = builder.take() {
                        outputs.push(self.write_output(full)?);
                    }
                }
                merge.next();
            }
            if let Some(e) = merge.take_error() {
                return Err(e);
            }
            if let Some(b) = builder.take().filter(|b| !b.is_empty()) {
                outputs.push(self.write_output(b)?);
            }
            Ok(())
        })();

        match result {
            Ok(()) => {
                tracing::debug!(to, outputs = outputs.len(), dropped, "merge finished");
                Ok(outputs)
            }
            Err(e) => {
                discard(&outputs);
                Err(e)
            }
        }
    }

    fn write_output(&self, builder: TableBuilder) -> Result<Arc<Table>> {
        let fid = self.reserve_fid();
        let path = self.dir.join(table_file_name(fid));
        builder.finish(&path)?;
        Ok(Arc::new(Table::open(&path, fid, self.cache.clone())?))
    }

    fn install(&self, def: &CompactDef, outputs: Vec<Arc<Table>>) -> Result<()> {
        let inputs = def.input_fids();
        let output_fids: Vec<u64> = outputs.iter().map(|t| t.fid()).collect();

        let mut manifest = self.manifest.lock();
        let backup = manifest.clone();
        manifest.remove(&inputs);
        for table in &outputs {
            manifest.add(table.fid(), def.to, table.checksum());
        }
        manifest.next_fid = self.next_fid();
        if let Err(e) = manifest.save() {
            *manifest = backup;
            discard(&outputs);
            return Err(e);
        }
        {
            let mut from = self.levels[def.from].write();
            let mut to = self.levels[def.to].write();
            from.retain(|t| !inputs.contains(&t.fid()));
            to.retain(|t| !inputs.contains(&t.fid()));
            to.extend(outputs);
            sort_level(def.to, &mut to);
            debug_assert!(check_disjoint(&to), "level {} overlaps", def.to);
        }
        drop(manifest);

        for table in def.top.iter().chain(&def.bottom) {
            table.mark_obsolete();
        }
        tracing::info!(
            from = def.from,
            to = def.to,
            inputs = ?inputs,
            outputs = ?output_fids,
            "compaction finished"
        );
        Ok(())
    }
}

/// Deletes tables written by a compaction that will not be installed.
fn discard(tables: &[Arc<Table>]) {
    for t in tables {
        t.mark_obsolete();
    }
}

//! Process-wide counters, sampled by the statistics task and [`Db::stats`].
//!
//! [`Db::stats`]: crate::Db::stats

use std::sync::atomic::{AtomicU64, Ordering};

use crate::levels::LevelSummary;

#[derive(Debug, Default)]
pub(crate) struct Counters {
    pub sets: AtomicU64,
    pub deletes: AtomicU64,
    pub gets: AtomicU64,
    pub get_misses: AtomicU64,
    pub vlog_writes: AtomicU64,
    pub flushes: AtomicU64,
    pub compactions: AtomicU64,
    pub gc_runs: AtomicU64,
    pub stalls: AtomicU64,
}

/// A point-in-time view of the database.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Stats {
    /// Entries in memtables and tables, older versions and tombstones included.
    pub entry_num: u64,
    pub sets: u64,
    pub deletes: u64,
    pub gets: u64,
    pub get_misses: u64,
    /// Values written out of line.
    pub vlog_writes: u64,
    pub flushes: u64,
    pub compactions: u64,
    pub gc_runs: u64,
    /// Writes that had to wait for a flush.
    pub stalls: u64,
    pub immutables: usize,
    pub memtable_size: usize,
    pub levels: Vec<LevelSummary>,
    pub vlog_segments: usize,
    pub max_version: u64,
}

impl Counters {
    pub fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add(counter: &AtomicU64, n: u64) {
        counter.fetch_add(n, Ordering::Relaxed);
    }

    pub fn fill(&self, stats: &mut Stats) {
        let load = |c: &AtomicU64| c.load(Ordering::Relaxed);
        stats.sets = load(&self.sets);
        stats.deletes = load(&self.deletes);
        stats.gets = load(&self.gets);
        stats.get_misses = load(&self.get_misses);
        stats.vlog_writes = load(&self.vlog_writes);
        stats.flushes = load(&self.flushes);
        stats.compactions = load(&self.compactions);
        stats.gc_runs = load(&self.gc_runs);
        stats.stalls = load(&self.stalls);
    }
}

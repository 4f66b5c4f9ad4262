//! # Engine - DriftKV Storage Engine
//!
//! Ties the [`memtable`], [`wal`], [`sstable`] and [`vlog`]
//! crates together into an embedded LSM-tree key-value store with
//! key/value separation.
//!
//! ## Architecture
//!
//! ```text
//! Client
//!   |
//!   v
//! ┌──────────────────────────────────────────────────┐
//! │                        Db                        │
//! │                                                  │
//! │ set() → large value? → value log (pointer kept)  │
//! │           |                                      │
//! │           v                                      │
//! │         WAL append → skip list insert            │
//! │           |                                      │
//! │           |  (memtable full?) rotate, queue      │
//! │           v                                      │
//! │   drift-compact: flush → L0 table                │
//! │                  compact Li → Li+1 while over    │
//! │                                                  │
//! │ get()  → memtable → immutables → L0 → L1 .. Ln   │
//! │            (first match wins)                    │
//! │                                                  │
//! │   drift-vlog-gc: rewrite live values of the      │
//! │                  oldest segment, delete it       │
//! └──────────────────────────────────────────────────┘
//! ```
//!
//! ## Modules
//!
//! | Module         | Purpose                                             |
//! |----------------|-----------------------------------------------------|
//! | [`db`]         | `Db` handle, value separation, background tasks     |
//! | [`iterator`]   | `DbIterator`: merged, deduplicated range scans      |
//! | `lsm`          | memtable rotation, write stalls, flush queue        |
//! | `mem_table`    | one skip list plus its WAL                          |
//! | `levels`       | per-level table lists, point lookups, flush         |
//! | `compaction`   | level scoring and table merging                     |
//! | `manifest`     | durable level membership                            |
//! | `closer`       | start and stop of background threads                |
//! | `stats`        | counters and the [`Stats`] snapshot                 |
//!
//! ## Crash Safety
//!
//! Every write reaches the WAL before the skip list. A WAL is deleted only
//! after its table is written, synced and recorded in the manifest. Tables
//! and the manifest are written to a temp file and renamed into place. On
//! open, WALs whose table already made it into the manifest are removed and
//! the rest are replayed.

mod closer;
mod compaction;
pub mod db;
pub mod iterator;
mod levels;
mod lsm;
mod manifest;
mod mem_table;
mod stats;

pub use codec::{Entry, Error, Result};
pub use config::Options;
pub use db::{Db, MAX_KEY_SIZE};
pub use iterator::{DbIterator, IteratorOptions};
pub use levels::LevelSummary;
pub use stats::Stats;
pub use vlog::GcStats;

#[cfg(test)]
mod tests;

//! # SSTable - Sorted String Table
//!
//! Immutable, memory-mapped on-disk tables for the DriftKV storage engine.
//!
//! When a memtable fills up the engine flushes it to disk as an SSTable, and
//! compaction later merges tables into larger ones on deeper levels. Tables
//! are *write-once, read-many*: once renamed into place they are never
//! modified, only replaced.
//!
//! ## File layout
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │ DATA BLOCKS                                                  │
//! │   entries sorted by internal key, cut at `block_size`;        │
//! │   each block ends with its entry offsets, entry count and     │
//! │   a CRC32; payloads are optionally lz4-compressed             │
//! ├──────────────────────────────────────────────────────────────┤
//! │ INDEX                                                        │
//! │   per block: first key, offset, size                          │
//! │   bloom filter over raw keys (optional)                       │
//! │   max version, stale data size, key count                     │
//! ├──────────────────────────────────────────────────────────────┤
//! │ TRAILER (read backwards)                                     │
//! │   index_len (u32) | crc32 of index | checksum_len (u32)       │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! See [`format`] for the exact byte layout.
//!
//! ## Reading
//!
//! [`Table::open`] maps the file, verifies the index checksum and keeps the
//! decoded index in memory. Point lookups consult the bloom filter, binary
//! search the block index, then binary search inside the block. Blocks are
//! verified and decoded on first use and kept in a shared [`BlockCache`].
//!
//! Any truncation, checksum mismatch or malformed index surfaces as
//! `codec::Error::Corruption`, never as a missing key.

mod builder;
pub mod format;
mod iterator;
mod merge;
mod table;

pub use builder::{sync_dir, TableBuilder, TableOptions};
pub use format::Block;
pub use iterator::{ConcatIterator, TableIterator};
pub use merge::MergeIterator;
pub use table::{BlockCache, Table};

/// File name of table `fid` inside the work directory.
pub fn table_file_name(fid: u64) -> String {
    format!("{:05}.sst", fid)
}

/// Parses a file name produced by [`table_file_name`].
pub fn parse_table_file_name(name: &str) -> Option<u64> {
    name.strip_suffix(".sst")?.parse().ok()
}

#[cfg(test)]
mod tests;

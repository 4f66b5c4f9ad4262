use std::fs;
use std::path::Path;
use std::thread;
use std::time::{Duration, Instant};

use config::Options;

/// Small sizes so a few hundred writes rotate memtables and cut tables.
/// Background timers are long so tests drive flushes and compactions.
pub fn test_options(dir: &Path) -> Options {
    Options::new(dir)
        .with_mem_table_size(16 * 1024)
        .with_sstable_max_size(16 * 1024)
        .with_block_size(1024)
        .with_base_level_size(64 * 1024)
        .with_num_level_zero_tables(100)
        .with_value_threshold(64)
        .with_value_log_file_size(64 * 1024)
        .with_cache_size(64)
        .with_wal_sync(false)
        .with_compaction_interval(Duration::from_secs(3600))
        .with_gc_interval(Duration::from_secs(3600))
        .with_stats_interval(Duration::from_secs(3600))
}

pub fn key(i: usize) -> Vec<u8> {
    format!("key{:05}", i).into_bytes()
}

pub fn value(i: usize) -> Vec<u8> {
    format!("value{:05}", i).into_bytes()
}

pub fn count_files(dir: &Path, ext: &str) -> usize {
    fs::read_dir(dir)
        .unwrap()
        .filter_map(|e| e.ok())
        .filter(|e| {
            e.path()
                .extension()
                .and_then(|s| s.to_str())
                .map(|x| x == ext)
                .unwrap_or(false)
        })
        .count()
}

/// Polls `cond` every 10ms until it holds or `timeout` passes.
pub fn wait_for(timeout: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        thread::sleep(Duration::from_millis(10));
    }
    cond()
}

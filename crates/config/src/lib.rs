//! # Config - DriftKV options
//!
//! [`Options`] is the whole tuning surface of the engine. Start from
//! [`Options::new`] (defaults rooted at a work directory), adjust with the
//! `with_*` setters, or load overrides from the environment:
//!
//! ```text
//! DRIFT_WORK_DIR               data directory             (default: "data")
//! DRIFT_MEM_TABLE_SIZE         memtable arena bytes       (default: 64 MiB)
//! DRIFT_SSTABLE_MAX_SIZE       target table bytes         (default: 2 MiB)
//! DRIFT_BLOCK_SIZE             data block bytes           (default: 4 KiB)
//! DRIFT_BLOOM_FALSE_POSITIVE   bloom fp rate, 0 disables  (default: 0.01)
//! DRIFT_MAX_LEVEL_NUM          number of levels           (default: 7)
//! DRIFT_LEVEL_SIZE_MULTIPLIER  growth between levels      (default: 10)
//! DRIFT_BASE_LEVEL_SIZE        L1 target bytes            (default: 10 MiB)
//! DRIFT_NUM_LEVEL_ZERO_TABLES  L0 compaction trigger      (default: 5)
//! DRIFT_VALUE_THRESHOLD        KV separation threshold    (default: 4 KiB)
//! DRIFT_VALUE_LOG_FILE_SIZE    value log segment bytes    (default: 64 MiB)
//! DRIFT_CACHE_SIZE             cached blocks, 0 disables  (default: 1024)
//! DRIFT_NUM_MEMTABLES          mutable + immutable slots  (default: 5)
//! DRIFT_WAL_SYNC               fsync every WAL append     (default: true)
//! DRIFT_COMPRESSION            lz4 data blocks            (default: false)
//! DRIFT_GC_INTERVAL_MS         value log GC period
//! DRIFT_COMPACTION_INTERVAL_MS compaction poll period
//! DRIFT_STATS_INTERVAL_MS      statistics sample period
//! DRIFT_WRITE_STALL_TIMEOUT_MS writer backpressure limit
//! ```
//!
//! Unset variables keep their defaults; unparsable ones are logged and
//! ignored.

use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use codec::{Error, Result, MAX_RECORD_SIZE};

/// Prefix used by [`Options::from_env_default`].
pub const ENV_PREFIX: &str = "DRIFT_";

/// Largest `value_threshold` whose inline values still fit one WAL record,
/// with 1 MiB left for the key and record header.
pub const MAX_VALUE_THRESHOLD: usize = MAX_RECORD_SIZE as usize - (1 << 20);

#[derive(Debug, Clone, PartialEq)]
pub struct Options {
    /// Directory holding the manifest, tables, WALs and value log.
    pub work_dir: PathBuf,
    /// A memtable is rotated once its arena would grow past this.
    pub mem_table_size: usize,
    /// Compaction cuts output tables at this size.
    pub sstable_max_size: u64,
    pub block_size: usize,
    /// Bloom filter false positive target. `0.0` builds tables without one.
    pub bloom_false_positive: f64,
    pub max_level_num: usize,
    pub level_size_multiplier: u64,
    /// Target size of level 1.
    pub base_level_size: u64,
    /// Level 0 table count that scores 1.0 for compaction.
    pub num_level_zero_tables: usize,
    /// Values longer than this go to the value log.
    pub value_threshold: usize,
    pub value_log_file_size: u64,
    /// Block cache capacity in blocks.
    pub cache_size: usize,
    /// Mutable memtable plus the immutables allowed to queue for flush.
    pub num_memtables: usize,
    pub wal_sync: bool,
    pub compression: bool,
    pub gc_interval: Duration,
    pub compaction_interval: Duration,
    pub stats_interval: Duration,
    pub write_stall_timeout: Duration,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            work_dir: PathBuf::from("data"),
            mem_table_size: 64 << 20,
            sstable_max_size: 2 << 20,
            block_size: 4 << 10,
            bloom_false_positive: 0.01,
            max_level_num: 7,
            level_size_multiplier: 10,
            base_level_size: 10 << 20,
            num_level_zero_tables: 5,
            value_threshold: 4 << 10,
            value_log_file_size: 64 << 20,
            cache_size: 1024,
            num_memtables: 5,
            wal_sync: true,
            compression: false,
            gc_interval: Duration::from_secs(600),
            compaction_interval: Duration::from_secs(1),
            stats_interval: Duration::from_secs(10),
            write_stall_timeout: Duration::from_secs(10),
        }
    }
}

impl Options {
    /// Default options rooted at `work_dir`.
    pub fn new(work_dir: impl AsRef<Path>) -> Self {
        Self {
            work_dir: work_dir.as_ref().to_path_buf(),
            ..Self::default()
        }
    }

    /// Defaults overridden by `{prefix}NAME` environment variables.
    pub fn from_env(prefix: &str) -> Self {
        let env = EnvSource { prefix };
        let d = Self::default();
        Self {
            work_dir: PathBuf::from(env.string("WORK_DIR", &d.work_dir.to_string_lossy())),
            mem_table_size: env.parse("MEM_TABLE_SIZE", d.mem_table_size),
            sstable_max_size: env.parse("SSTABLE_MAX_SIZE", d.sstable_max_size),
            block_size: env.parse("BLOCK_SIZE", d.block_size),
            bloom_false_positive: env.parse("BLOOM_FALSE_POSITIVE", d.bloom_false_positive),
            max_level_num: env.parse("MAX_LEVEL_NUM", d.max_level_num),
            level_size_multiplier: env.parse("LEVEL_SIZE_MULTIPLIER", d.level_size_multiplier),
            base_level_size: env.parse("BASE_LEVEL_SIZE", d.base_level_size),
            num_level_zero_tables: env.parse("NUM_LEVEL_ZERO_TABLES", d.num_level_zero_tables),
            value_threshold: env.parse("VALUE_THRESHOLD", d.value_threshold),
            value_log_file_size: env.parse("VALUE_LOG_FILE_SIZE", d.value_log_file_size),
            cache_size: env.parse("CACHE_SIZE", d.cache_size),
            num_memtables: env.parse("NUM_MEMTABLES", d.num_memtables),
            wal_sync: env.parse("WAL_SYNC", d.wal_sync),
            compression: env.parse("COMPRESSION", d.compression),
            gc_interval: env.millis("GC_INTERVAL_MS", d.gc_interval),
            compaction_interval: env.millis("COMPACTION_INTERVAL_MS", d.compaction_interval),
            stats_interval: env.millis("STATS_INTERVAL_MS", d.stats_interval),
            write_stall_timeout: env.millis("WRITE_STALL_TIMEOUT_MS", d.write_stall_timeout),
        }
    }

    /// [`Options::from_env`] with the `DRIFT_` prefix.
    pub fn from_env_default() -> Self {
        Self::from_env(ENV_PREFIX)
    }

    /// Rejects combinations the engine cannot run with.
    pub fn validate(&self) -> Result<()> {
        fn check(ok: bool, msg: &str) -> Result<()> {
            if ok {
                Ok(())
            } else {
                Err(Error::InvalidArgument(msg.to_string()))
            }
        }
        check(self.mem_table_size >= 1 << 10, "mem_table_size must be at least 1 KiB")?;
        check(self.mem_table_size <= u32::MAX as usize, "mem_table_size must fit in u32")?;
        check(self.sstable_max_size > 0, "sstable_max_size must be positive")?;
        check(self.block_size > 0, "block_size must be positive")?;
        check(
            (0.0..1.0).contains(&self.bloom_false_positive),
            "bloom_false_positive must be in [0, 1)",
        )?;
        check(self.max_level_num >= 2, "max_level_num must be at least 2")?;
        check(self.level_size_multiplier >= 2, "level_size_multiplier must be at least 2")?;
        check(self.base_level_size > 0, "base_level_size must be positive")?;
        check(self.num_level_zero_tables > 0, "num_level_zero_tables must be positive")?;
        check(
            self.value_threshold <= MAX_VALUE_THRESHOLD,
            "value_threshold must leave inline values within the WAL record limit",
        )?;
        check(self.value_log_file_size > 0, "value_log_file_size must be positive")?;
        check(self.num_memtables >= 2, "num_memtables must be at least 2")?;
        Ok(())
    }

    pub fn with_work_dir(mut self, dir: impl AsRef<Path>) -> Self {
        self.work_dir = dir.as_ref().to_path_buf();
        self
    }

    pub fn with_mem_table_size(mut self, bytes: usize) -> Self {
        self.mem_table_size = bytes;
        self
    }

    pub fn with_sstable_max_size(mut self, bytes: u64) -> Self {
        self.sstable_max_size = bytes;
        self
    }

    pub fn with_block_size(mut self, bytes: usize) -> Self {
        self.block_size = bytes;
        self
    }

    pub fn with_bloom_false_positive(mut self, rate: f64) -> Self {
        self.bloom_false_positive = rate;
        self
    }

    pub fn with_max_level_num(mut self, levels: usize) -> Self {
        self.max_level_num = levels;
        self
    }

    pub fn with_level_size_multiplier(mut self, multiplier: u64) -> Self {
        self.level_size_multiplier = multiplier;
        self
    }

    pub fn with_base_level_size(mut self, bytes: u64) -> Self {
        self.base_level_size = bytes;
        self
    }

    pub fn with_num_level_zero_tables(mut self, tables: usize) -> Self {
        self.num_level_zero_tables = tables;
        self
    }

    pub fn with_value_threshold(mut self, bytes: usize) -> Self {
        self.value_threshold = bytes;
        self
    }

    pub fn with_value_log_file_size(mut self, bytes: u64) -> Self {
        self.value_log_file_size = bytes;
        self
    }

    pub fn with_cache_size(mut self, blocks: usize) -> Self {
        self.cache_size = blocks;
        self
    }

    pub fn with_num_memtables(mut self, n: usize) -> Self {
        self.num_memtables = n;
        self
    }

    pub fn with_wal_sync(mut self, sync: bool) -> Self {
        self.wal_sync = sync;
        self
    }

    pub fn with_compression(mut self, on: bool) -> Self {
        self.compression = on;
        self
    }

    pub fn with_gc_interval(mut self, every: Duration) -> Self {
        self.gc_interval = every;
        self
    }

    pub fn with_compaction_interval(mut self, every: Duration) -> Self {
        self.compaction_interval = every;
        self
    }

    pub fn with_stats_interval(mut self, every: Duration) -> Self {
        self.stats_interval = every;
        self
    }

    pub fn with_write_stall_timeout(mut self, timeout: Duration) -> Self {
        self.write_stall_timeout = timeout;
        self
    }
}

struct EnvSource<'a> {
    prefix: &'a str,
}

impl EnvSource<'_> {
    fn var(&self, name: &str) -> Option<(String, String)> {
        let key = format!("{}{}", self.prefix, name);
        std::env::var(&key).ok().map(|v| (key, v))
    }

    fn string(&self, name: &str, default: &str) -> String {
        self.var(name)
            .map(|(_, v)| v)
            .unwrap_or_else(|| default.to_string())
    }

    fn parse<T: FromStr + Copy>(&self, name: &str, default: T) -> T {
        match self.var(name) {
            Some((key, raw)) => match raw.trim().parse() {
                Ok(v) => v,
                Err(_) => {
                    tracing::warn!(%key, value = %raw, "ignoring unparsable setting");
                    default
                }
            },
            None => default,
        }
    }

    fn millis(&self, name: &str, default: Duration) -> Duration {
        Duration::from_millis(self.parse(name, default.as_millis() as u64))
    }
}

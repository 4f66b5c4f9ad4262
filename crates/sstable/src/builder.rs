use std::fs::{rename, File, OpenOptions};
use std::io::{self, Write};
use std::path::Path;

use bloom::BloomFilter;
use codec::{parse_key, parse_version, Error, Result, ValueStruct};

use crate::format::{write_trailer, BlockHandle, BlockWriter, TableIndex, FLAG_COMPRESSED};

/// Knobs for building a table.
#[derive(Debug, Clone)]
pub struct TableOptions {
    /// Target uncompressed size of one data block.
    pub block_size: usize,
    /// Bloom filter false-positive target; 0 disables the filter.
    pub bloom_false_positive: f64,
    /// Compress data blocks with lz4.
    pub compression: bool,
    /// Size at which [`TableBuilder::reached_capacity`] reports true.
    pub table_size: usize,
}

impl Default for TableOptions {
    fn default() -> Self {
        Self {
            block_size: 4 * 1024,
            bloom_false_positive: 0.01,
            compression: false,
            table_size: 2 * 1024 * 1024,
        }
    }
}

/// Builds one SSTable from entries added in ascending internal-key order.
///
/// Finished blocks are kept in memory; [`finish`](TableBuilder::finish)
/// writes the whole file in one go. The write is crash-safe: data goes to a
/// temporary file, is fsynced, and is then atomically renamed into place.
pub struct TableBuilder {
    opts: TableOptions,
    buf: Vec<u8>,
    block: BlockWriter,
    block_first_key: Vec<u8>,
    handles: Vec<BlockHandle>,
    /// Distinct raw keys, for the bloom filter.
    raw_keys: Vec<Vec<u8>>,
    max_version: u64,
    stale_data_size: u64,
    key_count: u32,
}

impl TableBuilder {
    pub fn new(opts: TableOptions) -> Self {
        Self {
            opts,
            buf: Vec::new(),
            block: BlockWriter::default(),
            block_first_key: Vec::new(),
            handles: Vec::new(),
            raw_keys: Vec::new(),
            max_version: 0,
            stale_data_size: 0,
            key_count: 0,
        }
    }

    /// Appends `key` (an internal key) with its value cell.
    ///
    /// `is_stale` marks entries already known to be shadowed or deleted; their
    /// size feeds the table's stale-data hint used to pick compaction inputs.
    pub fn add(&mut self, key: &[u8], value: &ValueStruct, is_stale: bool) {
        let entry_size = 8 + key.len() + value.encoded_size();
        if !self.block.is_empty()
            && self.block.estimated_size() + entry_size > self.opts.block_size
        {
            self.finish_block();
        }
        if self.block.is_empty() {
            self.block_first_key = key.to_vec();
        }

        let raw = parse_key(key);
        if self.raw_keys.last().map(|k| k.as_slice()) != Some(raw) {
            self.raw_keys.push(raw.to_vec());
        }
        self.max_version = self.max_version.max(parse_version(key));
        if is_stale {
            self.stale_data_size += entry_size as u64;
        }
        self.key_count += 1;
        self.block.add(key, value);
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.key_count == 0
    }

    /// Approximate size of the file if finished now.
    #[must_use]
    pub fn estimated_size(&self) -> usize {
        let index: usize = self
            .handles
            .iter()
            .map(|h| h.first_key.len() + 12)
            .sum::<usize>()
            + self.block_first_key.len()
            + 12;
        let bloom = if self.opts.bloom_false_positive > 0.0 {
            self.raw_keys.len() * 10 / 8 + 16
        } else {
            0
        };
        self.buf.len() + self.block.estimated_size() + index + bloom + 32
    }

    #[must_use]
    pub fn reached_capacity(&self) -> bool {
        self.estimated_size() >= self.opts.table_size
    }

    fn finish_block(&mut self) {
        let data = self.block.finish(self.opts.compression);
        self.handles.push(BlockHandle {
            first_key: std::mem::take(&mut self.block_first_key),
            offset: self.buf.len() as u32,
            size: data.len() as u32,
        });
        self.buf.extend_from_slice(&data);
    }

    /// Serializes the table into its final byte image.
    pub fn build(mut self) -> Result<Vec<u8>> {
        if self.is_empty() {
            return Err(Error::InvalidArgument(
                "refusing to write an empty table".to_string(),
            ));
        }
        if !self.block.is_empty() {
            self.finish_block();
        }
        if self.buf.len() > u32::MAX as usize {
            return Err(Error::CapacityExceeded(format!(
                "table data of {} bytes exceeds the u32 offset range",
                self.buf.len()
            )));
        }

        let fpr = self.opts.bloom_false_positive;
        let bloom = if fpr > 0.0 && fpr < 1.0 {
            let mut bf = BloomFilter::new(self.raw_keys.len(), fpr);
            for k in &self.raw_keys {
                bf.insert(k);
            }
            Some(bf)
        } else {
            None
        };

        let index = TableIndex {
            flags: if self.opts.compression { FLAG_COMPRESSED } else { 0 },
            blocks: self.handles,
            bloom,
            max_version: self.max_version,
            stale_data_size: self.stale_data_size.min(u32::MAX as u64) as u32,
            key_count: self.key_count,
        }
        .encode()?;

        let mut out = self.buf;
        write_trailer(&mut out, &index);
        Ok(out)
    }

    /// Writes the table to `path`. Returns the file size.
    pub fn finish(self, path: &Path) -> Result<u64> {
        let data = self.build()?;

        let tmp_path = path.with_extension("sst.tmp");
        let mut file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&tmp_path)?;
        file.write_all(&data)?;
        file.sync_all()?;
        drop(file);

        rename(&tmp_path, path)?;
        sync_dir(path)?;
        Ok(data.len() as u64)
    }
}

/// Fsyncs the parent directory so a rename survives a crash.
pub fn sync_dir(path: &Path) -> io::Result<()> {
    let parent = match path.parent() {
        Some(p) if p.as_os_str().is_empty() => Path::new("."),
        Some(p) => p,
        None => return Ok(()),
    };
    File::open(parent)?.sync_all()
}

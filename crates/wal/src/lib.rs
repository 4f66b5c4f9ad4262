//! # WAL - Write-Ahead Log
//!
//! Provides crash-safe durability for the DriftKV storage engine.
//!
//! Every mutation is serialized into a binary record and appended to the WAL
//! of the memtable it targets **before** the in-memory update. Each memtable
//! generation owns one WAL file (`{fid:05}.wal`); the file is deleted only
//! once the memtable has been flushed to an SSTable recorded in the manifest.
//!
//! ## Binary Record Format
//!
//! ```text
//! [record_len: u32 LE][crc32: u32 LE][body ...]
//! ```
//!
//! Body: `[version: u64][meta: u8][expires_at: u64][key_len: u32][key][val_len: u32][value]`
//!
//! `record_len` includes the 4-byte CRC but **not** itself. Tombstones are
//! ordinary records with the delete bit set in `meta`.
//!
//! ## Recovery
//!
//! A crash can leave a partially written record at the end of the file. On
//! replay such a tail (truncated frame, zero padding, or a checksum mismatch
//! on the final record) is discarded and the length of the valid prefix is
//! reported so the caller can truncate the file. A checksum mismatch followed
//! by more data is real corruption and fails the replay.
//!
//! ## Example
//!
//! ```rust,no_run
//! use codec::Entry;
//! use wal::{WalReader, WalWriter};
//!
//! let mut w = WalWriter::create("00001.wal", true).unwrap();
//! w.append(&Entry::new("hello", "world")).unwrap();
//! drop(w);
//!
//! let mut r = WalReader::open("00001.wal").unwrap();
//! r.replay(|e| println!("{:?}", e)).unwrap();
//! ```

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use codec::{Entry, MAX_RECORD_SIZE};
use crc32fast::Hasher as Crc32;
use std::fs::{File, OpenOptions};
use std::io::{self, BufRead, BufReader, Read, Write};
use std::path::Path;
use std::thread;
use std::time::Duration;

use thiserror::Error;

/// Fixed part of a record body: version + meta + expires_at + key_len + val_len.
const BODY_FIXED: usize = 8 + 1 + 8 + 4 + 4;
const SYNC_RETRIES: u32 = 3;

/// Errors that can occur during WAL operations.
#[derive(Debug, Error)]
pub enum WalError {
    /// An underlying I/O error.
    #[error("io error: {0}")]
    Io(#[from] io::Error),

    /// A record failed CRC validation or could not be decoded.
    #[error("corrupt record at offset {0}")]
    Corrupt(u64),
}

impl From<WalError> for codec::Error {
    fn from(e: WalError) -> Self {
        match e {
            WalError::Io(e) => codec::Error::Io(e),
            WalError::Corrupt(at) => {
                codec::Error::Corruption(format!("wal record at offset {} is corrupt", at))
            }
        }
    }
}

/// Outcome of a successful replay.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReplayStats {
    /// Records handed to the callback.
    pub records: usize,
    /// Byte length of the valid prefix of the log.
    pub valid_len: u64,
    /// True when a damaged tail was discarded.
    pub truncated_tail: bool,
}

/// Append-only WAL writer.
///
/// Records are serialized into an in-memory buffer, CRC-checksummed, and then
/// written to the underlying file in a single `write_all` call. When `sync` is
/// `true`, every append is followed by `sync_all()` (fsync) to guarantee the
/// record is durable on disk before the call returns.
pub struct WalWriter {
    file: File,
    sync: bool,
    /// Bytes in the file, including records written before this writer opened it.
    size: u64,
    /// Reusable scratch buffer to avoid allocation on every append.
    buf: Vec<u8>,
}

impl WalWriter {
    /// Opens (or creates) a WAL file in append mode.
    ///
    /// # Arguments
    ///
    /// * `path` - file system path for the WAL (created if it does not exist).
    /// * `sync` - if true, every `append` call is followed by `fsync`.
    pub fn create<P: AsRef<Path>>(path: P, sync: bool) -> Result<Self, WalError> {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .read(true)
            .open(path)?;
        let size = file.metadata()?.len();
        Ok(Self {
            file,
            sync,
            size,
            buf: Vec::with_capacity(256),
        })
    }

    /// Serializes `entry` and appends it to the WAL file.
    pub fn append(&mut self, entry: &Entry) -> Result<(), WalError> {
        self.buf.clear();

        // Reserve 8 bytes for the frame header (record_len + crc), filled later
        self.buf.extend_from_slice(&[0u8; 8]);

        self.buf.write_u64::<LittleEndian>(entry.version)?;
        self.buf.write_u8(entry.meta)?;
        self.buf.write_u64::<LittleEndian>(entry.expires_at)?;
        self.buf.write_u32::<LittleEndian>(entry.key.len() as u32)?;
        self.buf.extend_from_slice(&entry.key);
        self.buf.write_u32::<LittleEndian>(entry.value.len() as u32)?;
        self.buf.extend_from_slice(&entry.value);

        let body = &self.buf[8..];
        let mut hasher = Crc32::new();
        hasher.update(body);
        let crc = hasher.finalize();

        // record_len = body.len() + 4 (CRC)
        let record_len = (body.len() as u64) + 4;
        if record_len > MAX_RECORD_SIZE as u64 {
            return Err(WalError::Io(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("WAL record of {} bytes exceeds the record limit", record_len),
            )));
        }

        self.buf[0..4].copy_from_slice(&(record_len as u32).to_le_bytes());
        self.buf[4..8].copy_from_slice(&crc.to_le_bytes());

        // Single write call for the entire frame
        self.file.write_all(&self.buf)?;
        self.file.flush()?;
        self.size += self.buf.len() as u64;

        if self.sync {
            self.sync_with_retry()?;
        }

        Ok(())
    }

    /// Forces all buffered data to be written to disk via `sync_all()`.
    pub fn sync_to_disk(&mut self) -> Result<(), WalError> {
        self.file.flush()?;
        self.sync_with_retry()
    }

    /// Current file length in bytes.
    #[must_use]
    pub fn size(&self) -> u64 {
        self.size
    }

    fn sync_with_retry(&mut self) -> Result<(), WalError> {
        let mut attempt = 0;
        loop {
            match self.file.sync_all() {
                Ok(()) => return Ok(()),
                Err(e) if is_transient(&e) && attempt < SYNC_RETRIES => {
                    attempt += 1;
                    tracing::warn!(attempt, error = %e, "wal sync failed, retrying");
                    thread::sleep(Duration::from_millis(5 << attempt));
                }
                Err(e) => return Err(WalError::Io(e)),
            }
        }
    }
}

fn is_transient(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::Interrupted | io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut
    )
}

/// Sequential WAL reader that yields valid records.
///
/// The reader is generic over any `Read` implementor, allowing it to be used
/// with real files (`WalReader<File>`) or in-memory buffers for testing.
pub struct WalReader<R: Read> {
    rdr: BufReader<R>,
}

impl WalReader<File> {
    /// Opens an existing WAL file for sequential replay.
    ///
    /// Returns `WalError::Io` if the file cannot be opened.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<WalReader<File>, WalError> {
        let f = File::open(path)?;
        Ok(WalReader {
            rdr: BufReader::new(f),
        })
    }
}

impl<R: Read> WalReader<R> {
    /// Constructs a reader from any `Read` implementor.
    ///
    /// Useful for unit tests that supply an in-memory buffer (e.g., `Cursor<Vec<u8>>`).
    pub fn from_reader(reader: R) -> Self {
        WalReader {
            rdr: BufReader::new(reader),
        }
    }

    /// Replays every valid record in the WAL, calling `apply` for each one.
    ///
    /// # Termination
    ///
    /// - **Clean EOF** -> `Ok`.
    /// - **Truncated tail**, **zero-length frame**, or **CRC mismatch on the
    ///   final record** -> `Ok` with `truncated_tail` set; the damaged bytes
    ///   are not part of `valid_len`.
    /// - **CRC mismatch followed by more data**, impossible lengths or an
    ///   undecodable body -> `Err(WalError::Corrupt)`.
    /// - **I/O error** -> `Err(WalError::Io(...))`.
    pub fn replay<F>(&mut self, mut apply: F) -> Result<ReplayStats, WalError>
    where
        F: FnMut(Entry),
    {
        let mut stats = ReplayStats::default();
        let mut body = Vec::with_capacity(256);

        loop {
            let record_start = stats.valid_len;

            if self.at_eof()? {
                return Ok(stats);
            }

            let record_len = match self.rdr.read_u32::<LittleEndian>() {
                Ok(v) => v,
                Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => {
                    return Ok(self.discard_tail(stats, "truncated frame header"));
                }
                Err(e) => return Err(WalError::Io(e)),
            };

            if record_len == 0 {
                // Zero padding left by a pre-allocated or torn write.
                tracing::warn!(offset = record_start, "wal ends in zero padding, discarding");
                stats.truncated_tail = true;
                return Ok(stats);
            }
            if record_len <= 4 || record_len > MAX_RECORD_SIZE {
                return Err(WalError::Corrupt(record_start));
            }

            let crc = match self.rdr.read_u32::<LittleEndian>() {
                Ok(v) => v,
                Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => {
                    return Ok(self.discard_tail(stats, "truncated frame header"));
                }
                Err(e) => return Err(WalError::Io(e)),
            };

            let body_len = (record_len - 4) as usize;
            body.clear();
            body.resize(body_len, 0);
            match self.rdr.read_exact(&mut body) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => {
                    return Ok(self.discard_tail(stats, "truncated record body"));
                }
                Err(e) => return Err(WalError::Io(e)),
            }

            let mut hasher = Crc32::new();
            hasher.update(&body);
            if hasher.finalize() != crc {
                if self.at_eof()? {
                    return Ok(self.discard_tail(stats, "checksum mismatch on final record"));
                }
                return Err(WalError::Corrupt(record_start));
            }

            let entry = decode_body(&body).ok_or(WalError::Corrupt(record_start))?;
            apply(entry);
            stats.records += 1;
            stats.valid_len = record_start + 4 + record_len as u64;
        }
    }

    fn at_eof(&mut self) -> Result<bool, WalError> {
        Ok(self.rdr.fill_buf()?.is_empty())
    }

    fn discard_tail(&self, mut stats: ReplayStats, reason: &str) -> ReplayStats {
        tracing::warn!(
            offset = stats.valid_len,
            reason,
            "discarding damaged wal tail"
        );
        stats.truncated_tail = true;
        stats
    }
}

fn decode_body(body: &[u8]) -> Option<Entry> {
    if body.len() < BODY_FIXED {
        return None;
    }
    let mut br = body;
    let version = br.read_u64::<LittleEndian>().ok()?;
    let meta = br.read_u8().ok()?;
    let expires_at = br.read_u64::<LittleEndian>().ok()?;
    let key_len = br.read_u32::<LittleEndian>().ok()? as usize;
    if key_len > br.len() {
        return None;
    }
    let (key, mut br) = br.split_at(key_len);
    let val_len = br.read_u32::<LittleEndian>().ok()? as usize;
    if val_len != br.len() {
        return None;
    }
    Some(Entry {
        key: key.to_vec(),
        value: br.to_vec(),
        expires_at,
        meta,
        version,
    })
}

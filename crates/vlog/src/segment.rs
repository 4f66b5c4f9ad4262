//! Value log segment files and their record format.
//!
//! ```text
//! [key_len u32][value_len u32][meta u8][expires_at u64][key][value][crc32 u32]
//! ```
//!
//! Integers are little-endian; the CRC covers everything before it.

use std::fs::{File, OpenOptions};
use std::io::{self, BufReader, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use byteorder::{ByteOrder, LittleEndian, WriteBytesExt};
use codec::{Entry, Error, Result};
use crc32fast::Hasher as Crc32;
use parking_lot::Mutex;

pub const HEADER_LEN: usize = 4 + 4 + 1 + 8;
pub const CRC_LEN: usize = 4;

/// Refuse to allocate for records larger than this while scanning.
const MAX_RECORD_LEN: usize = 1 << 30;

pub fn segment_file_name(fid: u64) -> String {
    format!("{:05}.vlog", fid)
}

pub fn parse_segment_file_name(name: &str) -> Option<u64> {
    name.strip_suffix(".vlog")?.parse().ok()
}

/// Serializes `entry` as one record.
pub fn encode_record(entry: &Entry) -> Result<Vec<u8>> {
    let len = HEADER_LEN + entry.key.len() + entry.value.len() + CRC_LEN;
    let mut buf = Vec::with_capacity(len);
    buf.write_u32::<LittleEndian>(entry.key.len() as u32)?;
    buf.write_u32::<LittleEndian>(entry.value.len() as u32)?;
    buf.write_u8(entry.meta)?;
    buf.write_u64::<LittleEndian>(entry.expires_at)?;
    buf.extend_from_slice(&entry.key);
    buf.extend_from_slice(&entry.value);
    let crc = crc32(&buf);
    buf.write_u32::<LittleEndian>(crc)?;
    Ok(buf)
}

/// Parses a complete record, verifying its checksum.
pub fn decode_record(buf: &[u8]) -> Result<Entry> {
    if buf.len() < HEADER_LEN + CRC_LEN {
        return Err(Error::corruption("value log record too short"));
    }
    let (body, crc) = buf.split_at(buf.len() - CRC_LEN);
    if crc32(body) != LittleEndian::read_u32(crc) {
        return Err(Error::corruption("value log record checksum mismatch"));
    }
    let key_len = LittleEndian::read_u32(&body[0..4]) as usize;
    let val_len = LittleEndian::read_u32(&body[4..8]) as usize;
    if HEADER_LEN + key_len + val_len != body.len() {
        return Err(Error::corruption("value log record lengths disagree"));
    }
    let key_end = HEADER_LEN + key_len;
    Ok(Entry {
        key: body[HEADER_LEN..key_end].to_vec(),
        value: body[key_end..].to_vec(),
        meta: body[8],
        expires_at: LittleEndian::read_u64(&body[9..17]),
        version: 0,
    })
}

fn crc32(data: &[u8]) -> u32 {
    let mut hasher = Crc32::new();
    hasher.update(data);
    hasher.finalize()
}

/// Read handle on one segment file.
pub struct Segment {
    fid: u64,
    path: PathBuf,
    file: Mutex<File>,
}

impl Segment {
    pub fn open(dir: &Path, fid: u64) -> Result<Self> {
        let path = dir.join(segment_file_name(fid));
        let file = File::open(&path)?;
        Ok(Self {
            fid,
            path,
            file: Mutex::new(file),
        })
    }

    pub fn fid(&self) -> u64 {
        self.fid
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Reads `len` bytes at `offset`.
    pub fn read_at(&self, offset: u64, len: usize) -> Result<Vec<u8>> {
        let mut buf = vec![0u8; len];
        let mut f = self.file.lock();
        f.seek(SeekFrom::Start(offset))?;
        f.read_exact(&mut buf).map_err(|e| match e.kind() {
            io::ErrorKind::UnexpectedEof => Error::Corruption(format!(
                "value log {:05} has no record at {}+{}",
                self.fid, offset, len
            )),
            _ => Error::Io(e),
        })?;
        Ok(buf)
    }
}

/// Append handle on the segment currently being written.
pub struct ActiveSegment {
    pub fid: u64,
    file: File,
    pub size: u64,
}

impl ActiveSegment {
    /// Opens `fid` for appending, creating it if needed.
    pub fn open(dir: &Path, fid: u64) -> Result<Self> {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(dir.join(segment_file_name(fid)))?;
        let size = file.metadata()?.len();
        Ok(Self { fid, file, size })
    }

    /// Appends a record, returning its offset.
    pub fn append(&mut self, record: &[u8]) -> Result<u64> {
        let offset = self.size;
        self.file.write_all(record)?;
        self.size += record.len() as u64;
        Ok(offset)
    }

    pub fn sync(&mut self) -> Result<()> {
        self.file.flush()?;
        self.file.sync_all()?;
        Ok(())
    }
}

/// Result of scanning a segment.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ScanStats {
    pub records: usize,
    /// Length of the valid prefix.
    pub valid_len: u64,
    pub truncated_tail: bool,
}

/// Calls `f(entry, offset, record_len)` for every record of the segment at
/// `path`. A torn final record is reported through `truncated_tail`; a bad
/// record followed by more data is corruption.
pub fn scan<F>(path: &Path, mut f: F) -> Result<ScanStats>
where
    F: FnMut(Entry, u64, u32) -> Result<()>,
{
    let file = File::open(path)?;
    let file_len = file.metadata()?.len();
    let mut r = BufReader::new(file);
    let mut stats = ScanStats::default();
    let mut header = [0u8; HEADER_LEN];

    while stats.valid_len < file_len {
        let offset = stats.valid_len;
        let remaining = file_len - offset;
        if remaining < (HEADER_LEN + CRC_LEN) as u64 {
            stats.truncated_tail = true;
            break;
        }
        r.read_exact(&mut header)?;
        let key_len = LittleEndian::read_u32(&header[0..4]) as usize;
        let val_len = LittleEndian::read_u32(&header[4..8]) as usize;
        let rec_len = HEADER_LEN + key_len + val_len + CRC_LEN;
        if rec_len > MAX_RECORD_LEN || rec_len as u64 > remaining {
            stats.truncated_tail = true;
            break;
        }

        let mut record = Vec::with_capacity(rec_len);
        record.extend_from_slice(&header);
        record.resize(rec_len, 0);
        r.read_exact(&mut record[HEADER_LEN..])?;

        let entry = match decode_record(&record) {
            Ok(entry) => entry,
            Err(e) => {
                if offset + rec_len as u64 == file_len {
                    stats.truncated_tail = true;
                    break;
                }
                return Err(Error::Corruption(format!(
                    "{} at offset {}: {}",
                    path.display(),
                    offset,
                    e
                )));
            }
        };
        f(entry, offset, rec_len as u32)?;
        stats.records += 1;
        stats.valid_len += rec_len as u64;
    }

    if stats.truncated_tail {
        tracing::warn!(
            path = %path.display(),
            offset = stats.valid_len,
            "value log ends in a torn record"
        );
    }
    Ok(stats)
}

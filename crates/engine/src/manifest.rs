//! # Manifest - table to level mapping
//!
//! Records which SSTables belong to which level and the checksum of each
//! table's index, plus the next free file id and how many tables were ever
//! created and deleted, so the level structure can be rebuilt and checked
//! after a restart.
//!
//! ## File Format
//!
//! A small text file, one table per line, closed by a checksum line:
//!
//! ```text
//! # DriftKV manifest
//! # Format: L<level>:<fid>:<index crc>
//! next_fid:12
//! creations:9
//! deletions:6
//! L0:00011:5e0a17c2
//! L1:00004:90b3aa01
//! L1:00007:0c44f1d9
//! crc:1c291ca3
//! ```
//!
//! The CRC32 covers every byte before the `crc:` line. A file without one,
//! or with a mismatching one, is corruption.
//!
//! ## Crash Safety
//!
//! The manifest is rewritten whole: write `MANIFEST.tmp`, fsync, rename over
//! `MANIFEST`, fsync the directory. Readers see either the old or the new
//! file, never a mix.

use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use codec::{Error, Result};
use sstable::sync_dir;

/// Name of the manifest file within the work directory.
pub const MANIFEST_FILENAME: &str = "MANIFEST";

const MANIFEST_TMP_FILENAME: &str = "MANIFEST.tmp";
const CRC_PREFIX: &str = "crc:";
const NEXT_FID_PREFIX: &str = "next_fid:";
const CREATIONS_PREFIX: &str = "creations:";
const DELETIONS_PREFIX: &str = "deletions:";

/// Level and index checksum of one table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TableMeta {
    pub fid: u64,
    pub level: usize,
    pub checksum: u32,
}

/// In-memory copy of the manifest.
#[derive(Debug, Clone)]
pub struct Manifest {
    path: PathBuf,
    /// Tables in file order: by level, then in the order they were added.
    pub entries: Vec<TableMeta>,
    /// Lowest file id not used by any table or WAL at the last save.
    pub next_fid: u64,
    /// Tables ever added.
    pub creations: u64,
    /// Tables ever removed.
    pub deletions: u64,
}

impl Manifest {
    /// Loads `dir/MANIFEST`, or returns an empty manifest if there is none.
    ///
    /// # Errors
    ///
    /// A checksum mismatch or an unparsable line is [`Error::Corruption`].
    pub fn load_or_create(dir: &Path) -> Result<Self> {
        let path = dir.join(MANIFEST_FILENAME);
        let text = match fs::read_to_string(&path) {
            Ok(text) => text,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Ok(Self {
                    path,
                    entries: Vec::new(),
                    next_fid: 1,
                    creations: 0,
                    deletions: 0,
                })
            }
            Err(e) => return Err(e.into()),
        };

        let body = verify_checksum(&text)?;
        let mut entries = Vec::new();
        let mut next_fid = 1;
        let mut creations = 0;
        let mut deletions = 0;
        for (line_num, line) in body.lines().enumerate() {
            let trimmed = line.trim();
            if trimmed.is_empty() || trimmed.starts_with('#') {
                continue;
            }
            let bad_line = || {
                Error::Corruption(format!(
                    "manifest line {}: cannot parse '{}'",
                    line_num + 1,
                    trimmed
                ))
            };

            if let Some(n) = trimmed.strip_prefix(NEXT_FID_PREFIX) {
                next_fid = n.parse().map_err(|_| bad_line())?;
                continue;
            }
            if let Some(n) = trimmed.strip_prefix(CREATIONS_PREFIX) {
                creations = n.parse().map_err(|_| bad_line())?;
                continue;
            }
            if let Some(n) = trimmed.strip_prefix(DELETIONS_PREFIX) {
                deletions = n.parse().map_err(|_| bad_line())?;
                continue;
            }
            // Expected format: "L<level>:<fid>:<crc>"
            let mut parts = trimmed.strip_prefix('L').ok_or_else(bad_line)?.split(':');
            let (level, fid, crc) = match (parts.next(), parts.next(), parts.next(), parts.next()) {
                (Some(level), Some(fid), Some(crc), None) => (level, fid, crc),
                _ => return Err(bad_line()),
            };
            entries.push(TableMeta {
                level: level.parse().map_err(|_| bad_line())?,
                fid: fid.parse().map_err(|_| bad_line())?,
                checksum: u32::from_str_radix(crc, 16).map_err(|_| bad_line())?,
            });
        }

        Ok(Self {
            path,
            entries,
            next_fid,
            creations,
            deletions,
        })
    }

    /// Writes the manifest atomically.
    pub fn save(&self) -> Result<()> {
        let tmp_path = self.path.with_file_name(MANIFEST_TMP_FILENAME);
        {
            let mut f = OpenOptions::new()
                .create(true)
                .write(true)
                .truncate(true)
                .open(&tmp_path)?;
            f.write_all(self.render().as_bytes())?;
            f.flush()?;
            f.sync_all()?;
        }
        fs::rename(&tmp_path, &self.path)?;
        sync_dir(&self.path)?;
        Ok(())
    }

    fn render(&self) -> String {
        let mut out = String::new();
        out.push_str("# DriftKV manifest\n");
        out.push_str("# Format: L<level>:<fid>:<index crc>\n");
        out.push_str(&format!("{}{}\n", NEXT_FID_PREFIX, self.next_fid));
        out.push_str(&format!("{}{}\n", CREATIONS_PREFIX, self.creations));
        out.push_str(&format!("{}{}\n", DELETIONS_PREFIX, self.deletions));
        let mut sorted = self.entries.clone();
        // Stable sort keeps insertion order inside a level.
        sorted.sort_by_key(|e| e.level);
        for e in &sorted {
            out.push_str(&format!("L{}:{:05}:{:08x}\n", e.level, e.fid, e.checksum));
        }
        let crc = crc32fast::hash(out.as_bytes());
        out.push_str(&format!("{}{:08x}\n", CRC_PREFIX, crc));
        out
    }

    /// File ids of the tables at `level`, in the order they were added.
    pub fn tables_at(&self, level: usize) -> Vec<u64> {
        self.entries
            .iter()
            .filter(|e| e.level == level)
            .map(|e| e.fid)
            .collect()
    }

    /// Entry of table `fid`, if listed.
    pub fn table(&self, fid: u64) -> Option<&TableMeta> {
        self.entries.iter().find(|e| e.fid == fid)
    }

    /// Adds a table (does **not** save to disk).
    pub fn add(&mut self, fid: u64, level: usize, checksum: u32) {
        self.entries.push(TableMeta {
            fid,
            level,
            checksum,
        });
        self.creations += 1;
    }

    /// Drops every entry whose fid is in `fids` (does **not** save to disk).
    pub fn remove(&mut self, fids: &[u64]) {
        let before = self.entries.len();
        self.entries.retain(|e| !fids.contains(&e.fid));
        self.deletions += (before - self.entries.len()) as u64;
    }
}

/// Returns the part of `text` the trailing `crc:` line covers.
fn verify_checksum(text: &str) -> Result<&str> {
    let trimmed = text.trim_end_matches('\n');
    let split = trimmed.rfind('\n').map_or(0, |i| i + 1);
    let (body, last) = trimmed.split_at(split);
    let stored = last
        .strip_prefix(CRC_PREFIX)
        .and_then(|hex| u32::from_str_radix(hex.trim(), 16).ok())
        .ok_or_else(|| Error::corruption("manifest has no checksum line"))?;
    let actual = crc32fast::hash(body.as_bytes());
    if stored != actual {
        return Err(Error::Corruption(format!(
            "manifest checksum mismatch: stored {:08x}, computed {:08x}",
            stored, actual
        )));
    }
    Ok(body)
}

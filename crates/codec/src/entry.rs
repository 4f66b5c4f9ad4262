use std::time::{Duration, SystemTime, UNIX_EPOCH};

use crate::{ValueStruct, BIT_DELETE};

/// Largest WAL record body; larger records are refused on append and
/// treated as corruption on replay.
pub const MAX_RECORD_SIZE: u32 = 64 * 1024 * 1024;

/// Current wall-clock time in Unix seconds.
pub fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// A single key-value mutation or read result.
///
/// `key` is the raw user key at the facade; the engine stamps `version` on
/// write. A tombstone carries [`BIT_DELETE`] in `meta` and an empty value.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Entry {
    pub key: Vec<u8>,
    pub value: Vec<u8>,
    /// Unix seconds; 0 means the entry never expires.
    pub expires_at: u64,
    pub meta: u8,
    pub version: u64,
}

impl Entry {
    pub fn new(key: impl Into<Vec<u8>>, value: impl Into<Vec<u8>>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
            ..Default::default()
        }
    }

    /// A deletion marker for `key`.
    pub fn tombstone(key: impl Into<Vec<u8>>) -> Self {
        Self {
            key: key.into(),
            meta: BIT_DELETE,
            ..Default::default()
        }
    }

    /// Sets the expiry to `ttl` from now.
    #[must_use]
    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.expires_at = now_secs() + ttl.as_secs().max(1);
        self
    }

    #[must_use]
    pub fn is_deleted(&self) -> bool {
        self.meta & BIT_DELETE != 0
    }

    #[must_use]
    pub fn is_expired(&self, now: u64) -> bool {
        self.expires_at != 0 && self.expires_at <= now
    }

    /// The value cell written to the memtable for this entry.
    #[must_use]
    pub fn value_struct(&self) -> ValueStruct {
        ValueStruct {
            meta: self.meta,
            value: self.value.clone(),
            expires_at: self.expires_at,
            version: self.version,
        }
    }

    /// Approximate in-memory footprint, used for memtable accounting.
    #[must_use]
    pub fn estimate_size(&self) -> usize {
        self.key.len() + self.value.len() + 8 + 8 + 1
    }
}

//! Internal key encoding.
//!
//! ```text
//! [raw key bytes][u64::MAX - version : u64 BE]
//! ```
//!
//! Comparing two internal keys compares the raw prefixes first; on a tie the
//! suffixes are compared bytewise, which puts higher versions first.

use std::cmp::Ordering;

use crate::{Error, Result};

/// Length of the version suffix appended to every internal key.
pub const VERSION_LEN: usize = 8;

/// Builds the internal key for `raw` at `version`.
pub fn key_with_version(raw: &[u8], version: u64) -> Vec<u8> {
    let mut out = Vec::with_capacity(raw.len() + VERSION_LEN);
    out.extend_from_slice(raw);
    out.extend_from_slice(&(u64::MAX - version).to_be_bytes());
    out
}

/// Returns the raw key part of an internal key.
///
/// Keys shorter than the suffix are returned unchanged; use
/// [`check_internal_key`] at trust boundaries.
pub fn parse_key(key: &[u8]) -> &[u8] {
    if key.len() < VERSION_LEN {
        return key;
    }
    &key[..key.len() - VERSION_LEN]
}

/// Returns the version encoded in an internal key, or 0 if it has no suffix.
pub fn parse_version(key: &[u8]) -> u64 {
    if key.len() < VERSION_LEN {
        return 0;
    }
    let mut buf = [0u8; VERSION_LEN];
    buf.copy_from_slice(&key[key.len() - VERSION_LEN..]);
    u64::MAX - u64::from_be_bytes(buf)
}

/// Orders internal keys: raw key ascending, then version descending.
pub fn compare_keys(a: &[u8], b: &[u8]) -> Ordering {
    match parse_key(a).cmp(parse_key(b)) {
        Ordering::Equal => suffix(a).cmp(suffix(b)),
        other => other,
    }
}

/// Returns true if both internal keys carry the same raw key.
pub fn same_key(a: &[u8], b: &[u8]) -> bool {
    parse_key(a) == parse_key(b)
}

/// Rejects keys that are too short to carry a version suffix.
pub fn check_internal_key(key: &[u8]) -> Result<()> {
    if key.len() < VERSION_LEN {
        return Err(Error::Corruption(format!(
            "internal key of {} bytes has no version suffix",
            key.len()
        )));
    }
    Ok(())
}

fn suffix(key: &[u8]) -> &[u8] {
    if key.len() < VERSION_LEN {
        return &[];
    }
    &key[key.len() - VERSION_LEN..]
}

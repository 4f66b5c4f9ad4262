//! Value cells and value-log pointers.

use byteorder::{BigEndian, ByteOrder};

use crate::{Error, Result};

/// Meta bit: the entry is a tombstone.
pub const BIT_DELETE: u8 = 1 << 0;
/// Meta bit: the value bytes are an encoded [`ValuePtr`].
pub const BIT_VALUE_POINTER: u8 = 1 << 1;

/// Encoded size of a [`ValuePtr`].
pub const VALUE_PTR_LEN: usize = 16;

/// The value cell stored in memtables and SSTables.
///
/// Encoded as `meta(u8) | expires_at(varint) | value`. The version is not
/// part of the encoding; it lives in the internal key suffix.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ValueStruct {
    pub meta: u8,
    pub value: Vec<u8>,
    pub expires_at: u64,
    pub version: u64,
}

impl ValueStruct {
    pub fn new(value: Vec<u8>, meta: u8, expires_at: u64) -> Self {
        Self {
            meta,
            value,
            expires_at,
            version: 0,
        }
    }

    /// Number of bytes [`encode_to`](Self::encode_to) writes.
    #[must_use]
    pub fn encoded_size(&self) -> usize {
        1 + varint_len(self.expires_at) + self.value.len()
    }

    /// Appends the encoding to `buf`.
    pub fn encode_to(&self, buf: &mut Vec<u8>) {
        buf.push(self.meta);
        put_uvarint(buf, self.expires_at);
        buf.extend_from_slice(&self.value);
    }

    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(self.encoded_size());
        self.encode_to(&mut buf);
        buf
    }

    /// Decodes a value cell. The version is left at 0 for the caller to fill in.
    pub fn decode(buf: &[u8]) -> Result<Self> {
        let (&meta, rest) = buf
            .split_first()
            .ok_or_else(|| Error::corruption("empty value cell"))?;
        let (expires_at, n) = get_uvarint(rest)
            .ok_or_else(|| Error::corruption("malformed expiry in value cell"))?;
        Ok(Self {
            meta,
            value: rest[n..].to_vec(),
            expires_at,
            version: 0,
        })
    }

    /// Checks that `buf` would decode, without copying the value.
    pub fn check_encoded(buf: &[u8]) -> Result<()> {
        match buf.split_first() {
            Some((_, rest)) if get_uvarint(rest).is_some() => Ok(()),
            _ => Err(Error::corruption("malformed value cell")),
        }
    }

    #[must_use]
    pub fn is_deleted(&self) -> bool {
        self.meta & BIT_DELETE != 0
    }

    #[must_use]
    pub fn is_value_pointer(&self) -> bool {
        self.meta & BIT_VALUE_POINTER != 0
    }

    /// True when the cell is a tombstone or has expired at `now` (Unix seconds).
    #[must_use]
    pub fn is_deleted_or_expired(&self, now: u64) -> bool {
        self.is_deleted() || (self.expires_at != 0 && self.expires_at <= now)
    }
}

/// Location of a value stored in the value log.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ValuePtr {
    pub fid: u64,
    pub offset: u32,
    pub len: u32,
}

impl ValuePtr {
    /// Big-endian `fid | offset | len`.
    #[must_use]
    pub fn encode(&self) -> [u8; VALUE_PTR_LEN] {
        let mut out = [0u8; VALUE_PTR_LEN];
        BigEndian::write_u64(&mut out[0..8], self.fid);
        BigEndian::write_u32(&mut out[8..12], self.offset);
        BigEndian::write_u32(&mut out[12..16], self.len);
        out
    }

    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() != VALUE_PTR_LEN {
            return Err(Error::Corruption(format!(
                "value pointer must be {} bytes, got {}",
                VALUE_PTR_LEN,
                buf.len()
            )));
        }
        Ok(Self {
            fid: BigEndian::read_u64(&buf[0..8]),
            offset: BigEndian::read_u32(&buf[8..12]),
            len: BigEndian::read_u32(&buf[12..16]),
        })
    }
}

fn varint_len(mut v: u64) -> usize {
    let mut n = 1;
    while v >= 0x80 {
        v >>= 7;
        n += 1;
    }
    n
}

fn put_uvarint(buf: &mut Vec<u8>, mut v: u64) {
    while v >= 0x80 {
        buf.push((v as u8) | 0x80);
        v >>= 7;
    }
    buf.push(v as u8);
}

fn get_uvarint(buf: &[u8]) -> Option<(u64, usize)> {
    let mut v = 0u64;
    let mut shift = 0u32;
    for (i, &b) in buf.iter().enumerate() {
        if shift >= 64 {
            return None;
        }
        v |= u64::from(b & 0x7f) << shift;
        if b & 0x80 == 0 {
            return Some((v, i + 1));
        }
        shift += 7;
    }
    None
}

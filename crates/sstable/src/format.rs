//! SSTable binary format: data blocks, the block index and the trailer.
//!
//! ```text
//! [block 0] ... [block n-1] [index] [index_len u32] [checksum] [checksum_len u32]
//!
//! block   = [payload][crc32 u32]            payload is lz4 when FLAG_COMPRESSED
//! payload = [entry]* [entry_offset u32]* [entry_count u32]
//! entry   = [key_len u32][key][value_len u32][encoded ValueStruct]
//! index   = [flags u8][block_count u32] ([key_len u32][first_key][offset u32][size u32])*
//!           [bloom_len u32][bloom] [max_version u64] [stale_data_size u32] [key_count u32]
//! ```
//!
//! All integers are little-endian. The trailer is read backwards: the
//! checksum length, then the checksum (CRC32 of the index), then the index
//! length, then the index itself.

use std::io::Cursor;

use bloom::BloomFilter;
use byteorder::{ByteOrder, LittleEndian, ReadBytesExt, WriteBytesExt};
use codec::{Error, Result, ValueStruct};
use crc32fast::Hasher as Crc32;

/// Index flag: block payloads are lz4-compressed.
pub const FLAG_COMPRESSED: u8 = 1;

/// Length of the CRC32 that ends every block and the trailer checksum.
pub const CHECKSUM_LEN: usize = 4;

pub fn crc32(data: &[u8]) -> u32 {
    let mut hasher = Crc32::new();
    hasher.update(data);
    hasher.finalize()
}

/// Location of one data block and the first key it holds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockHandle {
    pub first_key: Vec<u8>,
    pub offset: u32,
    pub size: u32,
}

/// Decoded index of a table.
#[derive(Debug)]
pub struct TableIndex {
    pub flags: u8,
    pub blocks: Vec<BlockHandle>,
    pub bloom: Option<BloomFilter>,
    pub max_version: u64,
    pub stale_data_size: u32,
    pub key_count: u32,
}

impl TableIndex {
    pub fn compressed(&self) -> bool {
        self.flags & FLAG_COMPRESSED != 0
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        let mut buf = Vec::with_capacity(64 + self.blocks.len() * 32);
        buf.write_u8(self.flags)?;
        buf.write_u32::<LittleEndian>(self.blocks.len() as u32)?;
        for b in &self.blocks {
            buf.write_u32::<LittleEndian>(b.first_key.len() as u32)?;
            buf.extend_from_slice(&b.first_key);
            buf.write_u32::<LittleEndian>(b.offset)?;
            buf.write_u32::<LittleEndian>(b.size)?;
        }
        match &self.bloom {
            Some(bf) => {
                let raw = bf.encode();
                buf.write_u32::<LittleEndian>(raw.len() as u32)?;
                buf.extend_from_slice(&raw);
            }
            None => buf.write_u32::<LittleEndian>(0)?,
        }
        buf.write_u64::<LittleEndian>(self.max_version)?;
        buf.write_u32::<LittleEndian>(self.stale_data_size)?;
        buf.write_u32::<LittleEndian>(self.key_count)?;
        Ok(buf)
    }

    pub fn decode(data: &[u8]) -> Result<Self> {
        decode_index(data).map_err(|e| Error::Corruption(format!("malformed table index: {}", e)))
    }
}

fn decode_index(data: &[u8]) -> std::io::Result<TableIndex> {
    let mut r = Cursor::new(data);
    let flags = r.read_u8()?;
    let block_count = r.read_u32::<LittleEndian>()? as usize;
    // Each handle needs at least 12 bytes; reject counts the index cannot hold.
    if block_count > data.len() / 12 {
        return Err(invalid("block count exceeds index size"));
    }
    let mut blocks = Vec::with_capacity(block_count);
    for _ in 0..block_count {
        let key_len = r.read_u32::<LittleEndian>()? as usize;
        let first_key = read_bytes(&mut r, key_len)?;
        let offset = r.read_u32::<LittleEndian>()?;
        let size = r.read_u32::<LittleEndian>()?;
        blocks.push(BlockHandle {
            first_key,
            offset,
            size,
        });
    }
    let bloom_len = r.read_u32::<LittleEndian>()? as usize;
    let bloom = if bloom_len > 0 {
        let raw = read_bytes(&mut r, bloom_len)?;
        Some(BloomFilter::decode(&raw)?)
    } else {
        None
    };
    let max_version = r.read_u64::<LittleEndian>()?;
    let stale_data_size = r.read_u32::<LittleEndian>()?;
    let key_count = r.read_u32::<LittleEndian>()?;
    if r.position() as usize != data.len() {
        return Err(invalid("trailing bytes after index"));
    }
    Ok(TableIndex {
        flags,
        blocks,
        bloom,
        max_version,
        stale_data_size,
        key_count,
    })
}

fn read_bytes(r: &mut Cursor<&[u8]>, len: usize) -> std::io::Result<Vec<u8>> {
    let start = r.position() as usize;
    let data = *r.get_ref();
    if data.len() - start < len {
        return Err(std::io::ErrorKind::UnexpectedEof.into());
    }
    r.set_position((start + len) as u64);
    Ok(data[start..start + len].to_vec())
}

fn invalid(msg: &str) -> std::io::Error {
    std::io::Error::new(std::io::ErrorKind::InvalidData, msg)
}

/// Appends `[index][index_len][checksum][checksum_len]` to `out`.
pub fn write_trailer(out: &mut Vec<u8>, index: &[u8]) {
    out.extend_from_slice(index);
    out.extend_from_slice(&(index.len() as u32).to_le_bytes());
    out.extend_from_slice(&crc32(index).to_le_bytes());
    out.extend_from_slice(&(CHECKSUM_LEN as u32).to_le_bytes());
}

/// Reads the trailer backwards and returns the verified index bytes and the
/// offset where the index starts.
pub fn read_trailer(data: &[u8]) -> Result<(&[u8], usize)> {
    let mut end = data.len();

    let checksum_len = read_u32_before(data, end, "checksum length")? as usize;
    end -= 4;
    if checksum_len != CHECKSUM_LEN || end < checksum_len {
        return Err(Error::Corruption(format!(
            "bad trailer checksum length {}",
            checksum_len
        )));
    }
    let expected = LittleEndian::read_u32(&data[end - checksum_len..end]);
    end -= checksum_len;

    let index_len = read_u32_before(data, end, "index length")? as usize;
    end -= 4;
    if index_len > end {
        return Err(Error::Corruption(format!(
            "index length {} exceeds file size",
            index_len
        )));
    }
    let start = end - index_len;
    let index = &data[start..end];
    let actual = crc32(index);
    if actual != expected {
        return Err(Error::Corruption(format!(
            "index checksum mismatch: expected {:#010x}, got {:#010x}",
            expected, actual
        )));
    }
    Ok((index, start))
}

fn read_u32_before(data: &[u8], end: usize, what: &str) -> Result<u32> {
    if end < 4 {
        return Err(Error::Corruption(format!("table truncated before {}", what)));
    }
    Ok(LittleEndian::read_u32(&data[end - 4..end]))
}

#[derive(Debug, Clone, Copy)]
struct EntryPos {
    key_start: u32,
    key_end: u32,
    val_end: u32,
}

/// A decoded, checksum-verified data block.
///
/// Entry positions are validated on decode, so accessors never fail.
#[derive(Debug)]
pub struct Block {
    data: Vec<u8>,
    entries: Vec<EntryPos>,
}

impl Block {
    /// Verifies the trailing CRC, decompresses if needed and decodes the
    /// entry table.
    pub fn decode(raw: &[u8], compressed: bool) -> Result<Self> {
        if raw.len() < CHECKSUM_LEN {
            return Err(Error::corruption("block shorter than its checksum"));
        }
        let (payload, crc) = raw.split_at(raw.len() - CHECKSUM_LEN);
        let expected = LittleEndian::read_u32(crc);
        if crc32(payload) != expected {
            return Err(Error::corruption("block checksum mismatch"));
        }
        let data = if compressed {
            lz4_flex::decompress_size_prepended(payload)
                .map_err(|e| Error::Corruption(format!("block decompression failed: {}", e)))?
        } else {
            payload.to_vec()
        };
        Self::parse(data)
    }

    fn parse(data: Vec<u8>) -> Result<Self> {
        if data.len() < 4 {
            return Err(Error::corruption("block without entry count"));
        }
        let count = LittleEndian::read_u32(&data[data.len() - 4..]) as usize;
        let table_len = count
            .checked_mul(4)
            .and_then(|n| n.checked_add(4))
            .filter(|&n| n <= data.len())
            .ok_or_else(|| Error::corruption("block entry count exceeds block size"))?;
        let entries_end = data.len() - table_len;

        let mut entries = Vec::with_capacity(count);
        for i in 0..count {
            let at = entries_end + i * 4;
            let off = LittleEndian::read_u32(&data[at..at + 4]) as usize;
            let pos = parse_entry(&data[..entries_end], off)?;
            codec::check_internal_key(&data[pos.key_start as usize..pos.key_end as usize])?;
            ValueStruct::check_encoded(&data[pos.key_end as usize + 4..pos.val_end as usize])?;
            entries.push(pos);
        }
        Ok(Self { data, entries })
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn key(&self, i: usize) -> &[u8] {
        let e = self.entries[i];
        &self.data[e.key_start as usize..e.key_end as usize]
    }

    /// Encoded value cell of entry `i`.
    pub fn value(&self, i: usize) -> &[u8] {
        let e = self.entries[i];
        &self.data[e.key_end as usize + 4..e.val_end as usize]
    }

    /// In-memory footprint, used for cache sizing diagnostics.
    pub fn size(&self) -> usize {
        self.data.len() + self.entries.len() * std::mem::size_of::<EntryPos>()
    }
}

fn parse_entry(region: &[u8], off: usize) -> Result<EntryPos> {
    let bad = || Error::Corruption(format!("block entry at {} is out of bounds", off));
    let key_len = region
        .get(off..off + 4)
        .map(LittleEndian::read_u32)
        .ok_or_else(bad)? as usize;
    let key_start = off + 4;
    let key_end = key_start.checked_add(key_len).ok_or_else(bad)?;
    let val_len = region
        .get(key_end..key_end + 4)
        .map(LittleEndian::read_u32)
        .ok_or_else(bad)? as usize;
    let val_end = (key_end + 4).checked_add(val_len).ok_or_else(bad)?;
    if val_end > region.len() {
        return Err(bad());
    }
    Ok(EntryPos {
        key_start: key_start as u32,
        key_end: key_end as u32,
        val_end: val_end as u32,
    })
}

/// Accumulates entries of one block.
#[derive(Debug, Default)]
pub struct BlockWriter {
    data: Vec<u8>,
    offsets: Vec<u32>,
}

impl BlockWriter {
    pub fn add(&mut self, key: &[u8], value: &ValueStruct) {
        self.offsets.push(self.data.len() as u32);
        self.data.extend_from_slice(&(key.len() as u32).to_le_bytes());
        self.data.extend_from_slice(key);
        self.data
            .extend_from_slice(&(value.encoded_size() as u32).to_le_bytes());
        value.encode_to(&mut self.data);
    }

    pub fn is_empty(&self) -> bool {
        self.offsets.is_empty()
    }

    /// Uncompressed size of the block once finished.
    pub fn estimated_size(&self) -> usize {
        self.data.len() + self.offsets.len() * 4 + 4 + CHECKSUM_LEN
    }

    /// Serializes the block (compressing if asked), appends its checksum and
    /// resets the writer.
    pub fn finish(&mut self, compress: bool) -> Vec<u8> {
        let mut payload = std::mem::take(&mut self.data);
        for off in &self.offsets {
            payload.extend_from_slice(&off.to_le_bytes());
        }
        payload.extend_from_slice(&(self.offsets.len() as u32).to_le_bytes());
        self.offsets.clear();

        let mut out = if compress {
            lz4_flex::compress_prepend_size(&payload)
        } else {
            payload
        };
        let crc = crc32(&out);
        out.extend_from_slice(&crc.to_le_bytes());
        out
    }
}

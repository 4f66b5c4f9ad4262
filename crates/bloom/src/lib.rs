//! # Bloom
//!
//! Probabilistic membership filter: no false negatives, a tunable rate of
//! false positives.
//!
//! DriftKV uses it in two places:
//!
//! - every SSTable embeds a filter over the raw keys it holds, so a point
//!   lookup can skip the table without touching its blocks;
//! - the admission cache keeps one as its door, fed with precomputed 64-bit
//!   key hashes (the `*_hash` methods and [`BloomFilter::allow`]).
//!
//! ```rust,no_run
//! use bloom::BloomFilter;
//!
//! let mut bf = BloomFilter::new(1000, 0.01);
//! bf.insert(b"hello");
//! assert!(bf.may_contain(b"hello"));
//!
//! let restored = BloomFilter::decode(&bf.encode()).unwrap();
//! assert!(restored.may_contain(b"hello"));
//! ```
use std::f64::consts::LN_2;
use std::fmt;
use std::io::{self, Cursor};

use byteorder::{LittleEndian, ReadBytesExt};
use twox_hash::xxh3;

const SECOND_SEED: u64 = 0x517c_c1b7_2722_0a95;
const MAX_HASHES: u32 = 30;
/// Trailer: `num_hashes u32`, `num_bits u32`.
const TRAILER_LEN: usize = 8;

/// Bit vector tested at `k` positions `h1 + i * h2` (double hashing).
#[derive(Clone, PartialEq, Eq)]
pub struct BloomFilter {
    words: Vec<u64>,
    num_bits: u32,
    num_hashes: u32,
}

impl BloomFilter {
    /// Sizes a filter for `expected_items` keys at `false_positive_rate`.
    ///
    /// # Panics
    ///
    /// If `expected_items` is 0 or the rate is outside `(0, 1)`.
    pub fn new(expected_items: usize, false_positive_rate: f64) -> Self {
        assert!(expected_items > 0, "expected_items must be > 0");
        assert!(
            false_positive_rate > 0.0 && false_positive_rate < 1.0,
            "false_positive_rate must be in (0, 1)"
        );

        let n = expected_items as f64;
        let bits = (-n * false_positive_rate.ln() / (LN_2 * LN_2)).ceil();
        let num_bits = bits.clamp(64.0, u32::MAX as f64) as u32;
        let k = ((num_bits as f64 / n) * LN_2).round() as u32;

        Self {
            words: vec![0; (num_bits as usize + 63) / 64],
            num_bits,
            num_hashes: k.clamp(1, MAX_HASHES),
        }
    }

    pub fn insert(&mut self, key: &[u8]) {
        let (h1, h2) = key_hashes(key);
        self.set_bits(h1, h2);
    }

    /// `false` means `key` was never inserted.
    #[must_use]
    pub fn may_contain(&self, key: &[u8]) -> bool {
        let (h1, h2) = key_hashes(key);
        self.test_bits(h1, h2)
    }

    pub fn insert_hash(&mut self, hash: u64) {
        let (h1, h2) = spread(hash);
        self.set_bits(h1, h2);
    }

    #[must_use]
    pub fn may_contain_hash(&self, hash: u64) -> bool {
        let (h1, h2) = spread(hash);
        self.test_bits(h1, h2)
    }

    /// Door check. Returns `true` if `hash` was seen before; otherwise
    /// records it and returns `false`.
    pub fn allow(&mut self, hash: u64) -> bool {
        if self.may_contain_hash(hash) {
            return true;
        }
        self.insert_hash(hash);
        false
    }

    pub fn reset(&mut self) {
        self.words.fill(0);
    }

    #[must_use]
    pub fn num_bits(&self) -> u32 {
        self.num_bits
    }

    #[must_use]
    pub fn num_hashes(&self) -> u32 {
        self.num_hashes
    }

    /// Little-endian words followed by the trailer.
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.words.len() * 8 + TRAILER_LEN);
        for &w in &self.words {
            out.extend_from_slice(&w.to_le_bytes());
        }
        out.extend_from_slice(&self.num_hashes.to_le_bytes());
        out.extend_from_slice(&self.num_bits.to_le_bytes());
        out
    }

    /// Parses the output of [`encode`](Self::encode). Rejects trailers that
    /// do not match the payload length.
    pub fn decode(data: &[u8]) -> io::Result<Self> {
        if data.len() < TRAILER_LEN || (data.len() - TRAILER_LEN) % 8 != 0 {
            return Err(invalid(format!("bloom filter of {} bytes", data.len())));
        }
        let (payload, trailer) = data.split_at(data.len() - TRAILER_LEN);
        let mut t = Cursor::new(trailer);
        let num_hashes = t.read_u32::<LittleEndian>()?;
        let num_bits = t.read_u32::<LittleEndian>()?;

        let words_needed = (num_bits as usize + 63) / 64;
        if num_bits == 0 || words_needed != payload.len() / 8 {
            return Err(invalid(format!(
                "bloom header claims {} bits for {} payload bytes",
                num_bits,
                payload.len()
            )));
        }
        if num_hashes == 0 || num_hashes > MAX_HASHES {
            return Err(invalid(format!("bloom uses {} hashes", num_hashes)));
        }

        let mut r = Cursor::new(payload);
        let mut words = Vec::with_capacity(words_needed);
        for _ in 0..words_needed {
            words.push(r.read_u64::<LittleEndian>()?);
        }
        Ok(Self {
            words,
            num_bits,
            num_hashes,
        })
    }

    fn set_bits(&mut self, h1: u64, h2: u64) {
        for i in 0..self.num_hashes {
            let bit = self.bit_index(h1, h2, i);
            self.words[bit / 64] |= 1u64 << (bit % 64);
        }
    }

    fn test_bits(&self, h1: u64, h2: u64) -> bool {
        (0..self.num_hashes).all(|i| {
            let bit = self.bit_index(h1, h2, i);
            self.words[bit / 64] & (1u64 << (bit % 64)) != 0
        })
    }

    fn bit_index(&self, h1: u64, h2: u64, i: u32) -> usize {
        (h1.wrapping_add((i as u64).wrapping_mul(h2)) % self.num_bits as u64) as usize
    }
}

impl fmt::Debug for BloomFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BloomFilter")
            .field("num_bits", &self.num_bits)
            .field("num_hashes", &self.num_hashes)
            .finish()
    }
}

fn key_hashes(key: &[u8]) -> (u64, u64) {
    (
        xxh3::hash64(key),
        xxh3::hash64_with_seed(key, SECOND_SEED) | 1,
    )
}

/// Second stride from a single hash (splitmix64 finalizer).
fn spread(hash: u64) -> (u64, u64) {
    let mut z = hash.wrapping_add(0x9e37_79b9_7f4a_7c15);
    z = (z ^ (z >> 30)).wrapping_mul(0xbf58_476d_1ce4_e5b9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94d0_49bb_1331_11eb);
    (hash, (z ^ (z >> 31)) | 1)
}

fn invalid(msg: String) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, msg)
}

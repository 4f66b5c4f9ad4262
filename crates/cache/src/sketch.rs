//! Count-min sketch with 4-bit counters.
//!
//! Two counters share a byte. Counters saturate at 15; [`CmSketch::reset`]
//! halves every counter so old popularity fades.

const DEPTH: usize = 4;

#[derive(Debug, Clone)]
pub struct CmSketch {
    rows: [Vec<u8>; DEPTH],
    seeds: [u64; DEPTH],
    mask: u64,
}

impl CmSketch {
    /// Creates a sketch with at least `num_counters` counters per row
    /// (rounded up to a power of two).
    pub fn new(num_counters: usize) -> Self {
        let n = num_counters.max(2).next_power_of_two();
        Self {
            rows: std::array::from_fn(|_| vec![0u8; n / 2]),
            seeds: std::array::from_fn(|_| rand::random::<u64>()),
            mask: n as u64 - 1,
        }
    }

    pub fn increment(&mut self, hash: u64) {
        for i in 0..DEPTH {
            let n = self.index(hash, i);
            let byte = &mut self.rows[i][(n / 2) as usize];
            let shift = (n & 1) * 4;
            if (*byte >> shift) & 0x0f < 15 {
                *byte += 1 << shift;
            }
        }
    }

    /// Minimum counter across rows.
    pub fn estimate(&self, hash: u64) -> u8 {
        (0..DEPTH)
            .map(|i| {
                let n = self.index(hash, i);
                (self.rows[i][(n / 2) as usize] >> ((n & 1) * 4)) & 0x0f
            })
            .min()
            .unwrap_or(0)
    }

    /// Halves every counter.
    pub fn reset(&mut self) {
        for row in &mut self.rows {
            for b in row.iter_mut() {
                *b = (*b >> 1) & 0x77;
            }
        }
    }

    /// Zeroes every counter.
    pub fn clear(&mut self) {
        for row in &mut self.rows {
            row.iter_mut().for_each(|b| *b = 0);
        }
    }

    fn index(&self, hash: u64, row: usize) -> u64 {
        let mut z = hash ^ self.seeds[row];
        z = (z ^ (z >> 33)).wrapping_mul(0xff51_afd7_ed55_8ccd);
        z ^= z >> 33;
        z & self.mask
    }
}

//! # Cache - window-TinyLFU admission cache
//!
//! Keeps hot SSTable blocks in memory. The cache is split into:
//!
//! - a small **window** LRU (1% of capacity) that absorbs bursts of new keys,
//! - a **segmented LRU** (99%) made of a *probation* segment (20% of the
//!   SLRU) and a *protected* segment (the rest).
//!
//! A key evicted from the window competes with the probation tail for a
//! place in the SLRU. The competition is decided by a count-min sketch of
//! access frequencies, after a bloom filter "door" has turned away keys seen
//! for the first time. Every `10 × capacity` lookups the sketch is halved and
//! the door cleared, so popularity fades over time.
//!
//! `get` mutates recency and frequency state, so reads and writes take the
//! same exclusive lock.
//!
//! ## Example
//!
//! ```rust,no_run
//! use cache::Cache;
//!
//! let cache: Cache<String> = Cache::new(1024);
//! cache.set(b"k", "v".to_string());
//! assert_eq!(cache.get(b"k").as_deref(), Some("v"));
//! ```

mod lru;
mod sketch;

use std::collections::HashMap;

use bloom::BloomFilter;
use parking_lot::Mutex;
use twox_hash::xxh3;

use lru::{List, Slab, Stage, StoreItem};
pub use sketch::CmSketch;

/// Lookups between two freshness resets, per unit of capacity.
const RESET_FACTOR: usize = 10;
const DOOR_FPR: f64 = 0.01;

/// Window-TinyLFU cache keyed by byte strings.
pub struct Cache<V> {
    inner: Mutex<CacheInner<V>>,
}

struct CacheInner<V> {
    slab: Slab<V>,
    data: HashMap<u64, usize>,
    window: List,
    probation: List,
    protected: List,
    window_cap: usize,
    probation_cap: usize,
    protected_cap: usize,
    door: BloomFilter,
    sketch: CmSketch,
    /// Lookups since the last reset.
    accesses: usize,
    threshold: usize,
}

impl<V: Clone> Cache<V> {
    /// Creates a cache holding at most roughly `size` entries.
    pub fn new(size: usize) -> Self {
        let size = size.max(1);
        let window_cap = (size / 100).max(1);
        let slru_cap = (size * 99 / 100).max(1);
        let probation_cap = (slru_cap / 5).max(1);
        let protected_cap = slru_cap.saturating_sub(probation_cap);

        Self {
            inner: Mutex::new(CacheInner {
                slab: Slab::with_capacity(window_cap + slru_cap),
                data: HashMap::with_capacity(size),
                window: List::new(),
                probation: List::new(),
                protected: List::new(),
                window_cap,
                probation_cap,
                protected_cap,
                door: BloomFilter::new(size, DOOR_FPR),
                sketch: CmSketch::new(size),
                accesses: 0,
                threshold: size.saturating_mul(RESET_FACTOR),
            }),
        }
    }

    /// Looks up `key`, counting the access and refreshing its recency.
    pub fn get(&self, key: &[u8]) -> Option<V> {
        self.inner.lock().get(key)
    }

    /// Inserts or updates `key`.
    pub fn set(&self, key: &[u8], value: V) {
        self.inner.lock().set(key, value)
    }

    /// Removes `key`, returning its value.
    pub fn del(&self, key: &[u8]) -> Option<V> {
        self.inner.lock().del(key)
    }

    /// True if `key` is resident. Does not count as an access.
    pub fn contains(&self, key: &[u8]) -> bool {
        self.inner.lock().find(key).is_some()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Maximum number of resident entries.
    pub fn capacity(&self) -> usize {
        let inner = self.inner.lock();
        inner.window_cap + inner.probation_cap + inner.protected_cap
    }

    /// Drops every entry and all frequency history.
    pub fn clear(&self) {
        let mut inner = self.inner.lock();
        let keys: Vec<u64> = inner.data.keys().copied().collect();
        for h in keys {
            if let Some(idx) = inner.data.get(&h).copied() {
                inner.remove(idx);
            }
        }
        inner.sketch.clear();
        inner.door.reset();
        inner.accesses = 0;
    }
}

impl<V: Clone> CacheInner<V> {
    fn find(&self, key: &[u8]) -> Option<usize> {
        let (h, conflict) = key_to_hash(key);
        let idx = *self.data.get(&h)?;
        if self.slab.item(idx).conflict != conflict {
            return None;
        }
        Some(idx)
    }

    fn get(&mut self, key: &[u8]) -> Option<V> {
        self.accesses += 1;
        if self.accesses >= self.threshold {
            self.sketch.reset();
            self.door.reset();
            self.accesses = 0;
        }

        let (h, conflict) = key_to_hash(key);
        self.sketch.increment(h);
        let idx = *self.data.get(&h)?;
        if self.slab.item(idx).conflict != conflict {
            return None;
        }

        let value = self.slab.item(idx).value.clone();
        match self.slab.item(idx).stage {
            Stage::Window => self.slab.move_to_front(&mut self.window, idx),
            Stage::Probation | Stage::Protected => self.slru_get(idx),
        }
        Some(value)
    }

    fn set(&mut self, key: &[u8], value: V) {
        let (h, conflict) = key_to_hash(key);
        if let Some(&idx) = self.data.get(&h) {
            if self.slab.item(idx).conflict == conflict {
                self.slab.item_mut(idx).value = value;
                return;
            }
            // Primary hash collision with a different key: the old one goes.
            self.remove(idx);
        }

        let item = StoreItem {
            key_hash: h,
            conflict,
            stage: Stage::Window,
            value,
        };
        let candidate = match self.window_add(item) {
            Some(evicted) => evicted,
            None => return,
        };

        let victim = match self.slru_victim() {
            Some(victim) => victim,
            None => {
                self.slru_add(candidate);
                return;
            }
        };

        // Keys seen for the first time never displace a resident key.
        if !self.door.allow(candidate.key_hash) {
            return;
        }

        let victim_count = self.sketch.estimate(self.slab.item(victim).key_hash);
        let candidate_count = self.sketch.estimate(candidate.key_hash);
        if candidate_count < victim_count {
            return;
        }
        self.slru_add(candidate);
    }

    fn del(&mut self, key: &[u8]) -> Option<V> {
        let idx = self.find(key)?;
        Some(self.remove(idx).value)
    }

    /// Unlinks and frees slot `idx`.
    fn remove(&mut self, idx: usize) -> StoreItem<V> {
        match self.slab.item(idx).stage {
            Stage::Window => self.slab.unlink(&mut self.window, idx),
            Stage::Probation => self.slab.unlink(&mut self.probation, idx),
            Stage::Protected => self.slab.unlink(&mut self.protected, idx),
        }
        let item = self.slab.take(idx);
        self.data.remove(&item.key_hash);
        item
    }

    /// Adds to the window; returns the item pushed out when it was full.
    fn window_add(&mut self, item: StoreItem<V>) -> Option<StoreItem<V>> {
        if self.window.len() < self.window_cap {
            let h = item.key_hash;
            let idx = self.slab.insert(item);
            self.slab.push_front(&mut self.window, idx);
            self.data.insert(h, idx);
            return None;
        }

        let idx = self.window.back()?;
        let evicted = std::mem::replace(self.slab.item_mut(idx), item);
        self.data.remove(&evicted.key_hash);
        self.data.insert(self.slab.item(idx).key_hash, idx);
        self.slab.move_to_front(&mut self.window, idx);
        Some(evicted)
    }

    fn slru_len(&self) -> usize {
        self.probation.len() + self.protected.len()
    }

    /// Probation tail, if the SLRU is full.
    fn slru_victim(&self) -> Option<usize> {
        if self.slru_len() < self.probation_cap + self.protected_cap {
            return None;
        }
        self.probation.back()
    }

    fn slru_add(&mut self, mut item: StoreItem<V>) {
        item.stage = Stage::Probation;
        let h = item.key_hash;

        if self.probation.len() < self.probation_cap
            || self.slru_len() < self.probation_cap + self.protected_cap
        {
            let idx = self.slab.insert(item);
            self.slab.push_front(&mut self.probation, idx);
            self.data.insert(h, idx);
            return;
        }

        if let Some(idx) = self.probation.back() {
            let old = std::mem::replace(self.slab.item_mut(idx), item);
            self.data.remove(&old.key_hash);
            self.data.insert(h, idx);
            self.slab.move_to_front(&mut self.probation, idx);
        }
    }

    fn slru_get(&mut self, idx: usize) {
        if self.slab.item(idx).stage == Stage::Protected {
            self.slab.move_to_front(&mut self.protected, idx);
            return;
        }

        if self.protected.len() < self.protected_cap {
            self.slab.unlink(&mut self.probation, idx);
            self.slab.item_mut(idx).stage = Stage::Protected;
            self.slab.push_front(&mut self.protected, idx);
            return;
        }

        let back = match self.protected.back() {
            Some(back) => back,
            None => {
                // No protected segment at this capacity.
                self.slab.move_to_front(&mut self.probation, idx);
                return;
            }
        };

        // Demote the protected tail into this probation slot and vice versa.
        self.slab.swap_items(idx, back);
        self.slab.item_mut(idx).stage = Stage::Probation;
        self.slab.item_mut(back).stage = Stage::Protected;
        let demoted = self.slab.item(idx).key_hash;
        let promoted = self.slab.item(back).key_hash;
        self.data.insert(demoted, idx);
        self.data.insert(promoted, back);
        self.slab.move_to_front(&mut self.probation, idx);
        self.slab.move_to_front(&mut self.protected, back);
    }
}

/// Primary FNV-1a hash and an independent xxh3 conflict hash.
fn key_to_hash(key: &[u8]) -> (u64, u64) {
    (fnv1a_64(key), xxh3::hash64(key))
}

fn fnv1a_64(data: &[u8]) -> u64 {
    const FNV_OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
    const FNV_PRIME: u64 = 0x0000_0100_0000_01b3;
    let mut hash = FNV_OFFSET;
    for &byte in data {
        hash ^= byte as u64;
        hash = hash.wrapping_mul(FNV_PRIME);
    }
    hash
}

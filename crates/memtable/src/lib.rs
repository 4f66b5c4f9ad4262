//! # Memtable - arena-backed concurrent skip list
//!
//! The mutable write target of the DriftKV engine. Writes land in a
//! [`SkipList`] whose nodes, keys and values all live in one [`Arena`]. The
//! list is lock-free: any number of readers and writers may use it through a
//! shared reference, and the engine serializes writers only for WAL ordering.
//!
//! Keys are internal keys (`raw || BE(u64::MAX - version)`, see
//! [`codec::key_with_version`]), so the newest version of a raw key is the
//! first one a forward scan meets.
//!
//! ## Example
//!
//! ```rust,no_run
//! use codec::{key_with_version, ValueStruct};
//! use memtable::SkipList;
//!
//! let list = SkipList::new(1 << 20).unwrap();
//! list.add(&key_with_version(b"k", 1), &ValueStruct::new(b"v".to_vec(), 0, 0)).unwrap();
//! assert_eq!(list.get(&key_with_version(b"k", u64::MAX)).unwrap().value, b"v");
//! ```

mod arena;
mod iterator;
mod skiplist;

pub use arena::{Arena, MAX_HEIGHT, MAX_NODE_SIZE};
pub use iterator::{SkipListIterator, UniIterator};
pub use skiplist::SkipList;

//! # Codec - shared data model for DriftKV
//!
//! Every other crate in the workspace speaks in the types defined here:
//!
//! - [`Entry`] is what callers hand to the engine and what reads return.
//! - [`ValueStruct`] is the value cell stored in memtables and SSTables.
//! - [`ValuePtr`] points into the value log for values stored out of line.
//! - Internal keys are `raw_key || BE(u64::MAX - version)` so that newer
//!   versions of the same raw key sort first (see [`key_with_version`]).
//! - [`KvIterator`] is the uni-directional iterator contract implemented by
//!   the skip list, SSTables and the merge iterators.
//! - [`Error`] is the engine-wide error type.

mod entry;
mod error;
mod iterator;
mod key;
mod value;

pub use entry::{now_secs, Entry, MAX_RECORD_SIZE};
pub use error::{Error, Result};
pub use iterator::KvIterator;
pub use key::{
    check_internal_key, compare_keys, key_with_version, parse_key, parse_version, same_key,
    VERSION_LEN,
};
pub use value::{ValuePtr, ValueStruct, BIT_DELETE, BIT_VALUE_POINTER, VALUE_PTR_LEN};

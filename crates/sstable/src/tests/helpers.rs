use std::path::Path;
use std::sync::Arc;

use anyhow::Result;
use codec::{key_with_version, KvIterator, ValueStruct, BIT_DELETE};

use crate::{BlockCache, Table, TableBuilder, TableOptions};

/// `(raw key, version, value)`; `None` is a tombstone.
pub type Row<'a> = (&'a [u8], u64, Option<&'a [u8]>);

pub fn cell(value: Option<&[u8]>) -> ValueStruct {
    match value {
        Some(v) => ValueStruct::new(v.to_vec(), 0, 0),
        None => ValueStruct::new(Vec::new(), BIT_DELETE, 0),
    }
}

/// Small blocks so that even short tables span several blocks.
pub fn small_blocks() -> TableOptions {
    TableOptions {
        block_size: 128,
        ..TableOptions::default()
    }
}

/// Builds a table from rows; rows are sorted into internal-key order first.
pub fn build(dir: &Path, fid: u64, opts: TableOptions, rows: &[Row]) -> Result<Arc<Table>> {
    let mut rows: Vec<(Vec<u8>, ValueStruct)> = rows
        .iter()
        .map(|&(k, v, val)| (key_with_version(k, v), cell(val)))
        .collect();
    rows.sort_by(|a, b| codec::compare_keys(&a.0, &b.0));

    let mut b = TableBuilder::new(opts);
    for (k, v) in &rows {
        b.add(k, v, false);
    }
    let path = dir.join(crate::table_file_name(fid));
    b.finish(&path)?;
    let cache = Arc::new(BlockCache::new(64));
    Ok(Arc::new(Table::open(&path, fid, Some(cache))?))
}

/// Collects `(raw key, version)` pairs in iteration order.
pub fn drain<I: KvIterator>(it: &mut I) -> Vec<(Vec<u8>, u64)> {
    let mut out = Vec::new();
    while it.valid() {
        out.push((
            codec::parse_key(it.key()).to_vec(),
            codec::parse_version(it.key()),
        ));
        it.next();
    }
    out
}

pub fn numbered(i: usize) -> Vec<u8> {
    format!("key{:05}", i).into_bytes()
}

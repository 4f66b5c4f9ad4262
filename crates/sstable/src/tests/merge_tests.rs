use std::sync::Arc;

use anyhow::Result;
use codec::{key_with_version, KvIterator, ValueStruct};
use memtable::{SkipList, UniIterator};
use tempfile::tempdir;

use super::helpers::*;
use crate::{MergeIterator, TableIterator, TableOptions};

type Source = Box<dyn KvIterator + Send>;

fn table_source(dir: &std::path::Path, fid: u64, rows: &[Row], reversed: bool) -> Result<Source> {
    let t = build(dir, fid, TableOptions::default(), rows)?;
    Ok(Box::new(TableIterator::new(t, reversed)))
}

fn values<I: KvIterator>(it: &mut I) -> Vec<(Vec<u8>, u64, Vec<u8>)> {
    let mut out = Vec::new();
    while it.valid() {
        let v = it.value();
        out.push((codec::parse_key(it.key()).to_vec(), v.version, v.value));
        it.next();
    }
    out
}

// -------------------- Basic merge --------------------

#[test]
fn merge_two_non_overlapping() -> Result<()> {
    let dir = tempdir()?;
    let a = table_source(dir.path(), 1, &[(b"a", 1, Some(b"1")), (b"c", 1, Some(b"3"))], false)?;
    let b = table_source(dir.path(), 2, &[(b"b", 1, Some(b"2")), (b"d", 1, Some(b"4"))], false)?;

    let mut m = MergeIterator::new(vec![a, b], false);
    m.rewind();
    let keys: Vec<Vec<u8>> = drain(&mut m).into_iter().map(|(k, _)| k).collect();
    assert_eq!(keys, vec![b"a".to_vec(), b"b".to_vec(), b"c".to_vec(), b"d".to_vec()]);
    Ok(())
}

#[test]
fn merge_no_sources() {
    let mut m = MergeIterator::new(Vec::new(), false);
    m.rewind();
    assert!(!m.valid());
    assert!(m.take_error().is_none());
}

// -------------------- Duplicates --------------------

#[test]
fn identical_internal_key_newer_source_wins() -> Result<()> {
    let dir = tempdir()?;
    let newer = table_source(dir.path(), 2, &[(b"k", 7, Some(b"new"))], false)?;
    let older = table_source(dir.path(), 1, &[(b"k", 7, Some(b"old")), (b"z", 1, Some(b"z"))], false)?;

    let mut m = MergeIterator::new(vec![newer, older], false);
    m.rewind();
    assert_eq!(
        values(&mut m),
        vec![
            (b"k".to_vec(), 7, b"new".to_vec()),
            (b"z".to_vec(), 1, b"z".to_vec()),
        ]
    );
    Ok(())
}

#[test]
fn distinct_versions_are_all_emitted_newest_first() -> Result<()> {
    let dir = tempdir()?;
    let a = table_source(dir.path(), 1, &[(b"k", 2, Some(b"v2"))], false)?;
    let b = table_source(dir.path(), 2, &[(b"k", 9, Some(b"v9")), (b"k", 1, None)], false)?;

    let mut m = MergeIterator::new(vec![a, b], false);
    m.rewind();
    let got: Vec<u64> = drain(&mut m).into_iter().map(|(_, v)| v).collect();
    assert_eq!(got, vec![9, 2, 1]);
    Ok(())
}

#[test]
fn descending_merge() -> Result<()> {
    let dir = tempdir()?;
    let a = table_source(dir.path(), 1, &[(b"a", 1, Some(b"1")), (b"c", 1, Some(b"3"))], true)?;
    let b = table_source(dir.path(), 2, &[(b"b", 1, Some(b"2")), (b"c", 1, Some(b"x"))], true)?;

    let mut m = MergeIterator::new(vec![a, b], true);
    m.rewind();
    assert_eq!(
        values(&mut m),
        vec![
            (b"c".to_vec(), 1, b"3".to_vec()),
            (b"b".to_vec(), 1, b"2".to_vec()),
            (b"a".to_vec(), 1, b"1".to_vec()),
        ]
    );
    Ok(())
}

#[test]
fn seek_repositions_every_source() -> Result<()> {
    let dir = tempdir()?;
    let a = table_source(dir.path(), 1, &[(b"a", 1, Some(b"1")), (b"d", 1, Some(b"4"))], false)?;
    let b = table_source(dir.path(), 2, &[(b"b", 1, Some(b"2")), (b"e", 1, Some(b"5"))], false)?;

    let mut m = MergeIterator::new(vec![a, b], false);
    m.seek(&key_with_version(b"c", u64::MAX));
    let keys: Vec<Vec<u8>> = drain(&mut m).into_iter().map(|(k, _)| k).collect();
    assert_eq!(keys, vec![b"d".to_vec(), b"e".to_vec()]);

    m.rewind();
    assert_eq!(drain(&mut m).len(), 4);
    Ok(())
}

// -------------------- Memtable + table --------------------

#[test]
fn memtable_shadows_table() -> Result<()> {
    let dir = tempdir()?;
    let list = Arc::new(SkipList::new(1 << 16)?);
    list.add(&key_with_version(b"b", 10), &ValueStruct::new(b"mem".to_vec(), 0, 0))?;
    list.add(&key_with_version(b"c", 11), &ValueStruct::new(Vec::new(), codec::BIT_DELETE, 0))?;

    let mem: Source = Box::new(UniIterator::new(list, false));
    let disk = table_source(
        dir.path(),
        1,
        &[(b"a", 1, Some(b"1")), (b"b", 2, Some(b"disk")), (b"c", 3, Some(b"3"))],
        false,
    )?;

    let mut m = MergeIterator::new(vec![mem, disk], false);
    m.rewind();
    let rows = values(&mut m);
    assert_eq!(rows.len(), 5);
    assert_eq!(rows[1], (b"b".to_vec(), 10, b"mem".to_vec()));
    assert_eq!(rows[2], (b"b".to_vec(), 2, b"disk".to_vec()));
    assert_eq!(rows[3].1, 11);
    Ok(())
}

use super::helpers::{key, test_options, value};
use crate::*;
use anyhow::Result;
use tempfile::tempdir;

// --------------------- Lookup order ---------------------

#[test]
fn get_from_level_zero_after_flush() -> Result<()> {
    let dir = tempdir()?;
    let db = Db::open(test_options(dir.path()))?;

    db.set(Entry::new("a", "1"))?;
    db.set(Entry::new("b", "2"))?;
    db.flush()?;

    assert_eq!(db.inner().lsm.levels.table_count(0), 1);
    assert_eq!(db.get(b"a")?.value, b"1");
    assert_eq!(db.get(b"b")?.value, b"2");
    Ok(())
}

#[test]
fn memtable_shadows_tables() -> Result<()> {
    let dir = tempdir()?;
    let db = Db::open(test_options(dir.path()))?;

    db.set(Entry::new("k", "old"))?;
    db.flush()?;
    db.set(Entry::new("k", "new"))?;

    assert_eq!(db.get(b"k")?.value, b"new");
    Ok(())
}

#[test]
fn newer_level_zero_table_wins() -> Result<()> {
    let dir = tempdir()?;
    let db = Db::open(test_options(dir.path()))?;

    db.set(Entry::new("k", "v1"))?;
    db.flush()?;
    db.set(Entry::new("k", "v2"))?;
    db.flush()?;

    assert_eq!(db.inner().lsm.levels.table_count(0), 2);
    let entry = db.get(b"k")?;
    assert_eq!(entry.value, b"v2");
    assert_eq!(entry.version, 2);
    Ok(())
}

#[test]
fn tombstone_in_memtable_hides_table_value() -> Result<()> {
    let dir = tempdir()?;
    let db = Db::open(test_options(dir.path()))?;

    db.set(Entry::new("k", "v"))?;
    db.flush()?;
    db.delete(b"k")?;
    assert!(matches!(db.get(b"k"), Err(Error::NotFound)));

    db.flush()?;
    assert!(matches!(db.get(b"k"), Err(Error::NotFound)));
    Ok(())
}

#[test]
fn get_from_deeper_levels() -> Result<()> {
    let dir = tempdir()?;
    let db = Db::open(test_options(dir.path()))?;

    for i in 0..500 {
        db.set(Entry::new(key(i), value(i)))?;
    }
    db.flush()?;
    db.compact()?;

    let levels = &db.inner().lsm.levels;
    assert_eq!(levels.table_count(0), 0);
    assert!(levels.table_count(1) > 0);
    for i in 0..500 {
        assert_eq!(db.get(&key(i))?.value, value(i));
    }
    assert!(matches!(db.get(b"key99999"), Err(Error::NotFound)));
    assert!(matches!(db.get(b"aaa"), Err(Error::NotFound)));
    Ok(())
}

#[test]
fn pointer_values_resolve_from_tables() -> Result<()> {
    let dir = tempdir()?;
    let db = Db::open(test_options(dir.path()))?;

    let big = vec![b'x'; 300];
    db.set(Entry::new("big", big.clone()))?;
    db.flush()?;
    db.compact()?;

    assert_eq!(db.get(b"big")?.value, big);
    Ok(())
}

// --------------------- Stats ---------------------

#[test]
fn stats_track_operations() -> Result<()> {
    let dir = tempdir()?;
    let db = Db::open(test_options(dir.path()))?;

    db.set(Entry::new("a", "1"))?;
    db.set(Entry::new("b", "2"))?;
    db.delete(b"a")?;
    let _ = db.get(b"a");
    let _ = db.get(b"b");
    db.flush()?;

    let stats = db.stats();
    assert_eq!(stats.sets, 2);
    assert_eq!(stats.deletes, 1);
    assert_eq!(stats.gets, 2);
    assert_eq!(stats.get_misses, 1);
    assert_eq!(stats.flushes, 1);
    assert_eq!(stats.max_version, 3);
    assert_eq!(stats.entry_num, 3);
    assert_eq!(stats.levels[0].tables, 1);
    assert!(stats.levels[0].size > 0);
    Ok(())
}

use super::helpers::{count_files, test_options};
use crate::*;
use anyhow::Result;
use tempfile::tempdir;

fn big_value(i: usize, fill: u8) -> Vec<u8> {
    let mut v = vec![fill; 4000];
    v[..8].copy_from_slice(&(i as u64).to_be_bytes());
    v
}

fn big_key(i: usize) -> Vec<u8> {
    format!("big{:04}", i).into_bytes()
}

#[test]
fn gc_without_sealed_segments_does_nothing() -> Result<()> {
    let dir = tempdir()?;
    let db = Db::open(test_options(dir.path()))?;

    db.set(Entry::new("k", vec![1u8; 200]))?;
    assert_eq!(db.run_value_log_gc()?, None);
    assert_eq!(db.stats().gc_runs, 0);
    Ok(())
}

#[test]
fn gc_drops_overwritten_values() -> Result<()> {
    let dir = tempdir()?;
    let db = Db::open(test_options(dir.path()))?;

    // About sixteen records per 64 KiB segment.
    for i in 0..20 {
        db.set(Entry::new(big_key(i), big_value(i, b'a')))?;
    }
    for i in 0..20 {
        db.set(Entry::new(big_key(i), big_value(i, b'b')))?;
    }
    let before = db.stats().vlog_segments;
    assert!(before > 1);

    let stats = db.run_value_log_gc()?.expect("a sealed segment exists");
    assert_eq!(stats.fid, 1);
    assert_eq!(stats.moved, 0);
    assert!(stats.dropped > 0);
    assert_eq!(db.stats().vlog_segments, before - 1);
    assert_eq!(db.stats().gc_runs, 1);

    for i in 0..20 {
        assert_eq!(db.get(&big_key(i))?.value, big_value(i, b'b'));
    }
    Ok(())
}

#[test]
fn gc_moves_live_values() -> Result<()> {
    let dir = tempdir()?;
    let db = Db::open(test_options(dir.path()))?;

    for i in 0..40 {
        db.set(Entry::new(big_key(i), big_value(i, b'x')))?;
    }
    let stats = db.run_value_log_gc()?.expect("a sealed segment exists");
    assert!(stats.moved > 0);
    assert_eq!(stats.dropped, 0);

    for i in 0..40 {
        assert_eq!(db.get(&big_key(i))?.value, big_value(i, b'x'));
    }

    // The rewritten pointers outlive a restart.
    db.close()?;
    drop(db);
    let db = Db::open(test_options(dir.path()))?;
    for i in 0..40 {
        assert_eq!(db.get(&big_key(i))?.value, big_value(i, b'x'));
    }
    Ok(())
}

#[test]
fn gc_drops_deleted_values() -> Result<()> {
    let dir = tempdir()?;
    let db = Db::open(test_options(dir.path()))?;

    for i in 0..20 {
        db.set(Entry::new(big_key(i), big_value(i, b'd')))?;
    }
    for i in 0..20 {
        db.delete(&big_key(i))?;
    }
    db.flush()?;

    let stats = db.run_value_log_gc()?.expect("a sealed segment exists");
    assert_eq!(stats.moved, 0);
    assert!(stats.dropped > 0);
    for i in 0..20 {
        assert!(matches!(db.get(&big_key(i)), Err(Error::NotFound)));
    }
    Ok(())
}

#[test]
fn iterator_survives_gc() -> Result<()> {
    let dir = tempdir()?;
    let db = Db::open(test_options(dir.path()))?;

    for i in 0..40 {
        db.set(Entry::new(big_key(i), big_value(i, b'i')))?;
    }
    let mut it = db.new_iterator(IteratorOptions::default())?;
    // Collect a segment while the iterator is open.
    db.run_value_log_gc()?;

    it.rewind();
    let mut seen = 0;
    while let Some(entry) = it.item() {
        assert_eq!(entry.key, big_key(seen));
        assert_eq!(entry.value, big_value(seen, b'i'));
        seen += 1;
        it.next();
    }
    it.close()?;
    assert_eq!(seen, 40);
    Ok(())
}

#[test]
fn segments_are_files_in_work_dir() -> Result<()> {
    let dir = tempdir()?;
    let db = Db::open(test_options(dir.path()))?;

    for i in 0..40 {
        db.set(Entry::new(big_key(i), big_value(i, b'f')))?;
    }
    let segments = db.stats().vlog_segments;
    assert_eq!(count_files(dir.path(), "vlog"), segments);
    Ok(())
}

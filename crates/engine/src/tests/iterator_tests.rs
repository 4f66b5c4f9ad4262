use super::helpers::{key, test_options, value};
use crate::*;
use anyhow::Result;
use tempfile::tempdir;

fn collect(db: &Db, opts: IteratorOptions) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
    let mut it = db.new_iterator(opts)?;
    it.rewind();
    let mut out = Vec::new();
    while let Some(entry) = it.item() {
        out.push((entry.key.clone(), entry.value.clone()));
        it.next();
    }
    it.close()?;
    Ok(out)
}

fn keys(items: &[(Vec<u8>, Vec<u8>)]) -> Vec<&[u8]> {
    items.iter().map(|(k, _)| k.as_slice()).collect()
}

// --------------------- Ordering ---------------------

#[test]
fn ascending_scan_is_sorted() -> Result<()> {
    let dir = tempdir()?;
    let db = Db::open(test_options(dir.path()))?;

    for k in ["c", "a", "d", "b"] {
        db.set(Entry::new(k, k))?;
    }
    let items = collect(&db, IteratorOptions::default())?;
    assert_eq!(keys(&items), vec![b"a", b"b", b"c", b"d"]);
    Ok(())
}

#[test]
fn descending_scan_is_reversed() -> Result<()> {
    let dir = tempdir()?;
    let db = Db::open(test_options(dir.path()))?;

    for k in ["c", "a", "d", "b"] {
        db.set(Entry::new(k, k))?;
    }
    let items = collect(&db, IteratorOptions::default().descending())?;
    assert_eq!(keys(&items), vec![b"d", b"c", b"b", b"a"]);
    Ok(())
}

#[test]
fn empty_database_yields_nothing() -> Result<()> {
    let dir = tempdir()?;
    let db = Db::open(test_options(dir.path()))?;

    assert!(collect(&db, IteratorOptions::default())?.is_empty());
    assert!(collect(&db, IteratorOptions::default().descending())?.is_empty());
    Ok(())
}

// --------------------- Versions and tombstones ---------------------

#[test]
fn only_newest_version_is_returned() -> Result<()> {
    let dir = tempdir()?;
    let db = Db::open(test_options(dir.path()))?;

    db.set(Entry::new("k", "v1"))?;
    db.flush()?;
    db.set(Entry::new("k", "v2"))?;
    db.set(Entry::new("k", "v3"))?;

    let asc = collect(&db, IteratorOptions::default())?;
    assert_eq!(asc, vec![(b"k".to_vec(), b"v3".to_vec())]);
    let desc = collect(&db, IteratorOptions::default().descending())?;
    assert_eq!(desc, vec![(b"k".to_vec(), b"v3".to_vec())]);
    Ok(())
}

#[test]
fn deleted_and_expired_keys_are_skipped() -> Result<()> {
    let dir = tempdir()?;
    let db = Db::open(test_options(dir.path()))?;

    db.set(Entry::new("a", "1"))?;
    db.set(Entry::new("b", "2"))?;
    db.set(Entry::new("c", "3"))?;
    db.flush()?;
    db.delete(b"b")?;
    let mut expired = Entry::new("d", "4");
    expired.expires_at = 1;
    db.set(expired)?;

    let asc = collect(&db, IteratorOptions::default())?;
    assert_eq!(keys(&asc), vec![b"a", b"c"]);
    let desc = collect(&db, IteratorOptions::default().descending())?;
    assert_eq!(keys(&desc), vec![b"c", b"a"]);
    Ok(())
}

#[test]
fn merges_memtables_and_levels() -> Result<()> {
    let dir = tempdir()?;
    let db = Db::open(test_options(dir.path()))?;

    for i in (0..300).step_by(3) {
        db.set(Entry::new(key(i), value(i)))?;
    }
    db.flush()?;
    db.compact()?;
    for i in (1..300).step_by(3) {
        db.set(Entry::new(key(i), value(i)))?;
    }
    db.flush()?;
    for i in (2..300).step_by(3) {
        db.set(Entry::new(key(i), value(i)))?;
    }

    let items = collect(&db, IteratorOptions::default())?;
    assert_eq!(items.len(), 300);
    for (i, (k, v)) in items.iter().enumerate() {
        assert_eq!(k, &key(i));
        assert_eq!(v, &value(i));
    }

    let desc = collect(&db, IteratorOptions::default().descending())?;
    assert_eq!(desc.len(), 300);
    assert_eq!(desc[0].0, key(299));
    assert_eq!(desc[299].0, key(0));
    Ok(())
}

#[test]
fn pointer_values_are_resolved() -> Result<()> {
    let dir = tempdir()?;
    let db = Db::open(test_options(dir.path()))?;

    let big = vec![b'z'; 500];
    db.set(Entry::new("big", big.clone()))?;
    db.set(Entry::new("small", "s"))?;
    db.flush()?;

    let items = collect(&db, IteratorOptions::default())?;
    assert_eq!(
        items,
        vec![(b"big".to_vec(), big), (b"small".to_vec(), b"s".to_vec())]
    );
    Ok(())
}

// --------------------- Prefix and seek ---------------------

#[test]
fn prefix_limits_both_directions() -> Result<()> {
    let dir = tempdir()?;
    let db = Db::open(test_options(dir.path()))?;

    for k in ["a1", "b1", "b2", "b3", "c1", "b"] {
        db.set(Entry::new(k, k))?;
    }

    let asc = collect(&db, IteratorOptions::default().with_prefix("b"))?;
    assert_eq!(keys(&asc), vec![&b"b"[..], &b"b1"[..], &b"b2"[..], &b"b3"[..]]);
    let desc = collect(&db, IteratorOptions::default().with_prefix("b").descending())?;
    assert_eq!(keys(&desc), vec![&b"b3"[..], &b"b2"[..], &b"b1"[..], &b"b"[..]]);
    assert!(collect(&db, IteratorOptions::default().with_prefix("x"))?.is_empty());
    Ok(())
}

#[test]
fn prefix_of_max_bytes() -> Result<()> {
    let dir = tempdir()?;
    let db = Db::open(test_options(dir.path()))?;

    db.set(Entry::new(vec![0xfeu8], "low"))?;
    db.set(Entry::new(vec![0xffu8, 0x01], "high"))?;
    db.set(Entry::new(vec![0xffu8, 0xff], "top"))?;

    let desc = collect(
        &db,
        IteratorOptions::default().with_prefix(vec![0xffu8]).descending(),
    )?;
    assert_eq!(keys(&desc), vec![&[0xffu8, 0xff][..], &[0xffu8, 0x01][..]]);
    Ok(())
}

#[test]
fn seek_positions_within_range() -> Result<()> {
    let dir = tempdir()?;
    let db = Db::open(test_options(dir.path()))?;

    for i in 0..10 {
        db.set(Entry::new(key(i * 2), value(i * 2)))?;
    }

    let mut it = db.new_iterator(IteratorOptions::default())?;
    it.seek(&key(5));
    assert_eq!(it.item().map(|e| e.key.clone()), Some(key(6)));
    it.seek(&key(18));
    assert_eq!(it.item().map(|e| e.key.clone()), Some(key(18)));
    it.next();
    assert!(!it.valid());
    it.close()?;

    let mut it = db.new_iterator(IteratorOptions::default().descending())?;
    it.seek(&key(5));
    assert_eq!(it.item().map(|e| e.key.clone()), Some(key(4)));
    it.next();
    assert_eq!(it.item().map(|e| e.key.clone()), Some(key(2)));
    it.close()?;
    Ok(())
}

#[test]
fn seek_is_clamped_to_prefix() -> Result<()> {
    let dir = tempdir()?;
    let db = Db::open(test_options(dir.path()))?;

    for k in ["a", "b1", "b2", "c"] {
        db.set(Entry::new(k, k))?;
    }

    let mut it = db.new_iterator(IteratorOptions::default().with_prefix("b"))?;
    it.seek(b"a");
    assert_eq!(it.item().map(|e| e.key.clone()), Some(b"b1".to_vec()));
    it.close()?;

    let mut it = db.new_iterator(IteratorOptions::default().with_prefix("b").descending())?;
    it.seek(b"z");
    assert_eq!(it.item().map(|e| e.key.clone()), Some(b"b2".to_vec()));
    it.seek(b"a");
    assert!(!it.valid());
    it.close()?;
    Ok(())
}

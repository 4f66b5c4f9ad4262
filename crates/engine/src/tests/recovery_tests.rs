use super::helpers::{count_files, key, test_options, value};
use crate::manifest::{Manifest, MANIFEST_FILENAME};
use crate::mem_table::wal_file_name;
use crate::*;
use anyhow::Result;
use std::fs::{self, OpenOptions};
use std::io::Write;
use tempfile::tempdir;
use wal::WalWriter;

// --------------------- Clean restarts ---------------------

#[test]
fn reopen_after_close() -> Result<()> {
    let dir = tempdir()?;
    {
        let db = Db::open(test_options(dir.path()))?;
        db.set(Entry::new("a", "1"))?;
        db.set(Entry::new("b", "2"))?;
        db.close()?;
    }
    assert_eq!(count_files(dir.path(), "wal"), 0);
    assert_eq!(count_files(dir.path(), "sst"), 1);

    let db = Db::open(test_options(dir.path()))?;
    assert_eq!(db.get(b"a")?.value, b"1");
    assert_eq!(db.get(b"b")?.value, b"2");
    Ok(())
}

#[test]
fn drop_closes_cleanly() -> Result<()> {
    let dir = tempdir()?;
    {
        let db = Db::open(test_options(dir.path()))?;
        db.set(Entry::new("k", "v"))?;
    }
    assert_eq!(count_files(dir.path(), "wal"), 0);

    let db = Db::open(test_options(dir.path()))?;
    assert_eq!(db.get(b"k")?.value, b"v");
    Ok(())
}

#[test]
fn value_pointers_survive_restart() -> Result<()> {
    let dir = tempdir()?;
    let big = vec![b'v'; 2000];
    {
        let db = Db::open(test_options(dir.path()))?;
        db.set(Entry::new("big", big.clone()))?;
        db.close()?;
    }
    let db = Db::open(test_options(dir.path()))?;
    assert_eq!(db.get(b"big")?.value, big);
    Ok(())
}

// --------------------- Crash recovery ---------------------

#[test]
fn recovery_from_wal() -> Result<()> {
    let dir = tempdir()?;
    {
        let db = Db::open(test_options(dir.path()))?;
        db.set(Entry::new("a", "1"))?;
        db.set(Entry::new("b", "2"))?;
        db.delete(b"a")?;
        db.crash();
    }
    assert!(count_files(dir.path(), "wal") > 0);

    let db = Db::open(test_options(dir.path()))?;
    assert!(matches!(db.get(b"a"), Err(Error::NotFound)));
    assert_eq!(db.get(b"b")?.value, b"2");
    assert_eq!(db.stats().max_version, 3);

    db.set(Entry::new("c", "3"))?;
    assert_eq!(db.get(b"c")?.version, 4);
    Ok(())
}

#[test]
fn recovery_combines_tables_and_wal() -> Result<()> {
    let dir = tempdir()?;
    {
        let db = Db::open(test_options(dir.path()))?;
        db.set(Entry::new("flushed", "1"))?;
        db.flush()?;
        db.set(Entry::new("logged", "2"))?;
        db.crash();
    }
    let db = Db::open(test_options(dir.path()))?;
    assert_eq!(db.get(b"flushed")?.value, b"1");
    assert_eq!(db.get(b"logged")?.value, b"2");
    Ok(())
}

#[test]
fn recovery_replays_many_generations() -> Result<()> {
    let dir = tempdir()?;
    let opts = test_options(dir.path()).with_mem_table_size(2048);
    {
        let db = Db::open(opts.clone())?;
        for i in 0..1000 {
            db.set(Entry::new(key(i), value(i)))?;
        }
        db.crash();
    }
    let db = Db::open(opts)?;
    for i in 0..1000 {
        assert_eq!(db.get(&key(i))?.value, value(i));
    }
    assert_eq!(db.stats().max_version, 1000);
    Ok(())
}

#[test]
fn torn_wal_tail_is_discarded() -> Result<()> {
    let dir = tempdir()?;
    {
        let db = Db::open(test_options(dir.path()))?;
        db.set(Entry::new("k1", "v1"))?;
        db.set(Entry::new("k2", "v2"))?;
        db.crash();
    }
    for entry in fs::read_dir(dir.path())? {
        let path = entry?.path();
        if path.extension().and_then(|s| s.to_str()) == Some("wal") {
            let mut f = OpenOptions::new().append(true).open(&path)?;
            f.write_all(&[0xde, 0xad, 0xbe])?;
        }
    }

    let db = Db::open(test_options(dir.path()))?;
    assert_eq!(db.get(b"k1")?.value, b"v1");
    assert_eq!(db.get(b"k2")?.value, b"v2");
    Ok(())
}

#[test]
fn wal_of_flushed_table_is_not_replayed() -> Result<()> {
    let dir = tempdir()?;
    {
        let db = Db::open(test_options(dir.path()))?;
        db.set(Entry::new("k", "v"))?;
        db.close()?;
    }
    let manifest = Manifest::load_or_create(dir.path())?;
    let fid = manifest.tables_at(0)[0];

    // A crash between saving the manifest and deleting the WAL leaves both.
    let wal_path = dir.path().join(wal_file_name(fid));
    {
        let mut w = WalWriter::create(&wal_path, true)?;
        let mut ghost = Entry::new("ghost", "boo");
        ghost.version = 1;
        w.append(&ghost)?;
        w.sync_to_disk()?;
    }

    let db = Db::open(test_options(dir.path()))?;
    assert!(!wal_path.exists());
    assert!(matches!(db.get(b"ghost"), Err(Error::NotFound)));
    assert_eq!(db.get(b"k")?.value, b"v");
    Ok(())
}

#[test]
fn stray_tables_are_removed() -> Result<()> {
    let dir = tempdir()?;
    {
        let db = Db::open(test_options(dir.path()))?;
        db.set(Entry::new("k", "v"))?;
        db.close()?;
    }
    let stray = dir.path().join("99999.sst");
    let tmp = dir.path().join("99998.sst.tmp");
    fs::write(&stray, b"half written")?;
    fs::write(&tmp, b"half written")?;

    let db = Db::open(test_options(dir.path()))?;
    assert!(!stray.exists());
    assert!(!tmp.exists());
    assert_eq!(db.get(b"k")?.value, b"v");
    Ok(())
}

#[test]
fn corrupt_manifest_fails_open() -> Result<()> {
    let dir = tempdir()?;
    {
        let db = Db::open(test_options(dir.path()))?;
        db.set(Entry::new("k", "v"))?;
        db.close()?;
    }
    let path = dir.path().join(MANIFEST_FILENAME);
    let text = fs::read_to_string(&path)?.replace("L0:", "L1:");
    fs::write(&path, text)?;

    assert!(matches!(
        Db::open(test_options(dir.path())),
        Err(Error::Corruption(_))
    ));
    Ok(())
}

#[test]
fn file_ids_are_not_reused_after_restart() -> Result<()> {
    let dir = tempdir()?;
    for round in 0..3 {
        let db = Db::open(test_options(dir.path()))?;
        db.set(Entry::new(key(round), value(round)))?;
        db.close()?;
    }
    assert_eq!(count_files(dir.path(), "sst"), 3);

    let db = Db::open(test_options(dir.path()))?;
    for round in 0..3 {
        assert_eq!(db.get(&key(round))?.value, value(round));
    }
    Ok(())
}

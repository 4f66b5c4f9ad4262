use anyhow::Result;
use codec::{key_with_version, Error};
use tempfile::tempdir;

use super::helpers::*;
use crate::{Table, TableBuilder, TableOptions};

#[test]
fn empty_builder_is_rejected() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("00001.sst");
    let b = TableBuilder::new(TableOptions::default());
    assert!(b.is_empty());

    let res = b.finish(&path);
    assert!(matches!(res, Err(Error::InvalidArgument(_))));
    assert!(!path.exists());
}

#[test]
fn finish_leaves_no_temp_file() -> Result<()> {
    let dir = tempdir()?;
    let path = dir.path().join("00001.sst");
    let mut b = TableBuilder::new(TableOptions::default());
    b.add(&key_with_version(b"a", 1), &cell(Some(b"1")), false);
    let size = b.finish(&path)?;

    assert_eq!(size, std::fs::metadata(&path)?.len());
    let names: Vec<String> = std::fs::read_dir(dir.path())?
        .map(|e| e.map(|e| e.file_name().to_string_lossy().into_owned()))
        .collect::<std::io::Result<_>>()?;
    assert_eq!(names, vec!["00001.sst".to_string()]);
    Ok(())
}

#[test]
fn sync_dir_reports_missing_directory() -> Result<()> {
    let dir = tempdir()?;
    crate::sync_dir(&dir.path().join("00001.sst"))?;
    crate::sync_dir(std::path::Path::new("00001.sst"))?;

    let gone = dir.path().join("gone").join("00001.sst");
    assert!(crate::sync_dir(&gone).is_err());
    Ok(())
}

#[test]
fn finish_into_missing_directory_fails() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("gone").join("00001.sst");
    let mut b = TableBuilder::new(TableOptions::default());
    b.add(&key_with_version(b"a", 1), &cell(Some(b"1")), false);
    assert!(matches!(b.finish(&path), Err(Error::Io(_))));
}

#[test]
fn blocks_are_cut_at_block_size() -> Result<()> {
    let dir = tempdir()?;
    let keys: Vec<Vec<u8>> = (0..100).map(numbered).collect();
    let rows: Vec<Row> = keys.iter().map(|k| (k.as_slice(), 1, Some(&b"value"[..]))).collect();

    let small = build(dir.path(), 1, small_blocks(), &rows)?;
    let large = build(
        dir.path(),
        2,
        TableOptions {
            block_size: 1 << 20,
            ..TableOptions::default()
        },
        &rows,
    )?;
    assert!(small.block_count() > 1);
    assert_eq!(large.block_count(), 1);
    Ok(())
}

#[test]
fn oversized_entry_gets_its_own_block() -> Result<()> {
    let dir = tempdir()?;
    let big = vec![7u8; 1000];
    let t = build(
        dir.path(),
        1,
        small_blocks(),
        &[(b"a", 1, Some(b"1")), (b"b", 1, Some(big.as_slice())), (b"c", 1, Some(b"3"))],
    )?;
    assert_eq!(t.block_count(), 3);
    assert_eq!(t.get(&key_with_version(b"b", 1))?.unwrap().value, big);
    Ok(())
}

#[test]
fn reached_capacity_tracks_estimated_size() -> Result<()> {
    let dir = tempdir()?;
    let opts = TableOptions {
        table_size: 4096,
        ..TableOptions::default()
    };
    let mut b = TableBuilder::new(opts);
    let mut n = 0;
    let mut last = b.estimated_size();
    while !b.reached_capacity() {
        b.add(&key_with_version(&numbered(n), 1), &cell(Some(&[1u8; 64][..])), false);
        assert!(b.estimated_size() > last);
        last = b.estimated_size();
        n += 1;
    }
    assert!(n > 10);

    let path = dir.path().join("00001.sst");
    let size = b.finish(&path)?;
    // The estimate errs on the large side.
    assert!(size as usize <= last);
    assert_eq!(Table::open(&path, 1, None)?.key_count() as usize, n);
    Ok(())
}

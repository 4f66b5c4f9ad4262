use std::collections::HashMap;
use std::fs;

use anyhow::Result;
use codec::{Entry, Error, ValuePtr};
use parking_lot::Mutex;
use tempfile::tempdir;

use super::*;

/// In-memory key -> pointer map standing in for the LSM tree.
#[derive(Default)]
struct MapIndex {
    map: Mutex<HashMap<Vec<u8>, ValuePtr>>,
    refuse_rewrites: bool,
}

impl MapIndex {
    fn put(&self, key: &[u8], ptr: ValuePtr) {
        self.map.lock().insert(key.to_vec(), ptr);
    }

    fn get(&self, key: &[u8]) -> ValuePtr {
        self.map.lock()[key]
    }
}

impl ValueIndex for MapIndex {
    fn current_pointer(&self, key: &[u8]) -> codec::Result<Option<ValuePtr>> {
        Ok(self.map.lock().get(key).copied())
    }

    fn rewrite_pointer(&self, key: &[u8], old: ValuePtr, new: ValuePtr) -> codec::Result<bool> {
        if self.refuse_rewrites {
            return Ok(false);
        }
        let mut map = self.map.lock();
        match map.get_mut(key) {
            Some(p) if *p == old => {
                *p = new;
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}

fn small_segments() -> VlogOptions {
    VlogOptions {
        file_size: 256,
        sync: false,
    }
}

fn value(i: usize) -> Vec<u8> {
    format!("value-{:03}-{}", i, "x".repeat(40)).into_bytes()
}

// -------------------- Write & read --------------------

#[test]
fn write_then_read() -> Result<()> {
    let dir = tempdir()?;
    let log = ValueLog::open(dir.path(), VlogOptions::default())?;

    let p1 = log.write(&Entry::new("a", "alpha"))?;
    let p2 = log.write(&Entry::new("b", vec![7u8; 10_000]))?;
    assert_eq!(p1.fid, p2.fid);
    assert_eq!(p1.offset, 0);
    assert_eq!(p2.offset, p1.len);

    assert_eq!(log.read(&p1)?, b"alpha");
    assert_eq!(log.read(&p2)?, vec![7u8; 10_000]);
    let e = log.read_entry(&p1)?;
    assert_eq!(e.key, b"a");
    Ok(())
}

#[test]
fn expiry_and_meta_are_kept() -> Result<()> {
    let dir = tempdir()?;
    let log = ValueLog::open(dir.path(), VlogOptions::default())?;
    let mut e = Entry::new("k", "v");
    e.expires_at = 4_000_000_000;
    let ptr = log.write(&e)?;
    let back = log.read_entry(&ptr)?;
    assert_eq!(back.expires_at, 4_000_000_000);
    assert_eq!(back.meta, 0);
    Ok(())
}

#[test]
fn rotates_past_file_size() -> Result<()> {
    let dir = tempdir()?;
    let log = ValueLog::open(dir.path(), small_segments())?;

    let ptrs: Vec<ValuePtr> = (0..20)
        .map(|i| log.write(&Entry::new(format!("k{}", i), value(i))))
        .collect::<codec::Result<_>>()?;

    assert!(log.segment_ids().len() > 3);
    assert_eq!(log.active_fid(), *log.segment_ids().last().unwrap());
    for (i, p) in ptrs.iter().enumerate() {
        assert_eq!(log.read(p)?, value(i));
    }
    Ok(())
}

#[test]
fn reopen_keeps_segments_and_appends() -> Result<()> {
    let dir = tempdir()?;
    let first = {
        let log = ValueLog::open(dir.path(), VlogOptions::default())?;
        let p = log.write(&Entry::new("a", "1"))?;
        log.close()?;
        p
    };

    let log = ValueLog::open(dir.path(), VlogOptions::default())?;
    assert_eq!(log.read(&first)?, b"1");
    let second = log.write(&Entry::new("b", "2"))?;
    assert_eq!(second.fid, first.fid);
    assert_eq!(second.offset, first.len);
    Ok(())
}

#[test]
fn torn_tail_is_trimmed_on_open() -> Result<()> {
    let dir = tempdir()?;
    let path = dir.path().join(segment_file_name(1));
    let good = {
        let log = ValueLog::open(dir.path(), VlogOptions::default())?;
        let p = log.write(&Entry::new("a", "1"))?;
        log.close()?;
        p
    };

    let mut data = fs::read(&path)?;
    let valid_len = data.len() as u64;
    data.extend_from_slice(&[3, 0, 0, 0, 9, 0]);
    fs::write(&path, &data)?;

    let log = ValueLog::open(dir.path(), VlogOptions::default())?;
    assert_eq!(fs::metadata(&path)?.len(), valid_len);
    assert_eq!(log.read(&good)?, b"1");
    let next = log.write(&Entry::new("b", "2"))?;
    assert_eq!(next.offset as u64, valid_len);
    assert_eq!(log.read(&next)?, b"2");
    Ok(())
}

// -------------------- Corruption & missing segments --------------------

#[test]
fn checksum_mismatch_is_corruption() -> Result<()> {
    let dir = tempdir()?;
    let log = ValueLog::open(dir.path(), VlogOptions::default())?;
    let ptr = log.write(&Entry::new("a", "hello"))?;
    log.close()?;

    let path = dir.path().join(segment_file_name(ptr.fid));
    let mut data = fs::read(&path)?;
    data[ptr.len as usize - 6] ^= 0xFF;
    fs::write(&path, &data)?;

    assert!(matches!(log.read(&ptr), Err(Error::Corruption(_))));
    Ok(())
}

#[test]
fn pointer_past_segment_end_is_corruption() -> Result<()> {
    let dir = tempdir()?;
    let log = ValueLog::open(dir.path(), VlogOptions::default())?;
    let mut ptr = log.write(&Entry::new("a", "hello"))?;
    ptr.offset += 1000;
    assert!(matches!(log.read(&ptr), Err(Error::Corruption(_))));

    ptr.fid = 99;
    assert!(matches!(log.read(&ptr), Err(Error::Corruption(_))));
    Ok(())
}

#[test]
fn missing_segment_newer_than_oldest_is_corruption() -> Result<()> {
    let dir = tempdir()?;
    let ptrs: Vec<ValuePtr> = {
        let log = ValueLog::open(dir.path(), small_segments())?;
        let ptrs = (0..20)
            .map(|i| log.write(&Entry::new(format!("k{}", i), value(i))))
            .collect::<codec::Result<_>>()?;
        log.close()?;
        ptrs
    };
    let ids: Vec<u64> = {
        let mut ids: Vec<u64> = ptrs.iter().map(|p| p.fid).collect();
        ids.dedup();
        ids
    };
    assert!(ids.len() >= 3);
    let gap = ids[1];
    fs::remove_file(dir.path().join(segment_file_name(gap)))?;

    let log = ValueLog::open(dir.path(), small_segments())?;
    let in_gap = ptrs.iter().find(|p| p.fid == gap).expect("pointer into gap");
    assert!(matches!(log.read(in_gap), Err(Error::Corruption(_))));

    // Below the oldest live segment means collected.
    let in_oldest = ptrs.iter().find(|p| p.fid == ids[0]).expect("pointer into oldest");
    assert_eq!(log.run_gc(&MapIndex::default())?.map(|s| s.fid), Some(ids[0]));
    assert!(matches!(log.read(in_oldest), Err(Error::Retry)));
    assert!(matches!(log.read(in_gap), Err(Error::Retry)));
    Ok(())
}

// -------------------- GC --------------------

#[test]
fn gc_with_only_active_segment_does_nothing() -> Result<()> {
    let dir = tempdir()?;
    let log = ValueLog::open(dir.path(), VlogOptions::default())?;
    log.write(&Entry::new("a", "1"))?;
    assert_eq!(log.run_gc(&MapIndex::default())?, None);
    Ok(())
}

#[test]
fn gc_moves_live_records_and_drops_stale_ones() -> Result<()> {
    let dir = tempdir()?;
    let log = ValueLog::open(dir.path(), small_segments())?;
    let index = MapIndex::default();

    for i in 0..12 {
        let key = format!("k{}", i);
        let p = log.write(&Entry::new(key.as_str(), value(i)))?;
        index.put(key.as_bytes(), p);
    }
    let oldest = log.segment_ids()[0];
    let in_oldest: Vec<String> = (0..12)
        .map(|i| format!("k{}", i))
        .filter(|k| index.get(k.as_bytes()).fid == oldest)
        .collect();
    assert!(in_oldest.len() >= 2);

    // Overwrite the first key so its old record is garbage.
    let overwritten = &in_oldest[0];
    let p = log.write(&Entry::new(overwritten.as_str(), b"fresh".to_vec()))?;
    index.put(overwritten.as_bytes(), p);
    let stale_ptr = {
        // Any pointer into the oldest segment will do.
        let k = &in_oldest[1];
        index.get(k.as_bytes())
    };

    let stats = log.run_gc(&index)?.expect("a sealed segment exists");
    assert_eq!(stats.fid, oldest);
    assert_eq!(stats.moved, in_oldest.len() - 1);
    assert_eq!(stats.dropped, 1);
    assert!(!dir.path().join(segment_file_name(oldest)).exists());
    assert!(!log.segment_ids().contains(&oldest));

    for i in 0..12 {
        let key = format!("k{}", i);
        let p = index.get(key.as_bytes());
        assert_ne!(p.fid, oldest);
        let want = if &key == overwritten { b"fresh".to_vec() } else { value(i) };
        assert_eq!(log.read(&p)?, want);
    }
    assert!(matches!(log.read(&stale_ptr), Err(Error::Retry)));
    Ok(())
}

#[test]
fn lost_rewrite_race_counts_as_dropped() -> Result<()> {
    let dir = tempdir()?;
    let log = ValueLog::open(dir.path(), small_segments())?;
    let index = MapIndex {
        refuse_rewrites: true,
        ..MapIndex::default()
    };
    for i in 0..10 {
        let key = format!("k{}", i);
        let p = log.write(&Entry::new(key.as_str(), value(i)))?;
        index.put(key.as_bytes(), p);
    }

    let stats = log.run_gc(&index)?.unwrap();
    assert_eq!(stats.moved, 0);
    assert!(stats.dropped > 0);
    Ok(())
}

#[test]
fn gc_drops_tombstones_and_expired_records() -> Result<()> {
    let dir = tempdir()?;
    let log = ValueLog::open(dir.path(), small_segments())?;
    let index = MapIndex::default();

    let mut expired = Entry::new("old", value(0));
    expired.expires_at = 1;
    let p = log.write(&expired)?;
    index.put(b"old", p);
    let p = log.write(&Entry::tombstone("gone"))?;
    index.put(b"gone", p);
    // Fill the rest of the segment and move to the next one.
    for i in 0..10 {
        log.write(&Entry::new(format!("pad{}", i), value(i)))?;
    }

    let stats = log.run_gc(&index)?.unwrap();
    assert_eq!(stats.moved, 0);
    assert!(stats.dropped >= 2);
    Ok(())
}

// -------------------- Record format --------------------

#[test]
fn file_names_parse_back() {
    assert_eq!(segment_file_name(7), "00007.vlog");
    assert_eq!(parse_segment_file_name("00007.vlog"), Some(7));
    assert_eq!(parse_segment_file_name("00007.sst"), None);
}

#[test]
fn record_with_inconsistent_lengths_is_rejected() -> Result<()> {
    let mut rec = encode_record(&Entry::new("key", "value"))?;
    rec[0] = 2; // key_len
    assert!(matches!(decode_record(&rec), Err(Error::Corruption(_))));
    Ok(())
}

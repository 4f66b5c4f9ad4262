//! # CLI - DriftKV Interactive Shell
//!
//! A REPL over [`engine::Db`]. Reads commands from stdin, runs them and
//! prints results to stdout, so it works both interactively and with
//! commands piped in. Logs go to stderr.
//!
//! ## Commands
//!
//! ```text
//! SET key value          Insert or update a key
//! SETEX key secs value   Insert a key that expires after `secs` seconds
//! GET key                Look up a key (prints value or "(nil)")
//! DEL key                Delete a key
//! SCAN [prefix] [DESC]   List live keys, optionally by prefix and reversed
//! FLUSH                  Write every memtable to level 0
//! COMPACT                Compact until no level is over its target
//! GC                     Collect the oldest value log segment
//! STATS                  Print counters and per-level sizes
//! EXIT / QUIT            Close the database and exit
//! ```
//!
//! ## Configuration
//!
//! Options come from `DRIFT_*` environment variables (see the `config`
//! crate), e.g. `DRIFT_WORK_DIR`, `DRIFT_MEM_TABLE_SIZE`,
//! `DRIFT_VALUE_THRESHOLD`. Log verbosity follows `RUST_LOG`.
//!
//! ## Example
//!
//! ```text
//! $ DRIFT_WORK_DIR=/tmp/drift cargo run -p cli
//! DriftKV started (dir=/tmp/drift, version=0)
//! > SET name Alice
//! OK
//! > GET name
//! Alice
//! > SCAN
//! name -> Alice
//! (1 entries)
//! > EXIT
//! bye
//! ```

use anyhow::{Context, Result};
use engine::{Db, Entry, Error, IteratorOptions, Options};
use std::io::{self, BufRead, Write};
use std::time::Duration;
use tracing_subscriber::EnvFilter;

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(io::stderr)
        .init();

    let opts = Options::from_env_default();
    let dir = opts.work_dir.clone();
    let db = Db::open(opts).with_context(|| format!("opening database in {}", dir.display()))?;

    println!(
        "DriftKV started (dir={}, version={})",
        dir.display(),
        db.stats().max_version
    );
    println!("Commands: SET key value | SETEX key secs value | GET key | DEL key");
    println!("          SCAN [prefix] [DESC] | FLUSH | COMPACT | GC | STATS | EXIT");
    print!("> ");
    io::stdout().flush().ok();

    let stdin = io::stdin();
    for line in stdin.lock().lines() {
        let line = line?;
        if !execute(&db, &line) {
            break;
        }
        print!("> ");
        io::stdout().flush().ok();
    }

    db.close().context("closing database")?;
    Ok(())
}

/// Runs one command line. Returns false when the shell should exit.
fn execute(db: &Db, line: &str) -> bool {
    let mut parts = line.split_whitespace();
    let cmd = match parts.next() {
        Some(cmd) => cmd,
        None => return true,
    };
    tracing::debug!(command = cmd, "executing");
    match cmd.to_uppercase().as_str() {
        "SET" => match parts.next() {
            Some(k) => {
                let v = parts.collect::<Vec<&str>>().join(" ");
                if v.is_empty() {
                    println!("ERR usage: SET key value");
                } else {
                    report(db.set(Entry::new(k, v)), "set");
                }
            }
            None => println!("ERR usage: SET key value"),
        },
        "SETEX" => {
            let k = parts.next();
            let secs = parts.next().and_then(|s| s.parse::<u64>().ok());
            let v = parts.collect::<Vec<&str>>().join(" ");
            match (k, secs) {
                (Some(k), Some(secs)) if !v.is_empty() => {
                    let entry = Entry::new(k, v).with_ttl(Duration::from_secs(secs));
                    report(db.set(entry), "set");
                }
                _ => println!("ERR usage: SETEX key secs value"),
            }
        }
        "GET" => match parts.next() {
            Some(k) => match db.get(k.as_bytes()) {
                Ok(entry) => println!("{}", String::from_utf8_lossy(&entry.value)),
                Err(Error::NotFound) => println!("(nil)"),
                Err(e) => println!("ERR read failed: {}", e),
            },
            None => println!("ERR usage: GET key"),
        },
        "DEL" => match parts.next() {
            Some(k) => report(db.delete(k.as_bytes()), "del"),
            None => println!("ERR usage: DEL key"),
        },
        "SCAN" => {
            let mut opts = IteratorOptions::default();
            for arg in parts {
                if arg.eq_ignore_ascii_case("DESC") {
                    opts = opts.descending();
                } else {
                    opts = opts.with_prefix(arg);
                }
            }
            if let Err(e) = scan(db, opts) {
                println!("ERR scan failed: {}", e);
            }
        }
        "FLUSH" => match db.flush() {
            Ok(()) => println!("OK ({})", level_counts(db)),
            Err(e) => println!("ERR flush failed: {}", e),
        },
        "COMPACT" => match db.compact() {
            Ok(()) => println!("OK ({})", level_counts(db)),
            Err(e) => println!("ERR compact failed: {}", e),
        },
        "GC" => match db.run_value_log_gc() {
            Ok(Some(gc)) => println!(
                "OK (segment={}, moved={}, dropped={})",
                gc.fid, gc.moved, gc.dropped
            ),
            Ok(None) => println!("OK (nothing to collect)"),
            Err(e) => println!("ERR gc failed: {}", e),
        },
        "STATS" => print_stats(db),
        "EXIT" | "QUIT" => {
            println!("bye");
            return false;
        }
        other => println!("unknown command: {}", other),
    }
    true
}

fn report(res: engine::Result<()>, what: &str) {
    match res {
        Ok(()) => println!("OK"),
        Err(e) => println!("ERR {} failed: {}", what, e),
    }
}

fn scan(db: &Db, opts: IteratorOptions) -> engine::Result<()> {
    let mut it = db.new_iterator(opts)?;
    it.rewind();
    let mut count = 0;
    while let Some(entry) = it.item() {
        println!(
            "{} -> {}",
            String::from_utf8_lossy(&entry.key),
            String::from_utf8_lossy(&entry.value)
        );
        count += 1;
        it.next();
    }
    it.close()?;
    if count == 0 {
        println!("(empty)");
    } else {
        println!("({} entries)", count);
    }
    Ok(())
}

/// `L0=2, L1=1`, listing only non-empty levels.
fn level_counts(db: &Db) -> String {
    let parts: Vec<String> = db
        .stats()
        .levels
        .iter()
        .filter(|l| l.tables > 0)
        .map(|l| format!("L{}={}", l.level, l.tables))
        .collect();
    if parts.is_empty() {
        "no tables".to_string()
    } else {
        parts.join(", ")
    }
}

fn print_stats(db: &Db) {
    let s = db.stats();
    println!("entries:        {}", s.entry_num);
    println!("max version:    {}", s.max_version);
    println!("sets/deletes:   {}/{}", s.sets, s.deletes);
    println!("gets/misses:    {}/{}", s.gets, s.get_misses);
    println!("vlog writes:    {}", s.vlog_writes);
    println!("vlog segments:  {}", s.vlog_segments);
    println!("flushes:        {}", s.flushes);
    println!("compactions:    {}", s.compactions);
    println!("gc runs:        {}", s.gc_runs);
    println!("write stalls:   {}", s.stalls);
    println!("immutables:     {}", s.immutables);
    println!("memtable bytes: {}", s.memtable_size);
    for l in s.levels.iter().filter(|l| l.tables > 0) {
        println!(
            "L{}: {} tables, {} bytes, {} stale",
            l.level, l.tables, l.size, l.stale_size
        );
    }
}

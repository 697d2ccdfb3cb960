//! # CLI - Undertow Interactive Shell
//!
//! A REPL over the Undertow [`Database`]. Reads commands from stdin, runs
//! them, and prints results to stdout; logs go to stderr. Works both
//! interactively and scripted (pipe commands via stdin).
//!
//! ## Commands
//!
//! ```text
//! SET ks cf key col value [ts]   Write one column (ts defaults to now, in µs)
//! DEL ks cf key col [ts]         Write a tombstone for one column
//! GET ks cf key col              Print the value or "(nil)"
//! FLUSH ks cf                    Flush the CF's memtable to a table
//! TRUNCATE ks cf                 Truncate the CF and wait for completion
//! DISCARD                        Retire commit log segments already flushed
//! STATS                          Per-CF counters and commit log segments
//! EXIT / QUIT                    Flush everything, seal the log, exit
//! ```
//!
//! ## Configuration
//!
//! ```text
//! UNDERTOW_DATA_DIR              Data directory          (default: "data")
//! UNDERTOW_SEGMENT_KB            Segment size in KiB     (default: 32768)
//! UNDERTOW_SEGMENT_MAX_AGE_SECS  Segment age limit       (default: none)
//! UNDERTOW_SYNC                  fsync every append      (default: "true")
//! UNDERTOW_FLUSH_KB              Flush threshold in KiB  (default: 1024)
//! RUST_LOG                       Log filter              (default: "info")
//! ```
//!
//! ## Example
//!
//! ```text
//! $ cargo run -p cli
//! Undertow started (data_dir=data, column_families=2, replayed=0)
//! > SET Keyspace1 Standard1 user42 name Alice
//! OK
//! > GET Keyspace1 Standard1 user42 name
//! Alice
//! > TRUNCATE Keyspace1 Standard1
//! OK (truncated at 1:94, 0 tables removed)
//! > GET Keyspace1 Standard1 user42 name
//! (nil)
//! > EXIT
//! bye
//! ```

use anyhow::{bail, Context, Result};
use config::Config;
use engine::Database;
use std::io::{self, BufRead, Write};
use std::time::{SystemTime, UNIX_EPOCH};
use tracing_subscriber::EnvFilter;

/// Microseconds since the Unix epoch, the default write timestamp.
fn now_micros() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_micros() as u64)
        .unwrap_or(0)
}

fn parse_timestamp(arg: Option<&str>) -> Result<u64> {
    match arg {
        Some(ts) => ts
            .parse()
            .with_context(|| format!("invalid timestamp '{}'", ts)),
        None => Ok(now_micros()),
    }
}

/// Outcome of one shell line.
#[derive(Debug, PartialEq, Eq)]
enum Reply {
    Print(String),
    Exit,
}

fn usage(text: &str) -> Result<Reply> {
    Ok(Reply::Print(format!("ERR usage: {}", text)))
}

/// Runs one command line against `db`.
fn execute(db: &Database, line: &str) -> Result<Reply> {
    let parts: Vec<&str> = line.split_whitespace().collect();
    let Some((cmd, args)) = parts.split_first() else {
        return Ok(Reply::Print(String::new()));
    };

    match (cmd.to_uppercase().as_str(), args) {
        ("SET", [ks, cf, key, col, value, rest @ ..]) if rest.len() <= 1 => {
            let ts = parse_timestamp(rest.first().copied())?;
            db.set(ks, cf, key.as_bytes(), col.as_bytes(), value.as_bytes(), ts)?;
            Ok(Reply::Print("OK".to_string()))
        }
        ("SET", _) => usage("SET ks cf key col value [ts]"),

        ("DEL", [ks, cf, key, col, rest @ ..]) if rest.len() <= 1 => {
            let ts = parse_timestamp(rest.first().copied())?;
            db.delete(ks, cf, key.as_bytes(), col.as_bytes(), ts)?;
            Ok(Reply::Print("OK".to_string()))
        }
        ("DEL", _) => usage("DEL ks cf key col [ts]"),

        ("GET", [ks, cf, key, col]) => {
            let reply = match db.get(ks, cf, key.as_bytes(), col.as_bytes())? {
                Some(v) => String::from_utf8_lossy(&v).into_owned(),
                None => "(nil)".to_string(),
            };
            Ok(Reply::Print(reply))
        }
        ("GET", _) => usage("GET ks cf key col"),

        ("FLUSH", [ks, cf]) => {
            let reply = match db.flush(ks, cf)? {
                Some(meta) => format!("OK (flushed at {})", meta.replay_position),
                None => "OK (nothing to flush)".to_string(),
            };
            Ok(Reply::Print(reply))
        }
        ("FLUSH", _) => usage("FLUSH ks cf"),

        ("TRUNCATE", [ks, cf]) => {
            let outcome = db.truncate(ks, cf)?.wait()?;
            Ok(Reply::Print(format!(
                "OK (truncated at {}, {} tables removed)",
                outcome.truncated_at, outcome.tables_removed
            )))
        }
        ("TRUNCATE", _) => usage("TRUNCATE ks cf"),

        ("DISCARD", []) => {
            let retired = db.discard_completed()?;
            Ok(Reply::Print(format!("OK ({} segments retired)", retired)))
        }

        ("STATS", []) => {
            let mut out = String::new();
            for s in db.stats() {
                out.push_str(&format!(
                    "{}.{} (id={}): rows={} bytes={} frozen={} tables={} floor={}\n",
                    s.keyspace,
                    s.name,
                    s.cf_id,
                    s.memtable_rows,
                    s.memtable_bytes,
                    s.frozen_memtables,
                    s.tables,
                    s.recovery_floor
                ));
            }
            out.push_str(&format!(
                "commitlog: segments={:?} tail={}",
                db.commit_log().segment_ids(),
                db.commit_log().current_position()
            ));
            Ok(Reply::Print(out))
        }

        ("EXIT" | "QUIT", _) => Ok(Reply::Exit),

        (other, _) => bail!("unknown command: {}", other),
    }
}

fn main() -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .init();

    let config = Config::from_env()?;
    let db = Database::open(config)?;

    let report = db.recovery_report();
    println!(
        "Undertow started (data_dir={}, column_families={}, replayed={})",
        db.config().data_dir.display(),
        db.stats().len(),
        report.updates_replayed
    );
    if !report.is_clean() {
        println!("WARN {} commit log segment(s) were corrupt", report.failures.len());
    }
    println!("Commands: SET ks cf key col value [ts] | GET ks cf key col | DEL ks cf key col [ts]");
    println!("          FLUSH ks cf | TRUNCATE ks cf | DISCARD | STATS | EXIT");
    print!("> ");
    io::stdout().flush().ok();

    let stdin = io::stdin();
    for line in stdin.lock().lines() {
        let line = line?;
        match execute(&db, &line) {
            Ok(Reply::Print(text)) if text.is_empty() => {}
            Ok(Reply::Print(text)) => println!("{}", text),
            Ok(Reply::Exit) => break,
            Err(e) => println!("ERR {:#}", e),
        }
        print!("> ");
        io::stdout().flush().ok();
    }

    db.close()?;
    println!("bye");
    Ok(())
}

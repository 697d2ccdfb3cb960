//! # Config - runtime settings for Undertow
//!
//! All settings are controlled via environment variables, falling back to
//! defaults when a variable is unset:
//!
//! ```text
//! UNDERTOW_DATA_DIR              root data directory          (default: "data")
//! UNDERTOW_SEGMENT_KB            commit log segment size KiB  (default: 32768 = 32 MiB)
//! UNDERTOW_SEGMENT_MAX_AGE_SECS  rotate segments older than   (default: unset = never)
//! UNDERTOW_SYNC                  fsync every log append       (default: "true")
//! UNDERTOW_FLUSH_KB              memtable flush threshold KiB (default: 1024 = 1 MiB)
//! ```
//!
//! Under `data_dir` the engine lays out:
//!
//! ```text
//! commitlog/                 CommitLog-<id>.log segments
//! data/<keyspace>/<cf>/      on-disk tables
//! system/METADATA            flush metadata and truncation records
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

pub use commitlog::DEFAULT_SEGMENT_SIZE;

pub const DEFAULT_FLUSH_THRESHOLD: usize = 1024 * 1024;

/// Errors raised while reading configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid value for {var}: {value:?} ({reason})")]
    Invalid {
        var: &'static str,
        value: String,
        reason: String,
    },
}

/// Settings shared by the commit log and the column-family stores.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    /// Root directory for every file the database owns.
    pub data_dir: PathBuf,
    /// A commit log segment is rotated once it reaches this many bytes.
    pub segment_size: u64,
    /// A segment older than this is rotated on the next append.
    pub segment_max_age: Option<Duration>,
    /// If `true`, every commit log append is followed by `fsync`.
    pub sync_writes: bool,
    /// Memtable byte-size threshold that triggers an automatic flush.
    pub flush_threshold: usize,
}

impl Config {
    /// Defaults rooted at `data_dir`.
    pub fn new(data_dir: impl AsRef<Path>) -> Self {
        Self {
            data_dir: data_dir.as_ref().to_path_buf(),
            segment_size: DEFAULT_SEGMENT_SIZE,
            segment_max_age: None,
            sync_writes: true,
            flush_threshold: DEFAULT_FLUSH_THRESHOLD,
        }
    }

    /// Builds a configuration from `UNDERTOW_*` environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as [`from_env`](Config::from_env) but with an injectable lookup,
    /// so callers (and tests) need not touch the process environment.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let data_dir = lookup("UNDERTOW_DATA_DIR").unwrap_or_else(|| "data".to_string());
        let mut cfg = Config::new(data_dir);

        if let Some(kb) = parse_var::<u64, _>(&lookup, "UNDERTOW_SEGMENT_KB")? {
            if kb == 0 {
                return Err(ConfigError::Invalid {
                    var: "UNDERTOW_SEGMENT_KB",
                    value: kb.to_string(),
                    reason: "must be greater than zero".into(),
                });
            }
            cfg.segment_size = kb
                .checked_mul(1024)
                .ok_or_else(|| too_large("UNDERTOW_SEGMENT_KB", kb))?;
        }
        if let Some(secs) = parse_var::<u64, _>(&lookup, "UNDERTOW_SEGMENT_MAX_AGE_SECS")? {
            cfg.segment_max_age = Some(Duration::from_secs(secs));
        }
        if let Some(sync) = parse_var::<bool, _>(&lookup, "UNDERTOW_SYNC")? {
            cfg.sync_writes = sync;
        }
        if let Some(kb) = parse_var::<usize, _>(&lookup, "UNDERTOW_FLUSH_KB")? {
            cfg.flush_threshold = kb
                .checked_mul(1024)
                .ok_or_else(|| too_large("UNDERTOW_FLUSH_KB", kb))?;
        }
        Ok(cfg)
    }

    pub fn with_segment_size(mut self, bytes: u64) -> Self {
        self.segment_size = bytes;
        self
    }

    pub fn with_segment_max_age(mut self, age: Duration) -> Self {
        self.segment_max_age = Some(age);
        self
    }

    pub fn with_sync_writes(mut self, sync: bool) -> Self {
        self.sync_writes = sync;
        self
    }

    pub fn with_flush_threshold(mut self, bytes: usize) -> Self {
        self.flush_threshold = bytes;
        self
    }

    #[must_use]
    pub fn commitlog_dir(&self) -> PathBuf {
        self.data_dir.join("commitlog")
    }

    #[must_use]
    pub fn tables_dir(&self) -> PathBuf {
        self.data_dir.join("data")
    }

    #[must_use]
    pub fn system_dir(&self) -> PathBuf {
        self.data_dir.join("system")
    }
}

fn parse_var<T, F>(lookup: &F, var: &'static str) -> Result<Option<T>, ConfigError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
    F: Fn(&str) -> Option<String>,
{
    match lookup(var) {
        None => Ok(None),
        Some(raw) => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|e| ConfigError::Invalid {
                var,
                value: raw.clone(),
                reason: e.to_string(),
            }),
    }
}

fn too_large(var: &'static str, kb: impl std::fmt::Display) -> ConfigError {
    ConfigError::Invalid {
        var,
        value: kb.to_string(),
        reason: "too large to express in bytes".into(),
    }
}

//! # Metadata - durable flush and truncation markers
//!
//! Stores, per column family, the latest [`FlushMetadata`] position and the
//! latest [`TruncationRecord`]. Together with the tables on disk these give
//! each CF its recovery floor.
//!
//! ## File Format
//!
//! A small text file, one marker per line:
//!
//! ```text
//! # Undertow system metadata
//! # Format: <flush|truncated> <cf_id> <segment_id>:<offset>
//! flush 1 3:1840
//! truncated 1 3:2210
//! ```
//!
//! Lines starting with `#` are comments. Empty lines are ignored.
//!
//! ## Crash Safety
//!
//! The file is rewritten atomically: write to `METADATA.tmp`, fsync, rename
//! over `METADATA`, fsync the directory. A persist returns only after the
//! rename is durable, and memory is updated only after that.

use anyhow::{bail, Context, Result};
use model::{CfId, FlushMetadata, ReplayPosition, TruncationRecord};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

/// Name of the metadata file within the system directory.
pub const METADATA_FILENAME: &str = "METADATA";

const METADATA_TMP_FILENAME: &str = "METADATA.tmp";

/// Crash-safe storage for flush and truncation markers.
///
/// Persists are monotonic: a marker older than the stored one is accepted
/// and ignored.
pub trait MetadataStore: Send + Sync {
    fn flush_metadata(&self, cf_id: CfId) -> Option<FlushMetadata>;

    fn truncation_record(&self, cf_id: CfId) -> Option<TruncationRecord>;

    /// Returns only once `meta` is durable.
    fn persist_flush(&self, meta: FlushMetadata) -> Result<()>;

    /// Returns only once `record` is durable.
    fn persist_truncation(&self, record: TruncationRecord) -> Result<()>;

    /// Highest segment id named by any stored marker.
    fn max_segment_id(&self) -> u64;
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
struct Markers {
    flushed: BTreeMap<CfId, ReplayPosition>,
    truncated: BTreeMap<CfId, ReplayPosition>,
}

/// [`MetadataStore`] backed by `<system_dir>/METADATA`.
#[derive(Debug)]
pub struct FileMetadataStore {
    path: PathBuf,
    markers: Mutex<Markers>,
}

impl FileMetadataStore {
    /// Loads `dir/METADATA`, or starts empty if it does not exist.
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists but cannot be parsed.
    pub fn load_or_create(dir: &Path) -> Result<Self> {
        fs::create_dir_all(dir)
            .with_context(|| format!("failed to create {}", dir.display()))?;
        let path = dir.join(METADATA_FILENAME);

        // a leftover tmp file is an unfinished rewrite; the old file stands
        let tmp = dir.join(METADATA_TMP_FILENAME);
        if tmp.exists() {
            tracing::warn!(path = %tmp.display(), "removing unfinished metadata rewrite");
            let _ = fs::remove_file(&tmp);
        }

        let markers = if path.exists() {
            Self::parse(&path)?
        } else {
            Markers::default()
        };

        tracing::debug!(
            path = %path.display(),
            flushed = markers.flushed.len(),
            truncated = markers.truncated.len(),
            "loaded metadata"
        );

        Ok(Self {
            path,
            markers: Mutex::new(markers),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn parse(path: &Path) -> Result<Markers> {
        let file = File::open(path)
            .with_context(|| format!("failed to open metadata at {}", path.display()))?;
        let reader = BufReader::new(file);
        let mut markers = Markers::default();

        for (line_num, line) in reader.lines().enumerate() {
            let line =
                line.with_context(|| format!("failed to read metadata line {}", line_num + 1))?;
            let trimmed = line.trim();
            if trimmed.is_empty() || trimmed.starts_with('#') {
                continue;
            }

            let mut parts = trimmed.split_whitespace();
            let (Some(kind), Some(cf), Some(pos), None) =
                (parts.next(), parts.next(), parts.next(), parts.next())
            else {
                bail!(
                    "metadata line {}: invalid format (expected '<kind> <cf_id> <segment>:<offset>'): {}",
                    line_num + 1,
                    trimmed
                );
            };

            let cf_id: CfId = cf
                .parse()
                .with_context(|| format!("metadata line {}: bad cf id '{}'", line_num + 1, cf))?;
            let position = parse_position(pos)
                .with_context(|| format!("metadata line {}: bad position '{}'", line_num + 1, pos))?;

            let slot = match kind {
                "flush" => markers.flushed.entry(cf_id),
                "truncated" => markers.truncated.entry(cf_id),
                other => bail!(
                    "metadata line {}: unknown marker '{}' (expected flush or truncated)",
                    line_num + 1,
                    other
                ),
            };
            let current = slot.or_insert(position);
            *current = (*current).max(position);
        }

        Ok(markers)
    }

    fn save(&self, markers: &Markers) -> Result<()> {
        let tmp_path = self.path.with_file_name(METADATA_TMP_FILENAME);
        {
            let mut f = OpenOptions::new()
                .create(true)
                .write(true)
                .truncate(true)
                .open(&tmp_path)
                .with_context(|| {
                    format!("failed to create metadata tmp at {}", tmp_path.display())
                })?;

            writeln!(f, "# Undertow system metadata")?;
            writeln!(f, "# Format: <flush|truncated> <cf_id> <segment_id>:<offset>")?;
            for (cf_id, pos) in &markers.flushed {
                writeln!(f, "flush {} {}:{}", cf_id, pos.segment_id, pos.offset)?;
            }
            for (cf_id, pos) in &markers.truncated {
                writeln!(f, "truncated {} {}:{}", cf_id, pos.segment_id, pos.offset)?;
            }
            f.flush()?;
            f.sync_all()?;
        }

        fs::rename(&tmp_path, &self.path)
            .with_context(|| format!("failed to install metadata at {}", self.path.display()))?;
        if let Some(parent) = self.path.parent() {
            File::open(parent)?.sync_all()?;
        }
        Ok(())
    }

    /// Applies `update` to a copy, saves it, and only then publishes it.
    fn update<F>(&self, update: F) -> Result<()>
    where
        F: FnOnce(&mut Markers) -> bool,
    {
        let mut markers = self.markers.lock();
        let mut next = markers.clone();
        if !update(&mut next) {
            return Ok(());
        }
        self.save(&next)?;
        *markers = next;
        Ok(())
    }
}

fn parse_position(s: &str) -> Result<ReplayPosition> {
    let (seg, off) = s
        .split_once(':')
        .ok_or_else(|| anyhow::anyhow!("expected '<segment>:<offset>'"))?;
    Ok(ReplayPosition::new(seg.parse()?, off.parse()?))
}

/// Raises `map[cf_id]` to `pos`; returns `false` if it was already there.
fn raise(map: &mut BTreeMap<CfId, ReplayPosition>, cf_id: CfId, pos: ReplayPosition) -> bool {
    match map.get(&cf_id) {
        Some(current) if *current >= pos => false,
        _ => {
            map.insert(cf_id, pos);
            true
        }
    }
}

impl MetadataStore for FileMetadataStore {
    fn flush_metadata(&self, cf_id: CfId) -> Option<FlushMetadata> {
        self.markers
            .lock()
            .flushed
            .get(&cf_id)
            .map(|pos| FlushMetadata {
                cf_id,
                replay_position: *pos,
            })
    }

    fn truncation_record(&self, cf_id: CfId) -> Option<TruncationRecord> {
        self.markers
            .lock()
            .truncated
            .get(&cf_id)
            .map(|pos| TruncationRecord {
                cf_id,
                truncated_at: *pos,
            })
    }

    fn persist_flush(&self, meta: FlushMetadata) -> Result<()> {
        self.update(|m| raise(&mut m.flushed, meta.cf_id, meta.replay_position))
    }

    fn persist_truncation(&self, record: TruncationRecord) -> Result<()> {
        self.update(|m| raise(&mut m.truncated, record.cf_id, record.truncated_at))?;
        tracing::debug!(
            cf_id = record.cf_id,
            truncated_at = %record.truncated_at,
            "persisted truncation record"
        );
        Ok(())
    }

    fn max_segment_id(&self) -> u64 {
        let markers = self.markers.lock();
        markers
            .flushed
            .values()
            .chain(markers.truncated.values())
            .map(|p| p.segment_id)
            .max()
            .unwrap_or(0)
    }
}

/// A CF's recovery floor as far as the metadata store knows:
/// max(flush metadata, truncation record), or NONE.
pub fn persisted_floor(store: &dyn MetadataStore, cf_id: CfId) -> ReplayPosition {
    let flushed = store
        .flush_metadata(cf_id)
        .map_or(ReplayPosition::NONE, |m| m.replay_position);
    let truncated = store
        .truncation_record(cf_id)
        .map_or(ReplayPosition::NONE, |r| r.truncated_at);
    flushed.max(truncated)
}

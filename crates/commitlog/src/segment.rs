//! A single append-only commit log file.

use model::{CfId, ReplayPosition};
use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use crate::reader::{write_header, SegmentReader, HEADER_LEN};
use crate::CommitLogError;

const SEGMENT_PREFIX: &str = "CommitLog-";
const SEGMENT_SUFFIX: &str = ".log";

/// File name of segment `id`: `CommitLog-<id:020>.log`.
#[must_use]
pub fn segment_file_name(id: u64) -> String {
    format!("{}{:020}{}", SEGMENT_PREFIX, id, SEGMENT_SUFFIX)
}

/// Parses the segment id out of a file name produced by [`segment_file_name`].
#[must_use]
pub fn parse_segment_id(name: &str) -> Option<u64> {
    name.strip_prefix(SEGMENT_PREFIX)?
        .strip_suffix(SEGMENT_SUFFIX)?
        .parse()
        .ok()
}

/// One commit log segment.
///
/// The active segment owns an append-mode file handle; sealed segments and
/// segments discovered on disk at startup only keep their path. For every
/// column family that has entries here the segment remembers the highest
/// position that CF reaches, which is what retirement checks against.
#[derive(Debug)]
pub struct Segment {
    id: u64,
    path: PathBuf,
    file: Option<File>,
    /// End of the last appended frame (file length for segments found on disk).
    offset: u64,
    created: Instant,
    dirty: HashMap<CfId, ReplayPosition>,
    /// `false` for segments found on disk until recovery has read them.
    scanned: bool,
    sync: bool,
}

impl Segment {
    /// Creates segment `id` in `dir` and writes its header.
    pub fn create(dir: &Path, id: u64, sync: bool) -> Result<Self, CommitLogError> {
        let path = dir.join(segment_file_name(id));
        let mut file = OpenOptions::new()
            .create_new(true)
            .append(true)
            .open(&path)?;

        let mut header = Vec::with_capacity(HEADER_LEN as usize);
        write_header(&mut header, id)?;
        if let Err(e) = file.write_all(&header).and_then(|()| file.sync_all()) {
            drop(file);
            if let Err(cleanup) = fs::remove_file(&path) {
                tracing::warn!(path = %path.display(), error = %cleanup, "could not remove half-written segment");
            }
            return Err(e.into());
        }

        // make the new directory entry durable
        if let Ok(d) = File::open(dir) {
            let _ = d.sync_all();
        }

        Ok(Self {
            id,
            path,
            file: Some(file),
            offset: HEADER_LEN,
            created: Instant::now(),
            dirty: HashMap::new(),
            scanned: true,
            sync,
        })
    }

    /// Registers a segment left on disk by a previous run.
    ///
    /// Its dirty map is unknown until recovery scans it, so until then it is
    /// never safe to discard.
    pub fn open_existing(path: &Path) -> Result<Self, CommitLogError> {
        let id = path
            .file_name()
            .and_then(|n| n.to_str())
            .and_then(parse_segment_id)
            .ok_or_else(|| {
                CommitLogError::Io(io::Error::new(
                    io::ErrorKind::InvalidInput,
                    format!("not a commit log segment: {}", path.display()),
                ))
            })?;
        let offset = fs::metadata(path)?.len();
        Ok(Self {
            id,
            path: path.to_path_buf(),
            file: None,
            offset,
            created: Instant::now(),
            dirty: HashMap::new(),
            scanned: false,
            sync: false,
        })
    }

    #[must_use]
    pub fn id(&self) -> u64 {
        self.id
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Returns `true` while the segment still accepts appends.
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.file.is_some()
    }

    /// Position of the segment's current end.
    #[must_use]
    pub fn position(&self) -> ReplayPosition {
        ReplayPosition::new(self.id, self.offset)
    }

    #[must_use]
    pub fn size(&self) -> u64 {
        self.offset
    }

    /// Column families with at least one entry in this segment.
    pub fn dirty_cf_ids(&self) -> impl Iterator<Item = CfId> + '_ {
        self.dirty.keys().copied()
    }

    /// Highest position `cf_id` reaches in this segment, if any.
    #[must_use]
    pub fn max_position_for(&self, cf_id: CfId) -> Option<ReplayPosition> {
        self.dirty.get(&cf_id).copied()
    }

    /// Appends one encoded frame and marks every CF in `cf_ids` dirty.
    ///
    /// Returns the position of the entry (the offset just past it). On a
    /// failed write the file is cut back to the previous end so a torn frame
    /// cannot hide entries appended later. If that cut fails too, the write
    /// handle is dropped and the cut's error returned: the segment then
    /// reports itself full and takes no more appends.
    pub fn append(&mut self, frame: &[u8], cf_ids: &[CfId]) -> Result<ReplayPosition, CommitLogError> {
        let file = self.file.as_mut().ok_or_else(|| {
            CommitLogError::Io(io::Error::new(
                io::ErrorKind::Other,
                format!("segment {} is sealed", self.id),
            ))
        })?;

        let written = file.write_all(frame).and_then(|()| {
            if self.sync {
                file.sync_all()
            } else {
                Ok(())
            }
        });
        if let Err(e) = written {
            if let Err(rollback) = file.set_len(self.offset) {
                tracing::error!(
                    segment = self.id,
                    offset = self.offset,
                    write_error = %e,
                    error = %rollback,
                    "could not cut back a failed append; retiring the write handle"
                );
                self.file = None;
                return Err(rollback.into());
            }
            return Err(e.into());
        }

        self.offset += frame.len() as u64;
        let position = ReplayPosition::new(self.id, self.offset);
        for cf_id in cf_ids {
            self.dirty.insert(*cf_id, position);
        }
        Ok(position)
    }

    /// Returns `true` once the segment should be rotated out.
    ///
    /// An empty segment is never full, so an oversized entry always gets a
    /// segment of its own instead of an endless rotation. A segment without
    /// a write handle is always full.
    #[must_use]
    pub fn is_full(&self, max_bytes: u64, max_age: Option<Duration>) -> bool {
        if self.file.is_none() {
            return true;
        }
        if self.offset <= HEADER_LEN {
            return false;
        }
        self.offset >= max_bytes || max_age.is_some_and(|age| self.created.elapsed() >= age)
    }

    /// Forces appended frames to stable storage.
    pub fn sync(&mut self) -> Result<(), CommitLogError> {
        if let Some(f) = self.file.as_mut() {
            f.flush()?;
            f.sync_all()?;
        }
        Ok(())
    }

    /// Syncs and closes the write handle. The segment stops accepting appends.
    pub fn seal(&mut self) -> Result<(), CommitLogError> {
        self.sync()?;
        self.file = None;
        Ok(())
    }

    /// Opens a fresh reader positioned at the first entry.
    pub fn read_all(&self) -> Result<SegmentReader<File>, CommitLogError> {
        SegmentReader::open(&self.path)
    }

    /// Records what recovery learned about this segment's contents.
    pub fn mark_scanned(&mut self, dirty: HashMap<CfId, ReplayPosition>) {
        for (cf_id, pos) in dirty {
            let slot = self.dirty.entry(cf_id).or_insert(pos);
            *slot = (*slot).max(pos);
        }
        self.scanned = true;
    }

    #[must_use]
    pub fn is_scanned(&self) -> bool {
        self.scanned
    }

    /// Returns `true` iff every CF dirtied here has a floor at or above the
    /// highest position it reaches in this segment. A CF missing from
    /// `floors` is treated as having no floor at all.
    #[must_use]
    pub fn is_safe_to_discard(&self, floors: &HashMap<CfId, ReplayPosition>) -> bool {
        if !self.scanned {
            return false;
        }
        self.dirty.iter().all(|(cf_id, max)| {
            floors
                .get(cf_id)
                .is_some_and(|floor| floor >= max)
        })
    }

    /// Removes the segment file.
    pub fn delete(self) -> Result<(), CommitLogError> {
        drop(self.file);
        fs::remove_file(&self.path)?;
        Ok(())
    }
}

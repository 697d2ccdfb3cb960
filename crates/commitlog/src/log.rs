use model::{CfId, ColumnFamilyUpdate, Mutation, ReplayPosition};
use parking_lot::{Mutex, RwLock};
use std::collections::{HashMap, VecDeque};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::reader::{encode_frame, SegmentReader};
use crate::segment::{parse_segment_id, Segment};
use crate::CommitLogError;

/// Default segment size that triggers rotation (32 MiB).
pub const DEFAULT_SEGMENT_SIZE: u64 = 32 * 1024 * 1024;

/// Tuning knobs for a [`CommitLog`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommitLogOptions {
    /// Rotate once the active segment reaches this many bytes.
    pub segment_size: u64,
    /// Rotate once the active segment is older than this.
    pub segment_max_age: Option<Duration>,
    /// `fsync` after every append.
    pub sync: bool,
}

impl Default for CommitLogOptions {
    fn default() -> Self {
        Self {
            segment_size: DEFAULT_SEGMENT_SIZE,
            segment_max_age: None,
            sync: true,
        }
    }
}

/// A segment that could only be partially replayed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SegmentFailure {
    pub segment_id: u64,
    pub path: PathBuf,
    /// Offset of the first unreadable frame.
    pub offset: u64,
    pub reason: String,
}

/// Counters produced by [`CommitLog::recover`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReplayStats {
    pub segments_read: usize,
    pub entries_read: usize,
    /// CF updates handed to the apply callback.
    pub updates_replayed: usize,
    /// CF updates at or below their CF's floor.
    pub updates_skipped: usize,
    /// CF updates for column families not present in the floors map.
    pub updates_unknown_cf: usize,
    pub failures: Vec<SegmentFailure>,
}

struct LogState {
    /// Oldest first; the back is always the active segment.
    segments: VecDeque<Segment>,
    next_id: u64,
    closed: bool,
    /// Reusable frame buffer.
    frame: Vec<u8>,
}

impl LogState {
    fn active(&self) -> &Segment {
        self.segments
            .back()
            .unwrap_or_else(|| unreachable!("commit log always has an active segment"))
    }

    fn active_mut(&mut self) -> &mut Segment {
        self.segments
            .back_mut()
            .unwrap_or_else(|| unreachable!("commit log always has an active segment"))
    }
}

fn ensure_open(state: &LogState) -> Result<(), CommitLogError> {
    if state.closed {
        return Err(CommitLogError::Io(std::io::Error::new(
            std::io::ErrorKind::Other,
            "commit log is closed",
        )));
    }
    Ok(())
}

/// The write-ahead log: an ordered set of segments, the newest of which is
/// active.
///
/// [`add`](CommitLog::add) is the ordering authority. Encoding happens
/// outside the lock; assigning the position, writing the frame and marking
/// CFs dirty happen inside one critical section, so position order equals
/// file order.
///
/// Retirement ([`discard_completed`](CommitLog::discard_completed)) and
/// replay ([`recover`](CommitLog::recover)) are mutually exclusive: replay
/// holds `retire` shared for its whole pass, retirement holds it exclusively.
pub struct CommitLog {
    dir: PathBuf,
    options: CommitLogOptions,
    state: Mutex<LogState>,
    retire: RwLock<()>,
}

impl std::fmt::Debug for CommitLog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("CommitLog")
            .field("dir", &self.dir)
            .field("options", &self.options)
            .field("segments", &state.segments.len())
            .field("tail", &state.active().position())
            .finish()
    }
}

impl CommitLog {
    /// Opens the log in `dir`, registering every segment left by earlier runs
    /// and starting a fresh active segment.
    ///
    /// The new segment's id is greater than every id on disk and than
    /// `last_known_segment_id` (the highest segment id the caller has seen in
    /// persisted floors), so positions keep increasing even after every old
    /// segment was retired.
    pub fn open<P: AsRef<Path>>(
        dir: P,
        options: CommitLogOptions,
        last_known_segment_id: u64,
    ) -> Result<Self, CommitLogError> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;

        let mut existing: Vec<Segment> = Vec::new();
        for entry in fs::read_dir(&dir)? {
            let path = entry?.path();
            let is_segment = path
                .file_name()
                .and_then(|n| n.to_str())
                .and_then(parse_segment_id)
                .is_some();
            if is_segment {
                existing.push(Segment::open_existing(&path)?);
            }
        }
        existing.sort_by_key(Segment::id);

        let max_existing = existing.last().map_or(0, Segment::id);
        let active_id = max_existing.max(last_known_segment_id) + 1;
        let active = Segment::create(&dir, active_id, options.sync)?;

        tracing::info!(
            dir = %dir.display(),
            recovered_segments = existing.len(),
            active_segment = active_id,
            "opened commit log"
        );

        let mut segments: VecDeque<Segment> = existing.into();
        segments.push_back(active);

        Ok(Self {
            dir,
            options,
            state: Mutex::new(LogState {
                segments,
                next_id: active_id + 1,
                closed: false,
                frame: Vec::with_capacity(256),
            }),
            retire: RwLock::new(()),
        })
    }

    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    #[must_use]
    pub fn options(&self) -> &CommitLogOptions {
        &self.options
    }

    /// Appends `mutation` and returns its position.
    ///
    /// Rotates to a fresh segment first if the active one is full. Every CF
    /// the mutation touches is marked dirty in the segment that received it.
    pub fn add(&self, mutation: &Mutation) -> Result<ReplayPosition, CommitLogError> {
        let body = mutation.encode()?;
        let cf_ids: Vec<CfId> = mutation.cf_ids().collect();

        let mut guard = self.state.lock();
        let state = &mut *guard;
        ensure_open(state)?;

        if state
            .active()
            .is_full(self.options.segment_size, self.options.segment_max_age)
        {
            self.rotate(state)?;
        }

        encode_frame(&body, &mut state.frame)?;
        let LogState {
            segments, frame, ..
        } = state;
        let active = segments
            .back_mut()
            .unwrap_or_else(|| unreachable!("commit log always has an active segment"));
        let position = active.append(frame, &cf_ids)?;

        tracing::trace!(position = %position, cfs = ?cf_ids, "appended mutation");
        Ok(position)
    }

    /// Seals the active segment, then starts segment `next_id`.
    ///
    /// The id is used up before the file is created, so a failed create
    /// leaves nothing that blocks the next attempt. Until one succeeds the
    /// sealed segment stays at the back and reports itself full.
    fn rotate(&self, state: &mut LogState) -> Result<(), CommitLogError> {
        let sealed = state.active_mut();
        sealed.seal()?;
        let (sealed_id, size) = (sealed.id(), sealed.size());

        let id = state.next_id;
        state.next_id = id + 1;
        let fresh = Segment::create(&self.dir, id, self.options.sync)?;

        tracing::debug!(
            sealed_segment = sealed_id,
            size,
            active_segment = id,
            "rotated commit log segment"
        );
        state.segments.push_back(fresh);
        Ok(())
    }

    /// Seals the active segment and starts a new one, regardless of size.
    pub fn force_rotate(&self) -> Result<(), CommitLogError> {
        let mut state = self.state.lock();
        ensure_open(&state)?;
        self.rotate(&mut state)
    }

    /// The log tail: every entry appended from now on has a greater position.
    #[must_use]
    pub fn current_position(&self) -> ReplayPosition {
        self.state.lock().active().position()
    }

    /// Forces the active segment to stable storage.
    pub fn sync(&self) -> Result<(), CommitLogError> {
        self.state.lock().active_mut().sync()
    }

    /// Syncs and seals the active segment. Further appends fail.
    pub fn close(&self) -> Result<(), CommitLogError> {
        let mut state = self.state.lock();
        state.closed = true;
        let active = state.active_mut();
        active.seal()?;
        tracing::info!(segment = active.id(), "closed commit log");
        Ok(())
    }

    #[must_use]
    pub fn segment_count(&self) -> usize {
        self.state.lock().segments.len()
    }

    /// Ids of every live segment, oldest first.
    #[must_use]
    pub fn segment_ids(&self) -> Vec<u64> {
        self.state.lock().segments.iter().map(Segment::id).collect()
    }

    /// Deletes segments, oldest first, while each is safe to discard under
    /// `floors`. Stops at the first segment that is not, and never touches
    /// the active segment. Returns the number of segments deleted.
    pub fn discard_completed(
        &self,
        floors: &HashMap<CfId, ReplayPosition>,
    ) -> Result<usize, CommitLogError> {
        let _retire = self.retire.write();

        let mut retired = Vec::new();
        {
            let mut state = self.state.lock();
            while state.segments.len() > 1 {
                let safe = state
                    .segments
                    .front()
                    .is_some_and(|oldest| oldest.is_safe_to_discard(floors));
                if !safe {
                    break;
                }
                if let Some(oldest) = state.segments.pop_front() {
                    retired.push(oldest);
                }
            }
        }

        let count = retired.len();
        for segment in retired {
            assert!(
                !segment.is_active() && segment.is_safe_to_discard(floors),
                "retiring segment {} that floors do not cover",
                segment.id()
            );
            let id = segment.id();
            segment.delete()?;
            tracing::info!(segment = id, "retired commit log segment");
        }
        Ok(count)
    }

    /// Replays every segment, oldest to newest.
    ///
    /// `floors` must hold an entry for every known column family (use
    /// [`ReplayPosition::NONE`] for a CF without a floor). For each CF update
    /// in each entry: updates for CFs missing from `floors` are skipped and
    /// do not pin the segment; updates at or below their floor are skipped;
    /// the rest are handed to `apply` in log order.
    ///
    /// A corrupt entry ends replay of its segment (recorded in
    /// [`ReplayStats::failures`]) and replay continues with the next one.
    /// I/O errors abort the whole pass.
    pub fn recover<F>(
        &self,
        floors: &HashMap<CfId, ReplayPosition>,
        mut apply: F,
    ) -> Result<ReplayStats, CommitLogError>
    where
        F: FnMut(ReplayPosition, &Mutation, &ColumnFamilyUpdate),
    {
        let _retire = self.retire.read();

        let targets: Vec<(u64, PathBuf)> = {
            let state = self.state.lock();
            state
                .segments
                .iter()
                .map(|s| (s.id(), s.path().to_path_buf()))
                .collect()
        };

        let mut stats = ReplayStats::default();
        for (segment_id, path) in targets {
            let mut dirty: HashMap<CfId, ReplayPosition> = HashMap::new();
            stats.segments_read += 1;

            let failure = match SegmentReader::open(&path) {
                Ok(reader) if reader.segment_id() != 0 && reader.segment_id() != segment_id => {
                    Some(SegmentFailure {
                        segment_id,
                        path: path.clone(),
                        offset: 0,
                        reason: format!(
                            "header names segment {} but file is segment {}",
                            reader.segment_id(),
                            segment_id
                        ),
                    })
                }
                Ok(mut reader) => {
                    let failure =
                        Self::replay_segment(&mut reader, floors, &mut dirty, &mut stats, &mut apply)?;
                    if reader.torn_tail() {
                        tracing::warn!(
                            segment = segment_id,
                            offset = reader.offset(),
                            "commit log segment ends in a partial entry; ignoring the tail"
                        );
                    }
                    failure.map(|(offset, reason)| SegmentFailure {
                        segment_id,
                        path: path.clone(),
                        offset,
                        reason,
                    })
                }
                Err(CommitLogError::Corrupt { offset, reason, .. }) => Some(SegmentFailure {
                    segment_id,
                    path: path.clone(),
                    offset,
                    reason,
                }),
                Err(e) => return Err(e),
            };

            if let Some(f) = failure {
                tracing::warn!(
                    segment = f.segment_id,
                    offset = f.offset,
                    reason = %f.reason,
                    "corrupt commit log entry; skipping rest of segment"
                );
                stats.failures.push(f);
            }

            let mut state = self.state.lock();
            if let Some(seg) = state.segments.iter_mut().find(|s| s.id() == segment_id) {
                seg.mark_scanned(dirty);
            }
        }

        tracing::debug!(?stats, "commit log replay pass finished");
        Ok(stats)
    }

    /// Replays one segment; returns `(offset, reason)` of a corrupt entry.
    fn replay_segment<R, F>(
        reader: &mut SegmentReader<R>,
        floors: &HashMap<CfId, ReplayPosition>,
        dirty: &mut HashMap<CfId, ReplayPosition>,
        stats: &mut ReplayStats,
        apply: &mut F,
    ) -> Result<Option<(u64, String)>, CommitLogError>
    where
        R: std::io::Read,
        F: FnMut(ReplayPosition, &Mutation, &ColumnFamilyUpdate),
    {
        for item in reader {
            let (position, mutation) = match item {
                Ok(entry) => entry,
                Err(CommitLogError::Corrupt { offset, reason, .. }) => {
                    return Ok(Some((offset, reason)));
                }
                Err(e) => return Err(e),
            };
            stats.entries_read += 1;

            for update in &mutation.updates {
                let Some(floor) = floors.get(&update.cf_id) else {
                    stats.updates_unknown_cf += 1;
                    continue;
                };
                let max = dirty.entry(update.cf_id).or_insert(position);
                *max = (*max).max(position);

                if position <= *floor {
                    stats.updates_skipped += 1;
                } else {
                    apply(position, &mutation, update);
                    stats.updates_replayed += 1;
                }
            }
        }
        Ok(None)
    }
}

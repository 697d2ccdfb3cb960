use crate::{CfId, ReplayPosition};

/// Coverage marker attached to every on-disk table.
///
/// Every commit log entry at or below `replay_position` for `cf_id` is
/// reflected in the table (or in an older one).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlushMetadata {
    pub cf_id: CfId,
    pub replay_position: ReplayPosition,
}

/// Persisted marker left by a truncate: entries at or below `truncated_at`
/// for `cf_id` must never be replayed again.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TruncationRecord {
    pub cf_id: CfId,
    pub truncated_at: ReplayPosition,
}

use std::fmt;

/// A point in the commit log: `(segment_id, offset)`.
///
/// Positions compare lexicographically (segment first, then offset), which is
/// exactly the order entries were appended in. The position of an appended
/// entry is the byte offset immediately past its frame, so the log tail
/// captured at any instant is strictly below every entry appended afterwards.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct ReplayPosition {
    pub segment_id: u64,
    pub offset: u64,
}

impl ReplayPosition {
    /// Sorts below every position a real segment can produce.
    pub const NONE: ReplayPosition = ReplayPosition {
        segment_id: 0,
        offset: 0,
    };

    #[must_use]
    pub const fn new(segment_id: u64, offset: u64) -> Self {
        Self { segment_id, offset }
    }

    #[must_use]
    pub fn is_none(&self) -> bool {
        *self == Self::NONE
    }
}

impl fmt::Display for ReplayPosition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.segment_id, self.offset)
    }
}

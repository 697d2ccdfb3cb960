//! # Commit Log - segmented write-ahead log
//!
//! Provides crash-safe durability for Undertow's column-family stores.
//!
//! Every [`model::Mutation`] is serialized once and appended to the active
//! segment **before** it is applied to any memtable. Each append returns a
//! [`ReplayPosition`](model::ReplayPosition) `(segment_id, offset)`, the
//! system's durability clock. On restart the log is replayed, skipping each
//! column family's entries at or below that CF's recovery floor.
//!
//! ## Segment Format
//!
//! ```text
//! [magic "UCL1": u32 LE][version: u16 LE][segment_id: u64 LE]
//! [record_len: u32 LE][crc32: u32 LE][mutation bytes ...]
//! [record_len: u32 LE][crc32: u32 LE][mutation bytes ...]
//! ...
//! ```
//!
//! `record_len` includes the 4-byte CRC but **not** itself. An entry's
//! position is the offset just past its frame.
//!
//! ## Lifecycle
//!
//! - Segments rotate when they reach a size or age threshold.
//! - [`CommitLog::discard_completed`] deletes segments oldest-first while
//!   every CF they touched has a floor covering them.
//! - [`CommitLog::recover`] replays all segments; a corrupt entry ends its
//!   segment's replay without aborting the pass.
//!
//! ## Example
//!
//! ```rust,no_run
//! use commitlog::{CommitLog, CommitLogOptions};
//! use model::{Mutation, ReplayPosition};
//! use std::collections::HashMap;
//!
//! let log = CommitLog::open("commitlog", CommitLogOptions::default(), 0).unwrap();
//! let mut m = Mutation::new("Keyspace1", b"key".to_vec());
//! m.add(1, "col", "value", 1);
//! let pos = log.add(&m).unwrap();
//!
//! let floors = HashMap::from([(1, ReplayPosition::NONE)]);
//! log.recover(&floors, |p, _m, update| println!("{} -> {:?}", p, update)).unwrap();
//! # let _ = pos;
//! ```

mod log;
mod reader;
mod segment;

use std::io;
use thiserror::Error;

pub use log::{CommitLog, CommitLogOptions, ReplayStats, SegmentFailure, DEFAULT_SEGMENT_SIZE};
pub use reader::{SegmentReader, FRAME_HEADER_LEN, HEADER_LEN, SEGMENT_MAGIC, SEGMENT_VERSION};
pub use segment::{parse_segment_id, segment_file_name, Segment};

/// Errors that can occur during commit log operations.
#[derive(Debug, Error)]
pub enum CommitLogError {
    /// The medium rejected a read or write.
    #[error("io error: {0}")]
    Io(#[from] io::Error),

    /// An entry failed CRC validation, had an impossible length, or did not
    /// decode.
    #[error("corrupt entry in segment {segment_id} at offset {offset}: {reason}")]
    Corrupt {
        segment_id: u64,
        offset: u64,
        reason: String,
    },

    /// The mutation could not be serialized.
    #[error("encode error: {0}")]
    Codec(#[from] model::CodecError),
}

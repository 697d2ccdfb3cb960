//! # Model - shared data types
//!
//! The minimal row/column data model the durability layer needs from its
//! data-model collaborator, plus the coordinates and markers that flow
//! between the commit log, the memtables and the on-disk tables.
//!
//! | Type                 | Purpose                                             |
//! |----------------------|-----------------------------------------------------|
//! | [`ReplayPosition`]   | `(segment_id, offset)` durability clock             |
//! | [`Cell`], [`Row`]    | timestamped column values and their reconciliation  |
//! | [`Mutation`]         | one row key, one update per touched column family   |
//! | [`FlushMetadata`]    | log coverage of an on-disk table                    |
//! | [`TruncationRecord`] | per-CF floor established by a truncate              |
//!
//! Mutations are encoded with a small little-endian binary format (see
//! [`mutation`]) so the commit log can serialize them exactly once.

mod markers;
pub mod mutation;
mod position;
mod row;

pub use markers::{FlushMetadata, TruncationRecord};
pub use mutation::{CodecError, ColumnFamilyUpdate, Mutation};
pub use position::ReplayPosition;
pub use row::{Cell, Row};

/// Numeric identifier of a column family, stable across restarts.
pub type CfId = u32;

/// Maximum allowed row key size in bytes (64 KiB).
pub const MAX_KEY_SIZE: usize = 64 * 1024;
/// Maximum allowed column name size in bytes (64 KiB).
pub const MAX_COLUMN_NAME_SIZE: usize = 64 * 1024;
/// Maximum allowed cell value size in bytes (10 MiB).
pub const MAX_VALUE_SIZE: usize = 10 * 1024 * 1024;

#[cfg(test)]
mod tests;

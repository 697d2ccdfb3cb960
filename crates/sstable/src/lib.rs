//! # SSTable - Sorted String Table
//!
//! Immutable, on-disk tables written when a column family's memtable is
//! flushed. Once created they are never modified; a truncate deletes them
//! whole.
//!
//! Every table carries its **flush metadata** in the footer: the column
//! family it belongs to and the commit log position it covers. Every log
//! entry at or below that position is reflected in the table, which is what
//! lets recovery skip those entries and lets a truncate decide which tables
//! to delete.
//!
//! ## File layout
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────────┐
//! │ DATA SECTION (one record per row, sorted by key)              │
//! │                                                               │
//! │ crc32 (u32) | body_len (u32) | body                           │
//! │ body = key_len (u32) | key | cell_count (u32) | cells         │
//! │ cell = name_len (u32) | name | ts (u64) | present (u8)        │
//! │        | [val_len (u32) | val]                                │
//! │                                                               │
//! │ The CRC32 covers the body.                                    │
//! ├───────────────────────────────────────────────────────────────┤
//! │ INDEX SECTION (key -> data_offset mapping)                    │
//! │                                                               │
//! │ key_len (u32) | key | data_offset (u64)                       │
//! ├───────────────────────────────────────────────────────────────┤
//! │ FOOTER (always last 32 bytes)                                 │
//! │                                                               │
//! │ cf_id (u32) | flush_segment (u64) | flush_offset (u64)        │
//! │ index_offset (u64) | magic (u32) "UST1"                       │
//! └───────────────────────────────────────────────────────────────┘
//! ```
//!
//! All integers are little-endian.

mod format;
mod reader;
mod writer;

pub use format::{Footer, FOOTER_BYTES, SSTABLE_MAGIC};
pub use reader::SSTableReader;
pub use writer::SSTableWriter;

#[cfg(test)]
mod tests;

//! Per-column-family in-memory write buffer.
//!
//! A [`Memtable`] holds rows sorted by key. Writers apply updates through a
//! shared reference, so one memtable can be written by many threads while
//! readers look rows up. Each memtable remembers the commit log tail as of
//! its creation: everything it will ever hold was appended after that point.

use model::{CfId, Cell, ReplayPosition, Row};
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};

#[derive(Debug)]
pub struct Memtable {
    cf_id: CfId,
    creation_position: ReplayPosition,
    rows: RwLock<BTreeMap<Vec<u8>, Row>>,
    approx_size: AtomicUsize,
}

impl Memtable {
    pub fn new(cf_id: CfId, creation_position: ReplayPosition) -> Self {
        Self {
            cf_id,
            creation_position,
            rows: RwLock::new(BTreeMap::new()),
            approx_size: AtomicUsize::new(0),
        }
    }

    pub fn cf_id(&self) -> CfId {
        self.cf_id
    }

    /// Commit log tail at the moment this memtable became active.
    pub fn creation_position(&self) -> ReplayPosition {
        self.creation_position
    }

    /// Upserts `update` into the row stored under `key`.
    ///
    /// Each column is reconciled by timestamp (see [`Cell::supersedes`]), so
    /// applying the same update twice, or two updates in either order, ends
    /// in the same state. Returns the number of cells that were kept.
    pub fn apply(&self, key: &[u8], update: &Row) -> usize {
        let mut rows = self.rows.write();
        let mut grown = 0usize;
        let mut shrunk = 0usize;

        let row = rows.entry(key.to_vec()).or_insert_with(|| {
            grown += key.len();
            Row::new()
        });

        let mut kept = 0;
        for (name, cell) in update.cells() {
            let old = row.cell(name).map(|c| c.size());
            if row.merge_cell(name.clone(), cell.clone()) {
                kept += 1;
                match old {
                    Some(old) => shrunk += old,
                    None => grown += name.len(),
                }
                grown += cell.size();
            }
        }

        self.approx_size.fetch_add(grown, Ordering::Relaxed);
        self.approx_size.fetch_sub(shrunk, Ordering::Relaxed);
        kept
    }

    /// Returns a copy of the row for `key`, tombstones included.
    pub fn get(&self, key: &[u8]) -> Option<Row> {
        self.rows.read().get(key).cloned()
    }

    /// Returns the reconciled cell for `key`/`column`, tombstones included.
    pub fn get_cell(&self, key: &[u8], column: &[u8]) -> Option<Cell> {
        self.rows
            .read()
            .get(key)
            .and_then(|row| row.cell(column).cloned())
    }

    pub fn contains_key(&self, key: &[u8]) -> bool {
        self.rows.read().contains_key(key)
    }

    /// Sorted copy of every row, used to write the memtable to disk.
    pub fn snapshot(&self) -> Vec<(Vec<u8>, Row)> {
        self.rows
            .read()
            .iter()
            .map(|(k, r)| (k.clone(), r.clone()))
            .collect()
    }

    /// Number of row keys (rows holding only tombstones count too).
    pub fn len(&self) -> usize {
        self.rows.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.read().is_empty()
    }

    /// Keys, column names, values and timestamps in bytes.
    pub fn approx_size(&self) -> usize {
        self.approx_size.load(Ordering::Relaxed)
    }
}

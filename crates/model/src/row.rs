use std::cmp::Ordering;
use std::collections::BTreeMap;

/// A single column value stamped with a client timestamp.
///
/// `value == None` is a tombstone (the column was deleted at `timestamp`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cell {
    pub timestamp: u64,
    pub value: Option<Vec<u8>>,
}

impl Cell {
    #[must_use]
    pub fn live(timestamp: u64, value: Vec<u8>) -> Self {
        Self {
            timestamp,
            value: Some(value),
        }
    }

    #[must_use]
    pub fn tombstone(timestamp: u64) -> Self {
        Self {
            timestamp,
            value: None,
        }
    }

    #[must_use]
    pub fn is_tombstone(&self) -> bool {
        self.value.is_none()
    }

    /// Approximate heap footprint, used for memtable sizing.
    #[must_use]
    pub fn size(&self) -> usize {
        8 + self.value.as_ref().map_or(0, Vec::len)
    }

    /// Returns `true` if `self` must replace `other`.
    ///
    /// Higher timestamp wins. On a tie a tombstone beats a live value, and
    /// between two live values the greater byte string wins, so applying the
    /// same pair in either order converges.
    #[must_use]
    pub fn supersedes(&self, other: &Cell) -> bool {
        match self.timestamp.cmp(&other.timestamp) {
            Ordering::Greater => true,
            Ordering::Less => false,
            Ordering::Equal => match (&self.value, &other.value) {
                (None, Some(_)) => true,
                (Some(_), None) | (None, None) => false,
                (Some(a), Some(b)) => a > b,
            },
        }
    }
}

/// The columns of one row within one column family, sorted by name.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Row {
    cells: BTreeMap<Vec<u8>, Cell>,
}

impl Row {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Reconciles `cell` into column `name`. Returns `true` if it was kept.
    pub fn merge_cell(&mut self, name: Vec<u8>, cell: Cell) -> bool {
        match self.cells.get(&name) {
            Some(existing) if !cell.supersedes(existing) => false,
            _ => {
                self.cells.insert(name, cell);
                true
            }
        }
    }

    /// Reconciles every column of `other` into `self`.
    pub fn merge(&mut self, other: Row) {
        for (name, cell) in other.cells {
            self.merge_cell(name, cell);
        }
    }

    /// Returns the reconciled cell for `name`, tombstones included.
    #[must_use]
    pub fn cell(&self, name: &[u8]) -> Option<&Cell> {
        self.cells.get(name)
    }

    /// Returns the live value of `name`, or `None` if absent or deleted.
    #[must_use]
    pub fn value(&self, name: &[u8]) -> Option<&[u8]> {
        self.cells.get(name).and_then(|c| c.value.as_deref())
    }

    pub fn cells(&self) -> impl Iterator<Item = (&Vec<u8>, &Cell)> {
        self.cells.iter()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.cells.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.cells.is_empty()
    }

    /// Returns `true` if at least one column holds a live value.
    #[must_use]
    pub fn has_live_cells(&self) -> bool {
        self.cells.values().any(|c| !c.is_tombstone())
    }
}

impl FromIterator<(Vec<u8>, Cell)> for Row {
    fn from_iter<I: IntoIterator<Item = (Vec<u8>, Cell)>>(iter: I) -> Self {
        let mut row = Row::new();
        for (name, cell) in iter {
            row.merge_cell(name, cell);
        }
        row
    }
}

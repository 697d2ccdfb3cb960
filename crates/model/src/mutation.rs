//! Row mutations and their binary encoding.
//!
//! ```text
//! [ks_len: u16][keyspace][key_len: u32][key][update_count: u16]
//!   repeated update_count times:
//!   [cf_id: u32][cell_count: u32]
//!     repeated cell_count times:
//!     [name_len: u32][name][timestamp: u64][present: u8][val_len: u32][value]
//! ```
//!
//! All integers are little-endian. `val_len` and `value` are only present
//! when `present == 1`.

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::io::{self, Read};
use thiserror::Error;

use crate::{Cell, CfId, Row, MAX_COLUMN_NAME_SIZE, MAX_KEY_SIZE, MAX_VALUE_SIZE};

/// Errors produced while encoding or decoding a [`Mutation`].
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("io error: {0}")]
    Io(#[from] io::Error),

    /// The bytes do not describe a valid mutation.
    #[error("invalid mutation encoding: {0}")]
    Invalid(String),
}

/// All column changes for one column family within a [`Mutation`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnFamilyUpdate {
    pub cf_id: CfId,
    pub row: Row,
}

/// A set of column changes to one row key, possibly spanning several column
/// families of the same keyspace. This is the unit the commit log records.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mutation {
    pub keyspace: String,
    pub key: Vec<u8>,
    pub updates: Vec<ColumnFamilyUpdate>,
}

impl Mutation {
    pub fn new(keyspace: impl Into<String>, key: impl Into<Vec<u8>>) -> Self {
        Self {
            keyspace: keyspace.into(),
            key: key.into(),
            updates: Vec::new(),
        }
    }

    /// Adds a live column value to the update for `cf_id`.
    pub fn add(
        &mut self,
        cf_id: CfId,
        column: impl Into<Vec<u8>>,
        value: impl Into<Vec<u8>>,
        timestamp: u64,
    ) -> &mut Self {
        self.update_for(cf_id)
            .merge_cell(column.into(), Cell::live(timestamp, value.into()));
        self
    }

    /// Adds a column tombstone to the update for `cf_id`.
    pub fn delete(&mut self, cf_id: CfId, column: impl Into<Vec<u8>>, timestamp: u64) -> &mut Self {
        self.update_for(cf_id)
            .merge_cell(column.into(), Cell::tombstone(timestamp));
        self
    }

    fn update_for(&mut self, cf_id: CfId) -> &mut Row {
        let idx = match self.updates.iter().position(|u| u.cf_id == cf_id) {
            Some(idx) => idx,
            None => {
                self.updates.push(ColumnFamilyUpdate {
                    cf_id,
                    row: Row::new(),
                });
                self.updates.len() - 1
            }
        };
        &mut self.updates[idx].row
    }

    /// Column families touched by this mutation, in insertion order.
    pub fn cf_ids(&self) -> impl Iterator<Item = CfId> + '_ {
        self.updates.iter().map(|u| u.cf_id)
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.updates.iter().all(|u| u.row.is_empty())
    }

    /// Appends the binary encoding of `self` to `buf`.
    pub fn encode_into(&self, buf: &mut Vec<u8>) -> Result<(), CodecError> {
        let ks = self.keyspace.as_bytes();
        if ks.len() > u16::MAX as usize {
            return Err(CodecError::Invalid("keyspace name too long".into()));
        }
        if self.key.len() > MAX_KEY_SIZE {
            return Err(CodecError::Invalid(format!(
                "key too large: {} bytes (max {})",
                self.key.len(),
                MAX_KEY_SIZE
            )));
        }
        if self.updates.len() > u16::MAX as usize {
            return Err(CodecError::Invalid("too many column family updates".into()));
        }

        buf.write_u16::<LittleEndian>(ks.len() as u16)?;
        buf.extend_from_slice(ks);
        buf.write_u32::<LittleEndian>(self.key.len() as u32)?;
        buf.extend_from_slice(&self.key);
        buf.write_u16::<LittleEndian>(self.updates.len() as u16)?;

        for update in &self.updates {
            buf.write_u32::<LittleEndian>(update.cf_id)?;
            buf.write_u32::<LittleEndian>(update.row.len() as u32)?;
            for (name, cell) in update.row.cells() {
                write_cell(buf, name, cell)?;
            }
        }
        Ok(())
    }

    /// Encodes `self` into a fresh buffer.
    pub fn encode(&self) -> Result<Vec<u8>, CodecError> {
        let mut buf = Vec::with_capacity(64);
        self.encode_into(&mut buf)?;
        Ok(buf)
    }

    /// Decodes a mutation, rejecting trailing bytes.
    pub fn decode(mut bytes: &[u8]) -> Result<Self, CodecError> {
        let rdr = &mut bytes;

        let ks_len = rdr.read_u16::<LittleEndian>()? as usize;
        let keyspace = String::from_utf8(read_exact_vec(rdr, ks_len)?)
            .map_err(|_| CodecError::Invalid("keyspace is not valid utf-8".into()))?;

        let key_len = rdr.read_u32::<LittleEndian>()? as usize;
        if key_len > MAX_KEY_SIZE {
            return Err(CodecError::Invalid(format!("key_len {} exceeds maximum", key_len)));
        }
        let key = read_exact_vec(rdr, key_len)?;

        let update_count = rdr.read_u16::<LittleEndian>()? as usize;
        let mut updates = Vec::with_capacity(update_count);
        for _ in 0..update_count {
            let cf_id = rdr.read_u32::<LittleEndian>()?;
            let cell_count = rdr.read_u32::<LittleEndian>()? as usize;
            let mut row = Row::new();
            for _ in 0..cell_count {
                let (name, cell) = read_cell(rdr)?;
                row.merge_cell(name, cell);
            }
            updates.push(ColumnFamilyUpdate { cf_id, row });
        }

        if !rdr.is_empty() {
            return Err(CodecError::Invalid(format!(
                "{} trailing bytes after mutation",
                rdr.len()
            )));
        }

        Ok(Self {
            keyspace,
            key,
            updates,
        })
    }
}

/// Writes one `[name_len][name][timestamp][present][val_len][value]` cell.
///
/// Shared with the on-disk table format so both encode cells identically.
pub fn write_cell(buf: &mut Vec<u8>, name: &[u8], cell: &Cell) -> Result<(), CodecError> {
    if name.len() > MAX_COLUMN_NAME_SIZE {
        return Err(CodecError::Invalid("column name too large".into()));
    }
    buf.write_u32::<LittleEndian>(name.len() as u32)?;
    buf.extend_from_slice(name);
    buf.write_u64::<LittleEndian>(cell.timestamp)?;
    match &cell.value {
        Some(v) => {
            if v.len() > MAX_VALUE_SIZE {
                return Err(CodecError::Invalid(format!(
                    "value too large: {} bytes (max {})",
                    v.len(),
                    MAX_VALUE_SIZE
                )));
            }
            buf.write_u8(1)?;
            buf.write_u32::<LittleEndian>(v.len() as u32)?;
            buf.extend_from_slice(v);
        }
        None => buf.write_u8(0)?,
    }
    Ok(())
}

/// Reads one cell written by [`write_cell`].
pub fn read_cell<R: Read>(rdr: &mut R) -> Result<(Vec<u8>, Cell), CodecError> {
    let name_len = rdr.read_u32::<LittleEndian>()? as usize;
    if name_len > MAX_COLUMN_NAME_SIZE {
        return Err(CodecError::Invalid(format!(
            "column name_len {} exceeds maximum",
            name_len
        )));
    }
    let name = read_exact_vec(rdr, name_len)?;
    let timestamp = rdr.read_u64::<LittleEndian>()?;
    let value = match rdr.read_u8()? {
        0 => None,
        1 => {
            let val_len = rdr.read_u32::<LittleEndian>()? as usize;
            if val_len > MAX_VALUE_SIZE {
                return Err(CodecError::Invalid(format!(
                    "val_len {} exceeds maximum",
                    val_len
                )));
            }
            Some(read_exact_vec(rdr, val_len)?)
        }
        other => {
            return Err(CodecError::Invalid(format!("unknown presence flag {}", other)));
        }
    };
    Ok((name, Cell { timestamp, value }))
}

fn read_exact_vec<R: Read>(rdr: &mut R, len: usize) -> Result<Vec<u8>, CodecError> {
    let mut v = vec![0u8; len];
    rdr.read_exact(&mut v)?;
    Ok(v)
}

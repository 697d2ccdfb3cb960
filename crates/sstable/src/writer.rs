use anyhow::{Context, Result};
use byteorder::{LittleEndian, WriteBytesExt};
use crc32fast::Hasher as Crc32;
use memtable::Memtable;
use model::mutation::write_cell;
use model::{CfId, ReplayPosition, Row};
use std::fs::{rename, OpenOptions};
use std::io::{BufWriter, Seek, Write};
use std::path::Path;

use crate::format::Footer;

/// Writes rows to disk as an immutable SSTable file.
///
/// The write is crash-safe: data goes to a temporary file which is fsynced
/// and then atomically renamed to the final path.
pub struct SSTableWriter {}

impl SSTableWriter {
    /// Flushes `mem` to a new table at `path` covering the log up to
    /// `flush_position`.
    ///
    /// # Errors
    ///
    /// Returns an error if the memtable is empty (an empty flush writes no
    /// table) or on any I/O failure.
    pub fn write_from_memtable(
        path: &Path,
        mem: &Memtable,
        flush_position: ReplayPosition,
    ) -> Result<()> {
        if mem.is_empty() {
            anyhow::bail!("refusing to write an empty SSTable (empty memtable)");
        }
        Self::write_rows(path, mem.cf_id(), flush_position, mem.snapshot())
    }

    /// Writes `rows`, which must be in ascending key order, to `path`.
    ///
    /// # Crash Safety
    ///
    /// Writes to `path.sst.tmp`, calls `sync_all()`, then atomically renames.
    /// If the process crashes mid-write the temp file is left behind and
    /// removed on the next startup.
    pub fn write_rows<I>(
        path: &Path,
        cf_id: CfId,
        flush_position: ReplayPosition,
        rows: I,
    ) -> Result<()>
    where
        I: IntoIterator<Item = (Vec<u8>, Row)>,
    {
        let tmp_path = path.with_extension("sst.tmp");
        let raw_file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&tmp_path)
            .with_context(|| format!("failed to create {}", tmp_path.display()))?;
        let mut file = BufWriter::new(raw_file);

        let mut index: Vec<(Vec<u8>, u64)> = Vec::new();
        let mut body: Vec<u8> = Vec::with_capacity(256);

        for (key, row) in rows {
            body.clear();
            body.write_u32::<LittleEndian>(key.len() as u32)?;
            body.extend_from_slice(&key);
            body.write_u32::<LittleEndian>(row.len() as u32)?;
            for (name, cell) in row.cells() {
                write_cell(&mut body, name, cell)?;
            }

            let mut hasher = Crc32::new();
            hasher.update(&body);

            let offset = file.stream_position()?;
            file.write_u32::<LittleEndian>(hasher.finalize())?;
            file.write_u32::<LittleEndian>(body.len() as u32)?;
            file.write_all(&body)?;

            index.push((key, offset));
        }

        if index.is_empty() {
            drop(file);
            let _ = std::fs::remove_file(&tmp_path);
            anyhow::bail!("refusing to write an empty SSTable (no rows)");
        }

        let index_offset = file.stream_position()?;
        for (key, data_offset) in &index {
            file.write_u32::<LittleEndian>(key.len() as u32)?;
            file.write_all(key)?;
            file.write_u64::<LittleEndian>(*data_offset)?;
        }

        Footer {
            cf_id,
            flush_position,
            index_offset,
        }
        .write_to(&mut file)?;

        file.flush()?;
        file.into_inner()?.sync_all()?;

        rename(&tmp_path, path)?;

        // make the rename durable
        if let Some(parent) = path.parent() {
            if let Ok(dir) = std::fs::File::open(parent) {
                let _ = dir.sync_all();
            }
        }

        Ok(())
    }
}

use anyhow::{bail, Context, Result};
use byteorder::{LittleEndian, ReadBytesExt};
use crc32fast::Hasher as Crc32;
use model::mutation::read_cell;
use model::{CfId, FlushMetadata, Row, MAX_KEY_SIZE};
use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufReader, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use crate::format::{Footer, FOOTER_BYTES};

/// Largest record body we'll allocate during reads. Prevents OOM on corrupt files.
const MAX_RECORD_BYTES: usize = 64 * 1024 * 1024;

/// Reads an SSTable file for point lookups.
///
/// On [`open`](SSTableReader::open) the whole index is loaded into memory
/// (key -> data-section offset). A persistent file handle is kept for the
/// lifetime of the reader, wrapped in a `Mutex` so `get` works through
/// `&self`.
pub struct SSTableReader {
    path: PathBuf,
    index: BTreeMap<Vec<u8>, u64>,
    file: Mutex<BufReader<File>>,
    footer: Footer,
}

impl std::fmt::Debug for SSTableReader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SSTableReader")
            .field("path", &self.path)
            .field("cf_id", &self.footer.cf_id)
            .field("flush_position", &self.footer.flush_position)
            .field("rows", &self.index.len())
            .finish()
    }
}

impl SSTableReader {
    /// Opens a table file and loads its index.
    ///
    /// # Errors
    ///
    /// Returns an error if the file is too small, the magic is wrong, the
    /// index offset points outside the file, or any I/O operation fails.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path_buf = path.as_ref().to_path_buf();
        let mut f = File::open(&path_buf)
            .with_context(|| format!("failed to open sstable {}", path_buf.display()))?;
        let filesize = f.metadata()?.len();

        if filesize < FOOTER_BYTES {
            bail!("sstable file too small");
        }

        let footer = Footer::read_from(&mut f)?;
        let index_end = filesize - FOOTER_BYTES;
        if footer.index_offset > index_end {
            bail!("invalid index_offset");
        }

        f.seek(SeekFrom::Start(footer.index_offset))?;
        let mut rdr = BufReader::new(f);
        let mut index = BTreeMap::new();
        let mut pos = footer.index_offset;

        while pos < index_end {
            let key_len = rdr.read_u32::<LittleEndian>()? as usize;
            if key_len > MAX_KEY_SIZE {
                bail!("corrupt index: key_len {} exceeds maximum {}", key_len, MAX_KEY_SIZE);
            }
            let mut key = vec![0u8; key_len];
            rdr.read_exact(&mut key)?;
            let data_offset = rdr.read_u64::<LittleEndian>()?;
            index.insert(key, data_offset);
            pos += 4 + key_len as u64 + 8;
        }

        Ok(Self {
            path: path_buf,
            index,
            file: Mutex::new(rdr),
            footer,
        })
    }

    /// Point lookup for a single row.
    ///
    /// Returns `Ok(Some(row))` if the key exists in this table (the row may
    /// hold only tombstones) and `Ok(None)` if it does not.
    ///
    /// # Errors
    ///
    /// Returns an error on I/O failure, CRC mismatch, or if the record found
    /// at the indexed offset belongs to a different key.
    pub fn get(&self, key: &[u8]) -> Result<Option<Row>> {
        let offset = match self.index.get(key) {
            Some(&o) => o,
            None => return Ok(None),
        };

        let body = {
            let mut f = self
                .file
                .lock()
                .map_err(|e| anyhow::anyhow!("lock poisoned: {}", e))?;
            f.seek(SeekFrom::Start(offset))?;
            let stored_crc = f.read_u32::<LittleEndian>()?;
            let body_len = f.read_u32::<LittleEndian>()? as usize;
            if body_len > MAX_RECORD_BYTES {
                bail!("corrupt data: record length {} at offset {}", body_len, offset);
            }
            let mut body = vec![0u8; body_len];
            f.read_exact(&mut body)?;

            let mut hasher = Crc32::new();
            hasher.update(&body);
            let actual_crc = hasher.finalize();
            if actual_crc != stored_crc {
                bail!(
                    "CRC32 mismatch at offset {}: expected {:#010x}, got {:#010x} (data corruption)",
                    offset,
                    stored_crc,
                    actual_crc
                );
            }
            body
        };

        let mut rdr = body.as_slice();
        let key_len = rdr.read_u32::<LittleEndian>()? as usize;
        if key_len > rdr.len() {
            bail!("corrupt data: key_len {} at offset {}", key_len, offset);
        }
        let (stored_key, mut rest) = rdr.split_at(key_len);
        if stored_key != key {
            bail!("index pointed to mismatching key at offset {}", offset);
        }

        let cell_count = rest.read_u32::<LittleEndian>()?;
        let mut row = Row::new();
        for _ in 0..cell_count {
            let (name, cell) = read_cell(&mut rest)?;
            row.merge_cell(name, cell);
        }
        Ok(Some(row))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn cf_id(&self) -> CfId {
        self.footer.cf_id
    }

    /// Column family and commit log coverage recorded at flush time.
    #[must_use]
    pub fn flush_metadata(&self) -> FlushMetadata {
        self.footer.flush_metadata()
    }

    /// Returns the number of rows in the in-memory index.
    #[must_use]
    pub fn len(&self) -> usize {
        self.index.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    /// Keys in ascending order.
    pub fn keys(&self) -> impl Iterator<Item = &[u8]> {
        self.index.keys().map(|k| k.as_slice())
    }

    /// Closes the table and removes its file.
    pub fn delete(self) -> Result<()> {
        let path = self.path;
        drop(self.file);
        std::fs::remove_file(&path)
            .with_context(|| format!("failed to delete sstable {}", path.display()))?;
        Ok(())
    }
}

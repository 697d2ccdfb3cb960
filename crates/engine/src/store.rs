//! Column-family store: one CF's active memtable, frozen memtables and
//! on-disk tables, plus its flush and truncate protocols.

use anyhow::{Context, Result};
use commitlog::CommitLog;
use memtable::Memtable;
use model::{CfId, FlushMetadata, ReplayPosition, Row, TruncationRecord};
use parking_lot::{Mutex, RwLock};
use sstable::{SSTableReader, SSTableWriter};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::metadata::{persisted_floor, MetadataStore};
use crate::EngineError;

const TABLE_SUFFIX: &str = ".sst";

fn table_file_name(generation: u64) -> String {
    format!("{:020}{}", generation, TABLE_SUFFIX)
}

fn parse_table_generation(name: &str) -> Option<u64> {
    name.strip_suffix(TABLE_SUFFIX)?.parse().ok()
}

/// Point-in-time counters for one column family.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnFamilyStats {
    pub keyspace: String,
    pub name: String,
    pub cf_id: CfId,
    pub memtable_rows: usize,
    pub memtable_bytes: usize,
    pub frozen_memtables: usize,
    pub tables: usize,
    pub recovery_floor: ReplayPosition,
}

/// One column family's storage.
///
/// # Locking
///
/// - `admission`: writers hold it shared for a whole write; truncate holds it
///   exclusively, which drains in-flight writes and holds back new ones.
///   A recovery pass holds it exclusively on every store at once.
/// - `active`: writers hold it shared across "commit log append + memtable
///   apply"; flush takes it exclusively only to swap in a fresh memtable and
///   capture the log tail, so every entry at or below that tail is in the
///   memtable being flushed.
/// - `flush_lock`: one flush at a time, so flush metadata advances in order.
pub struct ColumnFamilyStore {
    keyspace: String,
    name: String,
    cf_id: CfId,
    dir: PathBuf,
    commit_log: Arc<CommitLog>,
    metadata: Arc<dyn MetadataStore>,
    flush_threshold: usize,

    pub(crate) admission: RwLock<()>,
    pub(crate) active: RwLock<Arc<Memtable>>,
    /// Swapped-out memtables whose table is not installed yet, oldest first,
    /// each with the log tail captured when it was swapped out.
    frozen: RwLock<Vec<(Arc<Memtable>, ReplayPosition)>>,
    /// Newest first.
    tables: RwLock<Vec<Arc<SSTableReader>>>,
    flush_lock: Mutex<()>,
    next_generation: AtomicU64,
}

impl std::fmt::Debug for ColumnFamilyStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ColumnFamilyStore")
            .field("keyspace", &self.keyspace)
            .field("name", &self.name)
            .field("cf_id", &self.cf_id)
            .field("dir", &self.dir)
            .field("tables", &self.tables.read().len())
            .finish()
    }
}

impl ColumnFamilyStore {
    /// Opens the store rooted at `dir`, loading the tables found there.
    ///
    /// Tables whose flush metadata is at or below the persisted truncation
    /// point are deleted first: they are what an interrupted truncate left
    /// behind, and must never be served.
    pub fn open(
        keyspace: &str,
        name: &str,
        cf_id: CfId,
        dir: &Path,
        commit_log: Arc<CommitLog>,
        metadata: Arc<dyn MetadataStore>,
        flush_threshold: usize,
    ) -> Result<Self> {
        fs::create_dir_all(dir).with_context(|| format!("failed to create {}", dir.display()))?;
        cleanup_tmp_files(dir);

        let truncated_at = metadata
            .truncation_record(cf_id)
            .map(|r| r.truncated_at);

        let mut found: Vec<(u64, PathBuf)> = Vec::new();
        for entry in fs::read_dir(dir)? {
            let path = entry?.path();
            if let Some(gen) = path
                .file_name()
                .and_then(|n| n.to_str())
                .and_then(parse_table_generation)
            {
                found.push((gen, path));
            }
        }
        // newest first
        found.sort_by(|a, b| b.0.cmp(&a.0));
        let next_generation = found.first().map_or(1, |(gen, _)| gen + 1);

        let mut tables = Vec::new();
        let mut stale = 0usize;
        for (_, path) in found {
            let reader = SSTableReader::open(&path)?;
            let meta = reader.flush_metadata();
            anyhow::ensure!(
                meta.cf_id == cf_id,
                "table {} belongs to column family {}, not {}",
                path.display(),
                meta.cf_id,
                cf_id
            );
            if truncated_at.is_some_and(|t| meta.replay_position <= t) {
                reader.delete()?;
                stale += 1;
                continue;
            }
            tables.push(Arc::new(reader));
        }
        if stale > 0 {
            tracing::warn!(
                keyspace,
                cf = name,
                removed = stale,
                "deleted tables left behind by an interrupted truncate"
            );
        }

        let creation = commit_log.current_position();
        tracing::debug!(
            keyspace,
            cf = name,
            cf_id,
            tables = tables.len(),
            "opened column family store"
        );

        Ok(Self {
            keyspace: keyspace.to_string(),
            name: name.to_string(),
            cf_id,
            dir: dir.to_path_buf(),
            commit_log,
            metadata,
            flush_threshold,
            admission: RwLock::new(()),
            active: RwLock::new(Arc::new(Memtable::new(cf_id, creation))),
            frozen: RwLock::new(Vec::new()),
            tables: RwLock::new(tables),
            flush_lock: Mutex::new(()),
            next_generation: AtomicU64::new(next_generation),
        })
    }

    pub fn keyspace(&self) -> &str {
        &self.keyspace
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn cf_id(&self) -> CfId {
        self.cf_id
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn table_count(&self) -> usize {
        self.tables.read().len()
    }

    /// Everything at or below this position is reflected on disk or was
    /// truncated: max(flush metadata, truncation record, table coverage).
    pub fn recovery_floor(&self) -> ReplayPosition {
        let on_disk = self
            .tables
            .read()
            .iter()
            .map(|t| t.flush_metadata().replay_position)
            .max()
            .unwrap_or(ReplayPosition::NONE);
        persisted_floor(self.metadata.as_ref(), self.cf_id).max(on_disk)
    }

    /// Applies a replayed update. Replay runs before writers are admitted,
    /// so no commit log append is involved.
    pub(crate) fn apply_replayed(&self, key: &[u8], row: &Row) {
        self.active.read().apply(key, row);
    }

    pub(crate) fn needs_flush(&self) -> bool {
        self.active.read().approx_size() >= self.flush_threshold
    }

    /// Reconciled row for `key` across memtables and tables.
    pub fn get_row(&self, key: &[u8]) -> Result<Option<Row>> {
        let memtables: Vec<Arc<Memtable>> = {
            let active = self.active.read();
            let frozen = self.frozen.read();
            std::iter::once(Arc::clone(&active))
                .chain(frozen.iter().map(|(m, _)| Arc::clone(m)))
                .collect()
        };
        let tables: Vec<Arc<SSTableReader>> = self.tables.read().clone();

        let mut merged = Row::new();
        let mut found = false;
        for mem in &memtables {
            if let Some(row) = mem.get(key) {
                merged.merge(row);
                found = true;
            }
        }
        for table in &tables {
            if let Some(row) = table
                .get(key)
                .with_context(|| format!("read failed in {}", table.path().display()))?
            {
                merged.merge(row);
                found = true;
            }
        }
        Ok(found.then_some(merged))
    }

    /// Flushes the active memtable if it holds anything.
    ///
    /// Returns the persisted flush metadata, or `None` if there was nothing
    /// to flush.
    pub fn flush(&self) -> Result<Option<FlushMetadata>> {
        self.flush_inner(false)
    }

    /// Flushes even an empty memtable, so flush metadata is persisted at the
    /// current log tail.
    pub fn force_flush(&self) -> Result<FlushMetadata> {
        self.flush_inner(true)?.ok_or_else(|| {
            anyhow::anyhow!("forced flush of {}.{} produced no metadata", self.keyspace, self.name)
        })
    }

    fn flush_inner(&self, force: bool) -> Result<Option<FlushMetadata>> {
        let _serial = self.flush_lock.lock();

        let tail = {
            let mut active = self.active.write();
            if active.is_empty() && !force && self.frozen.read().is_empty() {
                return Ok(None);
            }
            let tail = self.commit_log.current_position();
            let fresh = Arc::new(Memtable::new(self.cf_id, tail));
            let old = std::mem::replace(&mut *active, fresh);
            if !old.is_empty() {
                self.frozen.write().push((old, tail));
            }
            tail
        };

        // oldest first, so a table never claims coverage of entries that
        // only live in an older, unwritten memtable; this also retries
        // memtables left over by a failed flush
        let pending: Vec<(Arc<Memtable>, ReplayPosition)> = self.frozen.read().clone();
        for (mem, covered) in pending {
            self.write_table(&mem, covered)?;
            self.frozen.write().retain(|(m, _)| !Arc::ptr_eq(m, &mem));
        }

        let meta = FlushMetadata {
            cf_id: self.cf_id,
            replay_position: tail,
        };
        self.metadata
            .persist_flush(meta)
            .context(EngineError::MetadataPersist {
                cf_id: self.cf_id,
                what: "flush metadata",
            })?;

        tracing::info!(
            keyspace = %self.keyspace,
            cf = %self.name,
            position = %tail,
            tables = self.tables.read().len(),
            "flushed column family"
        );
        Ok(Some(meta))
    }

    fn write_table(&self, mem: &Memtable, position: ReplayPosition) -> Result<()> {
        let generation = self.next_generation.fetch_add(1, Ordering::SeqCst);
        let path = self.dir.join(table_file_name(generation));
        SSTableWriter::write_from_memtable(&path, mem, position)
            .with_context(|| format!("failed to write table {}", path.display()))?;
        let reader = SSTableReader::open(&path)?;
        tracing::debug!(
            path = %path.display(),
            rows = reader.len(),
            "wrote table"
        );
        self.tables.write().insert(0, Arc::new(reader));
        Ok(())
    }

    /// Runs the truncate protocol on the calling thread.
    ///
    /// 1. Drain in-flight writes and hold back new ones.
    /// 2. Force a flush, so flush metadata is durable at the current tail.
    /// 3. Persist the truncation record at the tail.
    /// 4. Delete every table at or below it.
    /// 5. Run `after_discard` (commit log retirement), then admit writes again.
    ///
    /// A failed step 2 or 3 returns before anything is deleted.
    pub(crate) fn truncate_blocking<F>(&self, after_discard: F) -> Result<(ReplayPosition, usize)>
    where
        F: FnOnce() -> Result<()>,
    {
        let _admission = self.admission.write();
        tracing::debug!(keyspace = %self.keyspace, cf = %self.name, "truncate: writes drained");

        self.force_flush()?;

        let truncated_at = self.commit_log.current_position();
        self.metadata
            .persist_truncation(TruncationRecord {
                cf_id: self.cf_id,
                truncated_at,
            })
            .context(EngineError::MetadataPersist {
                cf_id: self.cf_id,
                what: "truncation record",
            })?;

        let doomed: Vec<Arc<SSTableReader>> = {
            let mut tables = self.tables.write();
            let (doomed, kept): (Vec<_>, Vec<_>) = tables
                .drain(..)
                .partition(|t| t.flush_metadata().replay_position <= truncated_at);
            *tables = kept;
            doomed
        };
        let removed = doomed.len();
        for table in doomed {
            match Arc::try_unwrap(table) {
                Ok(reader) => reader.delete()?,
                // a concurrent read still holds it; the file can go anyway
                Err(shared) => fs::remove_file(shared.path())
                    .with_context(|| format!("failed to delete {}", shared.path().display()))?,
            }
        }

        after_discard()?;

        tracing::info!(
            keyspace = %self.keyspace,
            cf = %self.name,
            truncated_at = %truncated_at,
            tables_removed = removed,
            "truncated column family"
        );
        Ok((truncated_at, removed))
    }

    pub fn stats(&self) -> ColumnFamilyStats {
        let active = Arc::clone(&self.active.read());
        ColumnFamilyStats {
            keyspace: self.keyspace.clone(),
            name: self.name.clone(),
            cf_id: self.cf_id,
            memtable_rows: active.len(),
            memtable_bytes: active.approx_size(),
            frozen_memtables: self.frozen.read().len(),
            tables: self.tables.read().len(),
            recovery_floor: self.recovery_floor(),
        }
    }
}

/// Removes leftover `.sst.tmp` files from interrupted flushes.
fn cleanup_tmp_files(dir: &Path) {
    if let Ok(entries) = fs::read_dir(dir) {
        for entry in entries.flatten() {
            let p = entry.path();
            if let Some(name) = p.file_name().and_then(|n| n.to_str()) {
                if name.ends_with(".sst.tmp") {
                    tracing::warn!(path = %p.display(), "removing unfinished table");
                    let _ = fs::remove_file(&p);
                }
            }
        }
    }
}

//! # Engine - Undertow storage engine
//!
//! Ties the [`commitlog`], [`memtable`] and [`sstable`] crates into a
//! column-family store with crash recovery and truncation.
//!
//! ## Architecture
//!
//! ```text
//! Client
//!   |
//!   v
//! ┌──────────────────────────────────────────────────────┐
//! │                      DATABASE                        │
//! │                                                      │
//! │ keyspace.rs → commit log append → memtable apply     │
//! │                   |                                  │
//! │                   |  (memtable over threshold?)      │
//! │                   v                                  │
//! │ store.rs     flush() → table + flush metadata        │
//! │                   |                                  │
//! │                   v                                  │
//! │              discard_completed() → retire segments   │
//! │                                                      │
//! │ truncate.rs  drain → forced flush → truncation       │
//! │              record → delete tables → retire         │
//! │                                                      │
//! │ recovery.rs  floors → replay → flush → retire        │
//! └──────────────────────────────────────────────────────┘
//! ```
//!
//! ## Module Responsibilities
//!
//! | Module         | Purpose                                                  |
//! |----------------|----------------------------------------------------------|
//! | `lib.rs`       | `Database` struct, open/close, reads, accessors, `Drop`  |
//! | `keyspace`     | write path: validation, ordered guards, auto-flush       |
//! | `store`        | `ColumnFamilyStore`: memtables, tables, flush, truncate  |
//! | `truncate`     | `TruncateHandle` / `TruncateOutcome`, truncate thread    |
//! | `recovery`     | startup replay (`RecoveryReport`)                        |
//! | [`metadata`]   | durable flush and truncation markers                     |
//! | `schema`       | keyspaces and column family ids                          |
//!
//! ## Recovery Floors
//!
//! A column family's recovery floor is the highest of its persisted flush
//! metadata, its truncation record and the coverage of its tables on disk.
//! Replay skips every entry at or below it, and a commit log segment is
//! retired only once every CF it touched has a floor covering it.
//!
//! ## Crash Safety
//!
//! Every write is appended to the commit log **before** the memtable update.
//! Tables are written atomically via temp file + rename; metadata the same
//! way. A truncate makes its truncation record durable before it deletes
//! anything, so a crash at any step never brings truncated data back.

mod error;
mod keyspace;
pub mod metadata;
mod recovery;
mod schema;
mod store;
mod truncate;

use anyhow::{Context, Result};
use commitlog::{CommitLog, CommitLogOptions};
use config::Config;
use model::{CfId, FlushMetadata, Mutation, ReplayPosition, Row};
use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

pub use error::EngineError;
pub use metadata::{FileMetadataStore, MetadataStore};
pub use recovery::RecoveryReport;
pub use schema::{ColumnFamilyDef, Schema};
pub use store::{ColumnFamilyStats, ColumnFamilyStore};
pub use truncate::{TruncateHandle, TruncateOutcome};

use recovery::RecoveryManager;

/// State shared between the database handle and truncate threads.
pub(crate) struct Inner {
    pub(crate) config: Config,
    pub(crate) schema: Schema,
    pub(crate) commit_log: Arc<CommitLog>,
    pub(crate) metadata: Arc<dyn MetadataStore>,
    pub(crate) stores: BTreeMap<CfId, Arc<ColumnFamilyStore>>,
    pub(crate) closed: AtomicBool,
}

impl Inner {
    pub(crate) fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(EngineError::Closed.into());
        }
        Ok(())
    }

    pub(crate) fn store(&self, keyspace: &str, name: &str) -> Result<&Arc<ColumnFamilyStore>> {
        let cf_id = self.schema.cf_id(keyspace, name)?;
        self.stores
            .get(&cf_id)
            .ok_or_else(|| {
                EngineError::UnknownColumnFamily {
                    keyspace: keyspace.to_string(),
                    name: name.to_string(),
                }
                .into()
            })
    }

    /// Recovery floor of every known column family.
    pub(crate) fn floors(&self) -> HashMap<CfId, ReplayPosition> {
        self.stores
            .iter()
            .map(|(cf_id, store)| (*cf_id, store.recovery_floor()))
            .collect()
    }

    /// Retires every commit log segment the current floors cover.
    pub(crate) fn discard_completed(&self) -> Result<usize> {
        let floors = self.floors();
        let retired = self.commit_log.discard_completed(&floors)?;
        if retired > 0 {
            tracing::debug!(retired, remaining = self.commit_log.segment_count(), "discarded segments");
        }
        Ok(retired)
    }

    /// Flushes one store, then retires covered segments.
    pub(crate) fn flush_store(&self, store: &ColumnFamilyStore) -> Result<Option<FlushMetadata>> {
        let meta = store.flush()?;
        if meta.is_some() {
            self.discard_completed()?;
        }
        Ok(meta)
    }
}

/// The storage engine: a commit log shared by one store per column family.
///
/// # Write Path
///
/// 1. Validate the mutation against the schema and the size limits.
/// 2. Take each target CF's admission and memtable guards, in CF-id order.
/// 3. Append the mutation to the commit log.
/// 4. Apply each CF update to that CF's active memtable.
/// 5. Flush any CF whose memtable reached `flush_threshold`.
///
/// # Read Path
///
/// Active memtable, frozen memtables and tables of the CF are reconciled
/// cell by cell; the highest timestamp wins.
///
/// # Recovery
///
/// [`Database::open`] replays the commit log before returning, so no write is
/// accepted before recovery completes.
///
/// # Shutdown
///
/// [`close`](Database::close) flushes every CF and seals the commit log.
/// Dropping without `close` only syncs the log; the next open replays it.
pub struct Database {
    inner: Arc<Inner>,
    recovery: RecoveryReport,
}

impl std::fmt::Debug for Database {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Database")
            .field("data_dir", &self.inner.config.data_dir)
            .field("column_families", &self.inner.stores.len())
            .field("commit_log", &self.inner.commit_log)
            .field("closed", &self.inner.closed.load(Ordering::Relaxed))
            .finish()
    }
}

impl Database {
    /// Opens the database with the default schema.
    pub fn open(config: Config) -> Result<Self> {
        Self::open_with_schema(config, Schema::default_schema())
    }

    /// Opens the database with `schema` and the file metadata store under
    /// `<data_dir>/system`.
    pub fn open_with_schema(config: Config, schema: Schema) -> Result<Self> {
        let metadata = FileMetadataStore::load_or_create(&config.system_dir())?;
        Self::open_with_metadata(config, schema, Arc::new(metadata))
    }

    /// Opens the database on an explicit metadata store.
    ///
    /// # Startup Steps
    ///
    /// 1. Open the commit log, starting a segment above every segment on disk
    ///    and every position the metadata store knows.
    /// 2. Open one store per column family (deleting tables an interrupted
    ///    truncate left behind).
    /// 3. Run recovery.
    pub fn open_with_metadata(
        config: Config,
        schema: Schema,
        metadata: Arc<dyn MetadataStore>,
    ) -> Result<Self> {
        fs::create_dir_all(&config.data_dir)
            .with_context(|| format!("failed to create {}", config.data_dir.display()))?;

        let options = CommitLogOptions {
            segment_size: config.segment_size,
            segment_max_age: config.segment_max_age,
            sync: config.sync_writes,
        };
        let commit_log = Arc::new(
            CommitLog::open(config.commitlog_dir(), options, metadata.max_segment_id())
                .context("failed to open commit log")?,
        );

        let mut stores = BTreeMap::new();
        for def in schema.column_families() {
            let dir = config.tables_dir().join(&def.keyspace).join(&def.name);
            let store = ColumnFamilyStore::open(
                &def.keyspace,
                &def.name,
                def.id,
                &dir,
                Arc::clone(&commit_log),
                Arc::clone(&metadata),
                config.flush_threshold,
            )
            .with_context(|| format!("failed to open {}.{}", def.keyspace, def.name))?;
            stores.insert(def.id, Arc::new(store));
        }

        let inner = Arc::new(Inner {
            config,
            schema,
            commit_log,
            metadata,
            stores,
            closed: AtomicBool::new(false),
        });

        let recovery = RecoveryManager::new(&inner).run().context("recovery failed")?;

        tracing::info!(
            data_dir = %inner.config.data_dir.display(),
            column_families = inner.stores.len(),
            segments = inner.commit_log.segment_count(),
            "database open"
        );

        Ok(Self { inner, recovery })
    }

    /// Applies `mutation` durably. Returns its commit log position.
    pub fn apply(&self, mutation: &Mutation) -> Result<ReplayPosition> {
        self.inner.apply(mutation)
    }

    /// Writes `keyspace.cf[key][column] = value` at `timestamp`.
    pub fn set(
        &self,
        keyspace: &str,
        cf: &str,
        key: &[u8],
        column: &[u8],
        value: &[u8],
        timestamp: u64,
    ) -> Result<ReplayPosition> {
        let cf_id = self.inner.schema.cf_id(keyspace, cf)?;
        let mut m = Mutation::new(keyspace, key);
        m.add(cf_id, column, value, timestamp);
        self.apply(&m)
    }

    /// Writes a tombstone for `keyspace.cf[key][column]` at `timestamp`.
    pub fn delete(
        &self,
        keyspace: &str,
        cf: &str,
        key: &[u8],
        column: &[u8],
        timestamp: u64,
    ) -> Result<ReplayPosition> {
        let cf_id = self.inner.schema.cf_id(keyspace, cf)?;
        let mut m = Mutation::new(keyspace, key);
        m.delete(cf_id, column, timestamp);
        self.apply(&m)
    }

    /// Live value of one column, or `None` if absent or deleted.
    pub fn get(&self, keyspace: &str, cf: &str, key: &[u8], column: &[u8]) -> Result<Option<Vec<u8>>> {
        Ok(self
            .get_row(keyspace, cf, key)?
            .and_then(|row| row.value(column).map(<[u8]>::to_vec)))
    }

    /// Reconciled row, tombstones included.
    pub fn get_row(&self, keyspace: &str, cf: &str, key: &[u8]) -> Result<Option<Row>> {
        self.inner.store(keyspace, cf)?.get_row(key)
    }

    /// Blocking flush of one column family. Returns `None` if its memtable
    /// was empty.
    pub fn flush(&self, keyspace: &str, cf: &str) -> Result<Option<FlushMetadata>> {
        self.inner.ensure_open()?;
        let store = self.inner.store(keyspace, cf)?;
        self.inner.flush_store(store)
    }

    /// Flushes every column family.
    pub fn flush_all(&self) -> Result<()> {
        self.inner.ensure_open()?;
        for store in self.inner.stores.values() {
            store.flush()?;
        }
        self.inner.discard_completed()?;
        Ok(())
    }

    /// Starts truncating `keyspace.cf`. See [`TruncateHandle`].
    pub fn truncate(&self, keyspace: &str, cf: &str) -> Result<TruncateHandle> {
        self.inner.spawn_truncate(keyspace, cf)
    }

    /// Retires commit log segments covered by every CF's recovery floor.
    pub fn discard_completed(&self) -> Result<usize> {
        self.inner.discard_completed()
    }

    /// Runs another recovery pass. With no writes since the last pass this
    /// replays nothing.
    pub fn recover(&self) -> Result<RecoveryReport> {
        self.inner.ensure_open()?;
        RecoveryManager::new(&self.inner).run()
    }

    /// Report of the recovery pass run by [`open`](Database::open).
    pub fn recovery_report(&self) -> &RecoveryReport {
        &self.recovery
    }

    /// Current recovery floor of `keyspace.cf`.
    pub fn recovery_floor(&self, keyspace: &str, cf: &str) -> Result<ReplayPosition> {
        Ok(self.inner.store(keyspace, cf)?.recovery_floor())
    }

    pub fn column_family(&self, keyspace: &str, cf: &str) -> Result<Arc<ColumnFamilyStore>> {
        self.inner.store(keyspace, cf).map(Arc::clone)
    }

    pub fn stats(&self) -> Vec<ColumnFamilyStats> {
        self.inner.stores.values().map(|s| s.stats()).collect()
    }

    pub fn commit_log(&self) -> &CommitLog {
        &self.inner.commit_log
    }

    pub fn metadata(&self) -> &dyn MetadataStore {
        self.inner.metadata.as_ref()
    }

    pub fn schema(&self) -> &Schema {
        &self.inner.schema
    }

    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    /// Flushes every column family, retires covered segments and seals the
    /// commit log. Further writes fail with [`EngineError::Closed`].
    pub fn close(&self) -> Result<()> {
        self.flush_all()?;
        self.inner.closed.store(true, Ordering::Release);
        self.inner.commit_log.close()?;
        tracing::info!(data_dir = %self.inner.config.data_dir.display(), "database closed");
        Ok(())
    }
}

/// Syncs the commit log on drop.
///
/// Nothing is flushed: whatever is still in memtables is in the log and is
/// replayed on the next open.
impl Drop for Database {
    fn drop(&mut self) {
        if !self.inner.closed.load(Ordering::Acquire) {
            let _ = self.inner.commit_log.sync();
        }
    }
}

#[cfg(test)]
mod tests;

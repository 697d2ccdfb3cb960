use crate::metadata::{FileMetadataStore, MetadataStore};
use crate::{Database, Schema};
use anyhow::Result;
use config::Config;
use model::{CfId, FlushMetadata, TruncationRecord};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

pub const KS: &str = "Keyspace1";
pub const CF1: &str = "Standard1";
pub const CF2: &str = "Standard2";

/// Unsynced log, large flush threshold: nothing flushes unless asked.
pub fn config(dir: &Path) -> Config {
    Config::new(dir)
        .with_sync_writes(false)
        .with_flush_threshold(1024 * 1024)
}

pub fn open(dir: &Path) -> Result<Database> {
    Database::open(config(dir))
}

pub fn cf_dir(dir: &Path, cf: &str) -> PathBuf {
    config(dir).tables_dir().join(KS).join(cf)
}

pub fn count_sst_files(dir: &Path) -> usize {
    fs::read_dir(dir)
        .unwrap()
        .filter_map(|e| e.ok())
        .filter(|e| {
            e.path()
                .extension()
                .and_then(|s| s.to_str())
                .map(|ext| ext == "sst")
                .unwrap_or(false)
        })
        .count()
}

pub fn sst_paths(dir: &Path) -> Vec<PathBuf> {
    let mut paths: Vec<PathBuf> = fs::read_dir(dir)
        .unwrap()
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| p.extension().and_then(|s| s.to_str()) == Some("sst"))
        .collect();
    paths.sort();
    paths
}

pub fn count_segments(dir: &Path) -> usize {
    fs::read_dir(config(dir).commitlog_dir())
        .unwrap()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_name().to_string_lossy().starts_with("CommitLog-"))
        .count()
}

/// Metadata store whose persists can be made to fail on demand.
pub struct FaultyMetadataStore {
    inner: FileMetadataStore,
    pub fail_flush: AtomicBool,
    pub fail_truncation: AtomicBool,
    pub panic_truncation: AtomicBool,
}

impl FaultyMetadataStore {
    pub fn new(dir: &Path) -> Result<Arc<Self>> {
        Ok(Arc::new(Self {
            inner: FileMetadataStore::load_or_create(&config(dir).system_dir())?,
            fail_flush: AtomicBool::new(false),
            fail_truncation: AtomicBool::new(false),
            panic_truncation: AtomicBool::new(false),
        }))
    }
}

impl MetadataStore for FaultyMetadataStore {
    fn flush_metadata(&self, cf_id: CfId) -> Option<FlushMetadata> {
        self.inner.flush_metadata(cf_id)
    }

    fn truncation_record(&self, cf_id: CfId) -> Option<TruncationRecord> {
        self.inner.truncation_record(cf_id)
    }

    fn persist_flush(&self, meta: FlushMetadata) -> Result<()> {
        if self.fail_flush.load(Ordering::SeqCst) {
            anyhow::bail!("injected flush metadata failure");
        }
        self.inner.persist_flush(meta)
    }

    fn persist_truncation(&self, record: TruncationRecord) -> Result<()> {
        if self.panic_truncation.load(Ordering::SeqCst) {
            panic!("injected truncation panic");
        }
        if self.fail_truncation.load(Ordering::SeqCst) {
            anyhow::bail!("injected truncation record failure");
        }
        self.inner.persist_truncation(record)
    }

    fn max_segment_id(&self) -> u64 {
        self.inner.max_segment_id()
    }
}

pub fn open_faulty(dir: &Path) -> Result<(Database, Arc<FaultyMetadataStore>)> {
    let store = FaultyMetadataStore::new(dir)?;
    let db = Database::open_with_metadata(
        config(dir),
        Schema::default_schema(),
        Arc::clone(&store) as Arc<dyn MetadataStore>,
    )?;
    Ok((db, store))
}

use crate::metadata::{persisted_floor, METADATA_FILENAME};
use crate::*;
use anyhow::Result;
use model::{FlushMetadata, ReplayPosition, TruncationRecord};
use std::fs;
use tempfile::tempdir;

fn flush(cf_id: u32, seg: u64, off: u64) -> FlushMetadata {
    FlushMetadata {
        cf_id,
        replay_position: ReplayPosition::new(seg, off),
    }
}

fn truncation(cf_id: u32, seg: u64, off: u64) -> TruncationRecord {
    TruncationRecord {
        cf_id,
        truncated_at: ReplayPosition::new(seg, off),
    }
}

#[test]
fn create_empty_store() -> Result<()> {
    let dir = tempdir()?;
    let m = FileMetadataStore::load_or_create(dir.path())?;
    assert!(m.flush_metadata(1).is_none());
    assert!(m.truncation_record(1).is_none());
    assert_eq!(m.max_segment_id(), 0);
    assert_eq!(persisted_floor(&m, 1), ReplayPosition::NONE);
    Ok(())
}

#[test]
fn persist_and_reload() -> Result<()> {
    let dir = tempdir()?;
    {
        let m = FileMetadataStore::load_or_create(dir.path())?;
        m.persist_flush(flush(1, 3, 100))?;
        m.persist_flush(flush(2, 4, 20))?;
        m.persist_truncation(truncation(1, 5, 14))?;
    }

    let m = FileMetadataStore::load_or_create(dir.path())?;
    assert_eq!(m.flush_metadata(1), Some(flush(1, 3, 100)));
    assert_eq!(m.flush_metadata(2), Some(flush(2, 4, 20)));
    assert_eq!(m.truncation_record(1), Some(truncation(1, 5, 14)));
    assert!(m.truncation_record(2).is_none());
    assert_eq!(m.max_segment_id(), 5);
    assert_eq!(persisted_floor(&m, 1), ReplayPosition::new(5, 14));
    assert_eq!(persisted_floor(&m, 2), ReplayPosition::new(4, 20));
    Ok(())
}

#[test]
fn persists_never_move_backwards() -> Result<()> {
    let dir = tempdir()?;
    let m = FileMetadataStore::load_or_create(dir.path())?;
    m.persist_flush(flush(1, 3, 100))?;
    m.persist_flush(flush(1, 2, 900))?;
    m.persist_truncation(truncation(1, 3, 50))?;
    m.persist_truncation(truncation(1, 3, 40))?;

    assert_eq!(m.flush_metadata(1), Some(flush(1, 3, 100)));
    assert_eq!(m.truncation_record(1), Some(truncation(1, 3, 50)));

    let reloaded = FileMetadataStore::load_or_create(dir.path())?;
    assert_eq!(reloaded.flush_metadata(1), Some(flush(1, 3, 100)));
    Ok(())
}

#[test]
fn comments_and_blank_lines_ignored() -> Result<()> {
    let dir = tempdir()?;
    fs::write(
        dir.path().join(METADATA_FILENAME),
        "# comment\n\nflush 1 2:30\n\n# another comment\ntruncated 1 2:40\n",
    )?;
    let m = FileMetadataStore::load_or_create(dir.path())?;
    assert_eq!(m.flush_metadata(1), Some(flush(1, 2, 30)));
    assert_eq!(m.truncation_record(1), Some(truncation(1, 2, 40)));
    Ok(())
}

#[test]
fn duplicate_lines_keep_the_highest() -> Result<()> {
    let dir = tempdir()?;
    fs::write(
        dir.path().join(METADATA_FILENAME),
        "flush 1 2:30\nflush 1 7:14\nflush 1 3:10\n",
    )?;
    let m = FileMetadataStore::load_or_create(dir.path())?;
    assert_eq!(m.flush_metadata(1), Some(flush(1, 7, 14)));
    Ok(())
}

#[test]
fn leftover_tmp_file_is_ignored() -> Result<()> {
    let dir = tempdir()?;
    fs::write(dir.path().join(METADATA_FILENAME), "flush 1 2:30\n")?;
    fs::write(dir.path().join("METADATA.tmp"), "flush 1 9:99\n")?;

    let m = FileMetadataStore::load_or_create(dir.path())?;
    assert_eq!(m.flush_metadata(1), Some(flush(1, 2, 30)));
    assert!(!dir.path().join("METADATA.tmp").exists());
    Ok(())
}

#[test]
fn invalid_format_returns_error() {
    let dir = tempdir().unwrap();
    let path = dir.path().join(METADATA_FILENAME);

    for bad in [
        "flush 1\n",
        "flush 1 2:3 extra\n",
        "flush x 2:3\n",
        "flush 1 23\n",
        "compacted 1 2:3\n",
    ] {
        fs::write(&path, bad).unwrap();
        assert!(
            FileMetadataStore::load_or_create(dir.path()).is_err(),
            "accepted {:?}",
            bad
        );
    }
}

use super::helpers::*;
use crate::metadata::{FileMetadataStore, MetadataStore, METADATA_FILENAME};
use crate::*;
use anyhow::Result;
use model::{ReplayPosition, TruncationRecord};
use std::fs;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tempfile::tempdir;

// --------------------- Truncate then restart ---------------------

#[test]
fn truncated_memtable_data_stays_gone_after_restart() -> Result<()> {
    let dir = tempdir()?;
    {
        let db = open(dir.path())?;
        db.set(KS, CF1, b"keymulti", b"col1", b"val1", 1)?;
        let outcome = db.truncate(KS, CF1)?.wait()?;
        assert_eq!(outcome.cf_id, 1);
        assert_eq!(db.get(KS, CF1, b"keymulti", b"col1")?, None);
        // dropped without close
    }

    let db = open(dir.path())?;
    assert_eq!(db.get(KS, CF1, b"keymulti", b"col1")?, None);
    assert_eq!(db.recovery_report().updates_replayed, 0);
    Ok(())
}

#[test]
fn truncated_flushed_data_stays_gone_after_restart() -> Result<()> {
    let dir = tempdir()?;
    {
        let db = open(dir.path())?;
        db.set(KS, CF1, b"keymulti", b"col1", b"val1", 1)?;
        db.flush(KS, CF1)?;
        assert_eq!(count_sst_files(&cf_dir(dir.path(), CF1)), 1);

        let outcome = db.truncate(KS, CF1)?.wait()?;
        assert_eq!(outcome.tables_removed, 1);
        assert_eq!(count_sst_files(&cf_dir(dir.path(), CF1)), 0);
        assert_eq!(db.get(KS, CF1, b"keymulti", b"col1")?, None);
    }

    let db = open(dir.path())?;
    assert_eq!(db.get(KS, CF1, b"keymulti", b"col1")?, None);
    Ok(())
}

#[test]
fn writes_after_truncate_survive_restart() -> Result<()> {
    let dir = tempdir()?;
    let truncated_at;
    {
        let db = open(dir.path())?;
        db.set(KS, CF1, b"old", b"c", b"v", 1)?;
        truncated_at = db.truncate(KS, CF1)?.wait()?.truncated_at;

        let pos = db.set(KS, CF1, b"new", b"c", b"v", 2)?;
        assert!(pos > truncated_at);
    }

    let db = open(dir.path())?;
    assert_eq!(db.get(KS, CF1, b"old", b"c")?, None);
    assert_eq!(db.get(KS, CF1, b"new", b"c")?, Some(b"v".to_vec()));
    assert!(db.recovery_floor(KS, CF1)? >= truncated_at);
    Ok(())
}

#[test]
fn truncate_leaves_other_column_families_alone() -> Result<()> {
    let dir = tempdir()?;
    {
        let db = open(dir.path())?;
        let mut m = model::Mutation::new(KS, b"k".to_vec());
        m.add(1, b"c".to_vec(), b"one".to_vec(), 1)
            .add(2, b"c".to_vec(), b"two".to_vec(), 1);
        db.apply(&m)?;

        db.truncate(KS, CF1)?.wait()?;
        assert_eq!(db.get(KS, CF1, b"k", b"c")?, None);
        assert_eq!(db.get(KS, CF2, b"k", b"c")?, Some(b"two".to_vec()));
    }

    let db = open(dir.path())?;
    assert_eq!(db.get(KS, CF1, b"k", b"c")?, None);
    assert_eq!(db.get(KS, CF2, b"k", b"c")?, Some(b"two".to_vec()));
    Ok(())
}

#[test]
fn truncate_persists_record_at_log_tail() -> Result<()> {
    let dir = tempdir()?;
    let db = open(dir.path())?;

    db.set(KS, CF1, b"k", b"c", b"v", 1)?;
    let tail = db.commit_log().current_position();
    let outcome = db.truncate(KS, CF1)?.wait()?;

    assert_eq!(outcome.truncated_at, tail);
    assert_eq!(
        db.metadata().truncation_record(1),
        Some(TruncationRecord {
            cf_id: 1,
            truncated_at: tail
        })
    );
    assert_eq!(db.metadata().flush_metadata(1).map(|m| m.replay_position), Some(tail));
    Ok(())
}

#[test]
fn truncate_retires_covered_segments() -> Result<()> {
    let dir = tempdir()?;
    let db = Database::open(config(dir.path()).with_segment_size(512))?;

    for i in 0..40u64 {
        db.set(KS, CF1, format!("k{}", i).as_bytes(), b"c", &[b'v'; 24], i + 1)?;
    }
    assert!(db.commit_log().segment_count() > 1);

    db.truncate(KS, CF1)?.wait()?;
    assert_eq!(db.commit_log().segment_count(), 1);
    Ok(())
}

#[test]
fn truncate_unknown_column_family_fails() -> Result<()> {
    let dir = tempdir()?;
    let db = open(dir.path())?;

    let err = db.truncate(KS, "Nope").unwrap_err();
    assert!(matches!(
        err.downcast_ref::<EngineError>(),
        Some(EngineError::UnknownColumnFamily { .. })
    ));
    Ok(())
}

// --------------------- Non-resurrection ---------------------

#[test]
fn restored_tables_are_not_resurrected() -> Result<()> {
    let dir = tempdir()?;
    let aside = tempdir()?;
    let table_dir = cf_dir(dir.path(), CF1);
    {
        let db = open(dir.path())?;
        db.set(KS, CF1, b"keymulti", b"col1", b"val1", 1)?;
        db.flush(KS, CF1)?;
        db.set(KS, CF1, b"keymulti", b"col1", b"val2", 2)?;
        for path in sst_paths(&table_dir) {
            fs::copy(&path, aside.path().join(path.file_name().unwrap()))?;
        }
        db.truncate(KS, CF1)?.wait()?;
    }

    // put the deleted tables back and forget the flush metadata, as if the
    // deletes and the flush persist had never reached disk
    for path in sst_paths(aside.path()) {
        fs::copy(&path, table_dir.join(path.file_name().unwrap()))?;
    }
    let metadata_path = config(dir.path()).system_dir().join(METADATA_FILENAME);
    let kept: Vec<String> = fs::read_to_string(&metadata_path)?
        .lines()
        .filter(|l| !l.starts_with("flush "))
        .map(str::to_string)
        .collect();
    fs::write(&metadata_path, kept.join("\n") + "\n")?;

    let db = open(dir.path())?;
    assert_eq!(db.get(KS, CF1, b"keymulti", b"col1")?, None);
    assert_eq!(db.recovery_report().updates_replayed, 0);
    assert_eq!(count_sst_files(&table_dir), 0);
    Ok(())
}

#[test]
fn open_deletes_tables_at_or_below_truncation_record() -> Result<()> {
    let dir = tempdir()?;
    let flushed_at;
    {
        let db = open(dir.path())?;
        db.set(KS, CF1, b"k", b"c", b"v", 1)?;
        flushed_at = db.flush(KS, CF1)?.expect("flush metadata").replay_position;
        db.close()?;
    }
    assert_eq!(count_sst_files(&cf_dir(dir.path(), CF1)), 1);

    // a truncate that crashed right after persisting its record
    let store = FileMetadataStore::load_or_create(&config(dir.path()).system_dir())?;
    store.persist_truncation(TruncationRecord {
        cf_id: 1,
        truncated_at: flushed_at,
    })?;
    drop(store);

    let db = open(dir.path())?;
    assert_eq!(count_sst_files(&cf_dir(dir.path(), CF1)), 0);
    assert_eq!(db.get(KS, CF1, b"k", b"c")?, None);
    Ok(())
}

#[test]
fn open_keeps_tables_above_truncation_record() -> Result<()> {
    let dir = tempdir()?;
    {
        let db = open(dir.path())?;
        db.set(KS, CF1, b"k", b"c", b"v", 1)?;
        db.flush(KS, CF1)?;
        db.close()?;
    }

    let store = FileMetadataStore::load_or_create(&config(dir.path()).system_dir())?;
    store.persist_truncation(TruncationRecord {
        cf_id: 1,
        truncated_at: ReplayPosition::new(1, 14),
    })?;
    drop(store);

    let db = open(dir.path())?;
    assert_eq!(count_sst_files(&cf_dir(dir.path(), CF1)), 1);
    assert_eq!(db.get(KS, CF1, b"k", b"c")?, Some(b"v".to_vec()));
    Ok(())
}

// --------------------- Failures ---------------------

#[test]
fn failed_truncation_record_deletes_nothing() -> Result<()> {
    let dir = tempdir()?;
    let (db, store) = open_faulty(dir.path())?;

    db.set(KS, CF1, b"k", b"c", b"v", 1)?;
    db.flush(KS, CF1)?;

    store.fail_truncation.store(true, Ordering::SeqCst);
    let err = db.truncate(KS, CF1)?.wait().unwrap_err();
    assert!(matches!(
        err.downcast_ref::<EngineError>(),
        Some(EngineError::MetadataPersist { cf_id: 1, .. })
    ));
    assert!(db.metadata().truncation_record(1).is_none());
    assert_eq!(count_sst_files(&cf_dir(dir.path(), CF1)), 1);
    assert_eq!(db.get(KS, CF1, b"k", b"c")?, Some(b"v".to_vec()));

    // writes are admitted again
    db.set(KS, CF1, b"k2", b"c", b"v2", 1)?;

    store.fail_truncation.store(false, Ordering::SeqCst);
    db.truncate(KS, CF1)?.wait()?;
    assert_eq!(db.get(KS, CF1, b"k", b"c")?, None);
    assert_eq!(db.get(KS, CF1, b"k2", b"c")?, None);
    Ok(())
}

#[test]
fn failed_flush_metadata_aborts_truncate() -> Result<()> {
    let dir = tempdir()?;
    let (db, store) = open_faulty(dir.path())?;

    db.set(KS, CF1, b"k", b"c", b"v", 1)?;
    store.fail_flush.store(true, Ordering::SeqCst);
    let err = db.truncate(KS, CF1)?.wait().unwrap_err();
    assert!(matches!(
        err.downcast_ref::<EngineError>(),
        Some(EngineError::MetadataPersist { .. })
    ));
    assert!(db.metadata().truncation_record(1).is_none());
    assert_eq!(db.get(KS, CF1, b"k", b"c")?, Some(b"v".to_vec()));
    Ok(())
}

#[test]
fn panicking_truncate_reports_aborted() -> Result<()> {
    let dir = tempdir()?;
    let (db, store) = open_faulty(dir.path())?;

    db.set(KS, CF1, b"k", b"c", b"v", 1)?;
    store.panic_truncation.store(true, Ordering::SeqCst);
    let err = db.truncate(KS, CF1)?.wait().unwrap_err();
    match err.downcast_ref::<EngineError>() {
        Some(EngineError::TruncateAborted { keyspace, name, reason }) => {
            assert_eq!(keyspace, KS);
            assert_eq!(name, CF1);
            assert!(reason.contains("injected"));
        }
        other => panic!("expected TruncateAborted, got {:?}", other),
    }

    // the store is still usable
    store.panic_truncation.store(false, Ordering::SeqCst);
    db.set(KS, CF1, b"k2", b"c", b"v", 1)?;
    db.truncate(KS, CF1)?.wait()?;
    assert_eq!(db.get(KS, CF1, b"k2", b"c")?, None);
    Ok(())
}

// --------------------- Concurrency ---------------------

#[test]
fn concurrent_writes_land_on_one_side_of_truncate() -> Result<()> {
    let dir = tempdir()?;
    let db = Arc::new(Database::open(
        config(dir.path()).with_flush_threshold(2 * 1024),
    )?);

    let writers: Vec<_> = (0..3)
        .map(|t| {
            let db = Arc::clone(&db);
            std::thread::spawn(move || -> Result<Vec<(String, ReplayPosition)>> {
                let mut written = Vec::new();
                for i in 0..300u64 {
                    let key = format!("w{}-{}", t, i);
                    let pos = db.set(KS, CF1, key.as_bytes(), b"c", b"v", 1)?;
                    written.push((key, pos));
                }
                Ok(written)
            })
        })
        .collect();

    std::thread::sleep(std::time::Duration::from_millis(5));
    let outcome = db.truncate(KS, CF1)?.wait()?;

    let mut written = Vec::new();
    for w in writers {
        written.extend(w.join().unwrap()?);
    }

    let check = |db: &Database| -> Result<()> {
        for (key, pos) in &written {
            let value = db.get(KS, CF1, key.as_bytes(), b"c")?;
            if *pos <= outcome.truncated_at {
                assert_eq!(value, None, "{} at {} survived truncate", key, pos);
            } else {
                assert_eq!(value, Some(b"v".to_vec()), "{} at {} lost", key, pos);
            }
        }
        Ok(())
    };

    check(&db)?;
    drop(Arc::try_unwrap(db).map_err(|_| anyhow::anyhow!("database still shared"))?);
    let db = open(dir.path())?;
    check(&db)?;
    Ok(())
}

#[test]
fn recovery_pass_racing_truncate_resurrects_nothing() -> Result<()> {
    for round in 0..10 {
        let dir = tempdir()?;
        let db = Arc::new(open(dir.path())?);
        for i in 0..2_000u64 {
            db.set(KS, CF1, format!("k{}", i).as_bytes(), b"c", b"v", 1)?;
        }

        let recovering = {
            let db = Arc::clone(&db);
            std::thread::spawn(move || db.recover())
        };
        db.truncate(KS, CF1)?.wait()?;
        let visible = (0..2_000u64)
            .filter(|i| {
                matches!(db.get(KS, CF1, format!("k{}", i).as_bytes(), b"c"), Ok(Some(_)))
            })
            .count();
        recovering.join().unwrap()?;

        assert_eq!(visible, 0, "round {}: keys visible after truncate completed", round);
        let visible_later = (0..2_000u64)
            .filter(|i| {
                matches!(db.get(KS, CF1, format!("k{}", i).as_bytes(), b"c"), Ok(Some(_)))
            })
            .count();
        assert_eq!(visible_later, 0, "round {}: recovery brought keys back", round);
    }
    Ok(())
}

#[test]
fn dropped_handle_still_completes() -> Result<()> {
    let dir = tempdir()?;
    let db = open(dir.path())?;

    db.set(KS, CF1, b"k", b"c", b"v", 1)?;
    let handle = db.truncate(KS, CF1)?;
    while !handle.is_finished() {
        std::thread::yield_now();
    }
    drop(handle);

    assert!(db.metadata().truncation_record(1).is_some());
    assert_eq!(db.get(KS, CF1, b"k", b"c")?, None);
    Ok(())
}

use super::make_sample_memtable;
use crate::*;
use anyhow::Result;
use memtable::Memtable;
use model::ReplayPosition;
use tempfile::tempdir;

#[test]
fn write_empty_memtable_is_rejected() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("empty.sst");
    let mem = Memtable::new(1, ReplayPosition::NONE);
    let result = SSTableWriter::write_from_memtable(&path, &mem, ReplayPosition::new(1, 100));
    assert!(result.is_err(), "writing an empty memtable should fail");
    assert!(
        result.unwrap_err().to_string().contains("empty"),
        "error message should mention 'empty'"
    );
    assert!(!path.exists());
    assert!(!path.with_extension("sst.tmp").exists(), "tmp file must be cleaned up");
}

#[test]
fn write_and_inspect_footer() -> Result<()> {
    let dir = tempdir()?;
    let path = dir.path().join("test.sst");

    let mem = make_sample_memtable();
    SSTableWriter::write_from_memtable(&path, &mem, ReplayPosition::new(3, 512))?;

    let mut f = std::fs::File::open(&path)?;
    let filesize = f.metadata()?.len();
    assert!(filesize > FOOTER_BYTES);

    let footer = Footer::read_from(&mut f)?;
    assert_eq!(footer.cf_id, 1);
    assert_eq!(footer.flush_position, ReplayPosition::new(3, 512));
    assert!(footer.index_offset < filesize - FOOTER_BYTES);
    Ok(())
}

#[test]
fn no_tmp_file_left_after_write() -> Result<()> {
    let dir = tempdir()?;
    let path = dir.path().join("clean.sst");
    SSTableWriter::write_from_memtable(&path, &make_sample_memtable(), ReplayPosition::new(1, 20))?;

    let names: Vec<_> = std::fs::read_dir(dir.path())?
        .filter_map(|e| e.ok())
        .map(|e| e.file_name().to_string_lossy().into_owned())
        .collect();
    assert_eq!(names, vec!["clean.sst".to_string()]);
    Ok(())
}

#[test]
fn write_rows_uses_given_cf() -> Result<()> {
    let dir = tempdir()?;
    let path = dir.path().join("rows.sst");
    let rows = vec![(b"k".to_vec(), super::row(&[("c", 9, Some("v"))]))];
    SSTableWriter::write_rows(&path, 42, ReplayPosition::new(2, 30), rows)?;

    let reader = SSTableReader::open(&path)?;
    assert_eq!(reader.cf_id(), 42);
    assert_eq!(
        reader.flush_metadata(),
        model::FlushMetadata {
            cf_id: 42,
            replay_position: ReplayPosition::new(2, 30)
        }
    );
    Ok(())
}

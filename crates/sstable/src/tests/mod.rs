mod writer_tests;

use memtable::Memtable;
use model::{Cell, ReplayPosition, Row};

pub(crate) fn row(cells: &[(&str, u64, Option<&str>)]) -> Row {
    cells
        .iter()
        .map(|(name, ts, val)| {
            let cell = match val {
                Some(v) => Cell::live(*ts, v.as_bytes().to_vec()),
                None => Cell::tombstone(*ts),
            };
            (name.as_bytes().to_vec(), cell)
        })
        .collect()
}

pub(crate) fn make_sample_memtable() -> Memtable {
    let m = Memtable::new(1, ReplayPosition::NONE);
    m.apply(b"a", &row(&[("col", 1, Some("apple"))]));
    m.apply(b"b", &row(&[("col", 2, Some("banana")), ("other", 2, Some("x"))]));
    m.apply(b"c", &row(&[("col", 3, Some(""))]));
    m.apply(b"d", &row(&[("col", 4, None)]));
    m
}

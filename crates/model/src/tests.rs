use super::*;
use proptest::prelude::*;

// -------------------- ReplayPosition --------------------

#[test]
fn positions_order_by_segment_then_offset() {
    let a = ReplayPosition::new(1, 900);
    let b = ReplayPosition::new(2, 10);
    let c = ReplayPosition::new(2, 11);
    assert!(a < b);
    assert!(b < c);
    assert!(ReplayPosition::NONE < a);
    assert_eq!(a.max(b), b);
}

#[test]
fn none_position_is_default() {
    assert!(ReplayPosition::default().is_none());
    assert!(!ReplayPosition::new(1, 0).is_none());
    assert_eq!(ReplayPosition::new(3, 42).to_string(), "3:42");
}

// -------------------- Cell reconciliation --------------------

#[test]
fn newer_timestamp_wins() {
    let old = Cell::live(1, b"a".to_vec());
    let new = Cell::live(2, b"b".to_vec());
    assert!(new.supersedes(&old));
    assert!(!old.supersedes(&new));
}

#[test]
fn tombstone_wins_timestamp_tie() {
    let live = Cell::live(5, b"v".to_vec());
    let dead = Cell::tombstone(5);
    assert!(dead.supersedes(&live));
    assert!(!live.supersedes(&dead));
}

#[test]
fn merge_is_order_independent() {
    let cells = [
        Cell::live(3, b"x".to_vec()),
        Cell::live(3, b"y".to_vec()),
        Cell::tombstone(2),
    ];

    let mut forward = Row::new();
    for c in cells.iter().cloned() {
        forward.merge_cell(b"col".to_vec(), c);
    }
    let mut backward = Row::new();
    for c in cells.iter().rev().cloned() {
        backward.merge_cell(b"col".to_vec(), c);
    }

    assert_eq!(forward, backward);
    assert_eq!(forward.value(b"col"), Some(&b"y"[..]));
}

#[test]
fn reapplying_same_cell_is_a_no_op() {
    let mut row = Row::new();
    assert!(row.merge_cell(b"c".to_vec(), Cell::live(1, b"v".to_vec())));
    assert!(!row.merge_cell(b"c".to_vec(), Cell::live(1, b"v".to_vec())));
    assert_eq!(row.len(), 1);
}

#[test]
fn deleted_column_reads_as_absent() {
    let mut row = Row::new();
    row.merge_cell(b"c".to_vec(), Cell::live(1, b"v".to_vec()));
    row.merge_cell(b"c".to_vec(), Cell::tombstone(2));
    assert!(row.value(b"c").is_none());
    assert!(row.cell(b"c").unwrap().is_tombstone());
    assert!(!row.has_live_cells());
}

// -------------------- Mutation codec --------------------

#[test]
fn mutation_groups_columns_per_cf() {
    let mut m = Mutation::new("Keyspace1", b"keymulti".to_vec());
    m.add(1, "col1", "val1", 1)
        .add(2, "col1", "other", 1)
        .delete(1, "col2", 1);

    assert_eq!(m.cf_ids().collect::<Vec<_>>(), vec![1, 2]);
    assert_eq!(m.updates[0].row.len(), 2);

    let decoded = Mutation::decode(&m.encode().unwrap()).unwrap();
    assert_eq!(decoded, m);
}

#[test]
fn decode_rejects_trailing_bytes() {
    let mut m = Mutation::new("ks", b"k".to_vec());
    m.add(1, "c", "v", 1);
    let mut bytes = m.encode().unwrap();
    bytes.push(0xFF);
    assert!(matches!(
        Mutation::decode(&bytes),
        Err(CodecError::Invalid(_))
    ));
}

#[test]
fn decode_rejects_truncated_input() {
    let mut m = Mutation::new("ks", b"k".to_vec());
    m.add(1, "c", "value", 1);
    let bytes = m.encode().unwrap();
    assert!(Mutation::decode(&bytes[..bytes.len() - 2]).is_err());
}

#[test]
fn encode_rejects_oversized_key() {
    let m = Mutation::new("ks", vec![0u8; MAX_KEY_SIZE + 1]);
    assert!(m.encode().is_err());
}

proptest! {
    #[test]
    fn arbitrary_mutations_survive_encoding(
        key in proptest::collection::vec(any::<u8>(), 0..64),
        cols in proptest::collection::vec(
            (0u32..4, proptest::collection::vec(any::<u8>(), 1..16), any::<u64>(), proptest::option::of(proptest::collection::vec(any::<u8>(), 0..32))),
            0..16,
        ),
    ) {
        let mut m = Mutation::new("ks", key);
        for (cf, name, ts, value) in cols {
            match value {
                Some(v) => { m.add(cf, name, v, ts); }
                None => { m.delete(cf, name, ts); }
            }
        }
        let decoded = Mutation::decode(&m.encode().unwrap()).unwrap();
        prop_assert_eq!(decoded, m);
    }
}

//! Integration tests against the scenarios enumerated in spec.md §8.

use strata_db::alloc::SlabAllocator;
use strata_db::group::OpenOptions;
use strata_db::node::Node;
use strata_db::shared::SharedGroup;
use strata_db::{Error, Group};
use strata_pages::Flags;

/// A. Empty round-trip.
#[test]
fn scenario_a_empty_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("a.db");

    let ro_options = OpenOptions { read_only: true, ..OpenOptions::default() };
    assert!(Group::open_file(&path, ro_options.clone()).is_err(), "read-only open of a nonexistent file must fail");

    let mut group = Group::open_file(&path, OpenOptions::default()).unwrap();
    group.commit().unwrap();
    drop(group);

    let reopened = Group::open_file(&path, ro_options).unwrap();
    assert_eq!(reopened.table_count(), 0);
}

/// B. Single table, single row.
#[test]
fn scenario_b_single_table_single_row() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("b.db");

    let mut group = Group::open_file(&path, OpenOptions::default()).unwrap();
    let t = group.get_table(b"t").unwrap();
    group.table_set(t, 0, 0, 42).unwrap();
    group.commit().unwrap();
    drop(group);

    let mut reopened = Group::open_file(&path, OpenOptions::default()).unwrap();
    let t = reopened.get_table(b"t").unwrap();
    assert_eq!(reopened.table_get(t, 0, 0).unwrap(), 42);
}

/// C. Growth across width: the column Node's ref changes as its packed
/// width grows to fit larger values (0 -> width 1, 1 -> still width 1, 300
/// -> forces a widen to accommodate 16-bit values).
#[test]
fn scenario_c_growth_across_width() {
    let mut alloc = SlabAllocator::new_anon(&[0u8; 16]).unwrap();
    let mut column = Node::with_capacity(&mut alloc, Flags::default(), 0, 4).unwrap();

    let mut seen_refs = Vec::new();
    for value in [0u64, 1, 300] {
        column.add(&mut alloc, value, None).unwrap();
        seen_refs.push(column.ref_());
        let n = column.size(&alloc).unwrap();
        assert_eq!(column.get(&alloc, n - 1).unwrap(), value);
    }

    let distinct: std::collections::HashSet<_> = seen_refs.iter().collect();
    assert!(distinct.len() >= 2, "expected the column's ref to change as its width grows, saw {seen_refs:?}");
}

/// D. Nested subtables: `T[0].sub[0].sub[0].int = 6661012`, persisted to a
/// real file, then a sibling leaf `T[0].sub[0].int` is set and both survive
/// a second reopen. `sub` and `int` are distinct sibling columns (col 1 and
/// col 0 respectively) of the same table, the way a real schema would keep
/// them — descending through `sub` must never overwrite `int`'s cell.
#[test]
fn scenario_d_nested_subtables() {
    const SUB: usize = 1;
    const INT: usize = 0;

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("d.db");

    let mut group = Group::open_file(&path, OpenOptions::default()).unwrap();
    let t = group.get_table(b"T").unwrap();
    group.table_set_nested(t, &[(SUB, 0), (SUB, 0)], INT, 0, 6661012).unwrap();
    group.commit().unwrap();
    drop(group);

    let mut group = Group::open_file(&path, OpenOptions::default()).unwrap();
    let t = group.get_table(b"T").unwrap();
    group.table_set_nested(t, &[(SUB, 0)], INT, 0, 6661011).unwrap();
    group.commit().unwrap();
    drop(group);

    let mut group = Group::open_file(&path, OpenOptions::default()).unwrap();
    let t = group.get_table(b"T").unwrap();
    assert_eq!(group.table_get_nested(t, &[(SUB, 0), (SUB, 0)], INT, 0).unwrap(), 6661012);
    assert_eq!(group.table_get_nested(t, &[(SUB, 0)], INT, 0).unwrap(), 6661011);
}

/// E. Buffer mode immutability.
#[test]
fn scenario_e_buffer_mode_immutability() {
    let mut group = Group::open_empty().unwrap();
    let t = group.get_table(b"t").unwrap();
    group.table_set(t, 0, 0, 7).unwrap();
    let bytes = group.write_to_mem().unwrap();

    let mut buffer_group = Group::open_buffer(&bytes).unwrap();
    assert!(matches!(buffer_group.commit(), Err(Error::Invalid(_))));

    let t = buffer_group.get_table(b"t").unwrap();
    assert_eq!(buffer_group.table_get(t, 0, 0).unwrap(), 7);
}

/// F. Multi-reader reclamation: an extent freed while a reader is live must
/// not be reused until that reader ends.
#[test]
fn scenario_f_multi_reader_reclamation() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("f.db");
    let mut shared = SharedGroup::open(&path, OpenOptions::default()).unwrap();

    {
        let mut wt = shared.begin_write().unwrap();
        let t = wt.group_mut().get_table(b"t").unwrap();
        wt.group_mut().table_set(t, 0, 0, 1).unwrap();
        wt.commit().unwrap();
    }

    // Reader R starts at v1's snapshot.
    let reader = shared.begin_read().unwrap();

    {
        // This commit frees the v1 leaf (replaced by COW) — that extent (E1)
        // must not be eligible for reuse while R is live, but a
        // newly-created extent freed by *this* commit (E2) would be.
        let mut wt = shared.begin_write().unwrap();
        let t = wt.group_mut().get_table(b"t").unwrap();
        wt.group_mut().table_set(t, 0, 0, 2).unwrap();
        wt.commit().unwrap();
    }

    let free_before = shared.free_list_snapshot().unwrap();
    assert!(!free_before.is_empty(), "the superseded v1 leaf should be in the free list");
    assert!(
        free_before.iter().any(|e| e.released_at >= reader.version()),
        "the extent freed this commit must be tagged at/after the reader's version"
    );

    drop(reader);

    {
        // With no readers left, the next commit's allocator can draw on the
        // full free list, including the extent R was pinning.
        let mut wt = shared.begin_write().unwrap();
        let t = wt.group_mut().get_table(b"t").unwrap();
        wt.group_mut().table_set(t, 0, 1, 3).unwrap();
        wt.commit().unwrap();
    }
}

use super::*;

#[test]
fn set_and_clear_split_ranges() {
    let set = SnapshotIdSet::new().add_range(10, 20);
    let cleared = set.clear(15);

    assert!(cleared.get(14));
    assert!(!cleared.get(15));
    assert!(cleared.get(16));
    assert!(set.get(15), "original set is unchanged");
    assert_eq!(format!("{cleared:?}"), "[10..15, 16..20]");
}

#[test]
fn adjacent_ranges_merge() {
    let set = SnapshotIdSet::new().set(3).set(5).set(4);
    assert_eq!(format!("{set:?}"), "[3..6]");
    assert_eq!(set.lowest(0), 3);
}

#[test]
fn and_not_removes_overlap() {
    let left = SnapshotIdSet::new().add_range(1, 100);
    let right: SnapshotIdSet = [2, 3, 50].into_iter().collect();

    let result = left.and_not(&right);

    assert!(result.get(1));
    assert!(!result.get(2));
    assert!(!result.get(3));
    assert!(result.get(4));
    assert!(!result.get(50));
    assert!(result.get(99));
    assert!(!result.get(100));
}

#[test]
fn or_combines_sets() {
    let left: SnapshotIdSet = [1, 7].into_iter().collect();
    let right = SnapshotIdSet::new().add_range(2, 7);

    let union = left.or(&right);

    assert_eq!(union.iter().collect::<Vec<_>>(), vec![1, 2, 3, 4, 5, 6, 7]);
}

#[test]
fn empty_set_reports_default_lowest() {
    let set = SnapshotIdSet::new();
    assert!(set.is_empty());
    assert_eq!(set.lowest(42), 42);
    assert!(!set.get(0));
}

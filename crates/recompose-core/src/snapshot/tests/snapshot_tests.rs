use super::*;
use crate::state::{mutable_state_of, mutable_state_with_policy, MutationPolicy, StateObjectId};
use std::sync::Mutex;

struct SummingPolicy;

impl MutationPolicy<i32> for SummingPolicy {
    fn equivalent(&self, a: &i32, b: &i32) -> bool {
        a == b
    }

    fn merge(&self, previous: &i32, current: &i32, applied: &i32) -> Option<i32> {
        Some(current + applied - previous)
    }
}

fn take(mode: ConflictMode) -> MutableSnapshot {
    take_mutable_snapshot_with_mode(None, None, mode).expect("no snapshot is entered")
}

#[test]
fn writes_stay_isolated_until_apply() {
    let state = mutable_state_of(1);
    let snapshot = take(ConflictMode::LastWriterWins);

    snapshot.enter(|| {
        state.set(2);
        assert_eq!(state.get(), 2, "read-after-write inside the snapshot");
    });
    assert_eq!(state.get(), 1);
    assert!(snapshot.has_pending_changes());

    snapshot.apply().expect("apply");
    assert_eq!(state.get(), 2);
}

#[test]
fn readonly_snapshot_ignores_later_global_writes() {
    let state = mutable_state_of(5);
    let frozen = take_snapshot(None);

    state.set(6);
    send_apply_notifications();

    assert_eq!(frozen.enter(|| state.get()), 5);
    assert_eq!(state.get(), 6);
    frozen.dispose();
}

#[test]
fn readonly_snapshot_sees_global_writes_made_before_it() {
    let state = mutable_state_of("a".to_string());
    state.set("b".to_string());

    let frozen = take_snapshot(None);
    assert_eq!(frozen.enter(|| state.get()), "b");
}

#[test]
fn writing_in_readonly_snapshot_fails() {
    let state = mutable_state_of(0);
    let frozen = take_snapshot(None);

    let result = frozen.enter(|| state.try_set(1));

    assert_eq!(result, Err(SnapshotError::ReadOnly));
    assert_eq!(state.get(), 0);
}

#[test]
fn nested_mutable_commits_into_parent_only() {
    let state = mutable_state_of(0);
    let parent = take(ConflictMode::LastWriterWins);

    parent.enter(|| {
        let child = take_mutable_snapshot(None, None).expect("nested");
        child.enter(|| state.set(3));
        assert_eq!(state.get(), 0, "parent does not see unapplied child writes");

        child.apply().expect("child apply");
        assert_eq!(state.get(), 3);
    });
    assert_eq!(state.get(), 0, "global does not see the parent's pending writes");

    parent.apply().expect("parent apply");
    assert_eq!(state.get(), 3);
}

#[test]
fn nested_readonly_freezes_parent_view() {
    let state = mutable_state_of(0);
    let parent = take(ConflictMode::LastWriterWins);

    parent.enter(|| {
        state.set(1);
        let frozen = take_snapshot(None);
        state.set(2);

        assert_eq!(frozen.enter(|| state.get()), 1);
        assert_eq!(state.get(), 2);
        frozen.dispose();
    });
    parent.dispose();
    assert_eq!(state.get(), 0);
}

#[test]
fn applying_child_after_parent_closed_fails() {
    let state = mutable_state_of(0);
    let parent = take(ConflictMode::LastWriterWins);
    let child = parent.take_nested_mutable_snapshot(None, None).expect("nested");
    child.enter(|| state.set(1));

    parent.dispose();

    assert_eq!(child.apply(), Err(SnapshotError::ParentClosed));
    child.dispose();
}

#[test]
fn last_writer_wins_by_default() {
    let state = mutable_state_of(0);
    let first = take(ConflictMode::LastWriterWins);
    let second = take(ConflictMode::LastWriterWins);

    first.enter(|| state.set(10));
    second.enter(|| state.set(20));

    first.apply().expect("first");
    second.apply().expect("second");
    assert_eq!(state.get(), 20);
}

#[test]
fn strict_mode_reports_conflicts() {
    let state = mutable_state_of(0);
    let first = take(ConflictMode::Strict);
    let second = take(ConflictMode::Strict);

    first.enter(|| state.set(10));
    second.enter(|| state.set(20));

    first.apply().expect("first");
    let err = second.apply().expect_err("second conflicts");
    assert_eq!(
        err,
        SnapshotError::Conflict {
            objects: vec![state.id()]
        }
    );
    assert!(err.is_retryable());
    assert!(second.is_active(), "a failed apply leaves the snapshot open");

    second.dispose();
    assert_eq!(state.get(), 10);

    let retried = with_mutable_snapshot(|| state.update(|value| *value += 5));
    assert_eq!(retried, Ok(()));
    assert_eq!(state.get(), 15);
}

#[test]
fn equivalent_concurrent_writes_do_not_conflict() {
    let state = mutable_state_of(0);
    let first = take(ConflictMode::Strict);
    let second = take(ConflictMode::Strict);

    first.enter(|| state.set(7));
    second.enter(|| state.set(7));

    first.apply().expect("first");
    second.apply().expect("same value is not a conflict");
    assert_eq!(state.get(), 7);
}

#[test]
fn merging_policy_combines_concurrent_writes() {
    let state = mutable_state_with_policy(0, SummingPolicy);
    let first = take(ConflictMode::Strict);
    let second = take(ConflictMode::Strict);

    first.enter(|| state.set(5));
    second.enter(|| state.set(7));

    first.apply().expect("first");
    second.apply().expect("merged");
    assert_eq!(state.get(), 12);
}

#[test]
fn dispose_discards_pending_records() {
    let state = mutable_state_of(0);
    let snapshot = take(ConflictMode::LastWriterWins);
    snapshot.enter(|| state.set(4));
    assert_eq!(state.record_count(), 2);

    snapshot.dispose();

    assert_eq!(state.record_count(), 1);
    assert_eq!(state.get(), 0);
    assert_eq!(
        snapshot.enter(|| state.try_set(9)),
        Err(SnapshotError::Disposed)
    );
    assert_eq!(snapshot.apply(), Err(SnapshotError::Disposed));
}

#[test]
fn dropping_an_active_snapshot_abandons_it() {
    let state = mutable_state_of(0);
    {
        let snapshot = take(ConflictMode::LastWriterWins);
        snapshot.enter(|| state.set(4));
    }
    assert_eq!(state.record_count(), 1);
    assert_eq!(state.get(), 0);
}

#[test]
fn applying_twice_is_an_error() {
    let snapshot = take(ConflictMode::LastWriterWins);
    snapshot.apply().expect("first apply");
    assert_eq!(snapshot.apply(), Err(SnapshotError::AlreadyApplied));
}

#[test]
fn equivalent_write_is_not_recorded() {
    let state = mutable_state_of(3);
    let snapshot = take(ConflictMode::LastWriterWins);
    snapshot.enter(|| state.set(3));
    assert!(!snapshot.has_pending_changes());
    snapshot.dispose();
}

#[test]
fn apply_observers_receive_changed_objects() {
    let state = mutable_state_of(0);
    let untouched = mutable_state_of(0);
    let seen: Arc<Mutex<Vec<StateObjectId>>> = Arc::default();
    let sink = Arc::clone(&seen);
    let handle = register_apply_observer(move |objects, _| {
        sink.lock()
            .unwrap()
            .extend(objects.iter().map(|object| object.object_id()));
    });

    with_mutable_snapshot(|| state.set(1)).expect("apply");

    {
        let seen = seen.lock().unwrap();
        assert!(seen.contains(&state.id()));
        assert!(!seen.contains(&untouched.id()));
    }

    handle.dispose();
    seen.lock().unwrap().clear();
    with_mutable_snapshot(|| state.set(2)).expect("apply");
    assert!(!seen.lock().unwrap().contains(&state.id()));
}

#[test]
fn read_observer_sees_tracked_reads_only() {
    let state = mutable_state_of(0);
    let reads: Rc<RefCell<Vec<StateObjectId>>> = Rc::default();
    let sink = Rc::clone(&reads);
    let observer: ReadObserver = Rc::new(move |object| sink.borrow_mut().push(object.object_id()));
    let snapshot = take_mutable_snapshot_with_mode(
        Some(observer),
        None,
        ConflictMode::LastWriterWins,
    )
    .expect("snapshot");

    snapshot.enter(|| {
        state.get();
        state.get_untracked();
        without_read_observation(|| state.get());
    });

    assert_eq!(*reads.borrow(), vec![state.id()]);
    snapshot.dispose();
}

#[test]
fn observe_reads_stacks_with_snapshot_observer() {
    let state = mutable_state_of(0);
    let outer: Rc<Cell<usize>> = Rc::default();
    let counter = Rc::clone(&outer);

    observe_reads(Rc::new(move |_| counter.set(counter.get() + 1)), || {
        state.get();
        state.with(|value| *value + 1);
    });
    state.get();

    assert_eq!(outer.get(), 2);
}

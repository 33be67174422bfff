use super::*;
use crate::snapshot::{observe_reads, take_mutable_snapshot, with_mutable_snapshot};
use std::rc::Rc;
use std::sync::atomic::AtomicUsize;

#[test]
fn update_and_replace_return_values() {
    let state = mutable_state_of(vec![1, 2]);

    let len = state.update(|items| {
        items.push(3);
        items.len()
    });
    let previous = state.replace(vec![9]);

    assert_eq!(len, 3);
    assert_eq!(previous, vec![1, 2, 3]);
    assert_eq!(state.get(), vec![9]);
}

#[test]
fn structural_policy_skips_equal_writes() {
    let state = mutable_state_of(String::from("same"));
    let snapshot = take_mutable_snapshot(None, None).expect("snapshot");

    snapshot.enter(|| state.set(String::from("same")));

    assert!(!snapshot.has_pending_changes());
    assert_eq!(state.record_count(), 1);
    snapshot.dispose();
}

#[test]
fn never_equal_policy_records_every_write() {
    let state = mutable_state_with_policy(1, NeverEqualPolicy);
    let snapshot = take_mutable_snapshot(None, None).expect("snapshot");

    snapshot.enter(|| state.set(1));

    assert_eq!(snapshot.modified_ids(), vec![state.id()]);
    snapshot.dispose();
}

#[test]
fn referential_policy_compares_identity() {
    let shared = Arc::new(vec![1]);
    let state = mutable_state_with_policy(Arc::clone(&shared), ReferentialEqualityPolicy);
    let snapshot = take_mutable_snapshot(None, None).expect("snapshot");

    snapshot.enter(|| state.set(Arc::clone(&shared)));
    assert!(!snapshot.has_pending_changes());

    snapshot.enter(|| state.set(Arc::new(vec![1])));
    assert!(snapshot.has_pending_changes());
    snapshot.dispose();
}

#[test]
fn merging_policy_runs_closure() {
    let policy = MergingPolicy::new(|previous: &i32, current: &i32, applied: &i32| {
        Some(current.max(applied) - previous)
    });
    assert!(policy.equivalent(&2, &2));
    assert_eq!(policy.merge(&1, &4, &3), Some(3));
}

#[test]
fn state_ids_are_unique_and_clones_share_cells() {
    let a = mutable_state_of(0);
    let b = mutable_state_of(0);
    let a2 = a.clone();

    assert_ne!(a.id(), b.id());
    assert_eq!(a, a2);
    assert_ne!(a, b);

    a2.set(5);
    assert_eq!(a.get(), 5);
}

#[test]
fn debug_shows_current_value() {
    let state = mutable_state_of(42);
    let rendered = format!("{state:?}");
    assert!(rendered.contains("value: 42"), "{rendered}");
}

#[test]
fn derived_state_caches_until_input_changes() {
    let input = mutable_state_of(1);
    let runs = Arc::new(AtomicUsize::new(0));
    let derived = {
        let input = input.clone();
        let runs = Arc::clone(&runs);
        derived_state_of(move || {
            runs.fetch_add(1, Ordering::SeqCst);
            input.get() * 2
        })
    };

    assert_eq!(derived.get(), 2);
    assert_eq!(derived.get(), 2);
    assert_eq!(runs.load(Ordering::SeqCst), 1);

    input.set(3);
    assert_eq!(derived.get(), 6);
    input.set(4);
    assert_eq!(derived.get(), 8, "in-place global writes invalidate too");
    assert_eq!(runs.load(Ordering::SeqCst), 3);
}

#[test]
fn derived_state_reports_its_inputs_to_readers() {
    let input = mutable_state_of(1);
    let derived = {
        let input = input.clone();
        derived_state_of(move || input.get() + 1)
    };
    let reads: Rc<std::cell::RefCell<Vec<StateObjectId>>> = Rc::default();

    for _ in 0..2 {
        reads.borrow_mut().clear();
        let sink = Rc::clone(&reads);
        observe_reads(
            Rc::new(move |object: &Arc<dyn StateObject>| {
                sink.borrow_mut().push(object.object_id())
            }),
            || derived.get(),
        );
        assert!(
            reads.borrow().contains(&input.id()),
            "cached and fresh reads both expose the input"
        );
    }
}

#[test]
fn derived_state_follows_snapshot_view() {
    let input = mutable_state_of(10);
    let derived = {
        let input = input.clone();
        derived_state_of(move || input.get() + 1)
    };
    assert_eq!(derived.get(), 11);

    let snapshot = take_mutable_snapshot(None, None).expect("snapshot");
    snapshot.enter(|| {
        input.set(20);
        assert_eq!(derived.get(), 21);
    });
    assert_eq!(derived.get(), 11);

    snapshot.apply().expect("apply");
    assert_eq!(derived.get(), 21);
}

#[test]
#[should_panic(expected = "failed to write")]
fn set_in_readonly_snapshot_panics() {
    let state = mutable_state_of(0);
    let frozen = crate::snapshot::take_snapshot(None);
    frozen.enter(|| state.set(1));
}

#[test]
fn with_mutable_snapshot_returns_block_value() {
    let state = mutable_state_of(1);
    let doubled = with_mutable_snapshot(|| {
        state.update(|value| *value *= 2);
        state.get()
    });
    assert_eq!(doubled, Ok(2));
}

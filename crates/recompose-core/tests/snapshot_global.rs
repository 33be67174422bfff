//! Tests that depend on the global snapshot advancing only when they say so.
//! They share one process-wide lock so the other tests in this binary cannot
//! interleave snapshot creation.

use recompose_core::snapshot::{
    register_global_write_observer, send_apply_notifications, with_mutable_snapshot,
};
use recompose_core::{mutable_state_of, StateObjectId};
use std::sync::{Arc, Mutex, MutexGuard};

static SERIAL: Mutex<()> = Mutex::new(());

fn serial() -> MutexGuard<'static, ()> {
    SERIAL.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[test]
fn global_writes_notify_once_per_epoch() {
    let _serial = serial();
    let state = mutable_state_of(0);
    let writes: Arc<Mutex<Vec<StateObjectId>>> = Arc::default();
    let sink = Arc::clone(&writes);
    let _handle = register_global_write_observer(move |object| {
        sink.lock().unwrap().push(object.object_id());
    });
    let count = || {
        writes
            .lock()
            .unwrap()
            .iter()
            .filter(|id| **id == state.id())
            .count()
    };

    state.set(1);
    state.set(2);
    assert_eq!(count(), 1);

    assert!(send_apply_notifications());
    state.set(3);
    assert_eq!(count(), 2);
}

#[test]
fn applied_records_are_pruned() {
    let _serial = serial();
    let state = mutable_state_of(0);

    for value in 1..=10 {
        with_mutable_snapshot(|| state.set(value)).expect("apply");
    }

    assert_eq!(state.get(), 10);
    assert!(
        state.record_count() <= 2,
        "obscured records should be dropped, found {}",
        state.record_count()
    );
}

#[test]
fn equivalent_global_write_sends_nothing() {
    let _serial = serial();
    let state = mutable_state_of(4);
    send_apply_notifications();

    state.set(4);

    assert!(!send_apply_notifications());
}

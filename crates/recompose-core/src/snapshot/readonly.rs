use std::cell::Cell;
use std::rc::Rc;

use super::runtime::{self, with_runtime};
use super::{enter_snapshot, merge_read_observers, AnySnapshot, ReadObserver, SnapshotId, SnapshotIdSet};

struct ReadonlyInner {
    id: SnapshotId,
    invalid: SnapshotIdSet,
    pin: Cell<Option<SnapshotId>>,
    /// Nested readonly snapshots of a readonly parent reuse the parent's id.
    owns_id: bool,
    read_observer: Option<ReadObserver>,
    disposed: Cell<bool>,
}

impl ReadonlyInner {
    fn release(&self) {
        if self.disposed.replace(true) {
            return;
        }
        let pin = self.pin.take();
        let owned = self.owns_id.then_some(self.id);
        if pin.is_none() && owned.is_none() {
            return;
        }
        with_runtime(|runtime| {
            if let Some(id) = owned {
                runtime.close(id, &SnapshotIdSet::new());
            }
            if let Some(pin) = pin {
                runtime.unpin(pin);
            }
        });
    }
}

impl Drop for ReadonlyInner {
    fn drop(&mut self) {
        self.release();
    }
}

/// A frozen view of state as of the moment it was taken.
#[derive(Clone)]
pub struct ReadonlySnapshot {
    inner: Rc<ReadonlyInner>,
}

impl ReadonlySnapshot {
    pub(crate) fn new_root(read_observer: Option<ReadObserver>) -> Self {
        let (id, invalid, pin, observers, changes) = with_runtime(|runtime| {
            let changes = runtime.advance_global();
            let invalid = runtime.open_snapshots().clone();
            let id = runtime.allocate();
            let pin = runtime.pin(invalid.lowest(id));
            (id, invalid, pin, runtime.apply_observers(), changes)
        });
        runtime::notify_global_changes(&observers, changes);
        Self::from_parts(id, invalid, Some(pin), true, read_observer)
    }

    pub(crate) fn from_parts(
        id: SnapshotId,
        invalid: SnapshotIdSet,
        pin: Option<SnapshotId>,
        owns_id: bool,
        read_observer: Option<ReadObserver>,
    ) -> Self {
        Self {
            inner: Rc::new(ReadonlyInner {
                id,
                invalid,
                pin: Cell::new(pin),
                owns_id,
                read_observer,
                disposed: Cell::new(false),
            }),
        }
    }

    pub fn snapshot_id(&self) -> SnapshotId {
        self.inner.id
    }

    pub fn invalid(&self) -> SnapshotIdSet {
        self.inner.invalid.clone()
    }

    pub fn is_disposed(&self) -> bool {
        self.inner.disposed.get()
    }

    pub(crate) fn read_observer(&self) -> Option<ReadObserver> {
        self.inner.read_observer.clone()
    }

    pub(crate) fn with_view<R>(&self, f: impl FnOnce(SnapshotId, &SnapshotIdSet) -> R) -> R {
        f(self.inner.id, &self.inner.invalid)
    }

    /// Nested readonly snapshots see exactly what the parent sees.
    pub fn take_nested_snapshot(&self, read_observer: Option<ReadObserver>) -> ReadonlySnapshot {
        let pin = with_runtime(|runtime| runtime.pin(self.inner.invalid.lowest(self.inner.id)));
        Self::from_parts(
            self.inner.id,
            self.inner.invalid.clone(),
            Some(pin),
            false,
            merge_read_observers(self.inner.read_observer.clone(), read_observer),
        )
    }

    pub fn enter<R>(&self, f: impl FnOnce() -> R) -> R {
        let _guard = enter_snapshot(AnySnapshot::Readonly(self.clone()));
        f()
    }

    pub fn dispose(&self) {
        self.inner.release();
    }
}

use std::cell::{Cell, RefCell};
use std::rc::Rc;
use std::sync::Arc;

use super::runtime::{self, with_runtime, SnapshotRuntime};
use super::{
    enter_snapshot, merge_read_observers, AnySnapshot, ConflictMode, ReadObserver,
    ReadonlySnapshot, SnapshotId, SnapshotIdSet, WriteObserver,
};
use crate::collections::map::HashSet;
use crate::error::SnapshotError;
use crate::state::{ApplyOutcome, ApplyView, StateObject, StateObjectId, WriteOutcome};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Lifecycle {
    Active,
    Applied,
    Disposed,
}

struct MutableInner {
    id: Cell<SnapshotId>,
    invalid: RefCell<SnapshotIdSet>,
    /// Ids whose records belong to this snapshot besides `id`: ids it held
    /// before advancing, applied children and merge records.
    previous_ids: RefCell<SnapshotIdSet>,
    modified: RefCell<Vec<Arc<dyn StateObject>>>,
    modified_ids: RefCell<HashSet<StateObjectId>>,
    parent: Option<MutableSnapshot>,
    read_observer: Option<ReadObserver>,
    write_observer: Option<WriteObserver>,
    lifecycle: Cell<Lifecycle>,
    mode: ConflictMode,
    pin: Cell<Option<SnapshotId>>,
}

impl MutableInner {
    fn own_ids(&self) -> SnapshotIdSet {
        self.previous_ids.borrow().set(self.id.get())
    }

    /// Move to a fresh id so writes made from now on stay invisible to
    /// snapshots nested before this point.
    fn advance(&self, runtime: &mut SnapshotRuntime) {
        let previous = self.id.get();
        let next = runtime.allocate();
        self.previous_ids.replace_with(|ids| ids.set(previous));
        self.invalid
            .replace_with(|invalid| invalid.add_range(previous + 1, next));
        self.id.set(next);
    }

    fn release(&self, runtime: &mut SnapshotRuntime) {
        runtime.close(self.id.get(), &self.previous_ids.borrow());
        if let Some(pin) = self.pin.take() {
            runtime.unpin(pin);
        }
    }

    fn abandon(&self) {
        let own_ids = self.own_ids();
        let modified = self.modified.take();
        self.modified_ids.borrow_mut().clear();
        for object in &modified {
            object.discard_records(&own_ids);
        }
        with_runtime(|runtime| self.release(runtime));
        self.lifecycle.set(Lifecycle::Disposed);
    }
}

impl Drop for MutableInner {
    fn drop(&mut self) {
        if self.lifecycle.get() == Lifecycle::Active {
            self.abandon();
        }
    }
}

/// A snapshot that buffers writes until it is applied.
#[derive(Clone)]
pub struct MutableSnapshot {
    inner: Rc<MutableInner>,
}

impl MutableSnapshot {
    pub(crate) fn new_root(
        read_observer: Option<ReadObserver>,
        write_observer: Option<WriteObserver>,
        mode: ConflictMode,
    ) -> Self {
        let (id, invalid, pin, observers, changes) = with_runtime(|runtime| {
            let changes = runtime.advance_global();
            let id = runtime.allocate();
            let invalid = runtime.open_snapshots().clear(id);
            let pin = runtime.pin(invalid.lowest(id));
            (id, invalid, pin, runtime.apply_observers(), changes)
        });
        runtime::notify_global_changes(&observers, changes);
        Self::from_parts(id, invalid, pin, None, read_observer, write_observer, mode)
    }

    fn from_parts(
        id: SnapshotId,
        invalid: SnapshotIdSet,
        pin: SnapshotId,
        parent: Option<MutableSnapshot>,
        read_observer: Option<ReadObserver>,
        write_observer: Option<WriteObserver>,
        mode: ConflictMode,
    ) -> Self {
        log::trace!("opened mutable snapshot {id}");
        Self {
            inner: Rc::new(MutableInner {
                id: Cell::new(id),
                invalid: RefCell::new(invalid),
                previous_ids: RefCell::new(SnapshotIdSet::new()),
                modified: RefCell::new(Vec::new()),
                modified_ids: RefCell::new(HashSet::default()),
                parent,
                read_observer,
                write_observer,
                lifecycle: Cell::new(Lifecycle::Active),
                mode,
                pin: Cell::new(Some(pin)),
            }),
        }
    }

    pub fn snapshot_id(&self) -> SnapshotId {
        self.inner.id.get()
    }

    pub fn invalid(&self) -> SnapshotIdSet {
        self.inner.invalid.borrow().clone()
    }

    pub fn conflict_mode(&self) -> ConflictMode {
        self.inner.mode
    }

    pub fn is_active(&self) -> bool {
        self.inner.lifecycle.get() == Lifecycle::Active
    }

    pub fn is_applied(&self) -> bool {
        self.inner.lifecycle.get() == Lifecycle::Applied
    }

    pub fn is_disposed(&self) -> bool {
        self.inner.lifecycle.get() == Lifecycle::Disposed
    }

    pub fn has_pending_changes(&self) -> bool {
        !self.inner.modified.borrow().is_empty()
    }

    pub fn modified_ids(&self) -> Vec<StateObjectId> {
        self.inner
            .modified
            .borrow()
            .iter()
            .map(|object| object.object_id())
            .collect()
    }

    pub(crate) fn read_observer(&self) -> Option<ReadObserver> {
        self.inner.read_observer.clone()
    }

    pub(crate) fn with_view<R>(&self, f: impl FnOnce(SnapshotId, &SnapshotIdSet) -> R) -> R {
        f(self.inner.id.get(), &self.inner.invalid.borrow())
    }

    fn ensure_active(&self) -> Result<(), SnapshotError> {
        match self.inner.lifecycle.get() {
            Lifecycle::Active => Ok(()),
            Lifecycle::Applied => Err(SnapshotError::AlreadyApplied),
            Lifecycle::Disposed => Err(SnapshotError::Disposed),
        }
    }

    /// Make this snapshot current for the duration of `f`.
    pub fn enter<R>(&self, f: impl FnOnce() -> R) -> R {
        let _guard = enter_snapshot(AnySnapshot::Mutable(self.clone()));
        f()
    }

    pub(crate) fn write(
        &self,
        object: &Arc<dyn StateObject>,
        write: impl FnOnce(SnapshotId, &SnapshotIdSet) -> WriteOutcome,
    ) -> Result<(), SnapshotError> {
        self.ensure_active()?;
        let outcome = self.with_view(write);
        if let WriteOutcome::Written = outcome {
            if self
                .inner
                .modified_ids
                .borrow_mut()
                .insert(object.object_id())
            {
                self.inner.modified.borrow_mut().push(Arc::clone(object));
            }
            if let Some(observer) = self.inner.write_observer.clone() {
                observer(object);
            }
        }
        Ok(())
    }

    pub fn take_nested_mutable_snapshot(
        &self,
        read_observer: Option<ReadObserver>,
        write_observer: Option<WriteObserver>,
    ) -> Result<MutableSnapshot, SnapshotError> {
        self.take_nested_mutable_snapshot_with_mode(read_observer, write_observer, self.inner.mode)
    }

    pub fn take_nested_mutable_snapshot_with_mode(
        &self,
        read_observer: Option<ReadObserver>,
        write_observer: Option<WriteObserver>,
        mode: ConflictMode,
    ) -> Result<MutableSnapshot, SnapshotError> {
        self.ensure_active()?;
        let (id, invalid, pin) = with_runtime(|runtime| {
            let parent_id = self.inner.id.get();
            let id = runtime.allocate();
            let invalid = self.inner.invalid.borrow().add_range(parent_id + 1, id);
            self.inner.invalid.replace_with(|parent| parent.set(id));
            self.inner.advance(runtime);
            let pin = runtime.pin(invalid.lowest(id));
            (id, invalid, pin)
        });
        let read_observer = merge_read_observers(self.inner.read_observer.clone(), read_observer);
        let write_observer = merge_read_observers(self.inner.write_observer.clone(), write_observer);
        Ok(Self::from_parts(
            id,
            invalid,
            pin,
            Some(self.clone()),
            read_observer,
            write_observer,
            mode,
        ))
    }

    pub fn take_nested_snapshot(
        &self,
        read_observer: Option<ReadObserver>,
    ) -> Result<ReadonlySnapshot, SnapshotError> {
        self.ensure_active()?;
        let (id, invalid, pin) = with_runtime(|runtime| {
            let parent_id = self.inner.id.get();
            let id = runtime.allocate();
            let invalid = self.inner.invalid.borrow().add_range(parent_id + 1, id);
            self.inner.advance(runtime);
            let pin = runtime.pin(invalid.lowest(id));
            (id, invalid, pin)
        });
        let read_observer = merge_read_observers(self.inner.read_observer.clone(), read_observer);
        Ok(ReadonlySnapshot::from_parts(
            id,
            invalid,
            Some(pin),
            true,
            read_observer,
        ))
    }

    /// Commit the buffered writes.
    ///
    /// A root snapshot applies into the global state and notifies apply
    /// observers; a nested snapshot applies into its parent.
    pub fn apply(&self) -> Result<(), SnapshotError> {
        self.ensure_active()?;
        match &self.inner.parent {
            Some(parent) => self.apply_nested(parent),
            None => self.apply_root(),
        }
    }

    fn apply_root(&self) -> Result<(), SnapshotError> {
        let inner = &self.inner;
        let modified = inner.modified.borrow().clone();
        let id = inner.id.get();
        let invalid = inner.invalid.borrow().clone();
        let base_invalid = invalid.or(&inner.own_ids());

        let (observers, global_changes) = with_runtime(|runtime| {
            let current_invalid = runtime.open_snapshots().clear(runtime.global_id());
            let view = ApplyView {
                snapshot_id: id,
                applied_invalid: &invalid,
                base_invalid: &base_invalid,
                current_id: runtime.next_id(),
                current_invalid: &current_invalid,
                mode: inner.mode,
            };
            let merges = resolve_conflicts(&modified, &view)?;
            if !merges.is_empty() {
                let merge_id = runtime.allocate_record_id();
                for (object, value) in merges {
                    object.commit_merge(merge_id, value);
                }
            }
            inner.release(runtime);
            let global_changes = runtime.advance_global();
            let limit = runtime.reuse_limit();
            for object in &modified {
                object.prune_records(limit);
            }
            Ok((runtime.apply_observers(), global_changes))
        })?;

        inner.lifecycle.set(Lifecycle::Applied);
        log::trace!("applied snapshot {id} with {} change(s)", modified.len());
        runtime::notify_global_changes(&observers, global_changes);
        runtime::notify_apply_observers(&observers, &modified, id);
        Ok(())
    }

    fn apply_nested(&self, parent: &MutableSnapshot) -> Result<(), SnapshotError> {
        if parent.ensure_active().is_err() {
            return Err(SnapshotError::ParentClosed);
        }
        let inner = &self.inner;
        let modified = inner.modified.borrow().clone();
        let id = inner.id.get();
        let invalid = inner.invalid.borrow().clone();
        let base_invalid = invalid.or(&inner.own_ids());

        with_runtime(|runtime| {
            let parent_invalid = parent.inner.invalid.borrow().clone();
            let view = ApplyView {
                snapshot_id: id,
                applied_invalid: &invalid,
                base_invalid: &base_invalid,
                current_id: parent.inner.id.get(),
                current_invalid: &parent_invalid,
                mode: inner.mode,
            };
            let merges = resolve_conflicts(&modified, &view)?;
            if !merges.is_empty() {
                // Stays open so only the parent sees it until the parent applies.
                let merge_id = runtime.allocate();
                inner.previous_ids.replace_with(|ids| ids.set(merge_id));
                for (object, value) in merges {
                    object.commit_merge(merge_id, value);
                }
            }

            for object in &modified {
                if parent
                    .inner
                    .modified_ids
                    .borrow_mut()
                    .insert(object.object_id())
                {
                    parent.inner.modified.borrow_mut().push(Arc::clone(object));
                }
            }

            parent.inner.advance(runtime);
            let own_ids = inner.own_ids();
            parent
                .inner
                .invalid
                .replace_with(|parent_invalid| parent_invalid.and_not(&own_ids));
            parent
                .inner
                .previous_ids
                .replace_with(|ids| ids.or(&own_ids));
            if let Some(pin) = inner.pin.take() {
                runtime.unpin(pin);
            }
            Ok(())
        })?;

        inner.lifecycle.set(Lifecycle::Applied);
        log::trace!(
            "applied nested snapshot {id} into {}",
            parent.snapshot_id()
        );
        Ok(())
    }

    /// Discard every buffered write and close the snapshot.
    pub fn dispose(&self) {
        if self.inner.lifecycle.get() == Lifecycle::Active {
            self.inner.abandon();
        }
    }
}

fn resolve_conflicts(
    modified: &[Arc<dyn StateObject>],
    view: &ApplyView<'_>,
) -> Result<Vec<(Arc<dyn StateObject>, Box<dyn std::any::Any + Send>)>, SnapshotError> {
    let mut merges = Vec::new();
    let mut conflicts = Vec::new();
    for object in modified {
        match object.prepare_apply(view) {
            ApplyOutcome::Clean => {}
            ApplyOutcome::Merge(value) => merges.push((Arc::clone(object), value)),
            ApplyOutcome::Conflict => conflicts.push(object.object_id()),
        }
    }
    if conflicts.is_empty() {
        Ok(merges)
    } else {
        Err(SnapshotError::Conflict { objects: conflicts })
    }
}

//! Process-wide snapshot bookkeeping.
//!
//! Everything that must agree across threads lives here behind one mutex:
//! id allocation, the set of open snapshots, pins that bound record pruning,
//! the global snapshot and its pending writes, and the observer registries.
//! State records themselves are guarded per cell, never by this lock.

use super::{ApplyObserver, ConflictMode, GlobalWriteObserver, SnapshotId, SnapshotIdSet};
use crate::collections::map::HashMap;
use crate::state::{StateObject, StateObjectId, PREEXISTING_SNAPSHOT_ID};
use std::cell::Cell;
use std::collections::BTreeMap;
use std::sync::{Arc, LazyLock, Mutex};

const INITIAL_GLOBAL_SNAPSHOT_ID: SnapshotId = PREEXISTING_SNAPSHOT_ID + 1;

static SNAPSHOT_RUNTIME: LazyLock<Mutex<SnapshotRuntime>> =
    LazyLock::new(|| Mutex::new(SnapshotRuntime::new()));

thread_local! {
    static RUNTIME_LOCK_DEPTH: Cell<usize> = const { Cell::new(0) };
}

struct RuntimeLockGuard;

impl RuntimeLockGuard {
    fn enter() -> Self {
        RUNTIME_LOCK_DEPTH.with(|depth| {
            // Merge policies run under the lock; a policy that reads or writes
            // state would deadlock on the non-reentrant mutex.
            assert!(
                depth.get() == 0,
                "snapshot runtime re-entered; mutation policies must not touch snapshot state"
            );
            depth.set(depth.get() + 1);
        });
        Self
    }
}

impl Drop for RuntimeLockGuard {
    fn drop(&mut self) {
        RUNTIME_LOCK_DEPTH.with(|depth| depth.set(depth.get().saturating_sub(1)));
    }
}

/// Run `f` with exclusive access to the runtime.
pub(crate) fn with_runtime<T>(f: impl FnOnce(&mut SnapshotRuntime) -> T) -> T {
    let _scope = RuntimeLockGuard::enter();
    let mut guard = SNAPSHOT_RUNTIME
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner());
    f(&mut guard)
}

/// Objects written in the global snapshot since it last advanced.
pub(crate) struct GlobalChanges {
    pub snapshot_id: SnapshotId,
    pub objects: Vec<Arc<dyn StateObject>>,
}

pub(crate) struct SnapshotRuntime {
    next_id: SnapshotId,
    open: SnapshotIdSet,
    pins: BTreeMap<SnapshotId, usize>,
    global_id: SnapshotId,
    global_invalid: SnapshotIdSet,
    global_modified: HashMap<StateObjectId, Arc<dyn StateObject>>,
    global_modified_order: Vec<StateObjectId>,
    apply_observers: Vec<(u64, ApplyObserver)>,
    global_write_observers: Vec<(u64, GlobalWriteObserver)>,
    next_observer_id: u64,
    default_conflict_mode: ConflictMode,
}

impl SnapshotRuntime {
    fn new() -> Self {
        Self {
            next_id: INITIAL_GLOBAL_SNAPSHOT_ID + 1,
            open: SnapshotIdSet::new().set(INITIAL_GLOBAL_SNAPSHOT_ID),
            pins: BTreeMap::new(),
            global_id: INITIAL_GLOBAL_SNAPSHOT_ID,
            global_invalid: SnapshotIdSet::new(),
            global_modified: HashMap::default(),
            global_modified_order: Vec::new(),
            apply_observers: Vec::new(),
            global_write_observers: Vec::new(),
            next_observer_id: 1,
            default_conflict_mode: ConflictMode::default(),
        }
    }

    pub(crate) fn next_id(&self) -> SnapshotId {
        self.next_id
    }

    pub(crate) fn open_snapshots(&self) -> &SnapshotIdSet {
        &self.open
    }

    /// Allocate an id and mark it open.
    pub(crate) fn allocate(&mut self) -> SnapshotId {
        let id = self.allocate_record_id();
        self.open = self.open.set(id);
        id
    }

    /// Allocate an id that is never opened. Only valid while the caller
    /// holds the lock and is about to make the id visible.
    pub(crate) fn allocate_record_id(&mut self) -> SnapshotId {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    pub(crate) fn close(&mut self, id: SnapshotId, previous_ids: &SnapshotIdSet) {
        self.open = self.open.clear(id).and_not(previous_ids);
    }

    pub(crate) fn pin(&mut self, id: SnapshotId) -> SnapshotId {
        *self.pins.entry(id).or_insert(0) += 1;
        id
    }

    pub(crate) fn unpin(&mut self, id: SnapshotId) {
        if let Some(count) = self.pins.get_mut(&id) {
            *count -= 1;
            if *count == 0 {
                self.pins.remove(&id);
            }
        }
    }

    /// Records strictly below this id are visible identically to every open
    /// snapshot, so all but the newest of them can be dropped.
    pub(crate) fn reuse_limit(&self) -> SnapshotId {
        let global = self.global_invalid.lowest(self.global_id).min(self.global_id);
        self.pins
            .keys()
            .next()
            .map_or(global, |&lowest| lowest.min(global))
    }

    pub(crate) fn global_view(&self) -> (SnapshotId, SnapshotIdSet) {
        (self.global_id, self.global_invalid.clone())
    }

    pub(crate) fn global_id(&self) -> SnapshotId {
        self.global_id
    }

    /// Returns true the first time `object` is written in the current global epoch.
    pub(crate) fn record_global_write(&mut self, object: &Arc<dyn StateObject>) -> bool {
        let id = object.object_id();
        if self.global_modified.contains_key(&id) {
            return false;
        }
        self.global_modified.insert(id, Arc::clone(object));
        self.global_modified_order.push(id);
        true
    }

    pub(crate) fn has_pending_global_changes(&self) -> bool {
        !self.global_modified.is_empty()
    }

    /// Close the current global snapshot and open a fresh one, making every
    /// global write visible to snapshots taken afterwards.
    pub(crate) fn advance_global(&mut self) -> Option<GlobalChanges> {
        let previous = self.global_id;
        let next = self.allocate();
        self.open = self.open.clear(previous);
        self.global_invalid = self.open.clear(next);
        self.global_id = next;

        if self.global_modified.is_empty() {
            return None;
        }
        let mut modified = std::mem::take(&mut self.global_modified);
        let objects = self
            .global_modified_order
            .drain(..)
            .filter_map(|id| modified.remove(&id))
            .collect();
        Some(GlobalChanges {
            snapshot_id: previous,
            objects,
        })
    }

    pub(crate) fn register_apply_observer(&mut self, observer: ApplyObserver) -> u64 {
        let id = self.next_observer_id;
        self.next_observer_id += 1;
        self.apply_observers.push((id, observer));
        id
    }

    pub(crate) fn unregister_apply_observer(&mut self, id: u64) {
        self.apply_observers.retain(|(observer_id, _)| *observer_id != id);
    }

    pub(crate) fn apply_observers(&self) -> Vec<ApplyObserver> {
        self.apply_observers
            .iter()
            .map(|(_, observer)| Arc::clone(observer))
            .collect()
    }

    pub(crate) fn register_global_write_observer(&mut self, observer: GlobalWriteObserver) -> u64 {
        let id = self.next_observer_id;
        self.next_observer_id += 1;
        self.global_write_observers.push((id, observer));
        id
    }

    pub(crate) fn unregister_global_write_observer(&mut self, id: u64) {
        self.global_write_observers
            .retain(|(observer_id, _)| *observer_id != id);
    }

    pub(crate) fn global_write_observers(&self) -> Vec<GlobalWriteObserver> {
        self.global_write_observers
            .iter()
            .map(|(_, observer)| Arc::clone(observer))
            .collect()
    }

    pub(crate) fn default_conflict_mode(&self) -> ConflictMode {
        self.default_conflict_mode
    }

    pub(crate) fn set_default_conflict_mode(&mut self, mode: ConflictMode) {
        self.default_conflict_mode = mode;
    }
}

/// Deliver apply notifications outside the runtime lock.
pub(crate) fn notify_apply_observers(
    observers: &[ApplyObserver],
    objects: &[Arc<dyn StateObject>],
    snapshot_id: SnapshotId,
) {
    if objects.is_empty() {
        return;
    }
    for observer in observers {
        observer(objects, snapshot_id);
    }
}

pub(crate) fn notify_global_changes(observers: &[ApplyObserver], changes: Option<GlobalChanges>) {
    if let Some(changes) = changes {
        log::trace!(
            "global snapshot {} applied {} change(s)",
            changes.snapshot_id,
            changes.objects.len()
        );
        notify_apply_observers(observers, &changes.objects, changes.snapshot_id);
    }
}

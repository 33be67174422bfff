//! Observable state cells backed by versioned records.
//!
//! Each cell keeps one record per snapshot that wrote it, newest first. A read
//! in snapshot `S` resolves to the newest record whose id is at most `S.id` and
//! not in `S.invalid`; a write in `S` creates the record tagged `S.id` on first
//! use and overwrites it afterwards.

use std::any::Any;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::error::SnapshotError;
use crate::snapshot::{self, ConflictMode, SnapshotId, SnapshotIdSet};

/// Id given to records that exist before any snapshot wrote the cell. Every
/// snapshot can see it.
pub(crate) const PREEXISTING_SNAPSHOT_ID: SnapshotId = 1;

#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StateObjectId(u64);

impl StateObjectId {
    fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        Self(NEXT.fetch_add(1, Ordering::Relaxed))
    }

    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Debug for StateObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "state#{}", self.0)
    }
}

#[inline]
pub(crate) fn is_valid(candidate: SnapshotId, id: SnapshotId, invalid: &SnapshotIdSet) -> bool {
    candidate <= id && !invalid.get(candidate)
}

/// What a committing snapshot sees when it checks one of its writes.
#[doc(hidden)]
pub struct ApplyView<'a> {
    /// Id of the committing snapshot.
    pub snapshot_id: SnapshotId,
    /// Invalid set of the committing snapshot; resolves its own write.
    pub applied_invalid: &'a SnapshotIdSet,
    /// Invalid set with the snapshot's own ids added; resolves the value it started from.
    pub base_invalid: &'a SnapshotIdSet,
    /// View of the newest committed state the write lands on.
    pub current_id: SnapshotId,
    pub current_invalid: &'a SnapshotIdSet,
    pub mode: ConflictMode,
}

#[doc(hidden)]
pub enum ApplyOutcome {
    Clean,
    /// Record this value under a fresh id so it becomes the newest.
    Merge(Box<dyn Any + Send>),
    Conflict,
}

/// Type-erased view of a state cell used by the snapshot system.
pub trait StateObject: Send + Sync + 'static {
    fn object_id(&self) -> StateObjectId;

    /// Id of the record visible to `(id, invalid)`, if any.
    fn readable_record_id(&self, id: SnapshotId, invalid: &SnapshotIdSet) -> Option<SnapshotId>;

    /// Revision of the record visible to `(id, invalid)`. Changes on every
    /// write, including in-place writes that keep the record id.
    fn readable_revision(&self, id: SnapshotId, invalid: &SnapshotIdSet) -> Option<u64>;

    #[doc(hidden)]
    fn prepare_apply(&self, view: &ApplyView<'_>) -> ApplyOutcome;

    #[doc(hidden)]
    fn commit_merge(&self, id: SnapshotId, value: Box<dyn Any + Send>);

    /// Drop records written by the given (abandoned) snapshot ids.
    #[doc(hidden)]
    fn discard_records(&self, ids: &SnapshotIdSet);

    /// Drop records below `reuse_limit` that are obscured by a newer one.
    #[doc(hidden)]
    fn prune_records(&self, reuse_limit: SnapshotId);

    #[doc(hidden)]
    fn record_count(&self) -> usize;
}

/// Decides when two values count as the same and how concurrent writes merge.
pub trait MutationPolicy<T>: Send + Sync {
    fn equivalent(&self, a: &T, b: &T) -> bool;

    /// Merge a conflicting commit. `previous` is the value the committing
    /// snapshot started from, `current` the value committed meanwhile and
    /// `applied` the committing snapshot's own value.
    fn merge(&self, _previous: &T, _current: &T, _applied: &T) -> Option<T> {
        None
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct StructuralEqualityPolicy;

impl<T: PartialEq> MutationPolicy<T> for StructuralEqualityPolicy {
    fn equivalent(&self, a: &T, b: &T) -> bool {
        a == b
    }
}

/// Compares shared values by identity.
#[derive(Debug, Default, Clone, Copy)]
pub struct ReferentialEqualityPolicy;

impl<U: ?Sized + Send + Sync> MutationPolicy<Arc<U>> for ReferentialEqualityPolicy {
    fn equivalent(&self, a: &Arc<U>, b: &Arc<U>) -> bool {
        Arc::ptr_eq(a, b)
    }
}

/// Every write counts as a change.
#[derive(Debug, Default, Clone, Copy)]
pub struct NeverEqualPolicy;

impl<T> MutationPolicy<T> for NeverEqualPolicy {
    fn equivalent(&self, _a: &T, _b: &T) -> bool {
        false
    }
}

type MergeFn<T> = dyn Fn(&T, &T, &T) -> Option<T> + Send + Sync;

/// Structural equality plus a caller supplied three-way merge.
pub struct MergingPolicy<T> {
    merge: Box<MergeFn<T>>,
}

impl<T> MergingPolicy<T> {
    pub fn new(merge: impl Fn(&T, &T, &T) -> Option<T> + Send + Sync + 'static) -> Self {
        Self {
            merge: Box::new(merge),
        }
    }
}

impl<T: PartialEq> MutationPolicy<T> for MergingPolicy<T> {
    fn equivalent(&self, a: &T, b: &T) -> bool {
        a == b
    }

    fn merge(&self, previous: &T, current: &T, applied: &T) -> Option<T> {
        (self.merge)(previous, current, applied)
    }
}

struct StateRecord<T> {
    snapshot_id: SnapshotId,
    revision: u64,
    value: T,
}

fn next_revision() -> u64 {
    static NEXT: AtomicU64 = AtomicU64::new(1);
    NEXT.fetch_add(1, Ordering::Relaxed)
}

fn readable_index<T>(
    records: &[StateRecord<T>],
    id: SnapshotId,
    invalid: &SnapshotIdSet,
) -> Option<usize> {
    // Records are sorted newest first, so the first valid one wins.
    records
        .iter()
        .position(|record| is_valid(record.snapshot_id, id, invalid))
}

fn insert_record<T>(records: &mut Vec<StateRecord<T>>, snapshot_id: SnapshotId, value: T) {
    let index = records.partition_point(|record| record.snapshot_id > snapshot_id);
    if records
        .get(index)
        .is_some_and(|record| record.snapshot_id == snapshot_id)
    {
        records[index].value = value;
        records[index].revision = next_revision();
    } else {
        records.insert(
            index,
            StateRecord {
                snapshot_id,
                revision: next_revision(),
                value,
            },
        );
    }
}

pub(crate) enum WriteOutcome {
    Unchanged,
    Written,
}

pub(crate) struct StateCell<T> {
    id: StateObjectId,
    records: RwLock<Vec<StateRecord<T>>>,
    policy: Box<dyn MutationPolicy<T>>,
}

impl<T: Send + Sync + 'static> StateCell<T> {
    fn new(value: T, policy: Box<dyn MutationPolicy<T>>) -> Self {
        Self {
            id: StateObjectId::next(),
            records: RwLock::new(vec![StateRecord {
                snapshot_id: PREEXISTING_SNAPSHOT_ID,
                revision: next_revision(),
                value,
            }]),
            policy,
        }
    }

    fn read_records(&self) -> RwLockReadGuard<'_, Vec<StateRecord<T>>> {
        self.records.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write_records(&self) -> RwLockWriteGuard<'_, Vec<StateRecord<T>>> {
        self.records.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn with_readable<R>(
        &self,
        id: SnapshotId,
        invalid: &SnapshotIdSet,
        f: impl FnOnce(&T) -> R,
    ) -> R {
        let records = self.read_records();
        let index = readable_index(&records, id, invalid).unwrap_or_else(|| {
            panic!(
                "{:?} has no record readable in snapshot {id} (invalid {invalid:?})",
                self.id
            )
        });
        f(&records[index].value)
    }

    pub(crate) fn write(&self, id: SnapshotId, invalid: &SnapshotIdSet, value: T) -> WriteOutcome {
        let mut records = self.write_records();
        if let Some(index) = readable_index(&records, id, invalid) {
            if self.policy.equivalent(&records[index].value, &value) {
                return WriteOutcome::Unchanged;
            }
            if records[index].snapshot_id == id {
                records[index].value = value;
                records[index].revision = next_revision();
                return WriteOutcome::Written;
            }
        }
        insert_record(&mut records, id, value);
        WriteOutcome::Written
    }
}

impl<T: Clone + Send + Sync + 'static> StateObject for StateCell<T> {
    fn object_id(&self) -> StateObjectId {
        self.id
    }

    fn readable_record_id(&self, id: SnapshotId, invalid: &SnapshotIdSet) -> Option<SnapshotId> {
        let records = self.read_records();
        readable_index(&records, id, invalid).map(|index| records[index].snapshot_id)
    }

    fn readable_revision(&self, id: SnapshotId, invalid: &SnapshotIdSet) -> Option<u64> {
        let records = self.read_records();
        readable_index(&records, id, invalid).map(|index| records[index].revision)
    }

    fn prepare_apply(&self, view: &ApplyView<'_>) -> ApplyOutcome {
        let records = self.read_records();
        let current = readable_index(&records, view.current_id, view.current_invalid);
        let previous = readable_index(&records, view.snapshot_id, view.base_invalid);
        let (Some(current), Some(previous)) = (current, previous) else {
            return ApplyOutcome::Clean;
        };
        if records[current].snapshot_id == records[previous].snapshot_id {
            return ApplyOutcome::Clean;
        }
        let Some(applied) = readable_index(&records, view.snapshot_id, view.applied_invalid) else {
            return ApplyOutcome::Clean;
        };
        let current = &records[current].value;
        let applied = &records[applied].value;
        if self.policy.equivalent(current, applied) {
            return ApplyOutcome::Clean;
        }
        match self.policy.merge(&records[previous].value, current, applied) {
            Some(merged) => ApplyOutcome::Merge(Box::new(merged)),
            None => match view.mode {
                ConflictMode::LastWriterWins => ApplyOutcome::Merge(Box::new(applied.clone())),
                ConflictMode::Strict => ApplyOutcome::Conflict,
            },
        }
    }

    fn commit_merge(&self, id: SnapshotId, value: Box<dyn Any + Send>) {
        match value.downcast::<T>() {
            Ok(value) => insert_record(&mut self.write_records(), id, *value),
            Err(_) => panic!("merged value for {:?} has the wrong type", self.id),
        }
    }

    fn discard_records(&self, ids: &SnapshotIdSet) {
        let mut records = self.write_records();
        if records.len() > 1 {
            records.retain(|record| !ids.get(record.snapshot_id));
        }
    }

    fn prune_records(&self, reuse_limit: SnapshotId) {
        let mut records = self.write_records();
        let mut kept_below = false;
        records.retain(|record| {
            if record.snapshot_id >= reuse_limit {
                true
            } else if !kept_below {
                kept_below = true;
                true
            } else {
                false
            }
        });
    }

    fn record_count(&self) -> usize {
        self.read_records().len()
    }
}

/// Handle to an observable, snapshot-isolated value.
///
/// Reads inside a composition register the calling scope as a dependent.
/// Writes land in the current snapshot and become visible to others when it
/// is applied; writes outside any snapshot go to the global snapshot.
pub struct MutableState<T> {
    cell: Arc<StateCell<T>>,
}

impl<T> Clone for MutableState<T> {
    fn clone(&self) -> Self {
        Self {
            cell: Arc::clone(&self.cell),
        }
    }
}

impl<T> PartialEq for MutableState<T> {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.cell, &other.cell)
    }
}

impl<T> Eq for MutableState<T> {}

impl<T: Clone + Send + Sync + 'static> MutableState<T> {
    pub fn with_policy(value: T, policy: impl MutationPolicy<T> + 'static) -> Self {
        Self {
            cell: Arc::new(StateCell::new(value, Box::new(policy))),
        }
    }

    pub fn id(&self) -> StateObjectId {
        self.cell.id
    }

    pub fn as_state_object(&self) -> Arc<dyn StateObject> {
        self.cell.clone()
    }

    pub fn with<R>(&self, f: impl FnOnce(&T) -> R) -> R {
        snapshot::notify_read(&self.as_state_object());
        self.with_untracked(f)
    }

    /// Read without reporting a dependency to the current observers.
    pub fn with_untracked<R>(&self, f: impl FnOnce(&T) -> R) -> R {
        snapshot::with_read_view(|id, invalid| self.cell.with_readable(id, invalid, f))
    }

    pub fn get(&self) -> T {
        self.with(T::clone)
    }

    pub fn get_untracked(&self) -> T {
        self.with_untracked(T::clone)
    }

    /// Write `value` into the current snapshot.
    ///
    /// # Panics
    /// Panics when the current snapshot is read-only or already closed; use
    /// [`MutableState::try_set`] to handle those cases.
    pub fn set(&self, value: T) {
        if let Err(err) = self.try_set(value) {
            panic!("failed to write {:?}: {err}", self.cell.id);
        }
    }

    pub fn try_set(&self, value: T) -> Result<(), SnapshotError> {
        let object = self.as_state_object();
        snapshot::write_state(&object, |id, invalid| self.cell.write(id, invalid, value))
    }

    /// Replace the value, returning the previous one.
    pub fn replace(&self, value: T) -> T {
        let previous = self.get_untracked();
        self.set(value);
        previous
    }

    /// Mutate a copy of the current value and write it back.
    pub fn update<R>(&self, f: impl FnOnce(&mut T) -> R) -> R {
        let mut value = self.get_untracked();
        let result = f(&mut value);
        self.set(value);
        result
    }

    #[doc(hidden)]
    pub fn record_count(&self) -> usize {
        self.cell.record_count()
    }
}

impl<T: Clone + Send + Sync + fmt::Debug + 'static> fmt::Debug for MutableState<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MutableState")
            .field("id", &self.cell.id)
            .field("value", &self.get_untracked())
            .finish()
    }
}

/// Create state compared by structural equality.
pub fn mutable_state_of<T>(value: T) -> MutableState<T>
where
    T: Clone + PartialEq + Send + Sync + 'static,
{
    MutableState::with_policy(value, StructuralEqualityPolicy)
}

pub fn mutable_state_with_policy<T>(
    value: T,
    policy: impl MutationPolicy<T> + 'static,
) -> MutableState<T>
where
    T: Clone + Send + Sync + 'static,
{
    MutableState::with_policy(value, policy)
}

struct DerivedCache<T> {
    value: T,
    dependencies: Vec<(Arc<dyn StateObject>, Option<u64>)>,
}

struct DerivedInner<T> {
    compute: Box<dyn Fn() -> T + Send + Sync>,
    cache: Mutex<Option<DerivedCache<T>>>,
}

/// A value computed from other state and cached until one of its inputs changes.
///
/// Readers depend on the inputs the last computation read, so a composition
/// reading a derived value is invalidated exactly when those inputs change.
pub struct DerivedState<T> {
    inner: Arc<DerivedInner<T>>,
}

impl<T> Clone for DerivedState<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: Clone + Send + Sync + 'static> DerivedState<T> {
    pub fn get(&self) -> T {
        let cached = snapshot::with_read_view(|id, invalid| {
            let cache = self
                .inner
                .cache
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            let cache = cache.as_ref()?;
            let fresh = cache
                .dependencies
                .iter()
                .all(|(object, revision)| object.readable_revision(id, invalid) == *revision);
            fresh.then(|| {
                let dependencies: Vec<_> = cache
                    .dependencies
                    .iter()
                    .map(|(object, _)| Arc::clone(object))
                    .collect();
                (cache.value.clone(), dependencies)
            })
        });
        if let Some((value, dependencies)) = cached {
            for dependency in &dependencies {
                snapshot::notify_read(dependency);
            }
            return value;
        }
        self.recompute()
    }

    fn recompute(&self) -> T {
        let reads: Arc<Mutex<Vec<Arc<dyn StateObject>>>> = Arc::default();
        let collector = Arc::clone(&reads);
        let value = snapshot::observe_reads(
            std::rc::Rc::new(move |object: &Arc<dyn StateObject>| {
                let mut reads = collector.lock().unwrap_or_else(PoisonError::into_inner);
                if !reads
                    .iter()
                    .any(|seen| seen.object_id() == object.object_id())
                {
                    reads.push(Arc::clone(object));
                }
            }),
            || (self.inner.compute)(),
        );
        let reads = std::mem::take(&mut *reads.lock().unwrap_or_else(PoisonError::into_inner));
        let dependencies = snapshot::with_read_view(|id, invalid| {
            reads
                .into_iter()
                .map(|object| {
                    let revision = object.readable_revision(id, invalid);
                    (object, revision)
                })
                .collect()
        });
        *self
            .inner
            .cache
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(DerivedCache {
            value: value.clone(),
            dependencies,
        });
        value
    }
}

pub fn derived_state_of<T>(compute: impl Fn() -> T + Send + Sync + 'static) -> DerivedState<T>
where
    T: Clone + Send + Sync + 'static,
{
    DerivedState {
        inner: Arc::new(DerivedInner {
            compute: Box::new(compute),
            cache: Mutex::new(None),
        }),
    }
}

#[cfg(test)]
#[path = "tests/state_tests.rs"]
mod tests;

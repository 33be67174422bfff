//! Multi-version snapshot isolation for observable state.
//!
//! # Snapshot kinds
//!
//! - **Global**: the implicit snapshot that is current when nothing else is
//!   entered. Its writes become visible to new snapshots when it advances,
//!   which happens on every snapshot creation, every root apply and on
//!   [`send_apply_notifications`].
//! - [`ReadonlySnapshot`]: a frozen view. Nested readonly snapshots share
//!   their parent's view.
//! - [`MutableSnapshot`]: buffers writes until [`MutableSnapshot::apply`].
//!   Nested mutable snapshots apply into their parent instead of globally.
//!
//! The current snapshot is tracked per thread. Snapshot handles are `Rc` based
//! and stay on the thread that created them; the state cells they read and
//! write are shared across threads.

use std::cell::{Cell, RefCell};
use std::rc::Rc;
use std::sync::Arc;

use crate::error::SnapshotError;
use crate::state::{StateObject, WriteOutcome};

mod id_set;
mod mutable;
mod readonly;
mod runtime;

pub use id_set::{SnapshotId, SnapshotIdSet};
pub use mutable::MutableSnapshot;
pub use readonly::ReadonlySnapshot;

pub(crate) use runtime::with_runtime;

/// Called with every state object read while the snapshot is current.
pub type ReadObserver = Rc<dyn Fn(&Arc<dyn StateObject>)>;

/// Called with every state object written while the snapshot is current.
pub type WriteObserver = Rc<dyn Fn(&Arc<dyn StateObject>)>;

/// Called after a snapshot applies, with the objects it changed.
///
/// Runs on the applying thread after the runtime lock is released.
/// Implementations should enqueue work rather than recompose inline.
pub type ApplyObserver = Arc<dyn Fn(&[Arc<dyn StateObject>], SnapshotId) + Send + Sync>;

/// Called the first time an object is written in the global snapshot between
/// two advances.
pub type GlobalWriteObserver = Arc<dyn Fn(&Arc<dyn StateObject>) + Send + Sync>;

/// How an apply resolves a cell that another snapshot committed meanwhile.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConflictMode {
    /// The committing snapshot's value becomes the newest.
    #[default]
    LastWriterWins,
    /// The apply fails with [`SnapshotError::Conflict`] and may be retried.
    Strict,
}

/// Any non-global snapshot.
#[derive(Clone)]
pub enum AnySnapshot {
    Readonly(ReadonlySnapshot),
    Mutable(MutableSnapshot),
}

impl AnySnapshot {
    pub fn snapshot_id(&self) -> SnapshotId {
        match self {
            AnySnapshot::Readonly(snapshot) => snapshot.snapshot_id(),
            AnySnapshot::Mutable(snapshot) => snapshot.snapshot_id(),
        }
    }

    pub fn is_read_only(&self) -> bool {
        matches!(self, AnySnapshot::Readonly(_))
    }

    fn read_observer(&self) -> Option<ReadObserver> {
        match self {
            AnySnapshot::Readonly(snapshot) => snapshot.read_observer(),
            AnySnapshot::Mutable(snapshot) => snapshot.read_observer(),
        }
    }
}

thread_local! {
    static CURRENT_SNAPSHOT: RefCell<Option<AnySnapshot>> = const { RefCell::new(None) };
    static OBSERVER_STACK: RefCell<Vec<ReadObserver>> = const { RefCell::new(Vec::new()) };
    static READS_SUPPRESSED: Cell<usize> = const { Cell::new(0) };
}

/// Restores the previously current snapshot on drop.
pub(crate) struct EnterGuard {
    previous: Option<AnySnapshot>,
}

impl Drop for EnterGuard {
    fn drop(&mut self) {
        let previous = self.previous.take();
        CURRENT_SNAPSHOT.with(|current| *current.borrow_mut() = previous);
    }
}

pub(crate) fn enter_snapshot(snapshot: AnySnapshot) -> EnterGuard {
    let previous = CURRENT_SNAPSHOT.with(|current| current.borrow_mut().replace(snapshot));
    EnterGuard { previous }
}

/// The snapshot current on this thread, or `None` for the global snapshot.
pub fn current_snapshot() -> Option<AnySnapshot> {
    CURRENT_SNAPSHOT.with(|current| current.borrow().clone())
}

pub fn current_snapshot_id() -> SnapshotId {
    match current_snapshot() {
        Some(snapshot) => snapshot.snapshot_id(),
        None => with_runtime(|runtime| runtime.global_id()),
    }
}

/// Resolve the `(id, invalid)` view of the current snapshot.
pub(crate) fn with_read_view<R>(f: impl FnOnce(SnapshotId, &SnapshotIdSet) -> R) -> R {
    match current_snapshot() {
        Some(AnySnapshot::Readonly(snapshot)) => snapshot.with_view(f),
        Some(AnySnapshot::Mutable(snapshot)) => snapshot.with_view(f),
        None => {
            let (id, invalid) = with_runtime(|runtime| runtime.global_view());
            f(id, &invalid)
        }
    }
}

/// Report a read to the current snapshot's observer and every observer
/// installed with [`observe_reads`].
pub(crate) fn notify_read(object: &Arc<dyn StateObject>) {
    if READS_SUPPRESSED.with(Cell::get) > 0 {
        return;
    }
    let mut observers: Vec<ReadObserver> = OBSERVER_STACK.with(|stack| stack.borrow().clone());
    if let Some(observer) = current_snapshot().and_then(|snapshot| snapshot.read_observer()) {
        observers.push(observer);
    }
    for observer in observers {
        observer(object);
    }
}

pub(crate) fn write_state(
    object: &Arc<dyn StateObject>,
    write: impl FnOnce(SnapshotId, &SnapshotIdSet) -> WriteOutcome,
) -> Result<(), SnapshotError> {
    match current_snapshot() {
        Some(AnySnapshot::Readonly(_)) => Err(SnapshotError::ReadOnly),
        Some(AnySnapshot::Mutable(snapshot)) => snapshot.write(object, write),
        None => {
            let first_write = with_runtime(|runtime| {
                let (id, invalid) = runtime.global_view();
                match write(id, &invalid) {
                    WriteOutcome::Unchanged => None,
                    WriteOutcome::Written => Some(runtime.record_global_write(object)),
                }
            });
            if first_write == Some(true) {
                let observers = with_runtime(|runtime| runtime.global_write_observers());
                for observer in observers {
                    observer(object);
                }
            }
            Ok(())
        }
    }
}

/// Run `block` with `observer` receiving every state read on this thread,
/// in addition to the current snapshot's own observer.
pub fn observe_reads<R>(observer: ReadObserver, block: impl FnOnce() -> R) -> R {
    struct PopGuard;
    impl Drop for PopGuard {
        fn drop(&mut self) {
            OBSERVER_STACK.with(|stack| {
                stack.borrow_mut().pop();
            });
        }
    }
    OBSERVER_STACK.with(|stack| stack.borrow_mut().push(observer));
    let _guard = PopGuard;
    block()
}

/// Run `block` without reporting reads to any observer.
pub fn without_read_observation<R>(block: impl FnOnce() -> R) -> R {
    struct RestoreGuard;
    impl Drop for RestoreGuard {
        fn drop(&mut self) {
            READS_SUPPRESSED.with(|depth| depth.set(depth.get() - 1));
        }
    }
    READS_SUPPRESSED.with(|depth| depth.set(depth.get() + 1));
    let _guard = RestoreGuard;
    block()
}

/// Take a read-only snapshot of the current state.
///
/// Nested inside the current snapshot when one is entered.
pub fn take_snapshot(read_observer: Option<ReadObserver>) -> ReadonlySnapshot {
    match current_snapshot() {
        Some(AnySnapshot::Readonly(parent)) => parent.take_nested_snapshot(read_observer),
        Some(AnySnapshot::Mutable(parent)) => parent
            .take_nested_snapshot(read_observer)
            .unwrap_or_else(|err| panic!("cannot take a snapshot of a closed snapshot: {err}")),
        None => ReadonlySnapshot::new_root(read_observer),
    }
}

/// Take a mutable snapshot using the process default [`ConflictMode`].
///
/// Nested inside the current mutable snapshot when one is entered.
pub fn take_mutable_snapshot(
    read_observer: Option<ReadObserver>,
    write_observer: Option<WriteObserver>,
) -> Result<MutableSnapshot, SnapshotError> {
    take_mutable_snapshot_with_mode(read_observer, write_observer, default_conflict_mode())
}

pub fn take_mutable_snapshot_with_mode(
    read_observer: Option<ReadObserver>,
    write_observer: Option<WriteObserver>,
    mode: ConflictMode,
) -> Result<MutableSnapshot, SnapshotError> {
    match current_snapshot() {
        Some(AnySnapshot::Readonly(_)) => Err(SnapshotError::ReadOnly),
        Some(AnySnapshot::Mutable(parent)) => {
            parent.take_nested_mutable_snapshot_with_mode(read_observer, write_observer, mode)
        }
        None => Ok(MutableSnapshot::new_root(read_observer, write_observer, mode)),
    }
}

/// Run `block` in a fresh mutable snapshot and apply it.
///
/// The snapshot is disposed when the apply fails, so a conflicting block can
/// simply be retried.
pub fn with_mutable_snapshot<R>(block: impl FnOnce() -> R) -> Result<R, SnapshotError> {
    let snapshot = take_mutable_snapshot(None, None)?;
    let result = snapshot.enter(block);
    match snapshot.apply() {
        Ok(()) => Ok(result),
        Err(err) => {
            snapshot.dispose();
            Err(err)
        }
    }
}

/// Advance the global snapshot and deliver its pending writes to apply
/// observers. Returns whether anything was delivered.
pub fn send_apply_notifications() -> bool {
    let (observers, changes) = with_runtime(|runtime| {
        if !runtime.has_pending_global_changes() {
            return (Vec::new(), None);
        }
        let changes = runtime.advance_global();
        (runtime.apply_observers(), changes)
    });
    let delivered = changes.is_some();
    runtime::notify_global_changes(&observers, changes);
    delivered
}

pub fn has_pending_global_changes() -> bool {
    with_runtime(|runtime| runtime.has_pending_global_changes())
}

/// Unregisters its observer when dropped.
#[must_use = "the observer is unregistered when the handle is dropped"]
pub struct ObserverHandle {
    id: u64,
    kind: ObserverKind,
}

enum ObserverKind {
    Apply,
    GlobalWrite,
}

impl ObserverHandle {
    pub fn dispose(self) {}
}

impl Drop for ObserverHandle {
    fn drop(&mut self) {
        let id = self.id;
        match self.kind {
            ObserverKind::Apply => with_runtime(|runtime| runtime.unregister_apply_observer(id)),
            ObserverKind::GlobalWrite => {
                with_runtime(|runtime| runtime.unregister_global_write_observer(id))
            }
        }
    }
}

pub fn register_apply_observer(
    observer: impl Fn(&[Arc<dyn StateObject>], SnapshotId) + Send + Sync + 'static,
) -> ObserverHandle {
    let id = with_runtime(|runtime| runtime.register_apply_observer(Arc::new(observer)));
    ObserverHandle {
        id,
        kind: ObserverKind::Apply,
    }
}

pub fn register_global_write_observer(
    observer: impl Fn(&Arc<dyn StateObject>) + Send + Sync + 'static,
) -> ObserverHandle {
    let id = with_runtime(|runtime| runtime.register_global_write_observer(Arc::new(observer)));
    ObserverHandle {
        id,
        kind: ObserverKind::GlobalWrite,
    }
}

pub fn default_conflict_mode() -> ConflictMode {
    with_runtime(|runtime| runtime.default_conflict_mode())
}

/// Set the conflict mode used by snapshots that do not pick one.
pub fn set_default_conflict_mode(mode: ConflictMode) {
    with_runtime(|runtime| runtime.set_default_conflict_mode(mode));
}

pub(crate) fn merge_read_observers(
    parent: Option<ReadObserver>,
    child: Option<ReadObserver>,
) -> Option<ReadObserver> {
    match (parent, child) {
        (Some(parent), Some(child)) => Some(Rc::new(move |object: &Arc<dyn StateObject>| {
            child(object);
            parent(object);
        })),
        (parent, None) => parent,
        (None, child) => child,
    }
}

#[cfg(test)]
#[path = "tests/snapshot_tests.rs"]
mod tests;

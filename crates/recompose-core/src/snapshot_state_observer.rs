//! Tracks which state objects each scope read and maps applied changes back
//! to the scopes that depend on them.

use crate::collections::map::{HashMap, HashSet};
use crate::snapshot::{self, ObserverHandle, ReadObserver};
use crate::state::{StateObject, StateObjectId};
use smallvec::SmallVec;
use std::cell::{Cell, RefCell};
use std::hash::Hash;
use std::rc::Rc;
use std::sync::{Arc, Mutex, PoisonError};

/// Bidirectional scope ↔ state object index.
///
/// A scope's read set is replaced wholesale each time it runs, so stale
/// dependencies from an earlier execution never cause invalidations.
pub struct ReadIndex<K> {
    reads_by_scope: HashMap<K, HashSet<StateObjectId>>,
    scopes_by_object: HashMap<StateObjectId, HashSet<K>>,
}

impl<K> Default for ReadIndex<K> {
    fn default() -> Self {
        Self {
            reads_by_scope: HashMap::default(),
            scopes_by_object: HashMap::default(),
        }
    }
}

impl<K: Copy + Eq + Hash> ReadIndex<K> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, scope: K, object: StateObjectId) {
        if self.reads_by_scope.entry(scope).or_default().insert(object) {
            self.scopes_by_object.entry(object).or_default().insert(scope);
        }
    }

    /// Forget everything `scope` read.
    pub fn clear(&mut self, scope: K) {
        let Some(objects) = self.reads_by_scope.remove(&scope) else {
            return;
        };
        for object in objects {
            if let Some(scopes) = self.scopes_by_object.get_mut(&object) {
                scopes.remove(&scope);
                if scopes.is_empty() {
                    self.scopes_by_object.remove(&object);
                }
            }
        }
    }

    pub fn clear_all(&mut self) {
        self.reads_by_scope.clear();
        self.scopes_by_object.clear();
    }

    /// Scopes that read any of `objects`, each reported once.
    pub fn scopes_reading(&self, objects: impl IntoIterator<Item = StateObjectId>) -> Vec<K> {
        let mut seen = HashSet::default();
        let mut scopes = Vec::new();
        for object in objects {
            if let Some(readers) = self.scopes_by_object.get(&object) {
                for &scope in readers {
                    if seen.insert(scope) {
                        scopes.push(scope);
                    }
                }
            }
        }
        scopes
    }

    pub fn reads_of(&self, scope: K) -> usize {
        self.reads_by_scope.get(&scope).map_or(0, |reads| reads.len())
    }

    pub fn is_observed(&self, object: StateObjectId) -> bool {
        self.scopes_by_object.contains_key(&object)
    }

    pub fn scope_count(&self) -> usize {
        self.reads_by_scope.len()
    }
}

type ChangedCallback<K> = Rc<dyn Fn(&[K])>;
type Inbox = Arc<Mutex<Vec<StateObjectId>>>;

/// Records reads performed inside [`observe_reads`](Self::observe_reads)
/// and reports the affected scopes when snapshots apply.
///
/// Apply notifications may arrive on any thread; they are queued and only
/// delivered to `on_changed` from [`flush`](Self::flush) on the owning thread.
pub struct SnapshotStateObserver<K> {
    inner: Rc<ObserverInner<K>>,
}

impl<K> Clone for SnapshotStateObserver<K> {
    fn clone(&self) -> Self {
        Self {
            inner: Rc::clone(&self.inner),
        }
    }
}

struct ObserverInner<K> {
    index: RefCell<ReadIndex<K>>,
    on_changed: ChangedCallback<K>,
    inbox: Inbox,
    handle: RefCell<Option<ObserverHandle>>,
    paused: Cell<usize>,
}

impl<K: Copy + Eq + Hash + 'static> SnapshotStateObserver<K> {
    pub fn new(on_changed: impl Fn(&[K]) + 'static) -> Self {
        Self {
            inner: Rc::new(ObserverInner {
                index: RefCell::new(ReadIndex::new()),
                on_changed: Rc::new(on_changed),
                inbox: Arc::default(),
                handle: RefCell::new(None),
                paused: Cell::new(0),
            }),
        }
    }

    /// Run `block`, replacing the recorded reads of `scope` with the ones it makes.
    pub fn observe_reads<R>(&self, scope: K, block: impl FnOnce() -> R) -> R {
        self.inner.index.borrow_mut().clear(scope);
        let weak = Rc::downgrade(&self.inner);
        let observer: ReadObserver = Rc::new(move |object: &Arc<dyn StateObject>| {
            if let Some(inner) = weak.upgrade() {
                if inner.paused.get() == 0 {
                    inner.index.borrow_mut().record(scope, object.object_id());
                }
            }
        });
        snapshot::observe_reads(observer, block)
    }

    pub fn with_no_observations<R>(&self, block: impl FnOnce() -> R) -> R {
        struct Resume<'a>(&'a Cell<usize>);
        impl Drop for Resume<'_> {
            fn drop(&mut self) {
                self.0.set(self.0.get() - 1);
            }
        }
        self.inner.paused.set(self.inner.paused.get() + 1);
        let _resume = Resume(&self.inner.paused);
        block()
    }

    pub fn clear(&self, scope: K) {
        self.inner.index.borrow_mut().clear(scope);
    }

    pub fn clear_all(&self) {
        self.inner.index.borrow_mut().clear_all();
    }

    /// Start listening for applied snapshots.
    pub fn start(&self) {
        if self.inner.handle.borrow().is_some() {
            return;
        }
        let inbox = Arc::clone(&self.inner.inbox);
        let handle = snapshot::register_apply_observer(move |objects, _| {
            let mut inbox = inbox.lock().unwrap_or_else(PoisonError::into_inner);
            inbox.extend(objects.iter().map(|object| object.object_id()));
        });
        self.inner.handle.replace(Some(handle));
    }

    pub fn stop(&self) {
        self.inner.handle.take();
    }

    /// Deliver queued changes. Returns whether any scope was notified.
    pub fn flush(&self) -> bool {
        let changed: SmallVec<[StateObjectId; 8]> = self
            .inner
            .inbox
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
            .collect();
        self.notify_changed(changed)
    }

    /// Report changes to `objects` directly, bypassing the apply observer.
    pub fn notify_changed(&self, objects: impl IntoIterator<Item = StateObjectId>) -> bool {
        let scopes = self.inner.index.borrow().scopes_reading(objects);
        if scopes.is_empty() {
            return false;
        }
        (self.inner.on_changed)(&scopes);
        true
    }

    pub fn reads_of(&self, scope: K) -> usize {
        self.inner.index.borrow().reads_of(scope)
    }
}

#[cfg(test)]
#[path = "tests/snapshot_state_observer_tests.rs"]
mod tests;

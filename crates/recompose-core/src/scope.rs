//! Recompose scopes: re-invocable regions of a composition.

use std::cell::{Cell, RefCell};
use std::fmt;
use std::rc::{Rc, Weak};

use crate::arena::ArenaId;
use crate::composer::Composer;
use crate::gap_buffer::Anchor;
use crate::local::LocalStack;

pub type ScopeId = ArenaId;

type RecomposeCallback = Rc<dyn Fn(&Composer)>;

/// Scopes invalidated since the composition last drained them.
#[derive(Default)]
pub(crate) struct InvalidationQueue {
    pending: RefCell<Vec<ScopeId>>,
    on_invalidate: RefCell<Option<Rc<dyn Fn()>>>,
}

impl InvalidationQueue {
    pub(crate) fn push(&self, id: ScopeId) {
        self.pending.borrow_mut().push(id);
        let notify = self.on_invalidate.borrow().clone();
        if let Some(notify) = notify {
            notify();
        }
    }

    pub(crate) fn take(&self) -> Vec<ScopeId> {
        std::mem::take(&mut *self.pending.borrow_mut())
    }

    pub(crate) fn clear(&self) {
        self.pending.borrow_mut().clear();
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.pending.borrow().is_empty()
    }

    /// Called after every accepted invalidation, typically to request a frame.
    pub(crate) fn set_on_invalidate(&self, notify: impl Fn() + 'static) {
        self.on_invalidate.replace(Some(Rc::new(notify)));
    }
}

pub(crate) struct ScopeInner {
    id: ScopeId,
    invalid: Cell<bool>,
    active: Cell<bool>,
    force_reinsert: Cell<bool>,
    callback: RefCell<Option<RecomposeCallback>>,
    anchor: RefCell<Option<Anchor>>,
    parent: RefCell<Weak<ScopeInner>>,
    locals: RefCell<LocalStack>,
    queue: Weak<InvalidationQueue>,
}

/// Handle to the restartable group a composable body runs in.
///
/// A scope becomes invalid when state it read changes or when
/// [`invalidate`](Self::invalidate) is called; the recomposer then re-runs
/// the body registered with [`set_recompose`](Self::set_recompose) at the
/// scope's own position in the slot table.
#[derive(Clone)]
pub struct RecomposeScope {
    inner: Rc<ScopeInner>,
}

impl PartialEq for RecomposeScope {
    fn eq(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Eq for RecomposeScope {}

impl RecomposeScope {
    pub(crate) fn new(id: ScopeId, queue: Weak<InvalidationQueue>) -> Self {
        Self {
            inner: Rc::new(ScopeInner {
                id,
                invalid: Cell::new(false),
                active: Cell::new(true),
                force_reinsert: Cell::new(false),
                callback: RefCell::new(None),
                anchor: RefCell::new(None),
                parent: RefCell::new(Weak::new()),
                locals: RefCell::new(LocalStack::default()),
                queue,
            }),
        }
    }

    pub fn id(&self) -> ScopeId {
        self.inner.id
    }

    pub fn is_invalid(&self) -> bool {
        self.inner.invalid.get()
    }

    /// False once the scope's group left the composition.
    pub fn is_active(&self) -> bool {
        self.inner.active.get()
    }

    pub fn can_restart(&self) -> bool {
        self.inner.callback.borrow().is_some()
    }

    /// Register the body re-run when this scope is recomposed on its own.
    pub fn set_recompose(&self, callback: impl Fn(&Composer) + 'static) {
        self.inner.callback.replace(Some(Rc::new(callback)));
    }

    pub(crate) fn callback(&self) -> Option<RecomposeCallback> {
        self.inner.callback.borrow().clone()
    }

    /// Request a recomposition of this scope.
    ///
    /// Scopes that cannot restart on their own hand the request to their
    /// parent. This happens when no body was registered or when the scope's
    /// content is scheduled to be re-inserted, which needs the caller's
    /// arguments. The scope itself stays flagged so the parent's re-run does
    /// not skip it.
    pub fn invalidate(&self) {
        let mut target = self.clone();
        loop {
            let restartable = target.can_restart() && !target.inner.force_reinsert.get();
            match target.parent() {
                Some(parent) if !restartable => {
                    if target.is_active() {
                        target.inner.invalid.set(true);
                    }
                    target = parent;
                }
                _ => break,
            }
        }
        target.mark_invalid();
    }

    fn mark_invalid(&self) {
        if !self.is_active() || self.inner.invalid.replace(true) {
            return;
        }
        log::trace!("scope {:?} invalidated", self.inner.id);
        if let Some(queue) = self.inner.queue.upgrade() {
            queue.push(self.inner.id);
        }
    }

    pub(crate) fn mark_valid(&self) {
        self.inner.invalid.set(false);
    }

    pub(crate) fn force_reinsert(&self) -> bool {
        self.inner.force_reinsert.get()
    }

    pub(crate) fn set_force_reinsert(&self, force: bool) {
        self.inner.force_reinsert.set(force);
    }

    pub(crate) fn anchor(&self) -> Option<Anchor> {
        self.inner.anchor.borrow().clone()
    }

    pub(crate) fn set_anchor(&self, anchor: Option<Anchor>) {
        self.inner.anchor.replace(anchor);
    }

    pub fn parent(&self) -> Option<RecomposeScope> {
        self.inner
            .parent
            .borrow()
            .upgrade()
            .map(|inner| RecomposeScope { inner })
    }

    pub(crate) fn set_parent(&self, parent: Option<&RecomposeScope>) {
        let weak = parent.map_or_else(Weak::new, |parent| Rc::downgrade(&parent.inner));
        self.inner.parent.replace(weak);
    }

    pub(crate) fn locals(&self) -> LocalStack {
        self.inner.locals.borrow().clone()
    }

    pub(crate) fn set_locals(&self, locals: LocalStack) {
        self.inner.locals.replace(locals);
    }

    /// The scope's group was removed; it never runs again.
    pub(crate) fn release(&self) {
        self.inner.active.set(false);
        self.inner.invalid.set(false);
        self.inner.callback.replace(None);
        self.inner.anchor.replace(None);
        self.inner.locals.replace(LocalStack::default());
    }
}

impl fmt::Debug for RecomposeScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RecomposeScope")
            .field("id", &self.inner.id)
            .field("invalid", &self.inner.invalid.get())
            .field("active", &self.inner.active.get())
            .finish()
    }
}

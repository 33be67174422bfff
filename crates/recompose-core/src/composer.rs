//! The composer: the cursor through which composable functions read and
//! write the slot table.
//!
//! A [`Composer`] belongs to one composition and lives as long as it. Its
//! editing state is transient per pass: the slot table cursor and frame
//! stack, the pending [`EditLog`], the scope stack and the provided locals.
//! Every method takes `&self`; internal borrows are released before any
//! caller-supplied closure runs, so composables may call back into the
//! composer freely.

use std::any::type_name;
use std::cell::{Cell, RefCell, RefMut};
use std::hash::Hash;
use std::marker::PhantomData;
use std::panic::Location;
use std::rc::Rc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use smallvec::SmallVec;

use crate::arena::GenerationalArena;
use crate::changes::{EditLog, Node, ROOT_NODE_ID};
use crate::error::{ComposeError, NodeError};
use crate::local::{CompositionLocal, LocalStack, LocalStateEntry, ProvidedValue};
use crate::owned::Owned;
use crate::remember::RememberObserver;
use crate::runtime::SchedulerContext;
use crate::scope::{InvalidationQueue, RecomposeScope, ScopeId};
use crate::slot_table::{
    CheckpointToken, GroupFlags, GroupStart, Primitive, RememberedObject, SlotTable, SlotValue,
};
use crate::snapshot::ReadObserver;
use crate::snapshot_state_observer::ReadIndex;
use crate::state::{StateObject, StateObjectId};
use crate::{hash_key, location_key, Key, NodeId};

const PROVIDER_KEY: Key = 0x6c6f_6361_6c73;

struct ScopeFrame {
    scope: RecomposeScope,
    reads: SmallVec<[StateObjectId; 8]>,
    executed: bool,
}

pub(crate) struct ComposerCore {
    table: RefCell<SlotTable>,
    log: RefCell<EditLog>,
    scopes: RefCell<GenerationalArena<RecomposeScope>>,
    scope_stack: RefCell<Vec<ScopeFrame>>,
    reads: RefCell<ReadIndex<ScopeId>>,
    queue: Rc<InvalidationQueue>,
    locals: RefCell<LocalStack>,
    side_effects: RefCell<Vec<Box<dyn FnOnce()>>>,
    next_node_id: Cell<NodeId>,
    context: SchedulerContext,
    cancelled: Arc<AtomicBool>,
}

#[derive(Clone)]
pub struct Composer {
    core: Rc<ComposerCore>,
}

impl Composer {
    pub(crate) fn new(context: SchedulerContext) -> Self {
        let queue = Rc::new(InvalidationQueue::default());
        let handle = context.handle();
        queue.set_on_invalidate(move || handle.request_frame());
        Self {
            core: Rc::new(ComposerCore {
                table: RefCell::new(SlotTable::new()),
                log: RefCell::new(EditLog::default()),
                scopes: RefCell::new(GenerationalArena::new()),
                scope_stack: RefCell::new(Vec::new()),
                reads: RefCell::new(ReadIndex::new()),
                queue,
                locals: RefCell::new(LocalStack::new()),
                side_effects: RefCell::new(Vec::new()),
                next_node_id: Cell::new(ROOT_NODE_ID + 1),
                cancelled: context.cancel_flag(),
                context,
            }),
        }
    }

    pub(crate) fn from_core(core: Rc<ComposerCore>) -> Self {
        Self { core }
    }

    pub(crate) fn clone_core(&self) -> Rc<ComposerCore> {
        Rc::clone(&self.core)
    }

    fn edit<R>(&self, f: impl FnOnce(&mut SlotTable, &mut EditLog) -> R) -> R {
        let mut table = self.core.table.borrow_mut();
        let mut log = self.core.log.borrow_mut();
        f(&mut table, &mut log)
    }

    fn scope_stack(&self) -> RefMut<'_, Vec<ScopeFrame>> {
        self.core.scope_stack.borrow_mut()
    }

    pub fn context(&self) -> &SchedulerContext {
        &self.core.context
    }

    pub fn is_cancelled(&self) -> bool {
        self.core.cancelled.load(Ordering::SeqCst)
    }

    /// Whether the innermost group is being inserted rather than reused.
    pub fn inserting(&self) -> bool {
        self.core.table.borrow().is_inserting()
    }

    /// The node content is currently emitted into.
    pub fn current_node(&self) -> Option<NodeId> {
        self.core.table.borrow().current_node()
    }

    /// Records every state read into the innermost running scope.
    pub(crate) fn read_observer(&self) -> ReadObserver {
        let core = Rc::downgrade(&self.core);
        Rc::new(move |object: &Arc<dyn StateObject>| {
            let Some(core) = core.upgrade() else {
                return;
            };
            if let Ok(mut stack) = core.scope_stack.try_borrow_mut() {
                if let Some(frame) = stack.last_mut() {
                    frame.reads.push(object.object_id());
                }
            };
        })
    }

    pub(crate) fn begin_pass(&self) {
        self.core.locals.borrow_mut().clear();
        self.core.table.borrow_mut().begin_pass();
    }

    pub(crate) fn end_pass(&self) {
        self.edit(|table, log| {
            while table.depth() > 1 {
                table.skip_to_group_end();
                table.end_group(log);
            }
            table.skip_to_group_end();
            table.end_pass(log);
        });
    }

    /// Close a pass interrupted by a panic. Returns the innermost scope that
    /// was running.
    pub(crate) fn abort_pass(&self) -> Option<RecomposeScope> {
        let frames = std::mem::take(&mut *self.scope_stack());
        self.core.locals.borrow_mut().clear();
        self.edit(|table, log| table.abort_frames(log));
        frames.last().map(|frame| frame.scope.clone())
    }

    pub(crate) fn take_log(&self) -> EditLog {
        std::mem::take(&mut *self.core.log.borrow_mut())
    }

    pub(crate) fn take_side_effects(&self) -> Vec<Box<dyn FnOnce()>> {
        std::mem::take(&mut *self.core.side_effects.borrow_mut())
    }

    pub(crate) fn dispose_table(&self) {
        self.edit(|table, log| table.dispose(log));
    }

    pub(crate) fn with_table<R>(&self, f: impl FnOnce(&SlotTable) -> R) -> R {
        f(&self.core.table.borrow())
    }

    pub(crate) fn release_scopes(&self, ids: &[ScopeId]) {
        let mut scopes = self.core.scopes.borrow_mut();
        let mut reads = self.core.reads.borrow_mut();
        for &id in ids {
            if let Some(scope) = scopes.remove(id) {
                scope.release();
            }
            reads.clear(id);
        }
    }

    pub(crate) fn release_all_scopes(&self) {
        let scopes = std::mem::take(&mut *self.core.scopes.borrow_mut());
        for (_, scope) in scopes.iter() {
            scope.release();
        }
        self.core.reads.borrow_mut().clear_all();
        self.core.queue.clear();
    }

    pub(crate) fn scope_count(&self) -> usize {
        self.core.scopes.borrow().len()
    }

    /// Invalidate every scope that read one of `objects`. Returns how many
    /// scopes were affected.
    pub(crate) fn invalidate_states(&self, objects: &[StateObjectId]) -> usize {
        let ids = self
            .core
            .reads
            .borrow()
            .scopes_reading(objects.iter().copied());
        let scopes: Vec<RecomposeScope> = {
            let arena = self.core.scopes.borrow();
            ids.iter().filter_map(|&id| arena.get(id).cloned()).collect()
        };
        for scope in &scopes {
            scope.invalidate();
        }
        scopes.len()
    }

    pub(crate) fn has_invalidations(&self) -> bool {
        !self.core.queue.is_empty()
    }

    pub(crate) fn drop_invalidations(&self) {
        for id in self.core.queue.take() {
            if let Some(scope) = self.core.scopes.borrow().get(id) {
                scope.mark_valid();
            }
        }
    }

    /// Recompose every invalid scope in slot table order. Returns the number
    /// of scopes re-run.
    pub(crate) fn recompose_invalid(&self) -> usize {
        let mut pending: Vec<RecomposeScope> = Vec::new();
        let mut ran = 0;
        self.begin_pass();
        loop {
            if self.is_cancelled() {
                log::debug!("recomposition cancelled after {ran} scope(s)");
                break;
            }
            self.collect_invalid(&mut pending);
            let cursor = self.core.table.borrow().cursor();
            let next = self.with_table(|table| {
                pending
                    .iter()
                    .enumerate()
                    .filter_map(|(index, scope)| {
                        let position = table.resolve(&scope.anchor()?)?;
                        (position >= cursor).then_some((position, index))
                    })
                    .min()
            });
            let Some((position, index)) = next else {
                break;
            };
            let scope = pending.swap_remove(index);
            self.seek(position);
            self.run_scope(&scope);
            ran += 1;
        }
        self.end_pass();
        // Invalidated behind the cursor while the pass ran: next round.
        self.collect_invalid(&mut pending);
        for scope in pending {
            self.core.queue.push(scope.id());
        }
        ran
    }

    fn collect_invalid(&self, pending: &mut Vec<RecomposeScope>) {
        let drained = self.core.queue.take();
        let arena = self.core.scopes.borrow();
        for id in drained {
            let Some(scope) = arena.get(id) else {
                continue;
            };
            if !pending.iter().any(|known| known == scope) {
                pending.push(scope.clone());
            }
        }
        pending.retain(|scope| scope.is_active() && scope.is_invalid());
    }

    /// Walk the table from the cursor to `target`, entering only the groups
    /// that contain it.
    fn seek(&self, target: usize) {
        self.edit(|table, log| loop {
            while table.depth() > 1 && target >= table.frame_end() {
                table.skip_to_group_end();
                table.end_group(log);
            }
            let cursor = table.cursor();
            if cursor == target {
                return;
            }
            match table.group_at_cursor().map(|header| header.size) {
                Some(size) if target < cursor + size => {
                    table.enter_group(log);
                }
                Some(_) => table.skip_group(),
                None => table.skip_slot(),
            }
        });
    }

    fn run_scope(&self, scope: &RecomposeScope) {
        let Some(callback) = scope.callback() else {
            return;
        };
        let key = match self.with_table(|table| table.group_at_cursor().map(|header| header.key)) {
            Some(key) => key,
            None => panic!("scope {:?} does not start at the cursor", scope.id()),
        };
        let saved = std::mem::replace(&mut *self.core.locals.borrow_mut(), scope.locals());
        log::trace!("recomposing scope {:?}", scope.id());
        self.start_restartable_group(key);
        if self.should_execute(true) {
            callback(self);
        } else {
            self.skip_current_group();
        }
        self.end_restartable_group();
        *self.core.locals.borrow_mut() = saved;
    }

    /// Open a restartable group and the [`RecomposeScope`] attached to it.
    pub fn start_restartable_group(&self, key: Key) {
        let start = self.edit(|table, log| table.begin_group(key, None, GroupFlags::RESTARTABLE, log));
        let scope = self.scope_for_group(start);
        if let Some(parent) = self.scope_stack().last() {
            scope.set_parent(Some(&parent.scope));
        }
        if scope.force_reinsert() {
            scope.set_force_reinsert(false);
            log::debug!("re-inserting content of scope {:?}", scope.id());
            self.edit(|table, log| table.discard_group_content(log));
        }
        scope.set_locals(self.core.locals.borrow().clone());
        self.scope_stack().push(ScopeFrame {
            scope,
            reads: SmallVec::new(),
            executed: false,
        });
    }

    fn scope_for_group(&self, start: GroupStart) -> RecomposeScope {
        if let Some(scope) = start
            .scope
            .and_then(|id| self.core.scopes.borrow().get(id).cloned())
        {
            return scope;
        }
        let queue = Rc::downgrade(&self.core.queue);
        let scope = {
            let mut scopes = self.core.scopes.borrow_mut();
            let id = scopes.insert_with(|id| RecomposeScope::new(id, queue));
            match scopes.get(id) {
                Some(scope) => scope.clone(),
                None => unreachable!("scope {id:?} was just inserted"),
            }
        };
        self.edit(|table, _| {
            table.set_group_scope(start.index, scope.id());
            scope.set_anchor(table.anchor(start.index));
        });
        scope
    }

    /// Decide whether the body of the current restartable group runs.
    ///
    /// The body is skipped when the group is reused, its scope is valid and
    /// no parameter `changed`. Nothing runs once the recomposer is cancelled.
    pub fn should_execute(&self, changed: bool) -> bool {
        if self.is_cancelled() {
            return false;
        }
        let inserting = self.inserting();
        let mut stack = self.scope_stack();
        let Some(frame) = stack.last_mut() else {
            panic!("should_execute called outside of a restartable group");
        };
        let can_skip = !inserting && !frame.scope.is_invalid();
        let execute = changed || !can_skip;
        if execute {
            frame.executed = true;
            frame.scope.mark_valid();
        }
        execute
    }

    /// Keep the rest of the current group as it is.
    pub fn skip_current_group(&self) {
        self.edit(|table, _| table.skip_to_group_end());
    }

    /// Close the current restartable group. Returns its scope when the body
    /// ran, so the caller can register how to re-run it.
    pub fn end_restartable_group(&self) -> Option<RecomposeScope> {
        let frame = self.scope_stack().pop();
        let Some(frame) = frame else {
            panic!("end_restartable_group without a matching start_restartable_group");
        };
        self.edit(|table, log| table.end_group(log));
        if !frame.executed {
            return None;
        }
        let id = frame.scope.id();
        let mut reads = self.core.reads.borrow_mut();
        reads.clear(id);
        for object in frame.reads {
            reads.record(id, object);
        }
        Some(frame.scope)
    }

    /// Run `body` in a restartable group. Invalidations of the group are
    /// handled by the nearest enclosing scope that can restart.
    pub fn restartable_group<R>(&self, key: Key, body: impl FnOnce(&Composer) -> R) -> R {
        self.start_restartable_group(key);
        if let Some(frame) = self.scope_stack().last_mut() {
            frame.executed = true;
            frame.scope.mark_valid();
        }
        let result = body(self);
        self.end_restartable_group();
        result
    }

    /// Run `body` in a restartable group unless it can be skipped, and keep
    /// it as the scope's recompose callback.
    pub fn restartable(&self, key: Key, params_changed: bool, body: impl Fn(&Composer) + 'static) {
        self.start_restartable_group(key);
        if self.should_execute(params_changed) {
            body(self);
        } else {
            self.skip_current_group();
        }
        if let Some(scope) = self.end_restartable_group() {
            scope.set_recompose(body);
        }
    }

    pub fn group<R>(&self, key: Key, body: impl FnOnce(&Composer) -> R) -> R {
        self.edit(|table, log| table.begin_group(key, None, GroupFlags::PLAIN, log));
        let result = body(self);
        self.edit(|table, log| table.end_group(log));
        result
    }

    /// Run `body` in a movable group identified by `key` among its siblings.
    /// When siblings reorder, the group moves with its remembered state.
    #[track_caller]
    pub fn key<K: Hash + ?Sized, R>(&self, key: &K, body: impl FnOnce(&Composer) -> R) -> R {
        let caller = Location::caller();
        let group_key = location_key(caller.file(), caller.line(), caller.column());
        let object_key = hash_key(key);
        self.edit(|table, log| table.begin_group(group_key, Some(object_key), GroupFlags::PLAIN, log));
        let result = body(self);
        self.edit(|table, log| table.end_group(log));
        result
    }

    /// The scope of the innermost running restartable group.
    pub fn current_scope(&self) -> Option<RecomposeScope> {
        self.core
            .scope_stack
            .borrow()
            .last()
            .map(|frame| frame.scope.clone())
    }

    /// Invalidate the innermost running scope.
    pub fn invalidate(&self) {
        if let Some(scope) = self.current_scope() {
            scope.invalidate();
        }
    }

    /// Value computed once when the slot is inserted and returned as-is on
    /// every later pass.
    pub fn remember<T: 'static>(&self, calc: impl FnOnce() -> T) -> Owned<T> {
        let stored = self.edit(|table, _| {
            let stored = match table.peek() {
                Some(SlotValue::Object(object)) => object.downcast_ref::<Owned<T>>().cloned(),
                _ => None,
            };
            if stored.is_some() {
                table.skip_slot();
            }
            stored
        });
        if let Some(stored) = stored {
            return stored;
        }
        let owned = Owned::new(calc());
        let slot = SlotValue::Object(RememberedObject::new(owned.clone()));
        self.edit(|table, log| table.write_slot(slot, log));
        owned
    }

    /// Like [`remember`](Self::remember) for objects that want lifecycle
    /// callbacks. `on_remembered` runs after the inserting pass applies and
    /// `on_forgotten` after the pass that removes the slot.
    pub fn remember_observer<T: RememberObserver + 'static>(&self, calc: impl FnOnce() -> T) -> Rc<T> {
        let stored = self.edit(|table, _| {
            let stored = match table.peek() {
                Some(SlotValue::Object(object)) => object.downcast_ref::<Rc<T>>().cloned(),
                _ => None,
            };
            if stored.is_some() {
                table.skip_slot();
            }
            stored
        });
        if let Some(stored) = stored {
            return stored;
        }
        let value = Rc::new(calc());
        let observer: Rc<dyn RememberObserver> = value.clone();
        let slot = SlotValue::Object(RememberedObject::with_observer(
            Rc::clone(&value),
            Rc::clone(&observer),
        ));
        self.edit(|table, log| {
            table.write_slot(slot, log);
            log.remember.remembered(observer);
        });
        value
    }

    /// Store `value` and report whether it differs from the previous pass.
    pub fn changed<T: PartialEq + Clone + 'static>(&self, value: &T) -> bool {
        self.edit(|table, log| {
            if let Some(SlotValue::Object(object)) = table.peek_mut() {
                if let Some(previous) = object.downcast_mut::<T>() {
                    let differs = previous != value;
                    if differs {
                        *previous = value.clone();
                    }
                    table.skip_slot();
                    return differs;
                }
            }
            table.write_slot(SlotValue::Object(RememberedObject::new(value.clone())), log);
            true
        })
    }

    /// Like [`changed`](Self::changed), comparing by pointer identity.
    pub fn changed_instance<T: ?Sized + 'static>(&self, value: &Rc<T>) -> bool {
        self.edit(|table, log| {
            if let Some(SlotValue::Object(object)) = table.peek_mut() {
                if let Some(previous) = object.downcast_mut::<Rc<T>>() {
                    let differs = !Rc::ptr_eq(previous, value);
                    if differs {
                        *previous = Rc::clone(value);
                    }
                    table.skip_slot();
                    return differs;
                }
            }
            table.write_slot(SlotValue::Object(RememberedObject::new(Rc::clone(value))), log);
            true
        })
    }

    pub fn changed_primitive(&self, value: impl Into<Primitive>) -> bool {
        let value = value.into();
        self.edit(|table, log| {
            if let Some(SlotValue::Primitive(previous)) = table.peek() {
                if *previous == value {
                    table.skip_slot();
                    return false;
                }
            }
            table.write_slot(SlotValue::Primitive(value), log);
            true
        })
    }

    /// Read back a value stored by [`changed`](Self::changed) on an earlier
    /// pass. Used by recompose callbacks to recover their arguments.
    ///
    /// # Panics
    /// Panics when the slot at the cursor holds no `T`.
    pub fn recall<T: Clone + 'static>(&self) -> T {
        let stored = self.edit(|table, _| {
            let stored = match table.peek() {
                Some(SlotValue::Object(object)) => object.downcast_ref::<T>().cloned(),
                _ => None,
            };
            if stored.is_some() {
                table.skip_slot();
            }
            stored
        });
        match stored {
            Some(value) => value,
            None => panic!("recall: no stored {} at the cursor", type_name::<T>()),
        }
    }

    pub fn start_node(&self, key: Key) {
        self.edit(|table, log| {
            table.begin_group(key, None, GroupFlags::NODE, log);
        });
    }

    /// The node recorded by an earlier pass, entered for its children.
    pub fn use_node(&self) -> Option<NodeId> {
        self.edit(|table, log| table.use_node(log))
    }

    /// Emit an insert for `node` and enter it. Must directly follow
    /// [`start_node`](Self::start_node) when [`use_node`](Self::use_node)
    /// found nothing.
    pub fn create_node<N: Node>(&self, node: N) -> NodeId {
        let id = self.core.next_node_id.get();
        self.core.next_node_id.set(id + 1);
        self.edit(|table, log| {
            if matches!(table.peek(), Some(SlotValue::Node(_))) {
                panic!("create_node over an existing node; call use_node first");
            }
            let index = table.node_index();
            log.changes.insert(index, id, Box::new(node));
            table.record_node(id, log);
        });
        id
    }

    pub fn end_node(&self) {
        self.edit(|table, log| table.end_group(log));
    }

    /// Emit an update for node `id`. Fails at apply time with
    /// [`NodeError::TypeMismatch`] when the node is not an `N`.
    pub fn update_node<N: Node>(&self, id: NodeId, update: impl FnOnce(&mut N) + 'static) {
        self.core.log.borrow_mut().changes.update(
            id,
            Box::new(move |node: &mut dyn Node| {
                let node = node.downcast_mut::<N>().ok_or(NodeError::TypeMismatch {
                    id,
                    expected: type_name::<N>(),
                })?;
                update(node);
                Ok(())
            }),
        );
    }

    /// Emit a node: reuse or create it, apply attribute updates and compose
    /// its children.
    pub fn emit_node<N: Node>(
        &self,
        key: Key,
        factory: impl FnOnce() -> N,
        update: impl FnOnce(&NodeUpdater<'_, N>),
        content: impl FnOnce(&Composer),
    ) -> NodeId {
        self.start_node(key);
        let id = match self.use_node() {
            Some(id) => id,
            None => self.create_node(factory()),
        };
        update(&NodeUpdater {
            composer: self,
            id,
            _node: PhantomData,
        });
        content(self);
        self.end_node();
        id
    }

    pub fn checkpoint(&self) -> CheckpointToken {
        self.core.table.borrow().checkpoint()
    }

    pub fn resume(&self, token: &CheckpointToken) -> Result<(), ComposeError> {
        self.core
            .table
            .borrow_mut()
            .resume(token)
            .map_err(|reason| ComposeError::SuspensionMismatch { reason })
    }

    pub fn provide<T, R>(
        &self,
        local: &CompositionLocal<T>,
        value: T,
        body: impl FnOnce(&Composer) -> R,
    ) -> R
    where
        T: Clone + PartialEq + Send + Sync + 'static,
    {
        self.provide_all(vec![local.provides(value)], body)
    }

    pub fn provide_all<R>(&self, values: Vec<ProvidedValue>, body: impl FnOnce(&Composer) -> R) -> R {
        self.group(PROVIDER_KEY, |composer| {
            let entries: Vec<_> = values
                .into_iter()
                .map(|value| value.into_entry(composer))
                .collect();
            let depth = composer.core.locals.borrow().len();
            composer.core.locals.borrow_mut().extend(entries);
            let result = body(composer);
            composer.core.locals.borrow_mut().truncate(depth);
            result
        })
    }

    /// Value of `local` provided by the nearest enclosing provider. Reading
    /// it makes the running scope depend on the provided value.
    pub fn current<T>(&self, local: &CompositionLocal<T>) -> T
    where
        T: Clone + PartialEq + Send + Sync + 'static,
    {
        let entry = self
            .core
            .locals
            .borrow()
            .iter()
            .rev()
            .find(|(key, _)| *key == local.key())
            .map(|(_, entry)| Rc::clone(entry));
        match entry {
            Some(entry) => match entry.downcast::<LocalStateEntry<T>>() {
                Ok(entry) => entry.value(),
                Err(_) => panic!("composition local holds a value other than {}", type_name::<T>()),
            },
            None => local.default_value(),
        }
    }

    /// Run `effect` after the current pass has been applied.
    pub fn side_effect(&self, effect: impl FnOnce() + 'static) {
        self.core.side_effects.borrow_mut().push(Box::new(effect));
    }
}

/// Emits attribute updates for one node, see [`Composer::emit_node`].
pub struct NodeUpdater<'a, N> {
    composer: &'a Composer,
    id: NodeId,
    _node: PhantomData<fn(&mut N)>,
}

impl<N: Node> NodeUpdater<'_, N> {
    pub fn id(&self) -> NodeId {
        self.id
    }

    /// Emit `apply` only when `value` differs from the previous pass.
    pub fn set<V: PartialEq + Clone + 'static>(
        &self,
        value: V,
        apply: impl FnOnce(&mut N, V) + 'static,
    ) -> bool {
        if !self.composer.changed(&value) {
            return false;
        }
        self.composer
            .update_node::<N>(self.id, move |node| apply(node, value));
        true
    }

    /// Emit `apply` unconditionally.
    pub fn update(&self, apply: impl FnOnce(&mut N) + 'static) {
        self.composer.update_node::<N>(self.id, apply);
    }
}

#[cfg(test)]
#[path = "tests/composer_tests.rs"]
mod tests;

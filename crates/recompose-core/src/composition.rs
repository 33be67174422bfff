//! A composition: one slot table, its composer and the node tree an
//! [`Applier`] maintains from it.
//!
//! Every pass runs in its own mutable snapshot with the composer's read
//! observer attached, so the reads of each scope are recorded and writes made
//! while composing stay invisible to other threads until the pass commits.
//! A pass then goes through the apply phase in a fixed order: the change list
//! is applied, removed scopes are released, remember events are dispatched,
//! and finally side effects run.

use std::any::Any;
use std::cell::{Cell, RefCell};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::rc::{Rc, Weak};

use crate::arena::GenerationalArena;
use crate::changes::{apply_changes, Applier, Diagnostic, EditLog};
use crate::composer::Composer;
use crate::composer_context;
use crate::error::{ComposeError, NodeError};
use crate::recomposer::CompositionId;
use crate::runtime::SchedulerContext;
use crate::snapshot::{self, ConflictMode};
use crate::state::StateObjectId;
use crate::Key;

const ROOT_KEY: Key = 0x726f_6f74;

/// Decides what an applier failure means for the caller.
pub trait ApplyErrorHandler {
    /// `Ok` swallows the failure; the remaining changes of the pass are lost
    /// either way.
    fn handle(&self, error: NodeError) -> Result<(), ComposeError>;
}

impl<F> ApplyErrorHandler for F
where
    F: Fn(NodeError) -> Result<(), ComposeError>,
{
    fn handle(&self, error: NodeError) -> Result<(), ComposeError> {
        self(error)
    }
}

/// Logs the failure and reports it as [`ComposeError::Apply`].
#[derive(Debug, Default, Clone, Copy)]
pub struct LogApplyErrors;

impl ApplyErrorHandler for LogApplyErrors {
    fn handle(&self, error: NodeError) -> Result<(), ComposeError> {
        log::error!("applying changes failed: {error}");
        Err(ComposeError::Apply(error))
    }
}

/// Result of composing, waiting to be applied.
pub(crate) struct ComposedPass {
    log: EditLog,
    panic: Option<String>,
    snapshot_error: Option<ComposeError>,
}

/// What the recomposer drives, independent of the applier type.
pub(crate) trait Recomposable {
    fn invalidate_states(&self, objects: &[StateObjectId]) -> usize;
    fn has_invalidations(&self) -> bool;
    fn compose_invalid(&self) -> Option<ComposedPass>;
    fn apply_pass(&self, pass: ComposedPass) -> Result<(), ComposeError>;
    fn drop_invalidations(&self);
}

pub(crate) type Registry = Rc<RefCell<GenerationalArena<Rc<dyn Recomposable>>>>;

struct Registration {
    registry: Weak<RefCell<GenerationalArena<Rc<dyn Recomposable>>>>,
    id: CompositionId,
}

struct CompositionInner<A> {
    composer: Composer,
    applier: RefCell<A>,
    root: RefCell<Option<Rc<dyn Fn(&Composer)>>>,
    conflict_mode: Cell<Option<ConflictMode>>,
    error_handler: RefCell<Rc<dyn ApplyErrorHandler>>,
    diagnostics: RefCell<Vec<Diagnostic>>,
    registration: RefCell<Option<Registration>>,
    composing: Cell<bool>,
    disposed: Cell<bool>,
}

impl<A: Applier> CompositionInner<A> {
    fn check_live(&self) -> Result<(), ComposeError> {
        if self.disposed.get() {
            return Err(ComposeError::Disposed);
        }
        Ok(())
    }

    fn compose(&self, body: impl FnOnce(&Composer)) -> ComposedPass {
        assert!(
            !self.composing.replace(true),
            "composition re-entered during its own pass"
        );
        let composer = &self.composer;
        let mode = self
            .conflict_mode
            .get()
            .unwrap_or_else(snapshot::default_conflict_mode);
        let snapshot =
            match snapshot::take_mutable_snapshot_with_mode(Some(composer.read_observer()), None, mode) {
                Ok(snapshot) => snapshot,
                Err(err) => {
                    self.composing.set(false);
                    return ComposedPass {
                        log: EditLog::default(),
                        panic: None,
                        snapshot_error: Some(err.into()),
                    };
                }
            };
        let outcome = snapshot.enter(|| {
            let _current = composer_context::enter(composer);
            catch_unwind(AssertUnwindSafe(|| body(composer)))
        });
        let panic = match outcome {
            Ok(()) => None,
            Err(payload) => {
                let message = panic_message(payload.as_ref());
                log::error!("composition pass panicked: {message}");
                if let Some(scope) = composer.abort_pass() {
                    scope.set_force_reinsert(true);
                    scope.invalidate();
                }
                Some(message)
            }
        };
        let snapshot_error = match snapshot.apply() {
            Ok(()) => None,
            Err(err) => {
                log::warn!("composition snapshot did not apply: {err}");
                snapshot.dispose();
                Some(err.into())
            }
        };
        self.composing.set(false);
        ComposedPass {
            log: composer.take_log(),
            panic,
            snapshot_error,
        }
    }

    fn apply(&self, pass: ComposedPass) -> Result<(), ComposeError> {
        let ComposedPass {
            log,
            panic,
            snapshot_error,
        } = pass;
        let EditLog {
            mut changes,
            remember,
            released_scopes,
            diagnostics,
        } = log;
        let changes = changes.take();
        log::trace!("applying {} change(s)", changes.len());
        let applied = if changes.is_empty() {
            Ok(())
        } else {
            let result = apply_changes(changes, &mut *self.applier.borrow_mut());
            match result {
                Ok(()) => Ok(()),
                Err(error) => {
                    let handler = Rc::clone(&self.error_handler.borrow());
                    handler.handle(error)
                }
            }
        };
        self.composer.release_scopes(&released_scopes);
        self.diagnostics.borrow_mut().extend(diagnostics);
        remember.dispatch();
        for effect in self.composer.take_side_effects() {
            effect();
        }
        if let Some(message) = panic {
            return Err(ComposeError::ComposablePanicked { message });
        }
        applied?;
        match snapshot_error {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

impl<A: Applier> Recomposable for CompositionInner<A> {
    fn invalidate_states(&self, objects: &[StateObjectId]) -> usize {
        if self.disposed.get() {
            return 0;
        }
        self.composer.invalidate_states(objects)
    }

    fn has_invalidations(&self) -> bool {
        !self.disposed.get() && self.composer.has_invalidations()
    }

    fn compose_invalid(&self) -> Option<ComposedPass> {
        if !self.has_invalidations() {
            return None;
        }
        Some(self.compose(|composer| {
            composer.recompose_invalid();
        }))
    }

    fn apply_pass(&self, pass: ComposedPass) -> Result<(), ComposeError> {
        self.apply(pass)
    }

    fn drop_invalidations(&self) {
        self.composer.drop_invalidations();
    }
}

/// A composition bound to an applier.
///
/// Cloning shares the composition. It stays alive as long as a clone does;
/// [`dispose`](Self::dispose) tears it down explicitly.
pub struct Composition<A: Applier + 'static> {
    inner: Rc<CompositionInner<A>>,
}

impl<A: Applier + 'static> Clone for Composition<A> {
    fn clone(&self) -> Self {
        Self {
            inner: Rc::clone(&self.inner),
        }
    }
}

impl<A: Applier + 'static> Composition<A> {
    /// A composition driven by hand through [`recompose`](Self::recompose).
    /// Use [`Recomposer::create_composition`](crate::Recomposer::create_composition)
    /// to have frames drive it.
    pub fn new(applier: A, context: &SchedulerContext) -> Self {
        Self {
            inner: Rc::new(CompositionInner {
                composer: Composer::new(context.clone()),
                applier: RefCell::new(applier),
                root: RefCell::new(None),
                conflict_mode: Cell::new(None),
                error_handler: RefCell::new(Rc::new(LogApplyErrors)),
                diagnostics: RefCell::new(Vec::new()),
                registration: RefCell::new(None),
                composing: Cell::new(false),
                disposed: Cell::new(false),
            }),
        }
    }

    pub(crate) fn register(&self, registry: &Registry) -> CompositionId {
        let unit: Rc<dyn Recomposable> = self.inner.clone();
        let id = registry.borrow_mut().insert(unit);
        *self.inner.registration.borrow_mut() = Some(Registration {
            registry: Rc::downgrade(registry),
            id,
        });
        id
    }

    pub fn id(&self) -> Option<CompositionId> {
        self.inner
            .registration
            .borrow()
            .as_ref()
            .map(|registration| registration.id)
    }

    /// Conflict mode of this composition's pass snapshots. `None` follows the
    /// process default.
    pub fn set_conflict_mode(&self, mode: Option<ConflictMode>) {
        self.inner.conflict_mode.set(mode);
    }

    pub fn set_apply_error_handler(&self, handler: impl ApplyErrorHandler + 'static) {
        self.set_shared_error_handler(Rc::new(handler));
    }

    pub(crate) fn set_shared_error_handler(&self, handler: Rc<dyn ApplyErrorHandler>) {
        *self.inner.error_handler.borrow_mut() = handler;
    }

    /// Compose `content` from scratch against the current table and apply
    /// the result.
    pub fn set_content(&self, content: impl Fn() + 'static) -> Result<(), ComposeError> {
        self.set_content_with(move |_| content())
    }

    /// Like [`set_content`](Self::set_content) with the composer passed in.
    pub fn set_content_with(&self, content: impl Fn(&Composer) + 'static) -> Result<(), ComposeError> {
        self.inner.check_live()?;
        let content: Rc<dyn Fn(&Composer)> = Rc::new(content);
        *self.inner.root.borrow_mut() = Some(Rc::clone(&content));
        log::debug!("composing new content");
        let pass = self.inner.compose(move |composer| {
            composer.begin_pass();
            compose_root(composer, content);
            composer.end_pass();
        });
        self.inner.apply(pass)
    }

    /// Recompose the invalid scopes and apply the result. Returns whether a
    /// pass ran.
    pub fn recompose(&self) -> Result<bool, ComposeError> {
        self.inner.check_live()?;
        match self.inner.compose_invalid() {
            Some(pass) => self.inner.apply(pass).map(|()| true),
            None => Ok(false),
        }
    }

    /// Invalidate every scope that read one of `objects`.
    pub fn invalidate_states(&self, objects: &[StateObjectId]) -> usize {
        self.inner.invalidate_states(objects)
    }

    pub fn has_invalidations(&self) -> bool {
        self.inner.has_invalidations()
    }

    pub fn is_disposed(&self) -> bool {
        self.inner.disposed.get()
    }

    pub fn with_applier<R>(&self, f: impl FnOnce(&mut A) -> R) -> R {
        f(&mut self.inner.applier.borrow_mut())
    }

    /// Duplicate-key and similar findings collected since the last call.
    pub fn take_diagnostics(&self) -> Vec<Diagnostic> {
        std::mem::take(&mut *self.inner.diagnostics.borrow_mut())
    }

    /// Number of live recompose scopes.
    pub fn scope_count(&self) -> usize {
        self.inner.composer.scope_count()
    }

    /// Textual rendering of the slot table.
    pub fn dump_slots(&self) -> String {
        self.inner.composer.with_table(|table| table.dump())
    }

    /// Check the slot table's group sizes and nesting.
    pub fn verify_slots(&self) -> Result<(), String> {
        self.inner.composer.with_table(|table| table.verify())
    }

    pub fn slot_count(&self) -> usize {
        self.inner.composer.with_table(|table| table.len())
    }

    /// Remove all content: the applier receives a single `Clear`, remembered
    /// objects are forgotten innermost first, and the composition leaves its
    /// recomposer.
    pub fn dispose(&self) -> Result<(), ComposeError> {
        if self.inner.disposed.replace(true) {
            return Ok(());
        }
        log::debug!("disposing composition");
        let composer = &self.inner.composer;
        composer.dispose_table();
        let mut log = composer.take_log();
        log.remember.abandon_pending();
        composer.release_all_scopes();
        self.inner.root.borrow_mut().take();
        if let Some(registration) = self.inner.registration.borrow_mut().take() {
            if let Some(registry) = registration.registry.upgrade() {
                registry.borrow_mut().remove(registration.id);
            }
        }
        drop(composer.take_side_effects());
        self.inner.apply(ComposedPass {
            log,
            panic: None,
            snapshot_error: None,
        })
    }
}

fn compose_root(composer: &Composer, content: Rc<dyn Fn(&Composer)>) {
    composer.start_restartable_group(ROOT_KEY);
    // Registered up front so a first pass that panics can still be retried.
    if let Some(scope) = composer.current_scope() {
        let content = Rc::clone(&content);
        scope.set_recompose(move |composer| content(composer));
    }
    if composer.should_execute(true) {
        content(composer);
    } else {
        composer.skip_current_group();
    }
    composer.end_restartable_group();
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_owned()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        String::from("non-string panic payload")
    }
}

#[cfg(test)]
#[path = "tests/composition_tests.rs"]
mod tests;

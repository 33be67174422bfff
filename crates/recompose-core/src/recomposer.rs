//! The recomposer: turns state changes into recomposition passes, one frame
//! at a time.

use std::cell::{Cell, RefCell};
use std::fmt;
use std::rc::Rc;
use std::sync::Arc;

use crate::arena::{ArenaId, GenerationalArena};
use crate::changes::Applier;
use crate::composition::{ApplyErrorHandler, Composition, LogApplyErrors, Recomposable, Registry};
use crate::error::ComposeError;
use crate::platform::RuntimeScheduler;
use crate::runtime::SchedulerContext;
use crate::snapshot::{self, ConflictMode};

pub type CompositionId = ArenaId;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecomposerState {
    Idle,
    PendingInvalidations,
    Composing,
    ApplyingChanges,
    ShuttingDown,
    ShutDown,
}

impl fmt::Display for RecomposerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RecomposerState::Idle => "idle",
            RecomposerState::PendingInvalidations => "pending invalidations",
            RecomposerState::Composing => "composing",
            RecomposerState::ApplyingChanges => "applying changes",
            RecomposerState::ShuttingDown => "shutting down",
            RecomposerState::ShutDown => "shut down",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecomposerConfig {
    /// Conflict mode of composition pass snapshots. `None` follows
    /// [`snapshot::default_conflict_mode`].
    pub conflict_mode: Option<ConflictMode>,
    /// Passes per frame before leftover invalidations wait for the next
    /// frame. Writes made while composing are picked up by the next round.
    pub max_recompose_rounds: usize,
}

impl Default for RecomposerConfig {
    fn default() -> Self {
        Self {
            conflict_mode: None,
            max_recompose_rounds: 8,
        }
    }
}

/// Drives the compositions created through it.
///
/// The host calls [`run_frame`](Self::run_frame) whenever its
/// [`RuntimeScheduler`] was asked for a frame. Everything runs on the thread
/// that owns the recomposer; other threads only ever enqueue work.
pub struct Recomposer {
    context: SchedulerContext,
    config: RecomposerConfig,
    state: Cell<RecomposerState>,
    compositions: Registry,
    error_handler: RefCell<Rc<dyn ApplyErrorHandler>>,
}

impl Recomposer {
    pub fn new(scheduler: Arc<dyn RuntimeScheduler>) -> Self {
        Self::with_config(scheduler, RecomposerConfig::default())
    }

    pub fn with_config(scheduler: Arc<dyn RuntimeScheduler>, config: RecomposerConfig) -> Self {
        Self {
            context: SchedulerContext::new(scheduler),
            config,
            state: Cell::new(RecomposerState::Idle),
            compositions: Rc::new(RefCell::new(GenerationalArena::new())),
            error_handler: RefCell::new(Rc::new(LogApplyErrors)),
        }
    }

    pub fn context(&self) -> &SchedulerContext {
        &self.context
    }

    pub fn config(&self) -> RecomposerConfig {
        self.config
    }

    /// Current phase. An idle recomposer reports
    /// [`PendingInvalidations`](RecomposerState::PendingInvalidations) as soon
    /// as applied state changes have made one of its scopes invalid.
    pub fn state(&self) -> RecomposerState {
        let state = self.state.get();
        if state != RecomposerState::Idle {
            return state;
        }
        let units = self.units();
        self.absorb_changed_states(&units);
        if units.iter().any(|unit| unit.has_invalidations()) {
            RecomposerState::PendingInvalidations
        } else {
            RecomposerState::Idle
        }
    }

    /// Handler given to compositions created after this call.
    pub fn set_apply_error_handler(&self, handler: impl ApplyErrorHandler + 'static) {
        *self.error_handler.borrow_mut() = Rc::new(handler);
    }

    pub fn create_composition<A: Applier + 'static>(&self, applier: A) -> Composition<A> {
        let composition = Composition::new(applier, &self.context);
        composition.set_conflict_mode(self.config.conflict_mode);
        composition.set_shared_error_handler(Rc::clone(&self.error_handler.borrow()));
        let id = composition.register(&self.compositions);
        log::debug!("composition {id:?} registered");
        composition
    }

    pub fn composition_count(&self) -> usize {
        self.compositions.borrow().len()
    }

    fn units(&self) -> Vec<Rc<dyn Recomposable>> {
        self.compositions
            .borrow()
            .iter()
            .map(|(_, unit)| Rc::clone(unit))
            .collect()
    }

    pub fn has_pending_work(&self) -> bool {
        if self.is_shut_down() {
            return false;
        }
        self.context.needs_frame()
            || self.context.has_changed_states()
            || self.context.has_frame_callbacks()
            || self.context.has_pending_tasks()
            || snapshot::has_pending_global_changes()
            || self.units().iter().any(|unit| unit.has_invalidations())
    }

    /// Move the changed states collected so far into scope invalidations.
    fn absorb_changed_states(&self, units: &[Rc<dyn Recomposable>]) -> usize {
        let changed = self.context.take_changed_states();
        if changed.is_empty() {
            return 0;
        }
        units
            .iter()
            .map(|unit| unit.invalidate_states(&changed))
            .sum()
    }

    fn is_shut_down(&self) -> bool {
        matches!(
            self.state.get(),
            RecomposerState::ShuttingDown | RecomposerState::ShutDown
        )
    }

    /// Run one frame: frame callbacks, UI tasks, then recomposition rounds
    /// until nothing is invalid. Returns the first error of the frame; the
    /// remaining compositions still recompose.
    pub fn run_frame(&self, frame_time_nanos: u64) -> Result<(), ComposeError> {
        if self.is_shut_down() {
            return Err(ComposeError::Cancelled);
        }
        self.context.frame_handled();
        self.context.drain_frame_callbacks(frame_time_nanos);
        self.context.run_ui_tasks();

        let mut first_error = None;
        let mut settled = false;
        for round in 0..self.config.max_recompose_rounds {
            if self.context.is_cancelled() {
                break;
            }
            snapshot::send_apply_notifications();
            let units = self.units();
            let invalidated = self.absorb_changed_states(&units);
            if invalidated > 0 {
                log::trace!("round {round}: changed states invalidated {invalidated} scope(s)");
            }
            if !units.iter().any(|unit| unit.has_invalidations()) {
                settled = true;
                break;
            }
            self.state.set(RecomposerState::Composing);
            let passes: Vec<_> = units
                .iter()
                .filter_map(|unit| unit.compose_invalid().map(|pass| (unit, pass)))
                .collect();
            self.state.set(RecomposerState::ApplyingChanges);
            for (unit, pass) in passes {
                if let Err(err) = unit.apply_pass(pass) {
                    first_error.get_or_insert(err);
                }
            }
            self.state.set(RecomposerState::Idle);
        }
        if self.context.is_cancelled() {
            self.finish_shutdown();
        } else if !settled {
            log::debug!(
                "recomposition did not settle in {} round(s); continuing next frame",
                self.config.max_recompose_rounds
            );
            self.context.request_frame();
            self.state.set(RecomposerState::PendingInvalidations);
        } else {
            self.state.set(RecomposerState::Idle);
        }
        match first_error {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Stop recomposing. A pass in progress skips its remaining bodies,
    /// keeping their old content, and its partial change list is applied.
    /// Pending invalidations are dropped.
    pub fn cancel(&self) {
        if self.is_shut_down() {
            return;
        }
        log::debug!("recomposer cancelled");
        let in_frame = matches!(
            self.state.get(),
            RecomposerState::Composing | RecomposerState::ApplyingChanges
        );
        self.state.set(RecomposerState::ShuttingDown);
        self.context.cancel();
        if !in_frame {
            self.finish_shutdown();
        }
    }

    fn finish_shutdown(&self) {
        for unit in self.units() {
            unit.drop_invalidations();
        }
        self.context.shut_down();
        self.state.set(RecomposerState::ShutDown);
    }
}

impl Drop for Recomposer {
    fn drop(&mut self) {
        self.context.shut_down();
    }
}

#[cfg(test)]
#[path = "tests/recomposer_tests.rs"]
mod tests;

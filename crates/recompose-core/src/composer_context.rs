//! The composer a composable running on this thread writes through.
//!
//! Generated code reaches its composer through [`with_current_composer`]
//! instead of an explicit parameter. Compositions nest (a composition may be
//! created and set up from inside another one's pass), so the current
//! composer is a stack.

use std::cell::RefCell;
use std::rc::Rc;

use crate::composer::{Composer, ComposerCore};

thread_local! {
    static COMPOSERS: RefCell<Vec<Rc<ComposerCore>>> = const { RefCell::new(Vec::new()) };
}

/// Pops the composer pushed by [`enter`].
#[must_use = "the composer stops being current when the guard is dropped"]
pub struct CurrentComposerGuard {
    _private: (),
}

impl Drop for CurrentComposerGuard {
    fn drop(&mut self) {
        COMPOSERS.with(|stack| {
            stack.borrow_mut().pop();
        });
    }
}

/// Make `composer` current until the returned guard drops.
pub fn enter(composer: &Composer) -> CurrentComposerGuard {
    COMPOSERS.with(|stack| stack.borrow_mut().push(composer.clone_core()));
    CurrentComposerGuard { _private: () }
}

/// # Panics
/// Panics when no composition pass is running on this thread.
pub fn with_current_composer<R>(f: impl FnOnce(&Composer) -> R) -> R {
    match try_with_current_composer(f) {
        Some(result) => result,
        None => panic!("composable called outside of a composition"),
    }
}

pub fn try_with_current_composer<R>(f: impl FnOnce(&Composer) -> R) -> Option<R> {
    // The stack borrow ends before `f` runs, so `f` may enter nested passes.
    let core = COMPOSERS.with(|stack| stack.borrow().last().cloned())?;
    Some(f(&Composer::from_core(core)))
}

pub fn has_current_composer() -> bool {
    COMPOSERS.with(|stack| !stack.borrow().is_empty())
}

//! Composition locals: values provided to a subtree without threading them
//! through every composable.

use std::any::Any;
use std::rc::Rc;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::composer::Composer;
use crate::composer_context::with_current_composer;
use crate::state::{mutable_state_of, MutableState};

pub(crate) type LocalKey = u64;

fn next_local_key() -> LocalKey {
    static NEXT: AtomicU64 = AtomicU64::new(1);
    NEXT.fetch_add(1, Ordering::Relaxed)
}

/// Provided values visible at a point of the composition, innermost last.
pub(crate) type LocalStack = Vec<(LocalKey, Rc<dyn Any>)>;

/// Provided value stored in the provider's slots. Backed by a state cell so
/// readers are invalidated when the provider changes the value.
pub(crate) struct LocalStateEntry<T: Clone + Send + Sync + 'static> {
    state: MutableState<T>,
}

impl<T: Clone + PartialEq + Send + Sync + 'static> LocalStateEntry<T> {
    fn new(initial: T) -> Self {
        Self {
            state: mutable_state_of(initial),
        }
    }

    fn set(&self, value: T) {
        if self.state.with_untracked(|current| *current != value) {
            self.state.set(value);
        }
    }

    pub(crate) fn value(&self) -> T {
        self.state.get()
    }
}

/// Key for a value provided with [`Composer::provide`].
#[derive(Clone)]
pub struct CompositionLocal<T: Clone + 'static> {
    key: LocalKey,
    default: Rc<dyn Fn() -> T>,
}

impl<T: Clone + 'static> PartialEq for CompositionLocal<T> {
    fn eq(&self, other: &Self) -> bool {
        self.key == other.key
    }
}

impl<T: Clone + 'static> Eq for CompositionLocal<T> {}

impl<T: Clone + PartialEq + Send + Sync + 'static> CompositionLocal<T> {
    pub fn provides(&self, value: T) -> ProvidedValue {
        let key = self.key;
        ProvidedValue {
            key,
            apply: Box::new(move |composer: &Composer| {
                let entry = composer.remember(|| Rc::new(LocalStateEntry::new(value.clone())));
                let entry = entry.with(Rc::clone);
                entry.set(value);
                entry as Rc<dyn Any>
            }),
        }
    }

    /// Value provided by the nearest enclosing provider, or the default.
    ///
    /// # Panics
    /// Panics outside of a composition.
    pub fn current(&self) -> T {
        with_current_composer(|composer| composer.current(self))
    }

    pub(crate) fn key(&self) -> LocalKey {
        self.key
    }

    pub fn default_value(&self) -> T {
        (self.default)()
    }
}

pub fn composition_local_of<T: Clone + 'static>(
    default: impl Fn() -> T + 'static,
) -> CompositionLocal<T> {
    CompositionLocal {
        key: next_local_key(),
        default: Rc::new(default),
    }
}

/// One binding for [`Composer::provide_all`].
pub struct ProvidedValue {
    key: LocalKey,
    apply: Box<dyn FnOnce(&Composer) -> Rc<dyn Any>>,
}

impl ProvidedValue {
    pub(crate) fn into_entry(self, composer: &Composer) -> (LocalKey, Rc<dyn Any>) {
        let entry = (self.apply)(composer);
        (self.key, entry)
    }
}

/// Provide `values` to everything `content` composes.
///
/// # Panics
/// Panics outside of a composition.
pub fn composition_local_provider(
    values: impl IntoIterator<Item = ProvidedValue>,
    content: impl FnOnce(),
) {
    with_current_composer(|composer| {
        composer.provide_all(values.into_iter().collect(), |_| content());
    })
}

use std::fmt;
use std::rc::Rc;

/// Lifecycle callbacks for objects stored with
/// [`Composer::remember_observer`](crate::Composer::remember_observer).
///
/// Callbacks run after the pass that caused them has been applied, never
/// during composition.
pub trait RememberObserver {
    /// The object entered a composition that was applied.
    fn on_remembered(&self) {}
    /// The object left an applied composition.
    fn on_forgotten(&self) {}
    /// The object was remembered by a pass that never committed it.
    fn on_abandoned(&self) {}
}

/// Remember callbacks collected during a pass.
///
/// Dispatch order is forgotten (innermost first, in removal order), then
/// remembered (insertion order), then abandoned.
#[derive(Default)]
pub struct RememberEvents {
    remembered: Vec<Rc<dyn RememberObserver>>,
    forgotten: Vec<Rc<dyn RememberObserver>>,
    abandoned: Vec<Rc<dyn RememberObserver>>,
}

impl RememberEvents {
    pub fn is_empty(&self) -> bool {
        self.remembered.is_empty() && self.forgotten.is_empty() && self.abandoned.is_empty()
    }

    pub fn remembered(&mut self, observer: Rc<dyn RememberObserver>) {
        self.remembered.push(observer);
    }

    /// An object remembered earlier in the same pass was never committed, so
    /// it is abandoned rather than forgotten.
    pub fn forgotten(&mut self, observer: Rc<dyn RememberObserver>) {
        match self
            .remembered
            .iter()
            .position(|pending| Rc::ptr_eq(pending, &observer))
        {
            Some(index) => {
                self.remembered.remove(index);
                self.abandoned.push(observer);
            }
            None => self.forgotten.push(observer),
        }
    }

    /// Turn every pending remember into an abandon.
    pub fn abandon_pending(&mut self) {
        self.abandoned.append(&mut self.remembered);
    }

    pub fn dispatch(self) {
        let RememberEvents {
            remembered,
            forgotten,
            abandoned,
        } = self;
        for observer in forgotten {
            observer.on_forgotten();
        }
        for observer in remembered {
            observer.on_remembered();
        }
        for observer in abandoned {
            observer.on_abandoned();
        }
    }
}

impl fmt::Debug for RememberEvents {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RememberEvents")
            .field("remembered", &self.remembered.len())
            .field("forgotten", &self.forgotten.len())
            .field("abandoned", &self.abandoned.len())
            .finish()
    }
}

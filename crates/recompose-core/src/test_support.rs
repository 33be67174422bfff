//! Fixtures shared by the unit tests of the composition modules.

use std::cell::RefCell;
use std::rc::Rc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use crate::changes::{Applier, MemoryApplier, Node};
use crate::composer::Composer;
use crate::error::NodeError;
use crate::platform::RuntimeScheduler;
use crate::remember::RememberObserver;
use crate::{Key, NodeId};

pub(crate) type Events = Rc<RefCell<Vec<String>>>;

pub(crate) fn take(events: &Events) -> Vec<String> {
    std::mem::take(&mut *events.borrow_mut())
}

#[derive(Debug, Default)]
pub(crate) struct Text {
    pub(crate) value: String,
}

impl Node for Text {}

const TEXT: Key = 0x7465_7874;

/// A leaf node showing `value`.
pub(crate) fn text(composer: &Composer, value: &str) -> NodeId {
    composer.emit_node(
        TEXT,
        Text::default,
        |node| {
            node.set(value.to_owned(), |text: &mut Text, value| text.value = value);
        },
        |_| {},
    )
}

/// Tree applier that also logs every call it receives.
#[derive(Default)]
pub(crate) struct Recording {
    pub(crate) tree: MemoryApplier,
    pub(crate) ops: Events,
}

impl Recording {
    pub(crate) fn new(ops: &Events) -> Self {
        Self {
            tree: MemoryApplier::new(),
            ops: Rc::clone(ops),
        }
    }

    fn record(&self, op: String) {
        self.ops.borrow_mut().push(op);
    }

    pub(crate) fn text_of(&mut self, id: NodeId) -> Option<String> {
        self.tree.with_node(id, |text: &mut Text| text.value.clone()).ok()
    }

    /// Values of the root's children, in order.
    pub(crate) fn texts(&mut self) -> Vec<String> {
        let children = self.tree.children(crate::ROOT_NODE_ID).to_vec();
        children
            .into_iter()
            .filter_map(|id| self.text_of(id))
            .collect()
    }
}

impl Applier for Recording {
    fn current(&self) -> NodeId {
        self.tree.current()
    }

    fn down(&mut self, id: NodeId) -> Result<(), NodeError> {
        self.record(format!("down {id}"));
        self.tree.down(id)
    }

    fn up(&mut self) -> Result<(), NodeError> {
        self.record("up".to_owned());
        self.tree.up()
    }

    fn insert_node(&mut self, index: usize, id: NodeId, node: Box<dyn Node>) -> Result<(), NodeError> {
        self.record(format!("insert {id} at {index}"));
        self.tree.insert_node(index, id, node)
    }

    fn remove_nodes(&mut self, index: usize, count: usize) -> Result<(), NodeError> {
        self.record(format!("remove {count} at {index}"));
        self.tree.remove_nodes(index, count)
    }

    fn move_nodes(&mut self, from: usize, to: usize, count: usize) -> Result<(), NodeError> {
        self.record(format!("move {count} from {from} to {to}"));
        self.tree.move_nodes(from, to, count)
    }

    fn update_node(
        &mut self,
        id: NodeId,
        update: &mut dyn FnMut(&mut dyn Node),
    ) -> Result<(), NodeError> {
        self.record(format!("update {id}"));
        self.tree.update_node(id, update)
    }

    fn clear(&mut self) -> Result<(), NodeError> {
        self.record("clear".to_owned());
        self.tree.clear()
    }
}

/// Remember observer logging its lifecycle as `"<event> <name>"`.
pub(crate) struct Probe {
    pub(crate) name: String,
    pub(crate) events: Events,
}

impl Probe {
    pub(crate) fn new(name: impl Into<String>, events: &Events) -> Self {
        Self {
            name: name.into(),
            events: Rc::clone(events),
        }
    }
}

impl RememberObserver for Probe {
    fn on_remembered(&self) {
        self.events.borrow_mut().push(format!("remembered {}", self.name));
    }

    fn on_forgotten(&self) {
        self.events.borrow_mut().push(format!("forgotten {}", self.name));
    }

    fn on_abandoned(&self) {
        self.events.borrow_mut().push(format!("abandoned {}", self.name));
    }
}

#[derive(Default)]
pub(crate) struct CountingScheduler {
    frames: AtomicUsize,
}

impl CountingScheduler {
    pub(crate) fn frames(&self) -> usize {
        self.frames.load(Ordering::SeqCst)
    }
}

impl RuntimeScheduler for CountingScheduler {
    fn schedule_frame(&self) {
        self.frames.fetch_add(1, Ordering::SeqCst);
    }
}

pub(crate) fn scheduler() -> Arc<CountingScheduler> {
    Arc::new(CountingScheduler::default())
}

//! An in-memory node tree that remembers every call it received.

use std::fmt;

use recompose_core::{
    with_current_composer, Applier, MemoryApplier, Node, NodeError, NodeId, ROOT_NODE_ID,
};

/// Node used by tests: a label plus a text attribute.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct TestNode {
    pub label: String,
    pub text: String,
    pub mounted: bool,
}

impl TestNode {
    pub fn new(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            ..Self::default()
        }
    }
}

impl Node for TestNode {
    fn mount(&mut self) {
        self.mounted = true;
    }

    fn unmount(&mut self) {
        self.mounted = false;
    }
}

const LEAF_KEY: u64 = 0x6c65_6166;
const CONTAINER_KEY: u64 = 0x626f_78;

/// Emit a childless [`TestNode`] showing `text`.
pub fn leaf(label: &str, text: &str) -> NodeId {
    with_current_composer(|composer| {
        composer.emit_node(
            LEAF_KEY,
            || TestNode::new(label),
            |node| {
                node.set(text.to_owned(), |node: &mut TestNode, text| node.text = text);
            },
            |_| {},
        )
    })
}

/// Emit a [`TestNode`] and compose `content` as its children.
pub fn container(label: &str, content: impl FnOnce()) -> NodeId {
    with_current_composer(|composer| {
        composer.emit_node(
            CONTAINER_KEY,
            || TestNode::new(label),
            |node| {
                node.set(label.to_owned(), |node: &mut TestNode, label| node.label = label);
            },
            |_| content(),
        )
    })
}

/// One call received by a [`RecordingApplier`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AppliedOp {
    Down(NodeId),
    Up,
    Insert { index: usize, id: NodeId },
    Remove { index: usize, count: usize },
    Move { from: usize, to: usize, count: usize },
    Update(NodeId),
    Clear,
}

impl fmt::Display for AppliedOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AppliedOp::Down(id) => write!(f, "down {id}"),
            AppliedOp::Up => f.write_str("up"),
            AppliedOp::Insert { index, id } => write!(f, "insert {id} at {index}"),
            AppliedOp::Remove { index, count } => write!(f, "remove {count} at {index}"),
            AppliedOp::Move { from, to, count } => write!(f, "move {count} from {from} to {to}"),
            AppliedOp::Update(id) => write!(f, "update {id}"),
            AppliedOp::Clear => f.write_str("clear"),
        }
    }
}

/// [`MemoryApplier`] that records each operation before forwarding it.
#[derive(Default)]
pub struct RecordingApplier {
    tree: MemoryApplier,
    ops: Vec<AppliedOp>,
    batches: usize,
}

impl RecordingApplier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn tree(&self) -> &MemoryApplier {
        &self.tree
    }

    pub fn ops(&self) -> &[AppliedOp] {
        &self.ops
    }

    pub fn take_ops(&mut self) -> Vec<AppliedOp> {
        std::mem::take(&mut self.ops)
    }

    /// How many change lists were applied.
    pub fn batches(&self) -> usize {
        self.batches
    }

    pub fn node(&mut self, id: NodeId) -> Option<TestNode> {
        self.tree.with_node(id, |node: &mut TestNode| node.clone()).ok()
    }

    /// Texts of the children of `parent`, in order.
    pub fn texts_of(&mut self, parent: NodeId) -> Vec<String> {
        let children = self.tree.children(parent).to_vec();
        children
            .into_iter()
            .filter_map(|id| self.node(id).map(|node| node.text))
            .collect()
    }

    /// Texts of the top level nodes.
    pub fn texts(&mut self) -> Vec<String> {
        self.texts_of(ROOT_NODE_ID)
    }

    pub fn dump(&self) -> String {
        self.tree.dump_tree(ROOT_NODE_ID, |id, node| {
            match node.downcast_ref::<TestNode>() {
                Some(node) if node.text.is_empty() => format!("#{id} {}", node.label),
                Some(node) => format!("#{id} {} \"{}\"", node.label, node.text),
                None => format!("#{id}"),
            }
        })
    }
}

impl Applier for RecordingApplier {
    fn current(&self) -> NodeId {
        self.tree.current()
    }

    fn down(&mut self, id: NodeId) -> Result<(), NodeError> {
        self.ops.push(AppliedOp::Down(id));
        self.tree.down(id)
    }

    fn up(&mut self) -> Result<(), NodeError> {
        self.ops.push(AppliedOp::Up);
        self.tree.up()
    }

    fn insert_node(&mut self, index: usize, id: NodeId, node: Box<dyn Node>) -> Result<(), NodeError> {
        self.ops.push(AppliedOp::Insert { index, id });
        self.tree.insert_node(index, id, node)
    }

    fn remove_nodes(&mut self, index: usize, count: usize) -> Result<(), NodeError> {
        self.ops.push(AppliedOp::Remove { index, count });
        self.tree.remove_nodes(index, count)
    }

    fn move_nodes(&mut self, from: usize, to: usize, count: usize) -> Result<(), NodeError> {
        self.ops.push(AppliedOp::Move { from, to, count });
        self.tree.move_nodes(from, to, count)
    }

    fn update_node(
        &mut self,
        id: NodeId,
        update: &mut dyn FnMut(&mut dyn Node),
    ) -> Result<(), NodeError> {
        self.ops.push(AppliedOp::Update(id));
        self.tree.update_node(id, update)
    }

    fn clear(&mut self) -> Result<(), NodeError> {
        self.ops.push(AppliedOp::Clear);
        self.tree.clear()
    }

    fn on_end_changes(&mut self) {
        self.batches += 1;
    }
}

//! The applier protocol.
//!
//! Composition never touches the node tree. It records [`Change`]s into a
//! [`ChangeList`] which is later replayed against an [`Applier`] on the thread
//! that owns the tree. The list applies sequentially against the tree left by
//! the previous pass.

use std::any::Any;
use std::fmt;

use crate::collections::map::HashMap;
use crate::error::NodeError;
use crate::remember::RememberEvents;
use crate::scope::ScopeId;
use crate::{Key, NodeId};

/// Id of the node every applier starts at. Composer allocated ids begin after it.
pub const ROOT_NODE_ID: NodeId = 0;

pub trait Node: Any {
    /// Called after the node is inserted into its parent.
    fn mount(&mut self) {}
    /// Called before the node leaves the tree.
    fn unmount(&mut self) {}
}

impl dyn Node {
    pub fn as_any(&self) -> &dyn Any {
        self
    }

    pub fn downcast_ref<N: Node>(&self) -> Option<&N> {
        self.as_any().downcast_ref::<N>()
    }

    pub fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }

    pub fn downcast_mut<N: Node>(&mut self) -> Option<&mut N> {
        self.as_any_mut().downcast_mut::<N>()
    }
}

pub type NodeUpdate = Box<dyn FnOnce(&mut dyn Node) -> Result<(), NodeError>>;

pub enum Change {
    /// Make `id`, a child of the current node, the current node.
    Down(NodeId),
    /// Return to the parent of the current node.
    Up,
    Insert {
        index: usize,
        id: NodeId,
        node: Box<dyn Node>,
    },
    Remove {
        index: usize,
        count: usize,
    },
    /// Remove `count` children at `from` and re-insert them at `to`.
    Move {
        from: usize,
        to: usize,
        count: usize,
    },
    Update {
        id: NodeId,
        apply: NodeUpdate,
    },
    /// Remove every child of the root.
    Clear,
}

impl fmt::Debug for Change {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Change::Down(id) => write!(f, "Down({id})"),
            Change::Up => f.write_str("Up"),
            Change::Insert { index, id, .. } => write!(f, "Insert {{ index: {index}, id: {id} }}"),
            Change::Remove { index, count } => {
                write!(f, "Remove {{ index: {index}, count: {count} }}")
            }
            Change::Move { from, to, count } => {
                write!(f, "Move {{ from: {from}, to: {to}, count: {count} }}")
            }
            Change::Update { id, .. } => write!(f, "Update({id})"),
            Change::Clear => f.write_str("Clear"),
        }
    }
}

#[derive(Debug)]
struct PathEntry {
    id: NodeId,
    realized: bool,
}

/// Pending changes of one pass.
///
/// Entering a node only records it on a path. `Down`s are emitted lazily,
/// right before the first structural change below that node, and the matching
/// `Up`s only for entered nodes that were realized. A pass that finds no
/// differences therefore produces an empty list.
#[derive(Default)]
pub struct ChangeList {
    changes: Vec<Change>,
    path: Vec<PathEntry>,
}

impl ChangeList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.changes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Change> {
        self.changes.iter()
    }

    pub fn depth(&self) -> usize {
        self.path.len()
    }

    pub fn push_down(&mut self, id: NodeId) {
        self.path.push(PathEntry {
            id,
            realized: false,
        });
    }

    pub fn push_up(&mut self) {
        match self.path.pop() {
            Some(entry) if entry.realized => self.changes.push(Change::Up),
            Some(_) => {}
            None => panic!("change list pushed up past the root"),
        }
    }

    fn realize(&mut self) {
        let first = self.path.partition_point(|entry| entry.realized);
        for entry in &mut self.path[first..] {
            entry.realized = true;
            self.changes.push(Change::Down(entry.id));
        }
    }

    pub fn insert(&mut self, index: usize, id: NodeId, node: Box<dyn Node>) {
        self.realize();
        self.changes.push(Change::Insert { index, id, node });
    }

    pub fn remove(&mut self, index: usize, count: usize) {
        if count == 0 {
            return;
        }
        self.realize();
        self.changes.push(Change::Remove { index, count });
    }

    pub fn move_nodes(&mut self, from: usize, to: usize, count: usize) {
        if count == 0 || from == to {
            return;
        }
        self.realize();
        self.changes.push(Change::Move { from, to, count });
    }

    /// Updates address their node by id and never force the path.
    pub fn update(&mut self, id: NodeId, apply: NodeUpdate) {
        self.changes.push(Change::Update { id, apply });
    }

    pub fn clear(&mut self) {
        self.changes.push(Change::Clear);
    }

    /// Take the recorded changes, closing any realized path entries.
    pub fn take(&mut self) -> Vec<Change> {
        while !self.path.is_empty() {
            self.push_up();
        }
        std::mem::take(&mut self.changes)
    }
}

impl fmt::Debug for ChangeList {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.changes.iter()).finish()
    }
}

/// Non-fatal findings recorded while editing the slot table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Diagnostic {
    /// Two siblings in one parent used the same key; the first unconsumed one wins.
    DuplicateKey {
        key: Key,
        object_key: Option<u64>,
    },
}

/// Everything a pass produces besides the slot table itself.
#[derive(Default)]
pub struct EditLog {
    pub changes: ChangeList,
    pub remember: RememberEvents,
    pub released_scopes: Vec<ScopeId>,
    pub diagnostics: Vec<Diagnostic>,
}

impl EditLog {
    pub fn is_empty(&self) -> bool {
        self.changes.is_empty() && self.remember.is_empty() && self.released_scopes.is_empty()
    }
}

/// Applies [`Change`]s to a concrete node tree. Object safe.
pub trait Applier {
    /// The node structural changes currently apply to.
    fn current(&self) -> NodeId;
    fn down(&mut self, id: NodeId) -> Result<(), NodeError>;
    fn up(&mut self) -> Result<(), NodeError>;
    fn insert_node(&mut self, index: usize, id: NodeId, node: Box<dyn Node>)
        -> Result<(), NodeError>;
    fn remove_nodes(&mut self, index: usize, count: usize) -> Result<(), NodeError>;
    fn move_nodes(&mut self, from: usize, to: usize, count: usize) -> Result<(), NodeError>;
    fn update_node(
        &mut self,
        id: NodeId,
        update: &mut dyn FnMut(&mut dyn Node),
    ) -> Result<(), NodeError>;
    fn clear(&mut self) -> Result<(), NodeError>;

    fn on_begin_changes(&mut self) {}
    fn on_end_changes(&mut self) {}
}

/// Replay `changes` in order. Stops at the first failing change.
pub fn apply_changes(
    changes: Vec<Change>,
    applier: &mut dyn Applier,
) -> Result<(), NodeError> {
    applier.on_begin_changes();
    let result = changes
        .into_iter()
        .try_for_each(|change| apply_change(change, applier));
    applier.on_end_changes();
    result
}

fn apply_change(change: Change, applier: &mut dyn Applier) -> Result<(), NodeError> {
    match change {
        Change::Down(id) => applier.down(id),
        Change::Up => applier.up(),
        Change::Insert { index, id, node } => applier.insert_node(index, id, node),
        Change::Remove { index, count } => applier.remove_nodes(index, count),
        Change::Move { from, to, count } => applier.move_nodes(from, to, count),
        Change::Update { id, apply } => {
            let mut apply = Some(apply);
            let mut outcome = Ok(());
            applier.update_node(id, &mut |node: &mut dyn Node| {
                if let Some(apply) = apply.take() {
                    outcome = apply(node);
                }
            })?;
            outcome
        }
        Change::Clear => applier.clear(),
    }
}

struct RootNode;

impl Node for RootNode {}

struct NodeEntry {
    node: Box<dyn Node>,
    children: Vec<NodeId>,
    parent: Option<NodeId>,
}

/// Applier keeping the tree in a map, for hosts that only need the structure.
pub struct MemoryApplier {
    nodes: HashMap<NodeId, NodeEntry>,
    stack: Vec<NodeId>,
}

impl Default for MemoryApplier {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryApplier {
    pub fn new() -> Self {
        let mut nodes = HashMap::default();
        nodes.insert(
            ROOT_NODE_ID,
            NodeEntry {
                node: Box::new(RootNode),
                children: Vec::new(),
                parent: None,
            },
        );
        Self {
            nodes,
            stack: vec![ROOT_NODE_ID],
        }
    }

    /// Number of nodes in the tree, excluding the root.
    pub fn len(&self) -> usize {
        self.nodes.len() - 1
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, id: NodeId) -> bool {
        self.nodes.contains_key(&id)
    }

    pub fn children(&self, id: NodeId) -> &[NodeId] {
        self.nodes
            .get(&id)
            .map(|entry| entry.children.as_slice())
            .unwrap_or_default()
    }

    pub fn parent(&self, id: NodeId) -> Option<NodeId> {
        self.nodes.get(&id).and_then(|entry| entry.parent)
    }

    pub fn with_node<N: Node, R>(
        &mut self,
        id: NodeId,
        f: impl FnOnce(&mut N) -> R,
    ) -> Result<R, NodeError> {
        let entry = self.nodes.get_mut(&id).ok_or(NodeError::Missing { id })?;
        let typed = entry
            .node
            .downcast_mut::<N>()
            .ok_or(NodeError::TypeMismatch {
                id,
                expected: std::any::type_name::<N>(),
            })?;
        Ok(f(typed))
    }

    /// Indented rendering of the subtree below `id`, one node per line.
    pub fn dump_tree(&self, id: NodeId, label: impl Fn(NodeId, &dyn Node) -> String) -> String {
        let mut output = String::new();
        self.dump_node(&mut output, id, 0, &label);
        output
    }

    fn dump_node(
        &self,
        output: &mut String,
        id: NodeId,
        depth: usize,
        label: &dyn Fn(NodeId, &dyn Node) -> String,
    ) {
        let indent = "  ".repeat(depth);
        match self.nodes.get(&id) {
            Some(entry) => {
                output.push_str(&format!("{indent}{}\n", label(id, &*entry.node)));
                for child in &entry.children {
                    self.dump_node(output, *child, depth + 1, label);
                }
            }
            None => output.push_str(&format!("{indent}[{id}] (missing)\n")),
        }
    }

    fn current_entry(&mut self) -> Result<&mut NodeEntry, NodeError> {
        let id = self.current();
        self.nodes.get_mut(&id).ok_or(NodeError::Missing { id })
    }

    fn drop_subtree(&mut self, id: NodeId) {
        if let Some(mut entry) = self.nodes.remove(&id) {
            entry.node.unmount();
            for child in entry.children {
                self.drop_subtree(child);
            }
        }
    }
}

impl Applier for MemoryApplier {
    fn current(&self) -> NodeId {
        self.stack.last().copied().unwrap_or(ROOT_NODE_ID)
    }

    fn down(&mut self, id: NodeId) -> Result<(), NodeError> {
        if !self.current_entry()?.children.contains(&id) {
            return Err(NodeError::Missing { id });
        }
        self.stack.push(id);
        Ok(())
    }

    fn up(&mut self) -> Result<(), NodeError> {
        if self.stack.len() <= 1 {
            return Err(NodeError::NoCurrentParent);
        }
        self.stack.pop();
        Ok(())
    }

    fn insert_node(
        &mut self,
        index: usize,
        id: NodeId,
        mut node: Box<dyn Node>,
    ) -> Result<(), NodeError> {
        let parent = self.current();
        let siblings = &mut self.current_entry()?.children;
        if index > siblings.len() {
            return Err(NodeError::IndexOutOfBounds {
                index,
                len: siblings.len(),
            });
        }
        siblings.insert(index, id);
        node.mount();
        self.nodes.insert(
            id,
            NodeEntry {
                node,
                children: Vec::new(),
                parent: Some(parent),
            },
        );
        Ok(())
    }

    fn remove_nodes(&mut self, index: usize, count: usize) -> Result<(), NodeError> {
        let siblings = &mut self.current_entry()?.children;
        if index + count > siblings.len() {
            return Err(NodeError::IndexOutOfBounds {
                index: index + count,
                len: siblings.len(),
            });
        }
        let removed: Vec<NodeId> = siblings.drain(index..index + count).collect();
        for id in removed {
            self.drop_subtree(id);
        }
        Ok(())
    }

    fn move_nodes(&mut self, from: usize, to: usize, count: usize) -> Result<(), NodeError> {
        let siblings = &mut self.current_entry()?.children;
        if from + count > siblings.len() || to + count > siblings.len() {
            return Err(NodeError::IndexOutOfBounds {
                index: from.max(to) + count,
                len: siblings.len(),
            });
        }
        let moved: Vec<NodeId> = siblings.drain(from..from + count).collect();
        siblings.splice(to..to, moved);
        Ok(())
    }

    fn update_node(
        &mut self,
        id: NodeId,
        update: &mut dyn FnMut(&mut dyn Node),
    ) -> Result<(), NodeError> {
        let entry = self.nodes.get_mut(&id).ok_or(NodeError::Missing { id })?;
        update(&mut *entry.node);
        Ok(())
    }

    fn clear(&mut self) -> Result<(), NodeError> {
        let children = match self.nodes.get_mut(&ROOT_NODE_ID) {
            Some(root) => std::mem::take(&mut root.children),
            None => return Err(NodeError::Missing { id: ROOT_NODE_ID }),
        };
        for id in children {
            self.drop_subtree(id);
        }
        self.stack.truncate(1);
        Ok(())
    }
}

#[cfg(test)]
#[path = "tests/changes_tests.rs"]
mod tests;

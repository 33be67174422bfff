//! Slot table: the positional memo of a composition.
//!
//! The table is a flat sequence of [`SlotValue`]s stored in a [`GapBuffer`].
//! Groups are encoded inline: a [`GroupHeader`] followed by `size - 1` slots
//! holding its content, so the table is a forest in pre-order.
//!
//! Editing is cursor based. A pass opens with [`SlotTable::begin_pass`] and
//! walks the table with `begin_group`/`end_group`, reusing what matches and
//! inserting what does not:
//! - a group at the cursor with the same key is reused in place;
//! - otherwise a later, not yet visited sibling with that key is moved to the
//!   cursor, found through a key index built on the first out-of-order match;
//! - otherwise a fresh group is inserted.
//!
//! Anything a group did not visit by the time it closes is stale and removed.
//! Removal forgets remembered objects innermost first and emits one
//! `Remove` for the nodes of the removed range.

use std::any::Any;
use std::fmt::{self, Write as _};
use std::rc::Rc;

use smallvec::SmallVec;

use crate::changes::{Diagnostic, EditLog};
use crate::collections::map::{HashMap, HashSet};
use crate::gap_buffer::{Anchor, Anchored, GapBuffer};
use crate::remember::RememberObserver;
use crate::scope::ScopeId;
use crate::{Key, NodeId};

pub type ObjectKey = u64;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct GroupFlags {
    pub is_node: bool,
    pub has_object_key: bool,
    pub is_restartable: bool,
}

impl GroupFlags {
    pub const PLAIN: GroupFlags = GroupFlags {
        is_node: false,
        has_object_key: false,
        is_restartable: false,
    };

    pub const NODE: GroupFlags = GroupFlags {
        is_node: true,
        has_object_key: false,
        is_restartable: false,
    };

    pub const RESTARTABLE: GroupFlags = GroupFlags {
        is_node: false,
        has_object_key: false,
        is_restartable: true,
    };
}

pub struct GroupHeader {
    pub key: Key,
    pub object_key: Option<ObjectKey>,
    /// Slot count including the header itself.
    pub size: usize,
    /// Nodes this group contributes to its enclosing node. A node group counts as one.
    pub node_count: usize,
    pub flags: GroupFlags,
    pub anchor: Option<Anchor>,
    pub scope: Option<ScopeId>,
}

impl GroupHeader {
    fn new(key: Key, object_key: Option<ObjectKey>, flags: GroupFlags) -> Self {
        Self {
            key,
            object_key,
            size: 1,
            node_count: 0,
            flags: GroupFlags {
                has_object_key: object_key.is_some(),
                ..flags
            },
            anchor: None,
            scope: None,
        }
    }

    fn matches(&self, key: Key, object_key: Option<ObjectKey>, flags: GroupFlags) -> bool {
        self.key == key && self.object_key == object_key && self.flags.is_node == flags.is_node
    }
}

/// Plain data memoized by `changed_primitive`.
#[derive(Debug, Clone)]
pub enum Primitive {
    Bool(bool),
    Int(i64),
    Unsigned(u64),
    /// Compared by bit pattern, so `NaN` equals itself.
    Float(f64),
    Text(String),
}

impl PartialEq for Primitive {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Primitive::Bool(a), Primitive::Bool(b)) => a == b,
            (Primitive::Int(a), Primitive::Int(b)) => a == b,
            (Primitive::Unsigned(a), Primitive::Unsigned(b)) => a == b,
            (Primitive::Float(a), Primitive::Float(b)) => a.to_bits() == b.to_bits(),
            (Primitive::Text(a), Primitive::Text(b)) => a == b,
            _ => false,
        }
    }
}

impl From<bool> for Primitive {
    fn from(value: bool) -> Self {
        Primitive::Bool(value)
    }
}

impl From<i32> for Primitive {
    fn from(value: i32) -> Self {
        Primitive::Int(i64::from(value))
    }
}

impl From<i64> for Primitive {
    fn from(value: i64) -> Self {
        Primitive::Int(value)
    }
}

impl From<u32> for Primitive {
    fn from(value: u32) -> Self {
        Primitive::Unsigned(u64::from(value))
    }
}

impl From<u64> for Primitive {
    fn from(value: u64) -> Self {
        Primitive::Unsigned(value)
    }
}

impl From<usize> for Primitive {
    fn from(value: usize) -> Self {
        Primitive::Unsigned(value as u64)
    }
}

impl From<f32> for Primitive {
    fn from(value: f32) -> Self {
        Primitive::Float(f64::from(value))
    }
}

impl From<f64> for Primitive {
    fn from(value: f64) -> Self {
        Primitive::Float(value)
    }
}

impl From<&str> for Primitive {
    fn from(value: &str) -> Self {
        Primitive::Text(value.to_owned())
    }
}

impl From<String> for Primitive {
    fn from(value: String) -> Self {
        Primitive::Text(value)
    }
}

/// A value stored in the table, optionally with lifecycle callbacks.
pub struct RememberedObject {
    value: Box<dyn Any>,
    observer: Option<Rc<dyn RememberObserver>>,
}

impl RememberedObject {
    pub fn new(value: impl Any) -> Self {
        Self {
            value: Box::new(value),
            observer: None,
        }
    }

    pub fn with_observer(value: impl Any, observer: Rc<dyn RememberObserver>) -> Self {
        Self {
            value: Box::new(value),
            observer: Some(observer),
        }
    }

    pub fn downcast_ref<T: 'static>(&self) -> Option<&T> {
        self.value.downcast_ref::<T>()
    }

    pub fn downcast_mut<T: 'static>(&mut self) -> Option<&mut T> {
        self.value.downcast_mut::<T>()
    }

    pub fn observer(&self) -> Option<&Rc<dyn RememberObserver>> {
        self.observer.as_ref()
    }
}

pub enum SlotValue {
    Group(GroupHeader),
    Primitive(Primitive),
    Object(RememberedObject),
    Node(NodeId),
    Empty,
}

impl SlotValue {
    pub fn as_group(&self) -> Option<&GroupHeader> {
        match self {
            SlotValue::Group(header) => Some(header),
            _ => None,
        }
    }

    fn as_group_mut(&mut self) -> Option<&mut GroupHeader> {
        match self {
            SlotValue::Group(header) => Some(header),
            _ => None,
        }
    }

    fn span(&self) -> usize {
        self.as_group().map_or(1, |header| header.size)
    }

    fn nodes(&self) -> usize {
        match self {
            SlotValue::Group(header) => header.node_count,
            SlotValue::Node(_) => 1,
            _ => 0,
        }
    }
}

impl Anchored for SlotValue {
    fn anchor(&self) -> Option<&Anchor> {
        self.as_group().and_then(|header| header.anchor.as_ref())
    }

    fn anchor_slot(&mut self) -> Option<&mut Option<Anchor>> {
        self.as_group_mut().map(|header| &mut header.anchor)
    }
}

impl fmt::Debug for SlotValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SlotValue::Group(header) => write!(
                f,
                "Group(key={:#x}, object_key={:?}, size={}, nodes={})",
                header.key, header.object_key, header.size, header.node_count
            ),
            SlotValue::Primitive(value) => write!(f, "Primitive({value:?})"),
            SlotValue::Object(object) => {
                if object.observer.is_some() {
                    f.write_str("Object(observed)")
                } else {
                    f.write_str("Object")
                }
            }
            SlotValue::Node(id) => write!(f, "Node({id})"),
            SlotValue::Empty => f.write_str("Empty"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    Insert,
    Reuse,
}

type KeyIndex = HashMap<(Key, Option<ObjectKey>), SmallVec<[Anchor; 2]>>;

struct Frame {
    /// Header index, `None` for the pass root.
    start: Option<usize>,
    key: Key,
    /// Distance of the group end from the table end. Edits only happen inside
    /// the innermost open group, so this stays valid while the frame is open.
    end_from_back: usize,
    mode: Mode,
    /// Enclosing node's child index when the group began.
    node_start: usize,
    is_node: bool,
    entered_node: bool,
    /// Table epoch when the group began.
    epoch: u64,
    key_index: Option<KeyIndex>,
    seen_object_keys: Option<HashSet<(Key, ObjectKey)>>,
}

struct NodeCursor {
    id: Option<NodeId>,
    /// Children of this node passed so far in the current pass.
    index: usize,
}

/// Result of [`SlotTable::begin_group`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GroupStart {
    pub index: usize,
    pub reused: bool,
    pub moved: bool,
    pub scope: Option<ScopeId>,
}

/// Plain-data capture of the editing position, see [`SlotTable::checkpoint`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckpointToken {
    cursor: usize,
    epoch: u64,
    frames: Vec<(Option<usize>, Key)>,
    node_index: usize,
}

impl CheckpointToken {
    pub fn depth(&self) -> usize {
        self.frames.len()
    }
}

#[derive(Default)]
pub struct SlotTable {
    slots: GapBuffer<SlotValue>,
    cursor: usize,
    frames: Vec<Frame>,
    nodes: Vec<NodeCursor>,
    /// Bumped on every structural edit.
    epoch: u64,
}

impl SlotTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn cursor(&self) -> usize {
        self.cursor
    }

    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    /// Open groups, counting the pass root.
    pub fn depth(&self) -> usize {
        self.frames.len()
    }

    pub fn in_pass(&self) -> bool {
        !self.frames.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&SlotValue> {
        self.slots.get(index)
    }

    pub fn group(&self, index: usize) -> Option<&GroupHeader> {
        self.slots.get(index).and_then(SlotValue::as_group)
    }

    pub fn group_at_cursor(&self) -> Option<&GroupHeader> {
        if self.cursor >= self.frame_end() {
            return None;
        }
        self.group(self.cursor)
    }

    pub fn anchor(&mut self, index: usize) -> Option<Anchor> {
        self.slots.anchor(index)
    }

    pub fn resolve(&self, anchor: &Anchor) -> Option<usize> {
        self.slots.resolve(anchor)
    }

    pub fn set_group_scope(&mut self, index: usize, scope: ScopeId) {
        match self.slots.get_mut(index).and_then(SlotValue::as_group_mut) {
            Some(header) => header.scope = Some(scope),
            None => panic!("slot {index} is not a group"),
        }
    }

    /// Whether the innermost open group is being inserted rather than reused.
    pub fn is_inserting(&self) -> bool {
        self.top().mode == Mode::Insert
    }

    /// Header index of the innermost open group.
    pub fn current_group(&self) -> Option<usize> {
        self.frames.last().and_then(|frame| frame.start)
    }

    /// End of the innermost open group (exclusive).
    pub fn frame_end(&self) -> usize {
        match self.frames.last() {
            Some(frame) => self.slots.len() - frame.end_from_back,
            None => self.slots.len(),
        }
    }

    /// Child index, within the current parent node, of the next emitted node.
    pub fn node_index(&self) -> usize {
        self.nodes.last().map_or(0, |node| node.index)
    }

    pub fn current_node(&self) -> Option<NodeId> {
        self.nodes.last().and_then(|node| node.id)
    }

    fn top(&self) -> &Frame {
        match self.frames.last() {
            Some(frame) => frame,
            None => panic!("slot table used outside of a begin/end pairing"),
        }
    }

    fn top_mut(&mut self) -> &mut Frame {
        match self.frames.last_mut() {
            Some(frame) => frame,
            None => panic!("slot table used outside of a begin/end pairing"),
        }
    }

    fn add_nodes(&mut self, count: usize) {
        if let Some(node) = self.nodes.last_mut() {
            node.index += count;
        }
    }

    fn set_node_index(&mut self, index: usize) {
        if let Some(node) = self.nodes.last_mut() {
            node.index = index;
        }
    }

    fn header_mut(&mut self, index: usize) -> &mut GroupHeader {
        match self.slots.get_mut(index).and_then(SlotValue::as_group_mut) {
            Some(header) => header,
            None => panic!("slot {index} is not a group header"),
        }
    }

    pub fn begin_pass(&mut self) {
        assert!(
            self.frames.is_empty(),
            "begin_pass while {} group(s) are still open",
            self.frames.len()
        );
        self.cursor = 0;
        self.nodes.clear();
        self.nodes.push(NodeCursor { id: None, index: 0 });
        self.frames.push(Frame {
            start: None,
            key: 0,
            end_from_back: 0,
            mode: Mode::Reuse,
            node_start: 0,
            is_node: false,
            entered_node: false,
            epoch: self.epoch,
            key_index: None,
            seen_object_keys: None,
        });
    }

    /// Close the pass root, removing top-level content that was not visited.
    pub fn end_pass(&mut self, log: &mut EditLog) {
        assert!(
            self.frames.len() == 1 && self.top().start.is_none(),
            "end_pass with {} unclosed group(s)",
            self.frames.len().saturating_sub(1)
        );
        self.trim_stale(log);
        self.frames.pop();
        self.nodes.clear();
        debug_assert_eq!(self.verify(), Ok(()));
    }

    pub fn begin_group(
        &mut self,
        key: Key,
        object_key: Option<ObjectKey>,
        flags: GroupFlags,
        log: &mut EditLog,
    ) -> GroupStart {
        if let Some(object_key) = object_key {
            self.note_object_key(key, object_key, log);
        }
        let node_start = self.node_index();
        if self.top().mode == Mode::Reuse && self.cursor < self.frame_end() {
            let at_cursor = self
                .group(self.cursor)
                .is_some_and(|header| header.matches(key, object_key, flags));
            if at_cursor {
                return self.push_reused(node_start, false);
            }
            if let Some(from) = self.find_sibling(key, object_key, flags) {
                self.move_group(from, log);
                return self.push_reused(node_start, true);
            }
        }
        self.push_inserted(key, object_key, flags, node_start)
    }

    fn push_reused(&mut self, node_start: usize, moved: bool) -> GroupStart {
        let index = self.cursor;
        let len = self.slots.len();
        let epoch = self.epoch;
        let (key, size, is_node, scope) = match self.group(index) {
            Some(header) => (header.key, header.size, header.flags.is_node, header.scope),
            None => panic!("no group to reuse at {index}"),
        };
        self.frames.push(Frame {
            start: Some(index),
            key,
            end_from_back: len - (index + size),
            mode: Mode::Reuse,
            node_start,
            is_node,
            entered_node: false,
            epoch,
            key_index: None,
            seen_object_keys: None,
        });
        self.cursor += 1;
        GroupStart {
            index,
            reused: true,
            moved,
            scope,
        }
    }

    fn push_inserted(
        &mut self,
        key: Key,
        object_key: Option<ObjectKey>,
        flags: GroupFlags,
        node_start: usize,
    ) -> GroupStart {
        let index = self.cursor;
        self.slots.insert(
            index,
            SlotValue::Group(GroupHeader::new(key, object_key, flags)),
        );
        self.epoch += 1;
        self.frames.push(Frame {
            start: Some(index),
            key,
            end_from_back: self.slots.len() - (index + 1),
            mode: Mode::Insert,
            node_start,
            is_node: flags.is_node,
            entered_node: false,
            epoch: self.epoch,
            key_index: None,
            seen_object_keys: None,
        });
        self.cursor += 1;
        GroupStart {
            index,
            reused: false,
            moved: false,
            scope: None,
        }
    }

    fn note_object_key(&mut self, key: Key, object_key: ObjectKey, log: &mut EditLog) {
        let fresh = self
            .top_mut()
            .seen_object_keys
            .get_or_insert_with(HashSet::default)
            .insert((key, object_key));
        if !fresh {
            log::warn!(
                "duplicate key {object_key:#x} in group {key:#x}; the first unconsumed sibling wins"
            );
            log.diagnostics.push(Diagnostic::DuplicateKey {
                key,
                object_key: Some(object_key),
            });
        }
    }

    /// First not yet visited sibling after the cursor with the given key.
    fn find_sibling(
        &mut self,
        key: Key,
        object_key: Option<ObjectKey>,
        flags: GroupFlags,
    ) -> Option<usize> {
        if self.top().key_index.is_none() {
            let index = self.build_key_index();
            self.top_mut().key_index = Some(index);
        }
        let end = self.frame_end();
        let candidates = self.top().key_index.as_ref()?.get(&(key, object_key))?;
        candidates
            .iter()
            .filter_map(|anchor| self.slots.resolve(anchor))
            .filter(|&position| position > self.cursor && position < end)
            .find(|&position| {
                self.group(position)
                    .is_some_and(|header| header.matches(key, object_key, flags))
            })
    }

    fn build_key_index(&mut self) -> KeyIndex {
        let mut index = KeyIndex::default();
        let end = self.frame_end();
        let mut position = self.cursor;
        while position < end {
            let Some(slot) = self.slots.get(position) else {
                break;
            };
            let span = slot.span();
            if let Some(header) = slot.as_group() {
                let entry = (header.key, header.object_key);
                if let Some(anchor) = self.slots.anchor(position) {
                    index.entry(entry).or_default().push(anchor);
                }
            }
            position += span;
        }
        index
    }

    /// Close the innermost group, removing whatever it did not visit.
    pub fn end_group(&mut self, log: &mut EditLog) {
        match self.frames.last() {
            Some(frame) if frame.start.is_some() => {}
            Some(_) => panic!("end_group would close the pass root; use end_pass"),
            None => panic!("end_group with no open group"),
        }
        self.trim_stale(log);
        let Some(frame) = self.frames.pop() else {
            unreachable!("frame presence checked above");
        };
        let Some(start) = frame.start else {
            unreachable!("root frame rejected above");
        };
        let size = self.cursor - start;
        let node_count = if frame.is_node {
            if frame.entered_node {
                self.nodes.pop();
                log.changes.push_up();
            }
            let has_node = matches!(self.slots.get(start + 1), Some(SlotValue::Node(_)));
            let count = usize::from(has_node);
            self.set_node_index(frame.node_start + count);
            count
        } else {
            self.node_index() - frame.node_start
        };
        let header = self.header_mut(start);
        header.size = size;
        header.node_count = node_count;
    }

    fn trim_stale(&mut self, log: &mut EditLog) {
        let end = self.frame_end();
        if self.cursor < end {
            let count = end - self.cursor;
            let removed_nodes = self.remove_slots(self.cursor, count, log);
            let index = self.node_index();
            log.changes.remove(index, removed_nodes);
            log::trace!("trimmed {count} stale slot(s) at {}", self.cursor);
        }
    }

    /// Step over the group at the cursor without visiting it.
    pub fn skip_group(&mut self) {
        let (size, nodes) = match self.group_at_cursor() {
            Some(header) => (header.size, header.node_count),
            None => panic!("skip_group at {} which is not a group", self.cursor),
        };
        self.cursor += size;
        self.add_nodes(nodes);
    }

    /// Step over the rest of the innermost group, keeping its content.
    pub fn skip_to_group_end(&mut self) {
        let end = self.frame_end();
        let frame = self.top();
        if frame.is_node {
            self.cursor = end;
            return;
        }
        if let (Some(start), Mode::Reuse, true) =
            (frame.start, frame.mode, frame.epoch == self.epoch)
        {
            let total = frame.node_start + self.group(start).map_or(0, |header| header.node_count);
            self.set_node_index(total);
            self.cursor = end;
            return;
        }
        while self.cursor < end {
            let (span, nodes) = match self.slots.get(self.cursor) {
                Some(slot) => (slot.span(), slot.nodes()),
                None => break,
            };
            self.cursor += span;
            self.add_nodes(nodes);
        }
    }

    /// Open the group at the cursor as-is. Used to walk down to a nested
    /// position without recomposing the groups on the way.
    pub fn enter_group(&mut self, log: &mut EditLog) -> GroupStart {
        if self.group_at_cursor().is_none() {
            panic!("enter_group at {} which is not a group", self.cursor);
        }
        let node_start = self.node_index();
        let start = self.push_reused(node_start, false);
        if self.top().is_node {
            self.use_node(log);
        }
        start
    }

    /// Remove the group at the cursor.
    pub fn remove_group(&mut self, log: &mut EditLog) {
        let size = match self.group_at_cursor() {
            Some(header) => header.size,
            None => panic!("remove_group at {} which is not a group", self.cursor),
        };
        let removed_nodes = self.remove_slots(self.cursor, size, log);
        let index = self.node_index();
        log.changes.remove(index, removed_nodes);
    }

    /// Move the sibling group at `from` to the cursor, keeping its content.
    pub fn move_group(&mut self, from: usize, log: &mut EditLog) {
        let end = self.frame_end();
        assert!(
            from > self.cursor && from < end,
            "move_group from {from} outside of the siblings after {}",
            self.cursor
        );
        let mut nodes_before = 0;
        let mut position = self.cursor;
        while position < from {
            let Some(slot) = self.slots.get(position) else {
                break;
            };
            nodes_before += slot.nodes();
            position += slot.span();
        }
        assert_eq!(position, from, "move_group source is not a sibling");
        let (key, size, count) = match self.group(from) {
            Some(header) => (header.key, header.size, header.node_count),
            None => panic!("move_group source {from} is not a group"),
        };
        let moved = self.slots.remove_range(from, size);
        self.slots.insert_many(self.cursor, moved);
        self.epoch += 1;
        let to = self.node_index();
        log.changes.move_nodes(to + nodes_before, to, count);
        log::trace!("moved group {key:#x} from slot {from} to {}", self.cursor);
    }

    /// Drop the content of the group just begun and continue it in insert mode.
    pub fn discard_group_content(&mut self, log: &mut EditLog) {
        self.trim_stale(log);
        let frame = self.top_mut();
        frame.mode = Mode::Insert;
        frame.key_index = None;
    }

    /// The slot at the cursor when reusing and still inside the group.
    pub fn peek(&self) -> Option<&SlotValue> {
        if self.is_inserting() || self.cursor >= self.frame_end() {
            return None;
        }
        self.slots.get(self.cursor)
    }

    pub fn peek_mut(&mut self) -> Option<&mut SlotValue> {
        if self.is_inserting() || self.cursor >= self.frame_end() {
            return None;
        }
        self.slots.get_mut(self.cursor)
    }

    /// Step over a non-group slot.
    pub fn skip_slot(&mut self) {
        match self.peek() {
            Some(SlotValue::Group(_)) => panic!("skip_slot at {} which is a group", self.cursor),
            Some(_) => self.cursor += 1,
            None => panic!("skip_slot past the end of the current group"),
        }
    }

    /// Store `value` at the cursor: replace a non-group slot, forgetting what
    /// it held, or insert a new slot.
    pub fn write_slot(&mut self, value: SlotValue, log: &mut EditLog) {
        assert!(
            !matches!(value, SlotValue::Group(_)),
            "groups are written through begin_group"
        );
        match self.peek_mut() {
            Some(slot) if !matches!(slot, SlotValue::Group(_)) => {
                let previous = std::mem::replace(slot, value);
                if let SlotValue::Object(object) = previous {
                    if let Some(observer) = object.observer {
                        log.remember.forgotten(observer);
                    }
                }
            }
            _ => {
                self.slots.insert(self.cursor, value);
                self.epoch += 1;
            }
        }
        self.cursor += 1;
    }

    fn expect_node_slot_position(&self, operation: &str) {
        let frame = self.top();
        assert!(
            frame.is_node && frame.start.map(|start| start + 1) == Some(self.cursor),
            "{operation} must directly follow start_node"
        );
    }

    /// Reuse the node recorded in the current node group and enter it.
    pub fn use_node(&mut self, log: &mut EditLog) -> Option<NodeId> {
        self.expect_node_slot_position("use_node");
        let id = match self.peek() {
            Some(SlotValue::Node(id)) => *id,
            _ => return None,
        };
        self.cursor += 1;
        self.enter_node(id, log);
        Some(id)
    }

    /// Record a freshly created node in the current node group and enter it.
    pub fn record_node(&mut self, id: NodeId, log: &mut EditLog) {
        self.expect_node_slot_position("record_node");
        self.write_slot(SlotValue::Node(id), log);
        self.enter_node(id, log);
    }

    fn enter_node(&mut self, id: NodeId, log: &mut EditLog) {
        self.top_mut().entered_node = true;
        self.nodes.push(NodeCursor {
            id: Some(id),
            index: 0,
        });
        log.changes.push_down(id);
    }

    /// Close every open group without trimming, leaving the table well formed.
    /// Used to recover from a panicking pass.
    pub fn abort_frames(&mut self, log: &mut EditLog) {
        while self.frames.len() > 1 {
            self.skip_to_group_end();
            self.end_group(log);
        }
        if !self.frames.is_empty() {
            self.skip_to_group_end();
            self.end_pass(log);
        }
    }

    /// Remove everything, emitting a single `Clear`.
    pub fn dispose(&mut self, log: &mut EditLog) {
        assert!(self.frames.is_empty(), "dispose during a pass");
        let removed = self.slots.clear();
        self.epoch += 1;
        forget_slots(&removed, log);
        log.changes.clear();
    }

    pub fn checkpoint(&self) -> CheckpointToken {
        CheckpointToken {
            cursor: self.cursor,
            epoch: self.epoch,
            frames: self
                .frames
                .iter()
                .map(|frame| (frame.start, frame.key))
                .collect(),
            node_index: self.node_index(),
        }
    }

    /// Restore the editing position captured by `token`.
    pub fn resume(&mut self, token: &CheckpointToken) -> Result<(), String> {
        if token.frames.len() != self.frames.len() {
            return Err(format!(
                "checkpoint depth {} but {} group(s) are open",
                token.frames.len(),
                self.frames.len()
            ));
        }
        if let Some(depth) = token
            .frames
            .iter()
            .zip(&self.frames)
            .position(|(&(start, key), frame)| frame.start != start || frame.key != key)
        {
            return Err(format!("open group at depth {depth} differs from the checkpoint"));
        }
        if token.epoch != self.epoch {
            return Err(format!(
                "table changed structurally since the checkpoint (epoch {} -> {})",
                token.epoch, self.epoch
            ));
        }
        self.cursor = token.cursor;
        self.set_node_index(token.node_index);
        Ok(())
    }

    fn remove_slots(&mut self, index: usize, count: usize, log: &mut EditLog) -> usize {
        let removed = self.slots.remove_range(index, count);
        self.epoch += 1;
        let nodes = top_level(&removed, 0..removed.len())
            .map(|position| removed[position].nodes())
            .sum();
        forget_slots(&removed, log);
        nodes
    }

    /// Check sizes, nesting and node counts of every closed group.
    pub fn verify(&self) -> Result<(), String> {
        let slots: Vec<&SlotValue> = self.slots.iter().collect();
        verify_range(&slots, 0, slots.len()).map(|_| ())
    }

    /// Indented rendering of the table, one slot per line.
    pub fn dump(&self) -> String {
        let slots: Vec<&SlotValue> = self.slots.iter().collect();
        let mut output = String::new();
        let mut ends: Vec<usize> = Vec::new();
        for (index, slot) in slots.iter().enumerate() {
            while ends.last().is_some_and(|&end| end <= index) {
                ends.pop();
            }
            let _ = writeln!(output, "{:4} {}{slot:?}", index, "  ".repeat(ends.len()));
            if let SlotValue::Group(header) = slot {
                ends.push(index + header.size);
            }
        }
        output
    }
}

fn top_level(slots: &[SlotValue], range: std::ops::Range<usize>) -> impl Iterator<Item = usize> + '_ {
    let end = range.end;
    let mut position = range.start;
    std::iter::from_fn(move || {
        if position >= end {
            return None;
        }
        let current = position;
        position += slots[current].span().max(1);
        Some(current)
    })
}

/// Forget the removed `slots`: nested groups before their parent's own
/// objects, later siblings before earlier ones.
fn forget_slots(slots: &[SlotValue], log: &mut EditLog) {
    forget_children(slots, 0..slots.len(), log);
}

fn forget_children(slots: &[SlotValue], range: std::ops::Range<usize>, log: &mut EditLog) {
    let children: SmallVec<[usize; 8]> = top_level(slots, range).collect();
    for &position in children.iter().rev() {
        if let SlotValue::Group(header) = &slots[position] {
            let end = (position + header.size).min(slots.len());
            forget_children(slots, position + 1..end, log);
            if let Some(anchor) = &header.anchor {
                anchor.invalidate();
            }
            if let Some(scope) = header.scope {
                log.released_scopes.push(scope);
            }
        }
    }
    for &position in children.iter().rev() {
        if let SlotValue::Object(object) = &slots[position] {
            if let Some(observer) = &object.observer {
                log.remember.forgotten(Rc::clone(observer));
            }
        }
    }
}

/// Returns the nodes contributed by `slots[start..end]`.
fn verify_range(slots: &[&SlotValue], start: usize, end: usize) -> Result<usize, String> {
    let mut position = start;
    let mut nodes = 0;
    while position < end {
        match slots[position] {
            SlotValue::Group(header) => {
                let group_end = position + header.size;
                if header.size == 0 || group_end > end {
                    return Err(format!(
                        "group {:#x} at {position} with size {} overruns its parent ending at {end}",
                        header.key, header.size
                    ));
                }
                let inner = verify_range(slots, position + 1, group_end)?;
                let expected = if header.flags.is_node {
                    usize::from(matches!(slots.get(position + 1), Some(SlotValue::Node(_))))
                } else {
                    inner
                };
                if header.node_count != expected {
                    return Err(format!(
                        "group {:#x} at {position} records {} node(s) but holds {expected}",
                        header.key, header.node_count
                    ));
                }
                nodes += header.node_count;
                position = group_end;
            }
            SlotValue::Node(id) => {
                let owner_is_node = position > 0
                    && matches!(slots[position - 1], SlotValue::Group(header) if header.flags.is_node);
                if !owner_is_node {
                    return Err(format!("node {id} at {position} outside a node group header"));
                }
                position += 1;
            }
            _ => position += 1,
        }
    }
    Ok(nodes)
}

#[cfg(test)]
#[path = "tests/slot_table_tests.rs"]
mod tests;

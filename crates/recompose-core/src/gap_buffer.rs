//! Gap buffer backing the slot table.
//!
//! Items live in a `Vec<Option<T>>` with a contiguous run of `None` (the gap)
//! somewhere inside it. Edits happen at the gap, so inserting or removing at
//! the editing cursor is amortized O(1) while moving the gap costs the
//! distance travelled.
//!
//! Items may carry an [`Anchor`]. Whenever an item changes physical position
//! its anchor is rewritten, so [`GapBuffer::resolve`] maps an anchor back to a
//! logical index in O(1).

use std::cell::Cell;
use std::fmt;
use std::rc::Rc;

const MIN_GAP: usize = 16;

struct AnchorCell {
    location: Cell<usize>,
    valid: Cell<bool>,
}

/// Shared handle to the physical location of an item in a [`GapBuffer`].
#[derive(Clone)]
pub struct Anchor {
    cell: Rc<AnchorCell>,
}

impl Anchor {
    fn new(location: usize) -> Self {
        Self {
            cell: Rc::new(AnchorCell {
                location: Cell::new(location),
                valid: Cell::new(true),
            }),
        }
    }

    pub fn is_valid(&self) -> bool {
        self.cell.valid.get()
    }

    /// Mark the anchored item as gone. Resolving the anchor yields `None` afterwards.
    pub fn invalidate(&self) {
        self.cell.valid.set(false);
    }

    pub fn ptr_eq(&self, other: &Anchor) -> bool {
        Rc::ptr_eq(&self.cell, &other.cell)
    }

    fn set_location(&self, location: usize) {
        self.cell.location.set(location);
    }
}

impl fmt::Debug for Anchor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_valid() {
            write!(f, "Anchor(@{})", self.cell.location.get())
        } else {
            f.write_str("Anchor(invalid)")
        }
    }
}

/// Items that may carry an [`Anchor`].
pub trait Anchored {
    fn anchor(&self) -> Option<&Anchor>;

    /// Storage for a lazily created anchor, or `None` if the item cannot be anchored.
    fn anchor_slot(&mut self) -> Option<&mut Option<Anchor>>;
}

pub struct GapBuffer<T> {
    items: Vec<Option<T>>,
    gap_start: usize,
    gap_end: usize,
}

impl<T> Default for GapBuffer<T> {
    fn default() -> Self {
        Self {
            items: Vec::new(),
            gap_start: 0,
            gap_end: 0,
        }
    }
}

impl<T: Anchored> GapBuffer<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.items.len() - self.gap_len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn gap_len(&self) -> usize {
        self.gap_end - self.gap_start
    }

    fn physical(&self, index: usize) -> usize {
        if index < self.gap_start {
            index
        } else {
            index + self.gap_len()
        }
    }

    pub fn get(&self, index: usize) -> Option<&T> {
        if index >= self.len() {
            return None;
        }
        self.items[self.physical(index)].as_ref()
    }

    pub fn get_mut(&mut self, index: usize) -> Option<&mut T> {
        if index >= self.len() {
            return None;
        }
        let physical = self.physical(index);
        self.items[physical].as_mut()
    }

    /// Anchor for the item at `index`, created on first request.
    pub fn anchor(&mut self, index: usize) -> Option<Anchor> {
        if index >= self.len() {
            return None;
        }
        let physical = self.physical(index);
        let slot = self.items[physical].as_mut()?.anchor_slot()?;
        Some(slot.get_or_insert_with(|| Anchor::new(physical)).clone())
    }

    /// Logical index of the anchored item, if it is still in the buffer.
    pub fn resolve(&self, anchor: &Anchor) -> Option<usize> {
        if !anchor.is_valid() {
            return None;
        }
        let location = anchor.cell.location.get();
        if location < self.gap_start {
            Some(location)
        } else if location >= self.gap_end && location < self.items.len() {
            Some(location - self.gap_len())
        } else {
            None
        }
    }

    pub fn insert(&mut self, index: usize, item: T) {
        assert!(
            index <= self.len(),
            "gap buffer insert at {index} beyond length {}",
            self.len()
        );
        self.move_gap(index);
        if self.gap_start == self.gap_end {
            self.grow(1);
        }
        let physical = self.gap_start;
        if let Some(anchor) = item.anchor() {
            anchor.set_location(physical);
        }
        self.items[physical] = Some(item);
        self.gap_start += 1;
    }

    pub fn insert_many(&mut self, index: usize, items: impl IntoIterator<Item = T>) {
        for (offset, item) in items.into_iter().enumerate() {
            self.insert(index + offset, item);
        }
    }

    pub fn remove(&mut self, index: usize) -> T {
        let mut removed = self.remove_range(index, 1);
        match removed.pop() {
            Some(item) => item,
            None => panic!("gap buffer remove at {index} beyond length {}", self.len()),
        }
    }

    /// Remove `count` items starting at `index`. Anchors are left untouched
    /// so the caller can re-insert the items elsewhere.
    pub fn remove_range(&mut self, index: usize, count: usize) -> Vec<T> {
        assert!(
            index + count <= self.len(),
            "gap buffer range {index}..{} beyond length {}",
            index + count,
            self.len()
        );
        self.move_gap(index);
        let mut removed = Vec::with_capacity(count);
        for physical in self.gap_end..self.gap_end + count {
            if let Some(item) = self.items[physical].take() {
                removed.push(item);
            }
        }
        self.gap_end += count;
        removed
    }

    pub fn clear(&mut self) -> Vec<T> {
        let len = self.len();
        self.remove_range(0, len)
    }

    pub fn iter(&self) -> impl Iterator<Item = &T> + '_ {
        self.items[..self.gap_start]
            .iter()
            .chain(self.items[self.gap_end..].iter())
            .filter_map(Option::as_ref)
    }

    fn move_gap(&mut self, index: usize) {
        if index < self.gap_start {
            let count = self.gap_start - index;
            for offset in (0..count).rev() {
                let from = index + offset;
                let to = self.gap_end - count + offset;
                self.relocate(from, to);
            }
            self.gap_start = index;
            self.gap_end -= count;
        } else if index > self.gap_start {
            let count = index - self.gap_start;
            for offset in 0..count {
                let from = self.gap_end + offset;
                let to = self.gap_start + offset;
                self.relocate(from, to);
            }
            self.gap_start += count;
            self.gap_end += count;
        }
    }

    fn relocate(&mut self, from: usize, to: usize) {
        let item = self.items[from].take();
        if let Some(anchor) = item.as_ref().and_then(Anchored::anchor) {
            anchor.set_location(to);
        }
        self.items[to] = item;
    }

    fn grow(&mut self, needed: usize) {
        let extra = needed.max(self.items.len()).max(MIN_GAP);
        let tail_len = self.items.len() - self.gap_end;
        let mut items: Vec<Option<T>> = Vec::with_capacity(self.items.len() + extra);
        items.extend(self.items.drain(..self.gap_start));
        items.extend((0..self.gap_len() + extra).map(|_| None));
        let new_gap_end = items.len();
        let old_gap = self.gap_len();
        for item in self.items.drain(..).skip(old_gap) {
            if let Some(anchor) = item.as_ref().and_then(Anchored::anchor) {
                anchor.set_location(items.len());
            }
            items.push(item);
        }
        debug_assert_eq!(items.len(), new_gap_end + tail_len);
        self.items = items;
        self.gap_end = new_gap_end;
    }
}

#[cfg(test)]
#[path = "tests/gap_buffer_tests.rs"]
mod tests;

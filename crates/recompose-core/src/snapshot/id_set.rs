//! Persistent set of snapshot ids.
//!
//! Invalid sets are dominated by contiguous runs: a nested snapshot inherits
//! every id between its parent and itself, and open snapshots are usually
//! allocated back to back. The set therefore stores sorted, disjoint,
//! half-open ranges and returns a new set from every mutation.

use smallvec::SmallVec;
use std::fmt;

pub type SnapshotId = u64;

type Ranges = SmallVec<[(SnapshotId, SnapshotId); 4]>;

#[derive(Clone, Default, PartialEq, Eq)]
pub struct SnapshotIdSet {
    ranges: Ranges,
}

impl SnapshotIdSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }

    pub fn get(&self, id: SnapshotId) -> bool {
        let index = self.ranges.partition_point(|&(_, end)| end <= id);
        self.ranges
            .get(index)
            .is_some_and(|&(start, _)| start <= id)
    }

    pub fn set(&self, id: SnapshotId) -> Self {
        self.add_range(id, id + 1)
    }

    /// Adds every id in `from..until`.
    pub fn add_range(&self, from: SnapshotId, until: SnapshotId) -> Self {
        let mut ranges = self.ranges.clone();
        insert_range(&mut ranges, from, until);
        Self { ranges }
    }

    pub fn clear(&self, id: SnapshotId) -> Self {
        if !self.get(id) {
            return self.clone();
        }
        let mut ranges = self.ranges.clone();
        remove_range(&mut ranges, id, id + 1);
        Self { ranges }
    }

    pub fn or(&self, other: &SnapshotIdSet) -> Self {
        if other.is_empty() {
            return self.clone();
        }
        let mut ranges = self.ranges.clone();
        for &(start, end) in &other.ranges {
            insert_range(&mut ranges, start, end);
        }
        Self { ranges }
    }

    pub fn and_not(&self, other: &SnapshotIdSet) -> Self {
        if other.is_empty() || self.is_empty() {
            return self.clone();
        }
        let mut ranges = self.ranges.clone();
        for &(start, end) in &other.ranges {
            remove_range(&mut ranges, start, end);
        }
        Self { ranges }
    }

    /// Lowest id in the set, or `default` when empty.
    pub fn lowest(&self, default: SnapshotId) -> SnapshotId {
        self.ranges.first().map_or(default, |&(start, _)| start)
    }

    pub fn iter(&self) -> impl Iterator<Item = SnapshotId> + '_ {
        self.ranges.iter().flat_map(|&(start, end)| start..end)
    }
}

fn insert_range(ranges: &mut Ranges, mut start: SnapshotId, mut end: SnapshotId) {
    if start >= end {
        return;
    }
    // Ranges touching [start, end) are merged, including adjacent ones.
    let first = ranges.partition_point(|&(_, range_end)| range_end < start);
    let mut last = first;
    while last < ranges.len() && ranges[last].0 <= end {
        start = start.min(ranges[last].0);
        end = end.max(ranges[last].1);
        last += 1;
    }
    ranges.drain(first..last);
    ranges.insert(first, (start, end));
}

fn remove_range(ranges: &mut Ranges, start: SnapshotId, end: SnapshotId) {
    if start >= end {
        return;
    }
    let mut kept = Ranges::new();
    for &(range_start, range_end) in ranges.iter() {
        if range_end <= start || range_start >= end {
            kept.push((range_start, range_end));
            continue;
        }
        if range_start < start {
            kept.push((range_start, start));
        }
        if range_end > end {
            kept.push((end, range_end));
        }
    }
    *ranges = kept;
}

impl fmt::Debug for SnapshotIdSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut list = f.debug_list();
        for &(start, end) in &self.ranges {
            if end - start == 1 {
                list.entry(&start);
            } else {
                list.entry(&format_args!("{start}..{end}"));
            }
        }
        list.finish()
    }
}

impl FromIterator<SnapshotId> for SnapshotIdSet {
    fn from_iter<I: IntoIterator<Item = SnapshotId>>(iter: I) -> Self {
        let mut ranges = Ranges::new();
        for id in iter {
            insert_range(&mut ranges, id, id + 1);
        }
        Self { ranges }
    }
}

#[cfg(test)]
#[path = "tests/id_set_tests.rs"]
mod tests;

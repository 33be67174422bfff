//! Generational arena for registries that would otherwise hold weak references.
//!
//! Entries are removed explicitly. A slot freed by [`GenerationalArena::remove`]
//! is reused with a bumped generation, so an [`ArenaId`] that outlives its entry
//! resolves to `None` rather than aliasing whatever took its place.

use std::fmt;

#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ArenaId {
    index: u32,
    generation: u32,
}

impl ArenaId {
    pub fn index(&self) -> usize {
        self.index as usize
    }

    pub fn generation(&self) -> u32 {
        self.generation
    }
}

impl fmt::Debug for ArenaId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}v{}", self.index, self.generation)
    }
}

enum Entry<T> {
    Occupied { generation: u32, value: T },
    Vacant { generation: u32 },
}

pub struct GenerationalArena<T> {
    entries: Vec<Entry<T>>,
    free: Vec<u32>,
    len: usize,
}

impl<T> Default for GenerationalArena<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> GenerationalArena<T> {
    pub fn new() -> Self {
        Self {
            entries: Vec::new(),
            free: Vec::new(),
            len: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn insert(&mut self, value: T) -> ArenaId {
        self.len += 1;
        if let Some(index) = self.free.pop() {
            let entry = &mut self.entries[index as usize];
            let generation = match entry {
                Entry::Vacant { generation } => generation.wrapping_add(1),
                Entry::Occupied { .. } => unreachable!("free list pointed at an occupied slot"),
            };
            *entry = Entry::Occupied { generation, value };
            return ArenaId { index, generation };
        }
        let index = u32::try_from(self.entries.len()).unwrap_or_else(|_| {
            panic!("generational arena exceeded {} entries", u32::MAX)
        });
        self.entries.push(Entry::Occupied {
            generation: 0,
            value,
        });
        ArenaId {
            index,
            generation: 0,
        }
    }

    /// Insert a value built from the id it is about to be stored under.
    pub fn insert_with(&mut self, build: impl FnOnce(ArenaId) -> T) -> ArenaId {
        let id = self.next_id();
        let inserted = self.insert(build(id));
        debug_assert_eq!(id, inserted);
        inserted
    }

    fn next_id(&self) -> ArenaId {
        match self.free.last() {
            Some(&index) => match &self.entries[index as usize] {
                Entry::Vacant { generation } => ArenaId {
                    index,
                    generation: generation.wrapping_add(1),
                },
                Entry::Occupied { .. } => unreachable!("free list pointed at an occupied slot"),
            },
            None => ArenaId {
                index: self.entries.len() as u32,
                generation: 0,
            },
        }
    }

    pub fn get(&self, id: ArenaId) -> Option<&T> {
        match self.entries.get(id.index as usize)? {
            Entry::Occupied { generation, value } if *generation == id.generation => Some(value),
            _ => None,
        }
    }

    pub fn get_mut(&mut self, id: ArenaId) -> Option<&mut T> {
        match self.entries.get_mut(id.index as usize)? {
            Entry::Occupied { generation, value } if *generation == id.generation => Some(value),
            _ => None,
        }
    }

    pub fn contains(&self, id: ArenaId) -> bool {
        self.get(id).is_some()
    }

    pub fn remove(&mut self, id: ArenaId) -> Option<T> {
        let entry = self.entries.get_mut(id.index as usize)?;
        match &*entry {
            Entry::Occupied { generation, .. } if *generation == id.generation => {}
            _ => return None,
        }
        let vacant = Entry::Vacant {
            generation: id.generation,
        };
        match std::mem::replace(entry, vacant) {
            Entry::Occupied { value, .. } => {
                self.free.push(id.index);
                self.len -= 1;
                Some(value)
            }
            Entry::Vacant { .. } => None,
        }
    }

    /// Evict every entry for which `keep` returns false.
    pub fn retain(&mut self, mut keep: impl FnMut(ArenaId, &mut T) -> bool) {
        let mut evicted = Vec::new();
        for (index, entry) in self.entries.iter_mut().enumerate() {
            if let Entry::Occupied { generation, value } = entry {
                let id = ArenaId {
                    index: index as u32,
                    generation: *generation,
                };
                if !keep(id, value) {
                    evicted.push(id);
                }
            }
        }
        for id in evicted {
            self.remove(id);
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (ArenaId, &T)> {
        self.entries
            .iter()
            .enumerate()
            .filter_map(|(index, entry)| match entry {
                Entry::Occupied { generation, value } => Some((
                    ArenaId {
                        index: index as u32,
                        generation: *generation,
                    },
                    value,
                )),
                Entry::Vacant { .. } => None,
            })
    }

    pub fn ids(&self) -> Vec<ArenaId> {
        self.iter().map(|(id, _)| id).collect()
    }
}

#[cfg(test)]
#[path = "tests/arena_tests.rs"]
mod tests;

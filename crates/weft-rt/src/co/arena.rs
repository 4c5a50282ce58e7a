// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Generational arena owning every coroutine of a request.
//!
//! Handles carry a generation so a handle to a reclaimed slot never
//! aliases whatever reuses that slot later.

use std::fmt;

/// Stable handle to a coroutine slot.
#[derive(Copy, Clone, PartialEq, Eq, Hash)]
pub struct CoId {
    index: u32,
    generation: u32,
}

impl CoId {
    pub fn index(&self) -> u32 {
        self.index
    }

    pub fn generation(&self) -> u32 {
        self.generation
    }
}

impl fmt::Debug for CoId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CoId({}v{})", self.index, self.generation)
    }
}

impl fmt::Display for CoId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}v{}", self.index, self.generation)
    }
}

enum Slot<T> {
    Occupied { value: T, generation: u32 },
    Vacant { next_free: u32, generation: u32 },
}

const FREE_LIST_END: u32 = u32::MAX;

pub(crate) struct Arena<T> {
    slots: Vec<Slot<T>>,
    free_head: u32,
    len: usize,
}

impl<T> Arena<T> {
    pub fn new() -> Self {
        Self {
            slots: Vec::new(),
            free_head: FREE_LIST_END,
            len: 0,
        }
    }

    pub fn insert(&mut self, value: T) -> CoId {
        self.len += 1;
        if self.free_head == FREE_LIST_END {
            let index = self.slots.len() as u32;
            self.slots.push(Slot::Occupied {
                value,
                generation: 0,
            });
            return CoId {
                index,
                generation: 0,
            };
        }

        let index = self.free_head;
        let slot = &mut self.slots[index as usize];
        let (next_free, generation) = match slot {
            Slot::Vacant {
                next_free,
                generation,
            } => (*next_free, *generation),
            Slot::Occupied { .. } => unreachable!("free list pointed to occupied slot"),
        };
        *slot = Slot::Occupied { value, generation };
        self.free_head = next_free;
        CoId { index, generation }
    }

    pub fn get(&self, id: CoId) -> Option<&T> {
        match self.slots.get(id.index as usize)? {
            Slot::Occupied { value, generation } if *generation == id.generation => Some(value),
            _ => None,
        }
    }

    pub fn get_mut(&mut self, id: CoId) -> Option<&mut T> {
        match self.slots.get_mut(id.index as usize)? {
            Slot::Occupied { value, generation } if *generation == id.generation => Some(value),
            _ => None,
        }
    }

    pub fn contains(&self, id: CoId) -> bool {
        self.get(id).is_some()
    }

    /// Free the slot, bumping its generation so stale handles miss.
    pub fn remove(&mut self, id: CoId) -> Option<T> {
        let slot = self.slots.get_mut(id.index as usize)?;
        match slot {
            Slot::Occupied { generation, .. } if *generation == id.generation => {}
            _ => return None,
        }
        let vacant = Slot::Vacant {
            next_free: self.free_head,
            generation: id.generation.wrapping_add(1),
        };
        let Slot::Occupied { value, .. } = std::mem::replace(slot, vacant) else {
            return None;
        };
        self.free_head = id.index;
        self.len -= 1;
        Some(value)
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn iter(&self) -> impl Iterator<Item = (CoId, &T)> {
        self.slots.iter().enumerate().filter_map(|(i, slot)| match slot {
            Slot::Occupied { value, generation } => Some((
                CoId {
                    index: i as u32,
                    generation: *generation,
                },
                value,
            )),
            Slot::Vacant { .. } => None,
        })
    }

    pub fn ids(&self) -> Vec<CoId> {
        self.iter().map(|(id, _)| id).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insert_get_remove() {
        let mut arena = Arena::new();
        let a = arena.insert("a");
        let b = arena.insert("b");
        assert_eq!(arena.get(a), Some(&"a"));
        assert_eq!(arena.len(), 2);
        assert_eq!(arena.remove(a), Some("a"));
        assert_eq!(arena.get(a), None);
        assert_eq!(arena.get(b), Some(&"b"));
        assert_eq!(arena.len(), 1);
    }

    #[test]
    fn stale_handle_misses_reused_slot() {
        let mut arena = Arena::new();
        let a = arena.insert(1);
        arena.remove(a);
        let c = arena.insert(2);
        assert_eq!(c.index(), a.index());
        assert_ne!(c.generation(), a.generation());
        assert_eq!(arena.get(a), None);
        assert_eq!(arena.remove(a), None);
        assert_eq!(arena.get(c), Some(&2));
    }

    #[test]
    fn iter_skips_vacant() {
        let mut arena = Arena::new();
        let a = arena.insert(1);
        let b = arena.insert(2);
        let c = arena.insert(3);
        arena.remove(b);
        assert_eq!(arena.ids(), vec![a, c]);
    }
}

//! Generational slot registry backing the subscriber lists.
//!
//! Both engines own their handlers outright: the registry stores the handler
//! records, and [`Subscription`](crate::Subscription) handles carry a
//! [`SlotId`] to prune their slot on drop. Generation counters make stale ids
//! harmless; an id whose slot was recycled simply misses.
//!
//! # Design
//!
//! - Records live in a `Vec` of slots; vacant slots chain into a free list
//!   and are reused by later inserts.
//! - Every reuse bumps the slot generation, so an outdated `SlotId` can never
//!   remove someone else's handler.
//! - Completion drains the registry in one pass, handing the caller every
//!   live record while leaving the registry reusable.

use core::fmt;
use core::mem;

/// Identifier of one registered record: raw index plus generation.
#[derive(Clone, Copy, PartialEq, Eq)]
pub(crate) struct SlotId {
    index: u32,
    generation: u32,
}

impl fmt::Debug for SlotId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SlotId({}:{})", self.index, self.generation)
    }
}

enum Slot<T> {
    Occupied { value: T, generation: u32 },
    Vacant { next_free: Option<u32>, generation: u32 },
}

/// Slot registry with generation-checked removal.
pub(crate) struct Registry<T> {
    slots: Vec<Slot<T>>,
    free_head: Option<u32>,
    len: usize,
}

impl<T> Default for Registry<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Registry<T> {
    pub(crate) const fn new() -> Self {
        Self {
            slots: Vec::new(),
            free_head: None,
            len: 0,
        }
    }

    pub(crate) const fn len(&self) -> usize {
        self.len
    }

    #[cfg(test)]
    pub(crate) const fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Inserts a record, reusing a vacant slot when one exists.
    pub(crate) fn insert(&mut self, value: T) -> SlotId {
        self.len += 1;

        if let Some(free_index) = self.free_head {
            let slot = &mut self.slots[free_index as usize];
            match slot {
                Slot::Vacant {
                    next_free,
                    generation,
                } => {
                    let generation = *generation;
                    self.free_head = *next_free;
                    *slot = Slot::Occupied { value, generation };
                    SlotId {
                        index: free_index,
                        generation,
                    }
                }
                Slot::Occupied { .. } => unreachable!("free list pointed to occupied slot"),
            }
        } else {
            let index = u32::try_from(self.slots.len()).expect("registry overflow");
            self.slots.push(Slot::Occupied {
                value,
                generation: 0,
            });
            SlotId {
                index,
                generation: 0,
            }
        }
    }

    /// Removes the record at `id`, returning it if the id is still current.
    pub(crate) fn remove(&mut self, id: SlotId) -> Option<T> {
        let slot = self.slots.get_mut(id.index as usize)?;

        match slot {
            Slot::Occupied { generation, .. } if *generation == id.generation => {
                let next_generation = generation.wrapping_add(1);
                let old = mem::replace(
                    slot,
                    Slot::Vacant {
                        next_free: self.free_head,
                        generation: next_generation,
                    },
                );
                self.free_head = Some(id.index);
                self.len -= 1;
                match old {
                    Slot::Occupied { value, .. } => Some(value),
                    Slot::Vacant { .. } => unreachable!(),
                }
            }
            _ => None,
        }
    }

    /// Returns a reference to the record at `id`, if still current.
    #[cfg(test)]
    pub(crate) fn get(&self, id: SlotId) -> Option<&T> {
        match self.slots.get(id.index as usize)? {
            Slot::Occupied { value, generation } if *generation == id.generation => Some(value),
            _ => None,
        }
    }

    /// Empties the registry, returning every live record.
    ///
    /// Generations of vacated slots advance, so ids handed out before the
    /// drain stay invalid even if their slot is reused afterwards.
    pub(crate) fn drain(&mut self) -> Vec<T> {
        let mut out = Vec::with_capacity(self.len);
        for (index, slot) in self.slots.iter_mut().enumerate() {
            if let Slot::Occupied { generation, .. } = slot {
                let next_generation = generation.wrapping_add(1);
                let old = mem::replace(
                    slot,
                    Slot::Vacant {
                        next_free: self.free_head,
                        generation: next_generation,
                    },
                );
                self.free_head = Some(index as u32);
                if let Slot::Occupied { value, .. } = old {
                    out.push(value);
                }
            }
        }
        self.len = 0;
        out
    }

    /// Iterates over all live records.
    pub(crate) fn iter(&self) -> impl Iterator<Item = &T> {
        self.slots.iter().filter_map(|slot| match slot {
            Slot::Occupied { value, .. } => Some(value),
            Slot::Vacant { .. } => None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insert_and_get() {
        let mut registry = Registry::new();
        let id = registry.insert(42);
        assert_eq!(registry.get(id), Some(&42));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn remove_invalidates_and_reuses() {
        let mut registry = Registry::new();
        let first = registry.insert(1);
        let second = registry.insert(2);

        assert_eq!(registry.remove(first), Some(1));
        assert_eq!(registry.get(first), None);
        assert_eq!(registry.remove(first), None);

        let third = registry.insert(3);
        assert_eq!(third.index, first.index);
        assert_ne!(third.generation, first.generation);

        assert_eq!(registry.get(second), Some(&2));
        assert_eq!(registry.get(third), Some(&3));
    }

    #[test]
    fn drain_returns_all_and_invalidates_ids() {
        let mut registry = Registry::new();
        let a = registry.insert("a");
        registry.insert("b");
        let c = registry.insert("c");
        registry.remove(c);

        let mut drained = registry.drain();
        drained.sort_unstable();
        assert_eq!(drained, vec!["a", "b"]);
        assert!(registry.is_empty());
        assert_eq!(registry.get(a), None);
        assert_eq!(registry.remove(a), None);

        // Slots are reusable after a drain, and old ids still miss.
        let fresh = registry.insert("d");
        assert_eq!(registry.get(fresh), Some(&"d"));
        assert_eq!(registry.get(a), None);
    }

    #[test]
    fn iter_skips_vacant_slots() {
        let mut registry = Registry::new();
        registry.insert(1);
        let middle = registry.insert(2);
        registry.insert(3);
        registry.remove(middle);

        let values: Vec<i32> = registry.iter().copied().collect();
        assert_eq!(values, vec![1, 3]);
    }
}

//! Generational arena for runtime records.
//!
//! Task and scope records live in arenas so that identifiers are small,
//! copyable indices rather than reference-counted pointers. Each slot carries
//! a generation counter; an index minted for a removed record never resolves
//! against the slot's new occupant.

use core::fmt;
use core::hash::{Hash, Hasher};

/// An index into an [`Arena`], paired with the slot generation it was minted
/// for.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct ArenaIndex {
    slot: u32,
    generation: u32,
}

impl ArenaIndex {
    /// Builds an index from raw parts. Primarily for tests.
    #[must_use]
    pub const fn new(slot: u32, generation: u32) -> Self {
        Self { slot, generation }
    }

    /// The raw slot number.
    #[must_use]
    pub const fn slot(self) -> u32 {
        self.slot
    }

    /// The generation this index was minted for.
    #[must_use]
    pub const fn generation(self) -> u32 {
        self.generation
    }
}

impl fmt::Debug for ArenaIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ArenaIndex({}:{})", self.slot, self.generation)
    }
}

impl Hash for ArenaIndex {
    fn hash<H: Hasher>(&self, state: &mut H) {
        state.write_u64((u64::from(self.slot) << 32) | u64::from(self.generation));
    }
}

struct Slot<T> {
    generation: u32,
    value: Option<T>,
}

/// A growable arena with generation-checked indices.
///
/// Freed slots are recycled through a free list; recycling bumps the slot
/// generation so stale indices miss.
pub struct Arena<T> {
    slots: Vec<Slot<T>>,
    free: Vec<u32>,
    live: usize,
}

impl<T> Default for Arena<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Arena<T> {
    /// Creates an empty arena.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            slots: Vec::new(),
            free: Vec::new(),
            live: 0,
        }
    }

    /// Number of live entries.
    #[must_use]
    pub const fn len(&self) -> usize {
        self.live
    }

    /// True if no entries are live.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.live == 0
    }

    /// Inserts a value and returns its index.
    pub fn insert(&mut self, value: T) -> ArenaIndex {
        self.insert_with(|_| value)
    }

    /// Inserts the value produced by `f`, which receives the index the value
    /// will live at. Lets records embed their own id without a fix-up pass.
    pub fn insert_with<F>(&mut self, f: F) -> ArenaIndex
    where
        F: FnOnce(ArenaIndex) -> T,
    {
        self.live += 1;
        if let Some(slot) = self.free.pop() {
            let generation = self.slots[slot as usize].generation;
            let index = ArenaIndex { slot, generation };
            self.slots[slot as usize].value = Some(f(index));
            index
        } else {
            let slot = u32::try_from(self.slots.len()).expect("arena slot overflow");
            let index = ArenaIndex {
                slot,
                generation: 0,
            };
            self.slots.push(Slot {
                generation: 0,
                value: Some(f(index)),
            });
            index
        }
    }

    /// Removes and returns the value at `index`, if the index is still live.
    pub fn remove(&mut self, index: ArenaIndex) -> Option<T> {
        let slot = self.slots.get_mut(index.slot as usize)?;
        if slot.generation != index.generation || slot.value.is_none() {
            return None;
        }
        let value = slot.value.take();
        slot.generation = slot.generation.wrapping_add(1);
        self.free.push(index.slot);
        self.live -= 1;
        value
    }

    /// Shared access to the value at `index`.
    #[must_use]
    pub fn get(&self, index: ArenaIndex) -> Option<&T> {
        let slot = self.slots.get(index.slot as usize)?;
        if slot.generation != index.generation {
            return None;
        }
        slot.value.as_ref()
    }

    /// Mutable access to the value at `index`.
    pub fn get_mut(&mut self, index: ArenaIndex) -> Option<&mut T> {
        let slot = self.slots.get_mut(index.slot as usize)?;
        if slot.generation != index.generation {
            return None;
        }
        slot.value.as_mut()
    }

    /// True if `index` resolves to a live entry.
    #[must_use]
    pub fn contains(&self, index: ArenaIndex) -> bool {
        self.get(index).is_some()
    }

    /// Iterates over live entries.
    pub fn iter(&self) -> impl Iterator<Item = (ArenaIndex, &T)> {
        self.slots.iter().enumerate().filter_map(|(i, slot)| {
            slot.value.as_ref().map(|value| {
                (
                    ArenaIndex {
                        slot: i as u32,
                        generation: slot.generation,
                    },
                    value,
                )
            })
        })
    }
}

impl<T: fmt::Debug> fmt::Debug for Arena<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Arena").field("live", &self.live).finish()
    }
}

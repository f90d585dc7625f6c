//! Handle table: stable indices in front of movable arena blocks.
//!
//! Each slot either binds a value to its arena block or sits on the free
//! list, in which case its `offset` field is reused as the link to the next
//! free slot. Slots are handed out from the free list first and from a
//! fresh-slot cursor second, so the table only grows as far as it has to.

use log::trace;

use crate::{MemError, Result, value::Shape};

/// End of the embedded free list.
pub const NO_SLOT: u32 = u32::MAX;

/// Reachability of a bound value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mark {
    /// Reachable from an open scope (or the root frame).
    Marked,
    /// Its scope ended; the collector may reclaim it.
    Unmarked,
}

/// Opaque reference to a managed value.
///
/// The address is the slot index and never changes for the lifetime of the
/// value, compaction included. The generation tells a stale handle apart
/// from a newer value that reuses the same slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Handle {
    index: u32,
    generation: u32,
}

impl Handle {
    /// The small integer address clients see.
    #[inline]
    pub fn address(self) -> u32 {
        self.index
    }

    #[inline]
    pub(crate) fn index(self) -> usize {
        self.index as usize
    }
}

#[derive(Debug, Clone, Copy)]
pub struct Slot {
    /// Header index of the bound block.
    word: u32,
    /// Byte offset into the payload, or the next free slot while unbound.
    offset: u32,
    allocated: bool,
    mark: Mark,
    generation: u32,
    shape: Shape,
}

impl Slot {
    fn unbound(next: u32, generation: u32, shape: Shape) -> Self {
        Self {
            word: 0,
            offset: next,
            allocated: false,
            mark: Mark::Unmarked,
            generation,
            shape,
        }
    }

    #[inline]
    pub fn word(&self) -> usize {
        self.word as usize
    }

    #[inline]
    pub fn offset(&self) -> usize {
        self.offset as usize
    }

    #[inline]
    pub fn is_allocated(&self) -> bool {
        self.allocated
    }

    #[inline]
    pub fn mark(&self) -> Mark {
        self.mark
    }

    #[inline]
    pub fn shape(&self) -> Shape {
        self.shape
    }

    /// Bound to a block but no longer reachable.
    #[inline]
    pub fn is_garbage(&self) -> bool {
        self.allocated && self.mark == Mark::Unmarked
    }
}

/// Physical location a handle resolves to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Location {
    pub word: usize,
    pub offset: usize,
    pub shape: Shape,
}

#[derive(Debug)]
pub struct HandleTable {
    slots: Vec<Slot>,
    capacity: usize,
    head: u32,
    live: usize,
}

impl HandleTable {
    pub fn new(capacity: usize) -> Self {
        debug_assert!(capacity < NO_SLOT as usize);
        Self {
            slots: Vec::new(),
            capacity,
            head: NO_SLOT,
            live: 0,
        }
    }

    /// Number of bound slots.
    #[inline]
    pub fn live(&self) -> usize {
        self.live
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Slots touched so far; every bound slot has an index below this.
    #[inline]
    pub fn high_water(&self) -> usize {
        self.slots.len()
    }

    /// Whether `alloc` would find a slot.
    #[inline]
    pub fn has_room(&self) -> bool {
        self.head != NO_SLOT || self.slots.len() < self.capacity
    }

    /// Binds a fresh slot to the block at `word`. The slot starts marked.
    pub fn alloc(&mut self, word: usize, offset: usize, shape: Shape) -> Result<Handle> {
        let index = if self.head != NO_SLOT {
            let index = self.head;
            self.head = self.slots[index as usize].offset;
            index
        } else if self.slots.len() < self.capacity {
            let index = self.slots.len() as u32;
            self.slots.push(Slot::unbound(NO_SLOT, 0, shape));
            index
        } else {
            return Err(MemError::HandleTableFull);
        };

        let slot = &mut self.slots[index as usize];
        slot.word = word as u32;
        slot.offset = offset as u32;
        slot.allocated = true;
        slot.mark = Mark::Marked;
        slot.shape = shape;
        self.live += 1;

        trace!("table: slot {index} -> word {word}+{offset}");
        Ok(Handle {
            index,
            generation: slot.generation,
        })
    }

    /// Unbinds slot `index` and pushes it onto the free list. Returns the
    /// header index of the block it was bound to.
    ///
    /// The caller is responsible for releasing that block.
    pub fn free(&mut self, index: usize) -> usize {
        let head = self.head;
        let slot = &mut self.slots[index];
        debug_assert!(slot.allocated, "freeing unbound slot {index}");

        let word = slot.word();
        *slot = Slot::unbound(head, slot.generation.wrapping_add(1), slot.shape);
        self.head = index as u32;
        self.live -= 1;

        trace!("table: freed slot {index} (was word {word})");
        word
    }

    /// Resolves a handle for a read or write.
    ///
    /// Fails unless the slot is bound, marked, and still owned by the
    /// generation the handle was issued for.
    pub fn resolve(&self, handle: Handle) -> Result<Location> {
        let slot = self.slot_of(handle).ok_or(MemError::InvalidHandle)?;
        if slot.mark != Mark::Marked {
            return Err(MemError::InvalidHandle);
        }
        Ok(Location {
            word: slot.word(),
            offset: slot.offset(),
            shape: slot.shape,
        })
    }

    /// Bound, marked, and of the right generation.
    pub fn is_live(&self, handle: Handle) -> bool {
        self.resolve(handle).is_ok()
    }

    /// The slot bound to `handle`, marked or not.
    pub fn slot_of(&self, handle: Handle) -> Option<&Slot> {
        self.slots.get(handle.index()).filter(|s| s.allocated && s.generation == handle.generation)
    }

    /// Clears the mark of `handle` if it still owns its slot.
    pub fn unmark(&mut self, handle: Handle) -> bool {
        match self.slots.get_mut(handle.index()) {
            Some(slot) if slot.allocated && slot.generation == handle.generation => {
                slot.mark = Mark::Unmarked;
                true
            }
            _ => false,
        }
    }

    /// Iterates `(index, slot)` over every slot ever handed out.
    pub fn slots(&self) -> impl Iterator<Item = (usize, &Slot)> {
        self.slots.iter().enumerate()
    }

    /// Rewrites the header index of every bound slot through `relocate`.
    /// Returns how many slots changed.
    pub fn rebind_all(&mut self, mut relocate: impl FnMut(usize) -> usize) -> usize {
        let mut moved = 0;
        for slot in self.slots.iter_mut().filter(|s| s.allocated) {
            let target = relocate(slot.word());
            if target != slot.word() {
                slot.word = target as u32;
                moved += 1;
            }
        }
        moved
    }
}

// src/heap/arena.rs
//! Generational slot arena
//!
//! Handles carry the slot index plus the generation the slot had when the
//! cell was allocated. Freeing a slot bumps its generation, so a stale handle
//! never resolves to whatever cell reuses the slot later.

use crate::config::HeapLimits;
use ahash::AHashSet;
use thiserror::Error;

/// Allocation rejected by a heap
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AllocError {
    #[error("heap limit of {limit} live cells reached")]
    LimitReached { limit: usize },

    #[error("heap address space exhausted")]
    AddressSpace,

    #[error("allocation rejected by injected failure")]
    Injected,

    #[error("invalid array length {length}")]
    InvalidArrayLength { length: usize },
}

/// Handle to one arena slot
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SlotId {
    index: u32,
    generation: u32,
}

impl SlotId {
    pub fn index(self) -> u32 {
        self.index
    }

    pub fn generation(self) -> u32 {
        self.generation
    }
}

#[derive(Debug)]
struct Slot<T> {
    generation: u32,
    pinned: bool,
    cell: Option<T>,
}

#[derive(Debug)]
pub struct Arena<T> {
    slots: Vec<Slot<T>>,
    free: Vec<u32>,
    live: usize,
    limits: HeapLimits,
    /// Number of allocations to let through before one is rejected
    fail_countdown: Option<u64>,
}

impl<T> Arena<T> {
    pub fn new(limits: HeapLimits) -> Self {
        Self {
            slots: Vec::new(),
            free: Vec::new(),
            live: 0,
            limits,
            fail_countdown: None,
        }
    }

    /// Allocate a cell, subject to the configured limits.
    pub fn alloc(&mut self, cell: T) -> Result<SlotId, AllocError> {
        self.reserve()?;
        Ok(self.insert(cell))
    }

    /// Check that one more cell may be allocated.
    ///
    /// Heaps call this before moving a cell in, so a rejected cell is dropped
    /// by the caller after its lock is released.
    pub fn reserve(&mut self) -> Result<(), AllocError> {
        if let Some(remaining) = self.fail_countdown.as_mut() {
            if *remaining == 0 {
                self.fail_countdown = None;
                return Err(AllocError::Injected);
            }
            *remaining -= 1;
        }

        if let Some(limit) = self.limits.max_live_cells {
            if self.live >= limit {
                return Err(AllocError::LimitReached { limit });
            }
        }

        self.check_address_space()
    }

    /// Store a cell after a successful `reserve`.
    pub fn insert(&mut self, cell: T) -> SlotId {
        self.live += 1;
        self.place(cell, false)
    }

    /// Allocate a cell that is never swept, freed, or counted against the limits.
    pub fn alloc_pinned(&mut self, cell: T) -> SlotId {
        self.place(cell, true)
    }

    fn check_address_space(&self) -> Result<(), AllocError> {
        if self.free.is_empty() && self.slots.len() >= u32::MAX as usize {
            return Err(AllocError::AddressSpace);
        }
        Ok(())
    }

    fn place(&mut self, cell: T, pinned: bool) -> SlotId {
        if let Some(index) = self.free.pop() {
            let slot = &mut self.slots[index as usize];
            slot.cell = Some(cell);
            slot.pinned = pinned;
            return SlotId {
                index,
                generation: slot.generation,
            };
        }

        let index = self.slots.len() as u32;
        self.slots.push(Slot {
            generation: 0,
            pinned,
            cell: Some(cell),
        });
        SlotId {
            index,
            generation: 0,
        }
    }

    #[inline]
    fn slot(&self, id: SlotId) -> Option<&Slot<T>> {
        self.slots
            .get(id.index as usize)
            .filter(|slot| slot.generation == id.generation)
    }

    #[inline]
    pub fn get(&self, id: SlotId) -> Option<&T> {
        self.slot(id).and_then(|slot| slot.cell.as_ref())
    }

    #[inline]
    pub fn get_mut(&mut self, id: SlotId) -> Option<&mut T> {
        self.slots
            .get_mut(id.index as usize)
            .filter(|slot| slot.generation == id.generation)
            .and_then(|slot| slot.cell.as_mut())
    }

    pub fn contains(&self, id: SlotId) -> bool {
        self.get(id).is_some()
    }

    /// Free one cell and hand it back so the caller can drop it outside any lock.
    pub fn free(&mut self, id: SlotId) -> Option<T> {
        let slot = self
            .slots
            .get_mut(id.index as usize)
            .filter(|slot| slot.generation == id.generation && !slot.pinned)?;
        let cell = slot.cell.take()?;
        slot.generation = slot.generation.wrapping_add(1);
        self.free.push(id.index);
        self.live -= 1;
        Some(cell)
    }

    /// Free every unpinned cell that is not in `reachable`.
    pub fn sweep(&mut self, reachable: &AHashSet<SlotId>) -> Vec<T> {
        let doomed: Vec<SlotId> = self
            .ids()
            .filter(|id| !reachable.contains(id))
            .collect();
        doomed.into_iter().filter_map(|id| self.free(id)).collect()
    }

    /// Ids of all live, unpinned cells
    pub fn ids(&self) -> impl Iterator<Item = SlotId> + '_ {
        self.slots.iter().enumerate().filter_map(|(index, slot)| {
            (slot.cell.is_some() && !slot.pinned).then_some(SlotId {
                index: index as u32,
                generation: slot.generation,
            })
        })
    }

    /// Live cells, pinned cells excluded
    pub fn live(&self) -> usize {
        self.live
    }

    /// Make the `n`-th following allocation fail once (`1` fails the next one).
    pub fn fail_nth_allocation(&mut self, n: u64) {
        self.fail_countdown = Some(n.saturating_sub(1));
    }
}

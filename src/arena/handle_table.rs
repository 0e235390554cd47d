use crate::device::MemoryClass;

/// An opaque reference to one live allocation.
///
/// The handle is a {slot, generation} pair rather than an address: the
/// slot indexes the allocator's internal table and the generation detects
/// stale reuse, so any use of a released handle reports `InvalidHandle`
/// instead of corrupting memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AllocationHandle {
    slot: u32,
    generation: u32,
}

/// What a live slot points at: the owning block and the reserved range.
#[derive(Debug, Clone, Copy)]
pub(crate) struct AllocationRecord {
    pub(crate) class: MemoryClass,
    pub(crate) block_index: usize,
    pub(crate) offset: u64,
    pub(crate) size: u64,
}

struct Slot {
    generation: u32,
    live: Option<AllocationRecord>,
}

/// The slot table mapping opaque handles to allocation records.
///
/// The table holds weak bookkeeping only; the caller owns the handle, and
/// the caller's explicit release is what retires a slot.
pub(crate) struct HandleTable {
    slots: Vec<Slot>,
    free: Vec<u32>,
}

impl HandleTable {
    pub(crate) fn new() -> Self {
        Self {
            slots: Vec::new(),
            free: Vec::new(),
        }
    }

    pub(crate) fn insert(
        &mut self,
        record: AllocationRecord,
    ) -> AllocationHandle {
        if let Some(slot) = self.free.pop() {
            self.slots[slot as usize].live = Some(record);
            AllocationHandle {
                slot,
                generation: self.slots[slot as usize].generation,
            }
        } else {
            self.slots.push(Slot {
                generation: 0,
                live: Some(record),
            });
            AllocationHandle {
                slot: (self.slots.len() - 1) as u32,
                generation: 0,
            }
        }
    }

    /// Resolve a handle to its record. `None` for unknown slots and stale
    /// generations.
    pub(crate) fn get(
        &self,
        handle: AllocationHandle,
    ) -> Option<AllocationRecord> {
        let slot = self.slots.get(handle.slot as usize)?;
        if slot.generation != handle.generation {
            return None;
        }
        slot.live
    }

    /// Retire a handle's slot. The generation bump keeps the old handle
    /// from ever resolving again.
    pub(crate) fn remove(
        &mut self,
        handle: AllocationHandle,
    ) -> Option<AllocationRecord> {
        let slot = self.slots.get_mut(handle.slot as usize)?;
        if slot.generation != handle.generation {
            return None;
        }
        let record = slot.live.take()?;
        slot.generation = slot.generation.wrapping_add(1);
        self.free.push(handle.slot);
        Some(record)
    }
}

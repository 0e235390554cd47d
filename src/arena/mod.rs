//! The suballocating arena: a set of large device-memory blocks per
//! placement class, with buffer-granularity allocations carved out of them
//! by a best-fit free list.

mod block;
mod free_list;
mod handle_table;

use ::std::sync::{Arc, Mutex};

use crate::{
    device::{DeviceError, DeviceMemory, MemoryClass},
    error::AllocatorError,
};

use self::{
    block::Block,
    handle_table::{AllocationRecord, HandleTable},
};

pub use self::handle_table::AllocationHandle;

/// Tuning knobs for the arena.
#[derive(Debug, Clone, Copy)]
pub struct AllocatorConfig {
    /// The capacity of each block requested from the device. Allocations
    /// larger than this get a dedicated block sized exactly to the
    /// request.
    pub block_size: u64,
}

impl Default for AllocatorConfig {
    fn default() -> Self {
        Self {
            block_size: 64 * 1024 * 1024,
        }
    }
}

/// Placement details for a live allocation: its class and its position
/// within the owning block. Never a raw address.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AllocationInfo {
    pub class: MemoryClass,
    pub offset: u64,
    pub size: u64,
}

/// Point-in-time usage counters for one memory class.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ClassStats {
    /// Blocks currently held from the device.
    pub blocks: usize,

    /// Total capacity of those blocks.
    pub reserved_bytes: u64,

    /// Bytes handed out to live allocations.
    pub allocated_bytes: u64,

    /// The largest single free range across all blocks -- the biggest
    /// request guaranteed to succeed without a new block.
    pub largest_free_region: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AllocatorStats {
    pub host_visible: ClassStats,
    pub device_local: ClassStats,
}

struct State {
    classes: [Vec<Arc<Block>>; 2],
    handles: HandleTable,
}

/// A suballocating arena over large device-memory regions.
///
/// Every operation is synchronous call-and-return. One mutex covers the
/// full body of `allocate` and `release`; `write` and `read` hold it only
/// long enough to resolve the handle, then serialize on the target block's
/// mapping, so accesses to different blocks proceed in parallel. No
/// fairness is promised between racing callers.
pub struct Allocator {
    device: Arc<dyn DeviceMemory>,
    config: AllocatorConfig,
    state: Mutex<State>,
}

impl Allocator {
    /// Create an arena over the given device context. No device memory is
    /// reserved until the first allocation.
    pub fn new(device: Arc<dyn DeviceMemory>, config: AllocatorConfig) -> Self {
        Self {
            device,
            config,
            state: Mutex::new(State {
                classes: [Vec::new(), Vec::new()],
                handles: HandleTable::new(),
            }),
        }
    }

    /// Reserve `size` bytes of memory in the given placement class.
    ///
    /// Blocks of the class are scanned in creation order and the first one
    /// with a large-enough free range wins; within a block the tightest
    /// free range is chosen. When no block can satisfy the request, a new
    /// block of capacity `max(block_size, size)` is created.
    ///
    /// # Errors
    ///
    /// * `InvalidSize` - zero-byte requests are rejected
    /// * `OutOfMemory` - no block had room and the device refused to
    ///   supply a new region of this class; never retried internally
    /// * `Device` - any other underlying device failure
    pub fn allocate(
        &self,
        size: u64,
        class: MemoryClass,
    ) -> Result<AllocationHandle, AllocatorError> {
        if size == 0 {
            return Err(AllocatorError::InvalidSize);
        }

        let mut state = self
            .state
            .lock()
            .expect("unable to lock the allocator state");
        let state = &mut *state;
        let blocks = &mut state.classes[class.index()];

        let placed = blocks.iter().enumerate().find_map(|(index, block)| {
            block.reserve(size).map(|offset| (index, offset))
        });
        let (block_index, offset) = match placed {
            Some(found) => found,
            None => {
                let capacity = self.config.block_size.max(size);
                let block = Block::new(self.device.as_ref(), class, capacity)
                    .map_err(|error| match error {
                        DeviceError::OutOfDeviceMemory { class, requested } => {
                            AllocatorError::OutOfMemory { class, requested }
                        }
                        other => AllocatorError::Device(other),
                    })?;
                let offset = block
                    .reserve(size)
                    .expect("a fresh block always fits the request that created it");
                blocks.push(Arc::new(block));
                (blocks.len() - 1, offset)
            }
        };

        let handle = state.handles.insert(AllocationRecord {
            class,
            block_index,
            offset,
            size,
        });
        log::trace!(
            "allocated {} bytes in {:?} block {} at offset {}",
            size,
            class,
            block_index,
            offset
        );
        Ok(handle)
    }

    /// Copy `bytes` into the allocation at `byte_offset` through the
    /// owning block's mapped memory.
    ///
    /// # Errors
    ///
    /// * `InvalidHandle` - the handle is unknown or already released
    /// * `InvalidPlacement` - the allocation is device-local; writes to
    ///   device-local memory go through a staging path outside this crate
    /// * `OutOfBounds` - `byte_offset + bytes.len()` exceeds the
    ///   allocation's size; no memory is touched
    /// * `Device` - mapping the block failed
    pub fn write(
        &self,
        handle: AllocationHandle,
        byte_offset: u64,
        bytes: &[u8],
    ) -> Result<(), AllocatorError> {
        let (block, record) = self.resolve(handle)?;
        Self::check_mapped_access(&record, byte_offset, bytes.len() as u64)?;
        block.write(self.device.as_ref(), record.offset + byte_offset, bytes)?;
        Ok(())
    }

    /// Copy bytes out of the allocation at `byte_offset` into `out`.
    ///
    /// Same placement and bounds rules as [`write`](Self::write).
    pub fn read(
        &self,
        handle: AllocationHandle,
        byte_offset: u64,
        out: &mut [u8],
    ) -> Result<(), AllocatorError> {
        let (block, record) = self.resolve(handle)?;
        Self::check_mapped_access(&record, byte_offset, out.len() as u64)?;
        block.read(self.device.as_ref(), record.offset + byte_offset, out)?;
        Ok(())
    }

    /// Return the allocation's range to its owning block, coalescing with
    /// free neighbors, and retire the handle.
    ///
    /// # Errors
    ///
    /// * `InvalidHandle` - the handle is unknown or already released.
    ///   A double free is reported, never silently ignored.
    pub fn release(
        &self,
        handle: AllocationHandle,
    ) -> Result<(), AllocatorError> {
        let mut state = self
            .state
            .lock()
            .expect("unable to lock the allocator state");
        let record = state
            .handles
            .remove(handle)
            .ok_or(AllocatorError::InvalidHandle)?;
        let block = &state.classes[record.class.index()][record.block_index];

        // the tracker's own occupied check is the second line of defense
        block
            .free(record.offset)
            .ok_or(AllocatorError::InvalidHandle)?;
        log::trace!(
            "released {} bytes in {:?} block {} at offset {}",
            record.size,
            record.class,
            record.block_index,
            record.offset
        );
        Ok(())
    }

    /// Placement details for a live allocation.
    pub fn info(
        &self,
        handle: AllocationHandle,
    ) -> Result<AllocationInfo, AllocatorError> {
        let state = self
            .state
            .lock()
            .expect("unable to lock the allocator state");
        let record = state
            .handles
            .get(handle)
            .ok_or(AllocatorError::InvalidHandle)?;
        Ok(AllocationInfo {
            class: record.class,
            offset: record.offset,
            size: record.size,
        })
    }

    /// Point-in-time usage counters, per class.
    pub fn stats(&self) -> AllocatorStats {
        let state = self
            .state
            .lock()
            .expect("unable to lock the allocator state");
        let mut stats = AllocatorStats::default();
        for &class in &[MemoryClass::HostVisible, MemoryClass::DeviceLocal] {
            let entry = match class {
                MemoryClass::HostVisible => &mut stats.host_visible,
                MemoryClass::DeviceLocal => &mut stats.device_local,
            };
            for block in &state.classes[class.index()] {
                entry.blocks += 1;
                entry.reserved_bytes += block.capacity();
                entry.allocated_bytes += block.capacity() - block.free_bytes();
                entry.largest_free_region =
                    entry.largest_free_region.max(block.largest_free());
            }
        }
        stats
    }

    fn resolve(
        &self,
        handle: AllocationHandle,
    ) -> Result<(Arc<Block>, AllocationRecord), AllocatorError> {
        let state = self
            .state
            .lock()
            .expect("unable to lock the allocator state");
        let record = state
            .handles
            .get(handle)
            .ok_or(AllocatorError::InvalidHandle)?;
        let block =
            state.classes[record.class.index()][record.block_index].clone();
        Ok((block, record))
    }

    fn check_mapped_access(
        record: &AllocationRecord,
        byte_offset: u64,
        len: u64,
    ) -> Result<(), AllocatorError> {
        if record.class != MemoryClass::HostVisible {
            return Err(AllocatorError::InvalidPlacement);
        }
        let in_bounds = byte_offset
            .checked_add(len)
            .map_or(false, |end| end <= record.size);
        if !in_bounds {
            return Err(AllocatorError::OutOfBounds {
                offset: byte_offset,
                len,
                size: record.size,
            });
        }
        Ok(())
    }
}

impl Drop for Allocator {
    /// Every block's region is returned to the device unconditionally.
    /// Outstanding handles become invalid; the caller guarantees no other
    /// operation is in flight.
    fn drop(&mut self) {
        let mut state = self
            .state
            .lock()
            .expect("unable to lock the allocator state");
        for blocks in state.classes.iter_mut() {
            for block in blocks.drain(..) {
                block.destroy(self.device.as_ref());
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::device::SystemDevice;

    fn arena(block_size: u64) -> Allocator {
        Allocator::new(
            Arc::new(SystemDevice::new()),
            AllocatorConfig { block_size },
        )
    }

    #[test]
    fn write_then_read_round_trips_the_bytes() {
        let allocator = arena(64 * 1024);
        let handle = allocator
            .allocate(4096, MemoryClass::HostVisible)
            .unwrap();

        let pattern: Vec<u8> = (0..4096).map(|i| (i % 251) as u8).collect();
        allocator.write(handle, 0, &pattern).unwrap();

        let mut readback = vec![0u8; 4096];
        allocator.read(handle, 0, &mut readback).unwrap();
        assert_eq!(pattern, readback);
    }

    #[test]
    fn write_and_read_honor_the_byte_offset() {
        let allocator = arena(64 * 1024);
        let handle = allocator
            .allocate(4096, MemoryClass::HostVisible)
            .unwrap();

        allocator.write(handle, 128, &[0xCD; 64]).unwrap();

        let mut readback = [0u8; 64];
        allocator.read(handle, 128, &mut readback).unwrap();
        assert_eq!(readback, [0xCD; 64]);

        // bytes before the written range are still zero
        let mut prefix = [0xFFu8; 128];
        allocator.read(handle, 0, &mut prefix).unwrap();
        assert!(prefix.iter().all(|&byte| byte == 0));
    }

    #[test]
    fn release_then_allocate_reuses_the_same_offset() {
        let allocator = arena(64 * 1024);

        let first = allocator
            .allocate(4096, MemoryClass::HostVisible)
            .unwrap();
        allocator.write(first, 0, &[0xAB; 4096]).unwrap();
        let first_offset = allocator.info(first).unwrap().offset;

        allocator.release(first).unwrap();

        let second = allocator
            .allocate(4096, MemoryClass::HostVisible)
            .unwrap();
        assert_eq!(allocator.info(second).unwrap().offset, first_offset);
    }

    #[test]
    fn consecutive_allocations_pack_the_block() {
        let allocator = arena(64 * 1024);
        let first = allocator.allocate(100, MemoryClass::HostVisible).unwrap();
        let second = allocator.allocate(200, MemoryClass::HostVisible).unwrap();

        assert_eq!(allocator.info(first).unwrap().offset, 0);
        assert_eq!(allocator.info(second).unwrap().offset, 100);
        assert_eq!(allocator.stats().host_visible.blocks, 1);
    }

    #[test]
    fn oversized_requests_get_a_dedicated_block() {
        let allocator = arena(1024);
        let handle = allocator
            .allocate(1025, MemoryClass::DeviceLocal)
            .unwrap();

        let stats = allocator.stats();
        assert_eq!(stats.device_local.blocks, 1);
        assert_eq!(stats.device_local.reserved_bytes, 1025);
        assert_eq!(allocator.info(handle).unwrap().size, 1025);
        assert_eq!(allocator.info(handle).unwrap().offset, 0);
    }

    #[test]
    fn earlier_blocks_are_preferred_once_they_have_room() {
        let allocator = arena(1024);

        let filler = allocator
            .allocate(1024, MemoryClass::HostVisible)
            .unwrap();
        let spill = allocator.allocate(512, MemoryClass::HostVisible).unwrap();
        assert_eq!(allocator.stats().host_visible.blocks, 2);

        allocator.release(filler).unwrap();

        // first-fit across blocks: the drained first block wins
        let reused = allocator.allocate(256, MemoryClass::HostVisible).unwrap();
        assert_eq!(allocator.info(reused).unwrap().offset, 0);
        assert_eq!(allocator.stats().host_visible.blocks, 2);

        allocator.release(spill).unwrap();
        allocator.release(reused).unwrap();
    }

    #[test]
    fn zero_sized_requests_are_rejected() {
        let allocator = arena(1024);
        assert!(matches!(
            allocator.allocate(0, MemoryClass::HostVisible),
            Err(AllocatorError::InvalidSize)
        ));
    }

    #[test]
    fn writes_to_device_local_memory_are_rejected() {
        let allocator = arena(1024);
        let handle = allocator
            .allocate(256, MemoryClass::DeviceLocal)
            .unwrap();
        assert!(matches!(
            allocator.write(handle, 0, &[0u8; 16]),
            Err(AllocatorError::InvalidPlacement)
        ));
        assert!(matches!(
            allocator.read(handle, 0, &mut [0u8; 16]),
            Err(AllocatorError::InvalidPlacement)
        ));
    }

    #[test]
    fn out_of_bounds_writes_touch_nothing() {
        let allocator = arena(1024);
        let handle = allocator
            .allocate(16, MemoryClass::HostVisible)
            .unwrap();
        allocator.write(handle, 0, &[0xCD; 16]).unwrap();

        let result = allocator.write(handle, 8, &[0xEE; 16]);
        assert!(matches!(
            result,
            Err(AllocatorError::OutOfBounds {
                offset: 8,
                len: 16,
                size: 16,
            })
        ));

        let mut readback = [0u8; 16];
        allocator.read(handle, 0, &mut readback).unwrap();
        assert_eq!(readback, [0xCD; 16]);
    }

    #[test]
    fn offset_overflow_is_out_of_bounds() {
        let allocator = arena(1024);
        let handle = allocator
            .allocate(16, MemoryClass::HostVisible)
            .unwrap();
        assert!(matches!(
            allocator.write(handle, u64::MAX, &[0u8; 2]),
            Err(AllocatorError::OutOfBounds { .. })
        ));
    }

    #[test]
    fn double_release_reports_invalid_handle() {
        let allocator = arena(1024);
        let handle = allocator
            .allocate(256, MemoryClass::HostVisible)
            .unwrap();
        allocator.release(handle).unwrap();
        assert!(matches!(
            allocator.release(handle),
            Err(AllocatorError::InvalidHandle)
        ));
    }

    #[test]
    fn released_handles_cannot_be_written_through() {
        let allocator = arena(1024);
        let handle = allocator
            .allocate(256, MemoryClass::HostVisible)
            .unwrap();
        allocator.release(handle).unwrap();
        assert!(matches!(
            allocator.write(handle, 0, &[1u8; 8]),
            Err(AllocatorError::InvalidHandle)
        ));
        assert!(matches!(
            allocator.info(handle),
            Err(AllocatorError::InvalidHandle)
        ));
    }

    #[test]
    fn a_stale_handle_does_not_alias_the_reused_range() {
        let allocator = arena(1024);
        let first = allocator
            .allocate(256, MemoryClass::HostVisible)
            .unwrap();
        allocator.release(first).unwrap();

        // same offset, new handle; the old one must stay dead
        let second = allocator
            .allocate(256, MemoryClass::HostVisible)
            .unwrap();
        assert!(matches!(
            allocator.write(first, 0, &[1u8; 8]),
            Err(AllocatorError::InvalidHandle)
        ));
        allocator.write(second, 0, &[2u8; 8]).unwrap();
    }

    #[test]
    fn an_exhausted_device_reports_out_of_memory() {
        let device = Arc::new(SystemDevice::with_budget(Some(1024)));
        let allocator =
            Allocator::new(device, AllocatorConfig { block_size: 1024 });

        let full = allocator
            .allocate(1024, MemoryClass::HostVisible)
            .unwrap();
        assert!(matches!(
            allocator.allocate(1, MemoryClass::HostVisible),
            Err(AllocatorError::OutOfMemory { .. })
        ));

        // the budget is per class, so device-local still works
        allocator.allocate(512, MemoryClass::DeviceLocal).unwrap();

        allocator.release(full).unwrap();
        allocator.allocate(1, MemoryClass::HostVisible).unwrap();
    }

    #[test]
    fn stats_track_reserve_and_release() {
        let allocator = arena(1024);
        assert_eq!(allocator.stats(), AllocatorStats::default());

        let handle = allocator
            .allocate(300, MemoryClass::HostVisible)
            .unwrap();
        let stats = allocator.stats();
        assert_eq!(stats.host_visible.blocks, 1);
        assert_eq!(stats.host_visible.reserved_bytes, 1024);
        assert_eq!(stats.host_visible.allocated_bytes, 300);
        assert_eq!(stats.host_visible.largest_free_region, 724);
        assert_eq!(stats.device_local, ClassStats::default());

        allocator.release(handle).unwrap();
        let stats = allocator.stats();
        assert_eq!(stats.host_visible.allocated_bytes, 0);
        assert_eq!(stats.host_visible.largest_free_region, 1024);
    }

    #[test]
    fn dropping_the_allocator_returns_every_region() {
        let device = Arc::new(SystemDevice::new());
        {
            let allocator = Allocator::new(
                device.clone(),
                AllocatorConfig { block_size: 1024 },
            );
            let handle = allocator
                .allocate(512, MemoryClass::HostVisible)
                .unwrap();
            allocator.write(handle, 0, &[7u8; 512]).unwrap();
            allocator.allocate(512, MemoryClass::DeviceLocal).unwrap();
            assert!(device.reserved_bytes(MemoryClass::HostVisible) > 0);
        }
        assert_eq!(device.reserved_bytes(MemoryClass::HostVisible), 0);
        assert_eq!(device.reserved_bytes(MemoryClass::DeviceLocal), 0);
    }
}

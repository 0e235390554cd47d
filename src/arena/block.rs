use ::std::sync::Mutex;

use crate::device::{DeviceError, DeviceMemory, MemoryClass, RegionToken};

use super::free_list::FreeList;

/// One large device region that allocations are carved out of.
///
/// A block is created lazily by the allocator when no existing block of
/// the required class can satisfy a request, and lives until the allocator
/// is dropped. The free-list tracker sits behind its own mutex so the
/// block can be shared through an `Arc`; the mapping mutex serializes the
/// map/copy sequence for writes targeting this block, letting writes to
/// *different* blocks proceed in parallel.
pub(crate) struct Block {
    region: RegionToken,
    class: MemoryClass,
    capacity: u64,
    tracker: Mutex<FreeList>,
    mapping: Mutex<Option<*mut u8>>,
}

impl Block {
    pub(crate) fn new(
        device: &dyn DeviceMemory,
        class: MemoryClass,
        capacity: u64,
    ) -> Result<Self, DeviceError> {
        let region = device.allocate_region(class, capacity)?;
        log::debug!("created {:?} block of {} bytes", class, capacity);
        Ok(Self {
            region,
            class,
            capacity,
            tracker: Mutex::new(FreeList::new(capacity)),
            mapping: Mutex::new(None),
        })
    }

    pub(crate) fn capacity(&self) -> u64 {
        self.capacity
    }

    /// Reserve `size` bytes from this block's tracker, best-fit.
    pub(crate) fn reserve(&self, size: u64) -> Option<u64> {
        self.tracker
            .lock()
            .expect("unable to lock the block's free-list tracker")
            .reserve_best_fit(size)
    }

    /// Free the occupied range starting at `offset`, coalescing neighbors.
    pub(crate) fn free(&self, offset: u64) -> Option<u64> {
        self.tracker
            .lock()
            .expect("unable to lock the block's free-list tracker")
            .free(offset)
    }

    pub(crate) fn free_bytes(&self) -> u64 {
        self.tracker
            .lock()
            .expect("unable to lock the block's free-list tracker")
            .free_bytes()
    }

    pub(crate) fn largest_free(&self) -> u64 {
        self.tracker
            .lock()
            .expect("unable to lock the block's free-list tracker")
            .largest_free()
    }

    /// Copy `bytes` into the block's region at `offset` through the cached
    /// mapping. The region is mapped on first use and stays mapped until
    /// the block is destroyed.
    ///
    /// The caller has already verified placement and bounds.
    pub(crate) fn write(
        &self,
        device: &dyn DeviceMemory,
        offset: u64,
        bytes: &[u8],
    ) -> Result<(), DeviceError> {
        let mut mapping = self
            .mapping
            .lock()
            .expect("unable to lock the block's mapping");
        let base = self.mapped_ptr(device, &mut mapping)?;
        unsafe {
            std::ptr::copy_nonoverlapping(
                bytes.as_ptr(),
                base.add(offset as usize),
                bytes.len(),
            );
        }
        Ok(())
    }

    /// Copy bytes out of the block's region at `offset` into `out`.
    pub(crate) fn read(
        &self,
        device: &dyn DeviceMemory,
        offset: u64,
        out: &mut [u8],
    ) -> Result<(), DeviceError> {
        let mut mapping = self
            .mapping
            .lock()
            .expect("unable to lock the block's mapping");
        let base = self.mapped_ptr(device, &mut mapping)?;
        unsafe {
            std::ptr::copy_nonoverlapping(
                base.add(offset as usize),
                out.as_mut_ptr(),
                out.len(),
            );
        }
        Ok(())
    }

    /// Unmap (if mapped) and hand the region back to the device.
    pub(crate) fn destroy(&self, device: &dyn DeviceMemory) {
        let mut mapping = self
            .mapping
            .lock()
            .expect("unable to lock the block's mapping");
        if mapping.take().is_some() {
            device.unmap_region(self.region);
        }
        log::debug!("destroying {:?} block of {} bytes", self.class, self.capacity);
        device.free_region(self.region);
    }

    fn mapped_ptr(
        &self,
        device: &dyn DeviceMemory,
        mapping: &mut Option<*mut u8>,
    ) -> Result<*mut u8, DeviceError> {
        match *mapping {
            Some(pointer) => Ok(pointer),
            None => {
                let pointer = device.map_region(self.region)?;
                *mapping = Some(pointer);
                Ok(pointer)
            }
        }
    }
}

// The cached mapping pointer is only dereferenced while the mapping mutex
// is held, and the DeviceMemory contract keeps it valid until free_region.
unsafe impl Send for Block {}
unsafe impl Sync for Block {}

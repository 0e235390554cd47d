use ::std::{
    collections::HashMap,
    sync::Mutex,
};

use super::{DeviceError, DeviceMemory, MemoryClass, RegionToken};

/// A [`DeviceMemory`] implementation backed by the process heap.
///
/// Every region is a zero-initialized heap allocation. Device-local regions
/// can be allocated and freed but refuse to map, mirroring real device
/// semantics so placement errors stay reachable in tests. An optional
/// per-class budget makes the out-of-memory path testable without
/// exhausting anything real.
pub struct SystemDevice {
    budget_per_class: Option<u64>,
    state: Mutex<State>,
}

struct State {
    next_token: u64,
    reserved: [u64; 2],
    regions: HashMap<u64, Region>,
}

struct Region {
    class: MemoryClass,
    bytes: Box<[u8]>,
}

impl SystemDevice {
    pub fn new() -> Self {
        Self::with_budget(None)
    }

    /// Cap the total bytes the device will hand out per memory class.
    /// `None` means unbounded.
    pub fn with_budget(budget_per_class: Option<u64>) -> Self {
        Self {
            budget_per_class,
            state: Mutex::new(State {
                next_token: 1,
                reserved: [0, 0],
                regions: HashMap::new(),
            }),
        }
    }

    /// Bytes currently reserved from the device in the given class.
    pub fn reserved_bytes(&self, class: MemoryClass) -> u64 {
        let state = self.state.lock().expect("unable to lock device state");
        state.reserved[class.index()]
    }
}

impl Default for SystemDevice {
    fn default() -> Self {
        Self::new()
    }
}

// The mapped pointers point into boxed slices whose heap backing never
// moves, so they remain valid until the region is freed.
unsafe impl DeviceMemory for SystemDevice {
    fn allocate_region(
        &self,
        class: MemoryClass,
        size: u64,
    ) -> Result<RegionToken, DeviceError> {
        let mut state = self.state.lock().expect("unable to lock device state");
        if let Some(budget) = self.budget_per_class {
            if state.reserved[class.index()] + size > budget {
                return Err(DeviceError::OutOfDeviceMemory {
                    class,
                    requested: size,
                });
            }
        }
        let token = state.next_token;
        state.next_token += 1;
        state.reserved[class.index()] += size;
        state.regions.insert(
            token,
            Region {
                class,
                bytes: vec![0u8; size as usize].into_boxed_slice(),
            },
        );
        Ok(RegionToken::new(token))
    }

    fn map_region(&self, token: RegionToken) -> Result<*mut u8, DeviceError> {
        let mut state = self.state.lock().expect("unable to lock device state");
        let region = state.regions.get_mut(&token.raw()).ok_or_else(|| {
            DeviceError::Failure(format!("unknown region token {:?}", token))
        })?;
        if region.class == MemoryClass::DeviceLocal {
            return Err(DeviceError::Failure(
                "device-local regions are not host mappable".to_owned(),
            ));
        }
        Ok(region.bytes.as_mut_ptr())
    }

    fn unmap_region(&self, _token: RegionToken) {
        // nothing to undo, the heap backing stays put until free_region
    }

    fn free_region(&self, token: RegionToken) {
        let mut state = self.state.lock().expect("unable to lock device state");
        if let Some(region) = state.regions.remove(&token.raw()) {
            state.reserved[region.class.index()] -= region.bytes.len() as u64;
        }
    }
}

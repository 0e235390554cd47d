//! The boundary between the arena and the underlying device.
//!
//! The arena never talks to a graphics API directly. It consumes three
//! primitives -- allocate a region, map/unmap a region, free a region --
//! through the [`DeviceMemory`] trait, and the embedding application
//! implements that trait for whatever device it drives. [`SystemDevice`]
//! is a process-heap implementation used by the tests and demos.

mod system_device;

use thiserror::Error;

pub use self::system_device::SystemDevice;

/// The placement class for a region of device memory.
///
/// A region's class is fixed when the region is created and never changes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MemoryClass {
    /// Directly readable/writable by the calling process via a mapped
    /// pointer.
    HostVisible,

    /// Optimized for device-side access; not mappable by the calling
    /// process. Writes must go through a staging/transfer path outside
    /// this crate.
    DeviceLocal,
}

impl MemoryClass {
    pub(crate) fn index(self) -> usize {
        match self {
            Self::HostVisible => 0,
            Self::DeviceLocal => 1,
        }
    }
}

/// An opaque identifier for one region handed out by a device.
///
/// The device implementation owns the token-to-resource mapping; the arena
/// only stores tokens and passes them back.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RegionToken(u64);

impl RegionToken {
    pub fn new(raw: u64) -> Self {
        Self(raw)
    }

    pub fn raw(self) -> u64 {
        self.0
    }
}

#[derive(Debug, Error)]
pub enum DeviceError {
    #[error(
        "the device cannot supply a {class:?} region of {requested} bytes"
    )]
    OutOfDeviceMemory { class: MemoryClass, requested: u64 },

    #[error("device call failed: {0}")]
    Failure(String),
}

/// The device memory primitives consumed by the arena.
///
/// # Safety
///
/// Unsafe to implement because the arena dereferences the pointers this
/// trait hands back. Implementations must guarantee that:
///
/// - a pointer returned by [`map_region`](Self::map_region) is valid for
///   reads and writes across the region's full size, and stays valid until
///   the region is unmapped or freed
/// - [`free_region`](Self::free_region) invalidates outstanding mappings of
///   that region and nothing else
pub unsafe trait DeviceMemory: Send + Sync {
    /// Obtain one contiguous region of the given class and size.
    fn allocate_region(
        &self,
        class: MemoryClass,
        size: u64,
    ) -> Result<RegionToken, DeviceError>;

    /// Map a host-visible region and return a pointer to its first byte.
    ///
    /// Mapping a device-local region is a device-side failure; the arena
    /// checks placement before ever issuing it.
    fn map_region(&self, token: RegionToken) -> Result<*mut u8, DeviceError>;

    /// Release a mapping established by [`map_region`](Self::map_region).
    fn unmap_region(&self, token: RegionToken);

    /// Return a region to the device.
    fn free_region(&self, token: RegionToken);
}

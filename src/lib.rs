//! A suballocating arena manager for device memory.
//!
//! Allocation requests are carved out of a small number of large blocks
//! obtained from the underlying device through the
//! [`DeviceMemory`](crate::device::DeviceMemory) boundary. Callers pick a
//! placement class per request -- host-visible for mapped writes,
//! device-local for device-side access -- and get back an opaque
//! [`AllocationHandle`] used for writes, reads, and release.

mod arena;
mod error;

pub mod device;
pub mod logging;

pub use self::{
    arena::{
        AllocationHandle, AllocationInfo, Allocator, AllocatorConfig,
        AllocatorStats, ClassStats,
    },
    error::AllocatorError,
};

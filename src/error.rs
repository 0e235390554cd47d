use thiserror::Error;

use crate::device::{DeviceError, MemoryClass};

/// Errors surfaced by the caller-facing arena operations.
///
/// None of these are retried internally. `OutOfMemory` is the only
/// allocation failure and is distinguishable from the bad-input errors so
/// calling code can choose to flush and retry on it alone.
#[derive(Debug, Error)]
pub enum AllocatorError {
    #[error(
        "the device cannot supply {requested} more bytes of {class:?} memory"
    )]
    OutOfMemory { class: MemoryClass, requested: u64 },

    #[error("allocation requests must be at least one byte")]
    InvalidSize,

    #[error("mapped access requires a host-visible allocation")]
    InvalidPlacement,

    #[error(
        "the range [{offset}, {offset} + {len}) does not fit in an \
         allocation of {size} bytes"
    )]
    OutOfBounds { offset: u64, len: u64, size: u64 },

    #[error("unknown or already-released allocation handle")]
    InvalidHandle,

    #[error(transparent)]
    Device(#[from] DeviceError),
}

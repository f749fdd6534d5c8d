//! # hcore Memory Subsystem
//!
//! The memory subsystem provides:
//! - A slab allocator whose entire state lives inside one shared region
//! - A process-shared spinlock stored in that same region
//! - The [`SharedPool`] facade that maps, initializes and attaches regions
//!
//! ## Key Principle
//!
//! Nothing inside a shared region is a process-local pointer. Descriptors
//! refer to each other by region-relative offsets, so every process that
//! maps the region (at whatever base address) interprets it identically.

#![no_std]
#![deny(unsafe_op_in_unsafe_fn)]
#![warn(missing_docs)]

extern crate alloc;

#[cfg(test)]
extern crate std;

pub mod allocator;
pub mod region;
pub mod shpool;
pub mod slab;
pub mod sync;

use core::fmt;
use hcore_hal::HalError;

pub use allocator::{HeapAllocator, HeapStats};
pub use region::{HeapRegion, Offset, Region};
pub use shpool::{PoolConfig, SharedPool, SharedPoolGuard};
pub use slab::{PageRun, SlabConfig, SlabPool, SlabSnapshot};
pub use sync::{SharedLock, SharedMutex, SharedMutexGuard};

/// Memory subsystem result type
pub type MemResult<T> = Result<T, MemError>;

/// Memory subsystem errors
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemError {
    /// Out of memory
    OutOfMemory,
    /// Address outside the region
    InvalidAddress,
    /// Invalid size
    InvalidSize,
    /// Address not aligned
    NotAligned,
    /// Pointer is not the start of a live chunk
    WrongChunk,
    /// Chunk or page run is already free
    AlreadyFree,
    /// Region header is missing or does not match this process
    InvalidRegion,
    /// Pool not initialized
    NotInitialized,
    /// Host abstraction layer failure
    Hal(HalError),
    /// Internal error
    Internal,
}

impl From<HalError> for MemError {
    fn from(err: HalError) -> Self {
        match err {
            HalError::OutOfMemory => MemError::OutOfMemory,
            other => MemError::Hal(other),
        }
    }
}

impl fmt::Display for MemError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MemError::OutOfMemory => f.write_str("out of memory"),
            MemError::InvalidAddress => f.write_str("address outside the pool"),
            MemError::InvalidSize => f.write_str("invalid size"),
            MemError::NotAligned => f.write_str("address not aligned"),
            MemError::WrongChunk => f.write_str("pointer is not a chunk start"),
            MemError::AlreadyFree => f.write_str("chunk already free"),
            MemError::InvalidRegion => f.write_str("invalid shared region"),
            MemError::NotInitialized => f.write_str("pool not initialized"),
            MemError::Hal(err) => write!(f, "host error: {err}"),
            MemError::Internal => f.write_str("internal error"),
        }
    }
}

//! # hcore HAL - Host Abstraction Layer
//!
//! This crate wraps every interaction the runtime has with the operating
//! system. Higher layers never call `libc` directly; they go through the
//! abstractions defined here.
//!
//! ## Components
//!
//! - [`cpu`]: spin-wait hints and scheduler yield
//! - [`process`]: process identity and liveness
//! - [`mmu`]: page geometry and shared mappings
//! - [`shm`]: named POSIX shared-memory objects

#![no_std]
#![deny(unsafe_op_in_unsafe_fn)]
#![warn(missing_docs)]

extern crate alloc;

#[cfg(test)]
extern crate std;

pub mod cpu;
pub mod mmu;
pub mod process;
pub mod shm;

use core::fmt;

pub use mmu::{Mapping, PageGeometry, Protection};
pub use process::Pid;
pub use shm::SharedMemoryObject;

/// Result type for HAL operations
pub type HalResult<T> = Result<T, HalError>;

/// Errors that can occur in HAL operations
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HalError {
    /// The operation is not supported on this platform
    NotSupported,
    /// Invalid parameter provided
    InvalidParameter,
    /// Memory allocation failed
    OutOfMemory,
    /// A system call failed with the given errno
    Os(i32),
}

impl HalError {
    /// Capture the calling thread's `errno`.
    pub fn last_os_error() -> Self {
        HalError::Os(process::errno())
    }

    /// The raw OS error code, if any.
    pub fn raw_os_error(&self) -> Option<i32> {
        match self {
            HalError::Os(code) => Some(*code),
            _ => None,
        }
    }
}

impl fmt::Display for HalError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HalError::NotSupported => f.write_str("operation not supported on this platform"),
            HalError::InvalidParameter => f.write_str("invalid parameter"),
            HalError::OutOfMemory => f.write_str("out of memory"),
            HalError::Os(code) => write!(f, "os error {code}"),
        }
    }
}

//! # MMU Abstraction
//!
//! Page geometry of the host and `MAP_SHARED` mappings that stay coherent
//! across every process that maps the same backing object.

use crate::{HalError, HalResult};
use bitflags::bitflags;
use core::ptr::NonNull;

bitflags! {
    /// Access protection of a mapping
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Protection: u32 {
        /// Pages may be read
        const READ = 1 << 0;
        /// Pages may be written
        const WRITE = 1 << 1;
        /// Pages may be executed
        const EXEC = 1 << 2;
    }
}

impl Protection {
    /// Read/write data pages
    pub const fn data() -> Self {
        Self::READ.union(Self::WRITE)
    }

    fn to_native(self) -> libc::c_int {
        let mut prot = libc::PROT_NONE;
        if self.contains(Self::READ) {
            prot |= libc::PROT_READ;
        }
        if self.contains(Self::WRITE) {
            prot |= libc::PROT_WRITE;
        }
        if self.contains(Self::EXEC) {
            prot |= libc::PROT_EXEC;
        }
        prot
    }
}

/// Page size and its log2
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageGeometry {
    size: usize,
    shift: u32,
}

impl PageGeometry {
    /// Geometry for a page of `size` bytes. `size` must be a power of two.
    pub const fn new(size: usize) -> HalResult<Self> {
        if size == 0 || !size.is_power_of_two() {
            return Err(HalError::InvalidParameter);
        }
        Ok(Self {
            size,
            shift: size.trailing_zeros(),
        })
    }

    /// Geometry of the host's base page.
    pub fn host() -> Self {
        // SAFETY: sysconf has no preconditions.
        let raw = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
        let size = if raw > 0 { raw as usize } else { 4096 };
        match Self::new(size) {
            Ok(geometry) => geometry,
            Err(_) => Self { size: 4096, shift: 12 },
        }
    }

    /// Page size in bytes
    #[inline]
    pub const fn size(&self) -> usize {
        self.size
    }

    /// log2 of the page size
    #[inline]
    pub const fn shift(&self) -> u32 {
        self.shift
    }

    /// Round `value` up to a page boundary
    #[inline]
    pub const fn align_up(&self, value: usize) -> usize {
        (value + self.size - 1) & !(self.size - 1)
    }

    /// Round `value` up to a page boundary, `None` if that overflows
    #[inline]
    pub const fn checked_align_up(&self, value: usize) -> Option<usize> {
        match value.checked_add(self.size - 1) {
            Some(end) => Some(end & !(self.size - 1)),
            None => None,
        }
    }

    /// Round `value` down to a page boundary
    #[inline]
    pub const fn align_down(&self, value: usize) -> usize {
        value & !(self.size - 1)
    }

    /// Number of pages needed to hold `bytes`
    #[inline]
    pub const fn pages_for(&self, bytes: usize) -> usize {
        (bytes >> self.shift) + if bytes & (self.size - 1) != 0 { 1 } else { 0 }
    }
}

/// A `MAP_SHARED` mapping owned by this process.
///
/// The mapping is released when dropped. Forked children inherit it, and any
/// process mapping the same shared-memory object sees the same bytes.
#[derive(Debug)]
pub struct Mapping {
    ptr: NonNull<u8>,
    len: usize,
}

impl Mapping {
    /// Map `len` bytes of anonymous shared memory.
    ///
    /// The memory is zero-filled and visible to children forked after this
    /// call, but cannot be attached by unrelated processes.
    pub fn anonymous(len: usize, prot: Protection) -> HalResult<Self> {
        Self::map(len, prot, libc::MAP_SHARED | libc::MAP_ANON, -1)
    }

    /// Map `len` bytes of the object behind `fd`.
    ///
    /// The descriptor may be closed afterwards; the mapping keeps the object
    /// alive.
    pub fn from_fd(fd: libc::c_int, len: usize, prot: Protection) -> HalResult<Self> {
        if fd < 0 {
            return Err(HalError::InvalidParameter);
        }
        Self::map(len, prot, libc::MAP_SHARED, fd)
    }

    fn map(len: usize, prot: Protection, flags: libc::c_int, fd: libc::c_int) -> HalResult<Self> {
        if len == 0 {
            return Err(HalError::InvalidParameter);
        }

        // SAFETY: a fresh mapping at a kernel-chosen address aliases nothing.
        let ptr = unsafe {
            libc::mmap(
                core::ptr::null_mut(),
                len,
                prot.to_native(),
                flags,
                fd,
                0,
            )
        };

        if ptr == libc::MAP_FAILED {
            let err = HalError::last_os_error();
            log::error!(
                "mmap(MAP_SHARED{}, {}) failed: {}",
                if fd < 0 { "|MAP_ANON" } else { "" },
                len,
                err
            );
            return Err(err);
        }

        match NonNull::new(ptr as *mut u8) {
            Some(ptr) => Ok(Self { ptr, len }),
            None => Err(HalError::OutOfMemory),
        }
    }

    /// Base address of the mapping in this process
    #[inline]
    pub fn as_ptr(&self) -> *mut u8 {
        self.ptr.as_ptr()
    }

    /// Length of the mapping in bytes
    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    /// Returns true if the mapping is empty (never, once constructed)
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Unmap now and report failure instead of only logging it.
    pub fn unmap(self) -> HalResult<()> {
        let this = core::mem::ManuallyDrop::new(self);
        // SAFETY: ptr/len describe a live mapping created by `map`.
        unsafe { Self::release(this.ptr, this.len) }
    }

    unsafe fn release(ptr: NonNull<u8>, len: usize) -> HalResult<()> {
        // SAFETY: guaranteed by the caller.
        if unsafe { libc::munmap(ptr.as_ptr() as *mut libc::c_void, len) } == -1 {
            let err = HalError::last_os_error();
            log::error!("munmap({:p}, {}) failed: {}", ptr.as_ptr(), len, err);
            return Err(err);
        }
        Ok(())
    }
}

impl Drop for Mapping {
    fn drop(&mut self) {
        // SAFETY: the mapping is live until here. Failure is already logged.
        let _ = unsafe { Self::release(self.ptr, self.len) };
    }
}

// SAFETY: the mapping is plain memory; synchronisation of its contents is
// the responsibility of whoever lays out data inside it.
unsafe impl Send for Mapping {}
unsafe impl Sync for Mapping {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_geometry_rejects_non_power_of_two() {
        assert_eq!(PageGeometry::new(0), Err(HalError::InvalidParameter));
        assert_eq!(PageGeometry::new(3000), Err(HalError::InvalidParameter));
    }

    #[test]
    fn test_geometry_math() {
        let geo = PageGeometry::new(4096).unwrap();
        assert_eq!(geo.shift(), 12);
        assert_eq!(geo.align_up(1), 4096);
        assert_eq!(geo.align_up(4096), 4096);
        assert_eq!(geo.align_down(8191), 4096);
        assert_eq!(geo.checked_align_up(4097), Some(8192));
        assert_eq!(geo.checked_align_up(usize::MAX - 4096), Some(usize::MAX - 4095));
        assert_eq!(geo.checked_align_up(usize::MAX - 10), None);
        assert_eq!(geo.pages_for(0), 0);
        assert_eq!(geo.pages_for(1), 1);
        assert_eq!(geo.pages_for(4097), 2);
    }

    #[test]
    fn test_host_geometry() {
        let geo = PageGeometry::host();
        assert!(geo.size().is_power_of_two());
        assert_eq!(1usize << geo.shift(), geo.size());
    }

    #[test]
    fn test_anonymous_mapping_is_zeroed() {
        let map = Mapping::anonymous(8192, Protection::data()).unwrap();
        assert_eq!(map.len(), 8192);
        let bytes = unsafe { core::slice::from_raw_parts(map.as_ptr(), map.len()) };
        assert!(bytes.iter().all(|&b| b == 0));
    }

    #[test]
    fn test_zero_length_rejected() {
        assert_eq!(
            Mapping::anonymous(0, Protection::data()).err(),
            Some(HalError::InvalidParameter)
        );
        assert_eq!(
            Mapping::from_fd(-1, 4096, Protection::data()).err(),
            Some(HalError::InvalidParameter)
        );
    }

    #[test]
    fn test_anonymous_mapping_shared_with_child() {
        let map = Mapping::anonymous(4096, Protection::data()).unwrap();
        let ptr = map.as_ptr();

        // SAFETY: the child only writes into the shared page and exits.
        let pid = unsafe { libc::fork() };
        assert!(pid >= 0);
        if pid == 0 {
            unsafe {
                ptr.write_volatile(0x5a);
                libc::_exit(0);
            }
        }

        let mut status = 0;
        assert_eq!(unsafe { libc::waitpid(pid, &mut status, 0) }, pid);
        assert_eq!(unsafe { ptr.read_volatile() }, 0x5a);
    }

    #[test]
    fn test_explicit_unmap() {
        let map = Mapping::anonymous(4096, Protection::data()).unwrap();
        assert!(map.unmap().is_ok());
    }
}

//! # Memory Region Management
//!
//! A [`Region`] is a process-local view of a contiguous block of memory.
//! Everything stored *inside* a region refers to other parts of it through
//! [`Offset`]s, which mean the same thing in every process.

use crate::{MemError, MemResult};
use alloc::alloc::{alloc_zeroed, dealloc, Layout};
use core::fmt;
use core::ptr::NonNull;

/// Byte offset from the start of a region
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
#[repr(transparent)]
pub struct Offset(u64);

impl Offset {
    /// The null offset. Offset zero is always the region header, never a
    /// list node or a chunk, so it doubles as "none".
    pub const NULL: Offset = Offset(0);

    /// Create a new offset
    #[inline]
    pub const fn new(off: u64) -> Self {
        Self(off)
    }

    /// Create an offset from a `usize`
    #[inline]
    pub const fn from_usize(off: usize) -> Self {
        Self(off as u64)
    }

    /// Get the raw offset value
    #[inline]
    pub const fn as_u64(self) -> u64 {
        self.0
    }

    /// Get the offset as a `usize`
    #[inline]
    pub const fn as_usize(self) -> usize {
        self.0 as usize
    }

    /// Is this the null offset?
    #[inline]
    pub const fn is_null(self) -> bool {
        self.0 == 0
    }

    /// Check if the offset is aligned to the given alignment
    #[inline]
    pub const fn is_aligned(self, align: u64) -> bool {
        self.0 & (align - 1) == 0
    }

    /// Add a byte count
    #[inline]
    pub const fn add(self, bytes: u64) -> Self {
        Self(self.0 + bytes)
    }
}

impl fmt::Display for Offset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "+{:#x}", self.0)
    }
}

/// A contiguous region of memory addressed by offset.
///
/// The region does not own its memory; the mapping or allocation that
/// produced it must outlive every use of the view.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct Region {
    base: NonNull<u8>,
    len: usize,
}

impl Region {
    /// Create a region from a raw pointer and length.
    ///
    /// # Safety
    ///
    /// - `base` must be valid for reads and writes of `len` bytes
    /// - `base` must be aligned to at least 8 bytes
    /// - the memory must remain valid for as long as the region is used
    pub unsafe fn from_raw(base: NonNull<u8>, len: usize) -> Self {
        debug_assert!(base.as_ptr() as usize % 8 == 0);
        Self { base, len }
    }

    /// Base pointer in this process
    #[inline]
    pub fn as_ptr(&self) -> *mut u8 {
        self.base.as_ptr()
    }

    /// Size in bytes
    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    /// Returns true if the region has zero length
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Process-local address of `off`.
    ///
    /// `off` must be inside the region; this is checked in debug builds.
    #[inline]
    pub fn ptr_at(&self, off: Offset) -> *mut u8 {
        debug_assert!(
            off.as_usize() <= self.len,
            "offset {off} out of bounds (len={})",
            self.len
        );
        // SAFETY: in bounds per the check above.
        unsafe { self.as_ptr().add(off.as_usize()) }
    }

    /// Region-relative offset of `ptr`, if it points inside the region.
    #[inline]
    pub fn offset_of(&self, ptr: *const u8) -> Option<Offset> {
        let base = self.as_ptr() as usize;
        let addr = ptr as usize;
        if addr < base || addr >= base + self.len {
            return None;
        }
        Some(Offset::from_usize(addr - base))
    }

    /// Does `ptr` point inside the region?
    #[inline]
    pub fn contains(&self, ptr: *const u8) -> bool {
        self.offset_of(ptr).is_some()
    }
}

impl fmt::Debug for Region {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Region")
            .field("base", &self.base)
            .field("len", &self.len)
            .finish()
    }
}

// SAFETY: a Region is only an address range; synchronisation of the bytes
// behind it is handled by the shared mutex.
unsafe impl Send for Region {}
unsafe impl Sync for Region {}

/// Zeroed, aligned memory from the global allocator.
///
/// Used when a slab pool does not need to be shared across processes (or in
/// tests), so no OS mapping is involved.
pub struct HeapRegion {
    base: NonNull<u8>,
    layout: Layout,
}

impl HeapRegion {
    /// Allocate `size` zeroed bytes aligned to `align`.
    pub fn new_zeroed(size: usize, align: usize) -> MemResult<Self> {
        if size == 0 {
            return Err(MemError::InvalidSize);
        }
        let layout = Layout::from_size_align(size, align).map_err(|_| MemError::NotAligned)?;

        // SAFETY: layout has non-zero size.
        let ptr = unsafe { alloc_zeroed(layout) };
        let base = NonNull::new(ptr).ok_or(MemError::OutOfMemory)?;
        Ok(Self { base, layout })
    }

    /// Returns a Region view of this allocation
    #[inline]
    pub fn region(&self) -> Region {
        // SAFETY: the allocation lives as long as self.
        unsafe { Region::from_raw(self.base, self.layout.size()) }
    }

    /// Size in bytes
    #[inline]
    pub fn len(&self) -> usize {
        self.layout.size()
    }

    /// Always false; zero-sized regions are rejected at construction
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.layout.size() == 0
    }
}

impl Drop for HeapRegion {
    fn drop(&mut self) {
        // SAFETY: allocated in new_zeroed with the same layout.
        unsafe { dealloc(self.base.as_ptr(), self.layout) };
    }
}

impl fmt::Debug for HeapRegion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HeapRegion")
            .field("base", &self.base)
            .field("len", &self.layout.size())
            .finish()
    }
}

unsafe impl Send for HeapRegion {}
unsafe impl Sync for HeapRegion {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_offset_basics() {
        assert!(Offset::NULL.is_null());
        assert!(!Offset::new(8).is_null());
        assert!(Offset::new(64).is_aligned(64));
        assert!(!Offset::new(72).is_aligned(64));
        assert_eq!(Offset::new(8).add(16), Offset::new(24));
    }

    #[test]
    fn test_offset_round_trip() {
        let heap = HeapRegion::new_zeroed(4096, 4096).unwrap();
        let region = heap.region();

        let ptr = region.ptr_at(Offset::new(128));
        assert_eq!(region.offset_of(ptr), Some(Offset::new(128)));
        assert!(region.contains(region.as_ptr()));
    }

    #[test]
    fn test_offset_of_outside() {
        let heap = HeapRegion::new_zeroed(4096, 64).unwrap();
        let region = heap.region();

        let end = region.as_ptr().wrapping_add(4096);
        assert_eq!(region.offset_of(end), None);
        let before = region.as_ptr().wrapping_sub(1);
        assert_eq!(region.offset_of(before), None);
    }

    #[test]
    fn test_heap_region_zeroed_and_aligned() {
        let heap = HeapRegion::new_zeroed(8192, 4096).unwrap();
        assert_eq!(heap.len(), 8192);
        assert_eq!(heap.region().as_ptr() as usize % 4096, 0);
        let bytes = unsafe { core::slice::from_raw_parts(heap.region().as_ptr(), 8192) };
        assert!(bytes.iter().all(|&b| b == 0));
    }

    #[test]
    fn test_heap_region_rejects_bad_layout() {
        assert_eq!(HeapRegion::new_zeroed(0, 64).err(), Some(MemError::InvalidSize));
        assert_eq!(HeapRegion::new_zeroed(64, 3).err(), Some(MemError::NotAligned));
    }
}

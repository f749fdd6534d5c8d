//! # Heap Allocator Interface
//!
//! The generic allocate/free capability. [`crate::SharedPool`] implements it
//! so per-process arenas can be layered on top of a shared region without
//! knowing where the memory comes from.

use core::alloc::Layout;

/// Heap allocator trait
pub trait HeapAllocator: Send + Sync {
    /// Allocate memory. Returns null when exhausted.
    fn allocate(&self, layout: Layout) -> *mut u8;

    /// Deallocate memory
    fn deallocate(&self, ptr: *mut u8, layout: Layout);

    /// Reallocate memory
    fn reallocate(&self, ptr: *mut u8, old_layout: Layout, new_size: usize) -> *mut u8 {
        // Default implementation: allocate new, copy, deallocate old
        let Ok(new_layout) = Layout::from_size_align(new_size, old_layout.align()) else {
            return core::ptr::null_mut();
        };

        let new_ptr = self.allocate(new_layout);
        if !new_ptr.is_null() && !ptr.is_null() {
            // SAFETY: both blocks are live and at least this long.
            unsafe {
                core::ptr::copy_nonoverlapping(ptr, new_ptr, old_layout.size().min(new_size));
            }
            self.deallocate(ptr, old_layout);
        }
        new_ptr
    }

    /// Get allocator name
    fn name(&self) -> &'static str;

    /// Get statistics
    fn stats(&self) -> HeapStats;
}

/// Heap statistics
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HeapStats {
    /// Total heap size
    pub total_size: usize,
    /// Used size
    pub used_size: usize,
    /// Free size
    pub free_size: usize,
    /// Number of allocations
    pub allocations: u64,
    /// Number of deallocations
    pub deallocations: u64,
}

impl HeapStats {
    /// Fraction of the heap in use, in percent
    pub fn usage_percent(&self) -> usize {
        if self.total_size == 0 {
            0
        } else {
            self.used_size * 100 / self.total_size
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::vec::Vec;
    use std::sync::Mutex;

    /// Hands out boxed slices from the global allocator.
    struct Boxed {
        live: Mutex<Vec<(usize, Layout)>>,
    }

    impl HeapAllocator for Boxed {
        fn allocate(&self, layout: Layout) -> *mut u8 {
            let ptr = unsafe { alloc::alloc::alloc(layout) };
            self.live.lock().unwrap().push((ptr as usize, layout));
            ptr
        }

        fn deallocate(&self, ptr: *mut u8, layout: Layout) {
            self.live.lock().unwrap().retain(|&(p, _)| p != ptr as usize);
            unsafe { alloc::alloc::dealloc(ptr, layout) };
        }

        fn name(&self) -> &'static str {
            "boxed"
        }

        fn stats(&self) -> HeapStats {
            let live = self.live.lock().unwrap();
            HeapStats {
                used_size: live.iter().map(|(_, l)| l.size()).sum(),
                ..HeapStats::default()
            }
        }
    }

    #[test]
    fn test_default_reallocate_copies() {
        let heap = Boxed {
            live: Mutex::new(Vec::new()),
        };
        let layout = Layout::from_size_align(16, 8).unwrap();
        let ptr = heap.allocate(layout);
        unsafe { ptr.write_bytes(0x42, 16) };

        let grown = heap.reallocate(ptr, layout, 64);
        assert!(!grown.is_null());
        let bytes = unsafe { core::slice::from_raw_parts(grown, 16) };
        assert!(bytes.iter().all(|&b| b == 0x42));
        assert_eq!(heap.stats().used_size, 64);

        heap.deallocate(grown, Layout::from_size_align(64, 8).unwrap());
        assert_eq!(heap.stats().used_size, 0);
        assert_eq!(heap.name(), "boxed");
    }

    #[test]
    fn test_usage_percent() {
        let stats = HeapStats {
            total_size: 4096,
            used_size: 1024,
            free_size: 3072,
            ..HeapStats::default()
        };
        assert_eq!(stats.usage_percent(), 25);
        assert_eq!(HeapStats::default().usage_percent(), 0);
    }
}

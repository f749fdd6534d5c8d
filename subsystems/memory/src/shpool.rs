//! # Shared Pool
//!
//! A [`SlabPool`] in a `MAP_SHARED` mapping, guarded by the [`SharedMutex`]
//! whose lock word sits at the start of the pool header.
//!
//! Regions are either anonymous (shared with children forked after
//! creation) or named POSIX shared-memory objects that unrelated processes
//! attach with [`SharedPool::get`]. Each process sees the region at its own
//! base address; hand chunks between processes as [`Offset`]s
//! ([`SharedPool::offset_of`] / [`SharedPool::resolve`]).

use crate::allocator::{HeapAllocator, HeapStats};
use crate::region::{Offset, Region};
use crate::slab::{SlabConfig, SlabPool, SlabSnapshot};
use crate::sync::{SharedMutex, SharedMutexGuard, DEFAULT_SPIN};
use crate::{MemError, MemResult};
use alloc::string::String;
use core::alloc::Layout;
use core::cell::UnsafeCell;
use core::fmt;
use core::ptr::NonNull;
use core::sync::atomic::{AtomicU64, Ordering};
use hcore_hal::process::{self, Pid};
use hcore_hal::{Mapping, Protection, SharedMemoryObject};

/// Shared pool configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolConfig {
    /// Page geometry; must match between creator and attachers
    pub slab: SlabConfig,
    /// Spin bound of this process's mutex handle. `usize::MAX` effectively
    /// never yields.
    pub spin: usize,
    /// Regions are never smaller than this many pages
    pub min_pages: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            slab: SlabConfig::host(),
            spin: DEFAULT_SPIN,
            min_pages: 8,
        }
    }
}

/// Process-local handle to a shared slab pool.
pub struct SharedPool {
    slab: UnsafeCell<SlabPool>,
    region: Region,
    config: SlabConfig,
    mutex: SharedMutex,
    mapping: Option<Mapping>,
    object: Option<SharedMemoryObject>,
    /// Pid that created the region through this handle, if any
    creator: Option<Pid>,
    allocations: AtomicU64,
    deallocations: AtomicU64,
}

// SAFETY: the slab view is only used with the shared mutex held (or by the
// caller of an `_locked` method who promised to hold it). Everything else
// is atomics or immutable after construction.
unsafe impl Sync for SharedPool {}

impl SharedPool {
    /// Create a pool of at least `size` bytes with the default configuration.
    ///
    /// With a `name` the region is a POSIX shared-memory object others can
    /// [`get`](SharedPool::get); without one it is anonymous and only
    /// shared with children forked afterwards.
    pub fn create(name: Option<&str>, size: usize) -> MemResult<Self> {
        Self::create_with(name, size, PoolConfig::default())
    }

    /// Create a pool with an explicit configuration.
    ///
    /// `size` is rounded up to a whole number of pages, and to at least
    /// `config.min_pages` pages. Nothing is leaked on failure: the mapping
    /// is released and a created name is unlinked again.
    pub fn create_with(name: Option<&str>, size: usize, config: PoolConfig) -> MemResult<Self> {
        if size == 0 {
            return Err(MemError::InvalidSize);
        }
        let page = config.slab.page();
        let size = page
            .checked_align_up(size.max(config.min_pages.saturating_mul(page.size())))
            .ok_or(MemError::InvalidSize)?;

        let (mapping, object) = match name {
            Some(name) => {
                let object = SharedMemoryObject::create(name, size)?;
                match object.map(size) {
                    Ok(mapping) => (mapping, Some(object)),
                    Err(err) => {
                        let _ = object.unlink();
                        return Err(err.into());
                    }
                }
            }
            None => (Mapping::anonymous(size, Protection::data())?, None),
        };

        Self::bind(mapping, object, config, true)
    }

    /// Attach to the named pool another process created.
    pub fn get(name: &str) -> MemResult<Self> {
        Self::get_with(name, PoolConfig::default())
    }

    /// Attach with an explicit configuration. The page geometry must match
    /// the creator's, or [`MemError::InvalidRegion`] is returned.
    pub fn get_with(name: &str, config: PoolConfig) -> MemResult<Self> {
        let object = SharedMemoryObject::open(name)?;
        let size = object.size()?;
        if size == 0 {
            log::error!("shared pool: {} is empty", object.name());
            return Err(MemError::InvalidRegion);
        }
        let mapping = object.map(size)?;

        Self::bind(mapping, Some(object), config, false)
    }

    fn bind(
        mapping: Mapping,
        object: Option<SharedMemoryObject>,
        config: PoolConfig,
        create: bool,
    ) -> MemResult<Self> {
        let result = Self::view(&mapping, &config, create);
        let (slab, mutex) = match result {
            Ok(parts) => parts,
            Err(err) => {
                if create {
                    if let Some(object) = &object {
                        let _ = object.unlink();
                    }
                }
                return Err(err);
            }
        };

        log::info!(
            "shared pool: {} {} ({} bytes, {} pages of {} bytes)",
            if create { "created" } else { "attached" },
            object.as_ref().map_or("<anonymous>", |o| o.name()),
            mapping.len(),
            slab.page_count(),
            config.slab.page_size()
        );

        Ok(Self {
            region: slab.region(),
            config: config.slab,
            slab: UnsafeCell::new(slab),
            mutex,
            mapping: Some(mapping),
            object,
            creator: create.then(process::current_pid),
            allocations: AtomicU64::new(0),
            deallocations: AtomicU64::new(0),
        })
    }

    fn view(
        mapping: &Mapping,
        config: &PoolConfig,
        create: bool,
    ) -> MemResult<(SlabPool, SharedMutex)> {
        let base = NonNull::new(mapping.as_ptr()).ok_or(MemError::Internal)?;
        // SAFETY: the mapping is page aligned and moves into the pool
        // together with the views built over it.
        let region = unsafe { Region::from_raw(base, mapping.len()) };

        // SAFETY: mutating calls go through the shared mutex bound below. A
        // fresh region is not visible to anyone else yet.
        let slab = unsafe {
            if create {
                SlabPool::init(region, config.slab)?
            } else {
                SlabPool::attach(region, config.slab)?
            }
        };
        // SAFETY: the lock word lives in the mapping.
        let mutex = unsafe { SharedMutex::with_spin(slab.lock_word(), config.spin)? };
        Ok((slab, mutex))
    }

    /// Run `f` on the slab view.
    ///
    /// # Safety
    ///
    /// The caller holds the shared mutex.
    #[inline]
    unsafe fn with_slab<R>(&self, f: impl FnOnce(&mut SlabPool) -> R) -> R {
        // SAFETY: the lock gives this call exclusive use of the view.
        f(unsafe { &mut *self.slab.get() })
    }

    // -------------------------------------------------------------------------
    // Allocation
    // -------------------------------------------------------------------------

    /// Allocate `size` bytes. `None` when the pool is exhausted or `size`
    /// is zero.
    ///
    /// Deadlocks if this process already holds the lock; use
    /// [`SharedPool::guard`] to batch operations instead.
    pub fn alloc(&self, size: usize) -> Option<NonNull<u8>> {
        if size == 0 {
            return None;
        }
        self.mutex.lock();
        // SAFETY: locked above.
        let chunk = unsafe { self.alloc_locked(size) };
        self.mutex.unlock();
        chunk
    }

    /// Allocate without taking the lock.
    ///
    /// # Safety
    ///
    /// The calling process must hold the lock ([`SharedPool::lock`]).
    pub unsafe fn alloc_locked(&self, size: usize) -> Option<NonNull<u8>> {
        if size == 0 {
            return None;
        }
        debug_assert!(self.mutex.is_held_by_current());
        // SAFETY: forwarded.
        let chunk = unsafe { self.with_slab(|slab| slab.alloc(size)) };
        if chunk.is_some() {
            self.allocations.fetch_add(1, Ordering::Relaxed);
        }
        chunk
    }

    /// Allocate `size` zeroed bytes.
    pub fn calloc(&self, size: usize) -> Option<NonNull<u8>> {
        let chunk = self.alloc(size)?;
        // SAFETY: the chunk is at least `size` bytes and ours alone.
        unsafe { chunk.as_ptr().write_bytes(0, size) };
        Some(chunk)
    }

    /// Allocate `size` bytes and return the chunk's region offset.
    pub fn alloc_offset(&self, size: usize) -> Option<Offset> {
        let chunk = self.alloc(size)?;
        self.offset_of(chunk.as_ptr())
    }

    /// Free a chunk returned by this pool (in any process).
    ///
    /// Foreign, misaligned and already freed pointers are rejected and
    /// logged; the pool is left untouched.
    pub fn free(&self, ptr: *const u8) -> MemResult<()> {
        self.mutex.lock();
        // SAFETY: locked above.
        let result = unsafe { self.free_locked(ptr) };
        self.mutex.unlock();
        result
    }

    /// Free without taking the lock.
    ///
    /// # Safety
    ///
    /// The calling process must hold the lock ([`SharedPool::lock`]).
    pub unsafe fn free_locked(&self, ptr: *const u8) -> MemResult<()> {
        debug_assert!(self.mutex.is_held_by_current());
        // SAFETY: forwarded.
        let result = unsafe { self.with_slab(|slab| slab.free(ptr)) };
        if result.is_ok() {
            self.deallocations.fetch_add(1, Ordering::Relaxed);
        }
        result
    }

    /// Free the chunk at region offset `off`.
    pub fn free_offset(&self, off: Offset) -> MemResult<()> {
        let ptr = self.resolve(off).ok_or(MemError::InvalidAddress)?;
        self.free(ptr.as_ptr())
    }

    // -------------------------------------------------------------------------
    // Locking
    // -------------------------------------------------------------------------

    /// Take the pool lock for a batch of `_locked` calls.
    pub fn lock(&self) {
        self.mutex.lock();
    }

    /// Single attempt to take the pool lock.
    pub fn try_lock(&self) -> bool {
        self.mutex.try_lock()
    }

    /// Release the pool lock. A no-op returning false unless this process
    /// holds it.
    pub fn unlock(&self) -> bool {
        self.mutex.unlock()
    }

    /// Clear the lock if `pid` holds it.
    pub fn force_unlock(&self, pid: Pid) -> bool {
        self.mutex.force_unlock(pid)
    }

    /// Clear the lock if its recorded holder has died. Returns that pid.
    pub fn recover(&self) -> Option<Pid> {
        self.mutex.recover()
    }

    /// Pid currently holding the lock
    pub fn owner(&self) -> Option<Pid> {
        self.mutex.owner()
    }

    /// The pool's mutex
    pub fn mutex(&self) -> &SharedMutex {
        &self.mutex
    }

    /// Lock the pool until the returned guard is dropped.
    pub fn guard(&self) -> SharedPoolGuard<'_> {
        SharedPoolGuard {
            pool: self,
            _lock: self.mutex.guard(),
        }
    }

    // -------------------------------------------------------------------------
    // Addressing
    // -------------------------------------------------------------------------

    /// Region offset of `ptr`, which must point into this pool's mapping.
    pub fn offset_of(&self, ptr: *const u8) -> Option<Offset> {
        self.region.offset_of(ptr)
    }

    /// This process's address for region offset `off`.
    pub fn resolve(&self, off: Offset) -> Option<NonNull<u8>> {
        if off.is_null() || off.as_usize() >= self.region.len() {
            return None;
        }
        NonNull::new(self.region.ptr_at(off))
    }

    // -------------------------------------------------------------------------
    // Introspection
    // -------------------------------------------------------------------------

    /// Mapping size in bytes
    pub fn size(&self) -> usize {
        self.region.len()
    }

    /// Page geometry of the pool
    pub fn config(&self) -> &SlabConfig {
        &self.config
    }

    /// Name of the backing object, if the region is named
    pub fn name(&self) -> Option<&str> {
        self.object.as_ref().map(SharedMemoryObject::name)
    }

    /// Did this process create the region through this handle?
    ///
    /// Forked children inherit the handle but not the role.
    pub fn is_creator(&self) -> bool {
        self.creator == Some(process::current_pid())
    }

    /// Consistent copy of the pool structure, taken under the lock.
    ///
    /// Deadlocks if this process already holds the lock; use
    /// [`SharedPoolGuard::snapshot`] under a guard.
    pub fn snapshot(&self) -> SlabSnapshot {
        let _lock = self.mutex.guard();
        // SAFETY: locked above.
        unsafe { self.with_slab(|slab| slab.snapshot()) }
    }

    /// Human-readable report, taken under the lock.
    ///
    /// Deadlocks if this process already holds the lock.
    pub fn dump(&self) -> String {
        let _lock = self.mutex.guard();
        // SAFETY: locked above.
        unsafe { self.with_slab(|slab| slab.dump()) }
    }

    // -------------------------------------------------------------------------
    // Teardown
    // -------------------------------------------------------------------------

    /// Unmap the region, and unlink its name if this process created it.
    pub fn destroy(mut self) -> MemResult<()> {
        self.release()
    }

    fn release(&mut self) -> MemResult<()> {
        let mut result = Ok(());

        if let Some(mapping) = self.mapping.take() {
            if let Err(err) = mapping.unmap() {
                result = Err(err.into());
            }
        }
        if let Some(object) = self.object.take() {
            if self.is_creator() {
                if let Err(err) = object.unlink() {
                    result = result.and(Err(err.into()));
                }
            }
        }
        result
    }
}

impl Drop for SharedPool {
    fn drop(&mut self) {
        // Failures are logged by the HAL.
        let _ = self.release();
    }
}

impl fmt::Debug for SharedPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SharedPool")
            .field("name", &self.name())
            .field("size", &self.mapping.as_ref().map_or(0, Mapping::len))
            .field("creator", &self.creator)
            .field("mutex", &self.mutex)
            .finish()
    }
}

impl HeapAllocator for SharedPool {
    fn allocate(&self, layout: Layout) -> *mut u8 {
        if layout.align() > self.config().page_size() {
            return core::ptr::null_mut();
        }
        // Chunks are aligned to their own size.
        let size = layout.size().max(layout.align());
        self.alloc(size).map_or(core::ptr::null_mut(), NonNull::as_ptr)
    }

    fn deallocate(&self, ptr: *mut u8, _layout: Layout) {
        let _ = self.free(ptr);
    }

    fn name(&self) -> &'static str {
        "shared slab pool"
    }

    fn stats(&self) -> HeapStats {
        let snapshot = self.snapshot();
        let total_size = snapshot.page_count * snapshot.page_size;
        let free_size = snapshot.free_pages * snapshot.page_size;
        HeapStats {
            total_size,
            used_size: total_size - free_size,
            free_size,
            allocations: self.allocations.load(Ordering::Relaxed),
            deallocations: self.deallocations.load(Ordering::Relaxed),
        }
    }
}

/// Holds the pool lock; allocation through the guard does not re-lock.
#[must_use = "the lock is released as soon as the guard is dropped"]
pub struct SharedPoolGuard<'a> {
    pool: &'a SharedPool,
    _lock: SharedMutexGuard<'a>,
}

impl SharedPoolGuard<'_> {
    /// Allocate `size` bytes
    pub fn alloc(&self, size: usize) -> Option<NonNull<u8>> {
        // SAFETY: the guard holds the lock.
        unsafe { self.pool.alloc_locked(size) }
    }

    /// Allocate `size` zeroed bytes
    pub fn calloc(&self, size: usize) -> Option<NonNull<u8>> {
        let chunk = self.alloc(size)?;
        // SAFETY: the chunk is at least `size` bytes and ours alone.
        unsafe { chunk.as_ptr().write_bytes(0, size) };
        Some(chunk)
    }

    /// Allocate `size` bytes, returning the region offset
    pub fn alloc_offset(&self, size: usize) -> Option<Offset> {
        let chunk = self.alloc(size)?;
        self.pool.offset_of(chunk.as_ptr())
    }

    /// Free a chunk
    pub fn free(&self, ptr: *const u8) -> MemResult<()> {
        // SAFETY: the guard holds the lock.
        unsafe { self.pool.free_locked(ptr) }
    }

    /// Free the chunk at region offset `off`
    pub fn free_offset(&self, off: Offset) -> MemResult<()> {
        let ptr = self.pool.resolve(off).ok_or(MemError::InvalidAddress)?;
        self.free(ptr.as_ptr())
    }

    /// Structure of the pool as of now
    pub fn snapshot(&self) -> SlabSnapshot {
        // SAFETY: the guard holds the lock.
        unsafe { self.pool.with_slab(|slab| slab.snapshot()) }
    }
}

impl fmt::Debug for SharedPoolGuard<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SharedPoolGuard")
            .field("pool", &self.pool.name())
            .finish_non_exhaustive()
    }
}

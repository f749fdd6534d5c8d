//! # Shared Slab Pool
//!
//! A slab allocator whose complete state lives inside one [`Region`]:
//!
//! ```text
//! +--------+----------------+-------------------+---------+------------------+
//! | header | slot sentinels | page descriptors  | padding | payload pages    |
//! +--------+----------------+-------------------+---------+------------------+
//! 0                                                       start              end
//! ```
//!
//! Requests up to half a page are served from pages carved into equal
//! power-of-two chunks, grouped per size class on slot lists. Larger
//! requests take whole page runs from the free-run list.
//!
//! All links are region-relative [`Offset`]s. A [`SlabPool`] is only the
//! process-local view; any number of views (in any number of processes) can
//! share one region as long as every mutating call is serialized, normally
//! by the [`SharedLock`] stored at the start of the header.

mod chunk;
mod list;
pub mod page;
mod pages;

pub use page::{PageDescriptor, PageKind};

use crate::region::{Offset, Region};
use crate::sync::SharedLock;
use crate::{MemError, MemResult};
use alloc::string::String;
use alloc::vec::Vec;
use core::fmt::{self, Write};
use core::mem::{offset_of, size_of};
use hcore_hal::PageGeometry;
use page::{prev_kind, WORD_BITS};

/// Marks an initialized header ("HCSLAB", layout version 1)
pub const SLAB_MAGIC: u64 = 0x4843_534c_4142_0001;

/// Smallest page size a pool accepts
pub const MIN_PAGE_SIZE: usize = 1 << 10;
/// Largest page size a pool accepts
pub const MAX_PAGE_SIZE: usize = 1 << 20;

const DESC_SIZE: usize = size_of::<PageDescriptor>();

// =============================================================================
// Configuration
// =============================================================================

/// Page geometry and size classes of a slab pool.
///
/// Computed once and handed to [`SlabPool::init`] / [`SlabPool::attach`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlabConfig {
    page: PageGeometry,
    min_shift: u32,
}

impl SlabConfig {
    /// Smallest chunk is 8 bytes unless configured otherwise
    pub const DEFAULT_MIN_SHIFT: u32 = 3;

    /// Geometry of the host's base page.
    pub fn host() -> Self {
        Self {
            page: PageGeometry::host(),
            min_shift: Self::DEFAULT_MIN_SHIFT,
        }
    }

    /// Geometry for a synthetic page size.
    pub fn with_page_size(page_size: usize) -> MemResult<Self> {
        let page = PageGeometry::new(page_size).map_err(|_| MemError::InvalidSize)?;
        let config = Self {
            page,
            min_shift: Self::DEFAULT_MIN_SHIFT,
        };
        config.validate()?;
        Ok(config)
    }

    /// Change the smallest chunk size to `1 << shift`.
    pub fn with_min_shift(self, shift: u32) -> MemResult<Self> {
        let config = Self {
            min_shift: shift,
            ..self
        };
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> MemResult<()> {
        let size = self.page.size();
        if !(MIN_PAGE_SIZE..=MAX_PAGE_SIZE).contains(&size) {
            return Err(MemError::InvalidSize);
        }
        if self.min_shift < Self::DEFAULT_MIN_SHIFT || self.min_shift >= self.exact_shift() {
            return Err(MemError::InvalidSize);
        }
        Ok(())
    }

    /// Page geometry
    #[inline]
    pub const fn page(&self) -> PageGeometry {
        self.page
    }

    /// Page size in bytes
    #[inline]
    pub const fn page_size(&self) -> usize {
        self.page.size()
    }

    /// log2 of the page size
    #[inline]
    pub const fn page_shift(&self) -> u32 {
        self.page.shift()
    }

    /// log2 of the smallest chunk
    #[inline]
    pub const fn min_shift(&self) -> u32 {
        self.min_shift
    }

    /// Smallest chunk in bytes
    #[inline]
    pub const fn min_size(&self) -> usize {
        1 << self.min_shift
    }

    /// Shift of the chunk size whose page bitmap is exactly one word
    #[inline]
    pub const fn exact_shift(&self) -> u32 {
        self.page.shift() - WORD_BITS.trailing_zeros()
    }

    /// `page_size / 64`
    #[inline]
    pub const fn exact_size(&self) -> usize {
        1 << self.exact_shift()
    }

    /// Largest request served from a slab page; anything bigger takes pages
    #[inline]
    pub const fn max_size(&self) -> usize {
        self.page.size() / 2
    }

    /// Number of size classes (`min_shift ..= page_shift - 1`)
    #[inline]
    pub const fn slot_count(&self) -> usize {
        (self.page.shift() - self.min_shift) as usize
    }

    /// Chunk shift for a slab request of `size` bytes.
    #[inline]
    pub const fn shift_for(&self, size: usize) -> u32 {
        if size <= self.min_size() {
            self.min_shift
        } else {
            usize::BITS - (size - 1).leading_zeros()
        }
    }

    /// Bitmap words at the start of a small-chunk page
    #[inline]
    pub const fn bitmap_words(&self, shift: u32) -> usize {
        (self.page.size() >> shift) / WORD_BITS
    }

    /// Chunks of a small-chunk page covered by its own bitmap
    #[inline]
    pub const fn reserved_chunks(&self, shift: u32) -> usize {
        let n = (self.page.size() >> shift) / (8 << shift);
        if n == 0 {
            1
        } else {
            n
        }
    }
}

impl Default for SlabConfig {
    fn default() -> Self {
        Self::host()
    }
}

// =============================================================================
// Header
// =============================================================================

/// Pool header at offset zero of the region.
///
/// Every field except `free_pages` and the list sentinel is written once by
/// [`SlabPool::init`].
#[repr(C)]
#[derive(Debug)]
pub(crate) struct SlabHeader {
    /// Shared mutex word; must stay first
    pub(crate) lock: SharedLock,
    magic: u64,
    page_size: u64,
    min_shift: u64,
    size: u64,
    slots: u64,
    pages: u64,
    page_count: u64,
    start: u64,
    free_pages: u64,
    free: PageDescriptor,
}

static_assertions::const_assert_eq!(offset_of!(SlabHeader, lock), 0);
static_assertions::const_assert_eq!(size_of::<SlabHeader>() % 8, 0);

/// Where things live inside a region of a given size
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct PoolLayout {
    slots: Offset,
    pages: Offset,
    page_count: usize,
    start: Offset,
}

impl PoolLayout {
    fn compute(len: usize, config: &SlabConfig) -> MemResult<Self> {
        let slots = size_of::<SlabHeader>();
        let pages = slots + config.slot_count() * DESC_SIZE;
        if len <= pages {
            return Err(MemError::InvalidSize);
        }

        let mut page_count = (len - pages) / (config.page_size() + DESC_SIZE);
        let start = config.page.align_up(pages + page_count * DESC_SIZE);
        if start >= len {
            return Err(MemError::InvalidSize);
        }
        page_count = page_count.min((len - start) >> config.page_shift());
        if page_count == 0 {
            return Err(MemError::InvalidSize);
        }

        Ok(Self {
            slots: Offset::from_usize(slots),
            pages: Offset::from_usize(pages),
            page_count,
            start: Offset::from_usize(start),
        })
    }
}

// =============================================================================
// Pool
// =============================================================================

/// Process-local view of a slab pool stored in a region.
///
/// Mutating methods take `&mut self`; when several views share a region
/// (other processes, or other handles in this one) the caller serializes them
/// through the region's lock.
pub struct SlabPool {
    region: Region,
    config: SlabConfig,
    layout: PoolLayout,
    end: Offset,
}

impl SlabPool {
    /// Lay out a fresh pool over `region`, discarding its contents.
    ///
    /// Returns [`MemError::InvalidSize`] if the region cannot hold the
    /// metadata plus at least one page.
    ///
    /// # Safety
    ///
    /// No other view may access the region while this runs, and all later
    /// mutating calls on views of the region must be serialized.
    pub unsafe fn init(region: Region, config: SlabConfig) -> MemResult<Self> {
        let layout = PoolLayout::compute(region.len(), &config)?;
        let pool = Self::from_layout(region, config, layout);

        let header = pool.header();
        // SAFETY: the layout fits the region, so the header does too.
        unsafe {
            header.write(SlabHeader {
                lock: SharedLock::new(),
                magic: 0,
                page_size: config.page_size() as u64,
                min_shift: u64::from(config.min_shift()),
                size: region.len() as u64,
                slots: layout.slots.as_u64(),
                pages: layout.pages.as_u64(),
                page_count: layout.page_count as u64,
                start: layout.start.as_u64(),
                free_pages: 0,
                free: PageDescriptor::default(),
            });
        }

        for slot in 0..config.slot_count() {
            pool.list_init(pool.slot_node(slot));
        }
        for idx in 0..layout.page_count {
            pool.clear(pool.page_node(idx));
        }
        pool.list_init(pool.free_head());

        pool.insert_free_run(0, layout.page_count);
        pool.set_free_count(layout.page_count);

        // SAFETY: as above; magic goes last so a half-built header is refused.
        unsafe { (*header).magic = SLAB_MAGIC };

        log::info!(
            "slab pool: initialized {} bytes, {} pages of {} bytes at {}, chunks {}..={} bytes",
            region.len(),
            layout.page_count,
            config.page_size(),
            layout.start,
            config.min_size(),
            config.max_size()
        );

        Ok(pool)
    }

    /// View a pool that [`SlabPool::init`] already built in `region`.
    ///
    /// Returns [`MemError::InvalidRegion`] if the header is missing or was
    /// built for a different geometry.
    ///
    /// # Safety
    ///
    /// Mutating calls must be serialized with every other view of the region.
    pub unsafe fn attach(region: Region, config: SlabConfig) -> MemResult<Self> {
        if region.len() < size_of::<SlabHeader>() {
            return Err(MemError::InvalidRegion);
        }
        let header = region.as_ptr().cast::<SlabHeader>();
        // SAFETY: the region holds at least a header. These fields are
        // written once by init and never change afterwards.
        let (magic, page_size, min_shift, size) = unsafe {
            (
                (*header).magic,
                (*header).page_size,
                (*header).min_shift,
                (*header).size,
            )
        };
        // SAFETY: as above.
        let recorded = unsafe {
            [
                (*header).slots,
                (*header).pages,
                (*header).page_count,
                (*header).start,
            ]
        };

        if magic != SLAB_MAGIC {
            log::error!("slab pool: no pool header in region ({:#x})", magic);
            return Err(MemError::InvalidRegion);
        }
        if page_size != config.page_size() as u64 || min_shift != u64::from(config.min_shift()) {
            log::error!(
                "slab pool: region built for {} byte pages / {} byte chunks, this process uses {} / {}",
                page_size,
                1u64 << min_shift.min(63),
                config.page_size(),
                config.min_size()
            );
            return Err(MemError::InvalidRegion);
        }

        let size = usize::try_from(size).map_err(|_| MemError::InvalidRegion)?;
        if size > region.len() {
            return Err(MemError::InvalidRegion);
        }
        let layout = PoolLayout::compute(size, &config).map_err(|_| MemError::InvalidRegion)?;
        let expected = [
            layout.slots.as_u64(),
            layout.pages.as_u64(),
            layout.page_count as u64,
            layout.start.as_u64(),
        ];
        if recorded != expected {
            log::error!("slab pool: header layout {:?} does not match {:?}", recorded, expected);
            return Err(MemError::InvalidRegion);
        }

        let pool = Self::from_layout(region, config, layout);
        log::info!(
            "slab pool: attached {} bytes, {} of {} pages free",
            size,
            pool.free_page_count(),
            layout.page_count
        );
        Ok(pool)
    }

    fn from_layout(region: Region, config: SlabConfig, layout: PoolLayout) -> Self {
        let end = layout
            .start
            .add((layout.page_count << config.page_shift()) as u64);
        Self {
            region,
            config,
            layout,
            end,
        }
    }

    /// Geometry
    #[inline]
    pub fn config(&self) -> &SlabConfig {
        &self.config
    }

    /// The underlying region
    #[inline]
    pub fn region(&self) -> Region {
        self.region
    }

    /// Number of payload pages
    #[inline]
    pub fn page_count(&self) -> usize {
        self.layout.page_count
    }

    /// Number of pages on the free-run list
    pub fn free_page_count(&self) -> usize {
        // SAFETY: header is inside the region.
        unsafe { (*self.header()).free_pages as usize }
    }

    /// Offset of the first payload page
    #[inline]
    pub fn start(&self) -> Offset {
        self.layout.start
    }

    /// Offset one past the last payload page
    #[inline]
    pub fn end(&self) -> Offset {
        self.end
    }

    /// The lock word embedded in the header
    #[inline]
    pub fn lock_word(&self) -> *const SharedLock {
        // SAFETY: lock is the first field of the header at offset zero.
        unsafe { core::ptr::addr_of!((*self.header()).lock) }
    }

    /// Bytes a request of `size` actually occupies
    pub fn chunk_size(&self, size: usize) -> usize {
        if size > self.config.max_size() {
            self.config.page.pages_for(size) << self.config.page_shift()
        } else {
            1 << self.config.shift_for(size)
        }
    }

    // -------------------------------------------------------------------------
    // Raw accessors. Every offset handed to these is a header, sentinel or
    // descriptor offset computed from the layout, so it is inside the region.
    // -------------------------------------------------------------------------

    #[inline]
    fn header(&self) -> *mut SlabHeader {
        self.region.as_ptr().cast()
    }

    #[inline]
    fn desc(&self, node: Offset) -> *mut PageDescriptor {
        self.region.ptr_at(node).cast()
    }

    #[inline]
    fn slab(&self, node: Offset) -> u64 {
        // SAFETY: see above.
        unsafe { (*self.desc(node)).slab }
    }

    #[inline]
    fn set_slab(&self, node: Offset, slab: u64) {
        // SAFETY: see above.
        unsafe { (*self.desc(node)).slab = slab }
    }

    #[inline]
    fn prev(&self, node: Offset) -> u64 {
        // SAFETY: see above.
        unsafe { (*self.desc(node)).prev }
    }

    #[inline]
    fn set_prev(&self, node: Offset, prev: u64) {
        // SAFETY: see above.
        unsafe { (*self.desc(node)).prev = prev }
    }

    #[inline]
    fn next(&self, node: Offset) -> Offset {
        // SAFETY: see above.
        Offset::new(unsafe { (*self.desc(node)).next })
    }

    #[inline]
    fn set_next(&self, node: Offset, next: Offset) {
        // SAFETY: see above.
        unsafe { (*self.desc(node)).next = next.as_u64() }
    }

    #[inline]
    fn kind(&self, node: Offset) -> PageKind {
        prev_kind(self.prev(node))
    }

    #[inline]
    fn clear(&self, node: Offset) {
        // SAFETY: see above.
        unsafe { self.desc(node).write(PageDescriptor::default()) }
    }

    #[inline]
    fn set_free_count(&self, pages: usize) {
        // SAFETY: header is inside the region.
        unsafe { (*self.header()).free_pages = pages as u64 }
    }

    #[inline]
    fn free_head(&self) -> Offset {
        Offset::from_usize(offset_of!(SlabHeader, free))
    }

    #[inline]
    fn slot_node(&self, slot: usize) -> Offset {
        self.layout.slots.add((slot * DESC_SIZE) as u64)
    }

    #[inline]
    fn slot_for(&self, shift: u32) -> Offset {
        self.slot_node((shift - self.config.min_shift()) as usize)
    }

    #[inline]
    fn page_node(&self, idx: usize) -> Offset {
        self.layout.pages.add((idx * DESC_SIZE) as u64)
    }

    #[inline]
    fn page_index(&self, node: Offset) -> usize {
        (node.as_usize() - self.layout.pages.as_usize()) / DESC_SIZE
    }

    #[inline]
    fn page_data(&self, idx: usize) -> Offset {
        self.layout.start.add((idx << self.config.page_shift()) as u64)
    }

    // -------------------------------------------------------------------------
    // Diagnostics
    // -------------------------------------------------------------------------

    /// Copy of the pool's structure.
    ///
    /// Always structurally valid; it is only current if the caller holds the
    /// region lock.
    pub fn snapshot(&self) -> SlabSnapshot {
        let mut free_runs: Vec<PageRun> = self
            .list_iter(self.free_head())
            .map(|node| PageRun {
                first: self.page_index(node),
                len: self.slab(node) as usize,
            })
            .collect();
        free_runs.sort_unstable();

        let slot_pages = (0..self.config.slot_count())
            .map(|slot| self.list_iter(self.slot_node(slot)).count())
            .collect();

        SlabSnapshot {
            page_size: self.config.page_size(),
            min_shift: self.config.min_shift(),
            page_count: self.layout.page_count,
            free_pages: self.free_page_count(),
            free_runs,
            slot_pages,
        }
    }

    /// Human-readable report of the pool; also logged at debug level.
    pub fn dump(&self) -> String {
        let mut out = String::new();
        let _ = write!(out, "{}", self.snapshot());
        log::debug!("{}", out);
        out
    }
}

impl fmt::Debug for SlabPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SlabPool")
            .field("region", &self.region)
            .field("page_size", &self.config.page_size())
            .field("page_count", &self.layout.page_count)
            .field("start", &self.layout.start)
            .finish()
    }
}

/// A run of contiguous pages
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct PageRun {
    /// Index of the first page
    pub first: usize,
    /// Number of pages
    pub len: usize,
}

/// Point-in-time copy of a pool's structure
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlabSnapshot {
    /// Page size in bytes
    pub page_size: usize,
    /// log2 of the smallest chunk
    pub min_shift: u32,
    /// Number of payload pages
    pub page_count: usize,
    /// Free-page counter from the header
    pub free_pages: usize,
    /// Free runs, sorted by first page
    pub free_runs: Vec<PageRun>,
    /// Partially used pages linked on each size class
    pub slot_pages: Vec<usize>,
}

impl SlabSnapshot {
    /// Pages covered by the free-run list
    pub fn free_run_pages(&self) -> usize {
        self.free_runs.iter().map(|run| run.len).sum()
    }

    /// Pages linked on any slot list
    pub fn linked_pages(&self) -> usize {
        self.slot_pages.iter().sum()
    }
}

impl fmt::Display for SlabSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "slab pool: {} pages of {} bytes, {} free",
            self.page_count, self.page_size, self.free_pages
        )?;
        for run in &self.free_runs {
            writeln!(f, "  free run: pages {}..{}", run.first, run.first + run.len)?;
        }
        for (slot, &pages) in self.slot_pages.iter().enumerate() {
            if pages != 0 {
                let size = 1usize << (self.min_shift as usize + slot);
                writeln!(f, "  {:>7} byte chunks: {} pages", size, pages)?;
            }
        }
        Ok(())
    }
}

//! Chunk allocator.
//!
//! Requests up to half a page are rounded to a power of two and served from
//! a slab page of that class:
//!
//! - **small** (below `page_size / 64`): occupancy bitmap in the first words
//!   of the page itself, those leading chunks permanently taken
//! - **exact** (`page_size / 64`): the descriptor's `slab` word is the bitmap
//! - **big** (above that): upper half of `slab` is the bitmap, at most 32
//!   chunks per page
//!
//! Only pages with a free chunk are linked on their slot list, so allocation
//! only ever looks at the first page of the list.

use super::page::{
    prefix_word, PageKind, MAP_MASK, MAP_SHIFT, PAGE_BUSY, PAGE_START, SHIFT_MASK, SLAB_BUSY,
    WORD_BITS,
};
use super::SlabPool;
use crate::region::Offset;
use crate::{MemError, MemResult};
use core::ptr::NonNull;

impl SlabPool {
    /// Allocate `size` bytes. Returns `None` when the pool is exhausted.
    pub fn alloc(&mut self, size: usize) -> Option<NonNull<u8>> {
        let off = self.alloc_offset(size)?;
        NonNull::new(self.region.ptr_at(off))
    }

    /// Allocate `size` bytes, returning the chunk's region offset.
    pub fn alloc_offset(&mut self, size: usize) -> Option<Offset> {
        debug_assert!(size != 0, "zero-sized slab allocation");
        if size == 0 {
            return None;
        }

        if size > self.config.max_size() {
            let idx = self.alloc_pages(self.config.page().pages_for(size))?;
            return Some(self.page_data(idx));
        }

        let shift = self.config.shift_for(size);
        let slot = self.slot_for(shift);
        if !self.list_is_empty(slot) {
            let page = self.next(slot);
            if let Some(off) = self.take_chunk(page, shift) {
                return Some(off);
            }
        }
        self.alloc_slab_page(slot, shift)
    }

    /// Free the chunk at `ptr`.
    pub fn free(&mut self, ptr: *const u8) -> MemResult<()> {
        match self.region.offset_of(ptr) {
            Some(off) => self.free_offset(off),
            None => {
                log::warn!("slab pool: free({:p}) outside the region", ptr);
                Err(MemError::InvalidAddress)
            }
        }
    }

    /// Free the chunk at region offset `off`.
    ///
    /// Pointers that are not the start of a live chunk are rejected without
    /// touching the pool.
    pub fn free_offset(&mut self, off: Offset) -> MemResult<()> {
        if off < self.layout.start || off >= self.end {
            log::warn!(
                "slab pool: free({}) outside the pages [{}, {})",
                off,
                self.layout.start,
                self.end
            );
            return Err(MemError::InvalidAddress);
        }

        let rel = off.as_usize() - self.layout.start.as_usize();
        let idx = rel >> self.config.page_shift();
        let within = rel & (self.config.page_size() - 1);
        let page = self.page_node(idx);
        let kind = self.kind(page);

        let result = match kind {
            PageKind::Small => self.free_small(page, idx, within),
            PageKind::Exact => self.free_exact(page, idx, within),
            PageKind::Big => self.free_big(page, idx, within),
            PageKind::Page => self.free_run(page, idx, within),
        };
        if let Err(err) = result {
            log::warn!(
                "slab pool: free({}) rejected, {} page {}: {}",
                off,
                kind.name(),
                idx,
                err
            );
        }
        result
    }

    // -------------------------------------------------------------------------
    // Allocation
    // -------------------------------------------------------------------------

    /// Take a chunk from the linked page `page` of class `shift`.
    fn take_chunk(&mut self, page: Offset, shift: u32) -> Option<Offset> {
        let idx = self.page_index(page);
        let exact = self.config.exact_shift();
        let (kind, chunk) = if shift < exact {
            (PageKind::Small, self.take_small(page, idx, shift))
        } else if shift == exact {
            (PageKind::Exact, self.take_exact(page, idx, shift))
        } else {
            (PageKind::Big, self.take_big(page, idx, shift))
        };

        if chunk.is_none() {
            log::error!(
                "slab pool: {} page {} is linked for {} byte chunks but full",
                kind.name(),
                idx,
                1usize << shift
            );
            self.unlink_full(page, kind);
        }
        chunk
    }

    fn take_small(&mut self, page: Offset, idx: usize, shift: u32) -> Option<Offset> {
        let data = self.page_data(idx);
        let words = self.config.bitmap_words(shift);

        for i in 0..words {
            let word = self.bitmap_word(data, i);
            if word == SLAB_BUSY {
                continue;
            }
            let bit = (!word).trailing_zeros() as usize;
            self.set_bitmap_word(data, i, word | (1 << bit));

            if (i..words).all(|j| self.bitmap_word(data, j) == SLAB_BUSY) {
                self.unlink_full(page, PageKind::Small);
            }
            return Some(data.add(((i * WORD_BITS + bit) << shift) as u64));
        }
        None
    }

    fn take_exact(&mut self, page: Offset, idx: usize, shift: u32) -> Option<Offset> {
        let slab = self.slab(page);
        if slab == SLAB_BUSY {
            return None;
        }
        let bit = (!slab).trailing_zeros();
        let slab = slab | (1 << bit);
        self.set_slab(page, slab);

        if slab == SLAB_BUSY {
            self.unlink_full(page, PageKind::Exact);
        }
        Some(self.page_data(idx).add(u64::from(bit) << shift))
    }

    fn take_big(&mut self, page: Offset, idx: usize, shift: u32) -> Option<Offset> {
        let mask = self.big_mask(shift);
        let slab = self.slab(page);
        let free = !slab & mask;
        if free == 0 {
            return None;
        }
        let bit = free.trailing_zeros();
        let slab = slab | (1 << bit);
        self.set_slab(page, slab);

        if slab & MAP_MASK == mask {
            self.unlink_full(page, PageKind::Big);
        }
        Some(self.page_data(idx).add(u64::from(bit - MAP_SHIFT) << shift))
    }

    /// Start a new slab page of class `shift` and return its first chunk.
    fn alloc_slab_page(&mut self, slot: Offset, shift: u32) -> Option<Offset> {
        let idx = self.alloc_pages(1)?;
        let page = self.page_node(idx);
        let data = self.page_data(idx);
        let exact = self.config.exact_shift();

        let (kind, chunk) = if shift < exact {
            let reserved = self.config.reserved_chunks(shift);
            for i in 0..self.config.bitmap_words(shift) {
                self.set_bitmap_word(data, i, prefix_word(i, reserved + 1));
            }
            self.set_slab(page, u64::from(shift));
            (PageKind::Small, data.add((reserved << shift) as u64))
        } else if shift == exact {
            self.set_slab(page, 1);
            (PageKind::Exact, data)
        } else {
            self.set_slab(page, (1 << MAP_SHIFT) | u64::from(shift));
            (PageKind::Big, data)
        };

        self.list_push_front(slot, page, kind);
        Some(chunk)
    }

    // -------------------------------------------------------------------------
    // Free
    // -------------------------------------------------------------------------

    fn free_small(&mut self, page: Offset, idx: usize, within: usize) -> MemResult<()> {
        let shift = (self.slab(page) & SHIFT_MASK) as u32;
        if within & ((1 << shift) - 1) != 0 {
            return Err(MemError::WrongChunk);
        }
        let chunk = within >> shift;
        let reserved = self.config.reserved_chunks(shift);
        if chunk < reserved {
            return Err(MemError::WrongChunk);
        }

        let data = self.page_data(idx);
        let (word_idx, bit) = (chunk / WORD_BITS, 1u64 << (chunk % WORD_BITS));
        let word = self.bitmap_word(data, word_idx);
        if word & bit == 0 {
            return Err(MemError::AlreadyFree);
        }
        self.set_bitmap_word(data, word_idx, word & !bit);
        self.relink_if_full(page, shift, PageKind::Small);

        let words = self.config.bitmap_words(shift);
        if (0..words).all(|i| self.bitmap_word(data, i) == prefix_word(i, reserved)) {
            self.free_pages(idx, 1);
        }
        Ok(())
    }

    fn free_exact(&mut self, page: Offset, idx: usize, within: usize) -> MemResult<()> {
        let shift = self.config.exact_shift();
        if within & ((1 << shift) - 1) != 0 {
            return Err(MemError::WrongChunk);
        }
        let bit = 1u64 << (within >> shift);
        let slab = self.slab(page);
        if slab & bit == 0 {
            return Err(MemError::AlreadyFree);
        }
        self.set_slab(page, slab & !bit);
        self.relink_if_full(page, shift, PageKind::Exact);

        if slab & !bit == 0 {
            self.free_pages(idx, 1);
        }
        Ok(())
    }

    fn free_big(&mut self, page: Offset, idx: usize, within: usize) -> MemResult<()> {
        let slab = self.slab(page);
        let shift = (slab & SHIFT_MASK) as u32;
        if within & ((1 << shift) - 1) != 0 {
            return Err(MemError::WrongChunk);
        }
        let bit = 1u64 << ((within >> shift) as u32 + MAP_SHIFT);
        if slab & bit == 0 {
            return Err(MemError::AlreadyFree);
        }
        self.set_slab(page, slab & !bit);
        self.relink_if_full(page, shift, PageKind::Big);

        if slab & !bit & MAP_MASK == 0 {
            self.free_pages(idx, 1);
        }
        Ok(())
    }

    fn free_run(&mut self, page: Offset, idx: usize, within: usize) -> MemResult<()> {
        let slab = self.slab(page);
        if slab == PAGE_BUSY {
            return Err(MemError::WrongChunk);
        }
        if slab & PAGE_START == 0 {
            return Err(MemError::AlreadyFree);
        }
        if within != 0 {
            return Err(MemError::WrongChunk);
        }
        self.free_pages(idx, (slab & !PAGE_START) as usize);
        Ok(())
    }

    /// A full page just got a free chunk: put it back on its slot list.
    fn relink_if_full(&mut self, page: Offset, shift: u32, kind: PageKind) {
        if self.next(page).is_null() {
            self.list_push_front(self.slot_for(shift), page, kind);
        }
    }

    // -------------------------------------------------------------------------
    // Bitmaps
    // -------------------------------------------------------------------------

    #[inline]
    fn big_mask(&self, shift: u32) -> u64 {
        let chunks = self.config.page_size() >> shift;
        ((1u64 << chunks) - 1) << MAP_SHIFT
    }

    #[inline]
    fn bitmap_word(&self, data: Offset, i: usize) -> u64 {
        let ptr = self.region.ptr_at(data.add((i * 8) as u64)).cast::<u64>();
        // SAFETY: the bitmap lies at the start of a payload page in the region.
        unsafe { ptr.read() }
    }

    #[inline]
    fn set_bitmap_word(&self, data: Offset, i: usize, word: u64) {
        let ptr = self.region.ptr_at(data.add((i * 8) as u64)).cast::<u64>();
        // SAFETY: as in bitmap_word.
        unsafe { ptr.write(word) }
    }
}

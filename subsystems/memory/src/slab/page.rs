//! # Page Descriptors
//!
//! One [`PageDescriptor`] per payload page, plus the same layout for list
//! sentinels. Three words:
//!
//! - `slab`: meaning depends on the page kind (see [`PageKind`])
//! - `prev`: offset of the previous list node, with the kind in the low two
//!   bits (nodes are 8-byte aligned, so those bits are always free)
//! - `next`: offset of the next list node, or null when the page is not on
//!   any list (allocated page runs, full slab pages, run interiors)

use crate::region::Offset;

/// `slab` of a free-run tail or interior page
pub const PAGE_FREE: u64 = 0;
/// `slab` of a continuation page inside an allocated run
pub const PAGE_BUSY: u64 = u64::MAX;
/// Set in `slab` of the head page of an allocated run
pub const PAGE_START: u64 = 1 << 63;

/// Low bits of `slab` holding log2(chunk size) for small and big pages
pub const SHIFT_MASK: u64 = 0x1f;
/// Big pages keep their occupancy mask in the upper half of `slab`
pub const MAP_SHIFT: u32 = 32;
/// Occupancy bits of a big page
pub const MAP_MASK: u64 = 0xffff_ffff_0000_0000;

/// A bitmap word with every chunk taken
pub const SLAB_BUSY: u64 = u64::MAX;
/// Bits per bitmap word
pub const WORD_BITS: usize = u64::BITS as usize;

const KIND_MASK: u64 = 3;

/// How a page's `slab` word (and payload) is interpreted
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PageKind {
    /// Whole-page run. `slab` is the run length (free head), the length
    /// plus [`PAGE_START`] (allocated head) or [`PAGE_BUSY`] (continuation)
    Page = 0,
    /// Chunks larger than the exact size; upper 32 bits of `slab` are the
    /// occupancy mask, low bits the chunk shift
    Big = 1,
    /// Chunks of exactly `page_size / 64`; `slab` is the whole bitmap
    Exact = 2,
    /// Chunks smaller than the exact size; `slab` is the chunk shift and the
    /// bitmap sits at the start of the page payload
    Small = 3,
}

impl PageKind {
    /// Decode the kind from the low bits of a `prev` word
    #[inline]
    pub const fn from_bits(bits: u64) -> Self {
        match bits & KIND_MASK {
            0 => PageKind::Page,
            1 => PageKind::Big,
            2 => PageKind::Exact,
            _ => PageKind::Small,
        }
    }

    /// Encoded tag
    #[inline]
    pub const fn bits(self) -> u64 {
        self as u64
    }

    /// Short name for diagnostics
    pub const fn name(self) -> &'static str {
        match self {
            PageKind::Page => "page",
            PageKind::Big => "big",
            PageKind::Exact => "exact",
            PageKind::Small => "small",
        }
    }
}

/// Per-page metadata stored in the shared region
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PageDescriptor {
    /// Kind-dependent payload
    pub slab: u64,
    /// Previous node offset | kind tag
    pub prev: u64,
    /// Next node offset, 0 when unlinked
    pub next: u64,
}

static_assertions::const_assert_eq!(core::mem::size_of::<PageDescriptor>(), 24);
static_assertions::const_assert_eq!(core::mem::align_of::<PageDescriptor>(), 8);

/// Pack a list link and a kind into a `prev` word
#[inline]
pub const fn pack_prev(link: Offset, kind: PageKind) -> u64 {
    debug_assert!(link.as_u64() & KIND_MASK == 0);
    link.as_u64() | kind.bits()
}

/// The link half of a `prev` word
#[inline]
pub const fn prev_link(prev: u64) -> Offset {
    Offset::new(prev & !KIND_MASK)
}

/// The kind half of a `prev` word
#[inline]
pub const fn prev_kind(prev: u64) -> PageKind {
    PageKind::from_bits(prev)
}

/// Mask of the low `count` bits of bitmap word `index` when bits
/// `[0, count)` of the whole bitmap are set.
#[inline]
pub const fn prefix_word(index: usize, count: usize) -> u64 {
    let lo = index * WORD_BITS;
    if count <= lo {
        0
    } else if count >= lo + WORD_BITS {
        SLAB_BUSY
    } else {
        (1u64 << (count - lo)) - 1
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_round_trip() {
        for kind in [PageKind::Page, PageKind::Big, PageKind::Exact, PageKind::Small] {
            assert_eq!(PageKind::from_bits(kind.bits()), kind);
        }
    }

    #[test]
    fn test_pack_prev_keeps_link_and_kind() {
        let link = Offset::new(0x1238);
        let prev = pack_prev(link, PageKind::Exact);
        assert_eq!(prev_link(prev), link);
        assert_eq!(prev_kind(prev), PageKind::Exact);

        let null = pack_prev(Offset::NULL, PageKind::Small);
        assert!(prev_link(null).is_null());
        assert_eq!(prev_kind(null), PageKind::Small);
    }

    #[test]
    fn test_zeroed_descriptor_is_page_kind() {
        let desc = PageDescriptor::default();
        assert_eq!(prev_kind(desc.prev), PageKind::Page);
        assert_eq!(desc.slab, PAGE_FREE);
    }

    #[test]
    fn test_page_flags_disjoint_from_lengths() {
        assert_ne!(PAGE_BUSY & PAGE_START, 0);
        assert_eq!((5 | PAGE_START) & !PAGE_START, 5);
        assert_ne!(PAGE_BUSY & !PAGE_START, 5);
    }

    #[test]
    fn test_big_page_fields() {
        let slab = (1u64 << MAP_SHIFT) | 11;
        assert_eq!(slab & SHIFT_MASK, 11);
        assert_eq!((slab & MAP_MASK) >> MAP_SHIFT, 1);
    }

    #[test]
    fn test_prefix_word() {
        assert_eq!(prefix_word(0, 0), 0);
        assert_eq!(prefix_word(0, 3), 0b111);
        assert_eq!(prefix_word(0, 64), SLAB_BUSY);
        assert_eq!(prefix_word(1, 64), 0);
        assert_eq!(prefix_word(0, 70), SLAB_BUSY);
        assert_eq!(prefix_word(1, 70), 0b11_1111);
        assert_eq!(prefix_word(2, 70), 0);
    }
}

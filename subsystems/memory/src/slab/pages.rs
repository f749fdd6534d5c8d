//! Page-run allocator.
//!
//! Free pages are kept as runs on the free-run list. A run head stores the
//! run length in `slab` and is linked; a run of more than one page also has
//! its last descriptor point back at the head, so freeing the page right
//! after it can find the head in O(1). Interior descriptors are zero.

use super::page::{pack_prev, prev_link, PageKind, PAGE_BUSY, PAGE_FREE, PAGE_START};
use super::SlabPool;
use crate::region::Offset;

impl SlabPool {
    /// Take `n` contiguous pages, first fit. Returns the first page index.
    pub(super) fn alloc_pages(&mut self, n: usize) -> Option<usize> {
        debug_assert!(n != 0);
        if n == 0 {
            return None;
        }

        let head = self.free_head();
        let Some(run) = self
            .list_iter(head)
            .find(|&node| self.slab(node) as usize >= n)
        else {
            log::debug!(
                "slab pool: no run of {} pages ({} pages free)",
                n,
                self.free_page_count()
            );
            return None;
        };

        let idx = self.page_index(run);
        let len = self.slab(run) as usize;
        if len > n {
            let rest = self.page_node(idx + n);
            self.set_slab(rest, (len - n) as u64);
            self.list_replace(run, rest, PageKind::Page);
            if len - n > 1 {
                self.set_prev(self.page_node(idx + len - 1), pack_prev(rest, PageKind::Page));
            }
        } else {
            self.list_unlink(run);
        }

        self.set_slab(run, n as u64 | PAGE_START);
        self.set_next(run, Offset::NULL);
        self.set_prev(run, pack_prev(Offset::NULL, PageKind::Page));
        for i in 1..n {
            let page = self.page_node(idx + i);
            self.set_slab(page, PAGE_BUSY);
            self.set_next(page, Offset::NULL);
            self.set_prev(page, pack_prev(Offset::NULL, PageKind::Page));
        }

        self.set_free_count(self.free_page_count() - n);
        Some(idx)
    }

    /// Return `n` pages starting at `idx`, merging with free neighbours.
    ///
    /// The head page may still be linked on a slot list (an emptied slab
    /// page); it is unlinked first.
    pub(super) fn free_pages(&mut self, idx: usize, n: usize) {
        let page = self.page_node(idx);
        if !self.next(page).is_null() {
            self.list_unlink(page);
        }
        self.clear(page);
        for i in 1..n {
            self.clear(self.page_node(idx + i));
        }

        let mut first = idx;
        let mut len = n;

        let right = idx + n;
        if right < self.page_count() {
            let join = self.page_node(right);
            if self.is_free_run(join) {
                len += self.slab(join) as usize;
                self.list_unlink(join);
                self.clear(join);
            }
        }

        if idx > 0 {
            let before = self.page_node(idx - 1);
            if self.kind(before) == PageKind::Page {
                let join = if self.slab(before) == PAGE_FREE {
                    prev_link(self.prev(before))
                } else {
                    before
                };
                if !join.is_null() && self.is_free_run(join) {
                    len += self.slab(join) as usize;
                    self.list_unlink(join);
                    first = self.page_index(join);
                }
            }
        }

        self.insert_free_run(first, len);
        self.set_free_count(self.free_page_count() + n);
    }

    /// Link `[first, first + len)` on the free-run list as one run.
    pub(super) fn insert_free_run(&self, first: usize, len: usize) {
        let head = self.page_node(first);
        self.set_slab(head, len as u64);
        self.list_push_front(self.free_head(), head, PageKind::Page);

        if len > 1 {
            let tail = self.page_node(first + len - 1);
            self.set_slab(tail, PAGE_FREE);
            self.set_next(tail, Offset::NULL);
            self.set_prev(tail, pack_prev(head, PageKind::Page));
        }
    }

    /// A linked `PAGE` descriptor heads a free run.
    fn is_free_run(&self, node: Offset) -> bool {
        self.kind(node) == PageKind::Page && !self.next(node).is_null()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::slab::tests::heap_pool;
    use crate::slab::PageRun;
    use alloc::vec;

    #[test]
    fn test_alloc_splits_first_run() {
        let (_heap, mut pool) = heap_pool(4096, 8);

        assert_eq!(pool.alloc_pages(3), Some(0));
        assert_eq!(pool.alloc_pages(2), Some(3));
        let snap = pool.snapshot();
        assert_eq!(snap.free_pages, 3);
        assert_eq!(snap.free_runs, vec![PageRun { first: 5, len: 3 }]);

        let head = pool.page_node(3);
        assert_eq!(pool.slab(head), 2 | PAGE_START);
        assert_eq!(pool.slab(pool.page_node(4)), PAGE_BUSY);
        assert!(pool.next(head).is_null());
    }

    #[test]
    fn test_alloc_whole_run_unlinks_it() {
        let (_heap, mut pool) = heap_pool(4096, 4);
        assert_eq!(pool.alloc_pages(4), Some(0));
        assert!(pool.list_is_empty(pool.free_head()));
        assert_eq!(pool.free_page_count(), 0);
        assert_eq!(pool.alloc_pages(1), None);
    }

    #[test]
    fn test_alloc_too_large_fails() {
        let (_heap, mut pool) = heap_pool(4096, 4);
        assert_eq!(pool.alloc_pages(5), None);
        assert_eq!(pool.free_page_count(), 4);
    }

    #[test]
    fn test_remainder_tail_points_at_new_head() {
        let (_heap, mut pool) = heap_pool(4096, 8);
        pool.alloc_pages(2).unwrap();

        let tail = pool.page_node(7);
        assert_eq!(prev_link(pool.prev(tail)), pool.page_node(2));
        assert_eq!(pool.slab(pool.page_node(2)), 6);
    }

    #[test]
    fn test_coalesce_left_then_right() {
        let (_heap, mut pool) = heap_pool(4096, 8);
        let a = pool.alloc_pages(1).unwrap();
        let b = pool.alloc_pages(1).unwrap();
        let _rest = pool.alloc_pages(6).unwrap();

        pool.free_pages(a, 1);
        pool.free_pages(b, 1);
        assert_eq!(pool.snapshot().free_runs, vec![PageRun { first: 0, len: 2 }]);
    }

    #[test]
    fn test_coalesce_right_then_left() {
        let (_heap, mut pool) = heap_pool(4096, 8);
        let a = pool.alloc_pages(1).unwrap();
        let b = pool.alloc_pages(1).unwrap();
        let _rest = pool.alloc_pages(6).unwrap();

        pool.free_pages(b, 1);
        pool.free_pages(a, 1);
        assert_eq!(pool.snapshot().free_runs, vec![PageRun { first: 0, len: 2 }]);
    }

    #[test]
    fn test_coalesce_both_sides() {
        let (_heap, mut pool) = heap_pool(4096, 8);
        let a = pool.alloc_pages(2).unwrap();
        let b = pool.alloc_pages(3).unwrap();
        let c = pool.alloc_pages(2).unwrap();
        let _last = pool.alloc_pages(1).unwrap();

        pool.free_pages(a, 2);
        pool.free_pages(c, 2);
        assert_eq!(pool.snapshot().free_runs.len(), 2);

        pool.free_pages(b, 3);
        let snap = pool.snapshot();
        assert_eq!(snap.free_runs, vec![PageRun { first: 0, len: 7 }]);
        assert_eq!(snap.free_pages, 7);
    }

    #[test]
    fn test_no_merge_across_allocated_page() {
        let (_heap, mut pool) = heap_pool(4096, 4);
        let a = pool.alloc_pages(1).unwrap();
        let _b = pool.alloc_pages(1).unwrap();
        let c = pool.alloc_pages(1).unwrap();
        let _d = pool.alloc_pages(1).unwrap();

        pool.free_pages(a, 1);
        pool.free_pages(c, 1);
        assert_eq!(
            pool.snapshot().free_runs,
            vec![PageRun { first: 0, len: 1 }, PageRun { first: 2, len: 1 }]
        );
    }

    #[test]
    fn test_reuse_after_full_cycle() {
        let (_heap, mut pool) = heap_pool(1024, 16);
        let mut runs = vec![];
        for n in [1, 2, 3, 4, 5] {
            runs.push((pool.alloc_pages(n).unwrap(), n));
        }
        for &(idx, n) in runs.iter().rev().step_by(2) {
            pool.free_pages(idx, n);
        }
        for &(idx, n) in runs.iter().rev().skip(1).step_by(2) {
            pool.free_pages(idx, n);
        }

        let snap = pool.snapshot();
        assert_eq!(snap.free_runs, vec![PageRun { first: 0, len: 16 }]);
        assert_eq!(pool.alloc_pages(16), Some(0));
    }
}

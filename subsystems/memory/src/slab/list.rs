//! Circular doubly linked lists threaded through page descriptors.
//!
//! Every list has a sentinel descriptor (the free-run head in the pool
//! header, or one slot head per size class). An empty list is a sentinel
//! whose `next` is itself. Links are descriptor offsets; the low bits of
//! `prev` carry the node's [`PageKind`] and are preserved when a neighbour
//! relinks around it.

use super::page::{pack_prev, prev_kind, prev_link, PageKind};
use super::SlabPool;
use crate::region::Offset;

/// Walks a list from its sentinel, visiting each node once.
///
/// Stops after `page_count` nodes so a corrupted list cannot loop forever.
pub(super) struct ListIter<'a> {
    pool: &'a SlabPool,
    head: Offset,
    node: Offset,
    budget: usize,
}

impl Iterator for ListIter<'_> {
    type Item = Offset;

    fn next(&mut self) -> Option<Offset> {
        if self.node == self.head || self.node.is_null() {
            return None;
        }
        if self.budget == 0 {
            log::error!("slab pool: list at {} does not close", self.head);
            return None;
        }
        let node = self.node;
        self.node = self.pool.next(node);
        self.budget -= 1;
        Some(node)
    }
}

impl SlabPool {
    /// Make `head` an empty list.
    pub(super) fn list_init(&self, head: Offset) {
        self.set_slab(head, 0);
        self.set_prev(head, pack_prev(head, PageKind::Page));
        self.set_next(head, head);
    }

    pub(super) fn list_is_empty(&self, head: Offset) -> bool {
        self.next(head) == head
    }

    pub(super) fn list_iter(&self, head: Offset) -> ListIter<'_> {
        ListIter {
            pool: self,
            head,
            node: self.next(head),
            budget: self.page_count(),
        }
    }

    /// Insert `node` right after `head`, tagging it with `kind`.
    pub(super) fn list_push_front(&self, head: Offset, node: Offset, kind: PageKind) {
        let first = self.next(head);
        self.set_next(node, first);
        self.set_prev(node, pack_prev(head, kind));
        self.relink_prev(first, node);
        self.set_next(head, node);
    }

    /// Take `node` out of its list. Its own links are left stale.
    pub(super) fn list_unlink(&self, node: Offset) {
        let prev = prev_link(self.prev(node));
        let next = self.next(node);
        self.set_next(prev, next);
        self.relink_prev(next, prev);
    }

    /// Put `new` where `old` is in its list, tagging it with `kind`.
    pub(super) fn list_replace(&self, old: Offset, new: Offset, kind: PageKind) {
        let prev = prev_link(self.prev(old));
        let next = self.next(old);
        self.set_next(new, next);
        self.set_prev(new, pack_prev(prev, kind));
        self.set_next(prev, new);
        self.relink_prev(next, new);
    }

    /// Unlink a slab page that has no free chunk left.
    pub(super) fn unlink_full(&self, page: Offset, kind: PageKind) {
        self.list_unlink(page);
        self.set_next(page, Offset::NULL);
        self.set_prev(page, pack_prev(Offset::NULL, kind));
    }

    fn relink_prev(&self, node: Offset, prev: Offset) {
        let kind = prev_kind(self.prev(node));
        self.set_prev(node, pack_prev(prev, kind));
    }
}

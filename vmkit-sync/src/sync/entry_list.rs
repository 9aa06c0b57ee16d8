//! Entry queue of threads contending for a monitor.
//!
//! Arriving threads push themselves at the head with a CAS, forming a singly
//! linked LIFO list. Only the monitor owner removes nodes. It lazily walks the
//! list to fill in `prev` links and caches the tail, which turns the list into
//! a doubly linked FIFO from the owner's point of view: the oldest waiter, at
//! the tail, is the one woken on exit.
//!
//! Nodes pushed after the last walk form a singly linked prefix in front of a
//! doubly linked suffix. The walk only needs to cover that prefix.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use super::waiter::{TState, WaiterRef};

pub struct EntryList {
    head: AtomicU64,
    tail: AtomicU64,
    /// Occupancy, kept apart from the links so it can be read without
    /// owning the monitor.
    len: AtomicUsize,
}

impl EntryList {
    pub const fn new() -> Self {
        Self {
            head: AtomicU64::new(0),
            tail: AtomicU64::new(0),
            len: AtomicUsize::new(0),
        }
    }

    #[inline]
    pub fn head(&self) -> Option<WaiterRef> {
        WaiterRef::from_raw(self.head.load(Ordering::Acquire))
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.head.load(Ordering::Acquire) == 0
    }

    fn cached_tail(&self) -> Option<WaiterRef> {
        WaiterRef::from_raw(self.tail.load(Ordering::Relaxed))
    }

    fn set_tail(&self, tail: Option<WaiterRef>) {
        self.tail.store(WaiterRef::to_raw(tail), Ordering::Relaxed);
    }

    /// Push `node` at the head. Safe to call from any thread.
    pub fn push(&self, node: WaiterRef) {
        self.push_or_else(node, || false);
    }

    /// Push `node` at the head, calling `on_interference` after every failed
    /// CAS. If it returns `true` the push is abandoned and `false` is
    /// returned, with the node left off the list.
    pub fn push_or_else(&self, node: WaiterRef, mut on_interference: impl FnMut() -> bool) -> bool {
        let waiter = node.get();
        waiter.set_prev(None);
        waiter.set_tstate(TState::Enter);
        // Counted before it is reachable, so an unlink never drives the
        // count below zero.
        self.len.fetch_add(1, Ordering::Release);

        let mut head = self.head.load(Ordering::Acquire);
        loop {
            waiter.set_next(WaiterRef::from_raw(head));
            match self.head.compare_exchange(
                head,
                WaiterRef::to_raw(Some(node)),
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return true,
                Err(current) => {
                    if on_interference() {
                        self.len.fetch_sub(1, Ordering::Release);
                        waiter.set_tstate(TState::Run);
                        return false;
                    }
                    head = current;
                }
            }
        }
    }

    /// Fill in `prev` links of the singly linked prefix and return the tail.
    /// Owner only; the list must not be empty.
    pub fn tail(&self) -> WaiterRef {
        if let Some(tail) = self.cached_tail() {
            debug_assert!(tail.get().next().is_none(), "cached tail has a successor");
            return tail;
        }
        self.link_prefix()
    }

    fn link_prefix(&self) -> WaiterRef {
        let cached = self.cached_tail();
        let mut prev: Option<WaiterRef> = None;
        let mut cursor = self.head();
        while let Some(current) = cursor {
            let node = current.get();
            debug_assert_eq!(node.tstate(), TState::Enter);
            if let (Some(tail), Some(_), Some(_)) = (cached, prev, node.prev()) {
                // Reached the part that an earlier walk already linked.
                return tail;
            }
            node.set_prev(prev);
            prev = Some(current);
            cursor = node.next();
        }
        let tail = prev.expect("walked an empty entry list");
        self.set_tail(Some(tail));
        tail
    }

    /// Remove `node` after its thread acquired the monitor. Owner only.
    ///
    /// New nodes may be pushed concurrently, so the head can only be changed
    /// with a CAS. Everything else belongs to the owner.
    pub fn unlink(&self, node: WaiterRef) {
        let waiter = node.get();
        debug_assert_eq!(waiter.tstate(), TState::Enter);
        self.len.fetch_sub(1, Ordering::Release);

        if waiter.next().is_none() {
            debug_assert!(self.cached_tail().is_none() || self.cached_tail() == Some(node));
            if self.head() == Some(node)
                && self
                    .head
                    .compare_exchange(
                        WaiterRef::to_raw(Some(node)),
                        0,
                        Ordering::AcqRel,
                        Ordering::Acquire,
                    )
                    .is_ok()
            {
                // It was the only node.
                self.set_tail(None);
                waiter.set_bad_pointers();
                return;
            }
            // The head moved: somebody pushed in front of us.
            if waiter.prev().is_none() {
                self.link_prefix();
            }
            let prev = waiter.prev().expect("last node without predecessor");
            self.set_tail(Some(prev));
            prev.get().set_next(None);
            waiter.set_bad_pointers();
            return;
        }

        if waiter.prev().is_none() {
            if self.head() == Some(node) {
                let next = waiter.next().expect("checked above");
                if self
                    .head
                    .compare_exchange(
                        WaiterRef::to_raw(Some(node)),
                        WaiterRef::to_raw(Some(next)),
                        Ordering::AcqRel,
                        Ordering::Acquire,
                    )
                    .is_ok()
                {
                    next.get().set_prev(None);
                    waiter.set_bad_pointers();
                    return;
                }
            }
            self.link_prefix();
            debug_assert!(waiter.prev().is_some(), "interior node still unlinked");
        }

        let next = waiter.next().expect("interior node without successor");
        let prev = waiter.prev().expect("interior node without predecessor");
        next.get().set_prev(Some(prev));
        prev.get().set_next(Some(next));
        waiter.set_bad_pointers();
    }

    /// Walk from the head. Owner only: the links of a node being unlinked
    /// are poisoned.
    pub fn iter(&self) -> impl Iterator<Item = WaiterRef> + '_ {
        std::iter::successors(self.head(), |w| w.get().next())
    }

    /// Unlocked peek at the number of queued nodes. May count a push that
    /// is still in flight but never walks the links.
    pub fn len(&self) -> usize {
        self.len.load(Ordering::Acquire)
    }
}

impl Default for EntryList {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        sync::waiter::{WaiterNode, WaiterThread},
        threading::Thread,
    };

    fn nodes(n: usize) -> Vec<WaiterNode> {
        let thread = Thread::current();
        (0..n)
            .map(|_| WaiterNode::new(WaiterThread::Platform(thread.clone())))
            .collect()
    }

    fn contents(list: &EntryList) -> Vec<WaiterRef> {
        list.iter().collect()
    }

    #[test]
    fn push_is_lifo_and_tail_is_oldest() {
        let list = EntryList::new();
        let n = nodes(3);
        for node in &n {
            list.push(node.handle());
        }
        assert_eq!(
            contents(&list),
            vec![n[2].handle(), n[1].handle(), n[0].handle()]
        );
        assert_eq!(list.tail(), n[0].handle());
        assert_eq!(n[0].prev(), Some(n[1].handle()));
        assert_eq!(n[1].prev(), Some(n[2].handle()));
        assert_eq!(n[2].prev(), None);
    }

    #[test]
    fn fifo_order_when_always_taking_tail() {
        let list = EntryList::new();
        let n = nodes(4);
        list.push(n[0].handle());
        list.push(n[1].handle());
        let mut order = Vec::new();
        let tail = list.tail();
        list.unlink(tail);
        order.push(tail);
        // Pushed after the walk: a singly linked prefix.
        list.push(n[2].handle());
        list.push(n[3].handle());
        while !list.is_empty() {
            let tail = list.tail();
            list.unlink(tail);
            order.push(tail);
        }
        assert_eq!(order, n.iter().map(|n| n.handle()).collect::<Vec<_>>());
        for node in &n {
            assert!(node.has_bad_pointers());
        }
    }

    #[test]
    fn unlink_sole_node_empties_list() {
        let list = EntryList::new();
        let n = nodes(1);
        list.push(n[0].handle());
        list.unlink(n[0].handle());
        assert!(list.is_empty());
        assert!(n[0].has_bad_pointers());
    }

    #[test]
    fn unlink_head_of_singly_linked_list() {
        let list = EntryList::new();
        let n = nodes(3);
        for node in &n {
            list.push(node.handle());
        }
        list.unlink(n[2].handle());
        assert_eq!(contents(&list), vec![n[1].handle(), n[0].handle()]);
        assert_eq!(list.tail(), n[0].handle());
    }

    #[test]
    fn unlink_interior_of_prefix() {
        let list = EntryList::new();
        let n = nodes(4);
        list.push(n[0].handle());
        list.push(n[1].handle());
        assert_eq!(list.tail(), n[0].handle());
        list.push(n[2].handle());
        list.push(n[3].handle());
        // n[2] sits in the unlinked prefix.
        list.unlink(n[2].handle());
        assert_eq!(
            contents(&list),
            vec![n[3].handle(), n[1].handle(), n[0].handle()]
        );
        assert_eq!(n[1].prev(), Some(n[3].handle()));
        assert_eq!(list.tail(), n[0].handle());
    }

    #[test]
    fn unlink_tail_when_head_moved() {
        let list = EntryList::new();
        let n = nodes(2);
        list.push(n[0].handle());
        list.push(n[1].handle());
        assert_eq!(list.len(), 2);
        list.unlink(n[0].handle());
        assert_eq!(contents(&list), vec![n[1].handle()]);
        assert_eq!(list.len(), 1);
        assert_eq!(list.tail(), n[1].handle());
        list.unlink(n[1].handle());
        assert!(list.is_empty());
    }

    #[test]
    fn concurrent_pushes_are_all_visible() {
        let list = std::sync::Arc::new(EntryList::new());
        let handles = (0..4)
            .map(|_| {
                let list = list.clone();
                std::thread::spawn(move || {
                    let thread = Thread::current();
                    (0..50)
                        .map(|_| {
                            let node = WaiterNode::new(WaiterThread::Platform(thread.clone()));
                            list.push(node.handle());
                            node.into_handle()
                        })
                        .collect::<Vec<_>>()
                })
            })
            .collect::<Vec<_>>();
        let pushed: Vec<WaiterRef> = handles
            .into_iter()
            .flat_map(|h| h.join().unwrap())
            .collect();
        assert_eq!(list.len(), 200);
        while !list.is_empty() {
            let tail = list.tail();
            list.unlink(tail);
        }
        assert_eq!(list.len(), 0);
        for handle in pushed {
            drop(WaiterNode::from_handle(handle));
        }
    }
}

//! Threads parked in `wait()`, as a circular doubly linked list in arrival
//! order. All mutation happens under a [`SpinMutex`]; the occupancy counter
//! allows an unlocked emptiness check.

use std::sync::atomic::{AtomicUsize, Ordering};

use super::{
    spin_lock::{SpinMutex, SpinMutexGuard},
    waiter::{TState, WaiterRef},
};

#[derive(Default)]
pub struct WaitQueue {
    head: Option<WaiterRef>,
}

pub struct WaitSet {
    queue: SpinMutex<WaitQueue>,
    len: AtomicUsize,
}

pub struct WaitSetGuard<'a> {
    queue: SpinMutexGuard<'a, WaitQueue>,
    len: &'a AtomicUsize,
}

impl WaitSet {
    pub fn new() -> Self {
        Self {
            queue: SpinMutex::new(WaitQueue::default()),
            len: AtomicUsize::new(0),
        }
    }

    pub fn lock(&self) -> WaitSetGuard<'_> {
        WaitSetGuard {
            queue: self.queue.lock(),
            len: &self.len,
        }
    }

    /// Unlocked peek. Only a hint unless the caller holds the monitor and
    /// knows no waiter can be added concurrently.
    pub fn is_empty(&self) -> bool {
        self.len.load(Ordering::Acquire) == 0
    }

    pub fn len(&self) -> usize {
        self.len.load(Ordering::Acquire)
    }
}

impl Default for WaitSet {
    fn default() -> Self {
        Self::new()
    }
}

impl WaitSetGuard<'_> {
    pub fn first(&self) -> Option<WaiterRef> {
        self.queue.head
    }

    /// Append `node` at the end of the circle.
    pub fn add(&mut self, node: WaiterRef) {
        let waiter = node.get();
        debug_assert_eq!(waiter.tstate(), TState::Wait);
        match self.queue.head {
            None => {
                waiter.set_next(Some(node));
                waiter.set_prev(Some(node));
                self.queue.head = Some(node);
            }
            Some(head) => {
                let head_waiter = head.get();
                let tail = head_waiter.prev().expect("circular list");
                let tail_waiter = tail.get();
                debug_assert_eq!(tail_waiter.next(), Some(head));
                tail_waiter.set_next(Some(node));
                head_waiter.set_prev(Some(node));
                waiter.set_next(Some(head));
                waiter.set_prev(Some(tail));
            }
        }
        self.len.fetch_add(1, Ordering::Release);
    }

    /// Remove and return the longest-waiting node.
    pub fn dequeue(&mut self) -> Option<WaiterRef> {
        let head = self.queue.head?;
        self.dequeue_specific(head);
        Some(head)
    }

    /// Remove `node`, which must be on this wait set.
    pub fn dequeue_specific(&mut self, node: WaiterRef) {
        let waiter = node.get();
        let next = waiter.next().expect("circular list");
        if next == node {
            debug_assert_eq!(waiter.prev(), Some(node));
            self.queue.head = None;
        } else {
            let prev = waiter.prev().expect("circular list");
            debug_assert_ne!(prev, node);
            next.get().set_prev(Some(prev));
            prev.get().set_next(Some(next));
            if self.queue.head == Some(node) {
                self.queue.head = Some(next);
            }
        }
        waiter.set_next(None);
        waiter.set_prev(None);
        self.len.fetch_sub(1, Ordering::Release);
    }

    pub fn iter(&self) -> impl Iterator<Item = WaiterRef> + '_ {
        let head = self.queue.head;
        std::iter::successors(head, move |w| w.get().next().filter(|n| Some(*n) != head))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        sync::waiter::{WaiterNode, WaiterThread},
        threading::Thread,
    };

    fn waiting_nodes(n: usize) -> Vec<WaiterNode> {
        let thread = Thread::current();
        (0..n)
            .map(|_| {
                let node = WaiterNode::new(WaiterThread::Platform(thread.clone()));
                node.set_tstate(TState::Wait);
                node
            })
            .collect()
    }

    fn release(nodes: Vec<WaiterNode>) {
        for node in nodes {
            node.set_tstate(TState::Run);
        }
    }

    #[test]
    fn dequeue_is_fifo() {
        let set = WaitSet::new();
        let n = waiting_nodes(3);
        {
            let mut guard = set.lock();
            for node in &n {
                guard.add(node.handle());
            }
            assert_eq!(guard.iter().count(), 3);
        }
        assert_eq!(set.len(), 3);
        let mut guard = set.lock();
        assert_eq!(guard.dequeue(), Some(n[0].handle()));
        assert_eq!(guard.dequeue(), Some(n[1].handle()));
        assert_eq!(guard.dequeue(), Some(n[2].handle()));
        assert_eq!(guard.dequeue(), None);
        drop(guard);
        assert!(set.is_empty());
        release(n);
    }

    #[test]
    fn dequeue_specific_keeps_circle_intact() {
        let set = WaitSet::new();
        let n = waiting_nodes(4);
        let mut guard = set.lock();
        for node in &n {
            guard.add(node.handle());
        }
        guard.dequeue_specific(n[2].handle());
        guard.dequeue_specific(n[0].handle());
        assert_eq!(
            guard.iter().collect::<Vec<_>>(),
            vec![n[1].handle(), n[3].handle()]
        );
        assert_eq!(n[1].prev(), Some(n[3].handle()));
        assert_eq!(n[3].next(), Some(n[1].handle()));
        guard.dequeue_specific(n[3].handle());
        guard.dequeue_specific(n[1].handle());
        assert_eq!(guard.first(), None);
        drop(guard);
        assert!(set.is_empty());
        release(n);
    }

    #[test]
    fn single_node_points_to_itself() {
        let set = WaitSet::new();
        let n = waiting_nodes(1);
        let mut guard = set.lock();
        guard.add(n[0].handle());
        assert_eq!(n[0].next(), Some(n[0].handle()));
        assert_eq!(n[0].prev(), Some(n[0].handle()));
        assert_eq!(guard.dequeue(), Some(n[0].handle()));
        drop(guard);
        release(n);
    }
}

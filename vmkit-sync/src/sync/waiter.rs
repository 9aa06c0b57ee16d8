//! Waiter nodes shared by the entry queue and the wait set.
//!
//! A node lives in a global arena and is addressed by a [`WaiterRef`]: an index
//! plus the generation of the slot at allocation time. Links between nodes are
//! raw handles stored in atomics, which keeps the lock-free entry queue
//! expressible without raw pointers. Using a handle after its node was freed
//! is caught by the generation check.

use std::{
    num::NonZeroU64,
    sync::{
        atomic::{AtomicBool, AtomicI64, AtomicIsize, AtomicU32, AtomicU64, Ordering},
        Arc, LazyLock,
    },
};

use atomic::Atomic;
use parking_lot::Mutex;

use crate::{
    sync::owner::{OwnerId, NO_OWNER},
    threading::{vthread::VirtualThread, Thread},
};

/// Where a waiter node currently sits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum TState {
    /// On no list.
    #[default]
    Run,
    /// On the entry queue.
    Enter,
    /// On the wait set.
    Wait,
}

unsafe impl bytemuck::NoUninit for TState {}

const NULL_LINK: u64 = 0;
/// Written into the links of a node that left the entry queue.
const BAD_LINK: u64 = u64::MAX;

#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct WaiterRef(NonZeroU64);

impl WaiterRef {
    fn new(index: u32, generation: u32) -> Self {
        let raw = ((generation as u64) << 32) | (index as u64 + 1);
        Self(NonZeroU64::new(raw).expect("index + 1 is never zero"))
    }

    fn index(self) -> usize {
        ((self.0.get() & u32::MAX as u64) - 1) as usize
    }

    fn generation(self) -> u32 {
        (self.0.get() >> 32) as u32
    }

    #[inline]
    pub(crate) fn to_raw(this: Option<Self>) -> u64 {
        this.map_or(NULL_LINK, |w| w.0.get())
    }

    #[inline]
    pub(crate) fn from_raw(raw: u64) -> Option<Self> {
        assert_ne!(raw, BAD_LINK, "followed a link of an unlinked waiter");
        NonZeroU64::new(raw).map(Self)
    }

    /// Resolve the handle. Panics if the node was freed.
    #[inline]
    pub fn get(self) -> &'static ObjectWaiter {
        WaiterArena::global().get(self)
    }
}

impl std::fmt::Debug for WaiterRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Waiter#{}@{}", self.index(), self.generation())
    }
}

#[derive(Clone)]
pub enum WaiterThread {
    Platform(Arc<Thread>),
    Virtual(Arc<VirtualThread>),
}

impl WaiterThread {
    pub fn owner_id(&self) -> OwnerId {
        match self {
            WaiterThread::Platform(thread) => thread.owner_id(),
            WaiterThread::Virtual(vthread) => vthread.id(),
        }
    }

    pub fn is_virtual(&self) -> bool {
        matches!(self, WaiterThread::Virtual(_))
    }
}

pub struct ObjectWaiter {
    generation: AtomicU32,
    next: AtomicU64,
    prev: AtomicU64,
    tstate: Atomic<TState>,
    notified: AtomicBool,
    notifier_tid: AtomicI64,
    recursions: AtomicIsize,
    is_wait: AtomicBool,
    at_reenter: AtomicBool,
    interrupted: AtomicBool,
    active: AtomicBool,
    thread: Mutex<Option<WaiterThread>>,
}

impl ObjectWaiter {
    fn empty() -> Self {
        Self {
            generation: AtomicU32::new(0),
            next: AtomicU64::new(NULL_LINK),
            prev: AtomicU64::new(NULL_LINK),
            tstate: Atomic::new(TState::Run),
            notified: AtomicBool::new(false),
            notifier_tid: AtomicI64::new(NO_OWNER),
            recursions: AtomicIsize::new(0),
            is_wait: AtomicBool::new(false),
            at_reenter: AtomicBool::new(false),
            interrupted: AtomicBool::new(false),
            active: AtomicBool::new(false),
            thread: Mutex::new(None),
        }
    }

    fn reset(&self, thread: WaiterThread) {
        self.next.store(NULL_LINK, Ordering::Relaxed);
        self.prev.store(NULL_LINK, Ordering::Relaxed);
        self.tstate.store(TState::Run, atomic::Ordering::Relaxed);
        self.notified.store(false, Ordering::Relaxed);
        self.notifier_tid.store(NO_OWNER, Ordering::Relaxed);
        self.recursions.store(0, Ordering::Relaxed);
        self.is_wait.store(false, Ordering::Relaxed);
        self.at_reenter.store(false, Ordering::Relaxed);
        self.interrupted.store(false, Ordering::Relaxed);
        self.active.store(false, Ordering::Relaxed);
        *self.thread.lock() = Some(thread);
    }

    #[inline]
    pub fn next(&self) -> Option<WaiterRef> {
        WaiterRef::from_raw(self.next.load(Ordering::Acquire))
    }

    #[inline]
    pub fn set_next(&self, next: Option<WaiterRef>) {
        self.next.store(WaiterRef::to_raw(next), Ordering::Release);
    }

    #[inline]
    pub fn prev(&self) -> Option<WaiterRef> {
        WaiterRef::from_raw(self.prev.load(Ordering::Acquire))
    }

    #[inline]
    pub fn set_prev(&self, prev: Option<WaiterRef>) {
        self.prev.store(WaiterRef::to_raw(prev), Ordering::Release);
    }

    /// Poison both links. The node must not be reached through a list again.
    pub fn set_bad_pointers(&self) {
        self.next.store(BAD_LINK, Ordering::Relaxed);
        self.prev.store(BAD_LINK, Ordering::Relaxed);
    }

    pub fn has_bad_pointers(&self) -> bool {
        self.next.load(Ordering::Relaxed) == BAD_LINK
    }

    #[inline]
    pub fn tstate(&self) -> TState {
        self.tstate.load(atomic::Ordering::Acquire)
    }

    #[inline]
    pub fn set_tstate(&self, state: TState) {
        self.tstate.store(state, atomic::Ordering::Release);
    }

    pub fn notified(&self) -> bool {
        self.notified.load(Ordering::Acquire)
    }

    pub fn set_notified(&self, notifier: OwnerId) {
        self.notifier_tid.store(notifier, Ordering::Relaxed);
        self.notified.store(true, Ordering::Release);
    }

    pub fn notifier_tid(&self) -> OwnerId {
        self.notifier_tid.load(Ordering::Relaxed)
    }

    pub fn recursions(&self) -> isize {
        self.recursions.load(Ordering::Relaxed)
    }

    pub fn set_recursions(&self, recursions: isize) {
        self.recursions.store(recursions, Ordering::Relaxed);
    }

    pub fn is_wait(&self) -> bool {
        self.is_wait.load(Ordering::Relaxed)
    }

    pub fn set_is_wait(&self, value: bool) {
        self.is_wait.store(value, Ordering::Relaxed);
    }

    pub fn at_reenter(&self) -> bool {
        self.at_reenter.load(Ordering::Relaxed)
    }

    pub fn set_at_reenter(&self, value: bool) {
        self.at_reenter.store(value, Ordering::Relaxed);
    }

    pub fn interrupted(&self) -> bool {
        self.interrupted.load(Ordering::Relaxed)
    }

    pub fn set_interrupted(&self, value: bool) {
        self.interrupted.store(value, Ordering::Relaxed);
    }

    /// True between `wait_reenter_begin` and `wait_reenter_end`, while a
    /// notified platform thread is accounted as blocked on entry.
    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Relaxed)
    }

    pub fn set_active(&self, value: bool) {
        self.active.store(value, Ordering::Relaxed);
    }

    pub fn thread(&self) -> WaiterThread {
        self.thread
            .lock()
            .clone()
            .expect("waiter node without a thread")
    }

    pub fn owner_id(&self) -> OwnerId {
        self.thread().owner_id()
    }

    pub fn is_virtual(&self) -> bool {
        self.thread().is_virtual()
    }
}

/// Global slab of waiter nodes. Slots are recycled through a free list and
/// never deallocated, so a `&'static ObjectWaiter` stays dereferenceable
/// even after its node is freed.
pub struct WaiterArena {
    slots: boxcar::Vec<ObjectWaiter>,
    free: Mutex<Vec<u32>>,
}

static ARENA: LazyLock<WaiterArena> = LazyLock::new(|| WaiterArena {
    slots: boxcar::Vec::new(),
    free: Mutex::new(Vec::new()),
});

impl WaiterArena {
    pub fn global() -> &'static WaiterArena {
        &ARENA
    }

    pub fn allocate(&'static self, thread: WaiterThread) -> WaiterRef {
        let index = match self.free.lock().pop() {
            Some(index) => index,
            None => {
                let index = self.slots.push(ObjectWaiter::empty());
                u32::try_from(index)
                    .ok()
                    .filter(|&i| i < u32::MAX - 1)
                    .expect("waiter arena exhausted")
            }
        };
        let slot = &self.slots[index as usize];
        slot.reset(thread);
        WaiterRef::new(index, slot.generation.load(Ordering::Acquire))
    }

    pub fn release(&'static self, waiter: WaiterRef) {
        let slot = self.get(waiter);
        slot.thread.lock().take();
        slot.set_tstate(TState::Run);
        slot.generation.fetch_add(1, Ordering::AcqRel);
        self.free.lock().push(waiter.index() as u32);
    }

    pub fn get(&'static self, waiter: WaiterRef) -> &'static ObjectWaiter {
        let slot = self
            .slots
            .get(waiter.index())
            .expect("waiter handle outside of the arena");
        assert_eq!(
            slot.generation.load(Ordering::Acquire),
            waiter.generation(),
            "stale waiter handle {waiter:?}"
        );
        slot
    }
}

/// Owning handle of a waiter node. The node is returned to the arena on drop,
/// so it must be off every list by then.
pub struct WaiterNode {
    handle: WaiterRef,
}

impl WaiterNode {
    pub fn new(thread: WaiterThread) -> Self {
        Self {
            handle: WaiterArena::global().allocate(thread),
        }
    }

    /// Take ownership of a node that was handed around as a plain handle.
    pub fn from_handle(handle: WaiterRef) -> Self {
        Self { handle }
    }

    pub fn handle(&self) -> WaiterRef {
        self.handle
    }

    /// Give up ownership without freeing the node.
    pub fn into_handle(self) -> WaiterRef {
        let handle = self.handle;
        std::mem::forget(self);
        handle
    }
}

impl std::ops::Deref for WaiterNode {
    type Target = ObjectWaiter;

    fn deref(&self) -> &ObjectWaiter {
        self.handle.get()
    }
}

impl Drop for WaiterNode {
    fn drop(&mut self) {
        debug_assert_ne!(self.tstate(), TState::Wait, "freeing a node on the wait set");
        WaiterArena::global().release(self.handle);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node() -> WaiterNode {
        WaiterNode::new(WaiterThread::Platform(Thread::current()))
    }

    #[test]
    fn handle_encoding_roundtrips_links() {
        let a = node();
        let b = node();
        a.set_next(Some(b.handle()));
        assert_eq!(a.next(), Some(b.handle()));
        assert_eq!(b.prev(), None);
        assert_eq!(WaiterRef::from_raw(WaiterRef::to_raw(None)), None);
    }

    #[test]
    fn recycled_slot_gets_new_generation() {
        let first = node();
        let handle = first.handle();
        drop(first);
        let second = node();
        if second.handle().index() == handle.index() {
            assert_ne!(second.handle().generation(), handle.generation());
        }
        let stale = std::panic::catch_unwind(|| handle.get());
        assert!(stale.is_err());
    }

    #[test]
    #[should_panic(expected = "unlinked waiter")]
    fn poisoned_links_panic() {
        let a = node();
        a.set_bad_pointers();
        let _ = a.next();
    }

    #[test]
    fn fresh_node_state() {
        let a = node();
        assert_eq!(a.tstate(), TState::Run);
        assert!(!a.notified());
        assert!(!a.is_virtual());
        assert_eq!(a.owner_id(), Thread::current().owner_id());
    }
}

//! Inflated object monitor.
//!
//! An [`ObjectMonitor`] provides mutual exclusion with recursion plus
//! `wait`/`notify` for one managed object. Its state is spread over a few
//! words that are read and written without a lock:
//!
//! * `owner`: [`NO_OWNER`], [`DEFLATER_MARKER`] or the owning thread's id.
//! * `recursions`: extra entries of the owner beyond the first.
//! * `entry_list`: threads blocked trying to enter (see [`EntryList`]).
//! * `succ`: the "heir presumptive", a thread that was woken or is spinning and
//!   will retry the lock soon. An exiting owner does not wake anyone else
//!   while a successor exists, which throttles futile wakeups.
//! * `contentions`: threads inside the contended enter path. Negative means
//!   the monitor was deflated.
//! * `wait_set` / `waiters`: threads in `wait()`.
//!
//! Any state transition must leave at least one thread responsible for
//! making progress: an exiting owner either hands off to a successor, or a
//! successor/spinner exists that will retry the lock.

use std::{
    any::Any,
    fmt,
    sync::{
        atomic::{fence, AtomicI32, AtomicI64, AtomicIsize, Ordering},
        Arc, Weak,
    },
    time::Duration,
};

use crate::{
    options::SpinKnobs,
    sync::{
        counters::{MonitorCounters, MonitorStats, MonitorStatsSnapshot},
        entry_list::EntryList,
        owner::{Owner, OwnerCell, OwnerId, DEFLATER_MARKER, NO_OWNER},
        spin::SpinController,
        wait_set::WaitSet,
        waiter::{TState, WaiterNode, WaiterRef, WaiterThread},
    },
    threading::{vthread::Unparker, Thread, ThreadStatus},
};

mod deflation;
mod vthread;
mod wait;

pub use vthread::ResumeResult;
pub use wait::WaitResult;

/// Managed object a monitor is associated with.
pub type ObjectRef = Arc<dyn Any + Send + Sync>;
pub type WeakObjectRef = Weak<dyn Any + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TryLockResult {
    /// The deflater got in the way, or the owner changed under us.
    Interference,
    HasOwner,
    Success,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[must_use]
pub enum EnterResult {
    Entered,
    /// The monitor was deflated; look the object's monitor up again.
    Deflated,
    /// The mounted virtual thread was queued and must be unmounted. The enter
    /// completes when it is resumed.
    Preempted,
}

impl EnterResult {
    pub fn is_entered(self) -> bool {
        self == EnterResult::Entered
    }
}

/// Keeps `contentions` raised while a thread is in the contended enter path,
/// which prevents the deflater from finishing.
pub(crate) struct ContentionMark<'a> {
    monitor: &'a ObjectMonitor,
    extended: bool,
}

impl<'a> ContentionMark<'a> {
    pub(crate) fn new(monitor: &'a ObjectMonitor) -> Self {
        monitor.add_to_contentions(1);
        Self {
            monitor,
            extended: false,
        }
    }

    /// Add a second increment that outlives the mark. The deflater removes it
    /// once it notices that its deflation attempt was cancelled.
    pub(crate) fn extend(&mut self) {
        assert!(!self.extended, "contention mark extended twice");
        self.monitor.add_to_contentions(1);
        self.extended = true;
    }
}

impl Drop for ContentionMark<'_> {
    fn drop(&mut self) {
        self.monitor.add_to_contentions(-1);
    }
}

/// Longest timed park of a pinned virtual thread blocked in enter.
const MAX_RECHECK_INTERVAL_MS: u64 = 1000;

pub struct ObjectMonitor {
    this: Weak<ObjectMonitor>,
    object: WeakObjectRef,
    pub(crate) owner: OwnerCell,
    previous_owner_tid: AtomicI64,
    recursions: AtomicIsize,
    entry_list: EntryList,
    succ: AtomicI64,
    pub(crate) spin: SpinController,
    contentions: AtomicI32,
    wait_set: WaitSet,
    waiters: AtomicI32,
    pub(crate) stats: MonitorStats,
}

impl ObjectMonitor {
    pub fn new(object: &ObjectRef, knobs: SpinKnobs) -> Arc<Self> {
        MonitorCounters::global()
            .extant
            .fetch_add(1, Ordering::Relaxed);
        Arc::new_cyclic(|this| Self {
            this: this.clone(),
            object: Arc::downgrade(object),
            owner: OwnerCell::new(),
            previous_owner_tid: AtomicI64::new(NO_OWNER),
            recursions: AtomicIsize::new(0),
            entry_list: EntryList::new(),
            succ: AtomicI64::new(NO_OWNER),
            spin: SpinController::new(knobs),
            contentions: AtomicI32::new(0),
            wait_set: WaitSet::new(),
            waiters: AtomicI32::new(0),
            stats: MonitorStats::default(),
        })
    }

    pub(crate) fn weak(&self) -> Weak<ObjectMonitor> {
        self.this.clone()
    }

    pub(crate) fn strong(&self) -> Arc<ObjectMonitor> {
        self.this
            .upgrade()
            .expect("monitor method called on a monitor being destroyed")
    }

    /// The associated object, unless it has been dropped.
    pub fn object(&self) -> Option<ObjectRef> {
        self.object.upgrade()
    }

    pub fn is_object_dead(&self) -> bool {
        self.object.strong_count() == 0
    }

    pub(crate) fn refers_to(&self, object: &ObjectRef) -> bool {
        self.object
            .upgrade()
            .is_some_and(|o| Arc::ptr_eq(&o, object))
    }

    pub fn owner(&self) -> Owner {
        self.owner.get()
    }

    #[inline]
    pub fn has_owner(&self, current: &Thread) -> bool {
        self.owner.raw() == current.owner_id()
    }

    /// Does `current` hold the monitor?
    pub fn is_entered(&self, current: &Thread) -> bool {
        self.has_owner(current)
    }

    pub fn recursions(&self) -> isize {
        self.recursions.load(Ordering::Relaxed)
    }

    fn set_recursions(&self, value: isize) {
        self.recursions.store(value, Ordering::Relaxed);
    }

    pub fn waiters(&self) -> i32 {
        self.waiters.load(Ordering::Relaxed)
    }

    fn add_to_waiters(&self, delta: i32) {
        self.waiters.fetch_add(delta, Ordering::Relaxed);
    }

    pub fn contentions(&self) -> i32 {
        self.contentions.load(Ordering::SeqCst)
    }

    pub(crate) fn add_to_contentions(&self, delta: i32) {
        self.contentions.fetch_add(delta, Ordering::SeqCst);
    }

    pub fn previous_owner_tid(&self) -> OwnerId {
        self.previous_owner_tid.load(Ordering::Relaxed)
    }

    pub fn successor(&self) -> Option<OwnerId> {
        match self.succ.load(Ordering::Relaxed) {
            NO_OWNER => None,
            id => Some(id),
        }
    }

    #[inline]
    pub(crate) fn has_successor(&self) -> bool {
        self.succ.load(Ordering::Relaxed) != NO_OWNER
    }

    #[inline]
    pub(crate) fn has_successor_of(&self, current: &Thread) -> bool {
        self.succ.load(Ordering::Relaxed) == current.owner_id()
    }

    #[inline]
    pub(crate) fn set_successor(&self, id: OwnerId) {
        self.succ.store(id, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn clear_successor(&self) {
        self.succ.store(NO_OWNER, Ordering::Relaxed);
    }

    pub fn entry_list_len(&self) -> usize {
        self.entry_list.len()
    }

    pub fn wait_set_len(&self) -> usize {
        self.wait_set.len()
    }

    pub fn stats(&self) -> MonitorStatsSnapshot {
        self.stats.snapshot()
    }

    pub fn spin_duration(&self) -> i32 {
        self.spin.duration()
    }

    /// A deflated monitor keeps `contentions` negative forever.
    pub fn is_being_async_deflated(&self) -> bool {
        self.contentions() < 0
    }

    /// Is anybody using the monitor? A monitor that is not busy may be
    /// deflated.
    pub fn is_busy(&self) -> bool {
        if self.waiters() != 0 || !self.entry_list.is_empty() {
            return true;
        }
        if self.contentions() > 0 {
            return true;
        }
        let owner = self.owner.raw();
        owner != DEFLATER_MARKER && owner != NO_OWNER
    }

    fn enter_is_async_deflating(&self) -> bool {
        self.is_being_async_deflated()
    }

    /// One attempt at taking an unowned monitor, cancelling an in-progress
    /// deflation if we find one.
    pub(crate) fn try_lock(&self, current: &Thread) -> TryLockResult {
        let mut own = self.owner.raw();
        let first_own = own;
        loop {
            if own == DEFLATER_MARKER {
                let mut mark = ContentionMark::new(self);
                if self.enter_is_async_deflating() {
                    return TryLockResult::Interference;
                }
                if self.try_lock_with_contention_mark(current, &mut mark) {
                    debug_assert_eq!(self.recursions(), 0);
                    return TryLockResult::Success;
                }
                // Deflation won or the owner changed. Do not spin.
                break;
            } else if own == NO_OWNER {
                let prev = self.owner.try_set_from(NO_OWNER, current.owner_id());
                if prev == NO_OWNER {
                    debug_assert_eq!(self.recursions(), 0);
                    return TryLockResult::Success;
                }
                // Free for a moment but we lost the race.
                own = prev;
            } else {
                break;
            }
        }
        if first_own == own {
            TryLockResult::HasOwner
        } else {
            TryLockResult::Interference
        }
    }

    /// Take the monitor while `mark` keeps the deflater from completing.
    pub(crate) fn try_lock_with_contention_mark(
        &self,
        current: &Thread,
        mark: &mut ContentionMark<'_>,
    ) -> bool {
        debug_assert!(std::ptr::eq(mark.monitor, self));
        let me = current.owner_id();
        let mut prev = self.owner.try_set_from(NO_OWNER, me);
        let success = if prev == NO_OWNER {
            true
        } else if prev == me {
            self.recursions.fetch_add(1, Ordering::Relaxed);
            true
        } else if prev == DEFLATER_MARKER {
            prev = self.owner.try_set_from(DEFLATER_MARKER, me);
            if prev == DEFLATER_MARKER {
                // Cancelled the deflation. The extra contention stops the
                // deflater from winning the second phase; it removes the
                // increment itself once it sees the cancellation.
                mark.extend();
                log::trace!("{me} cancelled deflation of {:p}", self);
                true
            } else if prev == NO_OWNER {
                // The deflater restored NO_OWNER. Only a regular
                // thread can beat us now.
                self.owner.try_set_from(NO_OWNER, me) == NO_OWNER
            } else {
                false
            }
        } else {
            false
        };
        debug_assert!(!success || self.has_owner(current));
        success
    }

    /// Acquire without blocking. Handles recursion when `check_recursion`.
    pub fn try_enter(&self, current: &Thread, check_recursion: bool) -> bool {
        let r = self.try_lock(current);
        if r == TryLockResult::Success {
            debug_assert_eq!(self.recursions(), 0);
            return true;
        }
        if !check_recursion {
            return false;
        }
        if r == TryLockResult::HasOwner && self.has_owner(current) {
            self.recursions.fetch_add(1, Ordering::Relaxed);
            return true;
        }
        false
    }

    fn spin_enter(&self, current: &Thread) -> bool {
        if self.try_enter(current, true) {
            return true;
        }
        if self.enter_is_async_deflating() {
            return false;
        }
        if self.try_spin(current) {
            debug_assert!(self.has_owner(current));
            debug_assert_eq!(self.recursions(), 0);
            return true;
        }
        false
    }

    /// Acquire the monitor, blocking while it is owned by another thread.
    ///
    /// A mounted, unpinned virtual thread is not blocked: it is queued and
    /// [`EnterResult::Preempted`] is returned. Its carrier must unmount it.
    pub fn enter(&self, current: &Arc<Thread>) -> EnterResult {
        self.enter_impl(current, true)
    }

    /// Like [`enter`](Self::enter), but never preempts a mounted virtual
    /// thread; the carrier blocks instead.
    pub fn enter_no_preempt(&self, current: &Arc<Thread>) -> EnterResult {
        self.enter_impl(current, false)
    }

    fn enter_impl(&self, current: &Arc<Thread>, allow_preempt: bool) -> EnterResult {
        if self.spin_enter(current) {
            return EnterResult::Entered;
        }
        debug_assert!(!self.has_owner(current));
        debug_assert!(!self.has_successor_of(current));

        let mut mark = ContentionMark::new(self);
        if self.enter_is_async_deflating() {
            return EnterResult::Deflated;
        }
        self.enter_with_contention_mark(current, &mut mark, allow_preempt)
    }

    pub(crate) fn enter_with_contention_mark(
        &self,
        current: &Arc<Thread>,
        _mark: &mut ContentionMark<'_>,
        allow_preempt: bool,
    ) -> EnterResult {
        MonitorCounters::bump(&MonitorCounters::global().contended_lock_attempts);
        self.stats
            .contended_enters
            .fetch_add(1, Ordering::Relaxed);

        if allow_preempt {
            if let Some(vthread) = current.mounted_vthread() {
                current.set_current_pending_monitor(Some(self.weak()));
                if vthread.try_preempt() {
                    let acquired = self.vthread_monitor_enter(current, &vthread, None);
                    current.set_current_pending_monitor(None);
                    if acquired {
                        vthread.cancel_preemption();
                        return EnterResult::Entered;
                    }
                    return EnterResult::Preempted;
                }
                current.set_current_pending_monitor(None);
            }
        }

        let saved_status = current.status();
        current.set_status(ThreadStatus::BlockedOnMonitorEnter);
        current.set_current_pending_monitor(Some(self.weak()));
        loop {
            let mut exited = false;
            current.block_in_vm(
                || {
                    self.enter_internal(current);
                    current.set_current_pending_monitor(None);
                },
                |t| {
                    if t.is_suspended() {
                        // Do not sit on the monitor while suspended.
                        self.set_recursions(0);
                        self.clear_successor();
                        self.exit(t, false);
                        exited = true;
                        t.set_current_pending_monitor(Some(self.weak()));
                    }
                },
            );
            if !exited {
                debug_assert!(self.has_owner(current));
                break;
            }
        }
        current.set_status(saved_status);

        debug_assert!(self.contentions() >= 0);
        debug_assert_eq!(self.recursions(), 0);
        debug_assert!(!self.has_successor_of(current));
        EnterResult::Entered
    }

    /// Queue on the entry list and park until the monitor is acquired.
    /// Runs in the parked thread state.
    fn enter_internal(&self, current: &Arc<Thread>) {
        if self.try_lock(current) == TryLockResult::Success {
            return;
        }
        if self.try_spin(current) {
            return;
        }

        let node = WaiterNode::new(WaiterThread::Platform(current.clone()));
        current.park_event().reset();
        if self.try_lock_or_add_to_entry_list(current, node.handle()) {
            return;
        }

        // The owner may have exited while we were queueing: the CAS that
        // published the node orders it before the re-check of the owner.
        //
        // Pinned virtual threads park with a timeout. The successor may be an
        // unmounted virtual thread that cannot run until a carrier frees up.
        let timed_park = current.mounted_vthread().is_some();
        let mut recheck_interval = 1u64;

        loop {
            if self.try_lock(current) == TryLockResult::Success {
                break;
            }
            debug_assert!(!self.has_owner(current));

            MonitorCounters::bump(&MonitorCounters::global().parks);
            if timed_park {
                current
                    .park_event()
                    .park_for(Duration::from_millis(recheck_interval));
                recheck_interval = (recheck_interval * 8).min(MAX_RECHECK_INTERVAL_MS);
            } else {
                current.park_event().park();
            }

            if self.try_lock(current) == TryLockResult::Success {
                break;
            }

            // Normally we were woken as successor. try_spin tolerates that.
            if self.try_spin(current) {
                break;
            }

            if self.has_successor_of(current) {
                self.clear_successor();
            }
            // After clearing the successor we must re-check the owner before parking.
            fence(Ordering::SeqCst);

            MonitorCounters::bump(&MonitorCounters::global().futile_wakeups);
            self.stats.futile_wakeups.fetch_add(1, Ordering::Relaxed);
        }

        self.unlink_after_acquire(current, node.handle());
        if self.has_successor_of(current) {
            self.clear_successor();
        }
    }

    /// Re-acquire after `wait()` for a thread that a notifier already moved
    /// to the entry list.
    fn reenter_internal(&self, current: &Arc<Thread>, node: WaiterRef) {
        debug_assert!(self.waiters() > 0);
        loop {
            assert_eq!(node.get().tstate(), TState::Enter, "notified waiter off the entry list");
            debug_assert!(!self.has_owner(current));

            if self.try_lock(current) == TryLockResult::Success {
                break;
            }
            if self.try_spin(current) {
                break;
            }

            MonitorCounters::bump(&MonitorCounters::global().parks);
            current.block_in_vm(
                || current.park_event().park(),
                |t| self.clear_successor_on_suspend(t),
            );

            if self.try_lock(current) == TryLockResult::Success {
                break;
            }
            if self.has_successor_of(current) {
                self.clear_successor();
            }
            fence(Ordering::SeqCst);
            MonitorCounters::bump(&MonitorCounters::global().futile_wakeups);
            self.stats.futile_wakeups.fetch_add(1, Ordering::Relaxed);
        }

        debug_assert!(self.has_owner(current));
        self.unlink_after_acquire(current, node);
        if self.has_successor_of(current) {
            self.clear_successor();
        }
        fence(Ordering::SeqCst);
    }

    fn clear_successor_on_suspend(&self, current: &Thread) {
        if current.is_suspended() && self.has_successor_of(current) {
            self.clear_successor();
            fence(Ordering::SeqCst);
        }
    }

    /// Push `node` on the entry list, retrying the lock whenever the push
    /// CAS fails. Returns `true` if the lock was taken instead.
    pub(crate) fn try_lock_or_add_to_entry_list(&self, current: &Thread, node: WaiterRef) -> bool {
        let mut acquired = false;
        self.entry_list.push_or_else(node, || {
            acquired = self.try_lock(current) == TryLockResult::Success;
            acquired
        });
        debug_assert!(!acquired || self.has_owner(current));
        acquired
    }

    /// Unconditional push, used by notify to move a waiter.
    pub(crate) fn add_to_entry_list(&self, node: WaiterRef) {
        self.entry_list.push(node);
    }

    pub(crate) fn entry_list_tail(&self, current: &Thread) -> WaiterRef {
        debug_assert!(self.has_owner(current));
        self.entry_list.tail()
    }

    pub(crate) fn unlink_after_acquire(&self, current: &Thread, node: WaiterRef) {
        debug_assert!(self.has_owner(current));
        self.entry_list.unlink(node);
        node.get().set_tstate(TState::Run);
    }

    /// Release one level of ownership. At the outermost level the lock is
    /// dropped and, if needed, the oldest queued thread is woken.
    ///
    /// Exiting a monitor the thread does not own is reported and ignored.
    pub fn exit(&self, current: &Thread, not_suspended: bool) {
        let me = current.owner_id();
        if !self.has_owner(current) {
            MonitorCounters::bump(&MonitorCounters::global().usage_errors);
            log::error!(
                "thread {me} is exiting monitor {:p} it does not own (owner {:?})",
                self,
                self.owner()
            );
            return;
        }

        let recursions = self.recursions();
        if recursions != 0 {
            self.set_recursions(recursions - 1);
            return;
        }

        if not_suspended {
            self.previous_owner_tid.store(me, Ordering::Relaxed);
        }

        loop {
            debug_assert!(self.has_owner(current));
            self.owner.release_clear(me);
            // Order the release store before the successor and queue checks.
            fence(Ordering::SeqCst);

            // A successor or spinner will retry the lock: no need to wake anyone.
            if self.entry_list.is_empty() || self.has_successor() {
                return;
            }

            // Someone else (or the deflater) took the lock. They inherit the duty.
            if self.try_lock(current) != TryLockResult::Success {
                return;
            }

            if !self.entry_list.is_empty() {
                // The node may be our own: a waiter notified while it was still
                // exiting after wait(). It is then woken like any other.
                let wakee = self.entry_list_tail(current);
                self.exit_epilog(current, wakee);
                return;
            }
        }
    }

    fn exit_epilog(&self, current: &Thread, wakee: WaiterRef) {
        debug_assert!(self.has_owner(current));
        // Once the owner is cleared the node may be freed: copy what we need.
        let thread = wakee.get().thread();
        self.set_successor(thread.owner_id());

        self.owner.release_clear(current.owner_id());
        fence(Ordering::SeqCst);

        match thread {
            WaiterThread::Platform(t) => t.park_event().unpark(),
            WaiterThread::Virtual(vthread) => Unparker::global().unblock(vthread),
        }
        MonitorCounters::bump(&MonitorCounters::global().parks);
    }

    /// Fully release the monitor and return the recursion count that was
    /// dropped.
    pub fn complete_exit(&self, current: &Thread) -> isize {
        assert!(self.has_owner(current), "complete_exit by a non-owner");
        let save = self.recursions();
        self.set_recursions(0);
        self.exit(current, true);
        assert!(!self.has_owner(current));
        save
    }
}

impl Drop for ObjectMonitor {
    fn drop(&mut self) {
        MonitorCounters::global()
            .extant
            .fetch_sub(1, Ordering::Relaxed);
    }
}

impl fmt::Debug for ObjectMonitor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ObjectMonitor")
            .field("addr", &(self as *const Self))
            .field("object_alive", &!self.is_object_dead())
            .field("owner", &self.owner())
            .field("previous_owner_tid", &self.previous_owner_tid())
            .field("recursions", &self.recursions())
            .field("entry_list_len", &self.entry_list_len())
            .field("successor", &self.successor())
            .field("spin_duration", &self.spin.duration())
            .field("contentions", &self.contentions())
            .field("waiters", &self.waiters())
            .field("wait_set_len", &self.wait_set_len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn monitor() -> (ObjectRef, Arc<ObjectMonitor>) {
        let object: ObjectRef = Arc::new(());
        let monitor = ObjectMonitor::new(&object, SpinKnobs::default());
        (object, monitor)
    }

    #[test]
    fn uncontended_enter_and_exit() {
        let (_object, monitor) = monitor();
        let me = Thread::current();
        assert!(monitor.enter(&me).is_entered());
        assert_eq!(monitor.owner(), Owner::OwnedBy(me.owner_id()));
        assert!(monitor.is_busy());
        monitor.exit(&me, true);
        assert_eq!(monitor.owner(), Owner::Unowned);
        assert_eq!(monitor.previous_owner_tid(), me.owner_id());
        assert!(!monitor.is_busy());
    }

    #[test]
    fn recursion_counts_extra_entries() {
        let (_object, monitor) = monitor();
        let me = Thread::current();
        for _ in 0..3 {
            assert!(monitor.enter(&me).is_entered());
        }
        assert_eq!(monitor.recursions(), 2);
        monitor.exit(&me, true);
        monitor.exit(&me, true);
        assert_eq!(monitor.recursions(), 0);
        assert!(monitor.has_owner(&me));
        monitor.exit(&me, true);
        assert_eq!(monitor.owner(), Owner::Unowned);
    }

    #[test]
    fn unbalanced_exit_is_ignored() {
        let (_object, monitor) = monitor();
        let me = Thread::current();
        let before = MonitorCounters::global().snapshot().usage_errors;
        monitor.exit(&me, true);
        assert_eq!(monitor.owner(), Owner::Unowned);
        assert!(MonitorCounters::global().snapshot().usage_errors > before);
    }

    #[test]
    fn try_enter_without_recursion_check_fails_for_owner() {
        let (_object, monitor) = monitor();
        let me = Thread::current();
        assert!(monitor.try_enter(&me, false));
        assert!(!monitor.try_enter(&me, false));
        assert!(monitor.try_enter(&me, true));
        assert_eq!(monitor.recursions(), 1);
        assert_eq!(monitor.complete_exit(&me), 1);
        assert_eq!(monitor.owner(), Owner::Unowned);
    }

    #[test]
    fn try_lock_cancels_pending_deflation() {
        let (_object, monitor) = monitor();
        let me = Thread::current();
        // First phase of a deflation only.
        assert_eq!(monitor.owner.try_set_from(NO_OWNER, DEFLATER_MARKER), NO_OWNER);
        assert_eq!(monitor.try_lock(&me), TryLockResult::Success);
        assert!(monitor.has_owner(&me));
        // The extended mark leaves one contention behind for the deflater.
        assert_eq!(monitor.contentions(), 1);
    }

    #[test]
    fn try_lock_reports_interference_after_deflation() {
        let (_object, monitor) = monitor();
        let me = Thread::current();
        monitor.owner.try_set_from(NO_OWNER, DEFLATER_MARKER);
        monitor.contentions.store(i32::MIN, Ordering::SeqCst);
        assert_eq!(monitor.try_lock(&me), TryLockResult::Interference);
        assert_eq!(monitor.enter(&me), EnterResult::Deflated);
        assert_eq!(monitor.owner(), Owner::Deflating);
    }

    #[test]
    fn debug_output_names_owner() {
        let (_object, monitor) = monitor();
        let me = Thread::current();
        assert!(monitor.enter(&me).is_entered());
        let text = format!("{monitor:?}");
        assert!(text.contains("OwnedBy"));
        monitor.exit(&me, true);
    }
}

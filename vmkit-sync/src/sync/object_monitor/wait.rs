//! `wait`, `notify` and `notify_all`.

use std::{
    sync::{
        atomic::{fence, Ordering},
        Arc,
    },
    time::Duration,
};

use super::{EnterResult, ObjectMonitor};
use crate::{
    errors::{SyncError, SyncResult},
    sync::{
        counters::MonitorCounters,
        wait_set::WaitSetGuard,
        waiter::{TState, WaiterNode, WaiterRef, WaiterThread},
    },
    threading::{Thread, ThreadStatus},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[must_use]
pub enum WaitResult {
    Notified,
    /// The timeout elapsed, or the thread woke up spuriously.
    TimedOut,
    /// The mounted virtual thread was queued on the wait set and must be
    /// unmounted. The outcome is reported when it is resumed.
    Preempted,
}

impl ObjectMonitor {
    fn check_owner(&self, current: &Thread) -> SyncResult<()> {
        if self.has_owner(current) {
            Ok(())
        } else {
            Err(SyncError::IllegalMonitorState("current thread is not owner"))
        }
    }

    /// Release the monitor and wait until notified, interrupted, or until
    /// `millis` elapse (`0` waits forever). The monitor is re-acquired with
    /// the same recursion count before returning.
    ///
    /// A notification that races with an interrupt wins: the wait returns
    /// `Notified` and the interrupt stays pending.
    pub fn wait(&self, current: &Arc<Thread>, millis: u64, interruptible: bool) -> SyncResult<WaitResult> {
        self.wait_impl(current, millis, interruptible, true)
    }

    /// Like [`wait`](Self::wait), but a mounted virtual thread blocks its
    /// carrier instead of being preempted. Never returns `Preempted`.
    pub fn wait_no_preempt(
        &self,
        current: &Arc<Thread>,
        millis: u64,
        interruptible: bool,
    ) -> SyncResult<WaitResult> {
        self.wait_impl(current, millis, interruptible, false)
    }

    fn wait_impl(
        &self,
        current: &Arc<Thread>,
        millis: u64,
        interruptible: bool,
        allow_preempt: bool,
    ) -> SyncResult<WaitResult> {
        self.check_owner(current)?;

        if interruptible && current.is_interrupted(true) {
            return Err(SyncError::Interrupted);
        }

        self.stats.waits.fetch_add(1, Ordering::Relaxed);

        if let Some(vthread) = current.mounted_vthread().filter(|_| allow_preempt) {
            if vthread.try_preempt() {
                self.vthread_wait(current, &vthread, millis, interruptible);
                return Ok(WaitResult::Preempted);
            }
        }

        let node = WaiterNode::new(WaiterThread::Platform(current.clone()));
        node.set_tstate(TState::Wait);
        current.park_event().reset();
        // The node must be fully initialized before it is published.
        fence(Ordering::SeqCst);

        self.wait_set.lock().add(node.handle());

        let save = self.recursions();
        self.add_to_waiters(1);
        self.set_recursions(0);
        self.exit(current, true);
        assert!(!self.has_owner(current), "still owner after exit in wait");

        let saved_status = current.status();
        current.set_status(if millis > 0 {
            ThreadStatus::InObjectWaitTimed
        } else {
            ThreadStatus::InObjectWait
        });
        current.set_current_waiting_monitor(Some(self.weak()));

        let interrupted = interruptible && current.is_interrupted(false);
        current.block_in_vm(
            || {
                if interrupted || node.tstate() != TState::Wait {
                    return;
                }
                if millis == 0 {
                    current.park_event().park();
                } else {
                    current.park_event().park_for(Duration::from_millis(millis));
                }
            },
            |t| self.clear_successor_on_suspend(t),
        );

        // Timeout, interrupt or spurious wakeup: we may still be on the wait
        // set. The double-checked test avoids the lock in the common case
        // where a notifier already moved us.
        if node.tstate() == TState::Wait {
            let mut wait_set = self.wait_set.lock();
            if node.tstate() == TState::Wait {
                wait_set.dequeue_specific(node.handle());
                debug_assert!(!node.notified());
                node.set_tstate(TState::Run);
            }
        }

        assert_ne!(node.tstate(), TState::Wait, "waiter still on the wait set");
        fence(Ordering::Acquire);
        if self.has_successor_of(current) {
            self.clear_successor();
        }
        let was_notified = node.notified();
        fence(Ordering::SeqCst);

        if node.tstate() == TState::Run {
            // Never notified: enter from scratch.
            let result = self.enter_no_preempt(current);
            assert_eq!(result, EnterResult::Entered, "monitor with waiters was deflated");
        } else {
            debug_assert_eq!(node.tstate(), TState::Enter);
            self.reenter_internal(current, node.handle());
            self.wait_reenter_end(current, node.handle());
        }
        assert!(self.has_owner(current), "not owner after re-entering from wait");
        assert_eq!(node.tstate(), TState::Run);
        drop(node);

        current.set_current_waiting_monitor(None);
        current.set_status(saved_status);
        self.set_recursions(save + current.take_deferred_relocks());
        self.add_to_waiters(-1);

        if !was_notified && interruptible && current.is_interrupted(true) {
            return Err(SyncError::Interrupted);
        }
        Ok(if was_notified {
            WaitResult::Notified
        } else {
            WaitResult::TimedOut
        })
    }

    /// Move one waiter from the wait set to the entry list. The wait-set
    /// lock must be held; returns `false` if the wait set was empty.
    fn notify_internal(&self, current: &Thread, wait_set: &mut WaitSetGuard<'_>) -> bool {
        let Some(handle) = wait_set.dequeue() else {
            return false;
        };
        let waiter = handle.get();
        assert_eq!(waiter.tstate(), TState::Wait, "non-waiting node on the wait set");
        assert!(!waiter.notified(), "waiter notified twice");

        if let WaiterThread::Virtual(vthread) = waiter.thread() {
            vthread.set_notified(true);
            vthread.notify_unwait();
        }

        waiter.set_notified(current.owner_id());
        self.add_to_entry_list(handle);

        if !waiter.is_virtual() {
            self.wait_reenter_begin(handle);
        }
        true
    }

    /// Wake the longest-waiting thread, if any.
    pub fn notify(&self, current: &Thread) -> SyncResult<()> {
        self.check_owner(current)?;
        if self.wait_set.is_empty() {
            return Ok(());
        }
        let notified = {
            let mut wait_set = self.wait_set.lock();
            self.notify_internal(current, &mut wait_set)
        };
        if notified {
            MonitorCounters::bump(&MonitorCounters::global().notifications);
            self.stats.notifications.fetch_add(1, Ordering::Relaxed);
        }
        Ok(())
    }

    /// Move every waiter to the entry list, in arrival order. Returns how
    /// many waiters were moved.
    pub fn notify_all(&self, current: &Thread) -> SyncResult<usize> {
        self.check_owner(current)?;
        if self.wait_set.is_empty() {
            return Ok(0);
        }
        let mut tally = 0;
        {
            let mut wait_set = self.wait_set.lock();
            while self.notify_internal(current, &mut wait_set) {
                tally += 1;
            }
        }
        MonitorCounters::global()
            .notifications
            .fetch_add(tally as u64, Ordering::Relaxed);
        self.stats
            .notifications
            .fetch_add(tally as u64, Ordering::Relaxed);
        Ok(tally)
    }

    /// The notified platform thread is no longer waiting but contending for
    /// the monitor.
    fn wait_reenter_begin(&self, node: WaiterRef) {
        let waiter = node.get();
        waiter.set_active(true);
        if let WaiterThread::Platform(thread) = waiter.thread() {
            thread.set_status(ThreadStatus::BlockedOnMonitorEnter);
            thread.set_current_pending_monitor(Some(self.weak()));
        }
    }

    fn wait_reenter_end(&self, current: &Thread, node: WaiterRef) {
        let waiter = node.get();
        if waiter.is_active() {
            current.set_current_pending_monitor(None);
            waiter.set_active(false);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{options::SpinKnobs, sync::object_monitor::ObjectRef};

    #[test]
    fn wait_requires_ownership() {
        let object: ObjectRef = Arc::new(());
        let monitor = ObjectMonitor::new(&object, SpinKnobs::default());
        let me = Thread::current();
        assert!(matches!(
            monitor.wait(&me, 1, true),
            Err(SyncError::IllegalMonitorState(_))
        ));
        assert!(monitor.notify(&me).is_err());
        assert!(monitor.notify_all(&me).is_err());
    }

    #[test]
    fn timed_wait_without_notify_times_out() {
        let object: ObjectRef = Arc::new(());
        let monitor = ObjectMonitor::new(&object, SpinKnobs::default());
        let me = Thread::current();
        assert!(monitor.enter(&me).is_entered());
        assert!(monitor.enter(&me).is_entered());
        assert_eq!(monitor.wait(&me, 10, true), Ok(WaitResult::TimedOut));
        assert!(monitor.has_owner(&me));
        assert_eq!(monitor.recursions(), 1);
        assert_eq!(monitor.waiters(), 0);
        assert_eq!(monitor.wait_set_len(), 0);
        monitor.exit(&me, true);
        monitor.exit(&me, true);
    }

    #[test]
    fn pending_interrupt_fails_wait_immediately() {
        let object: ObjectRef = Arc::new(());
        let monitor = ObjectMonitor::new(&object, SpinKnobs::default());
        let me = Thread::current();
        assert!(monitor.enter(&me).is_entered());
        me.interrupt();
        assert_eq!(monitor.wait(&me, 0, true), Err(SyncError::Interrupted));
        assert!(!me.is_interrupted(false));
        assert!(monitor.has_owner(&me));
        monitor.exit(&me, true);
    }

    #[test]
    fn notify_on_empty_wait_set_is_a_no_op() {
        let object: ObjectRef = Arc::new(());
        let monitor = ObjectMonitor::new(&object, SpinKnobs::default());
        let me = Thread::current();
        assert!(monitor.enter(&me).is_entered());
        assert_eq!(monitor.notify(&me), Ok(()));
        assert_eq!(monitor.notify_all(&me), Ok(0));
        assert_eq!(monitor.stats().notifications, 0);
        monitor.exit(&me, true);
    }

    #[test]
    fn deferred_relocks_are_applied_after_wait() {
        let object: ObjectRef = Arc::new(());
        let monitor = ObjectMonitor::new(&object, SpinKnobs::default());
        let me = Thread::current();
        assert!(monitor.enter(&me).is_entered());
        me.defer_relock(2);
        assert_eq!(monitor.wait(&me, 1, false), Ok(WaitResult::TimedOut));
        assert_eq!(monitor.recursions(), 2);
        assert_eq!(monitor.complete_exit(&me), 2);
    }
}

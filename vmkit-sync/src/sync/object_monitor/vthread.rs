//! Monitor operations of virtual threads that can be unmounted.
//!
//! Instead of parking its carrier, a preemptible virtual thread queues a
//! node on the entry list (or wait set), records a [`PendingMonitorOp`] and
//! unmounts. When a monitor exit picks it, the [`Unparker`] hands it back to
//! its scheduler, and [`ObjectMonitor::resume_operation`] finishes the
//! operation on whichever carrier runs it next.
//!
//! [`Unparker`]: crate::threading::vthread::Unparker

use std::sync::{
    atomic::{fence, Ordering},
    Arc,
};

use super::{ObjectMonitor, TryLockResult, WaitResult};
use crate::{
    errors::{SyncError, SyncResult},
    sync::waiter::{TState, WaiterNode, WaiterRef, WaiterThread},
    threading::{
        vthread::{PendingMonitorOp, VThreadState, VirtualThread},
        Thread,
    },
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[must_use]
pub enum ResumeResult {
    /// A preempted `enter` acquired the monitor.
    Entered,
    /// A preempted `wait` re-acquired the monitor.
    WaitCompleted(SyncResult<WaitResult>),
    /// Still contended. The thread was unmounted again.
    Blocked,
}

impl ObjectMonitor {
    /// Enter on behalf of the virtual thread mounted on `current`. Returns
    /// `true` if the monitor was acquired; otherwise the thread is queued,
    /// marked `Blocking` and must unmount.
    ///
    /// `waiter` is the node of a waiting thread re-entering after `wait()`.
    pub(crate) fn vthread_monitor_enter(
        &self,
        current: &Thread,
        vthread: &Arc<VirtualThread>,
        waiter: Option<WaiterRef>,
    ) -> bool {
        if self.try_lock(current) == TryLockResult::Success {
            return true;
        }

        let owns_node = waiter.is_none();
        let node = waiter
            .unwrap_or_else(|| WaiterNode::new(WaiterThread::Virtual(vthread.clone())).into_handle());
        let free_node = || {
            if owns_node {
                drop(WaiterNode::from_handle(node));
            }
        };

        if self.try_lock_or_add_to_entry_list(current, node) {
            free_node();
            return true;
        }

        // The owner may have exited before our push became visible.
        if self.try_lock(current) == TryLockResult::Success {
            self.unlink_after_acquire(current, node);
            if self.has_successor_of(current) {
                self.clear_successor();
            }
            free_node();
            return true;
        }

        vthread.set_state(VThreadState::Blocking);
        // Keeps the monitor from being deflated while the thread is off-carrier.
        self.add_to_contentions(1);
        vthread.set_pending_op(PendingMonitorOp {
            monitor: self.strong(),
            node,
        });
        false
    }

    /// Queue the mounted virtual thread on the wait set and release the
    /// monitor. The caller must unmount the thread afterwards.
    pub(crate) fn vthread_wait(
        &self,
        current: &Thread,
        vthread: &Arc<VirtualThread>,
        millis: u64,
        interruptible: bool,
    ) {
        let node = WaiterNode::new(WaiterThread::Virtual(vthread.clone())).into_handle();
        let waiter = node.get();
        waiter.set_is_wait(true);
        waiter.set_tstate(TState::Wait);
        vthread.set_notified(false);
        vthread.set_interruptible_wait(interruptible);

        self.wait_set.lock().add(node);

        waiter.set_recursions(self.recursions());
        self.set_recursions(0);
        self.add_to_waiters(1);
        self.exit(current, true);
        assert!(!self.has_owner(current), "still owner after exit in wait");

        vthread.set_state(if millis == 0 {
            VThreadState::Wait
        } else {
            VThreadState::TimedWait
        });
        vthread.set_timeout(millis);
        vthread.set_pending_op(PendingMonitorOp {
            monitor: self.strong(),
            node,
        });
    }

    /// First step of resuming a preempted wait. Returns the outcome if the
    /// monitor was re-acquired right away.
    fn vthread_wait_reenter(
        &self,
        current: &Thread,
        vthread: &Arc<VirtualThread>,
        node: WaiterRef,
    ) -> Option<SyncResult<WaitResult>> {
        let waiter = node.get();
        if waiter.tstate() == TState::Wait {
            let mut wait_set = self.wait_set.lock();
            if waiter.tstate() == TState::Wait {
                wait_set.dequeue_specific(node);
                waiter.set_tstate(TState::Run);
            }
        }

        // Notified means a notifier moved the node to the entry list.
        let was_notified = waiter.tstate() == TState::Enter;
        waiter.set_interrupted(
            !was_notified && vthread.interruptible_wait() && vthread.is_interrupted(false),
        );
        waiter.set_at_reenter(true);

        if was_notified {
            // Matches the decrement in the epilog.
            self.add_to_contentions(1);
            return None;
        }

        if !self.vthread_monitor_enter(current, vthread, Some(node)) {
            return None;
        }

        self.set_recursions(waiter.recursions());
        self.add_to_waiters(-1);
        let interrupted = waiter.interrupted();
        drop(WaiterNode::from_handle(node));
        vthread.clear_pending_op();
        Some(if interrupted {
            vthread.is_interrupted(true);
            Err(SyncError::Interrupted)
        } else {
            Ok(WaitResult::TimedOut)
        })
    }

    /// Finish a preempted `enter` or `wait` for the virtual thread mounted on
    /// `current`.
    pub(crate) fn resume_operation(
        &self,
        current: &Arc<Thread>,
        vthread: &Arc<VirtualThread>,
        node: WaiterRef,
    ) -> ResumeResult {
        let waiter = node.get();
        if waiter.is_wait() && !waiter.at_reenter() {
            if let Some(result) = self.vthread_wait_reenter(current, vthread, node) {
                return ResumeResult::WaitCompleted(result);
            }
        }

        assert_eq!(waiter.tstate(), TState::Enter, "resumed virtual thread is not queued");

        if self.try_lock(current) == TryLockResult::Success {
            return self.vthread_epilog(current, vthread, node);
        }

        if self.has_successor_of(current) {
            self.clear_successor();
        }
        // Re-check after dropping the successor role.
        fence(Ordering::SeqCst);

        if self.try_lock(current) == TryLockResult::Success {
            return self.vthread_epilog(current, vthread, node);
        }

        vthread.set_state(VThreadState::Blocking);
        ResumeResult::Blocked
    }

    fn vthread_epilog(
        &self,
        current: &Thread,
        vthread: &Arc<VirtualThread>,
        node: WaiterRef,
    ) -> ResumeResult {
        debug_assert!(self.has_owner(current));
        self.add_to_contentions(-1);

        if self.has_successor_of(current) {
            self.clear_successor();
        }

        let waiter = node.get();
        let result = if waiter.is_wait() {
            self.set_recursions(waiter.recursions());
            self.add_to_waiters(-1);
            ResumeResult::WaitCompleted(if waiter.interrupted() {
                vthread.is_interrupted(true);
                Err(SyncError::Interrupted)
            } else if waiter.notified() {
                Ok(WaitResult::Notified)
            } else {
                Ok(WaitResult::TimedOut)
            })
        } else {
            ResumeResult::Entered
        };

        self.unlink_after_acquire(current, node);
        drop(WaiterNode::from_handle(node));
        vthread.clear_pending_op();
        result
    }
}

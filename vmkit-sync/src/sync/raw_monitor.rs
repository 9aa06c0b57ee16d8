use std::{
    mem::ManuallyDrop,
    num::NonZeroU64,
    ops::Deref,
    sync::atomic::{AtomicU64, AtomicUsize, Ordering},
    time::Duration,
};

use parking_lot::{Condvar, Mutex, MutexGuard, WaitTimeoutResult};

use crate::threading::{parked_scope, Thread};

fn os_thread_key() -> NonZeroU64 {
    thread_local! {
        static KEY: u8 = 0;
    }
    KEY.with(|x| {
        NonZeroU64::new(x as *const _ as u64).expect("thread-local variable address is null")
    })
}

/// Recursive lock with a condition variable for the runtime's own bookkeeping:
/// park events, thread block/unblock handshakes, the thread registry and the
/// deflation thread's timer.
///
/// It never touches object monitors, so it can be used underneath them.
/// Methods with the `with_handshake` suffix mark the calling [`Thread`] as
/// parked while they block, which lets suspend and pause requests treat the
/// thread as stopped. The `no_handshake` variants block silently and must only
/// be used for short waits or by code that is itself part of the handshake
/// machinery.
///
/// The protected value is shared, not mutable; wrap it in `Cell` or `RefCell`.
pub struct RawMonitor<T> {
    mutex: Mutex<T>,
    cvar: Condvar,
    rec_count: AtomicUsize,
    holder: AtomicU64,
}

impl<T> RawMonitor<T> {
    pub const fn new(value: T) -> Self {
        Self {
            mutex: Mutex::new(value),
            cvar: Condvar::new(),
            rec_count: AtomicUsize::new(0),
            holder: AtomicU64::new(0),
        }
    }

    pub fn lock_no_handshake(&self) -> RawMonitorGuard<'_, T> {
        let me = os_thread_key().get();
        let guard = if self.holder.load(Ordering::Relaxed) != me {
            let guard = self.mutex.lock();
            self.holder.store(me, Ordering::Release);
            RawMonitorGuard {
                monitor: self,
                guard: ManuallyDrop::new(guard),
            }
        } else {
            RawMonitorGuard {
                monitor: self,
                guard: unsafe { ManuallyDrop::new(self.mutex.make_guard_unchecked()) },
            }
        };
        self.rec_count.fetch_add(1, Ordering::Relaxed);
        guard
    }

    pub fn lock_with_handshake(&self) -> RawMonitorGuard<'_, T> {
        let me = os_thread_key().get();
        let guard = if me != self.holder.load(Ordering::Relaxed) {
            let guard = self.lock_with_handshake_no_rec();
            self.holder.store(me, Ordering::Release);
            guard
        } else {
            RawMonitorGuard {
                monitor: self,
                guard: unsafe { ManuallyDrop::new(self.mutex.make_guard_unchecked()) },
            }
        };
        self.rec_count.fetch_add(1, Ordering::Relaxed);
        guard
    }

    fn lock_with_handshake_no_rec(&self) -> RawMonitorGuard<'_, T> {
        let guard = self.acquire_parked();
        RawMonitorGuard {
            monitor: self,
            guard: ManuallyDrop::new(guard),
        }
    }

    /// Take the mutex while parked. If a block request arrived in the
    /// meantime, drop the mutex, honor the request and try again.
    fn acquire_parked(&self) -> MutexGuard<'_, T> {
        loop {
            Thread::enter_parked();
            let guard = self.mutex.lock();
            if Thread::attempt_leave_parked_no_block() {
                break guard;
            }
            drop(guard);
            Thread::leave_parked();
        }
    }

    pub fn notify(&self) {
        self.cvar.notify_one();
    }

    pub fn notify_all(&self) {
        self.cvar.notify_all();
    }

    /// # Safety
    ///
    /// The caller must have released the lock with
    /// [`RawMonitorGuard::unlock_completely`] and pass back the count it returned.
    pub unsafe fn relock_with_handshake(&self, rec_count: usize) -> RawMonitorGuard<'_, T> {
        let guard = self.acquire_parked();
        self.holder.store(os_thread_key().get(), Ordering::Relaxed);
        self.rec_count.store(rec_count, Ordering::Relaxed);
        RawMonitorGuard {
            monitor: self,
            guard: ManuallyDrop::new(guard),
        }
    }
}

pub struct RawMonitorGuard<'a, T> {
    monitor: &'a RawMonitor<T>,
    guard: ManuallyDrop<MutexGuard<'a, T>>,
}

impl<T> Deref for RawMonitorGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &Self::Target {
        &self.guard
    }
}

impl<'a, T> RawMonitorGuard<'a, T> {
    pub fn wait_no_handshake(&mut self) {
        let rec_count = self.monitor.rec_count.swap(0, Ordering::Relaxed);
        let holder = self.monitor.holder.swap(0, Ordering::Relaxed);
        self.monitor.cvar.wait(&mut self.guard);
        self.monitor.rec_count.store(rec_count, Ordering::Relaxed);
        self.monitor.holder.store(holder, Ordering::Relaxed);
    }

    pub fn wait_for_no_handshake(&mut self, timeout: Duration) -> WaitTimeoutResult {
        let rec_count = self.monitor.rec_count.swap(0, Ordering::Relaxed);
        let holder = self.monitor.holder.swap(0, Ordering::Relaxed);
        let result = self.monitor.cvar.wait_for(&mut self.guard, timeout);
        self.monitor.rec_count.store(rec_count, Ordering::Relaxed);
        self.monitor.holder.store(holder, Ordering::Relaxed);
        result
    }

    pub fn notify(&self) {
        self.monitor.cvar.notify_one();
    }

    pub fn notify_all(&self) {
        self.monitor.cvar.notify_all();
    }

    /// # Safety
    ///
    /// The guard must not be used again until the lock is re-acquired with
    /// [`RawMonitor::relock_with_handshake`].
    pub unsafe fn unlock_completely(&mut self) -> usize {
        let result = self.monitor.rec_count.load(Ordering::Relaxed);
        self.monitor.rec_count.store(0, Ordering::Relaxed);
        self.monitor.holder.store(0, Ordering::Relaxed);
        unsafe {
            ManuallyDrop::drop(&mut self.guard);
        }
        result
    }

    /// Timed wait while parked. The boolean is `true` when the timeout elapsed.
    pub fn wait_for_with_handshake(mut self, timeout: Duration) -> (Self, bool) {
        let monitor = self.monitor;
        let (rec_count, timed_out) = parked_scope(|| {
            let timed_out = self.wait_for_no_handshake(timeout).timed_out();
            (unsafe { self.unlock_completely() }, timed_out)
        });
        std::mem::forget(self);
        (unsafe { monitor.relock_with_handshake(rec_count) }, timed_out)
    }
}

impl<'a, T> Drop for RawMonitorGuard<'a, T> {
    fn drop(&mut self) {
        if self.monitor.rec_count.fetch_sub(1, Ordering::Relaxed) == 1 {
            self.monitor.holder.store(0, Ordering::Relaxed);
            unsafe { ManuallyDrop::drop(&mut self.guard) };
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::{cell::Cell, sync::Arc};

    #[test]
    fn lock_is_recursive() {
        let monitor = RawMonitor::new(Cell::new(0));
        let outer = monitor.lock_no_handshake();
        {
            let inner = monitor.lock_no_handshake();
            inner.set(inner.get() + 1);
        }
        outer.set(outer.get() + 1);
        assert_eq!(outer.get(), 2);
        drop(outer);
        assert!(monitor.mutex.try_lock().is_some());
    }

    #[test]
    fn timed_wait_expires() {
        let monitor = RawMonitor::new(());
        let mut guard = monitor.lock_no_handshake();
        assert!(guard
            .wait_for_no_handshake(Duration::from_millis(10))
            .timed_out());
    }

    #[test]
    fn notify_wakes_waiter() {
        let monitor = Arc::new(RawMonitor::new(Cell::new(false)));
        let waker = {
            let monitor = monitor.clone();
            std::thread::spawn(move || {
                let guard = monitor.lock_no_handshake();
                guard.set(true);
                guard.notify_all();
            })
        };
        let mut guard = monitor.lock_no_handshake();
        while !guard.get() {
            guard.wait_no_handshake();
        }
        drop(guard);
        waker.join().unwrap();
    }

    #[test]
    fn handshake_wait_times_out_and_relocks() {
        let monitor = RawMonitor::new(Cell::new(1));
        let guard = monitor.lock_with_handshake();
        let (guard, timed_out) = guard.wait_for_with_handshake(Duration::from_millis(5));
        assert!(timed_out);
        assert_eq!(guard.get(), 1);
    }
}

use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::lock_api::{self, GuardSend, RawMutex};

/// Test-and-test-and-set lock for very short critical sections that must not
/// interact with the thread system (the wait set of a monitor).
///
/// Contended acquirers spin, then yield, then sleep for a millisecond.
pub struct RawSpinLock {
    locked: AtomicBool,
}

pub type SpinMutex<T> = lock_api::Mutex<RawSpinLock, T>;
pub type SpinMutexGuard<'a, T> = lock_api::MutexGuard<'a, RawSpinLock, T>;

const SPINS_BEFORE_YIELD: u32 = 0xFF;
const YIELDS_BEFORE_SLEEP: u32 = 16;

unsafe impl RawMutex for RawSpinLock {
    #[allow(clippy::declare_interior_mutable_const)]
    const INIT: Self = Self {
        locked: AtomicBool::new(false),
    };

    type GuardMarker = GuardSend;

    fn lock(&self) {
        if self.try_lock() {
            return;
        }
        let mut spins = 0u32;
        let mut yields = 0u32;
        loop {
            while self.locked.load(Ordering::Relaxed) {
                spins += 1;
                if spins < SPINS_BEFORE_YIELD {
                    std::hint::spin_loop();
                } else if yields < YIELDS_BEFORE_SLEEP {
                    spins = 0;
                    yields += 1;
                    std::thread::yield_now();
                } else {
                    std::thread::sleep(std::time::Duration::from_millis(1));
                }
            }
            if self.try_lock() {
                return;
            }
        }
    }

    fn try_lock(&self) -> bool {
        self.locked
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
    }

    unsafe fn unlock(&self) {
        self.locked.store(false, Ordering::Release);
    }

    fn is_locked(&self) -> bool {
        self.locked.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn excludes_concurrent_increments() {
        let counter = Arc::new(SpinMutex::new(0usize));
        let handles = (0..4)
            .map(|_| {
                let counter = counter.clone();
                std::thread::spawn(move || {
                    for _ in 0..10_000 {
                        *counter.lock() += 1;
                    }
                })
            })
            .collect::<Vec<_>>();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(*counter.lock(), 40_000);
    }

    #[test]
    fn try_lock_fails_while_held() {
        let mutex = SpinMutex::new(());
        let guard = mutex.lock();
        assert!(mutex.try_lock().is_none());
        drop(guard);
        assert!(mutex.try_lock().is_some());
    }
}

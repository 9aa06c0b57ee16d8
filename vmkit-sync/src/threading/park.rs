use std::{cell::Cell, time::Duration};

use crate::sync::RawMonitor;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParkResult {
    Unparked,
    TimedOut,
}

/// Single-permit park/unpark primitive owned by every platform thread.
///
/// `unpark` before `park` is remembered, so a wakeup is never lost. Callers
/// must still tolerate spurious returns and re-check their condition.
pub struct ParkEvent {
    event: RawMonitor<Cell<bool>>,
}

impl ParkEvent {
    pub const fn new() -> Self {
        Self {
            event: RawMonitor::new(Cell::new(false)),
        }
    }

    /// Drop a stale permit. Done before a thread publishes itself on a queue.
    pub fn reset(&self) {
        let guard = self.event.lock_no_handshake();
        guard.set(false);
    }

    pub fn park(&self) {
        let mut guard = self.event.lock_no_handshake();
        while !guard.get() {
            guard.wait_no_handshake();
        }
        guard.set(false);
    }

    pub fn park_for(&self, timeout: Duration) -> ParkResult {
        let mut guard = self.event.lock_no_handshake();
        if !guard.get() {
            // A single timed wait: an early return counts as a spurious wakeup.
            let timed_out = guard.wait_for_no_handshake(timeout).timed_out();
            if timed_out && !guard.get() {
                return ParkResult::TimedOut;
            }
        }
        guard.set(false);
        ParkResult::Unparked
    }

    pub fn unpark(&self) {
        let guard = self.event.lock_no_handshake();
        guard.set(true);
        guard.notify();
    }
}

impl Default for ParkEvent {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::{sync::Arc, time::Instant};

    #[test]
    fn unpark_before_park_is_not_lost() {
        let event = ParkEvent::new();
        event.unpark();
        event.park();
        assert_eq!(
            event.park_for(Duration::from_millis(1)),
            ParkResult::TimedOut
        );
    }

    #[test]
    fn reset_discards_permit() {
        let event = ParkEvent::new();
        event.unpark();
        event.reset();
        let start = Instant::now();
        assert_eq!(
            event.park_for(Duration::from_millis(20)),
            ParkResult::TimedOut
        );
        assert!(start.elapsed() >= Duration::from_millis(15));
    }

    #[test]
    fn unpark_from_other_thread() {
        let event = Arc::new(ParkEvent::new());
        let other = {
            let event = event.clone();
            std::thread::spawn(move || {
                std::thread::sleep(Duration::from_millis(10));
                event.unpark();
            })
        };
        event.park();
        other.join().unwrap();
    }
}

//! Asynchronous deflation.
//!
//! The deflater claims an idle monitor in two steps without ever blocking:
//!
//! 1. CAS `owner` from [`NO_OWNER`] to [`DEFLATER_MARKER`]. Entering threads
//!    that see the marker take the slow path; one of them may CAS the marker
//!    to its own id, which cancels the deflation.
//! 2. CAS `contentions` from `0` to `i32::MIN`. A contending thread that
//!    raised `contentions` first makes this fail. Once it succeeds the
//!    monitor is dead: every later enter sees a negative count and retries
//!    against a fresh monitor.

use std::sync::atomic::Ordering;

use super::ObjectMonitor;
use crate::sync::{
    counters::MonitorCounters,
    owner::{DEFLATER_MARKER, NO_OWNER},
};

impl ObjectMonitor {
    /// Try to deflate an idle monitor. Returns `true` if the monitor is now
    /// deflated and may be unlinked from its object.
    pub fn deflate_if_idle(&self) -> bool {
        if self.is_being_async_deflated() || self.is_busy() {
            return false;
        }

        if self.is_object_dead() {
            // Nobody can look this monitor up any more, so there is no need to
            // wait for contenders to show up between the phases. A holder of
            // the monitor itself can still enter it, hence the CASes.
            if self.owner.try_set_from(NO_OWNER, DEFLATER_MARKER) != NO_OWNER {
                return false;
            }
            if self
                .contentions
                .compare_exchange(0, i32::MIN, Ordering::SeqCst, Ordering::SeqCst)
                .is_err()
            {
                self.abandon_deflation();
                return false;
            }
        } else {
            if self.owner.try_set_from(NO_OWNER, DEFLATER_MARKER) != NO_OWNER {
                return false;
            }

            if self.contentions() > 0 || self.waiters() != 0 {
                self.abandon_deflation();
                return false;
            }

            if self
                .contentions
                .compare_exchange(0, i32::MIN, Ordering::SeqCst, Ordering::SeqCst)
                .is_err()
            {
                self.abandon_deflation();
                return false;
            }
        }

        assert_eq!(self.owner.raw(), DEFLATER_MARKER, "deflated monitor lost the marker");
        assert!(self.contentions() < 0, "deflated monitor with contentions {}", self.contentions());
        assert_eq!(self.waiters(), 0, "deflated monitor with waiters");
        assert!(self.entry_list.is_empty(), "deflated monitor with entering threads");

        MonitorCounters::bump(&MonitorCounters::global().deflations);
        log::trace!("deflated {:p} (object alive: {})", self, !self.is_object_dead());
        true
    }

    /// Put the owner back to [`NO_OWNER`] unless an entering thread already
    /// replaced the marker. That thread left an extra contention behind for
    /// us to remove.
    fn abandon_deflation(&self) {
        if self.owner.try_set_from(DEFLATER_MARKER, NO_OWNER) != DEFLATER_MARKER {
            self.add_to_contentions(-1);
        }
    }
}

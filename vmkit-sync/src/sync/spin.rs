//! Adaptive spinning before a contending thread parks.
//!
//! Each monitor keeps its own spin budget. A spin that ends in acquisition
//! raises the budget, a spin that runs out lowers it, so monitors with short
//! hold times are spun on and monitors with long hold times are not.

use std::sync::atomic::{AtomicI32, Ordering};

use super::{
    object_monitor::{ObjectMonitor, TryLockResult},
    owner::NO_OWNER,
};
use crate::{options::SpinKnobs, threading::Thread};

pub struct SpinController {
    duration: AtomicI32,
    knobs: SpinKnobs,
}

impl SpinController {
    pub fn new(knobs: SpinKnobs) -> Self {
        let limit = knobs.limit.max(0);
        Self {
            duration: AtomicI32::new(limit),
            knobs: SpinKnobs { limit, ..knobs },
        }
    }

    pub fn knobs(&self) -> &SpinKnobs {
        &self.knobs
    }

    /// Current spin budget, always within `[0, limit]`.
    pub fn duration(&self) -> i32 {
        self.duration.load(Ordering::Relaxed)
    }

    // Updates are racy load/store pairs. Every stored value is clamped, so a
    // lost update never leaves the bounds.

    pub fn on_success(&self) {
        let x = self.duration();
        self.duration
            .store(adjust_up(&self.knobs, x), Ordering::Relaxed);
    }

    pub fn on_failure(&self) {
        let x = self.duration();
        self.duration
            .store(adjust_down(&self.knobs, x), Ordering::Relaxed);
    }
}

/// Raise the budget after a successful spin. A budget below the poverty
/// floor is lifted to it first so that a starved monitor recovers quickly.
pub fn adjust_up(knobs: &SpinKnobs, x: i32) -> i32 {
    if x < knobs.limit {
        x.max(knobs.poverty)
            .saturating_add(knobs.bonus)
            .clamp(0, knobs.limit)
    } else {
        x.min(knobs.limit)
    }
}

pub fn adjust_down(knobs: &SpinKnobs, x: i32) -> i32 {
    x.saturating_sub(knobs.penalty)
        .clamp(0, knobs.limit.max(0))
}

/// Spin iterations between polls of the thread's block request word.
const POLL_INTERVAL_MASK: i32 = 0xFF;

impl ObjectMonitor {
    /// Try to take the lock up to `count` times. Gives up early on
    /// interference with the deflater.
    pub(crate) fn short_fixed_spin(&self, current: &Thread, count: i32, adapt: bool) -> bool {
        for _ in 0..count {
            match self.try_lock(current) {
                TryLockResult::Success => {
                    if adapt {
                        self.spin.on_success();
                    }
                    return true;
                }
                TryLockResult::Interference => break,
                TryLockResult::HasOwner => std::hint::spin_loop(),
            }
        }
        false
    }

    /// Spin until the lock is acquired, the budget runs out, ownership
    /// changes hands or a block request is pending.
    ///
    /// While spinning, the thread installs itself as successor (if there is
    /// none) so that an exiting owner does not wake a parked thread needlessly.
    pub(crate) fn try_spin(&self, current: &Thread) -> bool {
        let knobs = *self.spin.knobs();
        if knobs.fixed_spin > 0 {
            return self.short_fixed_spin(current, knobs.fixed_spin, false);
        }

        if knobs.pre_spin > 0 && self.short_fixed_spin(current, knobs.pre_spin, true) {
            return true;
        }

        let mut ctr = self.spin.duration();
        if ctr <= 0 {
            return false;
        }

        let me = current.owner_id();
        if !self.has_successor() {
            self.set_successor(me);
        }

        let mut prv = NO_OWNER;
        loop {
            ctr -= 1;
            if ctr < 0 {
                break;
            }
            if (ctr & POLL_INTERVAL_MASK) == 0 {
                if current.take_yieldpoint() != 0 {
                    break;
                }
                std::hint::spin_loop();
            }

            let ox = self.owner.raw();
            if ox == NO_OWNER {
                if self.owner.try_set_from(NO_OWNER, me) == NO_OWNER {
                    if self.has_successor_of(current) {
                        self.clear_successor();
                    }
                    self.spin.on_success();
                    self.stats
                        .spin_successes
                        .fetch_add(1, Ordering::Relaxed);
                    log::trace!(
                        "{me} acquired {:p} by spinning, budget now {}",
                        self,
                        self.spin.duration()
                    );
                    return true;
                }
                // Lost the race. Parking is cheaper than fighting on.
                break;
            }

            // Ownership changed hands while we were spinning.
            if ox != prv && prv != NO_OWNER {
                break;
            }
            prv = ox;

            if !self.has_successor() {
                self.set_successor(me);
            }
        }

        if ctr < 0 {
            self.spin.on_failure();
        }

        if self.has_successor_of(current) {
            self.clear_successor();
            // Re-check after giving up the successor role, otherwise an
            // exiting owner that saw us as successor leaves nobody awake.
            std::sync::atomic::fence(Ordering::SeqCst);
            if self.try_lock(current) == TryLockResult::Success {
                return true;
            }
        }

        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::Rng;

    #[test]
    fn starts_at_limit() {
        let controller = SpinController::new(SpinKnobs::default());
        assert_eq!(controller.duration(), 5000);
    }

    #[test]
    fn adjust_up_lifts_poverty_and_adds_bonus() {
        let knobs = SpinKnobs::default();
        assert_eq!(adjust_up(&knobs, 0), 1100);
        assert_eq!(adjust_up(&knobs, 2000), 2100);
        assert_eq!(adjust_up(&knobs, 4950), 5000);
        assert_eq!(adjust_up(&knobs, 5000), 5000);
    }

    #[test]
    fn adjust_down_floors_at_zero() {
        let knobs = SpinKnobs::default();
        assert_eq!(adjust_down(&knobs, 1000), 800);
        assert_eq!(adjust_down(&knobs, 150), 0);
        assert_eq!(adjust_down(&knobs, 0), 0);
    }

    #[test]
    fn extreme_knobs_saturate() {
        let knobs = SpinKnobs {
            poverty: i32::MAX - 5,
            bonus: i32::MAX,
            penalty: i32::MIN,
            ..SpinKnobs::default()
        };
        assert_eq!(adjust_up(&knobs, 0), knobs.limit);
        assert_eq!(adjust_down(&knobs, 1000), knobs.limit);
    }

    #[test]
    fn disabled_knobs_never_spin() {
        let controller = SpinController::new(SpinKnobs::disabled());
        controller.on_success();
        assert_eq!(controller.duration(), 0);
        controller.on_failure();
        assert_eq!(controller.duration(), 0);
    }

    #[test]
    fn random_outcomes_stay_in_bounds() {
        let mut rng = rand::rng();
        for _ in 0..64 {
            let knobs = SpinKnobs {
                limit: rng.random_range(0..10_000),
                pre_spin: 0,
                bonus: rng.random_range(0..500),
                penalty: rng.random_range(0..500),
                poverty: rng.random_range(0..12_000),
                fixed_spin: 0,
            };
            let controller = SpinController::new(knobs);
            for _ in 0..1000 {
                if rng.random_bool(0.5) {
                    controller.on_success();
                } else {
                    controller.on_failure();
                }
                let d = controller.duration();
                assert!(
                    (0..=knobs.limit).contains(&d),
                    "{d} escaped [0, {}]",
                    knobs.limit
                );
            }
        }
    }
}

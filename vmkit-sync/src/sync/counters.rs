//! Process-wide monitor statistics.

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};

pub struct MonitorCounters {
    pub contended_lock_attempts: AtomicU64,
    pub futile_wakeups: AtomicU64,
    pub parks: AtomicU64,
    pub notifications: AtomicU64,
    pub inflations: AtomicU64,
    pub deflations: AtomicU64,
    pub usage_errors: AtomicU64,
    /// Monitors currently alive (created minus destroyed).
    pub extant: AtomicI64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CounterSnapshot {
    pub contended_lock_attempts: u64,
    pub futile_wakeups: u64,
    pub parks: u64,
    pub notifications: u64,
    pub inflations: u64,
    pub deflations: u64,
    pub usage_errors: u64,
    pub extant: i64,
}

static COUNTERS: MonitorCounters = MonitorCounters {
    contended_lock_attempts: AtomicU64::new(0),
    futile_wakeups: AtomicU64::new(0),
    parks: AtomicU64::new(0),
    notifications: AtomicU64::new(0),
    inflations: AtomicU64::new(0),
    deflations: AtomicU64::new(0),
    usage_errors: AtomicU64::new(0),
    extant: AtomicI64::new(0),
};

impl MonitorCounters {
    pub fn global() -> &'static MonitorCounters {
        &COUNTERS
    }

    #[inline]
    pub(crate) fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> CounterSnapshot {
        CounterSnapshot {
            contended_lock_attempts: self.contended_lock_attempts.load(Ordering::Relaxed),
            futile_wakeups: self.futile_wakeups.load(Ordering::Relaxed),
            parks: self.parks.load(Ordering::Relaxed),
            notifications: self.notifications.load(Ordering::Relaxed),
            inflations: self.inflations.load(Ordering::Relaxed),
            deflations: self.deflations.load(Ordering::Relaxed),
            usage_errors: self.usage_errors.load(Ordering::Relaxed),
            extant: self.extant.load(Ordering::Relaxed),
        }
    }
}

/// Per-monitor counts, readable through [`ObjectMonitor::stats`](super::ObjectMonitor::stats).
#[derive(Default)]
pub struct MonitorStats {
    pub(crate) contended_enters: AtomicU64,
    pub(crate) futile_wakeups: AtomicU64,
    pub(crate) waits: AtomicU64,
    pub(crate) notifications: AtomicU64,
    pub(crate) spin_successes: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MonitorStatsSnapshot {
    pub contended_enters: u64,
    pub futile_wakeups: u64,
    pub waits: u64,
    pub notifications: u64,
    pub spin_successes: u64,
}

impl MonitorStats {
    pub fn snapshot(&self) -> MonitorStatsSnapshot {
        MonitorStatsSnapshot {
            contended_enters: self.contended_enters.load(Ordering::Relaxed),
            futile_wakeups: self.futile_wakeups.load(Ordering::Relaxed),
            waits: self.waits.load(Ordering::Relaxed),
            notifications: self.notifications.load(Ordering::Relaxed),
            spin_successes: self.spin_successes.load(Ordering::Relaxed),
        }
    }
}

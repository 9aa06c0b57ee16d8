//! Object to monitor mapping.
//!
//! Every object that was ever locked through the [`ObjectSynchronizer`] has
//! an [`ObjectMonitor`] in its table until the monitor is deflated. Because a
//! monitor can be deflated between lookup and use, every operation that
//! enters a monitor re-resolves and retries when it finds a deflated one.

use std::{
    io,
    sync::{
        atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering},
        Arc, LazyLock,
    },
    thread::JoinHandle,
    time::{Duration, Instant},
};

use dashmap::{mapref::entry::Entry, DashMap};
use parking_lot::Mutex;

use crate::{
    errors::{SyncError, SyncResult},
    options::MonitorConfig,
    sync::{
        counters::MonitorCounters,
        object_monitor::{EnterResult, ObjectMonitor, ObjectRef, WaitResult},
        owner::OwnerId,
        RawMonitor,
    },
    threading::{Thread, ThreadManager},
};

fn object_key(object: &ObjectRef) -> usize {
    Arc::as_ptr(object) as *const () as usize
}

pub struct ObjectSynchronizer {
    monitors: DashMap<usize, Arc<ObjectMonitor>>,
    config: MonitorConfig,
    in_use_max: AtomicUsize,
    /// Ceiling raised after repeated sweeps without progress. 0 until then.
    ceiling_override: AtomicUsize,
    deflation_requested: AtomicBool,
    last_deflation: Mutex<Instant>,
    no_progress_count: AtomicU32,
    no_progress_skip_increment: AtomicBool,
    deflation_lock: RawMonitor<()>,
}

static SYNCHRONIZER: LazyLock<Arc<ObjectSynchronizer>> =
    LazyLock::new(|| ObjectSynchronizer::new(MonitorConfig::from_options()));

impl ObjectSynchronizer {
    pub fn new(config: MonitorConfig) -> Arc<Self> {
        Arc::new(Self {
            monitors: DashMap::new(),
            config,
            in_use_max: AtomicUsize::new(0),
            ceiling_override: AtomicUsize::new(0),
            deflation_requested: AtomicBool::new(false),
            last_deflation: Mutex::new(Instant::now()),
            no_progress_count: AtomicU32::new(0),
            no_progress_skip_increment: AtomicBool::new(false),
            deflation_lock: RawMonitor::new(()),
        })
    }

    /// Process-wide synchronizer configured from [`OPTIONS`](crate::options::OPTIONS).
    pub fn global() -> &'static Arc<ObjectSynchronizer> {
        &SYNCHRONIZER
    }

    pub fn config(&self) -> &MonitorConfig {
        &self.config
    }

    /// The live monitor of `object`, creating one if needed.
    pub fn inflate(&self, object: &ObjectRef) -> Arc<ObjectMonitor> {
        let key = object_key(object);
        let monitor = match self.monitors.entry(key) {
            Entry::Occupied(mut entry) => {
                let current = entry.get();
                if current.refers_to(object) && !current.is_being_async_deflated() {
                    return current.clone();
                }
                // Deflated, or left behind by a dead object at the same address.
                let monitor = ObjectMonitor::new(object, self.config.spin);
                entry.insert(monitor.clone());
                monitor
            }
            Entry::Vacant(entry) => {
                let monitor = ObjectMonitor::new(object, self.config.spin);
                entry.insert(monitor.clone());
                monitor
            }
        };
        MonitorCounters::bump(&MonitorCounters::global().inflations);
        self.in_use_max
            .fetch_max(self.monitors.len(), Ordering::Relaxed);
        log::trace!("inflated {:p} for object {key:#x}", Arc::as_ptr(&monitor));
        monitor
    }

    /// The monitor of `object` if it has one. Does not inflate.
    pub fn monitor_of(&self, object: &ObjectRef) -> Option<Arc<ObjectMonitor>> {
        self.monitors
            .get(&object_key(object))
            .map(|m| m.value().clone())
            .filter(|m| m.refers_to(object))
    }

    pub fn in_use_count(&self) -> usize {
        self.monitors.len()
    }

    /// Lock `object`. Never returns [`EnterResult::Deflated`]; a mounted
    /// virtual thread may be [`EnterResult::Preempted`].
    pub fn enter(&self, object: &ObjectRef, current: &Arc<Thread>) -> EnterResult {
        loop {
            let monitor = self.inflate(object);
            match monitor.enter(current) {
                EnterResult::Deflated => continue,
                result => return result,
            }
        }
    }

    /// Lock `object`, blocking the carrier of a mounted virtual thread.
    pub fn enter_no_preempt(&self, object: &ObjectRef, current: &Arc<Thread>) {
        loop {
            let monitor = self.inflate(object);
            match monitor.enter_no_preempt(current) {
                EnterResult::Deflated => continue,
                result => {
                    debug_assert_eq!(result, EnterResult::Entered);
                    return;
                }
            }
        }
    }

    pub fn try_enter(&self, object: &ObjectRef, current: &Thread) -> bool {
        loop {
            let monitor = self.inflate(object);
            if monitor.try_enter(current, true) {
                return true;
            }
            if !monitor.is_being_async_deflated() {
                return false;
            }
        }
    }

    pub fn exit(&self, object: &ObjectRef, current: &Thread) {
        match self.monitor_of(object) {
            Some(monitor) => monitor.exit(current, true),
            None => {
                MonitorCounters::bump(&MonitorCounters::global().usage_errors);
                log::error!(
                    "thread {} is exiting an unlocked object {:#x}",
                    current.owner_id(),
                    object_key(object)
                );
            }
        }
    }

    fn owned_monitor_of(&self, object: &ObjectRef, current: &Thread) -> SyncResult<Arc<ObjectMonitor>> {
        self.monitor_of(object)
            .filter(|m| m.has_owner(current))
            .ok_or(SyncError::IllegalMonitorState("current thread is not owner"))
    }

    /// `millis == 0` waits without a timeout.
    pub fn wait(
        &self,
        object: &ObjectRef,
        current: &Arc<Thread>,
        millis: i64,
        interruptible: bool,
    ) -> SyncResult<WaitResult> {
        if millis < 0 {
            return Err(SyncError::IllegalArgument("timeout value is negative"));
        }
        self.owned_monitor_of(object, current)?
            .wait(current, millis as u64, interruptible)
    }

    /// [`wait`](Self::wait) for callers that cannot be unmounted: a mounted
    /// virtual thread blocks its carrier.
    pub fn wait_no_preempt(
        &self,
        object: &ObjectRef,
        current: &Arc<Thread>,
        millis: i64,
        interruptible: bool,
    ) -> SyncResult<WaitResult> {
        if millis < 0 {
            return Err(SyncError::IllegalArgument("timeout value is negative"));
        }
        self.owned_monitor_of(object, current)?
            .wait_no_preempt(current, millis as u64, interruptible)
    }

    pub fn notify(&self, object: &ObjectRef, current: &Thread) -> SyncResult<()> {
        self.owned_monitor_of(object, current)?.notify(current)
    }

    pub fn notify_all(&self, object: &ObjectRef, current: &Thread) -> SyncResult<usize> {
        self.owned_monitor_of(object, current)?.notify_all(current)
    }

    pub fn holds_lock(&self, object: &ObjectRef, thread: &Thread) -> bool {
        self.monitor_of(object).is_some_and(|m| m.has_owner(thread))
    }

    pub fn lock_owner(&self, object: &ObjectRef) -> Option<OwnerId> {
        self.monitor_of(object).and_then(|m| m.owner().thread())
    }

    pub fn monitors_iterate(&self, mut f: impl FnMut(&Arc<ObjectMonitor>)) {
        for entry in self.monitors.iter() {
            f(entry.value());
        }
    }

    pub fn owned_monitors(&self, thread: &Thread) -> Vec<Arc<ObjectMonitor>> {
        let mut owned = Vec::new();
        self.monitors_iterate(|m| {
            if m.has_owner(thread) {
                owned.push(m.clone());
            }
        });
        owned
    }

    /// Fully release every monitor `current` owns, e.g. before it detaches.
    /// Returns the number of monitors released.
    pub fn release_monitors_owned_by_thread(&self, current: &Thread) -> usize {
        let owned = self.owned_monitors(current);
        for monitor in &owned {
            let recursions = monitor.complete_exit(current);
            log::debug!(
                "released {:p} held by exiting thread {} ({} recursions)",
                Arc::as_ptr(monitor),
                current.owner_id(),
                recursions
            );
        }
        owned.len()
    }

    pub fn request_deflation(&self) {
        self.deflation_requested.store(true, Ordering::Release);
        self.notify_deflater();
    }

    fn notify_deflater(&self) {
        let lock = self.deflation_lock.lock_no_handshake();
        lock.notify_all();
    }

    fn in_use_list_ceiling(&self) -> usize {
        let estimate = self.config.deflation.avg_monitors_per_thread
            * ThreadManager::global().thread_count().max(1);
        estimate.max(self.ceiling_override.load(Ordering::Relaxed))
    }

    fn monitors_used_above_threshold(&self) -> bool {
        let knobs = &self.config.deflation;
        if knobs.used_threshold == 0 {
            return false;
        }
        let old_ceiling = self.in_use_list_ceiling();
        let mut ceiling = old_ceiling.max(self.in_use_max.load(Ordering::Relaxed));
        let used = self.monitors.len();
        if used == 0 {
            return false;
        }
        if knobs.no_progress_max != 0
            && self.no_progress_count.load(Ordering::Relaxed) >= knobs.no_progress_max
        {
            let remainder = (100.0 - knobs.used_threshold as f64) / 100.0;
            let new_ceiling = ceiling + (ceiling as f64 * remainder) as usize + 1;
            self.ceiling_override.store(new_ceiling, Ordering::Relaxed);
            log::info!(
                "too many deflations without progress; bumping in-use ceiling from {old_ceiling} to {new_ceiling}"
            );
            self.no_progress_count.store(0, Ordering::Relaxed);
            ceiling = new_ceiling;
        }

        let usage = used * 100 / ceiling.max(1);
        if usage > knobs.used_threshold as usize {
            log::info!(
                "monitors used: {used}, ceiling: {ceiling}, usage: {usage}%, threshold: {}%",
                knobs.used_threshold
            );
            return true;
        }
        false
    }

    pub fn is_async_deflation_needed(&self) -> bool {
        if self.deflation_requested.load(Ordering::Acquire) {
            log::info!("async deflation needed: explicit request");
            return true;
        }

        let knobs = &self.config.deflation;
        let since_last = self.last_deflation.lock().elapsed();

        if !knobs.interval.is_zero()
            && since_last > knobs.interval
            && self.monitors_used_above_threshold()
        {
            log::info!("async deflation needed: monitors used are above the threshold");
            return true;
        }

        if !knobs.guaranteed_interval.is_zero() && since_last > knobs.guaranteed_interval {
            log::info!(
                "async deflation needed: guaranteed interval ({:?}) elapsed since last deflation ({:?})",
                knobs.guaranteed_interval,
                since_last
            );
            // A sweep forced by the clock says nothing about the threshold heuristic.
            self.no_progress_skip_increment.store(true, Ordering::Relaxed);
            return true;
        }

        false
    }

    /// Deflate idle monitors and unlink them from the table. Returns the
    /// number of monitors deflated.
    pub fn deflate_idle_monitors(&self) -> usize {
        *self.last_deflation.lock() = Instant::now();
        self.deflation_requested.store(false, Ordering::Release);

        let started = Instant::now();
        // Snapshot first: deflation unlinks entries and must not hold shard locks.
        let candidates: Vec<(usize, Arc<ObjectMonitor>)> = self
            .monitors
            .iter()
            .map(|e| (*e.key(), e.value().clone()))
            .collect();

        let max = self.config.deflation.max_per_sweep;
        let mut deflated = 0;
        let mut unlinked = 0;
        for (key, monitor) in candidates {
            if deflated >= max {
                break;
            }
            if monitor.deflate_if_idle() {
                deflated += 1;
            } else if !monitor.is_being_async_deflated() {
                continue;
            }
            if self
                .monitors
                .remove_if(&key, |_, m| Arc::ptr_eq(m, &monitor))
                .is_some()
            {
                unlinked += 1;
            }
        }

        log::debug!(
            "deflated {deflated} and unlinked {unlinked} monitors in {:?}, {} in use",
            started.elapsed(),
            self.monitors.len()
        );

        if deflated != 0 {
            self.no_progress_count.store(0, Ordering::Relaxed);
        } else if !self.no_progress_skip_increment.swap(false, Ordering::Relaxed) {
            self.no_progress_count.fetch_add(1, Ordering::Relaxed);
        }

        deflated
    }
}

/// RAII guard holding an object's monitor. The carrier of a mounted virtual
/// thread is blocked rather than preempted.
pub struct ObjectLocker<'a> {
    synchronizer: &'a ObjectSynchronizer,
    object: &'a ObjectRef,
    thread: Arc<Thread>,
}

impl<'a> ObjectLocker<'a> {
    pub fn new(synchronizer: &'a ObjectSynchronizer, object: &'a ObjectRef, thread: Arc<Thread>) -> Self {
        synchronizer.enter_no_preempt(object, &thread);
        Self {
            synchronizer,
            object,
            thread,
        }
    }

    pub fn wait(&self, millis: i64) -> SyncResult<WaitResult> {
        self.synchronizer
            .wait_no_preempt(self.object, &self.thread, millis, true)
    }

    pub fn wait_uninterruptibly(&self, millis: i64) -> SyncResult<WaitResult> {
        self.synchronizer
            .wait_no_preempt(self.object, &self.thread, millis, false)
    }

    pub fn notify(&self) -> SyncResult<()> {
        self.synchronizer.notify(self.object, &self.thread)
    }

    pub fn notify_all(&self) -> SyncResult<usize> {
        self.synchronizer.notify_all(self.object, &self.thread)
    }
}

impl Drop for ObjectLocker<'_> {
    fn drop(&mut self) {
        self.synchronizer.exit(self.object, &self.thread);
    }
}

/// Background thread that sweeps idle monitors whenever
/// [`ObjectSynchronizer::is_async_deflation_needed`] says so.
pub struct DeflationThread {
    synchronizer: Arc<ObjectSynchronizer>,
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<Option<()>>>,
}

impl DeflationThread {
    pub fn start(synchronizer: Arc<ObjectSynchronizer>) -> io::Result<Self> {
        let stop = Arc::new(AtomicBool::new(false));
        let handle = {
            let synchronizer = synchronizer.clone();
            let stop = stop.clone();
            Thread::start_daemon("monitor-deflation", move || Self::run(&synchronizer, &stop))?
        };
        Ok(Self {
            synchronizer,
            stop,
            handle: Some(handle),
        })
    }

    fn poll_interval(synchronizer: &ObjectSynchronizer) -> Duration {
        let knobs = &synchronizer.config.deflation;
        [knobs.interval, knobs.guaranteed_interval]
            .into_iter()
            .filter(|d| !d.is_zero())
            .min()
            .unwrap_or(Duration::from_secs(1))
    }

    fn run(synchronizer: &ObjectSynchronizer, stop: &AtomicBool) {
        let interval = Self::poll_interval(synchronizer);
        log::debug!("monitor deflation thread started, polling every {interval:?}");
        loop {
            {
                let mut lock = synchronizer.deflation_lock.lock_with_handshake();
                while !stop.load(Ordering::Acquire) && !synchronizer.is_async_deflation_needed() {
                    lock = lock.wait_for_with_handshake(interval).0;
                }
            }
            if stop.load(Ordering::Acquire) {
                break;
            }
            synchronizer.deflate_idle_monitors();
        }
        log::debug!("monitor deflation thread stopped");
    }

    pub fn stop(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        self.stop.store(true, Ordering::Release);
        self.synchronizer.notify_deflater();
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                log::error!("monitor deflation thread panicked");
            }
        }
    }
}

impl Drop for DeflationThread {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn object() -> ObjectRef {
        Arc::new(0u64)
    }

    #[test]
    fn inflate_is_idempotent() {
        let sync = ObjectSynchronizer::new(MonitorConfig::default());
        let obj = object();
        let a = sync.inflate(&obj);
        let b = sync.inflate(&obj);
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(sync.in_use_count(), 1);
    }

    #[test]
    fn deflated_monitor_is_replaced() {
        let sync = ObjectSynchronizer::new(MonitorConfig::default());
        let obj = object();
        let first = sync.inflate(&obj);
        assert!(first.deflate_if_idle());
        let me = Thread::current();
        assert_eq!(sync.enter(&obj, &me), EnterResult::Entered);
        let second = sync.monitor_of(&obj).unwrap();
        assert!(!Arc::ptr_eq(&first, &second));
        assert!(sync.holds_lock(&obj, &me));
        assert_eq!(sync.lock_owner(&obj), Some(me.owner_id()));
        sync.exit(&obj, &me);
        assert_eq!(sync.lock_owner(&obj), None);
    }

    #[test]
    fn negative_timeout_is_rejected() {
        let sync = ObjectSynchronizer::new(MonitorConfig::default());
        let obj = object();
        let me = Thread::current();
        sync.enter_no_preempt(&obj, &me);
        assert_eq!(
            sync.wait(&obj, &me, -1, true),
            Err(SyncError::IllegalArgument("timeout value is negative"))
        );
        sync.exit(&obj, &me);
    }

    #[test]
    fn notify_without_lock_is_illegal() {
        let sync = ObjectSynchronizer::new(MonitorConfig::default());
        let obj = object();
        let me = Thread::current();
        assert!(matches!(
            sync.notify(&obj, &me),
            Err(SyncError::IllegalMonitorState(_))
        ));
        assert!(matches!(
            sync.wait(&obj, &me, 0, true),
            Err(SyncError::IllegalMonitorState(_))
        ));
    }

    #[test]
    fn sweep_deflates_only_idle_monitors() {
        let sync = ObjectSynchronizer::new(MonitorConfig::default());
        let me = Thread::current();
        let held = object();
        let idle = object();
        sync.enter_no_preempt(&held, &me);
        sync.inflate(&idle);
        assert_eq!(sync.deflate_idle_monitors(), 1);
        assert_eq!(sync.in_use_count(), 1);
        assert!(sync.monitor_of(&idle).is_none());
        assert!(sync.holds_lock(&held, &me));
        sync.exit(&held, &me);
        assert_eq!(sync.deflate_idle_monitors(), 1);
        assert_eq!(sync.in_use_count(), 0);
    }

    #[test]
    fn sweep_honors_max_per_sweep() {
        let mut config = MonitorConfig::default();
        config.deflation.max_per_sweep = 2;
        let sync = ObjectSynchronizer::new(config);
        let objects: Vec<ObjectRef> = (0..5).map(|_| object()).collect();
        for obj in &objects {
            sync.inflate(obj);
        }
        assert_eq!(sync.deflate_idle_monitors(), 2);
        assert_eq!(sync.in_use_count(), 3);
    }

    #[test]
    fn explicit_request_triggers_deflation() {
        let sync = ObjectSynchronizer::new(MonitorConfig::default());
        assert!(!sync.is_async_deflation_needed());
        sync.request_deflation();
        assert!(sync.is_async_deflation_needed());
        sync.deflate_idle_monitors();
        assert!(!sync.is_async_deflation_needed());
    }

    #[test]
    fn object_locker_releases_on_drop() {
        let sync = ObjectSynchronizer::new(MonitorConfig::default());
        let obj = object();
        let me = Thread::current();
        {
            let locker = ObjectLocker::new(&sync, &obj, me.clone());
            assert!(sync.holds_lock(&obj, &me));
            assert_eq!(locker.notify_all(), Ok(0));
            assert_eq!(locker.wait(1), Ok(WaitResult::TimedOut));
        }
        assert!(!sync.holds_lock(&obj, &me));
    }

    #[test]
    fn release_monitors_owned_by_thread_drops_all_recursions() {
        let sync = ObjectSynchronizer::new(MonitorConfig::default());
        let me = Thread::current();
        let a = object();
        let b = object();
        sync.enter_no_preempt(&a, &me);
        sync.enter_no_preempt(&a, &me);
        sync.enter_no_preempt(&b, &me);
        assert_eq!(sync.owned_monitors(&me).len(), 2);
        assert_eq!(sync.release_monitors_owned_by_thread(&me), 2);
        assert!(!sync.holds_lock(&a, &me));
        assert!(!sync.holds_lock(&b, &me));
    }
}

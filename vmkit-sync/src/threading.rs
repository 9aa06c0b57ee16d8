use std::{
    cell::{Cell, RefCell},
    io,
    panic::AssertUnwindSafe,
    sync::{
        atomic::{AtomicBool, AtomicI32, AtomicI64, AtomicIsize, AtomicUsize, Ordering},
        Arc, LazyLock, Weak,
    },
    thread::JoinHandle,
};

use atomic::Atomic;
use parking_lot::Mutex;

use crate::sync::{
    object_monitor::ObjectMonitor,
    owner::{OwnerId, FIRST_OWNER_ID},
    RawMonitor, RawMonitorGuard,
};

pub mod park;
pub mod vthread;

use park::ParkEvent;
use vthread::VirtualThread;

static NEXT_OWNER_ID: AtomicI64 = AtomicI64::new(FIRST_OWNER_ID);

/// Platform and virtual threads share one id space so that either can appear
/// in a monitor's owner word.
pub(crate) fn next_owner_id() -> OwnerId {
    NEXT_OWNER_ID.fetch_add(1, Ordering::Relaxed)
}

/// Threads use a state machine to indicate their current state and how they should
/// be treated in case of asynchronous requests like suspension or a global pause.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum ThreadState {
    /// Thread has not yet started.
    #[default]
    New,
    /// Thread is running and may touch monitor state.
    InVm,
    /// Thread is parked (or about to park) inside a blocking operation and
    /// will re-check for block requests before it runs again. Monitor
    /// slow paths run in this state while they spin and park.
    Parked,
    /// Thread is running but a block request is pending. It blocks at its next
    /// yieldpoint or when it leaves a parked section. Observe that it is always
    /// safe to conservatively change `InVm` to `InVmToBlock`.
    InVmToBlock,
    /// Thread is parked and is guaranteed to block before running again, until:
    ///
    /// 1. the block request is cleared, and
    /// 2. the thread gets a broadcast on its monitor.
    ///
    /// Observe that it is always safe to conservatively change `Parked` to `ParkedToBlock`.
    ParkedToBlock,
    /// Thread has died.
    Terminated,
}

impl ThreadState {
    pub fn not_running(&self) -> bool {
        matches!(self, ThreadState::New | ThreadState::Terminated)
    }
}

unsafe impl bytemuck::NoUninit for ThreadState {}

/// What a thread is doing with respect to object monitors. Diagnostic only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum ThreadStatus {
    #[default]
    Runnable,
    BlockedOnMonitorEnter,
    InObjectWait,
    InObjectWaitTimed,
    Terminated,
}

unsafe impl bytemuck::NoUninit for ThreadStatus {}

pub struct Thread {
    /// Should the next executed yieldpoint be taken? 0 means no. Any other
    /// value means the thread must call [`Thread::yieldpoint`] (or leave its
    /// parked section) before doing more work. Spinning threads poll this word
    /// and give up spinning when it is set.
    ///
    /// Setting it to 1 is always safe without a lock. Setting it to 0 is done
    /// by the thread itself once pending block requests have been handled.
    take_yieldpoint: AtomicI32,

    thread_id: OwnerId,
    /// Id written into a monitor's owner word: the mounted virtual thread's id
    /// or `thread_id` when nothing is mounted.
    monitor_owner_id: AtomicI64,
    name: Option<String>,
    exec_status: Atomic<ThreadState>,
    status: Atomic<ThreadStatus>,
    ignore_pauses: AtomicBool,
    /// Is the thread about to terminate? Protected by the thread's monitor.
    is_about_to_terminate: AtomicBool,
    /// Is this thread in the process of blocking?
    is_blocking: AtomicBool,
    index_in_manager: AtomicUsize,

    is_suspended: AtomicBool,
    should_suspend: AtomicBool,
    is_blocked_for_pause: AtomicBool,
    should_block_for_pause: AtomicBool,

    interrupted: AtomicBool,
    park_event: ParkEvent,
    mounted: Mutex<Option<Arc<VirtualThread>>>,
    pending_monitor: Mutex<Option<Weak<ObjectMonitor>>>,
    waiting_monitor: Mutex<Option<Weak<ObjectMonitor>>>,
    deferred_relocks: AtomicIsize,

    /// The monitor of the thread. Protects access to the thread's state.
    monitor: RawMonitor<()>,
    communication_lock: RawMonitor<()>,
}

impl Thread {
    fn new(name: Option<String>, ignore_pauses: bool) -> Arc<Self> {
        let thread_id = next_owner_id();
        Arc::new(Self {
            take_yieldpoint: AtomicI32::new(0),
            thread_id,
            monitor_owner_id: AtomicI64::new(thread_id),
            name,
            exec_status: Atomic::new(ThreadState::New),
            status: Atomic::new(ThreadStatus::Runnable),
            ignore_pauses: AtomicBool::new(ignore_pauses),
            is_about_to_terminate: AtomicBool::new(false),
            is_blocking: AtomicBool::new(false),
            index_in_manager: AtomicUsize::new(usize::MAX),
            is_suspended: AtomicBool::new(false),
            should_suspend: AtomicBool::new(false),
            is_blocked_for_pause: AtomicBool::new(false),
            should_block_for_pause: AtomicBool::new(false),
            interrupted: AtomicBool::new(false),
            park_event: ParkEvent::new(),
            mounted: Mutex::new(None),
            pending_monitor: Mutex::new(None),
            waiting_monitor: Mutex::new(None),
            deferred_relocks: AtomicIsize::new(0),
            monitor: RawMonitor::new(()),
            communication_lock: RawMonitor::new(()),
        })
    }

    /// Spawn a new OS thread that runs `f` as a registered [`Thread`].
    ///
    /// The join handle yields `None` if `f` panicked.
    pub fn start<F, R>(name: impl Into<String>, f: F) -> io::Result<JoinHandle<Option<R>>>
    where
        F: FnOnce() -> R + Send + 'static,
        R: Send + 'static,
    {
        Self::spawn(name.into(), false, f)
    }

    /// Like [`Thread::start`], for runtime-internal threads that must keep
    /// running while mutators are paused.
    pub(crate) fn start_daemon<F, R>(
        name: impl Into<String>,
        f: F,
    ) -> io::Result<JoinHandle<Option<R>>>
    where
        F: FnOnce() -> R + Send + 'static,
        R: Send + 'static,
    {
        Self::spawn(name.into(), true, f)
    }

    fn spawn<F, R>(name: String, ignore_pauses: bool, f: F) -> io::Result<JoinHandle<Option<R>>>
    where
        F: FnOnce() -> R + Send + 'static,
        R: Send + 'static,
    {
        let this = Self::new(Some(name.clone()), ignore_pauses);
        unsafe { this.set_exec_status(ThreadState::InVm) };
        std::thread::Builder::new()
            .name(name)
            .spawn(move || this.startoff(f))
    }

    fn startoff<F, R>(self: &Arc<Self>, f: F) -> Option<R>
    where
        F: FnOnce() -> R,
    {
        init_current_thread(self.clone(), false);
        ThreadManager::global().add_thread(self.clone());

        let result = std::panic::catch_unwind(AssertUnwindSafe(f));

        self.terminate();
        deinit_current_thread();
        result.ok()
    }

    /// Register the calling OS thread. Attached threads are detached
    /// automatically when the OS thread exits.
    pub fn attach_current() -> Arc<Thread> {
        if let Some(thread) = try_current_thread() {
            return thread;
        }
        let name = std::thread::current().name().map(str::to_owned);
        let this = Self::new(name, false);
        unsafe { this.set_exec_status(ThreadState::InVm) };
        init_current_thread(this.clone(), true);
        ThreadManager::global().add_thread(this.clone());
        this
    }

    fn terminate(&self) {
        let lock = self.monitor.lock_no_handshake();
        self.is_about_to_terminate.store(true, Ordering::Relaxed);
        unsafe { self.set_exec_status(ThreadState::Terminated) };
        self.status.store(ThreadStatus::Terminated, atomic::Ordering::Relaxed);
        self.monitor.notify_all();
        drop(lock);
        ThreadManager::global().remove_thread(self);
    }

    pub fn current() -> Arc<Thread> {
        current_thread()
    }

    pub fn id(&self) -> OwnerId {
        self.thread_id
    }

    /// The id this thread installs as a monitor owner. Equals the mounted
    /// virtual thread's id while one is mounted.
    #[inline]
    pub fn owner_id(&self) -> OwnerId {
        self.monitor_owner_id.load(Ordering::Relaxed)
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    pub fn park_event(&self) -> &ParkEvent {
        &self.park_event
    }

    pub fn get_exec_status(&self) -> ThreadState {
        self.exec_status.load(atomic::Ordering::Relaxed)
    }

    /// Set the execution status of the thread.
    ///
    /// # SAFETY
    ///
    /// Does not take the thread's monitor nor notify waiters of the change.
    /// Use this function only when you are holding [`monitor()`](Self::monitor) lock
    /// or the thread is not yet visible to others.
    pub unsafe fn set_exec_status(&self, status: ThreadState) {
        self.exec_status.store(status, atomic::Ordering::Relaxed);
    }

    /// # SAFETY
    ///
    /// See [`set_exec_status`](Self::set_exec_status).
    pub unsafe fn attempt_fast_exec_status_transition(
        &self,
        old_state: ThreadState,
        new_state: ThreadState,
    ) -> bool {
        self.exec_status
            .compare_exchange(
                old_state,
                new_state,
                atomic::Ordering::Relaxed,
                atomic::Ordering::Relaxed,
            )
            .is_ok()
    }

    pub fn status(&self) -> ThreadStatus {
        self.status.load(atomic::Ordering::Relaxed)
    }

    pub(crate) fn set_status(&self, status: ThreadStatus) {
        self.status.store(status, atomic::Ordering::Relaxed);
    }

    pub fn is_about_to_terminate(&self) -> bool {
        self.is_about_to_terminate.load(Ordering::Relaxed)
    }

    pub fn ignore_pauses(&self) -> bool {
        self.ignore_pauses.load(Ordering::Relaxed)
    }

    /// Should the next yieldpoint be taken? Non-zero while a block request is
    /// pending. Spinners poll this to bail out early.
    pub fn take_yieldpoint(&self) -> i32 {
        self.take_yieldpoint.load(Ordering::Relaxed)
    }

    pub fn set_take_yieldpoint(&self, value: i32) {
        self.take_yieldpoint.store(value, Ordering::Relaxed);
    }

    pub fn monitor(&self) -> &RawMonitor<()> {
        &self.monitor
    }

    pub fn communication_lock(&self) -> &RawMonitor<()> {
        &self.communication_lock
    }

    /// Check if the thread has block requests (suspension or pause).
    /// If it does, clear the requests and mark the thread as blocked for that request.
    /// If there were any block requests, do a notify_all() on the thread's monitor().
    ///
    /// The monitor() lock must be held.
    fn acknowledge_block_requests(&self) {
        let had_some = ThreadBlockAdapters::acknowledge_block_requests(self);
        if had_some {
            self.monitor.notify_all();
        }
    }

    /// Checks if the thread system has acknowledged that the thread is supposed
    /// to be blocked. Only call this method when already holding the monitor().
    pub fn is_blocked(&self) -> bool {
        ThreadBlockAdapters::is_blocked(self)
    }

    /// Is the thread running outside of any parked section? Only meaningful
    /// while holding the monitor().
    pub fn is_in_vm(&self) -> bool {
        !self.is_blocking.load(Ordering::Relaxed)
            && !self.is_about_to_terminate.load(Ordering::Relaxed)
            && (self.get_exec_status() == ThreadState::InVm
                || self.get_exec_status() == ThreadState::InVmToBlock)
    }

    /// Block while any block request is in force, then return to `InVm`.
    ///
    /// Called from [`Thread::yieldpoint`], from [`Thread::block_unchecked`]
    /// when a thread blocks itself, and when leaving a parked section after a
    /// block request arrived. The monitor() lock is taken and may be released
    /// while waiting, so callers must not rely on atomicity across this call.
    pub fn check_block(&self) {
        let mut lock = self.monitor().lock_no_handshake();
        self.is_blocking.store(true, Ordering::Relaxed);

        loop {
            self.acknowledge_block_requests();
            if !self.is_blocked() {
                break;
            }
            // A pause request that arrives while we are suspended wakes us up;
            // we re-loop and acknowledge it.
            lock.wait_no_handshake();
        }

        unsafe {
            self.set_exec_status(ThreadState::InVm);
        }
        self.take_yieldpoint.store(0, Ordering::Relaxed);
        self.is_blocking.store(false, Ordering::Relaxed);
        drop(lock);
    }

    fn enter_parked_blocked(&self) {
        let lock = self.monitor.lock_no_handshake();

        unsafe {
            self.set_exec_status(ThreadState::ParkedToBlock);
        }

        self.acknowledge_block_requests();

        drop(lock);
    }

    fn set_blocked_exec_status(&self) -> ThreadState {
        let mut old_state;
        loop {
            old_state = self.get_exec_status();
            let new_state = match old_state {
                ThreadState::InVm => ThreadState::InVmToBlock,
                ThreadState::Parked => ThreadState::ParkedToBlock,
                _ => old_state,
            };

            if unsafe { self.attempt_fast_exec_status_transition(old_state, new_state) } {
                break new_state;
            }
        }
    }

    /// Attempts to block the thread, and returns the state it is in after the attempt.
    ///
    /// If we're blocking ourselves, this returns once every block request is
    /// cleared again. If the thread signals its intention to die while we are
    /// trying to block it, this returns `Terminated`.
    ///
    /// # Warning
    /// Waiting for another thread to stop (`asynchronous=false`) is not
    /// interruptible: if two threads block each other this way they deadlock.
    /// Use [`block`](Self::block) or [`async_block`](Self::async_block) which pair
    /// the communication locks first.
    pub fn block_unchecked<A: BlockAdapter>(&self, asynchronous: bool) -> ThreadState {
        let mut result;

        let mut lock = self.monitor.lock_no_handshake();
        let token = A::request_block(self);

        if try_current_thread().is_some_and(|t| t.thread_id == self.thread_id) {
            drop(lock);
            self.check_block();
            return self.get_exec_status();
        }

        if self.is_about_to_terminate() {
            result = ThreadState::Terminated;
        } else {
            self.take_yieldpoint.store(1, Ordering::Relaxed);
            let new_state = self.set_blocked_exec_status();
            result = new_state;

            self.monitor.notify_all();

            if new_state == ThreadState::InVmToBlock {
                if !asynchronous {
                    while A::has_block_request_with_token(self, token)
                        && !A::is_blocked(self)
                        && !self.is_about_to_terminate()
                    {
                        lock.wait_no_handshake();
                    }

                    if self.is_about_to_terminate() {
                        result = ThreadState::Terminated;
                    } else {
                        result = self.get_exec_status();
                    }
                }
            } else if new_state == ThreadState::ParkedToBlock {
                A::clear_block_request(self);
                A::set_blocked(self, true);
            }
        }
        drop(lock);
        result
    }

    pub fn begin_pair_with<'a>(
        &'a self,
        other: &'a Thread,
    ) -> (RawMonitorGuard<'a, ()>, RawMonitorGuard<'a, ()>) {
        let guard1 = self.communication_lock.lock_no_handshake();
        let guard2 = other.communication_lock.lock_no_handshake();
        (guard1, guard2)
    }

    fn safe_block_impl<A: BlockAdapter>(&self, asynchronous: bool) -> ThreadState {
        let current = current_thread();
        let (guard1, guard2) = self.begin_pair_with(&current);
        // SAFETY: threads are paired, no deadlock can occur.
        let result = self.block_unchecked::<A>(asynchronous);
        drop(guard2);
        drop(guard1);
        result
    }

    /// Blocks the thread and waits until it acknowledged the request.
    pub fn block<A: BlockAdapter>(&self) -> ThreadState {
        self.safe_block_impl::<A>(false)
    }

    /// Requests the thread to block without waiting for it.
    pub fn async_block<A: BlockAdapter>(&self) -> ThreadState {
        self.safe_block_impl::<A>(true)
    }

    pub fn is_blocked_for<A: BlockAdapter>(&self) -> bool {
        A::is_blocked(self)
    }

    pub fn unblock<A: BlockAdapter>(&self) {
        let lock = self.monitor.lock_no_handshake();
        A::clear_block_request(self);
        A::set_blocked(self, false);
        self.monitor.notify_all();
        drop(lock);
    }

    /// Ask the thread to suspend itself. The thread stops at its next
    /// yieldpoint or, if it is parked, before it runs again.
    pub fn suspend(&self) -> ThreadState {
        self.async_block::<SuspendBlockAdapter>()
    }

    pub fn resume(&self) {
        self.unblock::<SuspendBlockAdapter>();
    }

    pub fn is_suspended(&self) -> bool {
        SuspendBlockAdapter::is_blocked(self) || SuspendBlockAdapter::has_block_request(self)
    }

    /// Poll for block requests. Mutator code that runs for a long time
    /// without touching monitors should call this periodically.
    pub fn yieldpoint(&self) {
        if self.take_yieldpoint() != 0 {
            self.take_yieldpoint.store(0, Ordering::Relaxed);
            self.check_block();
        }
    }

    fn enter_parked_state(&self) {
        let mut old_state;
        loop {
            old_state = self.get_exec_status();
            if old_state != ThreadState::InVm {
                self.enter_parked_blocked();
                return;
            }

            if unsafe { self.attempt_fast_exec_status_transition(old_state, ThreadState::Parked) }
            {
                break;
            }
        }
    }

    fn attempt_leave_parked_state(&self) -> bool {
        unsafe { self.attempt_fast_exec_status_transition(ThreadState::Parked, ThreadState::InVm) }
    }

    /// Mark the current thread as parked.
    pub fn enter_parked() {
        current_thread().enter_parked_state();
    }

    #[must_use = "If thread can't leave the parked state without blocking, call [leave_parked](Thread::leave_parked) instead"]
    pub fn attempt_leave_parked_no_block() -> bool {
        current_thread().attempt_leave_parked_state()
    }

    pub fn leave_parked() {
        let t = current_thread();
        if !t.attempt_leave_parked_state() {
            t.check_block();
        }
    }

    /// Run `f` (which may spin and park) in the parked state.
    ///
    /// When the thread leaves the parked state and finds a block request
    /// pending, `on_block` runs first and the thread then blocks until the
    /// request is lifted. Monitor code uses `on_block` to give up a monitor it
    /// just acquired, or to stop being the designated successor, before it is
    /// suspended.
    pub fn block_in_vm<R>(&self, f: impl FnOnce() -> R, on_block: impl FnOnce(&Thread)) -> R {
        debug_assert!(
            try_current_thread().is_some_and(|t| t.thread_id == self.thread_id),
            "block_in_vm must run on the thread itself"
        );
        self.enter_parked_state();
        let result = f();
        if !self.attempt_leave_parked_state() {
            on_block(self);
            self.check_block();
        }
        result
    }

    /// Set the interrupt flag and wake the thread if it is parked. While a
    /// virtual thread is mounted the flag belongs to that virtual thread.
    pub fn interrupt(&self) {
        match self.mounted_vthread() {
            Some(vthread) => vthread.interrupt(),
            None => {
                self.interrupted.store(true, Ordering::SeqCst);
                self.park_event.unpark();
            }
        }
    }

    pub fn is_interrupted(&self, clear: bool) -> bool {
        if let Some(vthread) = self.mounted_vthread() {
            return vthread.is_interrupted(clear);
        }
        if clear {
            self.interrupted.swap(false, Ordering::SeqCst)
        } else {
            self.interrupted.load(Ordering::SeqCst)
        }
    }

    pub fn mount(self: &Arc<Self>, vthread: Arc<VirtualThread>) {
        let mut mounted = self.mounted.lock();
        assert!(mounted.is_none(), "carrier {} already has a mounted virtual thread", self.thread_id);
        self.monitor_owner_id.store(vthread.id(), Ordering::Relaxed);
        vthread.set_carrier(Some(self.clone()));
        *mounted = Some(vthread);
    }

    pub fn unmount(&self) -> Option<Arc<VirtualThread>> {
        let vthread = self.mounted.lock().take()?;
        vthread.set_carrier(None);
        self.monitor_owner_id.store(self.thread_id, Ordering::Relaxed);
        Some(vthread)
    }

    pub fn mounted_vthread(&self) -> Option<Arc<VirtualThread>> {
        self.mounted.lock().clone()
    }

    pub(crate) fn set_current_pending_monitor(&self, monitor: Option<Weak<ObjectMonitor>>) {
        *self.pending_monitor.lock() = monitor;
    }

    /// The monitor this thread is blocked entering, if any.
    pub fn current_pending_monitor(&self) -> Option<Arc<ObjectMonitor>> {
        self.pending_monitor.lock().as_ref().and_then(Weak::upgrade)
    }

    pub(crate) fn set_current_waiting_monitor(&self, monitor: Option<Weak<ObjectMonitor>>) {
        *self.waiting_monitor.lock() = monitor;
    }

    /// The monitor this thread is waiting on, if any.
    pub fn current_waiting_monitor(&self) -> Option<Arc<ObjectMonitor>> {
        self.waiting_monitor.lock().as_ref().and_then(Weak::upgrade)
    }

    /// Record `count` recursive entries to be applied to the monitor this
    /// thread re-acquires at the end of its current wait.
    pub fn defer_relock(&self, count: isize) {
        self.deferred_relocks.fetch_add(count, Ordering::Relaxed);
    }

    pub(crate) fn take_deferred_relocks(&self) -> isize {
        self.deferred_relocks.swap(0, Ordering::Relaxed)
    }
}

impl std::fmt::Debug for Thread {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Thread")
            .field("id", &self.thread_id)
            .field("owner_id", &self.owner_id())
            .field("name", &self.name)
            .field("exec_status", &self.get_exec_status())
            .field("status", &self.status())
            .finish()
    }
}

struct CurrentThread {
    thread: RefCell<Option<Arc<Thread>>>,
    attached: Cell<bool>,
}

impl Drop for CurrentThread {
    fn drop(&mut self) {
        if self.attached.get() {
            if let Some(thread) = self.thread.get_mut().take() {
                thread.terminate();
            }
        }
    }
}

thread_local! {
    static CURRENT_THREAD: CurrentThread = const {
        CurrentThread {
            thread: RefCell::new(None),
            attached: Cell::new(false),
        }
    };
}

/// The current [`Thread`], attaching the calling OS thread on first use.
pub fn current_thread() -> Arc<Thread> {
    try_current_thread().unwrap_or_else(Thread::attach_current)
}

pub fn try_current_thread() -> Option<Arc<Thread>> {
    CURRENT_THREAD
        .try_with(|t| t.thread.borrow().clone())
        .ok()
        .flatten()
}

fn init_current_thread(thread: Arc<Thread>, attached: bool) {
    CURRENT_THREAD.with(|t| {
        *t.thread.borrow_mut() = Some(thread);
        t.attached.set(attached);
    });
}

fn deinit_current_thread() {
    let _ = CURRENT_THREAD.try_with(|t| {
        t.thread.borrow_mut().take();
        t.attached.set(false);
    });
}

/// Registry of live platform threads.
pub struct ThreadManager {
    inner: RawMonitor<RefCell<ThreadManagerInner>>,
}

struct ThreadManagerInner {
    threads: Vec<Option<Arc<Thread>>>,
    free_thread_indices: Vec<usize>,
}

/// Point-in-time view of one thread, as produced by [`ThreadManager::snapshot`].
#[derive(Debug, Clone)]
pub struct ThreadSnapshot {
    pub id: OwnerId,
    pub owner_id: OwnerId,
    pub name: Option<String>,
    pub status: ThreadStatus,
    pub pending_monitor: Option<Arc<ObjectMonitor>>,
    pub waiting_monitor: Option<Arc<ObjectMonitor>>,
}

static THREAD_MANAGER: LazyLock<ThreadManager> = LazyLock::new(ThreadManager::new);

impl ThreadManager {
    fn new() -> Self {
        Self {
            inner: RawMonitor::new(RefCell::new(ThreadManagerInner {
                threads: Vec::new(),
                free_thread_indices: Vec::new(),
            })),
        }
    }

    pub fn global() -> &'static ThreadManager {
        &THREAD_MANAGER
    }

    fn add_thread(&self, thread: Arc<Thread>) {
        // No handshake: attaching threads are not registered yet.
        let inner = self.inner.lock_no_handshake();
        let mut inner = inner.borrow_mut();

        let idx = inner
            .free_thread_indices
            .pop()
            .unwrap_or(inner.threads.len());
        thread.index_in_manager.store(idx, Ordering::Relaxed);
        if idx >= inner.threads.len() {
            inner.threads.push(Some(thread));
        } else {
            inner.threads[idx] = Some(thread);
        }
    }

    fn remove_thread(&self, thread: &Thread) {
        let inner = self.inner.lock_no_handshake();
        let mut inner = inner.borrow_mut();
        let idx = thread.index_in_manager.swap(usize::MAX, Ordering::Relaxed);
        if idx < inner.threads.len() {
            inner.threads[idx] = None;
            inner.free_thread_indices.push(idx);
        }
    }

    pub fn threads(&self) -> impl Iterator<Item = Arc<Thread>> {
        let inner = self.inner.lock_no_handshake();
        let inner = inner.borrow();
        inner
            .threads
            .clone()
            .into_iter()
            .flat_map(|t| t.into_iter())
    }

    pub fn thread_count(&self) -> usize {
        let inner = self.inner.lock_no_handshake();
        let inner = inner.borrow();
        inner.threads.len() - inner.free_thread_indices.len()
    }

    /// Find the platform thread whose owner id is `owner`: either the thread
    /// itself or the carrier of the virtual thread with that id.
    pub fn owning_thread(&self, owner: OwnerId) -> Option<Arc<Thread>> {
        self.threads().find(|t| t.owner_id() == owner)
    }

    pub fn snapshot(&self) -> Vec<ThreadSnapshot> {
        self.threads()
            .map(|t| ThreadSnapshot {
                id: t.id(),
                owner_id: t.owner_id(),
                name: t.name.clone(),
                status: t.status(),
                pending_monitor: t.current_pending_monitor(),
                waiting_monitor: t.current_waiting_monitor(),
            })
            .collect()
    }

    /// Stop all threads except the caller and daemon threads. Threads parked
    /// in monitors count as stopped right away; running threads must reach a
    /// yieldpoint or a parked section.
    ///
    /// Fixpoint until there are no threads that we haven't blocked, to catch
    /// threads that are started while we are waiting.
    pub fn block_all_for_pause(&self) -> Vec<Arc<Thread>> {
        let me = try_current_thread().map(|t| t.id());
        let mut handshake_threads = Vec::with_capacity(4);
        loop {
            handshake_threads.extend(
                self.threads()
                    .filter(|t| Some(t.id()) != me && !t.ignore_pauses()),
            );

            handshake_threads.retain(|t| {
                let lock = t.monitor().lock_no_handshake();
                let done = t.is_blocked_for::<PauseBlockAdapter>()
                    || t.block_unchecked::<PauseBlockAdapter>(true).not_running();
                drop(lock);
                !done
            });

            if handshake_threads.is_empty() {
                break;
            }
            while let Some(thread) = handshake_threads.pop() {
                let lock = thread.monitor().lock_no_handshake();
                thread.block_unchecked::<PauseBlockAdapter>(false);
                drop(lock);
            }
        }

        self.threads()
            .filter(|t| t.is_blocked_for::<PauseBlockAdapter>())
            .collect()
    }

    pub fn unblock_all_for_pause(&self) {
        for thread in self.threads().filter(|t| !t.ignore_pauses()) {
            let lock = thread.monitor().lock_no_handshake();
            thread.unblock::<PauseBlockAdapter>();
            drop(lock);
        }
    }
}

pub trait BlockAdapter {
    type Token: Copy + PartialEq;
    fn is_blocked(thread: &Thread) -> bool;
    fn set_blocked(thread: &Thread, value: bool);

    fn request_block(thread: &Thread) -> Self::Token;
    fn has_block_request(thread: &Thread) -> bool;
    fn has_block_request_with_token(thread: &Thread, token: Self::Token) -> bool;
    fn clear_block_request(thread: &Thread);
}

/// Suspension requested through [`Thread::suspend`].
pub struct SuspendBlockAdapter;

impl BlockAdapter for SuspendBlockAdapter {
    type Token = bool;

    fn is_blocked(thread: &Thread) -> bool {
        thread.is_suspended.load(Ordering::Relaxed)
    }

    fn set_blocked(thread: &Thread, value: bool) {
        thread.is_suspended.store(value, Ordering::Relaxed);
    }

    fn request_block(thread: &Thread) -> Self::Token {
        thread.should_suspend.store(true, Ordering::Relaxed);
        true
    }

    fn has_block_request(thread: &Thread) -> bool {
        thread.should_suspend.load(Ordering::Relaxed)
    }

    fn has_block_request_with_token(thread: &Thread, token: Self::Token) -> bool {
        let _ = token;
        thread.should_suspend.load(Ordering::Relaxed)
    }

    fn clear_block_request(thread: &Thread) {
        thread.should_suspend.store(false, Ordering::Relaxed);
    }
}

/// Global pause requested through [`ThreadManager::block_all_for_pause`].
pub struct PauseBlockAdapter;

impl BlockAdapter for PauseBlockAdapter {
    type Token = bool;

    fn is_blocked(thread: &Thread) -> bool {
        thread.is_blocked_for_pause.load(Ordering::Relaxed)
    }

    fn set_blocked(thread: &Thread, value: bool) {
        thread.is_blocked_for_pause.store(value, Ordering::Relaxed);
    }

    fn request_block(thread: &Thread) -> Self::Token {
        thread.should_block_for_pause.store(true, Ordering::Relaxed);
        true
    }

    fn has_block_request(thread: &Thread) -> bool {
        thread.should_block_for_pause.load(Ordering::Relaxed)
    }

    fn has_block_request_with_token(thread: &Thread, token: Self::Token) -> bool {
        let _ = token;
        thread.should_block_for_pause.load(Ordering::Relaxed)
    }

    fn clear_block_request(thread: &Thread) {
        thread.should_block_for_pause.store(false, Ordering::Relaxed);
    }
}

pub trait BlockAdapterList: Sized {
    fn acknowledge_block_requests(thread: &Thread) -> bool;
    fn is_blocked(thread: &Thread) -> bool;
}

macro_rules! block_adapter_list {
    ($(($($t: ident),*))*) => {
        $(
            impl<$($t: BlockAdapter),*> BlockAdapterList for ($($t),*) {
                fn acknowledge_block_requests(thread: &Thread) -> bool {
                    let mut had_some = false;
                    $(
                        if $t::has_block_request(thread) {
                            $t::set_blocked(thread, true);
                            $t::clear_block_request(thread);
                            had_some = true;
                        }
                    )*

                    had_some
                }

                fn is_blocked(thread: &Thread) -> bool {
                    let mut is_blocked = false;

                    $(
                        is_blocked |= $t::is_blocked(thread);
                    )*

                    is_blocked
                }
            }
        )*
    };
}

block_adapter_list!((X0, X1)(X0, X1, X2));

type ThreadBlockAdapters = (SuspendBlockAdapter, PauseBlockAdapter);

/// Execute the given function in a parked scope.
///
/// The current thread is `Parked` while `f` runs and counts as stopped for
/// suspend and pause requests. `f` must not touch monitor state that a
/// paused world expects to be frozen.
pub fn parked_scope<R>(f: impl FnOnce() -> R) -> R {
    Thread::enter_parked();
    let result = f();
    Thread::leave_parked();
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn ids_start_above_sentinels() {
        let t = Thread::current();
        assert!(t.id() >= FIRST_OWNER_ID);
        assert_eq!(t.owner_id(), t.id());
        assert_eq!(t.get_exec_status(), ThreadState::InVm);
    }

    #[test]
    fn started_thread_is_registered_and_removed() {
        let (tx, rx) = flume::bounded::<OwnerId>(1);
        let (done_tx, done_rx) = flume::bounded::<()>(1);
        let handle = Thread::start("registered", move || {
            tx.send(Thread::current().id()).unwrap();
            done_rx.recv().unwrap();
        })
        .unwrap();
        let id = rx.recv().unwrap();
        assert!(ThreadManager::global().threads().any(|t| t.id() == id));
        assert_eq!(
            ThreadManager::global().owning_thread(id).map(|t| t.id()),
            Some(id)
        );
        done_tx.send(()).unwrap();
        handle.join().unwrap().unwrap();
        assert!(!ThreadManager::global().threads().any(|t| t.id() == id));
        assert!(ThreadManager::global().owning_thread(id).is_none());
    }

    #[test]
    fn interrupt_flag_and_clear() {
        let t = Thread::current();
        t.interrupt();
        assert!(t.is_interrupted(false));
        assert!(t.is_interrupted(true));
        assert!(!t.is_interrupted(false));
        // Interrupt left a permit behind.
        t.park_event().reset();
    }

    #[test]
    fn suspended_thread_stops_at_yieldpoint() {
        let (ready_tx, ready_rx) = flume::bounded::<Arc<Thread>>(1);
        let stop = Arc::new(AtomicBool::new(false));
        let passes = Arc::new(AtomicUsize::new(0));
        let handle = {
            let stop = stop.clone();
            let passes = passes.clone();
            Thread::start("yielding", move || {
                let me = Thread::current();
                ready_tx.send(me.clone()).unwrap();
                while !stop.load(Ordering::Relaxed) {
                    me.yieldpoint();
                    passes.fetch_add(1, Ordering::Relaxed);
                    std::thread::sleep(Duration::from_millis(1));
                }
            })
            .unwrap()
        };
        let target = ready_rx.recv().unwrap();
        target.block::<SuspendBlockAdapter>();
        assert!(target.is_suspended());
        std::thread::sleep(Duration::from_millis(5));
        let frozen = passes.load(Ordering::Relaxed);
        std::thread::sleep(Duration::from_millis(20));
        assert_eq!(passes.load(Ordering::Relaxed), frozen);
        stop.store(true, Ordering::Relaxed);
        target.resume();
        handle.join().unwrap().unwrap();
    }
}

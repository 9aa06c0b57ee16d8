//! Virtual threads: logical threads that run mounted on a carrier
//! [`Thread`] and can be unmounted while they are blocked on a monitor.
//!
//! The monitor side of preemption lives in `ObjectMonitor`. This module owns
//! the virtual thread's state machine and its trip through the scheduler:
//!
//! ```text
//! Running -> Preempting -> Blocking -> (unmount) -> Blocked -> Unblocked -> Resuming -> Running
//!                       \-> Wait/TimedWait -> (unmount) -> Waiting/TimedWaiting -> Unblocked | Blocked
//! ```
//!
//! A virtual thread is only ever handed to the [`VThreadScheduler`] after it
//! reached `Unblocked`, and the carrier that picks it up calls
//! [`VirtualThread::resume`].

use std::{
    cmp::Reverse,
    collections::BinaryHeap,
    sync::{
        atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering},
        Arc, LazyLock, Weak,
    },
    time::{Duration, Instant},
};

use atomic::Atomic;
use parking_lot::Mutex;

use super::{next_owner_id, Thread};
use crate::sync::{
    object_monitor::{ObjectMonitor, ResumeResult},
    owner::OwnerId,
    waiter::WaiterRef,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum VThreadState {
    #[default]
    New,
    Running,
    /// A monitor operation decided to unmount the thread.
    Preempting,
    /// Queued on an entry list, about to unmount.
    Blocking,
    /// Unmounted, waiting for a monitor exit to pick it.
    Blocked,
    /// In `wait()`, about to unmount.
    Wait,
    Waiting,
    TimedWait,
    TimedWaiting,
    /// Handed to the scheduler, waiting for a carrier.
    Unblocked,
    Resuming,
    Terminated,
}

unsafe impl bytemuck::NoUninit for VThreadState {}

/// Runs unblocked virtual threads. Implementations pick a carrier and call
/// [`VirtualThread::resume`] on it.
pub trait VThreadScheduler: Send + Sync {
    fn schedule(&self, vthread: Arc<VirtualThread>);
}

/// Scheduler that hands runnable virtual threads to whoever drains the
/// receiving end of a channel.
pub struct ChannelScheduler {
    sender: flume::Sender<Arc<VirtualThread>>,
}

impl ChannelScheduler {
    pub fn new() -> (Arc<Self>, flume::Receiver<Arc<VirtualThread>>) {
        let (sender, receiver) = flume::unbounded();
        (Arc::new(Self { sender }), receiver)
    }
}

impl VThreadScheduler for ChannelScheduler {
    fn schedule(&self, vthread: Arc<VirtualThread>) {
        if self.sender.send(vthread).is_err() {
            log::warn!("virtual thread scheduled after its scheduler shut down");
        }
    }
}

/// A monitor operation that a preempted virtual thread must finish when it
/// is resumed.
#[derive(Clone)]
pub struct PendingMonitorOp {
    pub monitor: Arc<ObjectMonitor>,
    pub node: WaiterRef,
}

pub struct VirtualThread {
    id: OwnerId,
    name: Option<String>,
    state: Atomic<VThreadState>,
    carrier: Mutex<Option<Weak<Thread>>>,
    pin_count: AtomicU32,
    interrupted: AtomicBool,
    interruptible_wait: AtomicBool,
    notified: AtomicBool,
    /// Set by a monitor exit that picked this thread while it was still
    /// on its way to `Blocked`.
    unblocked: AtomicBool,
    on_waiting_list: AtomicBool,
    timeout_millis: AtomicU64,
    /// Bumped on every resume so that timeouts of earlier waits are ignored.
    timer_seq: AtomicU64,
    pending: Mutex<Option<PendingMonitorOp>>,
    scheduler: Arc<dyn VThreadScheduler>,
}

/// Disables preemption while alive. See [`VirtualThread::pin`].
pub struct PinGuard<'a> {
    vthread: &'a VirtualThread,
}

impl Drop for PinGuard<'_> {
    fn drop(&mut self) {
        self.vthread.pin_count.fetch_sub(1, Ordering::Relaxed);
    }
}

impl VirtualThread {
    pub fn new(name: Option<String>, scheduler: Arc<dyn VThreadScheduler>) -> Arc<Self> {
        Arc::new(Self {
            id: next_owner_id(),
            name,
            state: Atomic::new(VThreadState::New),
            carrier: Mutex::new(None),
            pin_count: AtomicU32::new(0),
            interrupted: AtomicBool::new(false),
            interruptible_wait: AtomicBool::new(false),
            notified: AtomicBool::new(false),
            unblocked: AtomicBool::new(false),
            on_waiting_list: AtomicBool::new(false),
            timeout_millis: AtomicU64::new(0),
            timer_seq: AtomicU64::new(0),
            pending: Mutex::new(None),
            scheduler,
        })
    }

    pub fn id(&self) -> OwnerId {
        self.id
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    pub fn state(&self) -> VThreadState {
        self.state.load(atomic::Ordering::Acquire)
    }

    pub(crate) fn set_state(&self, state: VThreadState) {
        self.state.store(state, atomic::Ordering::Release);
    }

    fn compare_and_set_state(&self, old: VThreadState, new: VThreadState) -> bool {
        self.state
            .compare_exchange(old, new, atomic::Ordering::AcqRel, atomic::Ordering::Acquire)
            .is_ok()
    }

    pub fn carrier(&self) -> Option<Arc<Thread>> {
        self.carrier.lock().as_ref().and_then(Weak::upgrade)
    }

    pub(crate) fn set_carrier(&self, carrier: Option<Arc<Thread>>) {
        *self.carrier.lock() = carrier.as_ref().map(Arc::downgrade);
    }

    /// Pin the thread to its carrier. While pinned, monitor operations
    /// block the carrier instead of unmounting.
    pub fn pin(&self) -> PinGuard<'_> {
        self.pin_count.fetch_add(1, Ordering::Relaxed);
        PinGuard { vthread: self }
    }

    pub fn is_pinned(&self) -> bool {
        self.pin_count.load(Ordering::Relaxed) > 0
    }

    /// Claim the thread for preemption by a monitor operation.
    pub(crate) fn try_preempt(&self) -> bool {
        !self.is_pinned() && self.compare_and_set_state(VThreadState::Running, VThreadState::Preempting)
    }

    /// The monitor was acquired after all: keep running on the carrier.
    pub(crate) fn cancel_preemption(&self) {
        debug_assert!(matches!(
            self.state(),
            VThreadState::Preempting | VThreadState::Blocking
        ));
        self.set_state(VThreadState::Running);
    }

    pub fn interrupt(self: &Arc<Self>) {
        self.interrupted.store(true, Ordering::SeqCst);
        if let Some(carrier) = self.carrier() {
            // Pinned and parked on the carrier.
            carrier.park_event().unpark();
        }
        if self.interruptible_wait.load(Ordering::Acquire) {
            for waiting in [VThreadState::Waiting, VThreadState::TimedWaiting] {
                if self.compare_and_set_state(waiting, VThreadState::Unblocked) {
                    self.submit();
                    break;
                }
            }
        }
    }

    pub fn is_interrupted(&self, clear: bool) -> bool {
        if clear {
            self.interrupted.swap(false, Ordering::SeqCst)
        } else {
            self.interrupted.load(Ordering::SeqCst)
        }
    }

    pub(crate) fn interruptible_wait(&self) -> bool {
        self.interruptible_wait.load(Ordering::Acquire)
    }

    pub(crate) fn set_interruptible_wait(&self, value: bool) {
        self.interruptible_wait.store(value, Ordering::Release);
    }

    pub fn notified(&self) -> bool {
        self.notified.load(Ordering::Acquire)
    }

    pub(crate) fn set_notified(&self, value: bool) {
        self.notified.store(value, Ordering::Release);
    }

    /// Called by a notifier that moved this thread's node to an entry list.
    pub(crate) fn notify_unwait(&self) {
        for waiting in [VThreadState::Waiting, VThreadState::TimedWaiting] {
            if self.compare_and_set_state(waiting, VThreadState::Blocked) {
                return;
            }
        }
    }

    pub(crate) fn set_timeout(&self, millis: u64) {
        self.timeout_millis.store(millis, Ordering::Relaxed);
    }

    /// Mark the thread as handed to the [`Unparker`]. Returns `false` if it
    /// already is.
    pub(crate) fn set_on_waiting_list(&self) -> bool {
        !self.on_waiting_list.swap(true, Ordering::AcqRel)
    }

    fn clear_on_waiting_list(&self) {
        self.on_waiting_list.store(false, Ordering::Release);
    }

    pub fn pending_op(&self) -> Option<PendingMonitorOp> {
        self.pending.lock().clone()
    }

    pub(crate) fn set_pending_op(&self, op: PendingMonitorOp) {
        *self.pending.lock() = Some(op);
    }

    pub(crate) fn clear_pending_op(&self) {
        self.pending.lock().take();
    }

    fn submit(self: &Arc<Self>) {
        self.scheduler.schedule(self.clone());
    }

    /// A monitor exit picked this thread as successor.
    fn unblock(self: &Arc<Self>) {
        self.unblocked.store(true, Ordering::SeqCst);
        if self.compare_and_set_state(VThreadState::Blocked, VThreadState::Unblocked) {
            self.submit();
        }
    }

    fn timeout_expired(self: &Arc<Self>, seq: u64) -> TimeoutOutcome {
        if self.timer_seq.load(Ordering::Acquire) != seq {
            return TimeoutOutcome::Stale;
        }
        match self.state() {
            VThreadState::TimedWaiting => {
                if self.compare_and_set_state(VThreadState::TimedWaiting, VThreadState::Unblocked) {
                    self.submit();
                }
                TimeoutOutcome::Done
            }
            // Still unmounting: try again shortly.
            VThreadState::TimedWait => TimeoutOutcome::Retry,
            _ => TimeoutOutcome::Done,
        }
    }

    /// Start running a new virtual thread on `carrier`.
    pub fn start(self: &Arc<Self>, carrier: &Arc<Thread>) {
        assert!(
            self.compare_and_set_state(VThreadState::New, VThreadState::Running),
            "virtual thread {} started twice",
            self.id
        );
        carrier.mount(self.clone());
    }

    /// Unmount after a monitor operation returned `Preempted`.
    pub fn yield_preempted(self: &Arc<Self>, carrier: &Thread) {
        let unmounted = carrier.unmount();
        debug_assert!(unmounted.is_some_and(|v| Arc::ptr_eq(&v, self)));
        self.after_unmount();
    }

    /// Unmount a thread that ran to completion.
    pub fn terminate(self: &Arc<Self>, carrier: &Thread) {
        carrier.unmount();
        self.set_state(VThreadState::Terminated);
    }

    fn after_unmount(self: &Arc<Self>) {
        match self.state() {
            VThreadState::Blocking => {
                self.set_state(VThreadState::Blocked);
                // May have been picked by an exit while blocking.
                if self.unblocked.load(Ordering::SeqCst)
                    && self.compare_and_set_state(VThreadState::Blocked, VThreadState::Unblocked)
                {
                    self.submit();
                }
            }
            s @ (VThreadState::Wait | VThreadState::TimedWait) => {
                let new_state = if s == VThreadState::Wait {
                    VThreadState::Waiting
                } else {
                    let millis = self.timeout_millis.load(Ordering::Relaxed);
                    Unparker::global().schedule_timeout(
                        self.clone(),
                        self.timer_seq.load(Ordering::Acquire),
                        Instant::now() + Duration::from_millis(millis),
                    );
                    VThreadState::TimedWaiting
                };
                self.set_state(new_state);

                // May have been notified while in transition.
                if self.notified() && self.compare_and_set_state(new_state, VThreadState::Blocked) {
                    if self.unblocked.load(Ordering::SeqCst)
                        && self.compare_and_set_state(VThreadState::Blocked, VThreadState::Unblocked)
                    {
                        self.submit();
                    }
                    return;
                }

                if self.interruptible_wait()
                    && self.is_interrupted(false)
                    && self.compare_and_set_state(new_state, VThreadState::Unblocked)
                {
                    self.submit();
                }
            }
            s => panic!("virtual thread {} unmounted in state {s:?}", self.id),
        }
    }

    /// Continue a preempted monitor operation on `carrier`. The thread stays
    /// mounted unless the result is [`ResumeResult::Blocked`], in which case
    /// it was unmounted again and will be rescheduled later.
    pub fn resume(self: &Arc<Self>, carrier: &Arc<Thread>) -> ResumeResult {
        assert!(
            self.compare_and_set_state(VThreadState::Unblocked, VThreadState::Resuming),
            "resuming virtual thread {} in state {:?}",
            self.id,
            self.state()
        );
        self.timer_seq.fetch_add(1, Ordering::AcqRel);
        self.unblocked.store(false, Ordering::SeqCst);
        carrier.mount(self.clone());
        self.set_state(VThreadState::Running);

        let op = self.pending_op();
        let Some(op) = op else {
            panic!("resumed virtual thread {} has no pending monitor operation", self.id);
        };
        let result = op.monitor.resume_operation(carrier, self, op.node);
        if result == ResumeResult::Blocked {
            self.yield_preempted(carrier);
        }
        result
    }
}

impl std::fmt::Debug for VirtualThread {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VirtualThread")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("state", &self.state())
            .field("pinned", &self.is_pinned())
            .finish()
    }
}

enum TimeoutOutcome {
    Done,
    Stale,
    Retry,
}

enum UnparkerMessage {
    Unblock(Arc<VirtualThread>),
    Timeout(Timer),
}

struct Timer {
    deadline: Instant,
    seq: u64,
    vthread: Arc<VirtualThread>,
}

impl PartialEq for Timer {
    fn eq(&self, other: &Self) -> bool {
        self.deadline == other.deadline
    }
}

impl Eq for Timer {}

impl PartialOrd for Timer {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Timer {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.deadline.cmp(&other.deadline)
    }
}

const TIMEOUT_RETRY: Duration = Duration::from_millis(1);

/// Daemon that wakes unmounted virtual threads. A virtual thread has no OS
/// thread to unpark, so an exiting owner hands it here instead and the
/// daemon resubmits it to its scheduler. Timed waits expire here too.
pub struct Unparker {
    sender: flume::Sender<UnparkerMessage>,
}

static UNPARKER: LazyLock<Unparker> = LazyLock::new(Unparker::start);

impl Unparker {
    pub fn global() -> &'static Unparker {
        &UNPARKER
    }

    fn start() -> Self {
        let (sender, receiver) = flume::unbounded();
        if let Err(err) = Thread::start_daemon("vthread-unparker", move || Self::run(receiver)) {
            log::error!("failed to start the virtual thread unparker: {err}");
        }
        Self { sender }
    }

    fn send(&self, message: UnparkerMessage) {
        if self.sender.send(message).is_err() {
            log::error!("virtual thread unparker is not running");
        }
    }

    pub(crate) fn unblock(&self, vthread: Arc<VirtualThread>) {
        if vthread.set_on_waiting_list() {
            self.send(UnparkerMessage::Unblock(vthread));
        }
    }

    fn schedule_timeout(&self, vthread: Arc<VirtualThread>, seq: u64, deadline: Instant) {
        self.send(UnparkerMessage::Timeout(Timer {
            deadline,
            seq,
            vthread,
        }));
    }

    fn run(receiver: flume::Receiver<UnparkerMessage>) {
        let mut timers: BinaryHeap<Reverse<Timer>> = BinaryHeap::new();
        loop {
            let message = match timers.peek() {
                Some(Reverse(timer)) => receiver.recv_deadline(timer.deadline),
                None => receiver
                    .recv()
                    .map_err(|_| flume::RecvTimeoutError::Disconnected),
            };
            match message {
                Ok(UnparkerMessage::Unblock(vthread)) => {
                    vthread.clear_on_waiting_list();
                    vthread.unblock();
                }
                Ok(UnparkerMessage::Timeout(timer)) => timers.push(Reverse(timer)),
                Err(flume::RecvTimeoutError::Timeout) => {}
                Err(flume::RecvTimeoutError::Disconnected) => break,
            }

            let now = Instant::now();
            while timers.peek().is_some_and(|Reverse(t)| t.deadline <= now) {
                let Some(Reverse(mut timer)) = timers.pop() else {
                    break;
                };
                if let TimeoutOutcome::Retry = timer.vthread.timeout_expired(timer.seq) {
                    timer.deadline = now + TIMEOUT_RETRY;
                    timers.push(Reverse(timer));
                }
            }
        }
        log::debug!("virtual thread unparker exiting");
    }
}

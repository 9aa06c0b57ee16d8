//! Synchronization primitives.
//!
//! Two families live here. [`RawMonitor`] is the runtime's own lock and
//! condition variable, friendly to our thread system: it provides
//! `*_with_handshake` and `*_no_handshake` methods. The former tells the
//! thread system that the thread is blocked, so that suspension or a pause
//! can proceed while it waits; the latter does not, and should only be used
//! for short critical sections or by threads that must not be stopped.
//!
//! [`ObjectMonitor`] is the inflated lock of a managed object, with
//! recursion, `wait`/`notify`, adaptive spinning, asynchronous deflation and
//! support for unmounting virtual threads.
pub mod counters;
pub mod entry_list;
pub mod object_monitor;
pub mod owner;
pub mod raw_monitor;
pub mod spin;
pub mod spin_lock;
pub mod wait_set;
pub mod waiter;

pub use counters::{CounterSnapshot, MonitorCounters, MonitorStatsSnapshot};
pub use object_monitor::{EnterResult, ObjectMonitor, ObjectRef, ResumeResult, WaitResult};
pub use owner::{Owner, OwnerId};
pub use raw_monitor::*;

pub use super::threading::parked_scope;

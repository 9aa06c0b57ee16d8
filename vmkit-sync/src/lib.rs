//! Object monitors for managed runtimes.
//!
//! The crate provides the inflated lock behind every synchronized region and
//! every `wait`/`notify` call of a managed language:
//!
//! - [`sync::ObjectMonitor`]: mutual exclusion with recursion, an entry queue
//!   served in FIFO order, a FIFO wait set, adaptive spinning and two-phase
//!   asynchronous deflation.
//! - [`synchronizer::ObjectSynchronizer`]: the object to monitor table that
//!   inflates monitors on demand, retries on deflation and sweeps idle
//!   monitors from a background [`synchronizer::DeflationThread`].
//! - [`threading`]: the platform [`threading::Thread`] the monitors park and
//!   suspend, and [`threading::vthread::VirtualThread`]s that unmount from
//!   their carrier while blocked.
//!
//! Tuning lives in [`options`]; no logger is installed by the library.

pub mod errors;
pub mod options;
pub mod sync;
pub mod synchronizer;
pub mod threading;

pub mod prelude {
    pub use super::errors::{SyncError, SyncResult};
    pub use super::options::{MonitorConfig, SpinKnobs, OPTIONS};
    pub use super::sync::{EnterResult, ObjectMonitor, ObjectRef, Owner, ResumeResult, WaitResult};
    pub use super::synchronizer::{DeflationThread, ObjectLocker, ObjectSynchronizer};
    pub use super::threading::{
        vthread::{ChannelScheduler, VThreadScheduler, VThreadState, VirtualThread},
        Thread, ThreadManager,
    };
}

//! Owner word of an inflated monitor.
//!
//! The owner is stored as a single `i64` so that it can be compared and
//! swapped atomically. Two values are reserved: [`NO_OWNER`] and
//! [`DEFLATER_MARKER`]. Thread ids are handed out from [`FIRST_OWNER_ID`].

use std::sync::atomic::{AtomicI64, Ordering};

pub type OwnerId = i64;

pub const NO_OWNER: OwnerId = 0;
/// Installed by the deflater while it tries to retire the monitor.
pub const DEFLATER_MARKER: OwnerId = 2;
pub const FIRST_OWNER_ID: OwnerId = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Owner {
    Unowned,
    Deflating,
    OwnedBy(OwnerId),
}

impl Owner {
    pub const fn from_raw(raw: OwnerId) -> Self {
        match raw {
            NO_OWNER => Owner::Unowned,
            DEFLATER_MARKER => Owner::Deflating,
            id => Owner::OwnedBy(id),
        }
    }

    pub const fn to_raw(self) -> OwnerId {
        match self {
            Owner::Unowned => NO_OWNER,
            Owner::Deflating => DEFLATER_MARKER,
            Owner::OwnedBy(id) => id,
        }
    }

    pub const fn thread(self) -> Option<OwnerId> {
        match self {
            Owner::OwnedBy(id) => Some(id),
            _ => None,
        }
    }
}

pub struct OwnerCell(AtomicI64);

impl OwnerCell {
    pub const fn new() -> Self {
        Self(AtomicI64::new(NO_OWNER))
    }

    #[inline]
    pub fn raw(&self) -> OwnerId {
        self.0.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn get(&self) -> Owner {
        Owner::from_raw(self.raw())
    }

    /// Full-fence CAS. Returns the value observed before the exchange, which
    /// equals `old` exactly when the exchange happened.
    #[inline]
    pub fn try_set_from(&self, old: OwnerId, new: OwnerId) -> OwnerId {
        match self
            .0
            .compare_exchange(old, new, Ordering::SeqCst, Ordering::SeqCst)
        {
            Ok(prev) | Err(prev) => prev,
        }
    }

    /// Plain store for transitions the caller already owns.
    #[inline]
    pub fn set_from(&self, old: OwnerId, new: OwnerId) {
        debug_assert_eq!(self.raw(), old, "unexpected owner");
        self.0.store(new, Ordering::Relaxed);
    }

    /// Release store of [`NO_OWNER`], the last step of an exit.
    #[inline]
    pub fn release_clear(&self, old: OwnerId) {
        debug_assert_eq!(self.raw(), old, "releasing monitor not owned by {old}");
        self.0.store(NO_OWNER, Ordering::Release);
    }
}

impl Default for OwnerCell {
    fn default() -> Self {
        Self::new()
    }
}

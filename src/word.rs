//! The 32-bit lock word shared by every unit that can reach a lock.
//!
//! Layout (matches the kernel's robust-futex convention so exit-time repair works on it):
//!
//! ```text
//!  31        30          29 .. 0
//! [WAITERS][OWNER_DIED][ owner id ]
//! ```
//!
//! `0` is free with no waiters. Any nonzero owner id means held by that unit.

use std::sync::atomic::{AtomicU32, Ordering};

pub const FUTEX_WAITERS: u32 = libc::FUTEX_WAITERS;
pub const FUTEX_OWNER_DIED: u32 = libc::FUTEX_OWNER_DIED;
pub const FUTEX_TID_MASK: u32 = libc::FUTEX_TID_MASK;

/// Decoded view of a word value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockState {
    Free,
    Owned(u32),
    OwnedWithWaiters(u32),
    /// No owner bits but flags left behind: a dead owner's repaired word, or a
    /// waiter flag raised on a word that was released underneath it.
    Abandoned { waiters: bool, owner_died: bool },
}

impl LockState {
    pub fn decode(value: u32) -> Self {
        let owner = owner_of(value);
        let waiters = has_waiters(value);
        match (owner, waiters) {
            (0, _) if value == 0 => LockState::Free,
            (0, _) => LockState::Abandoned {
                waiters,
                owner_died: owner_died(value),
            },
            (id, false) => LockState::Owned(id),
            (id, true) => LockState::OwnedWithWaiters(id),
        }
    }
}

#[inline]
pub fn owner_of(value: u32) -> u32 {
    value & FUTEX_TID_MASK
}

#[inline]
pub fn has_waiters(value: u32) -> bool {
    value & FUTEX_WAITERS != 0
}

#[inline]
pub fn owner_died(value: u32) -> bool {
    value & FUTEX_OWNER_DIED != 0
}

#[repr(transparent)]
#[derive(Debug, Default)]
pub struct FutexWord(AtomicU32);

impl FutexWord {
    pub const fn new() -> Self {
        Self(AtomicU32::new(0))
    }

    #[inline]
    pub fn load(&self) -> u32 {
        self.0.load(Ordering::Acquire)
    }

    pub fn state(&self) -> LockState {
        LockState::decode(self.load())
    }

    /// CAS `0 -> id`. Only succeeds on an exactly free word.
    #[inline]
    pub fn try_claim(&self, id: u32) -> bool {
        self.0
            .compare_exchange(0, id & FUTEX_TID_MASK, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
    }

    /// CAS `observed -> value`. Used to take a word whose owner bits are clear but
    /// whose flags are not.
    #[inline]
    pub(crate) fn try_take_over(&self, observed: u32, value: u32) -> bool {
        self.0
            .compare_exchange(observed, value, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
    }

    /// Sets [`FUTEX_WAITERS`] and returns the value it was set on.
    #[inline]
    pub fn mark_waiting(&self) -> u32 {
        self.0.fetch_or(FUTEX_WAITERS, Ordering::Relaxed)
    }

    /// Stores `0` unconditionally and returns what was there.
    ///
    /// There is no ownership check: a caller passing someone else's id still
    /// clears the word. That is only logged.
    #[inline]
    pub fn release_and_clear(&self, expected_id: u32) -> u32 {
        let prev = self.0.swap(0, Ordering::Release);
        if owner_of(prev) != expected_id & FUTEX_TID_MASK {
            log::warn!(
                "futex word {:p} cleared by {} but owned by {} ({prev:#x})",
                self,
                expected_id,
                owner_of(prev)
            );
        }
        prev
    }

    /// Exit-time repair: if `dead_id` still owns the word, replace the owner bits with
    /// [`FUTEX_OWNER_DIED`] keeping the waiter flag. Returns the value it replaced.
    pub(crate) fn mark_owner_died(&self, dead_id: u32) -> Option<u32> {
        let dead_id = dead_id & FUTEX_TID_MASK;
        self.0
            .fetch_update(Ordering::Release, Ordering::Relaxed, |v| {
                (owner_of(v) == dead_id).then_some((v & FUTEX_WAITERS) | FUTEX_OWNER_DIED)
            })
            .ok()
    }

    pub(crate) fn as_atomic(&self) -> &AtomicU32 {
        &self.0
    }
}

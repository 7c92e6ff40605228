use std::{hint, marker::PhantomData, mem::ManuallyDrop, pin::Pin};

use crate::{
    error::{self, FutexError},
    futex::{self, WaitOutcome, sys},
    robust_list::{self, LockSite, RobustRegistry},
    word::{self, FUTEX_TID_MASK, FUTEX_WAITERS, FutexWord, LockState},
};

/// Spins on a held word before parking in the kernel.
pub const SPIN_LIMIT: u32 = 100;

/// How a lock was obtained.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Acquired {
    Clean,
    /// The previous owner died holding the lock; whatever it protects may be
    /// half-updated.
    OwnerDied,
}

/// Futex mutex whose word and robust-list site live in the same record.
///
/// The record is boxed so the address linked into a robust list survives moves
/// of the `FutexLock` itself.
///
/// Acquisition is not FIFO: any unit that finds the word free may take it, even
/// one that arrived after others went to sleep.
#[derive(Debug, Default)]
pub struct FutexLock {
    site: ManuallyDrop<Box<LockSite>>,
}

impl FutexLock {
    pub fn new() -> Self {
        Self {
            site: ManuallyDrop::new(Box::new(LockSite::new())),
        }
    }

    pub fn word(&self) -> &FutexWord {
        self.site.word()
    }

    pub fn state(&self) -> LockState {
        self.word().state()
    }

    pub fn is_locked(&self) -> bool {
        word::owner_of(self.word().load()) != 0
    }

    pub fn is_locked_by_me(&self) -> bool {
        word::owner_of(self.word().load()) == futex::tid() & FUTEX_TID_MASK
    }

    /// Locks as the calling thread, recording the lock in the thread's robust list.
    pub fn lock(&self) -> Result<FutexGuard<'_>, FutexError> {
        let id = futex::tid();
        let acquired = robust_list::with_current(|reg| unsafe { self.acquire(reg, id) })?;
        Ok(FutexGuard {
            lock: self,
            id,
            acquired,
            _not_send: PhantomData,
        })
    }

    pub fn try_lock(&self) -> Option<FutexGuard<'_>> {
        let id = futex::tid();
        robust_list::with_current(|reg| unsafe { self.try_acquire(reg, id) }).map(|acquired| {
            FutexGuard {
                lock: self,
                id,
                acquired,
                _not_send: PhantomData,
            }
        })
    }

    /// Blocks until the word is owned by `id`, then links this lock into `registry`.
    ///
    /// The site sits in the registry's pending slot from before the first claim
    /// attempt until it is linked, so death at any point in between is repaired.
    ///
    /// # Safety
    ///
    /// `registry` belongs to the calling unit, and this lock must not be dropped
    /// before the matching [`release`](Self::release).
    pub unsafe fn acquire(
        &self,
        registry: Pin<&RobustRegistry>,
        id: u32,
    ) -> Result<Acquired, FutexError> {
        let id = id & FUTEX_TID_MASK;
        debug_assert_ne!(id, 0, "owner id 0 means unlocked");
        let word = self.word();

        registry.set_pending(&self.site);
        if word.try_claim(id) {
            registry.link(&self.site);
            registry.clear_pending();
            return Ok(Acquired::Clean);
        }

        log::trace!("{id}: futex {:p} contended ({:#x})", word, word.load());
        match self.acquire_slow(word, id) {
            Ok(acquired) => {
                registry.link(&self.site);
                registry.clear_pending();
                Ok(acquired)
            }
            Err(e) => {
                registry.clear_pending();
                Err(e)
            }
        }
    }

    fn acquire_slow(&self, word: &FutexWord, id: u32) -> Result<Acquired, FutexError> {
        let mut spins = 0;
        let mut slept = false;
        loop {
            let observed = word.load();

            if word::owner_of(observed) == 0 {
                if let Some(acquired) = take_over(word, observed, id, slept) {
                    return Ok(acquired);
                }
                continue;
            }

            if spins < SPIN_LIMIT {
                spins += 1;
                hint::spin_loop();
                continue;
            }

            let expected = word.mark_waiting() | FUTEX_WAITERS;
            if word::owner_of(expected) == 0 {
                // released between the load and the flag
                continue;
            }
            slept = true;
            // Woken, ValueChanged and Interrupted all mean: look at the word again.
            let outcome: WaitOutcome = sys::wait(word, expected)?;
            log::trace!("{id}: futex {:p} wait returned {outcome:?}", word);
        }
    }

    /// Claims without blocking. Never enters the kernel.
    ///
    /// # Safety
    ///
    /// Same as [`acquire`](Self::acquire).
    pub unsafe fn try_acquire(
        &self,
        registry: Pin<&RobustRegistry>,
        id: u32,
    ) -> Option<Acquired> {
        let id = id & FUTEX_TID_MASK;
        let word = self.word();

        registry.set_pending(&self.site);
        let acquired = if word.try_claim(id) {
            Some(Acquired::Clean)
        } else {
            let observed = word.load();
            (word::owner_of(observed) == 0 && observed != 0)
                .then(|| take_over(word, observed, id, false))
                .flatten()
        };
        if acquired.is_some() {
            registry.link(&self.site);
        }
        registry.clear_pending();
        acquired
    }

    /// Unlinks from `registry`, clears the word, and wakes one waiter if the
    /// waiter flag was set. Returns how many units were woken.
    ///
    /// The word is cleared whoever `id` is; a non-owner releasing is only logged.
    ///
    /// # Safety
    ///
    /// `registry` is the one this lock was acquired into.
    pub unsafe fn release(
        &self,
        registry: Pin<&RobustRegistry>,
        id: u32,
    ) -> Result<u32, FutexError> {
        let word = self.word();

        registry.set_pending(&self.site);
        registry.unlink(&self.site);

        let prev = word.release_and_clear(id);
        let woken = if word::has_waiters(prev) {
            sys::wake(word, 1)
        } else {
            Ok(0)
        };

        registry.clear_pending();
        woken
    }
}

/// CAS an ownerless word to `id`. The waiter flag survives the takeover, and a
/// unit that has slept sets it because others may still be asleep behind it.
fn take_over(word: &FutexWord, observed: u32, id: u32, slept: bool) -> Option<Acquired> {
    let waiters = if slept { FUTEX_WAITERS } else { observed & FUTEX_WAITERS };
    if !word.try_take_over(observed, id | waiters) {
        return None;
    }
    if word::owner_died(observed) {
        log::warn!("{id}: took futex {:p} over from a dead owner", word);
        return Some(Acquired::OwnerDied);
    }
    Some(Acquired::Clean)
}

impl Drop for FutexLock {
    fn drop(&mut self) {
        let owner = word::owner_of(self.word().load());
        if owner != 0 {
            if owner != futex::tid() & FUTEX_TID_MASK {
                // Still linked in another unit's list; the kernel may write to it at exit.
                log::warn!(
                    "futex {:p} dropped while held by {owner}, leaking its site",
                    self.word()
                );
                return;
            }
            // forgotten guard on this thread
            robust_list::with_current(|reg| reg.unlink(&self.site));
        }
        unsafe { ManuallyDrop::drop(&mut self.site) };
    }
}

/// Held lock on the calling thread. Released on drop.
///
/// WARNING: forgetting a guard leaves the lock held until the thread exits, at
/// which point the kernel marks it owner-died.
#[must_use]
pub struct FutexGuard<'a> {
    lock: &'a FutexLock,
    id: u32,
    acquired: Acquired,
    // releasing unlinks from the locking thread's registry
    _not_send: PhantomData<*const ()>,
}

unsafe impl Sync for FutexGuard<'_> {}

impl<'a> FutexGuard<'a> {
    pub fn acquired(&self) -> Acquired {
        self.acquired
    }

    pub fn owner_died(&self) -> bool {
        self.acquired == Acquired::OwnerDied
    }

    /// Releases now and reports how many waiters were woken.
    pub fn unlock(self) -> Result<u32, FutexError> {
        let this = std::mem::ManuallyDrop::new(self);
        this.release()
    }

    fn release(&self) -> Result<u32, FutexError> {
        robust_list::with_current(|reg| unsafe { self.lock.release(reg, self.id) })
    }
}

impl Drop for FutexGuard<'_> {
    fn drop(&mut self) {
        if let Err(e) = self.release() {
            error::fatal(e);
        }
    }
}

impl<'a> std::ops::Deref for FutexGuard<'a> {
    type Target = FutexLock;
    fn deref(&self) -> &Self::Target {
        self.lock
    }
}

use std::{
    cell::UnsafeCell,
    fmt,
    ops::{Deref, DerefMut},
};

use crate::{
    error,
    mutex::{FutexGuard, FutexLock},
};

/// A value behind a [`FutexLock`].
///
/// If a thread dies holding the lock, the kernel repairs the word and the next
/// `lock` returns `Err(guard)`: the lock is yours, but the value may be whatever
/// the dead thread left half-written.
pub struct RobustMutex<T> {
    futex: FutexLock,
    data: UnsafeCell<T>,
}

unsafe impl<T: Send> Send for RobustMutex<T> {}
unsafe impl<T: Send> Sync for RobustMutex<T> {}

impl<T> RobustMutex<T> {
    pub fn new(value: T) -> Self {
        Self {
            futex: FutexLock::new(),
            data: UnsafeCell::new(value),
        }
    }

    /// Blocks until locked. `Err` carries the guard when the previous owner died.
    ///
    /// Panics if the futex syscall itself fails.
    pub fn lock(&self) -> Result<RobustGuard<'_, T>, RobustGuard<'_, T>> {
        let guard = self.futex.lock().unwrap_or_else(|e| error::fatal(e));
        self.wrap(guard)
    }

    /// Locks and ignores if the previous owner died or not
    pub fn grab(&self) -> RobustGuard<'_, T> {
        match self.lock() {
            Ok(guard) | Err(guard) => guard,
        }
    }

    pub fn try_lock(&self) -> Result<Option<RobustGuard<'_, T>>, RobustGuard<'_, T>> {
        match self.futex.try_lock() {
            Some(guard) => self.wrap(guard).map(Some),
            None => Ok(None),
        }
    }

    pub fn is_locked(&self) -> bool {
        self.futex.is_locked()
    }

    pub fn futex(&self) -> &FutexLock {
        &self.futex
    }

    pub fn into_inner(self) -> T {
        self.data.into_inner()
    }

    pub fn get_mut(&mut self) -> &mut T {
        self.data.get_mut()
    }

    fn wrap<'a>(
        &'a self,
        guard: FutexGuard<'a>,
    ) -> Result<RobustGuard<'a, T>, RobustGuard<'a, T>> {
        let owner_died = guard.owner_died();
        let guard = RobustGuard {
            data: &self.data,
            _futex: guard,
        };
        match owner_died {
            false => Ok(guard),
            true => Err(guard),
        }
    }
}

impl<T: Default> Default for RobustMutex<T> {
    fn default() -> Self {
        Self::new(T::default())
    }
}

impl<T: fmt::Debug> fmt::Debug for RobustMutex<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RobustMutex")
            .field("state", &self.futex.state())
            .finish_non_exhaustive()
    }
}

pub struct RobustGuard<'a, T> {
    data: &'a UnsafeCell<T>,
    _futex: FutexGuard<'a>,
}

impl<'a, T: fmt::Debug> fmt::Debug for RobustGuard<'a, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        <T as fmt::Debug>::fmt(self, f)
    }
}

unsafe impl<'a, T: Sync> Sync for RobustGuard<'a, T> {}

impl<T> Deref for RobustGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &Self::Target {
        unsafe { &*self.data.get() }
    }
}

impl<T> DerefMut for RobustGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        unsafe { &mut *self.data.get() }
    }
}

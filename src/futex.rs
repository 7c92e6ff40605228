//! futex.rs – raw Linux futex and robust-list syscalls.
//!
//! Everything here is the platform boundary: wait/wake on a word, robust-list
//! registration, and the calling thread's kernel TID.

use std::{cell::Cell, ptr, sync::Once};

use libc::{self, c_int, c_long, pid_t};
use nix::errno::Errno;

use crate::{
    error::{FutexError, FutexOp},
    robust_list::{self, RobustListHead},
    word::FutexWord,
};

/// How a `FUTEX_WAIT` returned. Only `Err` from [`sys::wait`] is fatal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
    Woken,
    /// The word no longer held the expected value when the kernel checked (`EAGAIN`).
    ValueChanged,
    /// A signal arrived while blocked (`EINTR`).
    Interrupted,
}

thread_local! {
    static MY_TID: Cell<pid_t> = const { Cell::new(0) };
}

#[inline]
fn gettid() -> pid_t {
    unsafe { libc::syscall(libc::SYS_gettid) as pid_t }
}

/// The calling thread's kernel TID, which is also its owner id in lock words.
///
/// The first call on a thread publishes the thread's robust registry so the kernel
/// repairs locks it still holds when it exits.
pub fn tid() -> u32 {
    static ONCE: Once = Once::new();

    // fast path
    if let Some(id) = MY_TID.try_with(|t| t.get()).ok().filter(|tid| *tid != 0) {
        return id as u32;
    }

    // slow initialisation
    let id = gettid();
    MY_TID.with(|t| t.set(id));

    if let Err(e) = robust_list::publish_current() {
        log::error!("thread {id}: robust list not published, exit-time repair disabled: {e}");
    }

    unsafe extern "C" fn atfork_child() {
        // The kernel drops robust-list registration across fork; force republish.
        MY_TID.with(|t| t.set(0));
    }
    ONCE.call_once(|| unsafe {
        libc::pthread_atfork(None, None, Some(atfork_child));
    });

    id as u32
}

// ---- raw futex syscall --------------------------------------------------------------------
unsafe fn futex_raw(
    uaddr: *const u32,
    op: c_int,
    val: c_int,
    val2: usize,
    uaddr2: *const u32,
    val3: c_int,
) -> nix::Result<c_long> {
    let ret = unsafe { libc::syscall(libc::SYS_futex, uaddr, op, val, val2, uaddr2, val3) };
    if ret == -1 {
        Err(Errno::last())
    } else {
        Ok(ret)
    }
}

pub mod sys {
    use super::*;

    /// Blocks while `word` still equals `expected`.
    pub fn wait(word: &FutexWord, expected: u32) -> Result<WaitOutcome, FutexError> {
        let res = unsafe {
            futex_raw(
                word.as_atomic().as_ptr(),
                libc::FUTEX_WAIT,
                expected as c_int,
                0,
                ptr::null(),
                0,
            )
        };
        match res {
            Ok(_) => Ok(WaitOutcome::Woken),
            Err(Errno::EAGAIN) => Ok(WaitOutcome::ValueChanged),
            Err(Errno::EINTR) => Ok(WaitOutcome::Interrupted),
            Err(e) => Err(FutexError::failed(FutexOp::Wait, e)),
        }
    }

    /// Wakes at most `n` units blocked on `word`; returns how many were woken.
    pub fn wake(word: &FutexWord, n: u32) -> Result<u32, FutexError> {
        unsafe {
            futex_raw(
                word.as_atomic().as_ptr(),
                libc::FUTEX_WAKE,
                n.min(i32::MAX as u32) as c_int,
                0,
                ptr::null(),
                0,
            )
        }
        .map(|v| v as u32)
        .map_err(|e| FutexError::failed(FutexOp::Wake, e))
    }

    /// # Safety
    ///
    /// `head` must stay valid and in place until the calling thread exits or
    /// registers another head.
    pub unsafe fn set_robust_list(head: *const RobustListHead) -> Result<(), FutexError> {
        let r = unsafe {
            libc::syscall(
                libc::SYS_set_robust_list,
                head,
                std::mem::size_of::<RobustListHead>(),
            )
        };
        match r {
            -1 => Err(FutexError::failed(FutexOp::SetRobustList, Errno::last())),
            _ => Ok(()),
        }
    }

    /// Head address and length registered for thread `tid` (0 = calling thread).
    pub fn get_robust_list(tid: pid_t) -> Result<(usize, usize), FutexError> {
        let mut head: *mut RobustListHead = ptr::null_mut();
        let mut len: usize = 0;
        let r = unsafe {
            libc::syscall(
                libc::SYS_get_robust_list,
                tid,
                &mut head as *mut *mut RobustListHead,
                &mut len as *mut usize,
            )
        };
        match r {
            -1 => Err(FutexError::failed(FutexOp::GetRobustList, Errno::last())),
            _ => Ok((head as usize, len)),
        }
    }
}

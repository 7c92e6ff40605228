use std::{fmt, io};

use nix::errno::Errno;

/// The kernel primitive a [`FutexError`] originated from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FutexOp {
    Wait,
    Wake,
    SetRobustList,
    GetRobustList,
}

impl FutexOp {
    pub fn as_str(&self) -> &'static str {
        match self {
            FutexOp::Wait => "FUTEX_WAIT",
            FutexOp::Wake => "FUTEX_WAKE",
            FutexOp::SetRobustList => "set_robust_list",
            FutexOp::GetRobustList => "get_robust_list",
        }
    }
}

/// A futex primitive failed outside the benign set (value changed, interrupted).
///
/// This means a bad address or argument reached the kernel. Nothing in this crate
/// retries it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FutexError {
    OperationFailed { op: FutexOp, errno: Errno },
}

impl FutexError {
    pub(crate) fn failed(op: FutexOp, errno: Errno) -> Self {
        FutexError::OperationFailed { op, errno }
    }

    pub fn op(&self) -> FutexOp {
        match self {
            FutexError::OperationFailed { op, .. } => *op,
        }
    }

    pub fn errno(&self) -> Errno {
        match self {
            FutexError::OperationFailed { errno, .. } => *errno,
        }
    }
}

impl fmt::Display for FutexError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FutexError::OperationFailed { op, errno } => {
                write!(f, "futex operation {} failed: {}", op.as_str(), errno)
            }
        }
    }
}

impl std::error::Error for FutexError {}

impl From<FutexError> for io::Error {
    fn from(e: FutexError) -> Self {
        io::Error::new(io::Error::from(e.errno()).kind(), e)
    }
}

/// Log and panic. Used where a fatal futex failure has no caller to return to.
#[track_caller]
pub(crate) fn fatal(e: FutexError) -> ! {
    log::error!("{e}");
    panic!("{e}")
}

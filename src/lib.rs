mod data;
pub mod error;
pub mod futex;
mod mutex;
pub mod robust_list;
#[cfg(test)]
mod test;
pub mod word;

pub use data::{RobustGuard, RobustMutex};
pub use error::{FutexError, FutexOp};
pub use mutex::{Acquired, FutexGuard, FutexLock, SPIN_LIMIT};
pub use robust_list::{LockSite, RobustRegistry, SiteEntry, Walk};
pub use word::{FutexWord, LockState};

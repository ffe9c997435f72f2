//! Asynchronous rotating file backend for `spool-logger`
//!
//! [`FileLog`] formats records on the calling thread and hands them to a
//! background write loop through a bounded [`LogBuffer`]. The loop appends
//! to the active file under an advisory [`LockFile`] so several processes
//! can share one set of logs, syncs after every batch, and rotates the set
//! once the active file reaches its size limit.
//!
//! Write loops run on a [`ThreadPool`] that is started on the first install
//! and stopped shortly after the last uninstall.
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

mod action;
mod allocator;
mod buffer;
mod builder;
mod config;
mod dispatcher;
mod error;
mod file_log;
pub mod format;
mod lock_file;
mod platform;
mod rotation;
mod writer;

pub use allocator::{Allocate, DEALLOCATION_DELAY, DerefHandle, SharedResourceAllocator};
pub use buffer::{Closed, LogBuffer, Obligation, Overflow};
pub use builder::FileLogBuilder;
pub use config::{
    DEFAULT_MAX_LOG_SIZE, DEFAULT_MAX_LOG_YIELD, DEFAULT_MAX_LOGS, Exhausted, FileLogConfig,
    LogFiles, MAX_MAX_LOGS, MIN_MAX_LOG_SIZE, MIN_MAX_LOGS, RetryPolicy,
};
pub use dispatcher::{DEFAULT_POOL_THREADS, ThreadPool};
pub use error::{Error, Result};
pub use file_log::{DOMAIN, FileLog};
pub use lock_file::memory::MemoryPlatform;
pub use lock_file::{
    FILE_LOCK_POS_LOG, FILE_LOCK_POS_ROTATE, FILE_LOCK_SIZE, FileLock, LockFile, RawLockFile,
};
pub use platform::{Platform, SystemPlatform};

//! Error types for file-based logging

use std::io;
use std::path::PathBuf;
use std::time::Duration;

/// Result type for file log operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error types that can occur during file logging
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Builder input was rejected.
    #[error("invalid configuration: {0}")]
    Validation(String),

    /// I/O error occurred
    #[error("{0}: {1}")]
    Io(&'static str, #[source] io::Error),

    /// Failed to create log directory
    #[error("failed to create log directory at {path}: {source}")]
    CreateDirectory {
        /// The path that failed to be created
        path: PathBuf,
        /// The underlying error
        source: io::Error,
    },

    /// The lock file backing a lock was closed.
    #[error("lock file is closed")]
    Closed,

    /// A requested byte range cannot be expressed to the OS.
    #[error("lock range overflow: position[{position}] + size[{size}]")]
    LockRange {
        /// Start of the range.
        position: u64,
        /// Length of the range.
        size: u64,
    },

    /// A blocking lock acquisition ran past its deadline.
    #[error("timed out after {0:?} waiting for file lock")]
    LockTimeout(Duration),

    /// The log directory resolves somewhere other than where it did at build time.
    #[error("symbolic link hijacking detected >> [{actual}] != [{expected}]")]
    SymlinkHijack {
        /// Canonical directory captured by the builder.
        expected: PathBuf,
        /// Canonical directory found at install.
        actual: PathBuf,
    },

    /// The background dispatcher could not be created.
    #[error("failed to allocate dispatcher: {0}")]
    Allocation(String),

    /// Facade error
    #[error(transparent)]
    Logger(#[from] spool_logger::Error),
}

impl Error {
    /// Whether the error is an expected, retryable lock contention outcome.
    #[must_use]
    pub const fn is_contention(&self) -> bool {
        matches!(self, Self::LockTimeout(_))
    }
}

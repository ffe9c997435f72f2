//! Validated settings of a [`crate::FileLog`]

use crate::buffer::Overflow;
use crate::dispatcher::ThreadPool;
use crate::platform::Platform;
use spool_logger::Level;
use std::collections::BTreeSet;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

/// Default for [`crate::FileLogBuilder::max_log_size`]: 10 MiB.
pub const DEFAULT_MAX_LOG_SIZE: u64 = 10 * 1024 * 1024;

/// Smallest accepted [`crate::FileLogBuilder::max_log_size`]: 50 KiB.
pub const MIN_MAX_LOG_SIZE: u64 = 50 * 1024;

/// Default for [`crate::FileLogBuilder::max_logs`].
pub const DEFAULT_MAX_LOGS: u8 = 5;

/// Smallest accepted [`crate::FileLogBuilder::max_logs`]: the active file
/// and one previous.
pub const MIN_MAX_LOGS: u8 = 2;

/// Largest accepted [`crate::FileLogBuilder::max_logs`].
pub const MAX_MAX_LOGS: u8 = 127;

/// Default for [`crate::FileLogBuilder::max_log_yield`].
pub const DEFAULT_MAX_LOG_YIELD: u8 = 10;

/// What the write loop does once a lock or rotation failed
/// [`RetryPolicy::max_retries`] times in a row.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Exhausted {
    /// Warn and keep writing: without the log lock, or to the active file
    /// past its size limit.
    #[default]
    Degrade,
    /// Keep retrying with backoff until success or shutdown.
    Block,
}

/// Bounds retries of lock acquisition, rotation and deferred writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Attempts after the first failure.
    pub max_retries: u8,
    /// Behavior once `max_retries` is used up.
    pub exhausted: Exhausted,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            exhausted: Exhausted::Degrade,
        }
    }
}

/// Permission classes granted on top of owner read/write.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct ModeBuilder {
    pub(crate) group_read: bool,
    pub(crate) group_write: bool,
    pub(crate) other_read: bool,
    pub(crate) other_write: bool,
}

impl ModeBuilder {
    /// Unix permission bits. Directories get execute for every class that
    /// can read or write.
    pub(crate) const fn build(self, is_directory: bool) -> u32 {
        let owner = class(true, true, is_directory);
        let group = class(self.group_read, self.group_write, is_directory);
        let other = class(self.other_read, self.other_write, is_directory);
        (owner << 6) | (group << 3) | other
    }
}

const fn class(read: bool, write: bool, is_directory: bool) -> u32 {
    let bits = (if read { 4 } else { 0 }) | (if write { 2 } else { 0 });
    if bits != 0 && is_directory {
        bits | 1
    } else {
        bits
    }
}

/// Paths of a rotating set of log files and the dot files coordinating them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogFiles {
    directory: PathBuf,
    files: Vec<PathBuf>,
    lock: PathBuf,
    rotate: PathBuf,
    hash: String,
}

impl LogFiles {
    /// `files[0]` is `{name}[.{extension}]` and `files[i]` appends a
    /// three-digit index, e.g. `log.001`.
    pub(crate) fn new(directory: PathBuf, name: &str, extension: &str, max_logs: u8) -> Self {
        let mut base = name.to_string();
        if !extension.is_empty() {
            base.push('.');
            base.push_str(extension);
        }

        let files = (0..max_logs.max(MIN_MAX_LOGS))
            .map(|i| {
                if i == 0 {
                    directory.join(&base)
                } else {
                    directory.join(format!("{base}.{i:03}"))
                }
            })
            .collect::<Vec<_>>();

        // Always prefixed, so a log named ".log" cannot share dot files with
        // one named "log".
        let lock = directory.join(format!(".{base}.lock"));
        let rotate = directory.join(format!(".{base}.rot"));

        let digest = blake3::hash(files[0].as_os_str().as_encoded_bytes());
        let hash = hex::encode(&digest.as_bytes()[..12]);

        Self {
            directory,
            files,
            lock,
            rotate,
            hash,
        }
    }

    /// Canonical log directory.
    #[must_use]
    pub fn directory(&self) -> &Path {
        &self.directory
    }

    /// Every log file, active first.
    #[must_use]
    pub fn files(&self) -> &[PathBuf] {
        &self.files
    }

    /// The file currently written to.
    #[must_use]
    pub fn active(&self) -> &Path {
        &self.files[0]
    }

    /// Number of files in the set.
    #[must_use]
    pub fn len(&self) -> usize {
        self.files.len()
    }

    /// Always false; a set has at least two files.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    /// The shared lock file.
    #[must_use]
    pub fn lock_file(&self) -> &Path {
        &self.lock
    }

    /// Marker present while a rotation is in progress.
    #[must_use]
    pub fn rotate_marker(&self) -> &Path {
        &self.rotate
    }

    /// 24 hex characters identifying the active file's path.
    #[must_use]
    pub fn hash(&self) -> &str {
        &self.hash
    }
}

/// Immutable settings shared by a [`crate::FileLog`] and its write loop.
#[derive(Clone)]
pub struct FileLogConfig {
    pub(crate) min_level: Level,
    pub(crate) max_level: Level,
    pub(crate) files: LogFiles,
    pub(crate) mode_directory: u32,
    pub(crate) mode_file: u32,
    pub(crate) max_log_size: u64,
    pub(crate) max_log_yield: u8,
    pub(crate) whitelist_domain: BTreeSet<String>,
    pub(crate) whitelist_domain_null: bool,
    pub(crate) whitelist_tag: BTreeSet<String>,
    pub(crate) buffer_capacity: Option<usize>,
    pub(crate) buffer_overflow: Overflow,
    pub(crate) retry_policy: RetryPolicy,
    pub(crate) drain_timeout: Duration,
    pub(crate) lock_timeout: Duration,
    pub(crate) thread_pool: ThreadPool,
    pub(crate) platform: Arc<dyn Platform>,
    pub(crate) debug: bool,
}

impl FileLogConfig {
    /// Paths of the log files.
    #[must_use]
    pub const fn files(&self) -> &LogFiles {
        &self.files
    }

    /// Size at which the active file is rotated.
    #[must_use]
    pub const fn max_log_size(&self) -> u64 {
        self.max_log_size
    }

    /// Writes per batch before the loop syncs and yields the log lock.
    #[must_use]
    pub const fn max_log_yield(&self) -> u8 {
        self.max_log_yield
    }

    /// Retry bounds of the write loop.
    #[must_use]
    pub const fn retry_policy(&self) -> RetryPolicy {
        self.retry_policy
    }
}

impl fmt::Debug for FileLogConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FileLogConfig")
            .field("min_level", &self.min_level)
            .field("max_level", &self.max_level)
            .field("files", &self.files)
            .field("mode_directory", &format_args!("{:o}", self.mode_directory))
            .field("mode_file", &format_args!("{:o}", self.mode_file))
            .field("max_log_size", &self.max_log_size)
            .field("max_log_yield", &self.max_log_yield)
            .field("whitelist_domain", &self.whitelist_domain)
            .field("whitelist_domain_null", &self.whitelist_domain_null)
            .field("whitelist_tag", &self.whitelist_tag)
            .field("buffer_capacity", &self.buffer_capacity)
            .field("buffer_overflow", &self.buffer_overflow)
            .field("retry_policy", &self.retry_policy)
            .field("platform", &self.platform)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_modes() {
        assert_eq!(ModeBuilder::default().build(false), 0o600);
        assert_eq!(ModeBuilder::default().build(true), 0o700);

        let mode = ModeBuilder {
            group_read: true,
            other_write: true,
            ..ModeBuilder::default()
        };
        assert_eq!(mode.build(false), 0o642);
        assert_eq!(mode.build(true), 0o753);
    }

    #[test]
    fn test_file_names() {
        let files = LogFiles::new(PathBuf::from("/var/log/app"), "app", "txt", 3);
        let names: Vec<_> = files
            .files()
            .iter()
            .map(|p| p.file_name().unwrap().to_str().unwrap().to_string())
            .collect();
        assert_eq!(names, vec!["app.txt", "app.txt.001", "app.txt.002"]);
        assert_eq!(files.lock_file(), Path::new("/var/log/app/.app.txt.lock"));
        assert_eq!(files.rotate_marker(), Path::new("/var/log/app/.app.txt.rot"));
    }

    #[test]
    fn test_wide_index_and_floor() {
        let files = LogFiles::new(PathBuf::from("/logs"), "log", "", 101);
        assert_eq!(files.files()[100], PathBuf::from("/logs/log.100"));
        assert_eq!(files.files()[9], PathBuf::from("/logs/log.009"));

        let floor = LogFiles::new(PathBuf::from("/logs"), "log", "", 0);
        assert_eq!(floor.len(), 2);
    }

    #[test]
    fn test_hash_stable() {
        let a = LogFiles::new(PathBuf::from("/logs"), "log", "", 2);
        let b = LogFiles::new(PathBuf::from("/logs"), "log", "", 5);
        let c = LogFiles::new(PathBuf::from("/other"), "log", "", 2);
        assert_eq!(a.hash().len(), 24);
        assert!(a.hash().chars().all(|c| c.is_ascii_hexdigit()));
        assert_eq!(a.hash(), b.hash());
        assert_ne!(a.hash(), c.hash());
    }
}

//! Validating builder for [`FileLog`]

use crate::buffer::Overflow;
use crate::config::{
    DEFAULT_MAX_LOG_SIZE, DEFAULT_MAX_LOG_YIELD, DEFAULT_MAX_LOGS, FileLogConfig, LogFiles,
    MAX_MAX_LOGS, MIN_MAX_LOG_SIZE, MIN_MAX_LOGS, ModeBuilder, RetryPolicy,
};
use crate::dispatcher::ThreadPool;
use crate::error::{Error, Result};
use crate::file_log::FileLog;
use crate::platform::{Platform, SystemPlatform};
use spool_logger::{Level, check_domain, check_tag};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

const MAX_LEN_FILE_NAME: usize = 64;
const MAX_LEN_FILE_EXTENSION: usize = 8;

/// Builder for [`FileLog`].
///
/// Setters never fail; every input is checked by [`FileLogBuilder::build`].
#[derive(Debug, Clone)]
pub struct FileLogBuilder {
    directory: PathBuf,
    min_level: Level,
    max_level: Level,
    mode_directory: ModeBuilder,
    mode_file: ModeBuilder,
    file_name: String,
    file_extension: String,
    max_log_size: u64,
    enforce_min_log_size: bool,
    max_logs: u8,
    max_log_yield: u8,
    whitelist_domain: BTreeSet<String>,
    whitelist_domain_null: bool,
    whitelist_tag: BTreeSet<String>,
    buffer_capacity: Option<usize>,
    buffer_overflow: Overflow,
    retry_policy: RetryPolicy,
    drain_timeout: Duration,
    lock_timeout: Duration,
    thread_pool: Option<ThreadPool>,
    platform: Option<Arc<dyn Platform>>,
    debug: bool,
}

impl FileLogBuilder {
    /// Starts a builder writing into `directory`.
    #[must_use]
    pub fn new(directory: impl Into<PathBuf>) -> Self {
        Self {
            directory: directory.into(),
            min_level: Level::Info,
            max_level: Level::Fatal,
            mode_directory: ModeBuilder::default(),
            mode_file: ModeBuilder::default(),
            file_name: "log".to_string(),
            file_extension: String::new(),
            max_log_size: DEFAULT_MAX_LOG_SIZE,
            enforce_min_log_size: true,
            max_logs: DEFAULT_MAX_LOGS,
            max_log_yield: DEFAULT_MAX_LOG_YIELD,
            whitelist_domain: BTreeSet::new(),
            whitelist_domain_null: true,
            whitelist_tag: BTreeSet::new(),
            buffer_capacity: None,
            buffer_overflow: Overflow::Block,
            retry_policy: RetryPolicy::default(),
            drain_timeout: Duration::from_secs(5),
            lock_timeout: Duration::from_secs(2),
            thread_pool: None,
            platform: None,
            debug: false,
        }
    }

    /// Lowest level written. Default [`Level::Info`].
    #[must_use]
    pub const fn min_level(mut self, level: Level) -> Self {
        self.min_level = level;
        self
    }

    /// Highest level written. Default [`Level::Fatal`].
    #[must_use]
    pub const fn max_level(mut self, level: Level) -> Self {
        self.max_level = level;
        self
    }

    /// Lets the owner's group list the log directory.
    #[must_use]
    pub const fn directory_group_readable(mut self, enable: bool) -> Self {
        self.mode_directory.group_read = enable;
        self
    }

    /// Lets the owner's group create files in the log directory.
    #[must_use]
    pub const fn directory_group_writable(mut self, enable: bool) -> Self {
        self.mode_directory.group_write = enable;
        self
    }

    /// Lets everyone list the log directory.
    #[must_use]
    pub const fn directory_other_readable(mut self, enable: bool) -> Self {
        self.mode_directory.other_read = enable;
        self
    }

    /// Lets everyone create files in the log directory.
    #[must_use]
    pub const fn directory_other_writable(mut self, enable: bool) -> Self {
        self.mode_directory.other_write = enable;
        self
    }

    /// Lets the owner's group read the log files.
    #[must_use]
    pub const fn file_group_readable(mut self, enable: bool) -> Self {
        self.mode_file.group_read = enable;
        self
    }

    /// Lets the owner's group write the log files.
    #[must_use]
    pub const fn file_group_writable(mut self, enable: bool) -> Self {
        self.mode_file.group_write = enable;
        self
    }

    /// Lets everyone read the log files.
    #[must_use]
    pub const fn file_other_readable(mut self, enable: bool) -> Self {
        self.mode_file.other_read = enable;
        self
    }

    /// Lets everyone write the log files.
    #[must_use]
    pub const fn file_other_writable(mut self, enable: bool) -> Self {
        self.mode_file.other_write = enable;
        self
    }

    /// Name of the active file. Default `log`.
    ///
    /// Must be 1 to 64 characters without whitespace, `/`, `\` or NUL, and
    /// must not end with `.`.
    #[must_use]
    pub fn file_name(mut self, name: impl Into<String>) -> Self {
        self.file_name = name.into();
        self
    }

    /// Extension appended to the file name. Default none.
    ///
    /// At most 8 characters without `.`, whitespace, `/`, `\` or NUL, and
    /// not `tmp`.
    #[must_use]
    pub fn file_extension(mut self, extension: impl Into<String>) -> Self {
        self.file_extension = extension.into();
        self
    }

    /// Size in bytes at which the active file is rotated. Default 10 MiB,
    /// raised to at least 50 KiB.
    #[must_use]
    pub const fn max_log_size(mut self, bytes: u64) -> Self {
        self.max_log_size = bytes;
        self.enforce_min_log_size = true;
        self
    }

    /// Like [`FileLogBuilder::max_log_size`] without the 50 KiB floor.
    #[doc(hidden)]
    #[must_use]
    pub const fn max_log_size_unchecked(mut self, bytes: u64) -> Self {
        self.max_log_size = bytes;
        self.enforce_min_log_size = false;
        self
    }

    /// Number of files kept, active one included. Default 5, clamped to
    /// `2..=127`.
    #[must_use]
    pub const fn max_logs(mut self, max: u8) -> Self {
        self.max_logs = max;
        self
    }

    /// Writes per batch before syncing and yielding the log lock to other
    /// processes. Default 10, at least 1.
    #[must_use]
    pub const fn max_log_yield(mut self, max: u8) -> Self {
        self.max_log_yield = max;
        self
    }

    /// Only records from whitelisted domains are written. An empty
    /// whitelist accepts every domain.
    #[must_use]
    pub fn whitelist_domain(mut self, domain: impl Into<String>) -> Self {
        self.whitelist_domain.insert(domain.into());
        self
    }

    /// Adds several domains to the whitelist.
    #[must_use]
    pub fn whitelist_domains<I, S>(mut self, domains: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.whitelist_domain
            .extend(domains.into_iter().map(Into::into));
        self
    }

    /// Whether records without a domain pass a non-empty domain whitelist.
    /// Default true.
    #[must_use]
    pub const fn whitelist_domain_null(mut self, allow: bool) -> Self {
        self.whitelist_domain_null = allow;
        self
    }

    /// Clears the domain whitelist.
    #[must_use]
    pub fn whitelist_domain_reset(mut self) -> Self {
        self.whitelist_domain.clear();
        self
    }

    /// Only records with whitelisted tags are written. An empty whitelist
    /// accepts every tag.
    #[must_use]
    pub fn whitelist_tag(mut self, tag: impl Into<String>) -> Self {
        self.whitelist_tag.insert(tag.into());
        self
    }

    /// Adds several tags to the whitelist.
    #[must_use]
    pub fn whitelist_tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.whitelist_tag.extend(tags.into_iter().map(Into::into));
        self
    }

    /// Clears the tag whitelist.
    #[must_use]
    pub fn whitelist_tag_reset(mut self) -> Self {
        self.whitelist_tag.clear();
        self
    }

    /// Bounds the number of records waiting to be written. Unbounded by
    /// default.
    #[must_use]
    pub const fn buffer_capacity(mut self, capacity: usize) -> Self {
        self.buffer_capacity = Some(capacity);
        self
    }

    /// What happens when a bounded buffer is full. Default [`Overflow::Block`].
    #[must_use]
    pub const fn buffer_overflow(mut self, overflow: Overflow) -> Self {
        self.buffer_overflow = overflow;
        self
    }

    /// Retry bounds for lock and rotation failures.
    #[must_use]
    pub const fn retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = policy;
        self
    }

    /// How long an uninstalled log may keep writing queued records before
    /// its loop is cancelled. Default 5 seconds.
    #[must_use]
    pub const fn drain_timeout(mut self, timeout: Duration) -> Self {
        self.drain_timeout = timeout;
        self
    }

    /// How long one attempt waits for a contended file lock. Default 2
    /// seconds.
    #[must_use]
    pub const fn lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout = timeout;
        self
    }

    /// Pool running the write loop. Defaults to [`ThreadPool::shared`].
    #[must_use]
    pub fn thread_pool(mut self, pool: ThreadPool) -> Self {
        self.thread_pool = Some(pool);
        self
    }

    /// Clock, ids and lock primitive. Defaults to [`SystemPlatform`].
    #[must_use]
    pub fn platform(mut self, platform: Arc<dyn Platform>) -> Self {
        self.platform = Some(platform);
        self
    }

    /// Emits lifecycle diagnostics through `tracing`.
    #[must_use]
    pub const fn debug(mut self, enable: bool) -> Self {
        self.debug = enable;
        self
    }

    /// Validates the settings and creates the log directory.
    ///
    /// # Errors
    ///
    /// - [`Error::Validation`] for any rejected input.
    /// - [`Error::CreateDirectory`] if the directory cannot be created.
    /// - [`Error::Io`] if it cannot be canonicalized.
    pub fn build(self) -> Result<FileLog> {
        self.build_config().map(FileLog::new)
    }

    pub(crate) fn build_config(self) -> Result<FileLogConfig> {
        check_directory(&self.directory)?;
        check_file_name(&self.file_name)?;
        check_file_extension(&self.file_extension)?;
        if self.min_level > self.max_level {
            return Err(Error::Validation(format!(
                "min_level[{}] is greater than max_level[{}]",
                self.min_level, self.max_level
            )));
        }
        for domain in &self.whitelist_domain {
            check_domain(domain)?;
        }
        for tag in &self.whitelist_tag {
            check_tag(tag)?;
        }

        let mode_directory = self.mode_directory.build(true);
        create_directory(&self.directory, mode_directory)?;
        let directory = self
            .directory
            .canonicalize()
            .map_err(|e| Error::Io("failed to canonicalize log directory", e))?;

        let max_logs = self.max_logs.clamp(MIN_MAX_LOGS, MAX_MAX_LOGS);
        let files = LogFiles::new(directory, &self.file_name, &self.file_extension, max_logs);
        let max_log_size = if self.enforce_min_log_size {
            self.max_log_size.max(MIN_MAX_LOG_SIZE)
        } else {
            self.max_log_size.max(1)
        };
        let whitelist_domain_null = self.whitelist_domain.is_empty() || self.whitelist_domain_null;

        Ok(FileLogConfig {
            min_level: self.min_level,
            max_level: self.max_level,
            files,
            mode_directory,
            mode_file: self.mode_file.build(false),
            max_log_size,
            max_log_yield: self.max_log_yield.max(1),
            whitelist_domain: self.whitelist_domain,
            whitelist_domain_null,
            whitelist_tag: self.whitelist_tag,
            buffer_capacity: self.buffer_capacity,
            buffer_overflow: self.buffer_overflow,
            retry_policy: self.retry_policy,
            drain_timeout: self.drain_timeout,
            lock_timeout: self.lock_timeout,
            thread_pool: self.thread_pool.unwrap_or_else(ThreadPool::shared),
            platform: self.platform.unwrap_or_else(|| Arc::new(SystemPlatform)),
            debug: self.debug,
        })
    }
}

fn invalid(message: impl Into<String>) -> Error {
    Error::Validation(message.into())
}

fn check_directory(directory: &Path) -> Result<()> {
    if directory.as_os_str().is_empty() {
        return Err(invalid("log directory cannot be empty"));
    }
    if directory.as_os_str().as_encoded_bytes().contains(&0) {
        return Err(invalid("log directory cannot contain a NUL character"));
    }
    Ok(())
}

fn check_name_chars(kind: &str, name: &str) -> Result<()> {
    for c in name.chars() {
        if c.is_whitespace() {
            return Err(invalid(format!("{kind} cannot contain whitespace")));
        }
        if matches!(c, '/' | '\\') {
            return Err(invalid(format!("{kind} cannot contain '{c}'")));
        }
        if c == '\0' {
            return Err(invalid(format!("{kind} cannot contain a NUL character")));
        }
    }
    Ok(())
}

pub(crate) fn check_file_name(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(invalid("file name cannot be empty"));
    }
    if name.chars().count() > MAX_LEN_FILE_NAME {
        return Err(invalid(format!(
            "file name cannot exceed {MAX_LEN_FILE_NAME} characters"
        )));
    }
    if name.ends_with('.') {
        return Err(invalid("file name cannot end with '.'"));
    }
    check_name_chars("file name", name)
}

pub(crate) fn check_file_extension(extension: &str) -> Result<()> {
    if extension.chars().count() > MAX_LEN_FILE_EXTENSION {
        return Err(invalid(format!(
            "file extension cannot exceed {MAX_LEN_FILE_EXTENSION} characters"
        )));
    }
    if extension.contains('.') {
        return Err(invalid("file extension cannot contain '.'"));
    }
    if extension == "tmp" {
        return Err(invalid("file extension cannot be 'tmp'"));
    }
    check_name_chars("file extension", extension)
}

/// Creates `directory` and any missing parents with `mode`.
pub(crate) fn create_directory(directory: &Path, mode: u32) -> Result<()> {
    let mut builder = std::fs::DirBuilder::new();
    builder.recursive(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::DirBuilderExt;
        builder.mode(mode);
    }
    #[cfg(not(unix))]
    let _ = mode;

    builder
        .create(directory)
        .map_err(|source| Error::CreateDirectory {
            path: directory.to_path_buf(),
            source,
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn test_file_name_rules() {
        assert!(check_file_name("app").is_ok());
        assert!(check_file_name(".hidden").is_ok());
        assert!(check_file_name(&"a".repeat(64)).is_ok());

        for bad in ["", "app.", "my app", "a/b", "a\\b", "a\0b", "tab\t"] {
            assert_matches!(check_file_name(bad), Err(Error::Validation(_)), "{bad:?}");
        }
        assert_matches!(check_file_name(&"a".repeat(65)), Err(Error::Validation(_)));
    }

    #[test]
    fn test_file_extension_rules() {
        assert!(check_file_extension("").is_ok());
        assert!(check_file_extension("txt").is_ok());
        assert!(check_file_extension("12345678").is_ok());

        for bad in ["tmp", "a.b", "123456789", "a b", "a/b", "a\\b", "a\0"] {
            assert_matches!(check_file_extension(bad), Err(Error::Validation(_)), "{bad:?}");
        }
    }

    #[test]
    fn test_directory_rules() {
        assert_matches!(check_directory(Path::new("")), Err(Error::Validation(_)));
        assert_matches!(check_directory(Path::new("/tmp/a\0b")), Err(Error::Validation(_)));
        assert!(check_directory(Path::new("/tmp/logs")).is_ok());
    }

    #[test]
    fn test_coercions_and_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let log = FileLogBuilder::new(dir.path().join("nested/logs"))
            .max_logs(0)
            .max_log_size(10)
            .max_log_yield(0)
            .whitelist_domain_null(false)
            .build()
            .unwrap();

        assert!(dir.path().join("nested/logs").is_dir());
        assert_eq!(log.log_files().len(), 2);
        assert_eq!(log.max_log_size(), MIN_MAX_LOG_SIZE);
        assert_eq!(log.max_log_yield(), 1);
        // An empty domain whitelist always admits records without a domain.
        assert!(log.whitelist_domain_null());
        assert_eq!(log.mode_file(), 0o600);
        assert_eq!(log.mode_directory(), 0o700);
    }

    #[test]
    fn test_whitelist_entries_validated() {
        let dir = tempfile::tempdir().unwrap();
        assert_matches!(
            FileLogBuilder::new(dir.path()).whitelist_domain("X").build(),
            Err(Error::Logger(_))
        );
        assert_matches!(
            FileLogBuilder::new(dir.path()).whitelist_tag("has space").build(),
            Err(Error::Logger(_))
        );
    }

    #[test]
    fn test_level_order_validated() {
        let dir = tempfile::tempdir().unwrap();
        assert_matches!(
            FileLogBuilder::new(dir.path())
                .min_level(Level::Error)
                .max_level(Level::Info)
                .build(),
            Err(Error::Validation(_))
        );
    }
}

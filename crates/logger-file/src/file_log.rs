//! The [`Log`] backend writing to rotating files

use crate::action::{Delivery, LogAction, LogWait, RotationAction, WriteAction};
use crate::buffer::LogBuffer;
use crate::builder::{FileLogBuilder, create_directory};
use crate::config::{FileLogConfig, LogFiles, RetryPolicy};
use crate::error::{Error, Result};
use crate::format::{Record, format};
use crate::lock_file::LockFile;
use crate::writer::{ActiveFile, Completion, WriteLoop};
use parking_lot::Mutex;
use spool_logger::{BoxError, Level, Log};
use std::collections::BTreeSet;
use std::error::Error as StdError;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::runtime::Handle;
use tracing::{debug, warn};

/// Domain of this crate's own diagnostics when they are routed back into a
/// registry. Records from it are never written to a file log.
pub const DOMAIN: &str = "spool-logger-file";

const UID_PREFIX: &str = "spool.file.FileLog-";

struct Session {
    buffer: Arc<LogBuffer<LogAction>>,
    completion: Arc<Completion>,
    dispatcher: Handle,
    task: tokio::task::AbortHandle,
}

#[derive(Default)]
struct State {
    installed: Option<Session>,
    // Loop of the most recent session, which may still be draining.
    last: Option<Arc<Completion>>,
}

/// Writes records to a rotating set of files.
///
/// Records are formatted on the calling thread and appended by a background
/// write loop that runs while the log is installed in a
/// [`spool_logger::Registry`]. Writers in other processes targeting the same
/// files are coordinated through advisory locks on a shared lock file.
///
/// ```no_run
/// use spool_logger::Registry;
/// use spool_logger_file::FileLog;
/// use std::sync::Arc;
///
/// # fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let registry = Registry::shared();
/// let log = Arc::new(FileLog::builder("/var/log/app").max_logs(3).build()?);
/// registry.install(log.clone())?;
///
/// registry.logger(Some("my.app"), "Main")?.i("started");
///
/// registry.uninstall(log.uid())?;
/// log.join_blocking(std::time::Duration::from_secs(5));
/// # Ok(())
/// # }
/// ```
pub struct FileLog {
    config: Arc<FileLogConfig>,
    uid: String,
    state: Mutex<State>,
    dropped: Arc<AtomicU64>,
}

impl FileLog {
    /// Starts a builder writing into `directory`.
    #[must_use]
    pub fn builder(directory: impl Into<PathBuf>) -> FileLogBuilder {
        FileLogBuilder::new(directory)
    }

    pub(crate) fn new(config: FileLogConfig) -> Self {
        let uid = format!("{UID_PREFIX}{}", config.files.hash());
        Self {
            config: Arc::new(config),
            uid,
            state: Mutex::new(State::default()),
            dropped: Arc::default(),
        }
    }

    /// Canonical log directory.
    #[must_use]
    pub fn log_directory(&self) -> &Path {
        self.config.files.directory()
    }

    /// Every log file, active first.
    #[must_use]
    pub fn log_files(&self) -> &[PathBuf] {
        self.config.files.files()
    }

    /// Paths of the log files and their coordination files.
    #[must_use]
    pub fn files(&self) -> &LogFiles {
        &self.config.files
    }

    /// 24 hex characters identifying the active file's path.
    #[must_use]
    pub fn log_files0_hash(&self) -> &str {
        self.config.files.hash()
    }

    /// Unix permission bits of the log directory.
    #[must_use]
    pub fn mode_directory(&self) -> u32 {
        self.config.mode_directory
    }

    /// Unix permission bits of the log files.
    #[must_use]
    pub fn mode_file(&self) -> u32 {
        self.config.mode_file
    }

    /// Size in bytes at which the active file is rotated.
    #[must_use]
    pub fn max_log_size(&self) -> u64 {
        self.config.max_log_size
    }

    /// Writes per batch.
    #[must_use]
    pub fn max_log_yield(&self) -> u8 {
        self.config.max_log_yield
    }

    /// Domains accepted; empty accepts all.
    #[must_use]
    pub fn whitelist_domain(&self) -> &BTreeSet<String> {
        &self.config.whitelist_domain
    }

    /// Whether records without a domain are accepted.
    #[must_use]
    pub fn whitelist_domain_null(&self) -> bool {
        self.config.whitelist_domain_null
    }

    /// Tags accepted; empty accepts all.
    #[must_use]
    pub fn whitelist_tag(&self) -> &BTreeSet<String> {
        &self.config.whitelist_tag
    }

    /// Retry bounds of the write loop.
    #[must_use]
    pub fn retry_policy(&self) -> RetryPolicy {
        self.config.retry_policy
    }

    /// Whether the log is installed.
    #[must_use]
    pub fn is_installed(&self) -> bool {
        self.state.lock().installed.is_some()
    }

    /// Whether a write loop is running, including one still draining after
    /// uninstall.
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.state
            .lock()
            .last
            .as_ref()
            .is_some_and(|completion| !completion.is_complete())
    }

    /// Records accepted but never written: evicted, skipped at shutdown or
    /// failed to write.
    #[must_use]
    pub fn dropped_count(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Asks the write loop to rotate the files before the next write.
    ///
    /// Returns false if the log is not installed.
    pub fn rotate(&self) -> bool {
        let Some(buffer) = self.buffer() else {
            return false;
        };
        buffer
            .send(LogAction::Rotation(RotationAction::Rotate))
            .is_ok()
    }

    /// Waits until the most recent write loop has stopped. Returns
    /// immediately if none ever ran.
    pub async fn join(&self) {
        let completion = self.state.lock().last.clone();
        if let Some(completion) = completion {
            completion.wait().await;
        }
    }

    /// Blocks until the most recent write loop has stopped or `timeout`
    /// elapses. Returns whether it stopped.
    #[must_use]
    pub fn join_blocking(&self, timeout: Duration) -> bool {
        let completion = self.state.lock().last.clone();
        completion.is_none_or(|completion| completion.wait_blocking(timeout))
    }

    fn buffer(&self) -> Option<Arc<LogBuffer<LogAction>>> {
        self.state
            .lock()
            .installed
            .as_ref()
            .map(|session| Arc::clone(&session.buffer))
    }

    fn install(&self) -> Result<()> {
        let mut state = self.state.lock();
        if state.installed.is_some() {
            return Ok(());
        }

        let config = &self.config;
        let files = &config.files;
        let (dispatcher, reference) = config.thread_pool.acquire()?;

        create_directory(files.directory(), config.mode_directory)?;
        let canonical = files
            .directory()
            .canonicalize()
            .map_err(|e| Error::Io("failed to canonicalize log directory", e))?;
        if canonical != files.directory() {
            return Err(Error::SymlinkHijack {
                expected: files.directory().to_path_buf(),
                actual: canonical,
            });
        }

        // Writing through a symbolic link would land somewhere unintended.
        for path in [files.lock_file(), files.active()] {
            remove_symlink(path)?;
        }

        let lock_file = LockFile::open(config.platform.as_ref(), files.lock_file())?;
        let active = ActiveFile::open(files.active(), config.mode_file)
            .map_err(|e| Error::Io("failed to open log file", e))?;

        let buffer = Arc::new(LogBuffer::with_dropped_counter(
            config.buffer_capacity,
            config.buffer_overflow,
            Arc::clone(&self.dropped),
        ));
        let completion = Arc::new(Completion::default());
        let writer = WriteLoop::new(
            Arc::clone(config),
            Arc::clone(&buffer),
            Arc::clone(&self.dropped),
            lock_file,
            active,
        );

        let previous = state.last.replace(Arc::clone(&completion));
        let loop_completion = Arc::clone(&completion);
        let task = dispatcher.spawn(async move {
            if let Some(previous) = previous {
                previous.wait().await;
            }
            writer.run(loop_completion, reference).await;
        });

        state.installed = Some(Session {
            buffer,
            completion,
            dispatcher,
            task: task.abort_handle(),
        });
        drop(state);

        if config.debug {
            debug!(uid = %self.uid, path = %files.active().display(), "Log file opened.");
        }
        Ok(())
    }

    fn uninstall(&self) {
        let Some(session) = self.state.lock().installed.take() else {
            return;
        };
        session.buffer.close();

        let drain_timeout = self.config.drain_timeout;
        let uid = self.uid.clone();
        let Session {
            completion,
            dispatcher,
            task,
            ..
        } = session;
        dispatcher.spawn(async move {
            if tokio::time::timeout(drain_timeout, completion.wait())
                .await
                .is_err()
            {
                warn!(uid, "write loop did not finish within {drain_timeout:?}, cancelling it");
                task.abort();
            }
        });
    }
}

fn remove_symlink(path: &Path) -> Result<()> {
    match std::fs::symlink_metadata(path) {
        Ok(metadata) if metadata.file_type().is_symlink() => {
            warn!(path = %path.display(), "replacing symbolic link with a regular file");
            std::fs::remove_file(path).map_err(|e| Error::Io("failed to remove symbolic link", e))
        }
        _ => Ok(()),
    }
}

impl Log for FileLog {
    fn uid(&self) -> &str {
        &self.uid
    }

    fn min_level(&self) -> Level {
        self.config.min_level
    }

    fn max_level(&self) -> Level {
        self.config.max_level
    }

    fn is_loggable(&self, _level: Level, domain: Option<&str>, tag: &str) -> bool {
        if domain == Some(DOMAIN) {
            return false;
        }

        let config = &self.config;
        if !config.whitelist_domain.is_empty() {
            let allowed = domain.map_or(config.whitelist_domain_null, |domain| {
                config.whitelist_domain.contains(domain)
            });
            if !allowed {
                return false;
            }
        }
        if !config.whitelist_tag.is_empty() && !config.whitelist_tag.contains(tag) {
            return false;
        }

        self.is_installed()
    }

    fn log(
        &self,
        level: Level,
        domain: Option<&str>,
        tag: &str,
        msg: Option<&str>,
        err: Option<&(dyn StdError + 'static)>,
    ) -> bool {
        let Some(buffer) = self.buffer() else {
            return false;
        };

        let platform = &self.config.platform;
        let record = Record {
            time: platform.now(),
            pid: platform.pid(),
            tid: platform.tid(),
            level,
            domain,
            tag,
            msg,
            err,
        };
        let Some(formatted) = format(&record) else {
            return false;
        };

        let wait = (level == Level::Fatal).then(LogWait::new);
        let action = WriteAction::new(formatted, wait.clone());
        if buffer.send(LogAction::Write(action)).is_err() {
            return false;
        }

        // Fatal records are on disk before the caller goes on to crash.
        wait.is_none_or(|wait| wait.wait(None) == Some(Delivery::Committed))
    }

    fn on_install(&self) -> std::result::Result<(), BoxError> {
        self.install().map_err(Into::into)
    }

    fn on_uninstall(&self) {
        self.uninstall();
    }
}

impl Drop for FileLog {
    fn drop(&mut self) {
        if let Some(session) = self.state.get_mut().installed.take() {
            session.buffer.close();
        }
    }
}

impl fmt::Debug for FileLog {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FileLog")
            .field("uid", &self.uid)
            .field("config", &self.config)
            .field("installed", &self.is_installed())
            .field("dropped", &self.dropped_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lock_file::memory::MemoryPlatform;
    use spool_logger::Registry;

    fn build(dir: &Path) -> FileLog {
        FileLog::builder(dir)
            .platform(Arc::new(MemoryPlatform::new()))
            .whitelist_domain("my.app")
            .whitelist_domain_null(false)
            .whitelist_tag("Main")
            .build()
            .unwrap()
    }

    #[test]
    fn test_uid_from_hash() {
        let dir = tempfile::tempdir().unwrap();
        let log = build(dir.path());
        assert_eq!(log.uid(), format!("spool.file.FileLog-{}", log.log_files0_hash()));
        assert!(!log.uid().contains(char::is_whitespace));
    }

    #[test]
    fn test_not_loggable_until_installed() {
        let dir = tempfile::tempdir().unwrap();
        let log = build(dir.path());
        assert!(!log.is_loggable(Level::Info, Some("my.app"), "Main"));
        assert!(!log.log(Level::Info, Some("my.app"), "Main", Some("x"), None));
        assert!(!log.rotate());
        assert!(log.join_blocking(Duration::ZERO));
    }

    #[test]
    fn test_whitelists_and_own_domain() {
        let dir = tempfile::tempdir().unwrap();
        let registry = Registry::shared();
        let log = Arc::new(build(dir.path()));
        assert!(registry.install(log.clone()).unwrap());

        assert!(log.is_loggable(Level::Info, Some("my.app"), "Main"));
        assert!(!log.is_loggable(Level::Info, Some("other"), "Main"));
        assert!(!log.is_loggable(Level::Info, None, "Main"));
        assert!(!log.is_loggable(Level::Info, Some("my.app"), "Other"));
        assert!(!log.is_loggable(Level::Info, Some(DOMAIN), "Main"));

        assert!(registry.uninstall(log.uid()).unwrap());
        assert!(!log.is_loggable(Level::Info, Some("my.app"), "Main"));
        assert!(log.join_blocking(Duration::from_secs(5)));
    }
}

//! The single consumer appending log actions to the active file
//!
//! Each iteration takes the next action, acquires the log lock, re-stats the
//! active file and then processes queued actions until the batch is full,
//! the lock is lost or the file needs rotating. Writes are synced once per
//! batch. Rotation work is queued ahead of the channel.

use crate::action::{LogAction, RotationAction, WriteAction};
use crate::allocator::DerefHandle;
use crate::buffer::{LogBuffer, Obligation};
use crate::config::{Exhausted, FileLogConfig};
use crate::dispatcher::RuntimeAllocator;
use crate::error::{Error, Result};
use crate::lock_file::{FileLock, LockFile};
use crate::rotation::{self, Recovery, RotationState};
use parking_lot::{Condvar, Mutex};
use same_file::Handle;
use std::collections::VecDeque;
use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::Notify;
use tracing::{debug, trace, warn};

const BACKOFF_STEP: Duration = Duration::from_millis(100);
const MAX_BACKOFF: Duration = Duration::from_secs(1);

fn backoff(attempt: u32) -> Duration {
    BACKOFF_STEP.saturating_mul(attempt).min(MAX_BACKOFF)
}

/// Signalled once a write loop has stopped for good.
#[derive(Default)]
pub(crate) struct Completion {
    done: Mutex<bool>,
    cv: Condvar,
    notify: Notify,
}

impl Completion {
    pub(crate) fn complete(&self) {
        *self.done.lock() = true;
        self.cv.notify_all();
        self.notify.notify_waiters();
    }

    pub(crate) fn is_complete(&self) -> bool {
        *self.done.lock()
    }

    pub(crate) async fn wait(&self) {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.is_complete() {
                return;
            }
            notified.await;
        }
    }

    pub(crate) fn wait_blocking(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut done = self.done.lock();
        while !*done {
            if self.cv.wait_until(&mut done, deadline).timed_out() {
                return *done;
            }
        }
        true
    }
}

/// Opens `path` for appending, creating it with `mode`. If access is denied
/// the permissions are reset to `mode` and the open retried once.
pub(crate) fn open_append(path: &Path, mode: u32) -> io::Result<File> {
    let mut options = OpenOptions::new();
    options.create(true).append(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(mode);
    }

    match options.open(path) {
        Err(e) if e.kind() == io::ErrorKind::PermissionDenied && path.exists() => {
            reset_mode(path, mode)?;
            options.open(path)
        }
        other => other,
    }
}

#[cfg(unix)]
fn reset_mode(path: &Path, mode: u32) -> io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(mode))
}

#[cfg(not(unix))]
fn reset_mode(path: &Path, _mode: u32) -> io::Result<()> {
    let mut permissions = std::fs::metadata(path)?.permissions();
    #[allow(clippy::permissions_set_readonly_false)]
    permissions.set_readonly(false);
    std::fs::set_permissions(path, permissions)
}

/// The open active log file.
pub(crate) struct ActiveFile {
    file: File,
    identity: Handle,
    size: u64,
}

impl ActiveFile {
    pub(crate) fn open(path: &Path, mode: u32) -> io::Result<Self> {
        let file = open_append(path, mode)?;
        let identity = Handle::from_file(file.try_clone()?)?;
        let size = file.metadata()?.len();
        Ok(Self {
            file,
            identity,
            size,
        })
    }

    /// Whether `path` still names this file, i.e. nobody rotated it away.
    fn is_current(&self, path: &Path) -> bool {
        Handle::from_path(path).is_ok_and(|handle| handle == self.identity)
    }
}

pub(crate) struct WriteLoop {
    config: Arc<FileLogConfig>,
    buffer: Arc<LogBuffer<LogAction>>,
    dropped: Arc<AtomicU64>,
    lock_file: Option<LockFile>,
    active: Option<ActiveFile>,
    priority: VecDeque<RotationAction>,
    deferred: Option<WriteAction>,
    state: RotationState,
    rotation_pending: bool,
}

impl WriteLoop {
    pub(crate) fn new(
        config: Arc<FileLogConfig>,
        buffer: Arc<LogBuffer<LogAction>>,
        dropped: Arc<AtomicU64>,
        lock_file: LockFile,
        active: ActiveFile,
    ) -> Self {
        Self {
            config,
            buffer,
            dropped,
            lock_file: Some(lock_file),
            active: Some(active),
            priority: VecDeque::from([RotationAction::CheckInterrupted]),
            deferred: None,
            state: RotationState::Active,
            rotation_pending: false,
        }
    }

    /// Runs until the buffer is closed and everything queued was handled.
    ///
    /// Whether it finishes or is cancelled, leftovers in the buffer are
    /// dropped, the lock file is closed, `completion` is signalled and the
    /// dispatcher reference released, in that order.
    pub(crate) async fn run(
        self,
        completion: Arc<Completion>,
        dispatcher: DerefHandle<RuntimeAllocator>,
    ) {
        let buffer = Arc::clone(&self.buffer);
        let verbose = self.config.debug;
        let _guard = scopeguard::guard((completion, dispatcher), move |(completion, dispatcher)| {
            let skipped = buffer.close_and_drain();
            if skipped > 0 {
                warn!("Skipped {skipped} logs");
            }
            completion.complete();
            dispatcher.release();
            if verbose {
                debug!("write loop stopped");
            }
        });

        // Declared after the guard so it is dropped (closing files) first.
        let mut this = self;
        while let Some(action) = this.next_action().await {
            this.batch(action).await;
        }
        this.shutdown();
    }

    async fn next_action(&mut self) -> Option<LogAction> {
        match self.next_queued() {
            Some(action) => Some(action),
            None => self.buffer.recv().await,
        }
    }

    fn next_queued(&mut self) -> Option<LogAction> {
        if let Some(rotation) = self.priority.pop_front() {
            return Some(LogAction::Rotation(rotation));
        }
        if let Some(write) = self.deferred.take() {
            return Some(LogAction::Write(write));
        }
        self.buffer.try_recv()
    }

    async fn batch(&mut self, first: LogAction) {
        let log_lock = self.acquire_log_lock().await;
        if let Err(e) = self.refresh_active() {
            warn!("failed to reopen log file: {e}");
        }

        let max_yield = usize::from(self.config.max_log_yield);
        let mut processed = 0;
        let mut next = Some(first);
        while let Some(action) = next.take() {
            match action {
                LogAction::Rotation(rotation) => self.rotation(rotation).await,
                LogAction::Write(write) => {
                    if self.write(write) {
                        processed += 1;
                    }
                }
            }

            let lock_lost = log_lock.as_ref().is_some_and(|lock| !lock.is_valid());
            if lock_lost || self.rotation_pending || self.needs_rotation() || processed >= max_yield {
                break;
            }
            next = self.next_queued();
        }

        if processed > 0 {
            self.sync();
            if self.config.debug {
                trace!(processed, "log batch written");
            }
        }

        if self.rotation_due() {
            self.rotate().await;
        }

        if let Some(lock) = log_lock {
            self.release(&lock, "log");
        }
    }

    fn release(&mut self, lock: &FileLock, name: &str) {
        match lock.release() {
            Ok(()) | Err(Error::Closed) => {}
            Err(e) => {
                warn!("failed to release {name} lock: {e}");
                self.priority.push_back(RotationAction::CloseLockFile);
            }
        }
    }

    fn lock_file(&mut self) -> Result<LockFile> {
        match &self.lock_file {
            Some(lock_file) if lock_file.is_open() => Ok(lock_file.clone()),
            _ => {
                let lock_file =
                    LockFile::open(self.config.platform.as_ref(), self.config.files.lock_file())?;
                self.lock_file = Some(lock_file.clone());
                Ok(lock_file)
            }
        }
    }

    fn close_lock_file(&mut self) {
        if let Some(lock_file) = self.lock_file.take() {
            lock_file.close();
            if self.config.debug {
                debug!("lock file closed");
            }
        }
    }

    /// Takes the log lock. `None` means the policy allowed writing without it.
    async fn acquire_log_lock(&mut self) -> Option<FileLock> {
        let policy = self.config.retry_policy;
        let mut attempt: u32 = 0;
        loop {
            let result = match self.lock_file() {
                Ok(lock_file) => lock_file.lock_log(self.config.lock_timeout).await,
                Err(e) => Err(e),
            };

            let e = match result {
                Ok(lock) => return Some(lock),
                Err(e) => e,
            };

            attempt += 1;
            if e.is_contention() {
                debug!(attempt, "log lock contended");
            } else {
                warn!("failed to acquire log lock, reopening lock file: {e}");
                self.close_lock_file();
            }

            if attempt > u32::from(policy.max_retries) {
                match policy.exhausted {
                    Exhausted::Degrade => {
                        warn!("log lock unavailable after {attempt} attempts, writing without it");
                        return None;
                    }
                    Exhausted::Block => tokio::time::sleep(backoff(attempt)).await,
                }
            }
        }
    }

    fn refresh_active(&mut self) -> io::Result<()> {
        let current = self
            .active
            .as_ref()
            .is_some_and(|active| active.is_current(self.config.files.active()));
        if !current {
            self.active = None;
            self.reopen_active()?;
        }
        if let Some(active) = self.active.as_mut() {
            active.size = active.file.metadata()?.len();
        }
        Ok(())
    }

    fn reopen_active(&mut self) -> io::Result<()> {
        self.active = Some(ActiveFile::open(
            self.config.files.active(),
            self.config.mode_file,
        )?);
        if self.config.debug {
            debug!(path = %self.config.files.active().display(), "log file opened");
        }
        Ok(())
    }

    fn active_size(&self) -> u64 {
        self.active.as_ref().map_or(0, |active| active.size)
    }

    fn needs_rotation(&self) -> bool {
        let size = self.active_size();
        match self.state {
            RotationState::Active | RotationState::RotationLocked => {
                size >= self.config.max_log_size
            }
            RotationState::AwaitingRetry { .. } => false,
            RotationState::Degraded { resume_at } => size >= resume_at,
        }
    }

    /// Whether a batch should end by rotating. Never while a failed rotation
    /// waits for its queued retry, which makes the next attempt itself.
    fn rotation_due(&self) -> bool {
        !matches!(self.state, RotationState::AwaitingRetry { .. })
            && (self.rotation_pending || self.needs_rotation())
    }

    /// Appends one action. Returns whether its bytes were written.
    fn write(&mut self, mut action: WriteAction) -> bool {
        if self.active.is_none() {
            if let Err(e) = self.reopen_active() {
                warn!("failed to open log file, dropping log: {e}");
                self.drop_write(action);
                return false;
            }
        }

        let size = self.active_size();
        let len = action.len();
        let defer = self.state == RotationState::Active
            && size > 0
            && size.saturating_add(len) > self.config.max_log_size
            && action.retries() < self.config.retry_policy.max_retries;
        if defer {
            action.retry();
            self.deferred = Some(action);
            self.rotation_pending = true;
            return false;
        }

        let written = match self.active.as_mut() {
            Some(active) => active.file.write_all(action.bytes()).map(|()| {
                active.size += len;
                if action.is_fatal() {
                    if let Err(e) = active.file.sync_all() {
                        warn!("failed to sync log file: {e}");
                    }
                }
            }),
            None => Err(io::Error::from(io::ErrorKind::NotFound)),
        };

        match written {
            Ok(()) => {
                action.commit();
                true
            }
            Err(e) => {
                warn!("failed to write log: {e}");
                self.drop_write(action);
                self.active = None;
                false
            }
        }
    }

    fn drop_write(&self, action: WriteAction) {
        self.dropped.fetch_add(1, Ordering::Relaxed);
        action.on_dropped(true);
    }

    fn sync(&self) {
        if let Some(active) = &self.active {
            if let Err(e) = active.file.sync_all() {
                warn!("failed to sync log file: {e}");
            }
        }
    }

    async fn rotation(&mut self, action: RotationAction) {
        match action {
            RotationAction::CheckInterrupted => {
                if self.config.files.rotate_marker().exists() {
                    warn!("found an interrupted log rotation, resuming it");
                    self.rotate().await;
                }
            }
            RotationAction::Rotate => {
                if self.active_size() > 0 {
                    self.rotation_pending = true;
                }
            }
            RotationAction::Retry => self.rotate().await,
            RotationAction::CloseLockFile => self.close_lock_file(),
        }
    }

    async fn rotate(&mut self) {
        let rotate_lock = match self.lock_file() {
            Ok(lock_file) => lock_file.lock_rotate(self.config.lock_timeout).await,
            Err(e) => Err(e),
        };
        let rotate_lock = match rotate_lock {
            Ok(lock) => lock,
            Err(e) => {
                self.rotation_failed(&e).await;
                return;
            }
        };

        let previous = self.state;
        self.state = RotationState::RotationLocked;
        let shifted = self.shift_files();
        self.release(&rotate_lock, "rotate");

        match shifted {
            Ok(()) => {
                self.state = RotationState::Active;
                self.rotation_pending = false;
            }
            Err(e) => {
                self.state = previous;
                self.rotation_failed(&Error::Io("failed to rotate log files", e))
                    .await;
            }
        }
    }

    fn shift_files(&mut self) -> io::Result<()> {
        let config = Arc::clone(&self.config);
        let files = config.files();

        // Released first so renaming never races our own open handle.
        let exceeded = self.active_size() >= self.config.max_log_size;
        self.active = None;

        match rotation::recover(files)? {
            Recovery::Clean if self.rotation_pending || exceeded => {
                rotation::rotate(files)?;
                if self.config.debug {
                    debug!("log files rotated");
                }
            }
            Recovery::Clean => {}
            Recovery::Finished => debug!("interrupted log rotation had already finished"),
            Recovery::Resumed(hole) => debug!(hole, "interrupted log rotation resumed"),
        }

        self.reopen_active()
    }

    async fn rotation_failed(&mut self, error: &Error) {
        let attempts = match self.state {
            RotationState::AwaitingRetry { attempts } => attempts.saturating_add(1),
            _ => 1,
        };
        if !error.is_contention() {
            self.priority.push_back(RotationAction::CloseLockFile);
        }

        let policy = self.config.retry_policy;
        let block = policy.exhausted == Exhausted::Block && !self.buffer.is_closed();
        if attempts <= policy.max_retries || block {
            warn!("log rotation failed (attempt {attempts}): {error}");
            self.state = RotationState::AwaitingRetry { attempts };
            if attempts > policy.max_retries {
                tokio::time::sleep(backoff(u32::from(attempts))).await;
            }
            self.priority.push_back(RotationAction::Retry);
        } else {
            warn!("log rotation failed {attempts} times, continuing without rotating: {error}");
            self.state = RotationState::Degraded {
                resume_at: self.active_size().saturating_add(self.config.max_log_size),
            };
            self.rotation_pending = false;
        }
    }

    fn shutdown(&mut self) {
        self.sync();
        self.active = None;
        self.close_lock_file();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::FileLogBuilder;
    use crate::dispatcher::ThreadPool;
    use crate::lock_file::memory::MemoryPlatform;
    use tracing_test::traced_test;

    #[tokio::test]
    #[traced_test]
    async fn test_contended_rotation_retries_are_bounded() {
        let dir = tempfile::tempdir().unwrap();
        let platform = MemoryPlatform::new();
        let config = Arc::new(
            FileLogBuilder::new(dir.path())
                .platform(Arc::new(platform.clone()))
                .thread_pool(ThreadPool::new(1).unwrap())
                .lock_timeout(Duration::from_millis(20))
                .max_log_size_unchecked(100)
                .build_config()
                .unwrap(),
        );
        let files = config.files();

        // Another writer sits on the rotate range for the whole run.
        let other = LockFile::open(&platform, files.lock_file()).unwrap();
        let _rotating = other.try_lock_rotate().unwrap().unwrap();

        let buffer = Arc::new(LogBuffer::unbounded());
        for c in ['a', 'b'] {
            let line = format!("{}\n", c.to_string().repeat(59));
            buffer
                .send(LogAction::Write(WriteAction::new(line, None)))
                .unwrap();
        }
        buffer.close();

        let dropped = Arc::new(AtomicU64::new(0));
        let lock_file = LockFile::open(&platform, files.lock_file()).unwrap();
        let active = ActiveFile::open(files.active(), config.mode_file).unwrap();
        let (_, reference) = config.thread_pool.acquire().unwrap();
        let completion = Arc::new(Completion::default());
        WriteLoop::new(Arc::clone(&config), buffer, Arc::clone(&dropped), lock_file, active)
            .run(Arc::clone(&completion), reference)
            .await;

        assert!(completion.is_complete());
        assert_eq!(dropped.load(Ordering::SeqCst), 0);
        // Both records end up in the unrotated file once retries run out.
        assert_eq!(std::fs::metadata(files.active()).unwrap().len(), 120);
        assert!(!files.files()[1].exists());

        logs_assert(|lines: &[&str]| {
            let failed = lines
                .iter()
                .filter(|line| line.contains("log rotation failed"))
                .count();
            let degraded = lines
                .iter()
                .filter(|line| line.contains("continuing without rotating"))
                .count();
            match (failed, degraded) {
                // Three retried attempts, then the one that degrades.
                (4, 1) => Ok(()),
                other => Err(format!("(failed, degraded) = {other:?}")),
            }
        });
    }

    #[tokio::test]
    async fn test_completion_async_and_blocking() {
        let completion = Arc::new(Completion::default());
        assert!(!completion.wait_blocking(Duration::from_millis(10)));

        let waiter = {
            let completion = Arc::clone(&completion);
            tokio::spawn(async move { completion.wait().await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        completion.complete();
        waiter.await.unwrap();

        assert!(completion.is_complete());
        assert!(completion.wait_blocking(Duration::ZERO));
        completion.wait().await;
    }

    #[test]
    fn test_active_file_identity() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("log");
        let moved = dir.path().join("log.001");

        let mut active = ActiveFile::open(&path, 0o600).unwrap();
        active.file.write_all(b"abc").unwrap();
        assert!(active.is_current(&path));
        assert_eq!(active.file.metadata().unwrap().len(), 3);

        std::fs::rename(&path, &moved).unwrap();
        assert!(!active.is_current(&path));

        std::fs::write(&path, b"").unwrap();
        assert!(!active.is_current(&path));
    }

    #[test]
    fn test_backoff_capped() {
        assert_eq!(backoff(1), BACKOFF_STEP);
        assert_eq!(backoff(1000), MAX_BACKOFF);
    }

    #[cfg(unix)]
    #[test]
    fn test_open_append_mode() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("log");
        drop(open_append(&path, 0o640).unwrap());
        let mode = std::fs::metadata(&path).unwrap().permissions().mode() & 0o777;
        // The umask may only clear bits.
        assert_eq!(mode & !0o640, 0);
        assert_ne!(mode & 0o600, 0);
    }
}

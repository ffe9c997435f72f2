//! Advisory byte-range locks on a shared lock file
//!
//! A single lock file per set of logs is partitioned into two disjoint
//! ranges. Holding the log range means no other cooperating process is
//! appending to the active log; holding the rotate range grants exclusive
//! rights to rename the log files.

pub(crate) mod memory;
#[cfg(unix)]
pub(crate) mod unix;
#[cfg(windows)]
pub(crate) mod windows;

use crate::error::{Error, Result};
use crate::platform::Platform;
use parking_lot::Mutex;
use std::fmt;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::time::Instant;

/// Length of each lock range.
pub const FILE_LOCK_SIZE: u64 = 1;

/// Start of the range held while writing to the active log.
pub const FILE_LOCK_POS_LOG: u64 = 0;

/// Start of the range held while rotating logs.
pub const FILE_LOCK_POS_ROTATE: u64 = FILE_LOCK_POS_LOG + FILE_LOCK_SIZE;

/// How often [`LockFile::lock`] retries a contended range.
const POLL_INTERVAL: Duration = Duration::from_millis(10);

/// OS primitive behind a [`LockFile`]. Dropping it closes the handle and
/// with it every range it holds.
pub trait RawLockFile: Send + Sync + fmt::Debug {
    /// Attempts to take an exclusive lock without blocking. `Ok(false)` means
    /// another holder has an overlapping range.
    ///
    /// # Errors
    ///
    /// Any failure other than contention.
    fn try_lock_range(&self, position: u64, size: u64) -> io::Result<bool>;

    /// Releases a range previously acquired with [`RawLockFile::try_lock_range`].
    ///
    /// # Errors
    ///
    /// The underlying OS error.
    fn unlock_range(&self, position: u64, size: u64) -> io::Result<()>;
}

struct State {
    raw: Option<Box<dyn RawLockFile>>,
    held: Vec<(u64, u64)>,
}

struct Inner {
    path: PathBuf,
    state: Mutex<State>,
}

/// An open lock file. Cloning shares the handle.
#[derive(Clone)]
pub struct LockFile {
    inner: Arc<Inner>,
}

impl LockFile {
    /// Opens or creates the lock file at `path`. If access is denied the
    /// file's permissions are reset to owner read/write and the open retried
    /// once.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Io`] if the file cannot be opened.
    pub fn open(platform: &dyn Platform, path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let raw = match platform.open_lock_file(&path) {
            Err(e) if e.kind() == io::ErrorKind::PermissionDenied && path.exists() => {
                reset_permissions(&path)
                    .map_err(|e| Error::Io("failed to reset lock file permissions", e))?;
                platform.open_lock_file(&path)
            }
            other => other,
        }
        .map_err(|e| Error::Io("failed to open lock file", e))?;

        Ok(Self {
            inner: Arc::new(Inner {
                path,
                state: Mutex::new(State {
                    raw: Some(raw),
                    held: Vec::new(),
                }),
            }),
        })
    }

    /// Path of the lock file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.inner.path
    }

    /// Whether the handle is still open.
    #[must_use]
    pub fn is_open(&self) -> bool {
        self.inner.state.lock().raw.is_some()
    }

    /// Closes the handle, invalidating every [`FileLock`] obtained from it.
    /// Closing twice is a no-op.
    pub fn close(&self) {
        let raw = {
            let mut state = self.inner.state.lock();
            state.held.clear();
            state.raw.take()
        };
        drop(raw);
    }

    /// Attempts to lock `[position, position + size)` without blocking.
    ///
    /// Returns `Ok(None)` if the range is held elsewhere, including by another
    /// lock on this same handle.
    ///
    /// # Errors
    ///
    /// - [`Error::LockRange`] if the range is empty or overflows.
    /// - [`Error::Closed`] if the handle was closed.
    /// - [`Error::Io`] for any other OS failure.
    pub fn try_lock(&self, position: u64, size: u64) -> Result<Option<FileLock>> {
        check_range(position, size)?;

        let mut state = self.inner.state.lock();
        let overlaps = state
            .held
            .iter()
            .any(|&(p, s)| position < p + s && p < position + size);
        if overlaps {
            return Ok(None);
        }

        let raw = state.raw.as_ref().ok_or(Error::Closed)?;
        let acquired = raw
            .try_lock_range(position, size)
            .map_err(|e| Error::Io("failed to lock file range", e))?;
        if !acquired {
            return Ok(None);
        }

        state.held.push((position, size));
        Ok(Some(FileLock {
            file: Arc::clone(&self.inner),
            position,
            size,
            released: AtomicBool::new(false),
        }))
    }

    /// Locks `[position, position + size)`, retrying until `timeout` elapses.
    /// Dropping the future abandons the attempt.
    ///
    /// # Errors
    ///
    /// - [`Error::LockTimeout`] if the range stayed contended past the deadline.
    /// - Any error from [`LockFile::try_lock`].
    pub async fn lock(&self, position: u64, size: u64, timeout: Duration) -> Result<FileLock> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(lock) = self.try_lock(position, size)? {
                return Ok(lock);
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(Error::LockTimeout(timeout));
            }
            tokio::time::sleep(POLL_INTERVAL.min(deadline - now)).await;
        }
    }

    /// Non-blocking lock of the log range.
    ///
    /// # Errors
    ///
    /// See [`LockFile::try_lock`].
    pub fn try_lock_log(&self) -> Result<Option<FileLock>> {
        self.try_lock(FILE_LOCK_POS_LOG, FILE_LOCK_SIZE)
    }

    /// Non-blocking lock of the rotate range.
    ///
    /// # Errors
    ///
    /// See [`LockFile::try_lock`].
    pub fn try_lock_rotate(&self) -> Result<Option<FileLock>> {
        self.try_lock(FILE_LOCK_POS_ROTATE, FILE_LOCK_SIZE)
    }

    /// Blocking lock of the log range.
    ///
    /// # Errors
    ///
    /// See [`LockFile::lock`].
    pub async fn lock_log(&self, timeout: Duration) -> Result<FileLock> {
        self.lock(FILE_LOCK_POS_LOG, FILE_LOCK_SIZE, timeout).await
    }

    /// Blocking lock of the rotate range.
    ///
    /// # Errors
    ///
    /// See [`LockFile::lock`].
    pub async fn lock_rotate(&self, timeout: Duration) -> Result<FileLock> {
        self.lock(FILE_LOCK_POS_ROTATE, FILE_LOCK_SIZE, timeout).await
    }
}

impl fmt::Debug for LockFile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LockFile")
            .field("path", &self.inner.path)
            .field("open", &self.is_open())
            .finish()
    }
}

fn check_range(position: u64, size: u64) -> Result<()> {
    let max = u64::try_from(i64::MAX).unwrap_or(u64::MAX);
    match position.checked_add(size) {
        Some(end) if size > 0 && end <= max => Ok(()),
        _ => Err(Error::LockRange { position, size }),
    }
}

#[cfg(unix)]
fn reset_permissions(path: &Path) -> io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))
}

#[cfg(not(unix))]
fn reset_permissions(path: &Path) -> io::Result<()> {
    let mut permissions = std::fs::metadata(path)?.permissions();
    #[allow(clippy::permissions_set_readonly_false)]
    permissions.set_readonly(false);
    std::fs::set_permissions(path, permissions)
}

/// An exclusive lock on a range of a [`LockFile`].
///
/// Released explicitly with [`FileLock::release`], or on drop.
pub struct FileLock {
    file: Arc<Inner>,
    position: u64,
    size: u64,
    released: AtomicBool,
}

impl FileLock {
    /// Start of the locked range.
    #[must_use]
    pub const fn position(&self) -> u64 {
        self.position
    }

    /// Length of the locked range.
    #[must_use]
    pub const fn size(&self) -> u64 {
        self.size
    }

    /// False once released or once the lock file was closed.
    #[must_use]
    pub fn is_valid(&self) -> bool {
        !self.released.load(Ordering::Acquire) && self.file.state.lock().raw.is_some()
    }

    /// Releases the lock. Releasing twice is a no-op.
    ///
    /// # Errors
    ///
    /// - [`Error::Closed`] if the lock file was closed first.
    /// - [`Error::Io`] if the OS refused to unlock.
    pub fn release(&self) -> Result<()> {
        if self.released.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        let mut state = self.file.state.lock();
        let raw = state.raw.as_ref().ok_or(Error::Closed)?;
        let result = raw.unlock_range(self.position, self.size);
        let range = (self.position, self.size);
        state.held.retain(|held| *held != range);
        result.map_err(|e| Error::Io("failed to release file lock", e))
    }
}

impl Drop for FileLock {
    fn drop(&mut self) {
        let _ = self.release();
    }
}

impl fmt::Debug for FileLock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FileLock")
            .field("position", &self.position)
            .field("size", &self.size)
            .field("valid", &self.is_valid())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lock_file::memory::MemoryPlatform;
    use assert_matches::assert_matches;

    fn open_pair() -> (LockFile, LockFile) {
        let platform = MemoryPlatform::default();
        let a = LockFile::open(&platform, "/logs/.log.lock").unwrap();
        let b = LockFile::open(&platform, "/logs/.log.lock").unwrap();
        (a, b)
    }

    #[test]
    fn test_ranges_disjoint() {
        assert!(FILE_LOCK_POS_LOG + FILE_LOCK_SIZE <= FILE_LOCK_POS_ROTATE);

        let (a, _) = open_pair();
        let log = a.try_lock_log().unwrap().unwrap();
        let rotate = a.try_lock_rotate().unwrap().unwrap();
        assert!(log.is_valid());
        assert!(rotate.is_valid());
    }

    #[test]
    fn test_contention_between_handles() {
        let (a, b) = open_pair();
        let held = a.try_lock_log().unwrap().unwrap();
        assert!(b.try_lock_log().unwrap().is_none());
        assert!(b.try_lock_rotate().unwrap().is_some());

        held.release().unwrap();
        assert!(!held.is_valid());
        assert!(b.try_lock_log().unwrap().is_some());
    }

    #[test]
    fn test_same_handle_overlap_would_block() {
        let (a, _) = open_pair();
        let _held = a.try_lock_log().unwrap().unwrap();
        assert!(a.try_lock_log().unwrap().is_none());
    }

    #[test]
    fn test_release_idempotent() {
        let (a, _) = open_pair();
        let lock = a.try_lock_log().unwrap().unwrap();
        lock.release().unwrap();
        lock.release().unwrap();
    }

    #[test]
    fn test_close_invalidates() {
        let (a, b) = open_pair();
        let lock = a.try_lock_log().unwrap().unwrap();
        a.close();
        assert!(!lock.is_valid());
        assert_matches!(lock.release(), Err(Error::Closed));
        assert_matches!(a.try_lock_log(), Err(Error::Closed));
        // Closing dropped the OS handle, which released the range.
        assert!(b.try_lock_log().unwrap().is_some());
        a.close();
    }

    #[test]
    fn test_overflow_fails_fast() {
        let (a, _) = open_pair();
        assert_matches!(a.try_lock(u64::MAX, 1), Err(Error::LockRange { .. }));
        assert_matches!(a.try_lock(i64::MAX as u64, 1), Err(Error::LockRange { .. }));
        assert_matches!(a.try_lock(0, 0), Err(Error::LockRange { .. }));
        a.close();
        // Range checks run before touching the (closed) handle.
        assert_matches!(a.try_lock(u64::MAX, 1), Err(Error::LockRange { .. }));
    }

    #[tokio::test]
    async fn test_lock_timeout() {
        let (a, b) = open_pair();
        let _held = a.try_lock_log().unwrap().unwrap();
        let err = b.lock_log(Duration::from_millis(50)).await.unwrap_err();
        assert_matches!(err, Error::LockTimeout(_));
        assert!(err.is_contention());
    }

    #[tokio::test]
    async fn test_lock_waits_for_release() {
        let (a, b) = open_pair();
        let held = a.try_lock_log().unwrap().unwrap();
        let releaser = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(30)).await;
            held.release().unwrap();
        });
        let lock = b.lock_log(Duration::from_secs(5)).await.unwrap();
        assert!(lock.is_valid());
        releaser.await.unwrap();
    }
}

//! Clock, process/thread ids and lock file access

use crate::lock_file::RawLockFile;
use chrono::{DateTime, Local};
use std::fmt;
use std::io;
use std::path::Path;

/// Operating system services the file log depends on.
///
/// [`SystemPlatform`] is the real implementation; [`crate::MemoryPlatform`]
/// replaces the lock primitive with an in-process table for tests.
pub trait Platform: Send + Sync + fmt::Debug + 'static {
    /// Current local time, if the clock is available.
    fn now(&self) -> Option<DateTime<Local>>;

    /// Id of this process, if available.
    fn pid(&self) -> Option<u32>;

    /// Id of the calling thread, if available.
    fn tid(&self) -> Option<u64>;

    /// Opens (creating if needed) a file supporting exclusive byte-range locks.
    ///
    /// # Errors
    ///
    /// Returns the underlying I/O error.
    fn open_lock_file(&self, path: &Path) -> io::Result<Box<dyn RawLockFile>>;
}

/// The host operating system.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemPlatform;

impl Platform for SystemPlatform {
    fn now(&self) -> Option<DateTime<Local>> {
        Some(Local::now())
    }

    fn pid(&self) -> Option<u32> {
        Some(std::process::id())
    }

    fn tid(&self) -> Option<u64> {
        current_thread_id()
    }

    fn open_lock_file(&self, path: &Path) -> io::Result<Box<dyn RawLockFile>> {
        #[cfg(unix)]
        {
            crate::lock_file::unix::UnixLockFile::open(path).map(|f| Box::new(f) as _)
        }

        #[cfg(windows)]
        {
            crate::lock_file::windows::WindowsLockFile::open(path).map(|f| Box::new(f) as _)
        }

        #[cfg(not(any(unix, windows)))]
        {
            let _ = path;
            Err(io::Error::new(
                io::ErrorKind::Unsupported,
                "byte-range file locks are not supported on this platform",
            ))
        }
    }
}

#[cfg(any(target_os = "linux", target_os = "android"))]
#[allow(unsafe_code)]
fn current_thread_id() -> Option<u64> {
    // SAFETY: gettid has no preconditions and cannot fail.
    let tid = unsafe { libc::syscall(libc::SYS_gettid) };
    u64::try_from(tid).ok()
}

#[cfg(any(target_os = "macos", target_os = "ios"))]
#[allow(unsafe_code)]
fn current_thread_id() -> Option<u64> {
    let mut tid: u64 = 0;
    // SAFETY: pthread_self is always valid for the calling thread and tid is a
    // valid out pointer.
    let rc = unsafe { libc::pthread_threadid_np(libc::pthread_self(), &mut tid) };
    (rc == 0).then_some(tid)
}

#[cfg(windows)]
#[allow(unsafe_code)]
fn current_thread_id() -> Option<u64> {
    // SAFETY: GetCurrentThreadId has no preconditions.
    let tid = unsafe { windows_sys::Win32::System::Threading::GetCurrentThreadId() };
    Some(u64::from(tid))
}

#[cfg(not(any(
    target_os = "linux",
    target_os = "android",
    target_os = "macos",
    target_os = "ios",
    windows
)))]
const fn current_thread_id() -> Option<u64> {
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_system_ids() {
        let platform = SystemPlatform;
        assert_eq!(platform.pid(), Some(std::process::id()));
        assert!(platform.now().is_some());

        #[cfg(any(target_os = "linux", target_os = "macos", windows))]
        {
            let here = platform.tid();
            assert!(here.is_some());
            let there = std::thread::spawn(move || SystemPlatform.tid())
                .join()
                .unwrap();
            assert_ne!(here, there);
        }
    }
}

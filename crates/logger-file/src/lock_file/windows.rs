//! `LockFileEx` byte-range locks
#![allow(unsafe_code)]

use super::RawLockFile;
use std::fs::{File, OpenOptions};
use std::io;
use std::os::windows::fs::OpenOptionsExt;
use std::os::windows::io::AsRawHandle;
use std::path::Path;
use windows_sys::Win32::Foundation::{ERROR_IO_PENDING, ERROR_LOCK_VIOLATION, HANDLE};
use windows_sys::Win32::Storage::FileSystem::{
    FILE_SHARE_DELETE, FILE_SHARE_READ, FILE_SHARE_WRITE, LOCKFILE_EXCLUSIVE_LOCK,
    LOCKFILE_FAIL_IMMEDIATELY, LockFileEx, UnlockFileEx,
};
use windows_sys::Win32::System::IO::OVERLAPPED;

#[derive(Debug)]
pub(crate) struct WindowsLockFile {
    file: File,
}

#[allow(clippy::cast_possible_truncation)]
fn overlapped_at(position: u64) -> OVERLAPPED {
    // SAFETY: OVERLAPPED is a plain C struct for which all-zero is valid.
    let mut overlapped: OVERLAPPED = unsafe { std::mem::zeroed() };
    overlapped.Anonymous.Anonymous.Offset = position as u32;
    overlapped.Anonymous.Anonymous.OffsetHigh = (position >> 32) as u32;
    overlapped
}

#[allow(clippy::cast_possible_truncation)]
const fn split(size: u64) -> (u32, u32) {
    (size as u32, (size >> 32) as u32)
}

impl WindowsLockFile {
    pub(crate) fn open(path: &Path) -> io::Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .share_mode(FILE_SHARE_READ | FILE_SHARE_WRITE | FILE_SHARE_DELETE)
            .open(path)?;
        Ok(Self { file })
    }

    fn handle(&self) -> HANDLE {
        self.file.as_raw_handle() as HANDLE
    }
}

impl RawLockFile for WindowsLockFile {
    fn try_lock_range(&self, position: u64, size: u64) -> io::Result<bool> {
        let mut overlapped = overlapped_at(position);
        let (low, high) = split(size);
        // SAFETY: the handle is owned by self.file and overlapped outlives the call.
        let ok = unsafe {
            LockFileEx(
                self.handle(),
                LOCKFILE_EXCLUSIVE_LOCK | LOCKFILE_FAIL_IMMEDIATELY,
                0,
                low,
                high,
                &mut overlapped,
            )
        };
        if ok != 0 {
            return Ok(true);
        }

        let err = io::Error::last_os_error();
        match err.raw_os_error().and_then(|c| u32::try_from(c).ok()) {
            Some(ERROR_LOCK_VIOLATION | ERROR_IO_PENDING) => Ok(false),
            _ => Err(err),
        }
    }

    fn unlock_range(&self, position: u64, size: u64) -> io::Result<()> {
        let mut overlapped = overlapped_at(position);
        let (low, high) = split(size);
        // SAFETY: the handle is owned by self.file and overlapped outlives the call.
        let ok = unsafe { UnlockFileEx(self.handle(), 0, low, high, &mut overlapped) };
        if ok == 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }
}

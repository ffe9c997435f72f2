//! fcntl byte-range locks
//!
//! Linux and Android use open file description locks so two handles
//! within one process contend with each other. Other unix systems fall back to
//! process-associated locks.
#![allow(unsafe_code)]

use super::RawLockFile;
use std::fs::{File, OpenOptions};
use std::io;
use std::os::unix::fs::OpenOptionsExt;
use std::os::unix::io::AsRawFd;
use std::path::Path;

#[cfg(any(target_os = "linux", target_os = "android"))]
const F_SETLK: libc::c_int = libc::F_OFD_SETLK;

#[cfg(not(any(target_os = "linux", target_os = "android")))]
const F_SETLK: libc::c_int = libc::F_SETLK;

#[derive(Debug)]
pub(crate) struct UnixLockFile {
    file: File,
}

impl UnixLockFile {
    pub(crate) fn open(path: &Path) -> io::Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .mode(0o666)
            .custom_flags(libc::O_CLOEXEC)
            .open(path)?;
        Ok(Self { file })
    }

    fn set_lock(&self, lock_type: libc::c_int, position: u64, size: u64) -> io::Result<bool> {
        let start = libc::off_t::try_from(position)
            .map_err(|_| io::Error::from_raw_os_error(libc::EOVERFLOW))?;
        let len = libc::off_t::try_from(size)
            .map_err(|_| io::Error::from_raw_os_error(libc::EOVERFLOW))?;

        // SAFETY: flock is a plain C struct for which all-zero is a valid value.
        // Open file description locks additionally require l_pid to be 0.
        let mut fl: libc::flock = unsafe { std::mem::zeroed() };
        fl.l_type = lock_type as libc::c_short;
        fl.l_whence = libc::SEEK_SET as libc::c_short;
        fl.l_start = start;
        fl.l_len = len;

        // SAFETY: the fd is owned by self.file and fl outlives the call.
        let rc = unsafe { libc::fcntl(self.file.as_raw_fd(), F_SETLK, &raw const fl) };
        if rc != -1 {
            return Ok(true);
        }

        let err = io::Error::last_os_error();
        match err.raw_os_error() {
            Some(code) if code == libc::EACCES || code == libc::EAGAIN => Ok(false),
            Some(code) if code == libc::EINVAL || code == libc::EOVERFLOW => Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("invalid lock range position[{position}] size[{size}]: {err}"),
            )),
            _ => Err(err),
        }
    }
}

impl RawLockFile for UnixLockFile {
    fn try_lock_range(&self, position: u64, size: u64) -> io::Result<bool> {
        self.set_lock(libc::c_int::from(libc::F_WRLCK), position, size)
    }

    fn unlock_range(&self, position: u64, size: u64) -> io::Result<()> {
        if self.set_lock(libc::c_int::from(libc::F_UNLCK), position, size)? {
            Ok(())
        } else {
            Err(io::Error::new(
                io::ErrorKind::WouldBlock,
                "unlock reported contention",
            ))
        }
    }
}

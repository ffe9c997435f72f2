//! In-process lock table standing in for OS byte-range locks

use super::RawLockFile;
use crate::platform::Platform;
use chrono::{DateTime, Local};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Clone, Copy)]
struct Held {
    owner: u64,
    position: u64,
    size: u64,
}

type Table = Arc<Mutex<HashMap<PathBuf, Vec<Held>>>>;

/// A [`Platform`] whose lock files live in memory.
///
/// Every handle opened through the same `MemoryPlatform` (or a clone of it)
/// contends like a separate process would, which makes cross-process lock
/// behavior testable within one process. Clock and ids default to the real
/// system values and can be pinned for deterministic output.
#[derive(Debug, Clone, Default)]
pub struct MemoryPlatform {
    table: Table,
    next_owner: Arc<AtomicU64>,
    now: Option<DateTime<Local>>,
    pid: Option<u32>,
    tid: Option<u64>,
}

impl MemoryPlatform {
    /// Creates a platform with an empty lock table.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Pins the clock.
    #[must_use]
    pub const fn with_now(mut self, now: DateTime<Local>) -> Self {
        self.now = Some(now);
        self
    }

    /// Pins the process id.
    #[must_use]
    pub const fn with_pid(mut self, pid: u32) -> Self {
        self.pid = Some(pid);
        self
    }

    /// Pins the thread id.
    #[must_use]
    pub const fn with_tid(mut self, tid: u64) -> Self {
        self.tid = Some(tid);
        self
    }

    /// Number of ranges currently held on `path` across all handles.
    #[must_use]
    pub fn held_ranges(&self, path: &Path) -> usize {
        self.table.lock().get(path).map_or(0, Vec::len)
    }
}

impl Platform for MemoryPlatform {
    fn now(&self) -> Option<DateTime<Local>> {
        self.now.or_else(|| Some(Local::now()))
    }

    fn pid(&self) -> Option<u32> {
        self.pid.or_else(|| Some(std::process::id()))
    }

    fn tid(&self) -> Option<u64> {
        self.tid
    }

    fn open_lock_file(&self, path: &Path) -> io::Result<Box<dyn RawLockFile>> {
        Ok(Box::new(MemoryLockFile {
            owner: self.next_owner.fetch_add(1, Ordering::Relaxed),
            path: path.to_path_buf(),
            table: Arc::clone(&self.table),
        }))
    }
}

#[derive(Debug)]
struct MemoryLockFile {
    owner: u64,
    path: PathBuf,
    table: Table,
}

impl RawLockFile for MemoryLockFile {
    fn try_lock_range(&self, position: u64, size: u64) -> io::Result<bool> {
        let mut table = self.table.lock();
        let held = table.entry(self.path.clone()).or_default();
        let contended = held.iter().any(|h| {
            h.owner != self.owner && position < h.position + h.size && h.position < position + size
        });
        if contended {
            return Ok(false);
        }
        held.push(Held {
            owner: self.owner,
            position,
            size,
        });
        Ok(true)
    }

    fn unlock_range(&self, position: u64, size: u64) -> io::Result<()> {
        let mut table = self.table.lock();
        if let Some(held) = table.get_mut(&self.path) {
            held.retain(|h| !(h.owner == self.owner && h.position == position && h.size == size));
        }
        Ok(())
    }
}

impl Drop for MemoryLockFile {
    fn drop(&mut self) {
        let mut table = self.table.lock();
        if let Some(held) = table.get_mut(&self.path) {
            held.retain(|h| h.owner != self.owner);
        }
    }
}

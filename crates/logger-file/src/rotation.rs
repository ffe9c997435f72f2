//! Shifting log files down the set
//!
//! A rotation renames `files[i - 1]` to `files[i]` from the oldest slot
//! down, evicting the oldest file and leaving the active slot free. A marker
//! file exists for the duration so a writer that starts after a crash can
//! finish the job.

use crate::config::LogFiles;
use std::fs;
use std::io;
use tracing::debug;

/// Where the write loop stands with respect to rotation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) enum RotationState {
    /// Writing to the active file.
    #[default]
    Active,
    /// The rotate lock is held and files are being renamed.
    RotationLocked,
    /// The rotate lock could not be taken; a retry is queued.
    AwaitingRetry { attempts: u8 },
    /// Retries ran out. Size-triggered rotation resumes once the active file
    /// reaches `resume_at` bytes.
    Degraded { resume_at: u64 },
}

/// What [`recover`] found.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Recovery {
    /// No marker; nothing was interrupted.
    Clean,
    /// The active file was already moved, only the marker was left.
    Finished,
    /// Files were shifted into the hole at this index.
    Resumed(usize),
}

/// Shifts every file one slot down. The caller reopens `files[0]`.
pub(crate) fn rotate(files: &LogFiles) -> io::Result<()> {
    fs::File::create(files.rotate_marker())?;
    shift_into(files, files.len() - 1)?;
    remove_marker(files)
}

/// Completes a rotation interrupted by a crash, if the marker says one was.
pub(crate) fn recover(files: &LogFiles) -> io::Result<Recovery> {
    if !files.rotate_marker().exists() {
        return Ok(Recovery::Clean);
    }

    if !files.active().exists() {
        remove_marker(files)?;
        return Ok(Recovery::Finished);
    }

    let last = files.len() - 1;
    let hole = (1..files.len())
        .find(|&i| !files.files()[i].exists())
        .unwrap_or(last);
    shift_into(files, hole)?;
    remove_marker(files)?;
    Ok(Recovery::Resumed(hole))
}

fn shift_into(files: &LogFiles, hole: usize) -> io::Result<()> {
    let paths = files.files();
    for i in (1..=hole).rev() {
        let from = &paths[i - 1];
        if !from.exists() {
            continue;
        }
        // Rename replaces an existing destination on every supported OS.
        fs::rename(from, &paths[i])?;
        debug!(from = %from.display(), to = %paths[i].display(), "log file shifted");
    }
    Ok(())
}

fn remove_marker(files: &LogFiles) -> io::Result<()> {
    match fs::remove_file(files.rotate_marker()) {
        Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e),
        _ => Ok(()),
    }
}

//! Units of work consumed by the write loop

use crate::buffer::Obligation;
use parking_lot::{Condvar, Mutex};
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::trace;

/// Outcome of a [`LogWait`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Delivery {
    /// The bytes were written and synced.
    Committed,
    /// The action was dropped without being written.
    Dropped,
}

#[derive(Default)]
struct WaitInner {
    outcome: Mutex<Option<Delivery>>,
    done: Condvar,
}

/// One-shot completion signal a producer can block on.
#[derive(Clone, Default)]
pub(crate) struct LogWait {
    inner: Arc<WaitInner>,
}

impl LogWait {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Records the outcome. Only the first call has an effect.
    pub(crate) fn complete(&self, delivery: Delivery) {
        let mut outcome = self.inner.outcome.lock();
        if outcome.is_none() {
            *outcome = Some(delivery);
            self.inner.done.notify_all();
        }
    }

    /// Blocks until completed or `timeout` elapses. `None` on timeout.
    pub(crate) fn wait(&self, timeout: Option<Duration>) -> Option<Delivery> {
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut outcome = self.inner.outcome.lock();
        loop {
            if let Some(delivery) = *outcome {
                return Some(delivery);
            }
            match deadline {
                Some(deadline) => {
                    if self.inner.done.wait_until(&mut outcome, deadline).timed_out() {
                        return *outcome;
                    }
                }
                None => self.inner.done.wait(&mut outcome),
            }
        }
    }
}

impl fmt::Debug for LogWait {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("LogWait")
            .field(&*self.inner.outcome.lock())
            .finish()
    }
}

/// Formatted bytes waiting to be appended to the active log file.
///
/// Consumed exactly once, either by [`WriteAction::commit`] or by
/// [`Obligation::on_dropped`]. If neither happens (the loop was cancelled
/// while holding it) dropping the action counts as undelivered.
pub(crate) struct WriteAction {
    bytes: Vec<u8>,
    retries: u8,
    wait: Option<LogWait>,
    finished: bool,
}

impl WriteAction {
    pub(crate) fn new(formatted: String, wait: Option<LogWait>) -> Self {
        Self {
            bytes: formatted.into_bytes(),
            retries: 0,
            wait,
            finished: false,
        }
    }

    pub(crate) fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub(crate) fn len(&self) -> u64 {
        self.bytes.len() as u64
    }

    /// Whether a producer is blocked until this action is synced.
    pub(crate) const fn is_fatal(&self) -> bool {
        self.wait.is_some()
    }

    pub(crate) const fn retries(&self) -> u8 {
        self.retries
    }

    /// Marks one more deferral caused by rotation.
    pub(crate) const fn retry(&mut self) {
        self.retries = self.retries.saturating_add(1);
    }

    /// The bytes were written (and synced, for fatal actions).
    pub(crate) fn commit(mut self) {
        self.finish(Delivery::Committed);
    }

    fn finish(&mut self, delivery: Delivery) {
        self.finished = true;
        if let Some(wait) = self.wait.take() {
            wait.complete(delivery);
        }
    }
}

impl Obligation for WriteAction {
    fn on_dropped(mut self, undelivered: bool) {
        if undelivered {
            trace!(len = self.bytes.len(), "log action dropped");
        }
        self.finish(Delivery::Dropped);
    }
}

impl Drop for WriteAction {
    fn drop(&mut self) {
        if !self.finished {
            self.finish(Delivery::Dropped);
        }
    }
}

impl fmt::Debug for WriteAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WriteAction")
            .field("len", &self.bytes.len())
            .field("retries", &self.retries)
            .field("fatal", &self.is_fatal())
            .finish()
    }
}

/// Rotation work. None of these write bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum RotationAction {
    /// A rotation marker may have been left behind by a crashed writer.
    CheckInterrupted,
    /// Rotate now, regardless of size.
    Rotate,
    /// A previous rotation could not take the rotate lock.
    Retry,
    /// Drop the lock file handle so the next iteration reopens it.
    CloseLockFile,
}

/// Everything that flows through the log buffer.
#[derive(Debug)]
pub(crate) enum LogAction {
    Write(WriteAction),
    Rotation(RotationAction),
}

impl Obligation for LogAction {
    fn on_dropped(self, undelivered: bool) {
        match self {
            Self::Write(write) => write.on_dropped(undelivered),
            Self::Rotation(_) => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_commit_signals_wait() {
        let wait = LogWait::new();
        let action = WriteAction::new("line\n".to_string(), Some(wait.clone()));
        assert!(action.is_fatal());
        assert_eq!(action.len(), 5);
        action.commit();
        assert_eq!(wait.wait(None), Some(Delivery::Committed));
    }

    #[test]
    fn test_drop_fallback_signals_once() {
        let wait = LogWait::new();
        let action = WriteAction::new("line\n".to_string(), Some(wait.clone()));
        drop(action);
        assert_eq!(wait.wait(None), Some(Delivery::Dropped));

        // A later completion does not overwrite the first outcome.
        wait.complete(Delivery::Committed);
        assert_eq!(wait.wait(None), Some(Delivery::Dropped));
    }

    #[test]
    fn test_on_dropped_through_log_action() {
        let wait = LogWait::new();
        let action = LogAction::Write(WriteAction::new("x\n".to_string(), Some(wait.clone())));
        action.on_dropped(true);
        assert_eq!(wait.wait(None), Some(Delivery::Dropped));
    }

    #[test]
    fn test_wait_timeout() {
        let wait = LogWait::new();
        assert_eq!(wait.wait(Some(Duration::from_millis(20))), None);
    }

    #[test]
    fn test_wait_across_threads() {
        let wait = LogWait::new();
        let action = WriteAction::new("x\n".to_string(), Some(wait.clone()));
        let writer = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            action.commit();
        });
        assert_eq!(wait.wait(Some(Duration::from_secs(5))), Some(Delivery::Committed));
        writer.join().unwrap();
    }
}

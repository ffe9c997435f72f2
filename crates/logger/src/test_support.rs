//! Test support utilities
//!
//! This module provides a backend that captures records in memory.
//! It's only available when the `test-support` feature is enabled.

use crate::{Level, Log};
use parking_lot::Mutex;
use std::error::Error as StdError;
use std::sync::Arc;

/// A record captured by [`CaptureLog`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CapturedRecord {
    /// Level of the record.
    pub level: Level,
    /// Domain of the logger.
    pub domain: Option<String>,
    /// Tag of the logger.
    pub tag: String,
    /// The message, if any.
    pub msg: Option<String>,
    /// `Display` of the error, if any.
    pub err: Option<String>,
}

/// A backend that captures all records in memory for testing.
#[derive(Clone)]
pub struct CaptureLog {
    uid: String,
    min_level: Level,
    records: Arc<Mutex<Vec<CapturedRecord>>>,
}

impl CaptureLog {
    /// Creates a capture backend with the given uid accepting every level.
    #[must_use]
    pub fn new(uid: impl Into<String>) -> Self {
        Self {
            uid: uid.into(),
            min_level: Level::Verbose,
            records: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Sets the lowest accepted level.
    #[must_use]
    pub fn with_min_level(mut self, level: Level) -> Self {
        self.min_level = level;
        self
    }

    /// All captured records.
    #[must_use]
    pub fn records(&self) -> Vec<CapturedRecord> {
        self.records.lock().clone()
    }

    /// Clears captured records.
    pub fn clear(&self) {
        self.records.lock().clear();
    }

    /// Whether any captured message contains `text`.
    #[must_use]
    pub fn contains(&self, text: &str) -> bool {
        self.records
            .lock()
            .iter()
            .any(|r| r.msg.as_deref().is_some_and(|m| m.contains(text)))
    }
}

impl Log for CaptureLog {
    fn uid(&self) -> &str {
        &self.uid
    }

    fn min_level(&self) -> Level {
        self.min_level
    }

    fn log(
        &self,
        level: Level,
        domain: Option<&str>,
        tag: &str,
        msg: Option<&str>,
        err: Option<&(dyn StdError + 'static)>,
    ) -> bool {
        self.records.lock().push(CapturedRecord {
            level,
            domain: domain.map(str::to_string),
            tag: tag.to_string(),
            msg: msg.map(str::to_string),
            err: err.map(ToString::to_string),
        });
        true
    }
}

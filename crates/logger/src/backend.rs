//! Backend trait implemented by every log sink

use crate::{Level, error::BoxError};
use std::error::Error as StdError;

/// A log sink that can be installed into a [`crate::Registry`].
///
/// The registry filters by `min_level()..=max_level()` and then
/// [`Log::is_loggable`] before calling [`Log::log`], so implementations
/// may assume both checks passed.
pub trait Log: Send + Sync + 'static {
    /// Unique identifier. Only one backend per uid can be installed at a time.
    fn uid(&self) -> &str;

    /// Lowest level accepted.
    fn min_level(&self) -> Level;

    /// Highest level accepted.
    fn max_level(&self) -> Level {
        Level::Fatal
    }

    /// Cheap pre-filter applied after the level range check.
    fn is_loggable(&self, _level: Level, _domain: Option<&str>, _tag: &str) -> bool {
        true
    }

    /// Writes a record. `msg` is never empty and at least one of `msg` and
    /// `err` is present.
    ///
    /// Returns `true` if the record was accepted.
    fn log(
        &self,
        level: Level,
        domain: Option<&str>,
        tag: &str,
        msg: Option<&str>,
        err: Option<&(dyn StdError + 'static)>,
    ) -> bool;

    /// Called while the registry installs this backend. An error aborts
    /// the install.
    ///
    /// # Errors
    ///
    /// Implementation defined.
    fn on_install(&self) -> std::result::Result<(), BoxError> {
        Ok(())
    }

    /// Called after the registry removed this backend.
    fn on_uninstall(&self) {}
}

//! Domain/tag bound handle for emitting records

use crate::{
    Level, Registry,
    error::Result,
    validate::{check_domain, check_tag},
};
use std::error::Error as StdError;
use std::fmt;
use std::sync::Arc;

/// A validated `(domain, tag)` pair bound to a [`Registry`].
///
/// Every method returns the number of backends that logged the record.
#[derive(Clone)]
pub struct Logger {
    registry: Arc<Registry>,
    domain: Option<String>,
    tag: String,
}

impl Logger {
    /// Creates a logger after validating `domain` and `tag`.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::InvalidDomain`] or [`crate::Error::InvalidTag`].
    pub fn new(registry: Arc<Registry>, domain: Option<&str>, tag: &str) -> Result<Self> {
        let domain = domain.map(check_domain).transpose()?.map(str::to_string);
        let tag = check_tag(tag)?.to_string();
        Ok(Self {
            registry,
            domain,
            tag,
        })
    }

    /// The domain, if any.
    #[must_use]
    pub fn domain(&self) -> Option<&str> {
        self.domain.as_deref()
    }

    /// The tag.
    #[must_use]
    pub fn tag(&self) -> &str {
        &self.tag
    }

    /// Whether any installed backend would accept a record at `level`.
    #[inline]
    #[must_use]
    pub fn is_loggable(&self, level: Level) -> bool {
        self.registry.is_loggable(level, self.domain(), &self.tag)
    }

    /// Logs a message and/or error at `level`.
    #[inline]
    pub fn log(
        &self,
        level: Level,
        msg: Option<&str>,
        err: Option<&(dyn StdError + 'static)>,
    ) -> usize {
        self.registry.log(level, self.domain(), &self.tag, msg, err)
    }

    /// Logs a lazily built message. The closure only runs if some backend
    /// accepts the record.
    #[inline]
    pub fn log_with(
        &self,
        level: Level,
        err: Option<&(dyn StdError + 'static)>,
        msg: impl FnOnce() -> String,
    ) -> usize {
        if !self.is_loggable(level) {
            return 0;
        }
        let msg = msg();
        self.log(level, Some(&msg), err)
    }

    /// Logs at [`Level::Verbose`].
    #[inline]
    pub fn v(&self, msg: impl AsRef<str>) -> usize {
        self.log(Level::Verbose, Some(msg.as_ref()), None)
    }

    /// Logs at [`Level::Debug`].
    #[inline]
    pub fn d(&self, msg: impl AsRef<str>) -> usize {
        self.log(Level::Debug, Some(msg.as_ref()), None)
    }

    /// Logs at [`Level::Info`].
    #[inline]
    pub fn i(&self, msg: impl AsRef<str>) -> usize {
        self.log(Level::Info, Some(msg.as_ref()), None)
    }

    /// Logs at [`Level::Warn`].
    #[inline]
    pub fn w(&self, msg: impl AsRef<str>) -> usize {
        self.log(Level::Warn, Some(msg.as_ref()), None)
    }

    /// Logs at [`Level::Error`].
    #[inline]
    pub fn e(&self, msg: impl AsRef<str>) -> usize {
        self.log(Level::Error, Some(msg.as_ref()), None)
    }

    /// Logs an error value at [`Level::Error`], with an optional message.
    #[inline]
    pub fn e_err(&self, err: &(dyn StdError + 'static), msg: Option<&str>) -> usize {
        self.log(Level::Error, msg, Some(err))
    }

    /// Logs at [`Level::Fatal`]. Persistent backends commit the record
    /// before this returns.
    #[inline]
    pub fn wtf(&self, msg: impl AsRef<str>) -> usize {
        self.log(Level::Fatal, Some(msg.as_ref()), None)
    }
}

impl PartialEq for Logger {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.registry, &other.registry)
            && self.domain == other.domain
            && self.tag == other.tag
    }
}

impl Eq for Logger {}

impl fmt::Debug for Logger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Logger")
            .field("domain", &self.domain)
            .field("tag", &self.tag)
            .finish_non_exhaustive()
    }
}

//! Registry of installed backends

use crate::{
    Level, Log, Logger,
    error::{Error, Result},
};
use arc_swap::ArcSwap;
use parking_lot::ReentrantMutex;
use std::cell::Cell;
use std::error::Error as StdError;
use std::fmt;
use std::sync::Arc;
use tracing::debug;

/// Root of a logging setup: holds the installed backends and fans records
/// out to them.
///
/// Construct one at process start and share it by `Arc`. Reads are lock-free;
/// install and uninstall are serialized.
pub struct Registry {
    logs: ArcSwap<Vec<Arc<dyn Log>>>,
    // Cell flags an in-progress install/uninstall on the owning thread so a
    // backend hook calling back in fails instead of deadlocking.
    write: ReentrantMutex<Cell<bool>>,
}

struct ReentryReset<'a>(&'a Cell<bool>);

impl Drop for ReentryReset<'_> {
    fn drop(&mut self) {
        self.0.set(false);
    }
}

impl Registry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self {
            logs: ArcSwap::from_pointee(Vec::new()),
            write: ReentrantMutex::new(Cell::new(false)),
        }
    }

    /// Creates an empty registry behind an `Arc`, ready for [`Registry::logger`].
    #[must_use]
    pub fn shared() -> Arc<Self> {
        Arc::new(Self::new())
    }

    fn with_write_guard<R>(&self, f: impl FnOnce() -> Result<R>) -> Result<R> {
        let guard = self.write.lock();
        if guard.get() {
            return Err(Error::Reentrant);
        }
        guard.set(true);
        let _reset = ReentryReset(&guard);
        f()
    }

    /// Installs a backend. Newly installed backends receive records first.
    ///
    /// Returns `Ok(false)` if a backend with the same uid is already installed.
    ///
    /// # Errors
    ///
    /// - [`Error::InvalidUid`] if the uid is empty or contains whitespace.
    /// - [`Error::Reentrant`] if called from a backend lifecycle hook.
    /// - [`Error::Install`] if [`Log::on_install`] failed; the backend is not installed.
    pub fn install(&self, log: Arc<dyn Log>) -> Result<bool> {
        let uid = log.uid();
        if uid.is_empty() || uid.chars().any(char::is_whitespace) {
            return Err(Error::InvalidUid(uid.to_string()));
        }

        self.with_write_guard(|| {
            let current = self.logs.load_full();
            if current.iter().any(|l| l.uid() == uid) {
                return Ok(false);
            }

            log.on_install().map_err(|source| Error::Install {
                uid: uid.to_string(),
                source,
            })?;

            let mut next = Vec::with_capacity(current.len() + 1);
            next.push(Arc::clone(&log));
            next.extend(current.iter().cloned());
            self.logs.store(Arc::new(next));

            debug!(uid, "Log installed");
            Ok(true)
        })
    }

    /// Uninstalls the backend with the given uid.
    ///
    /// Returns `Ok(false)` if no such backend is installed.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Reentrant`] if called from a backend lifecycle hook.
    pub fn uninstall(&self, uid: &str) -> Result<bool> {
        self.with_write_guard(|| {
            let current = self.logs.load_full();
            let Some(index) = current.iter().position(|l| l.uid() == uid) else {
                return Ok(false);
            };

            let mut next = current.as_ref().clone();
            let removed = next.remove(index);
            self.logs.store(Arc::new(next));

            removed.on_uninstall();
            debug!(uid, "Log uninstalled");
            Ok(true)
        })
    }

    /// Uninstalls every backend.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Reentrant`] if called from a backend lifecycle hook.
    pub fn uninstall_all(&self) -> Result<()> {
        self.with_write_guard(|| {
            let removed = self.logs.swap(Arc::new(Vec::new()));
            for log in removed.iter() {
                log.on_uninstall();
                debug!(uid = log.uid(), "Log uninstalled");
            }
            Ok(())
        })
    }

    /// Snapshot of the installed backends.
    #[must_use]
    pub fn installed(&self) -> Vec<Arc<dyn Log>> {
        self.logs.load().as_ref().clone()
    }

    /// Looks up an installed backend by uid.
    #[must_use]
    pub fn get(&self, uid: &str) -> Option<Arc<dyn Log>> {
        self.logs.load().iter().find(|l| l.uid() == uid).cloned()
    }

    /// Creates a [`Logger`] bound to this registry.
    ///
    /// # Errors
    ///
    /// Returns a validation error if `domain` or `tag` is invalid.
    pub fn logger(self: &Arc<Self>, domain: Option<&str>, tag: &str) -> Result<Logger> {
        Logger::new(Arc::clone(self), domain, tag)
    }

    /// Whether any installed backend would accept a record.
    #[must_use]
    pub fn is_loggable(&self, level: Level, domain: Option<&str>, tag: &str) -> bool {
        self.logs
            .load()
            .iter()
            .any(|log| accepts(log.as_ref(), level, domain, tag))
    }

    /// Sends a record to every backend that accepts it.
    ///
    /// `domain` and `tag` are expected to be valid; see [`crate::check_domain`]
    /// and [`crate::check_tag`]. An empty message counts as no message, and a
    /// record without both message and error is ignored.
    ///
    /// Returns the number of backends that logged the record.
    pub fn log(
        &self,
        level: Level,
        domain: Option<&str>,
        tag: &str,
        msg: Option<&str>,
        err: Option<&(dyn StdError + 'static)>,
    ) -> usize {
        let msg = msg.filter(|m| !m.is_empty());
        if msg.is_none() && err.is_none() {
            return 0;
        }

        let logs = self.logs.load();
        let mut logged = 0;
        for log in logs.iter() {
            if !accepts(log.as_ref(), level, domain, tag) {
                continue;
            }
            if log.log(level, domain, tag, msg, err) {
                logged += 1;
            }
        }
        logged
    }
}

fn accepts(log: &dyn Log, level: Level, domain: Option<&str>, tag: &str) -> bool {
    level >= log.min_level() && level <= log.max_level() && log.is_loggable(level, domain, tag)
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Registry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let logs = self.logs.load();
        f.debug_struct("Registry")
            .field("installed", &logs.iter().map(|l| l.uid()).collect::<Vec<_>>())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Counting {
        uid: &'static str,
        min: Level,
        count: AtomicUsize,
    }

    impl Counting {
        fn new(uid: &'static str, min: Level) -> Arc<Self> {
            Arc::new(Self {
                uid,
                min,
                count: AtomicUsize::new(0),
            })
        }
    }

    impl Log for Counting {
        fn uid(&self) -> &str {
            self.uid
        }

        fn min_level(&self) -> Level {
            self.min
        }

        fn log(
            &self,
            _level: Level,
            _domain: Option<&str>,
            _tag: &str,
            _msg: Option<&str>,
            _err: Option<&(dyn StdError + 'static)>,
        ) -> bool {
            self.count.fetch_add(1, Ordering::Relaxed);
            true
        }
    }

    #[test]
    fn test_level_range_filter() {
        let registry = Registry::new();
        let info = Counting::new("info", Level::Info);
        let all = Counting::new("all", Level::Verbose);
        registry.install(info.clone()).unwrap();
        registry.install(all.clone()).unwrap();

        assert_eq!(registry.log(Level::Debug, None, "Tag", Some("m"), None), 1);
        assert_eq!(registry.log(Level::Warn, None, "Tag", Some("m"), None), 2);
        assert_eq!(info.count.load(Ordering::Relaxed), 1);
        assert_eq!(all.count.load(Ordering::Relaxed), 2);
    }

    #[test]
    fn test_empty_record_ignored() {
        let registry = Registry::new();
        let all = Counting::new("all", Level::Verbose);
        registry.install(all.clone()).unwrap();

        assert_eq!(registry.log(Level::Info, None, "Tag", Some(""), None), 0);
        assert_eq!(registry.log(Level::Info, None, "Tag", None, None), 0);
        assert_eq!(all.count.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn test_duplicate_uid() {
        let registry = Registry::new();
        assert!(registry.install(Counting::new("same", Level::Info)).unwrap());
        assert!(!registry.install(Counting::new("same", Level::Info)).unwrap());
        assert_eq!(registry.installed().len(), 1);
        assert!(registry.uninstall("same").unwrap());
        assert!(!registry.uninstall("same").unwrap());
    }

    #[test]
    fn test_invalid_uid() {
        let registry = Registry::new();
        let err = registry.install(Counting::new("has space", Level::Info)).unwrap_err();
        assert!(matches!(err, Error::InvalidUid(_)));
    }
}

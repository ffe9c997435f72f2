//! Bridge from the `log` crate into a [`Registry`]

use crate::{
    Level, Registry,
    validate::{domain_from_target, tag_from_target},
};
use log::{Log, Metadata, Record as LogRecord};
use std::sync::Arc;

/// Wrapper implementing the log crate's `Log` trait on top of a registry.
pub struct LogBridge {
    registry: Arc<Registry>,
}

impl LogBridge {
    /// Create a new log bridge
    #[must_use]
    pub const fn new(registry: Arc<Registry>) -> Self {
        Self { registry }
    }
}

impl Log for LogBridge {
    fn enabled(&self, metadata: &Metadata) -> bool {
        let target = metadata.target();
        let domain = domain_from_target(target);
        let tag = tag_from_target(target);
        self.registry
            .is_loggable(map_level(metadata.level()), domain.as_deref(), &tag)
    }

    fn log(&self, record: &LogRecord) {
        let target = record.target();
        let domain = domain_from_target(target);
        let tag = tag_from_target(target);
        let msg = record.args().to_string();

        self.registry.log(
            map_level(record.level()),
            domain.as_deref(),
            &tag,
            Some(&msg),
            None,
        );
    }

    fn flush(&self) {}
}

/// Map log levels to ours
const fn map_level(level: log::Level) -> Level {
    match level {
        log::Level::Error => Level::Error,
        log::Level::Warn => Level::Warn,
        log::Level::Info => Level::Info,
        log::Level::Debug => Level::Debug,
        log::Level::Trace => Level::Verbose,
    }
}

/// Routes records from the `log` crate macros into `registry`.
///
/// # Errors
///
/// Fails if a global `log` logger is already set.
///
/// # Example
/// ```no_run
/// use spool_logger::{Registry, StdoutLog, compat::init_log_bridge};
/// use std::sync::Arc;
///
/// let registry = Registry::shared();
/// registry.install(Arc::new(StdoutLog::new())).expect("install");
/// init_log_bridge(registry).expect("Failed to set log bridge");
/// ```
pub fn init_log_bridge(registry: Arc<Registry>) -> Result<(), log::SetLoggerError> {
    // log::set_logger requires 'static
    let bridge = Box::leak(Box::new(LogBridge::new(registry)));
    log::set_logger(bridge)?;
    log::set_max_level(log::LevelFilter::Trace);
    Ok(())
}

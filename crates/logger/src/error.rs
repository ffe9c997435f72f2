//! Error types for the logging facade

use thiserror::Error;

/// Boxed error returned by backend lifecycle hooks.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Result type for facade operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in the logging facade
#[derive(Debug, Error)]
pub enum Error {
    /// A domain failed validation.
    #[error("invalid domain[{domain}]: {reason}")]
    InvalidDomain {
        /// The rejected domain.
        domain: String,
        /// Why it was rejected.
        reason: String,
    },

    /// A tag failed validation.
    #[error("invalid tag[{tag}]: {reason}")]
    InvalidTag {
        /// The rejected tag.
        tag: String,
        /// Why it was rejected.
        reason: &'static str,
    },

    /// A backend uid failed validation.
    #[error("invalid uid[{0}]: must be non-empty and contain no whitespace")]
    InvalidUid(String),

    /// Install or uninstall was called from within a backend lifecycle hook.
    #[error("Registry install/uninstall cannot be called from Log::on_install or Log::on_uninstall")]
    Reentrant,

    /// A backend failed to install.
    #[error("failed to install Log[{uid}]: {source}")]
    Install {
        /// Uid of the backend.
        uid: String,
        /// The error raised by [`crate::Log::on_install`].
        #[source]
        source: BoxError,
    },
}

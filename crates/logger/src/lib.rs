//! Structured logging facade with pluggable backends.
//!
//! A [`Registry`] holds installed [`Log`] backends and fans records out to
//! them. [`Logger`] is a validated `(domain, tag)` handle bound to a registry.
//! Backends in this crate:
//! - [`StdoutLog`] (feature `stdout`, colored with feature `color`)
//! - [`test_support::CaptureLog`] (feature `test-support`)
//!
//! Records from the `log` and `tracing` crates can be routed into a registry
//! with the bridges in [`compat`].
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

mod backend;
mod error;
mod level;
mod logger;
mod registry;
mod validate;

pub mod compat;

#[cfg(feature = "stdout")]
mod stdout;

#[cfg(feature = "test-support")]
pub mod test_support;

pub use backend::Log;
pub use error::{BoxError, Error, Result};
pub use level::Level;
pub use logger::Logger;
pub use registry::Registry;
pub use validate::{
    DOMAIN_SEPARATORS, MAX_LEN_DOMAIN, MAX_LEN_TAG, MIN_LEN_DOMAIN, check_domain, check_tag,
    domain_from_target, tag_from_target,
};

#[cfg(feature = "stdout")]
pub use stdout::{STDOUT_LOG_UID, StdoutLog};

//! Compatibility bridges for other logging crates
//!
//! Both bridges derive the record's domain from the first segment of the
//! event target (`my_crate::net` becomes `my-crate`) and use the full target
//! as the tag.

#[cfg(feature = "log-compat")]
pub mod log_bridge;

#[cfg(feature = "tracing-compat")]
pub mod tracing_bridge;

#[cfg(feature = "log-compat")]
pub use log_bridge::{LogBridge, init_log_bridge};

#[cfg(feature = "tracing-compat")]
pub use tracing_bridge::{TracingBridge, init_tracing_bridge};

//! Bridge from `tracing` events into a [`Registry`]

use crate::{
    Level, Registry,
    validate::{domain_from_target, tag_from_target},
};
use std::fmt::Write;
use std::sync::Arc;
use tracing::{Event, Subscriber, field::Visit};
use tracing_subscriber::{Layer, layer::Context, registry::LookupSpan};

/// A tracing layer that forwards events to a registry
pub struct TracingBridge {
    registry: Arc<Registry>,
}

impl TracingBridge {
    /// Create a new tracing bridge
    #[must_use]
    pub const fn new(registry: Arc<Registry>) -> Self {
        Self { registry }
    }
}

impl<S> Layer<S> for TracingBridge
where
    S: Subscriber + for<'a> LookupSpan<'a>,
{
    fn on_event(&self, event: &Event<'_>, ctx: Context<'_, S>) {
        let level = match *event.metadata().level() {
            tracing::Level::ERROR => Level::Error,
            tracing::Level::WARN => Level::Warn,
            tracing::Level::INFO => Level::Info,
            tracing::Level::DEBUG => Level::Debug,
            tracing::Level::TRACE => Level::Verbose,
        };

        let target = event.metadata().target();
        let domain = domain_from_target(target);
        let tag = tag_from_target(target);
        if !self.registry.is_loggable(level, domain.as_deref(), &tag) {
            return;
        }

        let mut visitor = MessageVisitor::default();
        event.record(&mut visitor);

        let spans: Vec<&str> = ctx
            .event_scope(event)
            .map(|scope| scope.from_root().map(|span| span.name()).collect())
            .unwrap_or_default();

        let message = if spans.is_empty() {
            visitor.message
        } else {
            format!("{}: {}", spans.join("::"), visitor.message)
        };

        self.registry
            .log(level, domain.as_deref(), &tag, Some(&message), None);
    }
}

/// Visitor collecting the message and `key=value` fields of an event
#[derive(Default)]
struct MessageVisitor {
    message: String,
}

impl MessageVisitor {
    fn push_field(&mut self, name: &str, value: impl std::fmt::Display) {
        if !self.message.is_empty() {
            self.message.push(' ');
        }
        let _ = write!(self.message, "{name}={value}");
    }

    fn set_message(&mut self, message: &str) {
        if self.message.is_empty() {
            self.message.push_str(message);
        } else {
            self.message.insert_str(0, &format!("{message} "));
        }
    }
}

impl Visit for MessageVisitor {
    fn record_str(&mut self, field: &tracing::field::Field, value: &str) {
        if field.name() == "message" {
            self.set_message(value);
        } else {
            self.push_field(field.name(), value);
        }
    }

    fn record_debug(&mut self, field: &tracing::field::Field, value: &dyn std::fmt::Debug) {
        if field.name() == "message" {
            self.set_message(&format!("{value:?}"));
        } else {
            self.push_field(field.name(), format_args!("{value:?}"));
        }
    }

    fn record_i64(&mut self, field: &tracing::field::Field, value: i64) {
        self.push_field(field.name(), value);
    }

    fn record_u64(&mut self, field: &tracing::field::Field, value: u64) {
        self.push_field(field.name(), value);
    }

    fn record_bool(&mut self, field: &tracing::field::Field, value: bool) {
        self.push_field(field.name(), value);
    }
}

/// Installs a global tracing subscriber forwarding every event to `registry`.
///
/// # Errors
///
/// Fails if a global tracing subscriber is already set.
///
/// # Example
/// ```no_run
/// use spool_logger::{Registry, compat::init_tracing_bridge};
///
/// let registry = Registry::shared();
/// init_tracing_bridge(registry).expect("Failed to set tracing bridge");
/// ```
pub fn init_tracing_bridge(registry: Arc<Registry>) -> Result<(), Box<dyn std::error::Error>> {
    use tracing_subscriber::prelude::*;

    tracing_subscriber::registry()
        .with(TracingBridge::new(registry))
        .try_init()?;

    Ok(())
}

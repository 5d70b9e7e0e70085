//! Log output for parents and children
//!
//! The root process logs to stderr through `tracing_subscriber::fmt`.
//! Children cannot: their stderr is only a side channel pumped by the
//! parent. Instead [`ForwardLayer`] turns every event into a
//! [`LogRecord`] sent on [`FORWARD_LOG`], and the parent re-emits it
//! under the `tether::remote` target with the child's name attached.

use crate::config::LogLevel;
use crate::protocol::{ContextId, LogRecord, Message, FORWARD_LOG};
use crate::router::Router;
use std::cell::Cell;
use std::fmt::{self, Write as _};
use tracing::field::{Field, Visit};
use tracing::{Event, Subscriber};
use tracing_subscriber::layer::{Context as LayerContext, Layer};
use tracing_subscriber::prelude::*;
use tracing_subscriber::EnvFilter;

/// Target under which forwarded child events are re-emitted
pub const REMOTE_TARGET: &str = "tether::remote";

thread_local! {
    /// Set while an event is being forwarded; routing logs too
    static FORWARDING: Cell<bool> = const { Cell::new(false) };
}

/// Install the stderr subscriber for a root process
///
/// `RUST_LOG` wins over `level` when set. Safe to call more than once;
/// later calls are ignored.
pub fn init(level: LogLevel) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(level.as_filter()));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}

/// Install the forwarding subscriber for a child process
pub fn init_child(router: &Router, parent_id: ContextId, level: LogLevel) {
    let layer = ForwardLayer {
        router: router.clone(),
        parent_id,
    };
    let _ = tracing_subscriber::registry()
        .with(layer.with_filter(EnvFilter::new(level.as_filter())))
        .try_init();
}

/// Re-emit a record received from a child
pub fn emit_remote(context: &str, record: &LogRecord) {
    let message = record.message.as_str();
    let source = record.target.as_str();
    match LogLevel::from_u8(record.level) {
        LogLevel::ERROR => tracing::error!(target: REMOTE_TARGET, context, source, "{}", message),
        LogLevel::WARN => tracing::warn!(target: REMOTE_TARGET, context, source, "{}", message),
        LogLevel::INFO => tracing::info!(target: REMOTE_TARGET, context, source, "{}", message),
        LogLevel::DEBUG => tracing::debug!(target: REMOTE_TARGET, context, source, "{}", message),
        _ => tracing::trace!(target: REMOTE_TARGET, context, source, "{}", message),
    }
}

/// Ships each event to the parent context
pub struct ForwardLayer {
    router: Router,
    parent_id: ContextId,
}

impl<S: Subscriber> Layer<S> for ForwardLayer {
    fn on_event(&self, event: &Event<'_>, _ctx: LayerContext<'_, S>) {
        if FORWARDING.with(|flag| flag.replace(true)) {
            return;
        }

        let mut visitor = MessageVisitor::default();
        event.record(&mut visitor);
        let metadata = event.metadata();
        let record = LogRecord {
            level: LogLevel::from_tracing(metadata.level()).as_u8(),
            target: metadata.target().to_string(),
            message: visitor.finish(),
        };

        // Nowhere to report a failure to report
        let _ = Message::encode(self.parent_id, self.router.id(), FORWARD_LOG, &record)
            .and_then(|msg| self.router.route(msg));

        FORWARDING.with(|flag| flag.set(false));
    }
}

/// Flattens an event into `message key=value ...`
#[derive(Default)]
struct MessageVisitor {
    message: String,
    fields: String,
}

impl MessageVisitor {
    fn finish(self) -> String {
        if self.fields.is_empty() {
            self.message
        } else if self.message.is_empty() {
            self.fields
        } else {
            format!("{} {}", self.message, self.fields)
        }
    }
}

impl Visit for MessageVisitor {
    fn record_str(&mut self, field: &Field, value: &str) {
        if field.name() == "message" {
            self.message = value.to_string();
        } else {
            self.record_debug(field, &value);
        }
    }

    fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
        if field.name() == "message" {
            self.message = format!("{:?}", value);
            return;
        }
        if !self.fields.is_empty() {
            self.fields.push(' ');
        }
        let _ = write!(self.fields, "{}={:?}", field.name(), value);
    }
}

#![deny(clippy::pedantic, unsafe_code)]
#![allow(clippy::module_name_repetitions)]

//! Event system for the workhive execution engine
//!
//! Components report what they do by emitting domain events. Every emission
//! is mirrored into `tracing` at the event's own level and, when a consumer
//! subscribed, forwarded over an unbounded channel together with its
//! [`EventMeta`].
//!
//! ## Architecture
//!
//! - **Domain-driven events**: grouped by component (Hub, Worker, Pool)
//! - **Unified `EventEmitter` trait**: one API whether or not a consumer is attached
//! - **Tracing integration**: log level derived from the event variant

pub mod meta;
pub use meta::{EventLevel, EventMeta, EventSource};

pub mod events;
pub use events::{
    AppEvent, EventMessage, FailureContext, GeneralEvent, HubEvent, PoolEvent, WorkerEvent,
};

use tokio::sync::mpsc::UnboundedSender;

/// Sending half of an event subscription
pub type EventSender = UnboundedSender<EventMessage>;

/// Receiving half of an event subscription
pub type EventReceiver = tokio::sync::mpsc::UnboundedReceiver<EventMessage>;

/// Create a new event channel
#[must_use]
pub fn channel() -> (EventSender, EventReceiver) {
    tokio::sync::mpsc::unbounded_channel()
}

/// The unified trait for emitting events throughout workhive
///
/// Implementors without a subscriber still get their events logged.
pub trait EventEmitter {
    /// Get the event sender for this emitter
    fn event_sender(&self) -> Option<&EventSender>;

    /// Optional correlation id stamped on every emitted event
    fn correlation_id(&self) -> Option<String> {
        None
    }

    /// Emit an event through this emitter
    fn emit(&self, event: AppEvent) {
        let mut message = EventMessage::new(event);
        if let Some(correlation_id) = self.correlation_id() {
            message.meta = message.meta.with_correlation_id(correlation_id);
        }
        message.log();
        if let Some(sender) = self.event_sender() {
            // Ignore send errors - if receiver is dropped, we just continue
            let _ = sender.send(message);
        }
    }

    fn emit_debug(&self, message: impl Into<String>) {
        self.emit(AppEvent::General(GeneralEvent::debug(message)));
    }

    fn emit_warning(&self, message: impl Into<String>) {
        self.emit(AppEvent::General(GeneralEvent::warning(message)));
    }

    fn emit_error(&self, message: impl Into<String>) {
        self.emit(AppEvent::General(GeneralEvent::error(message)));
    }
}

impl EventEmitter for EventSender {
    fn event_sender(&self) -> Option<&EventSender> {
        Some(self)
    }
}

impl EventEmitter for Option<EventSender> {
    fn event_sender(&self) -> Option<&EventSender> {
        self.as_ref()
    }
}

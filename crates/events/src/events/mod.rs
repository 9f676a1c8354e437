use serde::{Deserialize, Serialize};

use crate::{EventLevel, EventMeta, EventSource};
use workhive_errors::UserFacingError;

/// Structured failure information shared across domains.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailureContext {
    /// Stable error code, when the error has one.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
    /// Short user-facing message.
    pub message: String,
    /// Optional remediation hint.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hint: Option<String>,
    /// Whether retrying the operation might succeed.
    pub retryable: bool,
}

impl FailureContext {
    /// Construct a new failure context.
    #[must_use]
    pub fn new(
        code: Option<impl Into<String>>,
        message: impl Into<String>,
        hint: Option<impl Into<String>>,
        retryable: bool,
    ) -> Self {
        Self {
            code: code.map(Into::into),
            message: message.into(),
            hint: hint.map(Into::into),
            retryable,
        }
    }

    /// Build failure context from a `UserFacingError` implementation.
    #[must_use]
    pub fn from_error<E: UserFacingError + ?Sized>(error: &E) -> Self {
        Self::new(
            error.user_code(),
            error.user_message().into_owned(),
            error.user_hint(),
            error.is_retryable(),
        )
    }
}

pub mod general;
pub mod hub;
pub mod pool;
pub mod worker;

pub use general::*;
pub use hub::*;
pub use pool::*;
pub use worker::*;

/// Top-level application event enum that aggregates all domain-specific events
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "domain", content = "event", rename_all = "snake_case")]
pub enum AppEvent {
    /// General utility events (warnings, errors, operations)
    General(GeneralEvent),

    /// Rendezvous hub events
    Hub(HubEvent),

    /// Task execution on a single worker
    Worker(WorkerEvent),

    /// Pool scheduling and worker lifecycle
    Pool(PoolEvent),
}

impl AppEvent {
    /// Identify the source domain for this event (used for metadata/logging).
    #[must_use]
    pub fn event_source(&self) -> EventSource {
        match self {
            Self::General(_) => EventSource::General,
            Self::Hub(_) => EventSource::Hub,
            Self::Worker(_) => EventSource::Worker,
            Self::Pool(_) => EventSource::Pool,
        }
    }

    /// Determine the appropriate tracing log level for this event
    #[must_use]
    pub fn log_level(&self) -> tracing::Level {
        use tracing::Level;

        match self {
            Self::General(GeneralEvent::Error { .. }) => Level::ERROR,

            Self::General(GeneralEvent::Warning { .. })
            | Self::Hub(HubEvent::AcceptTimedOut { .. } | HubEvent::ChannelAutoClosed { .. })
            | Self::Pool(PoolEvent::WorkerCrashed { .. } | PoolEvent::Killed { .. })
            | Self::Worker(WorkerEvent::TaskFailed { .. } | WorkerEvent::Killed { .. }) => {
                Level::WARN
            }

            Self::General(GeneralEvent::DebugLog { .. })
            | Self::Hub(
                HubEvent::HandshakeCompleted { .. } | HubEvent::ForeignConnectionDropped { .. },
            )
            | Self::Pool(PoolEvent::Saturated { .. })
            | Self::Worker(
                WorkerEvent::TaskDispatched { .. }
                | WorkerEvent::TaskCompleted { .. }
                | WorkerEvent::CancellationAcknowledged { .. },
            ) => Level::DEBUG,

            _ => Level::INFO,
        }
    }

    /// Get the log target for this event (for structured logging)
    #[must_use]
    pub fn log_target(&self) -> &'static str {
        match self {
            Self::General(_) => "workhive::events::general",
            Self::Hub(_) => "workhive::events::hub",
            Self::Worker(_) => "workhive::events::worker",
            Self::Pool(_) => "workhive::events::pool",
        }
    }
}

/// An event together with its emission metadata
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventMessage {
    pub meta: EventMeta,
    pub event: AppEvent,
}

impl EventMessage {
    /// Wrap an event, deriving level and source from the event itself
    #[must_use]
    pub fn new(event: AppEvent) -> Self {
        let meta = EventMeta::new(EventLevel::from(event.log_level()), event.event_source());
        Self { meta, event }
    }

    #[must_use]
    pub fn with_meta(meta: EventMeta, event: AppEvent) -> Self {
        Self { meta, event }
    }

    /// Mirror this event into the tracing subscriber at its own level
    pub fn log(&self) {
        use tracing::Level;

        let source = self.meta.source.as_str();
        let event_id = self.meta.event_id;
        let correlation = self.meta.correlation_id.as_deref();
        match self.meta.tracing_level() {
            Level::ERROR => {
                tracing::error!(source, %event_id, ?correlation, event = ?self.event, "event");
            }
            Level::WARN => {
                tracing::warn!(source, %event_id, ?correlation, event = ?self.event, "event");
            }
            Level::INFO => {
                tracing::info!(source, %event_id, ?correlation, event = ?self.event, "event");
            }
            Level::DEBUG => {
                tracing::debug!(source, %event_id, ?correlation, event = ?self.event, "event");
            }
            Level::TRACE => {
                tracing::trace!(source, %event_id, ?correlation, event = ?self.event, "event");
            }
        }
    }
}

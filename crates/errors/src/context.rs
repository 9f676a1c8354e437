//! Errors raised while starting, talking to or stopping a worker context

use std::borrow::Cow;

use crate::UserFacingError;
use thiserror::Error;

#[derive(Debug, Clone, Error)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum ContextError {
    #[error("could not create IPC server: {message}")]
    HubUnavailable { message: String },

    #[error("starting the process timed out")]
    StartupTimeout,

    #[error("failed to spawn {command}: {message}")]
    SpawnFailed { command: String, message: String },

    #[error("the context has not been started")]
    NotStarted,

    #[error("the context has already been started")]
    AlreadyStarted,

    #[error("the context stopped responding: {message}")]
    StoppedResponding { message: String },

    #[error("failed to receive result from context: {message}")]
    FailedToReceiveResult { message: String },

    /// The remote side reported an uncaught failure before exiting
    #[error("uncaught {type_name} in context: {message}")]
    Panic {
        type_name: String,
        message: String,
        causes: Vec<String>,
    },

    #[error("the channel has been closed")]
    Closed,

    #[error("invalid endpoint: {uri}")]
    InvalidEndpoint { uri: String },
}

impl ContextError {
    /// Shorthand for a disconnect after the channel was healthy
    pub fn stopped_responding(message: impl Into<String>) -> Self {
        Self::StoppedResponding {
            message: message.into(),
        }
    }

    /// Shorthand for a join/receive that could not complete
    pub fn failed_to_receive(message: impl Into<String>) -> Self {
        Self::FailedToReceiveResult {
            message: message.into(),
        }
    }
}

impl UserFacingError for ContextError {
    fn user_message(&self) -> Cow<'_, str> {
        Cow::Owned(self.to_string())
    }

    fn user_hint(&self) -> Option<&'static str> {
        match self {
            Self::HubUnavailable { .. } => {
                Some("Check that the temporary directory is writable.")
            }
            Self::StartupTimeout => {
                Some("The worker never connected back; check that its entry point runs.")
            }
            Self::SpawnFailed { .. } => Some("Verify the worker command exists and is executable."),
            _ => None,
        }
    }

    fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::StartupTimeout | Self::SpawnFailed { .. } | Self::StoppedResponding { .. }
        )
    }

    fn user_code(&self) -> Option<&'static str> {
        Some(match self {
            Self::HubUnavailable { .. } => "context.hub_unavailable",
            Self::StartupTimeout => "context.startup_timeout",
            Self::SpawnFailed { .. } => "context.spawn_failed",
            Self::NotStarted => "context.not_started",
            Self::AlreadyStarted => "context.already_started",
            Self::StoppedResponding { .. } => "context.stopped_responding",
            Self::FailedToReceiveResult { .. } => "context.no_result",
            Self::Panic { .. } => "context.panic",
            Self::Closed => "context.closed",
            Self::InvalidEndpoint { .. } => "context.invalid_endpoint",
        })
    }
}

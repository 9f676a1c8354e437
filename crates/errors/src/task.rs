//! Failures raised by a task while it ran on a worker

use std::borrow::Cow;

use crate::UserFacingError;
use thiserror::Error;

/// Distinguishes what went wrong inside the remote task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "snake_case"))]
pub enum TaskFailureKind {
    /// An expected failure returned by the task
    Exception,
    /// A programming error (bad input, unknown task, unserializable result)
    Error,
    /// The task panicked
    Panic,
}

impl TaskFailureKind {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Exception => "exception",
            Self::Error => "error",
            Self::Panic => "panic",
        }
    }
}

/// A task failure carried back across the process boundary.
///
/// The original type name and message are preserved verbatim, and the chain
/// of causes is rebuilt as nested `TaskError`s reachable through
/// [`std::error::Error::source`].
#[derive(Debug, Clone, Error)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[error("uncaught {type_name} in worker: {message}")]
pub struct TaskError {
    kind: TaskFailureKind,
    type_name: String,
    message: String,
    #[source]
    previous: Option<Box<TaskError>>,
}

impl TaskError {
    pub fn new(
        kind: TaskFailureKind,
        type_name: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            kind,
            type_name: type_name.into(),
            message: message.into(),
            previous: None,
        }
    }

    /// An expected failure returned by a task
    pub fn exception(type_name: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(TaskFailureKind::Exception, type_name, message)
    }

    /// Capture `err` together with its `source` chain. Causes keep their
    /// messages; their concrete types are not recoverable and are reported
    /// as `error` exceptions.
    pub fn from_error<E>(kind: TaskFailureKind, err: &E) -> Self
    where
        E: std::error::Error + ?Sized,
    {
        let mut causes = Vec::new();
        let mut source = err.source();
        while let Some(cause) = source {
            causes.push(cause.to_string());
            source = cause.source();
        }

        let previous = causes.into_iter().rev().fold(None, |previous, message| {
            let mut cause = Self::exception("error", message);
            cause.previous = previous.map(Box::new);
            Some(cause)
        });

        let mut error = Self::new(kind, std::any::type_name::<E>(), err.to_string());
        error.previous = previous.map(Box::new);
        error
    }

    #[must_use]
    pub fn with_previous(mut self, previous: TaskError) -> Self {
        self.previous = Some(Box::new(previous));
        self
    }

    #[must_use]
    pub fn kind(&self) -> TaskFailureKind {
        self.kind
    }

    /// Type name of the failure as reported by the worker
    #[must_use]
    pub fn original_type_name(&self) -> &str {
        &self.type_name
    }

    /// Message of the failure as reported by the worker
    #[must_use]
    pub fn original_message(&self) -> &str {
        &self.message
    }

    #[must_use]
    pub fn previous(&self) -> Option<&TaskError> {
        self.previous.as_deref()
    }

    /// Iterate over this failure followed by each of its causes
    pub fn chain(&self) -> impl Iterator<Item = &TaskError> {
        std::iter::successors(Some(self), |err| err.previous())
    }
}

impl UserFacingError for TaskError {
    fn user_message(&self) -> Cow<'_, str> {
        Cow::Borrowed(&self.message)
    }

    fn user_code(&self) -> Option<&'static str> {
        Some(match self.kind {
            TaskFailureKind::Exception => "task.exception",
            TaskFailureKind::Error => "task.error",
            TaskFailureKind::Panic => "task.panic",
        })
    }
}

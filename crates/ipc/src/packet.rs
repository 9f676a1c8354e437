//! Envelope exchanged between a context and its remote side

use std::any::Any;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use workhive_errors::ContextError;

/// One frame on a context channel
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "packet", content = "body", rename_all = "snake_case")]
pub enum Packet {
    /// Application message
    Data(Value),
    /// Final frame sent by the remote side before it exits
    Exit(ExitResult),
}

/// Outcome of the remote entry point
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", content = "value", rename_all = "snake_case")]
pub enum ExitResult {
    Success(Value),
    Failure(PanicReport),
}

impl ExitResult {
    /// Unwrap into the exit value, or the remote failure as an error
    ///
    /// # Errors
    ///
    /// Returns `ContextError::Panic` for a failed exit.
    pub fn into_result(self) -> Result<Value, ContextError> {
        match self {
            Self::Success(value) => Ok(value),
            Self::Failure(report) => Err(report.into()),
        }
    }
}

/// Description of an uncaught failure on the remote side
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PanicReport {
    pub type_name: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub causes: Vec<String>,
}

impl PanicReport {
    /// Capture an error together with its `source()` chain
    pub fn from_error<E>(error: &E) -> Self
    where
        E: std::error::Error + ?Sized,
    {
        let mut causes = Vec::new();
        let mut source = error.source();
        while let Some(cause) = source {
            causes.push(cause.to_string());
            source = cause.source();
        }

        Self {
            type_name: std::any::type_name::<E>().to_string(),
            message: error.to_string(),
            causes,
        }
    }

    /// Capture a panic payload as returned by `catch_unwind`
    #[must_use]
    pub fn from_panic(payload: &(dyn Any + Send)) -> Self {
        Self {
            type_name: "panic".to_string(),
            message: panic_message(payload),
            causes: Vec::new(),
        }
    }
}

impl From<PanicReport> for ContextError {
    fn from(report: PanicReport) -> Self {
        ContextError::Panic {
            type_name: report.type_name,
            message: report.message,
            causes: report.causes,
        }
    }
}

/// Best-effort text of a panic payload
#[must_use]
pub fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&'static str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "Box<dyn Any>".to_string()
    }
}

//! Messages exchanged between a [`crate::Worker`] and its remote runner

use serde::{Deserialize, Serialize};
use serde_json::Value;
use workhive_errors::{TaskError, TaskFailureKind};

/// Parent to worker
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Request {
    /// Run the task registered as `task` with the serialized task value
    Run { id: u64, task: String, payload: Value },
    /// The caller gave up on task `id`; the runner still replies for it
    Cancel { id: u64 },
    /// Stop serving and exit with code 0
    Shutdown,
}

/// Worker to parent; exactly one reply per `Request::Run`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Reply {
    Completed { id: u64, value: Value },
    Failed { id: u64, failure: FailureEnvelope },
    /// The payload or the result could not pass through serde
    Malformed { id: u64, message: String },
}

impl Reply {
    /// Id of the task this reply answers
    #[must_use]
    pub fn id(&self) -> u64 {
        match self {
            Self::Completed { id, .. } | Self::Failed { id, .. } | Self::Malformed { id, .. } => {
                *id
            }
        }
    }
}

/// A task failure in transit, innermost cause last
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureEnvelope {
    pub kind: TaskFailureKind,
    pub type_name: String,
    pub message: String,
    #[serde(default)]
    pub causes: Vec<FailureCause>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureCause {
    pub type_name: String,
    pub message: String,
}

impl FailureEnvelope {
    /// Envelope for a task that panicked with `message`
    pub fn panic(message: impl Into<String>) -> Self {
        Self {
            kind: TaskFailureKind::Panic,
            type_name: "panic".to_string(),
            message: message.into(),
            causes: Vec::new(),
        }
    }

    /// Envelope for a programming error such as an unregistered task
    pub fn error(type_name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind: TaskFailureKind::Error,
            type_name: type_name.into(),
            message: message.into(),
            causes: Vec::new(),
        }
    }
}

impl From<&TaskError> for FailureEnvelope {
    fn from(err: &TaskError) -> Self {
        Self {
            kind: err.kind(),
            type_name: err.original_type_name().to_string(),
            message: err.original_message().to_string(),
            causes: err
                .chain()
                .skip(1)
                .map(|cause| FailureCause {
                    type_name: cause.original_type_name().to_string(),
                    message: cause.original_message().to_string(),
                })
                .collect(),
        }
    }
}

impl From<FailureEnvelope> for TaskError {
    fn from(envelope: FailureEnvelope) -> Self {
        let previous = envelope
            .causes
            .into_iter()
            .rev()
            .fold(None::<TaskError>, |previous, cause| {
                let error = TaskError::exception(cause.type_name, cause.message);
                Some(match previous {
                    Some(previous) => error.with_previous(previous),
                    None => error,
                })
            });

        let error = TaskError::new(envelope.kind, envelope.type_name, envelope.message);
        match previous {
            Some(previous) => error.with_previous(previous),
            None => error,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn request_wire_shape() {
        let run = Request::Run {
            id: 3,
            task: "sleep".to_string(),
            payload: json!({"millis": 10}),
        };
        assert_eq!(
            serde_json::to_value(&run).unwrap(),
            json!({"type": "run", "id": 3, "task": "sleep", "payload": {"millis": 10}})
        );
        assert_eq!(
            serde_json::to_value(Request::Shutdown).unwrap(),
            json!({"type": "shutdown"})
        );
    }

    #[test]
    fn failure_kind_is_snake_case() {
        let reply = Reply::Failed {
            id: 9,
            failure: FailureEnvelope::panic("boom"),
        };
        let value = serde_json::to_value(&reply).unwrap();
        assert_eq!(value["failure"]["kind"], "panic");
        assert_eq!(reply.id(), 9);
    }

    #[test]
    fn envelope_preserves_cause_chain() {
        let err = TaskError::exception("ParseError", "bad header").with_previous(
            TaskError::exception("IoError", "truncated")
                .with_previous(TaskError::exception("OsError", "EIO")),
        );

        let envelope = FailureEnvelope::from(&err);
        assert_eq!(envelope.causes.len(), 2);
        assert_eq!(envelope.causes[1].type_name, "OsError");

        let rebuilt = TaskError::from(envelope);
        let names: Vec<_> = rebuilt.chain().map(TaskError::original_type_name).collect();
        assert_eq!(names, ["ParseError", "IoError", "OsError"]);
        assert_eq!(rebuilt.kind(), TaskFailureKind::Exception);
    }
}

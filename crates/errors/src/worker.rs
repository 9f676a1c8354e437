//! Worker and pool scheduling errors

use thiserror::Error;

use crate::UserFacingError;
use std::borrow::Cow;

#[derive(Debug, Clone, Error)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum WorkerError {
    #[error("worker factory did not create a viable worker")]
    NotViable,

    #[error("the pool shut down before the task could be executed")]
    PoolShutdown,

    #[error("the pool was killed before the task could be executed")]
    PoolKilled,

    #[error("no task named {name} is registered with the worker")]
    UnknownTask { name: String },

    #[error("worker {worker_id} did not acknowledge cancellation within {seconds}s")]
    CancelNotAcknowledged { worker_id: u64, seconds: u64 },

    #[error("unexpected reply from worker: {message}")]
    UnexpectedReply { message: String },
}

impl UserFacingError for WorkerError {
    fn user_message(&self) -> Cow<'_, str> {
        Cow::Owned(self.to_string())
    }

    fn user_hint(&self) -> Option<&'static str> {
        match self {
            Self::UnknownTask { .. } => Some("Register the task type in the worker's registry."),
            Self::NotViable => Some("Check the worker factory and the worker entry point."),
            _ => None,
        }
    }

    fn is_retryable(&self) -> bool {
        matches!(self, Self::NotViable)
    }

    fn user_code(&self) -> Option<&'static str> {
        Some(match self {
            Self::NotViable => "worker.not_viable",
            Self::PoolShutdown => "worker.pool_shutdown",
            Self::PoolKilled => "worker.pool_killed",
            Self::UnknownTask { .. } => "worker.unknown_task",
            Self::CancelNotAcknowledged { .. } => "worker.cancel_unacknowledged",
            Self::UnexpectedReply { .. } => "worker.unexpected_reply",
        })
    }
}

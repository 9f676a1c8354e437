use serde::{Deserialize, Serialize};

use super::FailureContext;

/// Per-worker task execution events
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum WorkerEvent {
    /// A task was handed to the worker
    TaskDispatched {
        worker_id: u64,
        task_id: u64,
        task: String,
    },

    /// The remote side returned a result
    TaskCompleted {
        worker_id: u64,
        task_id: u64,
        duration_ms: u64,
    },

    /// The remote task failed
    TaskFailed {
        worker_id: u64,
        task_id: u64,
        failure: FailureContext,
    },

    /// The caller cancelled; the worker stays reserved until acknowledged
    TaskCancelled { worker_id: u64, task_id: u64 },

    /// The remote side acknowledged a cancelled task
    CancellationAcknowledged { worker_id: u64, task_id: u64 },

    /// Graceful shutdown finished
    ShutDown { worker_id: u64, exit_code: i32 },

    /// The worker was forcibly terminated
    Killed { worker_id: u64 },
}

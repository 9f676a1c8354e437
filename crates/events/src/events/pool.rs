use serde::{Deserialize, Serialize};

/// Pool scheduling events
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum PoolEvent {
    /// The factory produced a new worker
    WorkerSpawned { worker_id: u64, worker_count: usize },

    /// Every worker is busy and the pool is at capacity
    Saturated { max_size: usize },

    /// A worker was found dead and detached from the pool
    WorkerCrashed {
        worker_id: u64,
        exit_code: Option<i32>,
        error: Option<String>,
    },

    /// Graceful shutdown of all workers started
    ShutdownStarted { worker_count: usize },

    /// Graceful shutdown finished with an aggregated exit code
    ShutdownCompleted { exit_code: i32 },

    /// All workers were force-killed
    Killed { worker_count: usize },
}

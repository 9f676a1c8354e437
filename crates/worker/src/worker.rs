//! One worker context adapted to the task contract

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::Value;
use tokio::sync::{Mutex, OnceCell};
use tokio_util::sync::CancellationToken;
use workhive_config::PoolConfig;
use workhive_errors::{Error, Result, TaskError, WorkerError};
use workhive_events::{AppEvent, EventEmitter, EventSender, FailureContext, WorkerEvent};
use workhive_ipc::{Context, ContextExt};

use crate::protocol::{Reply, Request};
use crate::task::Task;

static NEXT_WORKER_ID: AtomicU64 = AtomicU64::new(1);

/// Settings shared by every worker a factory creates
#[derive(Debug, Clone)]
pub struct WorkerOptions {
    /// How long a cancelled task may keep its worker busy before the worker
    /// is killed
    pub cancel_ack_timeout: Duration,
    pub events: Option<EventSender>,
}

impl Default for WorkerOptions {
    fn default() -> Self {
        Self::from_config(&PoolConfig::default())
    }
}

impl WorkerOptions {
    #[must_use]
    pub fn from_config(config: &PoolConfig) -> Self {
        Self {
            cancel_ack_timeout: config.cancel_ack_timeout(),
            events: None,
        }
    }

    #[must_use]
    pub fn with_events(mut self, events: EventSender) -> Self {
        self.events = Some(events);
        self
    }
}

/// Runs tasks on one started [`Context`], one at a time.
///
/// Concurrent [`Worker::enqueue`] calls queue behind each other. A cancelled
/// task keeps the worker busy until the remote side has replied for it.
pub struct Worker {
    id: u64,
    context: Arc<dyn Context>,
    exec: Arc<Mutex<()>>,
    next_task_id: AtomicU64,
    closed: AtomicBool,
    killed: AtomicBool,
    shutdown: OnceCell<Result<i32>>,
    options: WorkerOptions,
}

impl EventEmitter for Worker {
    fn event_sender(&self) -> Option<&EventSender> {
        self.options.events.as_ref()
    }
}

impl Worker {
    /// Wrap an already started context
    #[must_use]
    pub fn new(context: Arc<dyn Context>, options: WorkerOptions) -> Self {
        Self {
            id: NEXT_WORKER_ID.fetch_add(1, Ordering::Relaxed),
            context,
            exec: Arc::new(Mutex::new(())),
            next_task_id: AtomicU64::new(1),
            closed: AtomicBool::new(false),
            killed: AtomicBool::new(false),
            shutdown: OnceCell::new(),
            options,
        }
    }

    /// Start `context` and wrap it
    ///
    /// # Errors
    ///
    /// Returns the context's startup error.
    pub async fn start(context: Arc<dyn Context>, options: WorkerOptions) -> Result<Self> {
        context.start().await?;
        Ok(Self::new(context, options))
    }

    /// Process-unique id
    #[must_use]
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Run `task` on this worker and return its output.
    ///
    /// # Errors
    ///
    /// - `Error::Status` if the worker has been shut down or killed
    /// - `Error::Serialization` if the task or its output does not pass
    ///   through serde; the worker stays usable
    /// - `Error::Task` if the task failed remotely
    /// - `Error::Cancelled` if `cancel` fired first
    /// - a context error if the worker crashed
    pub async fn enqueue<T: Task>(&self, task: &T, cancel: CancellationToken) -> Result<T::Output> {
        self.ensure_open()?;
        let payload = serde_json::to_value(task)?;
        let value = self.execute(T::NAME, payload, cancel).await?;
        serde_json::from_value(value).map_err(Error::from)
    }

    /// Untyped form of [`Worker::enqueue`]: run the task registered as
    /// `name` with an already serialized payload.
    ///
    /// # Errors
    ///
    /// Same as [`Worker::enqueue`].
    pub async fn execute(
        &self,
        name: &str,
        payload: Value,
        cancel: CancellationToken,
    ) -> Result<Value> {
        self.ensure_open()?;

        let guard = tokio::select! {
            biased;
            () = cancel.cancelled() => return Err(Error::Cancelled),
            guard = Arc::clone(&self.exec).lock_owned() => guard,
        };
        // Shut down while queued
        self.ensure_open()?;

        let task_id = self.next_task_id.fetch_add(1, Ordering::Relaxed);
        let context = Arc::clone(&self.context);
        context
            .send_message(&Request::Run {
                id: task_id,
                task: name.to_string(),
                payload,
            })
            .await?;
        self.emit(AppEvent::Worker(WorkerEvent::TaskDispatched {
            worker_id: self.id,
            task_id,
            task: name.to_string(),
        }));

        let started = Instant::now();
        tokio::select! {
            biased;
            reply = receive_reply(context.as_ref(), task_id) => {
                self.resolve(task_id, started, reply?)
            }
            () = cancel.cancelled() => {
                self.emit(AppEvent::Worker(WorkerEvent::TaskCancelled {
                    worker_id: self.id,
                    task_id,
                }));
                if let Err(err) = context.send_message(&Request::Cancel { id: task_id }).await {
                    tracing::debug!(
                        worker_id = self.id,
                        error = %err,
                        "could not deliver cancel notice"
                    );
                }

                let drain = CancelDrain {
                    worker_id: self.id,
                    task_id,
                    context,
                    timeout: self.options.cancel_ack_timeout,
                    events: self.options.events.clone(),
                };
                tokio::spawn(async move {
                    drain.await_ack().await;
                    drop(guard);
                });
                Err(Error::Cancelled)
            }
        }
    }

    fn resolve(&self, task_id: u64, started: Instant, reply: Reply) -> Result<Value> {
        match reply {
            Reply::Completed { value, .. } => {
                self.emit(AppEvent::Worker(WorkerEvent::TaskCompleted {
                    worker_id: self.id,
                    task_id,
                    duration_ms: u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX),
                }));
                Ok(value)
            }
            Reply::Failed { failure, .. } => {
                let err = Error::Task(TaskError::from(failure));
                self.emit(AppEvent::Worker(WorkerEvent::TaskFailed {
                    worker_id: self.id,
                    task_id,
                    failure: FailureContext::from_error(&err),
                }));
                Err(err)
            }
            Reply::Malformed { message, .. } => Err(Error::serialization(message)),
        }
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::status("The worker has been shut down"));
        }
        Ok(())
    }

    /// True iff no task is in flight, including a cancelled task whose
    /// reply has not arrived yet
    #[must_use]
    pub fn is_idle(&self) -> bool {
        self.exec.try_lock().is_ok()
    }

    /// Wait until the task in flight, if any, has finished
    pub async fn wait_idle(&self) {
        drop(self.exec.lock().await);
    }

    #[must_use]
    pub fn is_running(&self) -> bool {
        self.context.is_running()
    }

    /// Finish the task in flight, ask the worker to exit and return its exit
    /// code. Every call returns the result of the first.
    ///
    /// # Errors
    ///
    /// Returns the context error if the worker had crashed or was killed.
    pub async fn shutdown(&self) -> Result<i32> {
        self.shutdown
            .get_or_init(|| self.shutdown_once())
            .await
            .clone()
    }

    async fn shutdown_once(&self) -> Result<i32> {
        self.closed.store(true, Ordering::Release);
        let _exec = self.exec.lock().await;

        let exit = if self.context.is_running() {
            match self.context.send_message(&Request::Shutdown).await {
                Ok(()) => self.context.join().await,
                Err(err) => Err(err),
            }
        } else {
            self.context.join().await
        };

        let code = exit.map(|value| exit_code(&value));
        match &code {
            Ok(exit_code) => {
                self.emit(AppEvent::Worker(WorkerEvent::ShutDown {
                    worker_id: self.id,
                    exit_code: *exit_code,
                }));
            }
            Err(err) => {
                tracing::debug!(worker_id = self.id, error = %err, "worker did not exit cleanly");
            }
        }
        code
    }

    /// Terminate the worker immediately without waiting for it
    pub fn kill(&self) {
        self.closed.store(true, Ordering::Release);
        if self.killed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.context.kill();
        self.emit(AppEvent::Worker(WorkerEvent::Killed { worker_id: self.id }));
    }
}

impl std::fmt::Debug for Worker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Worker")
            .field("id", &self.id)
            .field("running", &self.is_running())
            .field("idle", &self.is_idle())
            .finish_non_exhaustive()
    }
}

/// Holds a worker reserved until the remote side replies for a cancelled
/// task, killing the worker if that takes longer than `timeout`
struct CancelDrain {
    worker_id: u64,
    task_id: u64,
    context: Arc<dyn Context>,
    timeout: Duration,
    events: Option<EventSender>,
}

impl CancelDrain {
    async fn await_ack(self) {
        let Self {
            worker_id,
            task_id,
            context,
            timeout,
            events,
        } = self;

        match tokio::time::timeout(timeout, receive_reply(context.as_ref(), task_id)).await {
            Ok(Ok(_)) => {
                events.emit(AppEvent::Worker(WorkerEvent::CancellationAcknowledged {
                    worker_id,
                    task_id,
                }));
            }
            Ok(Err(err)) => {
                tracing::debug!(
                    worker_id,
                    task_id,
                    error = %err,
                    "worker went away before acknowledging cancellation"
                );
            }
            Err(_) => {
                let err = WorkerError::CancelNotAcknowledged {
                    worker_id,
                    seconds: timeout.as_secs(),
                };
                tracing::warn!(worker_id, task_id, "{err}");
                context.kill();
                events.emit(AppEvent::Worker(WorkerEvent::Killed { worker_id }));
            }
        }
    }
}

/// Wait for the reply to `task_id`, skipping replies to earlier tasks
async fn receive_reply(context: &dyn Context, task_id: u64) -> Result<Reply> {
    loop {
        let reply: Reply = context.receive_message().await?;
        if reply.id() == task_id {
            return Ok(reply);
        }
        tracing::debug!(expected = task_id, received = reply.id(), "discarding stale reply");
    }
}

fn exit_code(value: &Value) -> i32 {
    value
        .as_i64()
        .and_then(|code| i32::try_from(code).ok())
        .unwrap_or(0)
}

//! Remote side of a worker: receive requests, run tasks, reply

use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::FutureExt;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use workhive_errors::{Error, Result};
use workhive_ipc::packet::panic_message;
use workhive_ipc::RemoteChannel;

use crate::environment::Environment;
use crate::protocol::{FailureEnvelope, Reply, Request};
use crate::task::{RunFailure, TaskRegistry};

/// What the serve loop does after a task finished
enum Flow {
    Continue,
    Exit,
}

/// Serves task requests for one worker until told to shut down.
///
/// Tasks run strictly one after another against a single [`Environment`].
#[derive(Clone, Debug)]
pub struct Runner {
    registry: Arc<TaskRegistry>,
    environment: Environment,
}

impl Runner {
    #[must_use]
    pub fn new(registry: TaskRegistry) -> Self {
        Self::with_environment(registry, Environment::default())
    }

    #[must_use]
    pub fn with_environment(registry: TaskRegistry, environment: Environment) -> Self {
        Self {
            registry: Arc::new(registry),
            environment,
        }
    }

    #[must_use]
    pub fn environment(&self) -> &Environment {
        &self.environment
    }

    /// Serve requests arriving on `remote`; resolves with exit code 0 once a
    /// `Request::Shutdown` is received.
    ///
    /// # Errors
    ///
    /// Returns a channel error if the parent disappears.
    pub async fn serve(self, remote: RemoteChannel) -> Result<Value> {
        loop {
            let request = match remote.receive::<Request>().await {
                Ok(request) => request,
                Err(Error::Serialization { message }) => {
                    tracing::warn!(%message, "ignoring malformed request");
                    continue;
                }
                Err(err) => return Err(err),
            };

            match request {
                Request::Run { id, task, payload } => {
                    if let Flow::Exit = self.run(&remote, id, &task, payload).await? {
                        return Ok(Value::from(0));
                    }
                }
                Request::Cancel { id } => {
                    tracing::debug!(task_id = id, "cancel for a task that already finished");
                }
                Request::Shutdown => {
                    tracing::debug!("shutdown requested");
                    return Ok(Value::from(0));
                }
            }
        }
    }

    async fn run(
        &self,
        remote: &RemoteChannel,
        id: u64,
        task: &str,
        payload: Value,
    ) -> Result<Flow> {
        let Some(handler) = self.registry.handler(task) else {
            let failure = FailureEnvelope::error(
                "UnknownTask",
                format!("no task named {task} is registered with the worker"),
            );
            remote.send(&Reply::Failed { id, failure }).await?;
            return Ok(Flow::Continue);
        };

        tracing::debug!(task_id = id, task, "running task");
        let cancel = CancellationToken::new();
        let mut running =
            AssertUnwindSafe(handler(payload, self.environment.clone(), cancel.clone()))
                .catch_unwind();
        let mut flow = Flow::Continue;

        // Keep reading while the task runs so cancel notices get through
        let outcome = loop {
            tokio::select! {
                outcome = &mut running => break outcome,
                request = remote.receive::<Request>() => match request {
                    Ok(Request::Cancel { id: cancelled }) if cancelled == id => {
                        tracing::debug!(task_id = id, "task cancelled by the parent");
                        cancel.cancel();
                    }
                    Ok(Request::Cancel { .. }) => {}
                    Ok(Request::Shutdown) => {
                        cancel.cancel();
                        flow = Flow::Exit;
                    }
                    Ok(Request::Run { id: other, .. }) => {
                        tracing::warn!(
                            task_id = other,
                            busy_with = id,
                            "dropping run request while busy"
                        );
                    }
                    Err(Error::Serialization { message }) => {
                        tracing::warn!(%message, "ignoring malformed request");
                    }
                    Err(err) => return Err(err),
                },
            }
        };

        let reply = match outcome {
            Ok(Ok(value)) => Reply::Completed { id, value },
            Ok(Err(RunFailure::Task(err))) => Reply::Failed {
                id,
                failure: FailureEnvelope::from(&err),
            },
            Ok(Err(RunFailure::Malformed(message))) => Reply::Malformed { id, message },
            Err(payload) => {
                let message = panic_message(payload.as_ref());
                tracing::error!(task_id = id, task, %message, "task panicked");
                Reply::Failed {
                    id,
                    failure: FailureEnvelope::panic(message),
                }
            }
        };
        remote.send(&reply).await?;
        Ok(flow)
    }
}

//! The task contract and the registry a worker dispatches by name

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::{BoxFuture, FutureExt};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use workhive_errors::TaskError;

use crate::environment::Environment;

/// A unit of work that can be shipped to a worker.
///
/// The task value itself is the payload: it is serialized on the parent,
/// sent to the worker, deserialized there and run. Workers only run tasks
/// whose [`Task::NAME`] was registered with their [`TaskRegistry`].
#[async_trait]
pub trait Task: Serialize + DeserializeOwned + Send + Sync + 'static {
    /// Name the task is registered and dispatched under
    const NAME: &'static str;

    type Output: Serialize + DeserializeOwned + Send + 'static;

    /// Run the task on the worker.
    ///
    /// `env` persists across the tasks that run on the same worker.
    /// `cancel` fires when the caller gave up on the result; honoring it is
    /// up to the task.
    ///
    /// # Errors
    ///
    /// Any [`TaskError`] is carried back to the caller unchanged.
    async fn run(&self, env: &Environment, cancel: CancellationToken)
        -> Result<Self::Output, TaskError>;
}

/// Why a registered task produced no value
#[derive(Debug)]
pub(crate) enum RunFailure {
    Task(TaskError),
    /// The payload or the result did not pass through serde
    Malformed(String),
}

pub(crate) type Handler = Arc<
    dyn Fn(Value, Environment, CancellationToken) -> BoxFuture<'static, Result<Value, RunFailure>>
        + Send
        + Sync,
>;

/// Task types a worker is able to run
#[derive(Clone, Default)]
pub struct TaskRegistry {
    handlers: HashMap<&'static str, Handler>,
}

impl TaskRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Make `T` runnable. Registering a name twice keeps the last type.
    #[must_use]
    pub fn register<T: Task>(mut self) -> Self {
        let handler: Handler = Arc::new(
            |payload: Value, env: Environment, cancel: CancellationToken| {
                async move {
                    let task: T = serde_json::from_value(payload).map_err(|err| {
                        RunFailure::Malformed(format!("invalid payload for task {}: {err}", T::NAME))
                    })?;
                    let output = task.run(&env, cancel).await.map_err(RunFailure::Task)?;
                    serde_json::to_value(output).map_err(|err| {
                        RunFailure::Malformed(format!(
                            "result of task {} is not serializable: {err}",
                            T::NAME
                        ))
                    })
                }
                .boxed()
            },
        );
        self.handlers.insert(T::NAME, handler);
        self
    }

    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.handlers.contains_key(name)
    }

    /// Registered task names in no particular order
    pub fn names(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.handlers.keys().copied()
    }

    pub(crate) fn handler(&self, name: &str) -> Option<Handler> {
        self.handlers.get(name).cloned()
    }
}

impl std::fmt::Debug for TaskRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut names: Vec<_> = self.names().collect();
        names.sort_unstable();
        f.debug_struct("TaskRegistry").field("tasks", &names).finish()
    }
}

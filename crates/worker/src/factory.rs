//! Ways to produce new workers for a pool

use std::ffi::OsString;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use workhive_config::EnvironmentConfig;
use workhive_errors::Result;
use workhive_ipc::{Context, Hub, ProcessContext, ThreadContext};

use crate::environment::Environment;
use crate::runner::Runner;
use crate::task::TaskRegistry;
use crate::worker::{Worker, WorkerOptions};

/// Creates started workers on demand
#[async_trait]
pub trait WorkerFactory: Send + Sync {
    /// # Errors
    ///
    /// Returns the startup error of the underlying context.
    async fn create(&self) -> Result<Worker>;
}

#[async_trait]
impl<F, Fut> WorkerFactory for F
where
    F: Fn() -> Fut + Send + Sync,
    Fut: Future<Output = Result<Worker>> + Send,
{
    async fn create(&self) -> Result<Worker> {
        (self)().await
    }
}

/// Spawns each worker as a child process running a worker binary.
///
/// The binary is expected to connect back with
/// [`workhive_ipc::remote::connect_from_env`] and serve a [`Runner`].
#[derive(Debug, Clone)]
pub struct ProcessWorkerFactory {
    hub: Hub,
    program: OsString,
    args: Vec<OsString>,
    options: WorkerOptions,
}

impl ProcessWorkerFactory {
    pub fn new(hub: Hub, program: impl Into<OsString>) -> Self {
        Self {
            hub,
            program: program.into(),
            args: Vec::new(),
            options: WorkerOptions::default(),
        }
    }

    #[must_use]
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<OsString>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    #[must_use]
    pub fn options(mut self, options: WorkerOptions) -> Self {
        self.options = options;
        self
    }
}

#[async_trait]
impl WorkerFactory for ProcessWorkerFactory {
    async fn create(&self) -> Result<Worker> {
        let context: Arc<dyn Context> = Arc::new(
            ProcessContext::new(self.hub.clone(), &self.program).args(self.args.iter().cloned()),
        );
        Worker::start(context, self.options.clone()).await
    }
}

/// Runs each worker on its own thread inside this process
#[derive(Debug, Clone)]
pub struct ThreadWorkerFactory {
    hub: Hub,
    registry: TaskRegistry,
    environment: EnvironmentConfig,
    options: WorkerOptions,
}

impl ThreadWorkerFactory {
    #[must_use]
    pub fn new(hub: Hub, registry: TaskRegistry) -> Self {
        Self {
            hub,
            registry,
            environment: EnvironmentConfig::default(),
            options: WorkerOptions::default(),
        }
    }

    #[must_use]
    pub fn environment(mut self, config: EnvironmentConfig) -> Self {
        self.environment = config;
        self
    }

    #[must_use]
    pub fn options(mut self, options: WorkerOptions) -> Self {
        self.options = options;
        self
    }
}

#[async_trait]
impl WorkerFactory for ThreadWorkerFactory {
    async fn create(&self) -> Result<Worker> {
        let runner = Runner::with_environment(
            self.registry.clone(),
            Environment::new(&self.environment),
        );
        let context: Arc<dyn Context> = Arc::new(ThreadContext::new(
            self.hub.clone(),
            move |remote| runner.serve(remote),
        ));
        Worker::start(context, self.options.clone()).await
    }
}

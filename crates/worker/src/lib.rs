#![deny(clippy::pedantic, unsafe_code)]
#![allow(clippy::module_name_repetitions)]

//! Task execution on pools of worker processes and threads
//!
//! A [`Pool`] hands [`Task`]s to [`Worker`]s created by a
//! [`WorkerFactory`]. Each worker drives one context from `workhive-ipc`;
//! on the other end a [`Runner`] deserializes the task, runs it against the
//! worker's [`Environment`] and replies with the result or the failure.
//!
//! ```no_run
//! use async_trait::async_trait;
//! use serde::{Deserialize, Serialize};
//! use tokio_util::sync::CancellationToken;
//! use workhive_errors::TaskError;
//! use workhive_ipc::Hub;
//! use workhive_worker::{Environment, Pool, Task, TaskRegistry, ThreadWorkerFactory};
//!
//! #[derive(Serialize, Deserialize)]
//! struct Square {
//!     n: u64,
//! }
//!
//! #[async_trait]
//! impl Task for Square {
//!     const NAME: &'static str = "square";
//!     type Output = u64;
//!
//!     async fn run(&self, _env: &Environment, _cancel: CancellationToken) -> Result<u64, TaskError> {
//!         Ok(self.n * self.n)
//!     }
//! }
//!
//! # async fn demo() -> workhive_errors::Result<()> {
//! let registry = TaskRegistry::new().register::<Square>();
//! let pool = Pool::new(4, ThreadWorkerFactory::new(Hub::shared()?, registry))?;
//! let squared = pool
//!     .enqueue(&Square { n: 7 }, CancellationToken::new())
//!     .await?;
//! assert_eq!(squared, 49);
//! pool.shutdown().await;
//! # Ok(())
//! # }
//! ```

pub mod environment;
pub mod factory;
#[cfg(any(test, feature = "fixtures"))]
pub mod fixtures;
pub mod pool;
pub mod protocol;
pub mod runner;
pub mod task;
pub mod worker;

pub use environment::Environment;
pub use factory::{ProcessWorkerFactory, ThreadWorkerFactory, WorkerFactory};
pub use pool::{Pool, PooledWorker};
pub use protocol::{FailureCause, FailureEnvelope, Reply, Request};
pub use runner::Runner;
pub use task::{Task, TaskRegistry};
pub use worker::{Worker, WorkerOptions};

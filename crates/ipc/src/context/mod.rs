//! Managed worker processes and threads
//!
//! A context owns one spawned worker and the channel it connected back on.
//! Payloads cross the channel as `serde_json::Value`; [`ContextExt`] adds
//! typed helpers on top.

use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use workhive_errors::{ContextError, Error, Result};

use crate::channel::Channel;
use crate::packet::{ExitResult, Packet};

pub mod process;
pub mod thread;

pub use process::ProcessContext;
pub use thread::ThreadContext;

/// One managed worker process or thread
#[async_trait]
pub trait Context: Send + Sync {
    /// Spawn the worker and wait until it has connected to the hub
    async fn start(&self) -> Result<()>;

    /// Send one message to the worker
    async fn send(&self, value: Value) -> Result<()>;

    /// Receive one message from the worker. A failure the worker reported
    /// on exit surfaces as `ContextError::Panic`.
    async fn receive(&self) -> Result<Value>;

    /// Wait for the worker's exit result and for the worker to terminate
    async fn join(&self) -> Result<Value>;

    /// Terminate the worker immediately and release the channel; idempotent
    fn kill(&self);

    /// True between a successful start and exit or kill
    fn is_running(&self) -> bool;
}

/// Typed convenience wrappers for any [`Context`]
#[async_trait]
pub trait ContextExt: Context {
    /// Serialize `message` and send it
    async fn send_message<T>(&self, message: &T) -> Result<()>
    where
        T: Serialize + Sync + ?Sized,
    {
        let value = serde_json::to_value(message)?;
        self.send(value).await
    }

    /// Receive one message and deserialize it as `T`
    async fn receive_message<T>(&self) -> Result<T>
    where
        T: DeserializeOwned + Send,
    {
        let value = self.receive().await?;
        serde_json::from_value(value).map_err(Error::from)
    }
}

impl<C: Context + ?Sized> ContextExt for C {}

/// Started channel plus the exit result if it already arrived
#[derive(Debug, Default)]
pub(crate) struct Connection {
    pub(crate) channel: Option<Channel>,
    pub(crate) exit: Option<ExitResult>,
}

impl Connection {
    pub(crate) fn channel(&self) -> Result<Channel> {
        self.channel
            .clone()
            .ok_or_else(|| ContextError::NotStarted.into())
    }
}

/// Receive one data packet, stashing an exit packet for a later `join`
pub(crate) async fn receive_data(
    connection: &std::sync::Mutex<Connection>,
    channel: &Channel,
    killed: &AtomicBool,
) -> Result<Value> {
    let packet = channel
        .receive::<Packet>()
        .await
        .map_err(|err| receive_failure(err, killed))?;

    match packet {
        Packet::Data(value) => Ok(value),
        Packet::Exit(exit) => {
            let failure = match &exit {
                ExitResult::Failure(report) => ContextError::from(report.clone()),
                ExitResult::Success(_) => ContextError::stopped_responding("the worker exited"),
            };
            lock(connection).exit = Some(exit);
            Err(failure.into())
        }
    }
}

/// Wait for the exit packet; a data frame at this point is a protocol
/// violation.
pub(crate) async fn receive_exit(
    connection: &std::sync::Mutex<Connection>,
    channel: &Channel,
    killed: &AtomicBool,
) -> Result<Value> {
    let stashed = lock(connection).exit.take();
    if let Some(exit) = stashed {
        return exit.into_result().map_err(Error::from);
    }

    match channel.receive::<Packet>().await {
        Ok(Packet::Exit(exit)) => exit.into_result().map_err(Error::from),
        Ok(Packet::Data(_)) => {
            Err(ContextError::failed_to_receive("did not receive an exit result").into())
        }
        Err(_) if killed.load(Ordering::Acquire) => {
            Err(ContextError::failed_to_receive("the context was killed").into())
        }
        Err(err) => Err(ContextError::failed_to_receive(err.to_string()).into()),
    }
}

/// Map a channel failure after a healthy start: a kill means the result is
/// lost, anything else means the worker went away.
pub(crate) fn receive_failure(err: Error, killed: &AtomicBool) -> Error {
    if killed.load(Ordering::Acquire) {
        return ContextError::failed_to_receive("the context was killed").into();
    }
    match err {
        Error::Context(ContextError::Closed) => {
            ContextError::stopped_responding("the channel was closed").into()
        }
        other => other,
    }
}

/// Map a failed send: after a kill the channel is simply closed, otherwise
/// the worker stopped responding.
pub(crate) fn send_failure(err: Error, killed: &AtomicBool) -> Error {
    match err {
        Error::Context(ContextError::Closed) if !killed.load(Ordering::Acquire) => {
            ContextError::stopped_responding("the channel was closed").into()
        }
        other => other,
    }
}

pub(crate) fn lock<T>(mutex: &std::sync::Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex
        .lock()
        .unwrap_or_else(std::sync::PoisonError::into_inner)
}

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::thread::JoinHandle;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::oneshot;
use workhive_errors::{ContextError, Error, Result};

use super::{lock, receive_data, receive_exit, send_failure, Connection, Context};
use crate::hub::Hub;
use crate::packet::{panic_message, Packet};
use crate::remote::{self, RemoteChannel};

type Entry = Box<dyn FnOnce(RemoteChannel) -> EntryFuture + Send>;
type EntryFuture = std::pin::Pin<Box<dyn Future<Output = Result<Value>>>>;

/// Worker running on a dedicated OS thread.
///
/// The thread drives its own current-thread Tokio runtime and connects to
/// the hub exactly as a child process would. The hub watches the thread and
/// closes the channel if the thread exits without closing it.
pub struct ThreadContext {
    hub: Hub,
    id: u64,
    name: String,
    entry: Mutex<Option<Entry>>,
    connection: Mutex<Connection>,
    thread: Mutex<Option<JoinHandle<()>>>,
    started: AtomicBool,
    killed: AtomicBool,
}

impl ThreadContext {
    /// Prepare a context that runs `entry` on a new thread once started.
    /// The value `entry` resolves to becomes the result of [`Context::join`].
    pub fn new<F, Fut>(hub: Hub, entry: F) -> Self
    where
        F: FnOnce(RemoteChannel) -> Fut + Send + 'static,
        Fut: Future<Output = Result<Value>> + 'static,
    {
        let id = hub.next_request_id();
        let entry: Entry = Box::new(move |remote| Box::pin(entry(remote)));
        Self {
            hub,
            id,
            name: format!("workhive-worker-{id}"),
            entry: Mutex::new(Some(entry)),
            connection: Mutex::new(Connection::default()),
            thread: Mutex::new(None),
            started: AtomicBool::new(false),
            killed: AtomicBool::new(false),
        }
    }

    /// Name given to the worker thread
    #[must_use]
    pub fn thread_name(&self) -> &str {
        &self.name
    }

    fn thread_finished(&self) -> bool {
        lock(&self.thread)
            .as_ref()
            .is_none_or(JoinHandle::is_finished)
    }

    async fn join_thread(&self) -> Result<()> {
        let Some(handle) = lock(&self.thread).take() else {
            return Ok(());
        };

        match tokio::task::spawn_blocking(move || handle.join()).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(payload)) => Err(ContextError::Panic {
                type_name: "panic".to_string(),
                message: panic_message(payload.as_ref()),
                causes: Vec::new(),
            }
            .into()),
            Err(err) => Err(Error::internal(format!("failed to join worker thread: {err}"))),
        }
    }
}

#[async_trait]
impl Context for ThreadContext {
    async fn start(&self) -> Result<()> {
        if self.started.swap(true, Ordering::AcqRel) {
            return Err(ContextError::AlreadyStarted.into());
        }
        let Some(entry) = lock(&self.entry).take() else {
            return Err(ContextError::AlreadyStarted.into());
        };

        let config = self.hub.config().clone();
        let endpoint = self.hub.endpoint().clone();
        let key = self.hub.generate_key(self.id, config.key_length);
        let (exit_tx, exit_rx) = oneshot::channel::<()>();
        // Only sent if the thread gives up before reaching the hub
        let (failed_tx, mut failed_rx) = oneshot::channel::<String>();

        let spawned = std::thread::Builder::new()
            .name(self.name.clone())
            .spawn(move || {
                // Dropped when the thread ends, however it ends
                let _exit = exit_tx;

                let runtime = match tokio::runtime::Builder::new_current_thread()
                    .enable_all()
                    .build()
                {
                    Ok(runtime) => runtime,
                    Err(err) => {
                        tracing::error!(error = %err, "failed to build worker runtime");
                        let _ = failed_tx.send(format!("failed to build worker runtime: {err}"));
                        return;
                    }
                };

                runtime.block_on(async move {
                    let channel = match remote::connect(&endpoint, &key, &config).await {
                        Ok(channel) => channel,
                        Err(err) => {
                            tracing::error!(error = %err, "worker failed to reach the hub");
                            let _ = failed_tx.send(format!("worker failed to reach the hub: {err}"));
                            return;
                        }
                    };
                    drop(failed_tx);
                    if let Err(err) = remote::serve(channel, entry).await {
                        tracing::debug!(error = %err, "worker could not report its exit");
                    }
                });
            });

        let handle = spawned.map_err(|err| {
            self.hub.revoke(self.id);
            ContextError::SpawnFailed {
                command: self.name.clone(),
                message: err.to_string(),
            }
        })?;
        *lock(&self.thread) = Some(handle);

        let accepted = tokio::select! {
            accepted = self.hub.accept(self.id) => accepted,
            Ok(message) = &mut failed_rx => Err(ContextError::SpawnFailed {
                command: self.name.clone(),
                message,
            }
            .into()),
        };
        let channel = accepted.inspect_err(|_| self.hub.revoke(self.id))?;
        self.hub.watch_exit(self.id, channel.clone(), exit_rx);
        lock(&self.connection).channel = Some(channel);
        tracing::debug!(thread = %self.name, "worker thread connected");
        Ok(())
    }

    async fn send(&self, value: Value) -> Result<()> {
        let channel = lock(&self.connection).channel()?;
        channel
            .send(&Packet::Data(value))
            .await
            .map_err(|err| send_failure(err, &self.killed))
    }

    async fn receive(&self) -> Result<Value> {
        let channel = lock(&self.connection).channel()?;
        receive_data(&self.connection, &channel, &self.killed).await
    }

    async fn join(&self) -> Result<Value> {
        let channel = lock(&self.connection).channel()?;
        let result = receive_exit(&self.connection, &channel, &self.killed).await;
        self.hub.unwatch_exit(self.id);
        channel.close();

        if !self.killed.load(Ordering::Acquire) {
            self.join_thread().await?;
        }
        result
    }

    fn kill(&self) {
        if self.killed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.hub.unwatch_exit(self.id);
        if let Some(channel) = lock(&self.connection).channel.as_ref() {
            channel.close();
        }
        // The thread notices the closed channel and unwinds on its own;
        // it is detached rather than joined.
        lock(&self.thread).take();
    }

    fn is_running(&self) -> bool {
        if !self.started.load(Ordering::Acquire) || self.killed.load(Ordering::Acquire) {
            return false;
        }
        let connected = lock(&self.connection)
            .channel
            .as_ref()
            .is_some_and(|channel| !channel.is_closed());
        connected && !self.thread_finished()
    }
}

impl Drop for ThreadContext {
    fn drop(&mut self) {
        self.kill();
    }
}

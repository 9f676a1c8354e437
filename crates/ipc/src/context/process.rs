use std::ffi::{OsStr, OsString};
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use serde_json::Value;
use tokio::process::{Child, Command};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use workhive_config::constants::{ENV_HUB_KEY, ENV_HUB_URI};
use workhive_errors::{ContextError, Result};

use super::{lock, receive_data, receive_exit, send_failure, Connection, Context};
use crate::hub::Hub;
use crate::packet::Packet;

/// Outer `None` while running; inner `None` when the exit code is unknown
/// (killed by a signal or `wait` failed).
type ExitState = Option<Option<i32>>;

/// Worker running in a child process.
///
/// The child learns where to connect from `WORKHIVE_HUB_URI` and presents
/// the hex-encoded key from `WORKHIVE_HUB_KEY`. The child is killed when the
/// context is killed or dropped.
pub struct ProcessContext {
    hub: Hub,
    program: OsString,
    args: Vec<OsString>,
    envs: Vec<(OsString, OsString)>,
    connection: Mutex<Connection>,
    process: Mutex<Option<ProcessHandle>>,
    started: AtomicBool,
    killed: AtomicBool,
}

struct ProcessHandle {
    pid: Option<u32>,
    kill: CancellationToken,
    exit: watch::Receiver<ExitState>,
}

impl ProcessContext {
    pub fn new(hub: Hub, program: impl Into<OsString>) -> Self {
        Self {
            hub,
            program: program.into(),
            args: Vec::new(),
            envs: Vec::new(),
            connection: Mutex::new(Connection::default()),
            process: Mutex::new(None),
            started: AtomicBool::new(false),
            killed: AtomicBool::new(false),
        }
    }

    #[must_use]
    pub fn arg(mut self, arg: impl Into<OsString>) -> Self {
        self.args.push(arg.into());
        self
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

    /// Set an extra environment variable for the child
    #[must_use]
    pub fn env(mut self, key: impl Into<OsString>, value: impl Into<OsString>) -> Self {
        self.envs.push((key.into(), value.into()));
        self
    }

    /// OS process id once started
    #[must_use]
    pub fn pid(&self) -> Option<u32> {
        lock(&self.process).as_ref().and_then(|handle| handle.pid)
    }

    fn exit_watch(&self) -> Option<watch::Receiver<ExitState>> {
        lock(&self.process).as_ref().map(|handle| handle.exit.clone())
    }

    fn command_line(&self) -> String {
        std::iter::once(self.program.as_os_str())
            .chain(self.args.iter().map(OsString::as_os_str))
            .map(OsStr::to_string_lossy)
            .collect::<Vec<_>>()
            .join(" ")
    }
}

#[async_trait]
impl Context for ProcessContext {
    async fn start(&self) -> Result<()> {
        if self.started.swap(true, Ordering::AcqRel) {
            return Err(ContextError::AlreadyStarted.into());
        }

        let request_id = self.hub.next_request_id();
        let key = self.hub.generate_key(request_id, self.hub.config().key_length);

        let mut command = Command::new(&self.program);
        command
            .args(&self.args)
            .envs(self.envs.iter().map(|(k, v)| (k, v)))
            .env(ENV_HUB_URI, self.hub.endpoint().uri())
            .env(ENV_HUB_KEY, hex::encode(&key))
            .stdin(Stdio::null())
            .kill_on_drop(true);

        let child = command.spawn().map_err(|err| {
            self.hub.revoke(request_id);
            ContextError::SpawnFailed {
                command: self.command_line(),
                message: err.to_string(),
            }
        })?;

        let pid = child.id();
        let kill = CancellationToken::new();
        let (exit_tx, exit_rx) = watch::channel(None);
        tokio::spawn(supervise(child, kill.clone(), exit_tx));

        let mut exited = exit_rx.clone();
        *lock(&self.process) = Some(ProcessHandle {
            pid,
            kill: kill.clone(),
            exit: exit_rx,
        });
        tracing::debug!(?pid, request_id, command = %self.command_line(), "spawned worker process");

        let accepted = tokio::select! {
            accepted = self.hub.accept(request_id) => accepted,
            code = wait_exit(&mut exited) => Err(ContextError::SpawnFailed {
                command: self.command_line(),
                message: match code {
                    Some(code) => format!("the process exited with code {code} before connecting"),
                    None => "the process exited before connecting".to_string(),
                },
            }
            .into()),
        };

        match accepted {
            Ok(channel) => {
                lock(&self.connection).channel = Some(channel);
                Ok(())
            }
            Err(err) => {
                kill.cancel();
                Err(err)
            }
        }
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
        channel.close();

        let code = match self.exit_watch() {
            Some(mut exit) => wait_exit(&mut exit).await,
            None => None,
        };

        match (result, code) {
            (Err(_), Some(code)) if code != 0 && !self.killed.load(Ordering::Acquire) => Err(
                ContextError::failed_to_receive(format!("the process exited with code {code}"))
                    .into(),
            ),
            (result, _) => result,
        }
    }

    fn kill(&self) {
        if self.killed.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(handle) = lock(&self.process).as_ref() {
            handle.kill.cancel();
        }
        if let Some(channel) = lock(&self.connection).channel.as_ref() {
            channel.close();
        }
    }

    fn is_running(&self) -> bool {
        if !self.started.load(Ordering::Acquire) || self.killed.load(Ordering::Acquire) {
            return false;
        }
        let exited = lock(&self.process)
            .as_ref()
            .is_none_or(|handle| handle.exit.borrow().is_some());
        let connected = lock(&self.connection)
            .channel
            .as_ref()
            .is_some_and(|channel| !channel.is_closed());
        !exited && connected
    }
}

impl Drop for ProcessContext {
    fn drop(&mut self) {
        if let Ok(process) = self.process.get_mut() {
            if let Some(handle) = process.as_ref() {
                handle.kill.cancel();
            }
        }
    }
}

/// Own the child until it exits, killing it when `kill` fires
async fn supervise(mut child: Child, kill: CancellationToken, exit: watch::Sender<ExitState>) {
    let waited = tokio::select! {
        waited = child.wait() => waited,
        () = kill.cancelled() => {
            if let Err(err) = child.start_kill() {
                tracing::debug!(error = %err, "failed to signal worker process");
            }
            child.wait().await
        }
    };

    let code = match waited {
        Ok(status) => status.code(),
        Err(err) => {
            tracing::warn!(error = %err, "failed to wait for worker process");
            None
        }
    };
    exit.send_replace(Some(code));
}

/// Resolve with the exit code once the process is gone
async fn wait_exit(exit: &mut watch::Receiver<ExitState>) -> Option<i32> {
    match exit.wait_for(Option::is_some).await {
        Ok(state) => (*state).flatten(),
        Err(_) => None,
    }
}

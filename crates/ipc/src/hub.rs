//! Rendezvous hub: matches freshly spawned workers to the parent
//!
//! The parent generates a single-use key per spawn request and hands it to
//! the worker together with the hub's endpoint. The worker connects and
//! sends the key as its first frame; the hub consumes the key and delivers
//! the connection to whoever is waiting in [`Hub::accept`] for that request.
//! Connections that do not present a known key within the key timeout are
//! dropped without disturbing other pending accepts.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use rand::RngCore;
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use workhive_config::HubConfig;
use workhive_errors::{ContextError, Result};
use workhive_events::{AppEvent, EventEmitter, EventSender, HubEvent};

use crate::channel::Channel;
use crate::transport::{BoxedReader, BoxedWriter, Endpoint, Listener};

/// Handle to a rendezvous hub. Clones share one listener; the listener is
/// shut down and its socket file removed when the last handle drops.
#[derive(Clone)]
pub struct Hub {
    inner: Arc<HubInner>,
}

struct HubInner {
    endpoint: Endpoint,
    shared: Arc<Shared>,
    accept_loop: JoinHandle<()>,
    socket_path: Option<PathBuf>,
}

struct Shared {
    config: HubConfig,
    state: Mutex<HubState>,
    /// Number of pending accepts; the accept loop runs while it is nonzero
    pending: watch::Sender<usize>,
    next_request_id: AtomicU64,
    events: Option<EventSender>,
}

#[derive(Default)]
struct HubState {
    keys: HashMap<Vec<u8>, u64>,
    acceptors: HashMap<u64, oneshot::Sender<Channel>>,
    /// Channels whose worker connected before `accept` was called
    arrived: HashMap<u64, Channel>,
    exits: HashMap<u64, TrackedExit>,
    exit_watch_running: bool,
}

struct TrackedExit {
    channel: Channel,
    exit: oneshot::Receiver<()>,
}

impl TrackedExit {
    fn has_exited(&mut self) -> bool {
        !matches!(self.exit.try_recv(), Err(oneshot::error::TryRecvError::Empty))
    }
}

impl EventEmitter for Shared {
    fn event_sender(&self) -> Option<&EventSender> {
        self.events.as_ref()
    }
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, HubState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    async fn handshake(self: Arc<Self>, reader: BoxedReader, writer: BoxedWriter) {
        let channel = Channel::new(reader, writer, self.config.max_frame_length);

        let key = match tokio::time::timeout(self.config.key_timeout(), channel.receive_raw()).await
        {
            Ok(Ok(key)) => key,
            Ok(Err(err)) => {
                self.drop_foreign(&channel, format!("failed to read key: {err}"));
                return;
            }
            Err(_) => {
                self.drop_foreign(&channel, "no key received before the timeout".to_string());
                return;
            }
        };

        let outcome = {
            let mut state = self.lock();
            match state.keys.remove(key.as_ref()) {
                Some(request_id) => {
                    match state.acceptors.remove(&request_id) {
                        Some(acceptor) => {
                            if let Err(channel) = acceptor.send(channel) {
                                channel.close();
                            }
                        }
                        None => {
                            state.arrived.insert(request_id, channel);
                        }
                    }
                    Ok(request_id)
                }
                None => Err(channel),
            }
        };

        match outcome {
            Ok(request_id) => {
                self.emit(AppEvent::Hub(HubEvent::HandshakeCompleted { request_id }));
            }
            Err(channel) => self.drop_foreign(&channel, "unknown key".to_string()),
        }
    }

    fn drop_foreign(&self, channel: &Channel, reason: String) {
        channel.close();
        self.emit(AppEvent::Hub(HubEvent::ForeignConnectionDropped { reason }));
    }

    /// Forget everything recorded for a request
    fn revoke(&self, request_id: u64) {
        let mut state = self.lock();
        state.acceptors.remove(&request_id);
        state.keys.retain(|_, id| *id != request_id);
        if let Some(channel) = state.arrived.remove(&request_id) {
            channel.close();
        }
    }
}

impl Hub {
    /// Bind a new hub with its own listening socket.
    ///
    /// Must be called from within a Tokio runtime; the accept loop is
    /// spawned onto it.
    ///
    /// # Errors
    ///
    /// Returns `ContextError::HubUnavailable` if the socket cannot be bound.
    pub fn bind(config: HubConfig) -> Result<Self> {
        Self::bind_inner(config, None)
    }

    /// Like [`Hub::bind`], reporting handshakes and dropped connections
    /// through `events`.
    ///
    /// # Errors
    ///
    /// Returns `ContextError::HubUnavailable` if the socket cannot be bound.
    pub fn bind_with_events(config: HubConfig, events: EventSender) -> Result<Self> {
        Self::bind_inner(config, Some(events))
    }

    /// Process-wide hub, bound with default configuration on first use and
    /// torn down once no handle remains.
    ///
    /// # Errors
    ///
    /// Returns `ContextError::HubUnavailable` if the socket cannot be bound.
    pub fn shared() -> Result<Self> {
        static SHARED: Mutex<Weak<HubInner>> = Mutex::new(Weak::new());

        let mut slot = SHARED.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(inner) = slot.upgrade() {
            return Ok(Self { inner });
        }

        let hub = Self::bind(HubConfig::default())?;
        *slot = Arc::downgrade(&hub.inner);
        Ok(hub)
    }

    fn bind_inner(config: HubConfig, events: Option<EventSender>) -> Result<Self> {
        let (listener, endpoint) =
            Listener::bind().map_err(|err| ContextError::HubUnavailable {
                message: err.to_string(),
            })?;

        #[cfg(unix)]
        let socket_path = match &endpoint {
            Endpoint::Unix(path) => Some(path.clone()),
            Endpoint::Tcp(_) => None,
        };
        #[cfg(not(unix))]
        let socket_path = None;

        Ok(Self::start(listener, endpoint, socket_path, config, events))
    }

    fn start(
        listener: Listener,
        endpoint: Endpoint,
        socket_path: Option<PathBuf>,
        config: HubConfig,
        events: Option<EventSender>,
    ) -> Self {
        let (pending, armed) = watch::channel(0usize);
        let shared = Arc::new(Shared {
            config,
            state: Mutex::new(HubState::default()),
            pending,
            next_request_id: AtomicU64::new(1),
            events,
        });

        let accept_loop = tokio::spawn(accept_loop(listener, Arc::clone(&shared), armed));

        shared.emit(AppEvent::Hub(HubEvent::Listening {
            endpoint: endpoint.uri(),
        }));
        tracing::debug!(endpoint = %endpoint, "rendezvous hub listening");

        Self {
            inner: Arc::new(HubInner {
                endpoint,
                shared,
                accept_loop,
                socket_path,
            }),
        }
    }

    /// Address workers connect to
    #[must_use]
    pub fn endpoint(&self) -> &Endpoint {
        &self.inner.endpoint
    }

    #[must_use]
    pub fn config(&self) -> &HubConfig {
        &self.inner.shared.config
    }

    /// Allocate an identifier for a new spawn request
    #[must_use]
    pub fn next_request_id(&self) -> u64 {
        self.inner.shared.next_request_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Create a fresh random key for `request_id`. The key is consumed by the
    /// first connection that presents it.
    #[must_use]
    pub fn generate_key(&self, request_id: u64, length: usize) -> Vec<u8> {
        let mut key = vec![0u8; length];
        rand::rng().fill_bytes(&mut key);
        self.inner
            .shared
            .lock()
            .keys
            .insert(key.clone(), request_id);
        key
    }

    /// Wait for the worker of `request_id` to connect and present its key.
    ///
    /// # Errors
    ///
    /// Returns `ContextError::StartupTimeout` if nobody connects within the
    /// start timeout. The pending accept and every key of the request are
    /// removed in that case, so a late connection is treated as foreign.
    pub async fn accept(&self, request_id: u64) -> Result<Channel> {
        let shared = &self.inner.shared;

        let receiver = {
            let mut state = shared.lock();
            if let Some(channel) = state.arrived.remove(&request_id) {
                return Ok(channel);
            }
            let (sender, receiver) = oneshot::channel();
            state.acceptors.insert(request_id, sender);
            receiver
        };

        let _pending = PendingAccept::arm(shared, request_id);

        match tokio::time::timeout(shared.config.start_timeout(), receiver).await {
            Ok(Ok(channel)) => Ok(channel),
            Ok(Err(_)) => Err(ContextError::stopped_responding("the hub shut down").into()),
            Err(_) => {
                let timeout_ms = shared.config.start_timeout_ms;
                shared.emit(AppEvent::Hub(HubEvent::AcceptTimedOut {
                    request_id,
                    timeout_ms,
                }));
                tracing::warn!(request_id, timeout_ms, "worker never connected to the hub");
                Err(ContextError::StartupTimeout.into())
            }
        }
    }

    /// Drop the keys and any early connection of a request that will never
    /// be accepted (for example because spawning the worker failed)
    pub fn revoke(&self, request_id: u64) {
        self.inner.shared.revoke(request_id);
    }

    /// Number of accepts currently waiting for a connection
    #[must_use]
    pub fn pending_accepts(&self) -> usize {
        *self.inner.shared.pending.borrow()
    }

    /// Number of keys issued but not yet consumed
    #[must_use]
    pub fn outstanding_keys(&self) -> usize {
        self.inner.shared.lock().keys.len()
    }

    /// Track `channel` until the thread behind it reports exit through
    /// `exit` (a send or a dropped sender). Channels of exited threads are
    /// closed by a periodic check; the check stops when nothing is tracked.
    pub fn watch_exit(&self, id: u64, channel: Channel, exit: oneshot::Receiver<()>) {
        let shared = &self.inner.shared;
        let start_watcher = {
            let mut state = shared.lock();
            state.exits.insert(id, TrackedExit { channel, exit });
            !std::mem::replace(&mut state.exit_watch_running, true)
        };

        if start_watcher {
            tokio::spawn(exit_watch_loop(
                Arc::downgrade(shared),
                shared.config.exit_check_interval(),
            ));
        }
    }

    /// Stop tracking the channel registered under `id`
    pub fn unwatch_exit(&self, id: u64) {
        self.inner.shared.lock().exits.remove(&id);
    }

    /// Number of channels tracked by the exit watcher
    #[must_use]
    pub fn watched_exits(&self) -> usize {
        self.inner.shared.lock().exits.len()
    }
}

impl std::fmt::Debug for Hub {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Hub")
            .field("endpoint", &self.inner.endpoint)
            .finish_non_exhaustive()
    }
}

impl Drop for HubInner {
    fn drop(&mut self) {
        self.accept_loop.abort();
        if let Some(path) = &self.socket_path {
            if let Err(err) = std::fs::remove_file(path) {
                tracing::debug!(path = %path.display(), error = %err, "failed to remove hub socket");
            }
        }
    }
}

/// Keeps the accept loop armed for one request; disarms and revokes the
/// request when dropped (timeout, cancellation or success alike).
struct PendingAccept<'a> {
    shared: &'a Shared,
    request_id: u64,
}

impl<'a> PendingAccept<'a> {
    fn arm(shared: &'a Shared, request_id: u64) -> Self {
        shared.pending.send_modify(|count| *count += 1);
        Self { shared, request_id }
    }
}

impl Drop for PendingAccept<'_> {
    fn drop(&mut self) {
        self.shared.revoke(self.request_id);
        self.shared
            .pending
            .send_modify(|count| *count = count.saturating_sub(1));
    }
}

async fn accept_loop(listener: Listener, shared: Arc<Shared>, mut armed: watch::Receiver<usize>) {
    loop {
        if !wait_until(&mut armed, true).await {
            return;
        }

        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((reader, writer)) => {
                    tokio::spawn(Arc::clone(&shared).handshake(reader, writer));
                }
                Err(err) => {
                    tracing::warn!(error = %err, "hub failed to accept a connection");
                    tokio::time::sleep(Duration::from_millis(10)).await;
                }
            },
            open = wait_until(&mut armed, false) => {
                if !open {
                    return;
                }
            }
        }
    }
}

/// Wait until the loop is armed (or disarmed); false once the hub is gone
async fn wait_until(armed: &mut watch::Receiver<usize>, want_armed: bool) -> bool {
    armed
        .wait_for(|count| (*count > 0) == want_armed)
        .await
        .is_ok()
}

async fn exit_watch_loop(weak: Weak<Shared>, period: Duration) {
    let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        ticker.tick().await;
        let Some(shared) = weak.upgrade() else {
            return;
        };

        let (exited, done) = {
            let mut state = shared.lock();
            let ids: Vec<u64> = state
                .exits
                .iter_mut()
                .filter_map(|(id, tracked)| tracked.has_exited().then_some(*id))
                .collect();
            let exited: Vec<(u64, Channel)> = ids
                .into_iter()
                .filter_map(|id| state.exits.remove(&id).map(|t| (id, t.channel)))
                .collect();
            let done = state.exits.is_empty();
            if done {
                state.exit_watch_running = false;
            }
            (exited, done)
        };

        for (context_id, channel) in exited {
            if !channel.is_closed() {
                channel.close();
                shared.emit(AppEvent::Hub(HubEvent::ChannelAutoClosed { context_id }));
            }
        }

        if done {
            return;
        }
    }
}

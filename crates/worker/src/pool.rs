//! Bounded scheduler that hands tasks to idle workers
//!
//! Workers are created on demand up to `max_size` and reused in FIFO order.
//! A worker found dead when it is pulled or released is shut down in the
//! background, reported once and replaced by the next pull; the task it was
//! running is never retried.

use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::ops::Deref;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use futures::future::join_all;
use tokio::sync::{Notify, OnceCell};
use tokio_util::sync::CancellationToken;
use workhive_config::PoolConfig;
use workhive_errors::{ConfigError, Error, Result, WorkerError};
use workhive_events::{AppEvent, EventEmitter, EventSender, PoolEvent};

use crate::factory::WorkerFactory;
use crate::task::Task;
use crate::worker::Worker;

/// Handle to a worker pool. Clones share the same workers; the pool is
/// killed when the last handle of a running pool is dropped.
#[derive(Clone)]
pub struct Pool {
    inner: Arc<PoolInner>,
}

struct PoolInner {
    max_size: usize,
    factory: Box<dyn WorkerFactory>,
    running: AtomicBool,
    state: Mutex<PoolState>,
    /// Woken whenever a worker may have become available
    released: Notify,
    shutdown: OnceCell<i32>,
    events: Option<EventSender>,
}

#[derive(Default)]
struct PoolState {
    workers: HashMap<u64, Arc<Worker>>,
    idle: VecDeque<u64>,
    spawning: usize,
    stop: Option<WorkerError>,
}

enum Step {
    Ready(Arc<Worker>),
    Reap(Arc<Worker>),
    Spawn,
    Wait,
}

impl PoolState {
    fn next_step(&mut self, max_size: usize) -> Step {
        while let Some(id) = self.idle.pop_front() {
            let Some(worker) = self.workers.get(&id) else {
                continue;
            };
            if worker.is_running() {
                return Step::Ready(Arc::clone(worker));
            }
            if let Some(worker) = self.workers.remove(&id) {
                return Step::Reap(worker);
            }
        }

        if self.workers.len() + self.spawning < max_size {
            self.spawning += 1;
            return Step::Spawn;
        }
        Step::Wait
    }
}

impl EventEmitter for PoolInner {
    fn event_sender(&self) -> Option<&EventSender> {
        self.events.as_ref()
    }
}

impl Pool {
    /// Create a pool of at most `max_size` workers. A pool of size 0 never
    /// creates workers and only runs tasks on workers handed to
    /// [`Pool::adopt`].
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::InvalidMaxSize` if `max_size` is negative.
    pub fn new<F>(max_size: i64, factory: F) -> Result<Self>
    where
        F: WorkerFactory + 'static,
    {
        Self::build(max_size, Box::new(factory), None)
    }

    /// Like [`Pool::new`], reporting scheduling events through `events`
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::InvalidMaxSize` if `max_size` is negative.
    pub fn with_events<F>(max_size: i64, factory: F, events: EventSender) -> Result<Self>
    where
        F: WorkerFactory + 'static,
    {
        Self::build(max_size, Box::new(factory), Some(events))
    }

    /// Create a pool sized by `config`
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::InvalidMaxSize` if the configured size is
    /// negative.
    pub fn from_config<F>(config: &PoolConfig, factory: F) -> Result<Self>
    where
        F: WorkerFactory + 'static,
    {
        Self::new(config.max_size, factory)
    }

    fn build(
        max_size: i64,
        factory: Box<dyn WorkerFactory>,
        events: Option<EventSender>,
    ) -> Result<Self> {
        let max_size = usize::try_from(max_size)
            .map_err(|_| ConfigError::InvalidMaxSize { value: max_size })?;

        Ok(Self {
            inner: Arc::new(PoolInner {
                max_size,
                factory,
                running: AtomicBool::new(true),
                state: Mutex::new(PoolState::default()),
                released: Notify::new(),
                shutdown: OnceCell::new(),
                events,
            }),
        })
    }

    /// Run `task` on the next available worker.
    ///
    /// The worker goes back to the pool whatever the outcome. Firing
    /// `cancel` while waiting for a worker gives up the wait.
    ///
    /// # Errors
    ///
    /// - `Error::Status` if the pool has been shut down or killed
    /// - `WorkerError::PoolShutdown` / `WorkerError::PoolKilled` if that
    ///   happened while waiting for a worker
    /// - `WorkerError::NotViable` or a startup error if a new worker could
    ///   not be created
    /// - any error of [`Worker::enqueue`]
    pub async fn enqueue<T: Task>(&self, task: &T, cancel: CancellationToken) -> Result<T::Output> {
        let worker = tokio::select! {
            biased;
            worker = self.worker() => worker?,
            () = cancel.cancelled() => return Err(Error::Cancelled),
        };
        worker.enqueue(task, cancel).await
    }

    /// Lease a worker; it returns to the pool when the lease is dropped.
    ///
    /// # Errors
    ///
    /// Same as the scheduling errors of [`Pool::enqueue`].
    pub async fn worker(&self) -> Result<PooledWorker> {
        let worker = self.inner.pull().await?;
        Ok(PooledWorker {
            worker,
            pool: Arc::downgrade(&self.inner),
        })
    }

    /// Hand an externally created worker to the pool. Adopted workers may
    /// exceed `max_size`.
    ///
    /// # Errors
    ///
    /// Returns `Error::Status` if the pool has stopped, or
    /// `WorkerError::NotViable` if the worker is not running.
    pub fn adopt(&self, worker: Worker) -> Result<()> {
        if !worker.is_running() {
            return Err(WorkerError::NotViable.into());
        }
        {
            let mut state = self.inner.lock();
            if state.stop.is_some() {
                return Err(Error::status("The pool was shutdown"));
            }
            let id = worker.id();
            state.workers.insert(id, Arc::new(worker));
            state.idle.push_back(id);
        }
        self.inner.released.notify_waiters();
        Ok(())
    }

    /// Stop accepting work, let every running worker finish its task and
    /// exit, and return 0 if all exited with code 0, else 1. Every call
    /// returns the result of the first.
    pub async fn shutdown(&self) -> i32 {
        let inner = &self.inner;
        *inner.shutdown.get_or_init(|| inner.shutdown_workers()).await
    }

    /// Stop accepting work and kill every worker without waiting
    pub fn kill(&self) {
        self.inner.kill();
    }

    #[must_use]
    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::Acquire)
    }

    /// True if a worker is waiting in the idle queue or no worker exists yet
    #[must_use]
    pub fn is_idle(&self) -> bool {
        let state = self.inner.lock();
        !state.idle.is_empty() || state.workers.is_empty()
    }

    #[must_use]
    pub fn max_size(&self) -> usize {
        self.inner.max_size
    }

    #[must_use]
    pub fn worker_count(&self) -> usize {
        self.inner.lock().workers.len()
    }

    #[must_use]
    pub fn idle_worker_count(&self) -> usize {
        self.inner.lock().idle.len()
    }
}

impl std::fmt::Debug for Pool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pool")
            .field("max_size", &self.max_size())
            .field("running", &self.is_running())
            .field("workers", &self.worker_count())
            .field("idle", &self.idle_worker_count())
            .finish()
    }
}

impl PoolInner {
    fn lock(&self) -> MutexGuard<'_, PoolState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    async fn pull(&self) -> Result<Arc<Worker>> {
        if !self.running.load(Ordering::Acquire) {
            return Err(Error::status("The pool was shutdown"));
        }

        loop {
            // Registered before the state check so no release is missed
            let released = self.released.notified();
            tokio::pin!(released);
            released.as_mut().enable();

            let step = {
                let mut state = self.lock();
                if let Some(reason) = &state.stop {
                    return Err(reason.clone().into());
                }
                state.next_step(self.max_size)
            };

            match step {
                Step::Ready(worker) => return Ok(worker),
                Step::Reap(worker) => self.reap(worker),
                Step::Spawn => return self.spawn().await,
                Step::Wait => {
                    self.emit(AppEvent::Pool(PoolEvent::Saturated {
                        max_size: self.max_size,
                    }));
                    released.await;
                }
            }
        }
    }

    async fn spawn(&self) -> Result<Arc<Worker>> {
        let _slot = SpawnSlot { pool: self };

        let worker = self.factory.create().await?;
        if !worker.is_running() {
            worker.kill();
            return Err(WorkerError::NotViable.into());
        }

        let worker = Arc::new(worker);
        let worker_count = {
            let mut state = self.lock();
            if let Some(reason) = &state.stop {
                let err = reason.clone();
                drop(state);
                worker.kill();
                return Err(err.into());
            }
            state.workers.insert(worker.id(), Arc::clone(&worker));
            state.workers.len()
        };

        self.emit(AppEvent::Pool(PoolEvent::WorkerSpawned {
            worker_id: worker.id(),
            worker_count,
        }));
        Ok(worker)
    }

    fn release(self: &Arc<Self>, worker: Arc<Worker>) {
        if worker.is_running() && !worker.is_idle() {
            // A cancelled task is still running remotely; the worker comes
            // back once its reply arrived.
            if let Ok(handle) = tokio::runtime::Handle::try_current() {
                let pool = Arc::downgrade(self);
                handle.spawn(async move {
                    worker.wait_idle().await;
                    if let Some(pool) = pool.upgrade() {
                        pool.release(worker);
                    }
                });
                return;
            }
        }

        let crashed = {
            let mut state = self.lock();
            let id = worker.id();
            if !state.workers.contains_key(&id) {
                None
            } else if worker.is_running() {
                if state.stop.is_none() && !state.idle.contains(&id) {
                    state.idle.push_back(id);
                }
                None
            } else {
                state.idle.retain(|idle| *idle != id);
                state.workers.remove(&id)
            }
        };

        if let Some(worker) = crashed {
            self.reap(worker);
        }
        self.released.notify_waiters();
    }

    /// Shut a dead worker down in the background and report it
    fn reap(&self, worker: Arc<Worker>) {
        let events = self.events.clone();
        let worker_id = worker.id();
        let report = async move {
            let (exit_code, error) = match worker.shutdown().await {
                Ok(code) => (Some(code), None),
                Err(err) => (None, Some(err.to_string())),
            };
            events.emit(AppEvent::Pool(PoolEvent::WorkerCrashed {
                worker_id,
                exit_code,
                error,
            }));
        };
        spawn_detached(report);
    }

    async fn shutdown_workers(&self) -> i32 {
        let workers = self.stop(WorkerError::PoolShutdown);
        let running: Vec<_> = workers.iter().filter(|worker| worker.is_running()).collect();
        self.emit(AppEvent::Pool(PoolEvent::ShutdownStarted {
            worker_count: running.len(),
        }));

        let results = join_all(running.iter().map(|worker| worker.shutdown())).await;
        let exit_code = i32::from(results.iter().any(|result| !matches!(result, Ok(0))));
        self.lock().workers.clear();

        self.emit(AppEvent::Pool(PoolEvent::ShutdownCompleted { exit_code }));
        exit_code
    }

    fn kill(&self) {
        self.stop(WorkerError::PoolKilled);
        let workers: Vec<_> = self.lock().workers.drain().map(|(_, worker)| worker).collect();
        for worker in &workers {
            worker.kill();
        }
        self.emit(AppEvent::Pool(PoolEvent::Killed {
            worker_count: workers.len(),
        }));
    }

    /// Reject further pulls and wake every waiter with `reason`
    fn stop(&self, reason: WorkerError) -> Vec<Arc<Worker>> {
        let workers = {
            let mut state = self.lock();
            self.running.store(false, Ordering::Release);
            state.stop.get_or_insert(reason);
            state.idle.clear();
            state.workers.values().cloned().collect()
        };
        self.released.notify_waiters();
        workers
    }
}

impl Drop for PoolInner {
    fn drop(&mut self) {
        if self.running.load(Ordering::Acquire) {
            self.kill();
        }
    }
}

/// Counts a worker being created against `max_size` until dropped
struct SpawnSlot<'a> {
    pool: &'a PoolInner,
}

impl Drop for SpawnSlot<'_> {
    fn drop(&mut self) {
        {
            let mut state = self.pool.lock();
            state.spawning = state.spawning.saturating_sub(1);
        }
        self.pool.released.notify_waiters();
    }
}

fn spawn_detached<F>(future: F)
where
    F: Future<Output = ()> + Send + 'static,
{
    match tokio::runtime::Handle::try_current() {
        Ok(handle) => {
            handle.spawn(future);
        }
        Err(_) => tracing::debug!("no runtime to reap a crashed worker on"),
    }
}

/// A worker leased from a [`Pool`]; released back to the pool on drop
pub struct PooledWorker {
    worker: Arc<Worker>,
    pool: Weak<PoolInner>,
}

impl PooledWorker {
    /// Kill the leased worker and return it to the pool right away; the
    /// pool replaces it on a later pull
    pub fn kill(self) {
        self.worker.kill();
    }
}

impl Deref for PooledWorker {
    type Target = Worker;

    fn deref(&self) -> &Worker {
        &self.worker
    }
}

impl Drop for PooledWorker {
    fn drop(&mut self) {
        if let Some(pool) = self.pool.upgrade() {
            pool.release(Arc::clone(&self.worker));
        }
    }
}

impl std::fmt::Debug for PooledWorker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("PooledWorker").field(&self.worker).finish()
    }
}

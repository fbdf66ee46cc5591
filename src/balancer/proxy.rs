use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::runtime::Handle;
use tokio::sync::mpsc::{self, UnboundedReceiver};
use tokio::sync::watch;
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::bridge::socket::make_listener;
use crate::bridge::{AddressMap, BackendAddress, BridgeSettings};
use crate::constants;
use crate::error::{ProxyError, Result};
use crate::rpc::{Agent, Port, methods};

use super::agent_pool::AgentPool;
use super::config::{ProxyConfig, WorkerOptions};
use super::handlers;
use super::worker::{
    WorkerEntry, WorkerExit, WorkerHandle, WorkerSignal, WorkerSnapshot, spawn_worker_thread,
};

/// Settled result of stopping one worker during [`Proxy::shutdown`].
#[derive(Debug)]
pub struct WorkerOutcome {
    pub worker_id: u64,
    pub result: Result<WorkerExit>,
}

/// Front-facing listener plus the worker pool behind it.
///
/// Dropping a `Proxy` stops accepting and pruning; use [`Proxy::shutdown`]
/// to also stop the workers.
pub struct Proxy {
    inner: Arc<ProxyInner>,
}

pub(crate) struct ProxyInner {
    entry: WorkerEntry,
    options: WorkerOptions,
    min_workers: AtomicUsize,
    max_workers: Option<usize>,
    shutdown_timeout: Option<Duration>,
    pub(crate) bridge: BridgeSettings,
    agents: Mutex<AgentPool>,
    pub(crate) addresses: AddressMap,
    local_addr: SocketAddr,
    ready: watch::Sender<bool>,
    // serializes floor maintenance runs
    floor: tokio::sync::Mutex<()>,
    // consecutive failed floor spawns; reset when any worker becomes ready
    floor_failures: AtomicUsize,
    listening: AtomicBool,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    next_worker_id: AtomicU64,
}

impl Proxy {
    /// Bind the front-facing socket and start accepting.
    ///
    /// Must be called from within a tokio runtime. The configuration is
    /// validated before anything is bound. Floor maintenance starts in the
    /// background; await [`Proxy::ready`] to wait for it.
    pub fn start(config: ProxyConfig) -> Result<Self> {
        let bounds = config.validate()?;
        let runtime = Handle::try_current().map_err(|_| ProxyError::NoRuntime)?;

        let std_listener = match config.listener {
            Some(listener) => {
                listener.set_nonblocking(true)?;
                listener
            }
            None => make_listener(config.listen_addr, config.backlog, config.reuse_port)?,
        };
        let listener = TcpListener::from_std(std_listener)?;
        let local_addr = listener.local_addr()?;
        info!(
            %local_addr,
            min_workers = bounds.min,
            max_workers = ?bounds.max,
            "proxy listening"
        );

        let inner = Arc::new(ProxyInner {
            entry: config.entry,
            options: config.worker_options,
            min_workers: AtomicUsize::new(bounds.min),
            max_workers: bounds.max,
            shutdown_timeout: config.shutdown_timeout,
            bridge: BridgeSettings {
                io_buffer_capacity: config.io_buffer_capacity,
                socket_timeout: config.socket_timeout,
                half_close_linger: config.half_close_linger,
            },
            agents: Mutex::new(AgentPool::new()),
            addresses: AddressMap::new(),
            local_addr,
            ready: watch::Sender::new(false),
            floor: tokio::sync::Mutex::new(()),
            floor_failures: AtomicUsize::new(0),
            listening: AtomicBool::new(true),
            tasks: Mutex::new(Vec::new()),
            next_worker_id: AtomicU64::new(1),
        });

        let mut tasks = vec![runtime.spawn(accept_loop(Arc::downgrade(&inner), listener))];
        if let Some(interval) = config.workers_checking_interval {
            tasks.push(runtime.spawn(prune_loop(Arc::downgrade(&inner), interval)));
        }
        tasks.push(runtime.spawn(Arc::clone(&inner).maintain_floor(false)));
        inner.tasks().extend(tasks);

        Ok(Self { inner })
    }

    /// Address the front-facing socket is bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.inner.local_addr
    }

    /// Wait until the initial floor of workers has been reached (or given up on).
    pub async fn ready(&self) {
        let mut ready = self.inner.ready.subscribe();
        let _ = ready.wait_for(|ready| *ready).await;
    }

    pub fn is_ready(&self) -> bool {
        *self.inner.ready.borrow()
    }

    /// Pooled workers, least loaded first.
    pub fn workers(&self) -> Vec<WorkerSnapshot> {
        self.inner.agents().snapshot()
    }

    pub fn worker_count(&self) -> usize {
        self.inner.agents().len()
    }

    /// Connection counts in pool order.
    pub fn connection_distribution(&self) -> Vec<usize> {
        self.inner.agents().distribution()
    }

    pub fn min_workers(&self) -> usize {
        self.inner.min_workers.load(Ordering::Acquire)
    }

    pub fn max_workers(&self) -> Option<usize> {
        self.inner.max_workers
    }

    /// Run one pruning pass; returns how many idle workers were removed.
    ///
    /// A pool below `min_workers` is topped up again, even after floor
    /// maintenance gave up.
    pub async fn check_workers(&self) -> usize {
        let pruned = self.inner.prune_idle();
        if self.inner.below_floor() {
            Arc::clone(&self.inner).maintain_floor(true).await;
        }
        pruned
    }

    /// Stop accepting, ask every worker to terminate and wait for each to exit.
    ///
    /// Never fails as a whole; per-worker failures are reported in the
    /// returned outcomes, ordered by worker id.
    pub async fn shutdown(&self) -> Vec<WorkerOutcome> {
        let inner = &self.inner;
        inner.min_workers.store(0, Ordering::Release);
        if inner.listening.swap(false, Ordering::AcqRel) {
            info!(local_addr = %inner.local_addr, "proxy shutting down");
        }
        for task in inner.tasks().drain(..) {
            task.abort();
        }

        let handles = inner.agents().drain();
        let mut stopping = JoinSet::new();
        for handle in handles {
            stopping.spawn(stop_worker(handle, inner.shutdown_timeout));
        }

        let mut outcomes = Vec::with_capacity(stopping.len());
        while let Some(joined) = stopping.join_next().await {
            match joined {
                Ok(outcome) => outcomes.push(outcome),
                Err(err) => error!(error = %err, "worker shutdown task failed"),
            }
        }
        outcomes.sort_by_key(|outcome| outcome.worker_id);
        outcomes
    }
}

impl Drop for Proxy {
    fn drop(&mut self) {
        self.inner.listening.store(false, Ordering::Release);
        for task in self.inner.tasks().drain(..) {
            task.abort();
        }
    }
}

impl ProxyInner {
    pub(crate) fn agents(&self) -> MutexGuard<'_, AgentPool> {
        self.agents.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn tasks(&self) -> MutexGuard<'_, Vec<JoinHandle<()>>> {
        self.tasks.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Pick the worker for a new connection and count the connection on it.
    ///
    /// An idle least-loaded worker is reused first; at the cap the least
    /// loaded worker is reused regardless of load; otherwise a new worker
    /// is spawned.
    pub(crate) fn select_worker(self: &Arc<Self>) -> Result<Arc<WorkerHandle>> {
        let mut agents = self.agents();
        if !self.listening.load(Ordering::Acquire) {
            return Err(ProxyError::ShuttingDown);
        }

        let at_cap = self.max_workers.is_some_and(|max| agents.len() >= max);
        let handle = match agents.first() {
            Some(first) if first.connections() == 0 || at_cap => Arc::clone(first),
            _ => {
                let handle = self.spawn_worker()?;
                agents.insert(Arc::clone(&handle));
                handle
            }
        };
        agents.acquire(&handle);
        Ok(handle)
    }

    /// Remove `handle` from the pool and ask its worker to terminate.
    pub(crate) fn retire_worker(&self, handle: &Arc<WorkerHandle>) {
        self.agents().remove(handle);
        request_termination(Arc::clone(handle));
    }

    fn spawn_worker(self: &Arc<Self>) -> Result<Arc<WorkerHandle>> {
        let id = self.next_worker_id.fetch_add(1, Ordering::Relaxed);
        let (controller_port, worker_port) = Port::pair();
        let agent = Agent::new(controller_port);
        handlers::register_controller_methods(&agent, id, &self.addresses);

        let (signals_tx, signals_rx) = mpsc::unbounded_channel();
        spawn_worker_thread(id, self.entry.clone(), &self.options, worker_port, signals_tx)?;

        let handle = Arc::new(WorkerHandle::new(id, agent));
        tokio::spawn(supervise(Arc::downgrade(self), Arc::clone(&handle), signals_rx));
        debug!(worker = id, "worker spawned");
        Ok(handle)
    }

    fn below_floor(&self) -> bool {
        self.agents().len() < self.min_workers.load(Ordering::Acquire)
    }

    fn floor_exhausted(&self) -> bool {
        self.floor_failures.load(Ordering::Acquire) >= constants::MAX_FLOOR_SPAWN_FAILURES
    }

    /// Spawn workers one at a time until the pool holds `min_workers`.
    ///
    /// Failures are counted across runs; once `MAX_FLOOR_SPAWN_FAILURES`
    /// pile up without a worker becoming ready, runs stop spawning until a
    /// `retry` run clears the count. Flags the proxy ready when done either way.
    async fn maintain_floor(self: Arc<Self>, retry: bool) {
        let _floor = self.floor.lock().await;
        if retry && self.floor_failures.swap(0, Ordering::AcqRel) > 0 {
            info!(workers = self.agents().len(), "retrying min_workers");
        }
        loop {
            let spawned = {
                let mut agents = self.agents();
                if agents.len() >= self.min_workers.load(Ordering::Acquire)
                    || !self.listening.load(Ordering::Acquire)
                    || self.floor_exhausted()
                {
                    break;
                }
                self.spawn_worker().map(|handle| {
                    agents.insert(Arc::clone(&handle));
                    handle
                })
            };

            let result = match spawned {
                Ok(handle) => match handle.ready().await {
                    Ok(_) => Ok(()),
                    Err(err) => {
                        self.retire_worker(&handle);
                        Err(err)
                    }
                },
                Err(err) => Err(err),
            };

            if let Err(err) = result {
                let failures = self.floor_failures.fetch_add(1, Ordering::AcqRel) + 1;
                warn!(error = %err, failures, "failed to start worker");
                if failures >= constants::MAX_FLOOR_SPAWN_FAILURES {
                    error!(failures, "giving up on reaching min_workers");
                    break;
                }
            }
        }

        let newly_ready = self.ready.send_if_modified(|ready| !std::mem::replace(ready, true));
        if newly_ready {
            info!(workers = self.agents().len(), "proxy ready");
        }
    }

    /// Remove idle ready workers above the floor and ask them to terminate.
    fn prune_idle(&self) -> usize {
        let pruned = {
            let mut agents = self.agents();
            let min = self.min_workers.load(Ordering::Acquire);
            let mut pruned = Vec::new();
            for handle in agents.handles() {
                if agents.len() <= min {
                    break;
                }
                if handle.connections() == 0 && handle.backend_address().is_some() {
                    agents.remove(&handle);
                    pruned.push(handle);
                }
            }
            pruned
        };

        for handle in &pruned {
            info!(worker = handle.id(), "pruning idle worker");
            request_termination(Arc::clone(handle));
        }
        pruned.len()
    }
}

fn request_termination(handle: Arc<WorkerHandle>) {
    tokio::spawn(async move {
        if let Err(err) = handle.try_terminate().await {
            debug!(worker = handle.id(), error = %err, "terminate request not answered");
        }
    });
}

async fn stop_worker(handle: Arc<WorkerHandle>, timeout: Option<Duration>) -> WorkerOutcome {
    let id = handle.id();
    request_termination(Arc::clone(&handle));

    let exit = match timeout {
        Some(timeout) => tokio::time::timeout(timeout, handle.exited())
            .await
            .map_err(|_| ProxyError::ShutdownTimeout { id, timeout }),
        None => Ok(handle.exited().await),
    };
    let result = exit.and_then(|exit| {
        if exit.is_clean() {
            Ok(exit)
        } else {
            Err(ProxyError::WorkerFailed {
                id,
                reason: exit.to_string(),
            })
        }
    });

    match &result {
        Ok(_) => debug!(worker = id, "worker stopped"),
        Err(err) => warn!(worker = id, error = %err, "worker did not stop cleanly"),
    }
    WorkerOutcome {
        worker_id: id,
        result,
    }
}

/// Follow one worker's lifecycle signals until its thread exits.
async fn supervise(
    proxy: Weak<ProxyInner>,
    handle: Arc<WorkerHandle>,
    mut signals: UnboundedReceiver<WorkerSignal>,
) {
    let id = handle.id();
    let mut failure = None;
    let code = loop {
        match signals.recv().await {
            Some(WorkerSignal::Online) => {
                debug!(worker = id, "worker online");
                tokio::spawn(resolve_backend_address(proxy.clone(), Arc::clone(&handle)));
            }
            Some(WorkerSignal::Error(reason)) => {
                error!(worker = id, %reason, "worker error");
                handle.fail(reason.clone());
                if let Some(inner) = proxy.upgrade() {
                    inner.agents().remove(&handle);
                }
                failure = Some(reason);
            }
            Some(WorkerSignal::Exit(code)) => break code,
            None => {
                failure.get_or_insert_with(|| "worker thread vanished".to_string());
                break 1;
            }
        }
    };

    let exit = WorkerExit {
        code,
        error: failure,
    };
    if exit.is_clean() {
        info!(worker = id, "worker exited");
    } else {
        warn!(worker = id, %exit, "worker exited abnormally");
    }
    handle.fail(format!("worker exited ({exit})"));
    handle.mark_exited(exit);

    if let Some(inner) = proxy.upgrade() {
        inner.agents().remove(&handle);
        if !inner.floor_exhausted() {
            tokio::spawn(inner.maintain_floor(false));
        }
    }
}

async fn resolve_backend_address(proxy: Weak<ProxyInner>, handle: Arc<WorkerHandle>) {
    let reply = handle
        .agent()
        .call_as::<_, Option<BackendAddress>>(methods::SOCKET_CONNECT_OPTS, &())
        .await;
    match reply {
        Ok(Some(address)) => {
            info!(worker = handle.id(), %address, "worker ready");
            handle.resolve(address);
            if let Some(inner) = proxy.upgrade() {
                inner.floor_failures.store(0, Ordering::Release);
            }
        }
        Ok(None) => handle.fail("worker reported no listening address"),
        Err(err) => handle.fail(err.to_string()),
    }
}

async fn accept_loop(proxy: Weak<ProxyInner>, listener: TcpListener) {
    loop {
        let accepted = listener.accept().await;
        let Some(inner) = proxy.upgrade() else {
            break;
        };
        if !inner.listening.load(Ordering::Acquire) {
            break;
        }
        match accepted {
            Ok((client, peer)) => {
                debug!(%peer, "accepted connection");
                tokio::spawn(handlers::admit(inner, client));
            }
            Err(err) => {
                drop(inner);
                warn!(error = %err, "accept failed");
                tokio::time::sleep(constants::ACCEPT_ERROR_BACKOFF).await;
            }
        }
    }
    debug!("accept loop stopped");
}

async fn prune_loop(proxy: Weak<ProxyInner>, interval: Duration) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // the first tick completes immediately
    ticker.tick().await;
    loop {
        ticker.tick().await;
        let Some(inner) = proxy.upgrade() else {
            break;
        };
        if !inner.listening.load(Ordering::Acquire) {
            break;
        }
        let pruned = inner.prune_idle();
        if pruned > 0 {
            debug!(pruned, workers = inner.agents().len(), "pruning pass done");
        }
        if inner.below_floor() {
            inner.maintain_floor(true).await;
        }
    }
}

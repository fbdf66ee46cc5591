use std::any::Any;
use std::fmt;
use std::future::Future;
use std::io;
use std::panic::{self, AssertUnwindSafe};
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;

use core_affinity::CoreId;
use serde_json::Value;
use tokio::sync::mpsc::UnboundedSender;
use tokio::sync::watch;
use tokio::task::LocalSet;
use tracing::level_filters::LevelFilter;

use crate::bridge::BackendAddress;
use crate::error::{ProxyError, RpcError};
use crate::rpc::{Agent, Port, methods};
use crate::service::log_forward;

use super::config::WorkerOptions;

type EntryFn =
    dyn Fn(WorkerContext) -> Pin<Box<dyn Future<Output = anyhow::Result<()>>>> + Send + Sync;

/// Worker entry point, invoked once on every worker thread.
///
/// The returned future runs on the worker's own single-threaded runtime, so
/// it does not need to be `Send`.
#[derive(Clone)]
pub struct WorkerEntry(Arc<EntryFn>);

impl WorkerEntry {
    pub fn new<F, Fut>(entry: F) -> Self
    where
        F: Fn(WorkerContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + 'static,
    {
        Self(Arc::new(move |ctx| Box::pin(entry(ctx))))
    }

    fn run(&self, ctx: WorkerContext) -> Pin<Box<dyn Future<Output = anyhow::Result<()>>>> {
        (self.0)(ctx)
    }
}

impl fmt::Debug for WorkerEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("WorkerEntry(..)")
    }
}

/// Everything a worker entry point receives from the controller.
#[derive(Debug)]
pub struct WorkerContext {
    pub(crate) id: u64,
    pub(crate) args: Vec<String>,
    pub(crate) agent: Agent,
}

impl WorkerContext {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn args(&self) -> &[String] {
        &self.args
    }

    pub fn agent(&self) -> &Agent {
        &self.agent
    }
}

/// Lifecycle signal sent from a worker thread to the controller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkerSignal {
    Online,
    Error(String),
    Exit(i32),
}

/// Start worker `id` on a dedicated OS thread.
///
/// The thread builds its own current-thread runtime, runs `entry` inside a
/// `LocalSet`, and reports `Online`, then `Error` (if any) and `Exit` on
/// `signals`.
pub fn spawn_worker_thread(
    id: u64,
    entry: WorkerEntry,
    options: &WorkerOptions,
    port: Port,
    signals: UnboundedSender<WorkerSignal>,
) -> io::Result<()> {
    let mut builder = thread::Builder::new().name(format!("{}-{id}", options.thread_name));
    if let Some(size) = options.stack_size {
        builder = builder.stack_size(size);
    }

    let core = if options.pin_to_cores {
        pick_core(id)
    } else {
        None
    };
    let args = options.args.clone();
    let log_level = options.log_level;

    builder.spawn(move || {
        if let Some(core) = core {
            core_affinity::set_for_current(core);
        }
        let code = run_worker(id, entry, args, log_level, port, &signals);
        let _ = signals.send(WorkerSignal::Exit(code));
    })?;
    Ok(())
}

fn pick_core(id: u64) -> Option<CoreId> {
    let cores = core_affinity::get_core_ids()?;
    if cores.is_empty() {
        return None;
    }
    cores.get(id as usize % cores.len()).copied()
}

fn run_worker(
    id: u64,
    entry: WorkerEntry,
    args: Vec<String>,
    log_level: LevelFilter,
    port: Port,
    signals: &UnboundedSender<WorkerSignal>,
) -> i32 {
    let runtime = match tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(err) => {
            let _ = signals.send(WorkerSignal::Error(format!(
                "failed to build worker runtime: {err}"
            )));
            return 1;
        }
    };
    let _ = signals.send(WorkerSignal::Online);

    let local = LocalSet::new();
    let result = panic::catch_unwind(AssertUnwindSafe(|| {
        local.block_on(&runtime, async move {
            let agent = Agent::new(port);
            let _log_guard = log_forward::install(agent.clone(), log_level);
            entry.run(WorkerContext { id, args, agent }).await
        })
    }));

    let failure = match result {
        Ok(Ok(())) => return 0,
        Ok(Err(err)) => format!("{err:#}"),
        Err(payload) => format!("worker panicked: {}", panic_message(payload.as_ref())),
    };
    let _ = signals.send(WorkerSignal::Error(failure));
    1
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message
    } else {
        "unknown panic"
    }
}

/// Backend address resolution state of a worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Readiness {
    Pending,
    Ready(BackendAddress),
    Failed(String),
}

/// How a worker thread finished.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerExit {
    pub code: i32,
    pub error: Option<String>,
}

impl WorkerExit {
    pub fn is_clean(&self) -> bool {
        self.code == 0 && self.error.is_none()
    }
}

impl fmt::Display for WorkerExit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.error {
            Some(error) => write!(f, "exit code {}: {error}", self.code),
            None => write!(f, "exit code {}", self.code),
        }
    }
}

/// Controller-side handle for one worker.
///
/// Handles are compared by identity (`Arc::ptr_eq`). The connection counter
/// is only changed while the pool lock is held, so the pool order can be
/// restored before anyone else observes it.
pub struct WorkerHandle {
    id: u64,
    connections: AtomicUsize,
    agent: Agent,
    readiness: watch::Sender<Readiness>,
    exit: watch::Sender<Option<WorkerExit>>,
}

impl WorkerHandle {
    pub fn new(id: u64, agent: Agent) -> Self {
        Self {
            id,
            connections: AtomicUsize::new(0),
            agent,
            readiness: watch::Sender::new(Readiness::Pending),
            exit: watch::Sender::new(None),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn connections(&self) -> usize {
        self.connections.load(Ordering::Acquire)
    }

    pub fn agent(&self) -> &Agent {
        &self.agent
    }

    /// The resolved backend address, if the worker has reported one.
    pub fn backend_address(&self) -> Option<BackendAddress> {
        match &*self.readiness.borrow() {
            Readiness::Ready(address) => Some(address.clone()),
            _ => None,
        }
    }

    /// Wait until the backend address is known.
    ///
    /// # Errors
    ///
    /// `WorkerUnavailable` if the worker failed or exited before reporting
    /// an address.
    pub async fn ready(&self) -> Result<BackendAddress, ProxyError> {
        let mut readiness = self.readiness.subscribe();
        let state = readiness
            .wait_for(|state| !matches!(state, Readiness::Pending))
            .await
            .map_err(|_| self.unavailable("worker handle dropped"))?;
        match &*state {
            Readiness::Ready(address) => Ok(address.clone()),
            Readiness::Failed(reason) => Err(self.unavailable(reason)),
            Readiness::Pending => Err(self.unavailable("worker not ready")),
        }
    }

    /// Wait for the worker thread to finish.
    pub async fn exited(&self) -> WorkerExit {
        let mut exit = self.exit.subscribe();
        let fallback = WorkerExit {
            code: 1,
            error: Some("worker handle dropped".to_string()),
        };
        match exit.wait_for(Option::is_some).await {
            Ok(state) => (*state).clone().unwrap_or(fallback),
            Err(_) => fallback,
        }
    }

    /// Ask the worker to stop its service and exit.
    pub async fn try_terminate(&self) -> Result<(), RpcError> {
        self.agent.call(methods::TRY_TERMINATE, Value::Null).await?;
        Ok(())
    }

    /// Resolve the backend address; ignored once resolved or failed.
    pub(crate) fn resolve(&self, address: BackendAddress) {
        self.readiness.send_if_modified(|state| {
            if matches!(state, Readiness::Pending) {
                *state = Readiness::Ready(address);
                true
            } else {
                false
            }
        });
    }

    /// Reject pending readiness; ignored once resolved or failed.
    pub(crate) fn fail(&self, reason: impl Into<String>) {
        let reason = reason.into();
        self.readiness.send_if_modified(|state| {
            if matches!(state, Readiness::Pending) {
                *state = Readiness::Failed(reason);
                true
            } else {
                false
            }
        });
    }

    pub(crate) fn mark_exited(&self, exit: WorkerExit) {
        self.exit.send_if_modified(|state| {
            if state.is_none() {
                *state = Some(exit);
                true
            } else {
                false
            }
        });
    }

    pub(crate) fn add_connection(&self) {
        self.connections.fetch_add(1, Ordering::AcqRel);
    }

    pub(crate) fn remove_connection(&self) {
        let _ = self
            .connections
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1));
    }

    pub fn snapshot(&self) -> WorkerSnapshot {
        WorkerSnapshot {
            id: self.id,
            connections: self.connections(),
            backend_address: self.backend_address(),
        }
    }

    fn unavailable(&self, reason: impl Into<String>) -> ProxyError {
        ProxyError::WorkerUnavailable {
            id: self.id,
            reason: reason.into(),
        }
    }
}

impl fmt::Debug for WorkerHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkerHandle")
            .field("id", &self.id)
            .field("connections", &self.connections())
            .field("readiness", &*self.readiness.borrow())
            .finish()
    }
}

/// Point-in-time view of a pooled worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerSnapshot {
    pub id: u64,
    pub connections: usize,
    pub backend_address: Option<BackendAddress>,
}

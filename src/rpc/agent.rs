use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender};
use tokio::sync::oneshot;
use tracing::trace;

use super::message::Frame;
use super::port::Port;
use crate::error::RpcError;

/// Inbound method implementation.
pub type Handler = Arc<dyn Fn(Value) -> Result<Value, String> + Send + Sync>;

// replies addressed to this id belong to notifications and are dropped
const NOTIFY_ID: u64 = 0;

/// Request/response endpoint over a [`Port`].
///
/// Calls to a method the peer has not registered yet are held by the peer
/// and dispatched once it registers that method.
#[derive(Clone)]
pub struct Agent {
    inner: Arc<AgentInner>,
}

struct AgentInner {
    tx: UnboundedSender<Frame>,
    next_id: AtomicU64,
    state: Mutex<AgentState>,
}

#[derive(Default)]
struct AgentState {
    handlers: HashMap<String, Handler>,
    pending: HashMap<u64, oneshot::Sender<Result<Value, String>>>,
    deferred: HashMap<String, Vec<(u64, Value)>>,
    closed: bool,
}

impl Agent {
    /// Take ownership of `port` and start reading frames from it.
    ///
    /// Must be called from within a tokio runtime.
    pub fn new(port: Port) -> Self {
        let Port { tx, rx } = port;
        let inner = Arc::new(AgentInner {
            tx,
            next_id: AtomicU64::new(NOTIFY_ID + 1),
            state: Mutex::default(),
        });
        tokio::spawn(read_frames(Arc::clone(&inner), rx));
        Self { inner }
    }

    /// Register `handler` for `method`, then run any calls that were waiting for it.
    pub fn register<F>(&self, method: &str, handler: F)
    where
        F: Fn(Value) -> Result<Value, String> + Send + Sync + 'static,
    {
        let handler: Handler = Arc::new(handler);
        let deferred = {
            let mut state = self.inner.state();
            state
                .handlers
                .insert(method.to_string(), Arc::clone(&handler));
            state.deferred.remove(method).unwrap_or_default()
        };
        for (id, params) in deferred {
            self.inner.respond(id, handler(params));
        }
    }

    pub async fn call(&self, method: &str, params: Value) -> Result<Value, RpcError> {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let (reply_tx, reply_rx) = oneshot::channel();
        {
            let mut state = self.inner.state();
            if state.closed {
                return Err(disconnected(method));
            }
            state.pending.insert(id, reply_tx);
        }

        let frame = Frame::Call {
            id,
            method: method.to_string(),
            params,
        };
        if self.inner.tx.send(frame).is_err() {
            self.inner.state().pending.remove(&id);
            return Err(disconnected(method));
        }

        match reply_rx.await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(message)) => Err(RpcError::Remote {
                method: method.to_string(),
                message,
            }),
            Err(_) => Err(disconnected(method)),
        }
    }

    /// Typed wrapper around [`Agent::call`].
    pub async fn call_as<P, T>(&self, method: &str, params: &P) -> Result<T, RpcError>
    where
        P: Serialize + ?Sized,
        T: DeserializeOwned,
    {
        let params = serde_json::to_value(params)?;
        let value = self.call(method, params).await?;
        Ok(serde_json::from_value(value)?)
    }

    /// Fire-and-forget call. Returns false if the channel is already gone.
    pub fn notify(&self, method: &str, params: Value) -> bool {
        self.inner
            .tx
            .send(Frame::Call {
                id: NOTIFY_ID,
                method: method.to_string(),
                params,
            })
            .is_ok()
    }

    /// True once the peer has hung up.
    pub fn is_closed(&self) -> bool {
        self.inner.state().closed || self.inner.tx.is_closed()
    }
}

impl fmt::Debug for Agent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.inner.state();
        f.debug_struct("Agent")
            .field("pending", &state.pending.len())
            .field("handlers", &state.handlers.len())
            .field("closed", &state.closed)
            .finish()
    }
}

impl AgentInner {
    fn state(&self) -> MutexGuard<'_, AgentState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn dispatch(&self, id: u64, method: String, params: Value) {
        let handler = {
            let mut state = self.state();
            match state.handlers.get(&method) {
                Some(handler) => Arc::clone(handler),
                None => {
                    state
                        .deferred
                        .entry(method)
                        .or_default()
                        .push((id, params));
                    return;
                }
            }
        };
        self.respond(id, handler(params));
    }

    fn respond(&self, id: u64, result: Result<Value, String>) {
        if id != NOTIFY_ID {
            let _ = self.tx.send(Frame::Reply { id, result });
        }
    }
}

async fn read_frames(inner: Arc<AgentInner>, mut rx: UnboundedReceiver<Frame>) {
    while let Some(frame) = rx.recv().await {
        match frame {
            Frame::Call { id, method, params } => inner.dispatch(id, method, params),
            Frame::Reply { id, result } => {
                let waiter = inner.state().pending.remove(&id);
                match waiter {
                    Some(waiter) => {
                        let _ = waiter.send(result);
                    }
                    None => trace!(id, "reply for an abandoned call"),
                }
            }
        }
    }

    // peer is gone: fail everything still waiting
    let mut state = inner.state();
    state.closed = true;
    state.pending.clear();
    state.deferred.clear();
}

fn disconnected(method: &str) -> RpcError {
    RpcError::Disconnected {
        method: method.to_string(),
    }
}

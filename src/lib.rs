//! weft: a connection-level TCP load balancer over a pool of worker threads.
//!
//! A [`Proxy`] owns the front-facing listener. Each accepted connection is
//! routed to the least loaded worker (spawning one when none is idle and the
//! cap allows), spliced to that worker's own server, and counted against the
//! worker until it closes. Workers run a [`ServiceAgent`] on their own
//! single-threaded runtime and talk to the controller over an [`rpc::Agent`].

pub mod balancer;
pub mod bridge;
pub mod constants;
pub mod error;
pub mod logging;
pub mod rpc;
pub mod service;

pub use balancer::{
    PoolBounds, Proxy, ProxyConfig, WorkerContext, WorkerEntry, WorkerExit, WorkerOptions,
    WorkerOutcome, WorkerSnapshot,
};
pub use bridge::{BackendAddress, ProxySocketAddressInfo, ServiceListener, SocketStream};
pub use error::{ConfigError, ProxyError, Result, RpcError};
pub use service::{ServiceAgent, ServiceState};

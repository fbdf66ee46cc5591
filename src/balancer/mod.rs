//! Worker pool scheduling and connection routing
//!
//! This module provides the controller side of the load balancer:
//! - `proxy`: front-facing listener, floor maintenance, pruning and shutdown
//! - `agent_pool`: worker handles ordered by connection count
//! - `worker`: worker threads and their controller-side handles
//! - `handlers`: connection admission and the methods workers call

pub mod agent_pool;
pub mod config;
mod handlers;
pub mod proxy;
pub mod worker;

// Re-export main types
pub use agent_pool::AgentPool;
pub use config::{PoolBounds, ProxyConfig, WorkerOptions};
pub use proxy::{Proxy, WorkerOutcome};
pub use worker::{
    WorkerContext, WorkerEntry, WorkerExit, WorkerHandle, WorkerSignal,
    WorkerSnapshot, spawn_worker_thread,
};

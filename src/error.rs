//! Error types for weft.

use std::io;
use std::time::Duration;

use thiserror::Error;

/// Rejected proxy configuration.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("worker_count must be at least 1, got {0}")]
    WorkerCount(usize),

    #[error("max_workers must be at least 1, got {0}")]
    MaxWorkers(usize),

    #[error("min_workers ({min}) must not exceed max_workers ({max})")]
    MinExceedsMax { min: usize, max: usize },

    #[error("io_buffer_capacity must be greater than zero")]
    IoBufferCapacity,

    #[error("workers_checking_interval must be greater than zero")]
    CheckingInterval,
}

/// Failure of a call over the remote call channel.
#[derive(Error, Debug)]
pub enum RpcError {
    #[error("channel closed before '{method}' completed")]
    Disconnected { method: String },

    #[error("remote '{method}' failed: {message}")]
    Remote { method: String, message: String },

    #[error("JSON error: {0}")]
    Codec(#[from] serde_json::Error),
}

/// Main error type for the controller.
#[derive(Error, Debug)]
pub enum ProxyError {
    #[error("Invalid configuration: {0}")]
    Config(#[from] ConfigError),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Remote call error: {0}")]
    Rpc(#[from] RpcError),

    #[error("Worker {id} is unavailable: {reason}")]
    WorkerUnavailable { id: u64, reason: String },

    #[error("Worker {id} failed: {reason}")]
    WorkerFailed { id: u64, reason: String },

    #[error("Worker {id} did not exit within {timeout:?}")]
    ShutdownTimeout { id: u64, timeout: Duration },

    #[error("Proxy is shutting down")]
    ShuttingDown,

    #[error("Proxy must be started from within a tokio runtime")]
    NoRuntime,
}

/// Result type alias for controller operations.
pub type Result<T> = std::result::Result<T, ProxyError>;

use std::fmt;
use std::net::SocketAddr;
use std::time::Duration;

use tracing::level_filters::LevelFilter;

use crate::constants;
use crate::error::ConfigError;

use super::worker::WorkerEntry;

/// Options handed to every spawned worker thread.
#[derive(Debug, Clone)]
pub struct WorkerOptions {
    /// Thread name prefix; the worker id is appended
    pub thread_name: String,
    pub stack_size: Option<usize>,
    /// Pin worker threads round-robin onto the available cores
    pub pin_to_cores: bool,
    /// Free-form arguments exposed to the entry point
    pub args: Vec<String>,
    /// Minimum level of worker log records forwarded to the controller
    pub log_level: LevelFilter,
}

impl Default for WorkerOptions {
    fn default() -> Self {
        Self {
            thread_name: constants::WORKER_THREAD_NAME.to_string(),
            stack_size: None,
            pin_to_cores: false,
            args: Vec::new(),
            log_level: LevelFilter::INFO,
        }
    }
}

/// Resolved pool size limits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolBounds {
    pub min: usize,
    /// Unbounded when `None`
    pub max: Option<usize>,
}

/// Proxy configuration
pub struct ProxyConfig {
    /// Front-facing bind address (ignored when `listener` is set)
    pub listen_addr: SocketAddr,
    /// Already-bound front-facing socket
    pub listener: Option<std::net::TcpListener>,
    pub entry: WorkerEntry,
    pub min_workers: usize,
    pub max_workers: Option<usize>,
    /// Pins both `min_workers` and `max_workers` when set
    pub worker_count: Option<usize>,
    /// Period of idle-worker pruning; pruning is off when `None`
    pub workers_checking_interval: Option<Duration>,
    /// How long shutdown waits for each worker to exit
    pub shutdown_timeout: Option<Duration>,
    /// Idle time after which a bridged socket logs a timeout
    pub socket_timeout: Option<Duration>,
    /// How long a bridged pair waits on a silent peer after the other side ended
    pub half_close_linger: Duration,
    /// Per-direction splice buffer size
    pub io_buffer_capacity: usize,
    pub backlog: i32,
    pub reuse_port: bool,
    pub worker_options: WorkerOptions,
}

impl ProxyConfig {
    pub fn new(entry: WorkerEntry) -> Self {
        Self {
            listen_addr: SocketAddr::from(([127, 0, 0, 1], 0)),
            listener: None,
            entry,
            min_workers: 0,
            max_workers: None,
            worker_count: None,
            workers_checking_interval: None,
            shutdown_timeout: None,
            socket_timeout: None,
            half_close_linger: constants::HALF_CLOSE_LINGER,
            io_buffer_capacity: constants::IO_BUFFER_CAPACITY,
            backlog: constants::LISTEN_BACKLOG,
            reuse_port: false,
            worker_options: WorkerOptions::default(),
        }
    }

    pub fn listen_addr(mut self, addr: SocketAddr) -> Self {
        self.listen_addr = addr;
        self
    }

    pub fn listener(mut self, listener: std::net::TcpListener) -> Self {
        self.listener = Some(listener);
        self
    }

    pub fn min_workers(mut self, min: usize) -> Self {
        self.min_workers = min;
        self
    }

    pub fn max_workers(mut self, max: usize) -> Self {
        self.max_workers = Some(max);
        self
    }

    pub fn worker_count(mut self, count: usize) -> Self {
        self.worker_count = Some(count);
        self
    }

    pub fn workers_checking_interval(mut self, interval: Duration) -> Self {
        self.workers_checking_interval = Some(interval);
        self
    }

    pub fn shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = Some(timeout);
        self
    }

    pub fn socket_timeout(mut self, timeout: Duration) -> Self {
        self.socket_timeout = Some(timeout);
        self
    }

    pub fn half_close_linger(mut self, linger: Duration) -> Self {
        self.half_close_linger = linger;
        self
    }

    pub fn worker_options(mut self, options: WorkerOptions) -> Self {
        self.worker_options = options;
        self
    }

    /// Check the configuration and resolve the pool bounds.
    ///
    /// # Errors
    ///
    /// Returns a [`ConfigError`] naming the first violated rule.
    pub fn validate(&self) -> Result<PoolBounds, ConfigError> {
        if self.io_buffer_capacity == 0 {
            return Err(ConfigError::IoBufferCapacity);
        }
        if self.workers_checking_interval.is_some_and(|i| i.is_zero()) {
            return Err(ConfigError::CheckingInterval);
        }

        if let Some(count) = self.worker_count {
            if count < 1 {
                return Err(ConfigError::WorkerCount(count));
            }
            return Ok(PoolBounds {
                min: count,
                max: Some(count),
            });
        }

        if let Some(max) = self.max_workers {
            if max < 1 {
                return Err(ConfigError::MaxWorkers(max));
            }
            if self.min_workers > max {
                return Err(ConfigError::MinExceedsMax {
                    min: self.min_workers,
                    max,
                });
            }
        }

        Ok(PoolBounds {
            min: self.min_workers,
            max: self.max_workers,
        })
    }
}

impl fmt::Debug for ProxyConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProxyConfig")
            .field("listen_addr", &self.listen_addr)
            .field("listener", &self.listener)
            .field("min_workers", &self.min_workers)
            .field("max_workers", &self.max_workers)
            .field("worker_count", &self.worker_count)
            .field("workers_checking_interval", &self.workers_checking_interval)
            .field("shutdown_timeout", &self.shutdown_timeout)
            .field("socket_timeout", &self.socket_timeout)
            .field("half_close_linger", &self.half_close_linger)
            .field("io_buffer_capacity", &self.io_buffer_capacity)
            .field("backlog", &self.backlog)
            .field("reuse_port", &self.reuse_port)
            .field("worker_options", &self.worker_options)
            .finish_non_exhaustive()
    }
}

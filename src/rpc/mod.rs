//! Remote call channel between the controller and its workers
//!
//! - `Port`: a pair of connected frame queues
//! - `Agent`: correlated calls, notifications and method registration on a port
//! - `Frame`/`LogRecord`: serde-serializable wire types

pub mod agent;
pub mod message;
pub mod port;

pub use agent::{Agent, Handler};
pub use message::{Frame, LogLevel, LogRecord};
pub use port::Port;

/// Method names used on the channel.
pub mod methods {
    /// Worker: returns the backend address once the service is listening.
    pub const SOCKET_CONNECT_OPTS: &str = "socket_connect_opts";
    /// Worker: stop accepting and exit.
    pub const TRY_TERMINATE: &str = "try_terminate";
    /// Controller: re-emit a worker log record.
    pub const SERVICE_LOG: &str = "service_log";
    /// Controller: client address info for a backend-side connection.
    pub const REQUEST_PROXY_ADDRESS_INFO: &str = "request_proxy_address_info";
}

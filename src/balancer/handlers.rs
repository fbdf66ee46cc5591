use std::net::SocketAddr;
use std::sync::Arc;

use serde_json::Value;
use tokio::net::TcpStream;
use tracing::{debug, error, info, trace, warn};

use crate::bridge::socket::peer_closed;
use crate::bridge::{AddressMap, ConnectionPair};
use crate::error::Result;
use crate::rpc::{Agent, LogLevel, LogRecord, methods};

use super::proxy::ProxyInner;
use super::worker::WorkerHandle;

/// One counted connection on a worker; released on drop.
struct ConnectionLease {
    proxy: Arc<ProxyInner>,
    handle: Arc<WorkerHandle>,
}

impl ConnectionLease {
    fn acquire(proxy: &Arc<ProxyInner>) -> Result<Self> {
        let handle = proxy.select_worker()?;
        Ok(Self {
            proxy: Arc::clone(proxy),
            handle,
        })
    }
}

impl Drop for ConnectionLease {
    fn drop(&mut self) {
        self.proxy.agents().release(&self.handle);
    }
}

/// Route one accepted client connection to a worker and splice it.
///
/// Never fails: every error is logged and the client socket is dropped.
pub(crate) async fn admit(proxy: Arc<ProxyInner>, client: TcpStream) {
    let peer = client.peer_addr().ok();
    let lease = match ConnectionLease::acquire(&proxy) {
        Ok(lease) => lease,
        Err(err) => {
            warn!(?peer, error = %err, "connection refused");
            return;
        }
    };
    let worker = lease.handle.id();

    let backend_address = match lease.handle.ready().await {
        Ok(address) => address,
        Err(err) => {
            drop(client);
            proxy.retire_worker(&lease.handle);
            error!(worker, ?peer, error = %err, "dropping connection");
            return;
        }
    };

    if peer_closed(&client) {
        debug!(worker, ?peer, "client closed while waiting for a worker");
        return;
    }

    match ConnectionPair::connect(client, &backend_address, &proxy.addresses, proxy.bridge).await {
        Ok(pair) => {
            trace!(worker, ?peer, backend = %backend_address, "splicing");
            pair.splice().await;
        }
        Err(err) => {
            error!(worker, ?peer, backend = %backend_address, error = %err, "backend connect failed");
        }
    }
}

/// Methods the controller answers for worker `worker`.
pub(crate) fn register_controller_methods(agent: &Agent, worker: u64, addresses: &AddressMap) {
    agent.register(methods::SERVICE_LOG, move |params| {
        let record: LogRecord = serde_json::from_value(params).map_err(|err| err.to_string())?;
        service_log(worker, &record);
        Ok(Value::Null)
    });

    let addresses = addresses.clone();
    agent.register(methods::REQUEST_PROXY_ADDRESS_INFO, move |params| {
        let backend_local: SocketAddr =
            serde_json::from_value(params).map_err(|err| err.to_string())?;
        serde_json::to_value(addresses.get(&backend_local)).map_err(|err| err.to_string())
    });
}

/// Re-emit a worker log record at its own level.
fn service_log(worker: u64, record: &LogRecord) {
    let LogRecord {
        level,
        target,
        message,
    } = record;
    match level {
        LogLevel::Trace => trace!(worker, origin = %target, "{message}"),
        LogLevel::Debug => debug!(worker, origin = %target, "{message}"),
        LogLevel::Info => info!(worker, origin = %target, "{message}"),
        LogLevel::Warn => warn!(worker, origin = %target, "{message}"),
        LogLevel::Error => error!(worker, origin = %target, "{message}"),
    }
}

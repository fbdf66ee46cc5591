use std::io;
use std::time::Duration;

use tokio::net::TcpStream;
use tokio::sync::watch;
use tracing::{debug, error};

use super::address_map::{AddressLease, AddressMap, ProxySocketAddressInfo};
use super::socket::{BackendAddress, SocketStream, connect_backend};
use super::stream_pump::{Direction, StreamPump};

/// Buffer and timeout settings applied to both directions of a bridge.
#[derive(Debug, Clone, Copy)]
pub struct BridgeSettings {
    pub io_buffer_capacity: usize,
    pub socket_timeout: Option<Duration>,
    /// Silence tolerated on the remaining side once one side has ended
    pub half_close_linger: Duration,
}

/// Bytes moved in each direction; `None` when that direction failed or was cut short.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SpliceSummary {
    pub client_to_backend: Option<u64>,
    pub backend_to_client: Option<u64>,
}

/// A client connection and the backend connection opened for it.
pub struct ConnectionPair {
    client: TcpStream,
    backend: SocketStream,
    backend_address: BackendAddress,
    settings: BridgeSettings,
    // keeps the backend-local -> client mapping alive until the pair closes
    _address_lease: Option<AddressLease>,
}

impl ConnectionPair {
    /// Connect to `backend_address` on behalf of `client`.
    ///
    /// On failure the client socket is dropped and nothing is left open on
    /// the backend side.
    pub async fn connect(
        client: TcpStream,
        backend_address: &BackendAddress,
        addresses: &AddressMap,
        settings: BridgeSettings,
    ) -> io::Result<Self> {
        let backend = connect_backend(backend_address).await?;

        let lease = match (backend.local_addr(), client.local_addr(), client.peer_addr()) {
            (Some(backend_local), Ok(local), Ok(remote)) => Some(
                addresses.insert(backend_local, ProxySocketAddressInfo { local, remote }),
            ),
            _ => None,
        };

        Ok(Self {
            client,
            backend,
            backend_address: backend_address.clone(),
            settings,
            _address_lease: lease,
        })
    }

    /// Forward bytes both ways until the pair closes.
    ///
    /// An end on either side ends the other. The remaining direction keeps
    /// flowing until it ends or stays silent for `half_close_linger`, then
    /// both sockets are closed. An error on either side tears both down.
    /// The address mapping is released when this returns.
    pub async fn splice(self) -> SpliceSummary {
        let Self {
            client,
            backend,
            backend_address,
            settings,
            _address_lease,
        } = self;

        let (client_read, client_write) = tokio::io::split(client);
        let (backend_read, backend_write) = tokio::io::split(backend);
        let (draining_tx, draining) = watch::channel(false);

        let upstream = StreamPump::new(
            Direction::ClientToBackend,
            client_read,
            backend_write,
            settings.io_buffer_capacity,
            settings.socket_timeout,
        )
        .with_drain(draining.clone(), settings.half_close_linger)
        .run();
        let downstream = StreamPump::new(
            Direction::BackendToClient,
            backend_read,
            client_write,
            settings.io_buffer_capacity,
            settings.socket_timeout,
        )
        .with_drain(draining, settings.half_close_linger)
        .run();
        tokio::pin!(upstream, downstream);

        let mut summary = SpliceSummary::default();
        tokio::select! {
            result = &mut upstream => {
                summary.client_to_backend = settle(Direction::ClientToBackend, result, &backend_address);
                if summary.client_to_backend.is_some() {
                    draining_tx.send_replace(true);
                    summary.backend_to_client =
                        settle(Direction::BackendToClient, downstream.await, &backend_address);
                }
            }
            result = &mut downstream => {
                summary.backend_to_client = settle(Direction::BackendToClient, result, &backend_address);
                if summary.backend_to_client.is_some() {
                    draining_tx.send_replace(true);
                    summary.client_to_backend =
                        settle(Direction::ClientToBackend, upstream.await, &backend_address);
                }
            }
        }

        debug!(
            backend = %backend_address,
            sent = ?summary.client_to_backend,
            received = ?summary.backend_to_client,
            "connection pair closed"
        );
        summary
    }
}

fn settle(direction: Direction, result: io::Result<u64>, backend: &BackendAddress) -> Option<u64> {
    match result {
        Ok(bytes) => {
            debug!(%direction, %backend, bytes, "socket end");
            Some(bytes)
        }
        Err(err) if err.kind() == io::ErrorKind::TimedOut => {
            debug!(%direction, %backend, "peer lingered after close, closing pair");
            None
        }
        Err(err) => {
            error!(%direction, %backend, error = %err, "socket error");
            None
        }
    }
}

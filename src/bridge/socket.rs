//! Socket utility functions for the proxy
//!
//! This module provides the socket plumbing shared by both sides:
//! - front-facing listener setup
//! - backend addresses and backend connects
//! - the TCP/Unix stream type bridged by the proxy and served by workers

use std::fmt;
use std::io;
use std::mem::MaybeUninit;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::path::PathBuf;
use std::pin::Pin;
use std::task::{Context, Poll};

use serde::{Deserialize, Serialize};
use socket2::{Domain, Protocol, SockRef, Socket, Type};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::{TcpListener, TcpStream, UnixListener, UnixStream};

/// Where a worker's server accepts forwarded connections.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendAddress {
    Tcp(SocketAddr),
    Unix(PathBuf),
}

impl fmt::Display for BackendAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Tcp(addr) => write!(f, "{addr}"),
            Self::Unix(path) => write!(f, "unix:{}", path.display()),
        }
    }
}

impl From<SocketAddr> for BackendAddress {
    fn from(addr: SocketAddr) -> Self {
        Self::Tcp(addr)
    }
}

/// Create the front-facing listening socket.
///
/// SO_REUSEADDR is always set; SO_REUSEPORT only when asked for, so several
/// proxies can share one port and let the kernel spread connections.
pub fn make_listener(
    addr: SocketAddr,
    backlog: i32,
    reuse_port: bool,
) -> io::Result<std::net::TcpListener> {
    let sock = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
    sock.set_reuse_address(true)?;
    if reuse_port {
        sock.set_reuse_port(true)?; // requires socket2 = { version="0.6", features=["all"] }
    }
    sock.set_nonblocking(true)?;
    sock.bind(&addr.into())?;
    sock.listen(backlog)?;
    Ok(sock.into())
}

/// Address a client should dial to reach a TCP server bound to `local`.
///
/// Unspecified hosts map to loopback of the same family; an unassigned port
/// means there is nothing to dial yet.
pub fn reachable_address(local: SocketAddr) -> Option<BackendAddress> {
    if local.port() == 0 {
        return None;
    }
    let ip = match local.ip() {
        IpAddr::V4(ip) if ip.is_unspecified() => IpAddr::V4(Ipv4Addr::LOCALHOST),
        IpAddr::V6(ip) if ip.is_unspecified() => IpAddr::V6(Ipv6Addr::LOCALHOST),
        ip => ip,
    };
    Some(BackendAddress::Tcp(SocketAddr::new(ip, local.port())))
}

/// Open a connection to a worker's server.
pub async fn connect_backend(address: &BackendAddress) -> io::Result<SocketStream> {
    match address {
        BackendAddress::Tcp(addr) => {
            let stream = TcpStream::connect(addr).await?;
            stream.set_nodelay(true)?;
            Ok(SocketStream::Tcp(stream))
        }
        BackendAddress::Unix(path) => Ok(SocketStream::Unix(UnixStream::connect(path).await?)),
    }
}

/// True if the peer has already closed `stream`.
///
/// Peeks without consuming, so a client that sent data and is still
/// waiting is reported as open.
pub fn peer_closed(stream: &TcpStream) -> bool {
    let mut probe = [MaybeUninit::<u8>::uninit(); 1];
    match SockRef::from(stream).peek(&mut probe) {
        Ok(0) => true,
        Ok(_) => false,
        Err(err) if err.kind() == io::ErrorKind::WouldBlock => false,
        Err(_) => true,
    }
}

/// A worker-side listener, TCP or Unix.
#[derive(Debug)]
pub enum ServiceListener {
    Tcp(TcpListener),
    Unix(UnixListener),
}

impl ServiceListener {
    pub async fn accept(&self) -> io::Result<SocketStream> {
        match self {
            Self::Tcp(listener) => {
                let (stream, _) = listener.accept().await?;
                Ok(SocketStream::Tcp(stream))
            }
            Self::Unix(listener) => {
                let (stream, _) = listener.accept().await?;
                Ok(SocketStream::Unix(stream))
            }
        }
    }

    /// The address the proxy should forward connections to, if any.
    pub fn backend_address(&self) -> io::Result<Option<BackendAddress>> {
        match self {
            Self::Tcp(listener) => Ok(reachable_address(listener.local_addr()?)),
            Self::Unix(listener) => Ok(listener
                .local_addr()?
                .as_pathname()
                .map(|path| BackendAddress::Unix(path.to_path_buf()))),
        }
    }
}

impl From<TcpListener> for ServiceListener {
    fn from(listener: TcpListener) -> Self {
        Self::Tcp(listener)
    }
}

impl From<UnixListener> for ServiceListener {
    fn from(listener: UnixListener) -> Self {
        Self::Unix(listener)
    }
}

/// A connected TCP or Unix stream.
#[derive(Debug)]
pub enum SocketStream {
    Tcp(TcpStream),
    Unix(UnixStream),
}

impl SocketStream {
    pub fn local_addr(&self) -> Option<SocketAddr> {
        match self {
            Self::Tcp(stream) => stream.local_addr().ok(),
            Self::Unix(_) => None,
        }
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        match self {
            Self::Tcp(stream) => stream.peer_addr().ok(),
            Self::Unix(_) => None,
        }
    }
}

impl AsyncRead for SocketStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Self::Tcp(stream) => Pin::new(stream).poll_read(cx, buf),
            Self::Unix(stream) => Pin::new(stream).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for SocketStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            Self::Tcp(stream) => Pin::new(stream).poll_write(cx, buf),
            Self::Unix(stream) => Pin::new(stream).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Self::Tcp(stream) => Pin::new(stream).poll_flush(cx),
            Self::Unix(stream) => Pin::new(stream).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Self::Tcp(stream) => Pin::new(stream).poll_shutdown(cx),
            Self::Unix(stream) => Pin::new(stream).poll_shutdown(cx),
        }
    }
}

//! Shared helpers for the proxy integration tests.

#![allow(dead_code)]

use std::net::SocketAddr;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use weft::{ServiceAgent, SocketStream, WorkerContext, WorkerEntry};

pub const WAIT_LIMIT: Duration = Duration::from_secs(10);

/// Echo every byte back until the client closes.
pub async fn echo(mut stream: SocketStream) {
    let mut buf = vec![0u8; 8 * 1024];
    loop {
        match stream.read(&mut buf).await {
            Ok(0) | Err(_) => return,
            Ok(n) => {
                if stream.write_all(&buf[..n]).await.is_err() {
                    return;
                }
            }
        }
    }
}

pub async fn echo_worker(ctx: WorkerContext) -> anyhow::Result<()> {
    let service = ServiceAgent::new(ctx);
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    service.serve(listener, echo).await
}

pub fn echo_entry() -> WorkerEntry {
    WorkerEntry::new(echo_worker)
}

/// Poll `check` until it holds or `WAIT_LIMIT` passes.
pub async fn wait_until(mut check: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + WAIT_LIMIT;
    while tokio::time::Instant::now() < deadline {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    check()
}

/// Connect through the proxy and check one small echo, leaving the connection open.
pub async fn connected_client(proxy_addr: SocketAddr) -> TcpStream {
    let mut client = TcpStream::connect(proxy_addr).await.unwrap();
    client.write_all(b"ping").await.unwrap();
    let mut reply = [0u8; 4];
    tokio::time::timeout(WAIT_LIMIT, client.read_exact(&mut reply))
        .await
        .expect("echo timed out")
        .unwrap();
    assert_eq!(&reply, b"ping");
    client
}

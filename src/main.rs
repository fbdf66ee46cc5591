use std::net::SocketAddr;
use std::time::Duration;

use anyhow::Context;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tracing::{debug, info, warn};

use weft::logging::{self, LogConfig};
use weft::{Proxy, ProxyConfig, ServiceAgent, SocketStream, WorkerEntry};

const LISTEN_ADDR: &str = "0.0.0.0:3000";
const MIN_WORKERS: usize = 2;
const CHECKING_INTERVAL: Duration = Duration::from_secs(10);
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

/// Worker entry point: a TCP echo service on an ephemeral loopback port.
async fn echo_worker(ctx: weft::WorkerContext) -> anyhow::Result<()> {
    let service = ServiceAgent::new(ctx);
    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .context("failed to bind echo listener")?;

    let handler_service = service.clone();
    service
        .serve(listener, move |stream| {
            let service = handler_service.clone();
            async move {
                if let Err(err) = echo(&service, stream).await {
                    warn!(error = %err, "echo connection failed");
                }
            }
        })
        .await
}

async fn echo(service: &ServiceAgent, mut stream: SocketStream) -> anyhow::Result<()> {
    if let Some(info) = service.proxy_address_info(&stream).await? {
        debug!(client = %info.remote, "echo connection");
    }
    let mut buf = vec![0u8; 16 * 1024];
    loop {
        let n = stream.read(&mut buf).await?;
        if n == 0 {
            return Ok(());
        }
        stream.write_all(&buf[..n]).await?;
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    logging::init(LogConfig::default().with_env_overrides());

    let listen_addr: SocketAddr = LISTEN_ADDR.parse()?;
    let max_workers = std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(MIN_WORKERS)
        .max(MIN_WORKERS);

    let config = ProxyConfig::new(WorkerEntry::new(echo_worker))
        .listen_addr(listen_addr)
        .min_workers(MIN_WORKERS)
        .max_workers(max_workers)
        .workers_checking_interval(CHECKING_INTERVAL)
        .shutdown_timeout(SHUTDOWN_TIMEOUT);

    let proxy = Proxy::start(config)?;
    info!(
        listen = %proxy.local_addr(),
        min_workers = MIN_WORKERS,
        max_workers,
        "Starting weft echo balancer"
    );
    proxy.ready().await;

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for Ctrl-C")?;

    for outcome in proxy.shutdown().await {
        match outcome.result {
            Ok(exit) => info!(worker = outcome.worker_id, %exit, "worker stopped"),
            Err(err) => warn!(worker = outcome.worker_id, error = %err, "worker stop failed"),
        }
    }
    Ok(())
}

//! End-to-end tests for the proxy: real sockets, real worker threads.

mod common;

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use pretty_assertions::assert_eq;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinSet;
use weft::constants::MAX_FLOOR_SPAWN_FAILURES;
use weft::{
    ConfigError, Proxy, ProxyConfig, ProxyError, ServiceAgent, ServiceState, SocketStream,
    WorkerContext, WorkerEntry,
};

use common::{WAIT_LIMIT, connected_client, echo, echo_entry, echo_worker, wait_until};

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_floor_of_two_is_ready_with_addresses() {
    let proxy = Proxy::start(ProxyConfig::new(echo_entry()).min_workers(2).max_workers(2)).unwrap();
    tokio::time::timeout(WAIT_LIMIT, proxy.ready())
        .await
        .expect("proxy never became ready");

    let workers = proxy.workers();
    assert_eq!(workers.len(), 2);
    assert!(workers.iter().all(|w| w.backend_address.is_some()));
    assert_eq!(proxy.connection_distribution(), vec![0, 0]);
    assert_eq!(proxy.min_workers(), 2);
    assert_eq!(proxy.max_workers(), Some(2));

    let outcomes = proxy.shutdown().await;
    assert_eq!(outcomes.len(), 2);
    assert!(outcomes.iter().all(|o| o.result.is_ok()), "{outcomes:?}");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_cap_of_one_shares_the_worker() {
    let proxy = Proxy::start(ProxyConfig::new(echo_entry()).max_workers(1)).unwrap();
    proxy.ready().await;
    assert_eq!(proxy.worker_count(), 0);

    let first = connected_client(proxy.local_addr()).await;
    let second = connected_client(proxy.local_addr()).await;
    assert_eq!(proxy.worker_count(), 1);
    assert_eq!(proxy.connection_distribution(), vec![2]);

    drop(first);
    drop(second);
    assert!(wait_until(|| proxy.connection_distribution() == vec![0]).await);
    assert_eq!(proxy.worker_count(), 1);

    proxy.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_large_payload_round_trip() {
    let proxy = Proxy::start(ProxyConfig::new(echo_entry()).min_workers(1)).unwrap();
    proxy.ready().await;

    let client = TcpStream::connect(proxy.local_addr()).await.unwrap();
    let (mut reader, mut writer) = client.into_split();

    let payload: Vec<u8> = (0..100_000u32).map(|i| (i * 7 % 256) as u8).collect();
    let sender = {
        let payload = payload.clone();
        tokio::spawn(async move {
            writer.write_all(&payload).await.unwrap();
            writer.shutdown().await.unwrap();
        })
    };

    let mut received = Vec::with_capacity(payload.len());
    tokio::time::timeout(WAIT_LIMIT, reader.read_to_end(&mut received))
        .await
        .expect("echo timed out")
        .unwrap();
    sender.await.unwrap();
    assert_eq!(received.len(), payload.len());
    assert!(received == payload, "echoed bytes differ");

    assert!(wait_until(|| proxy.connection_distribution() == vec![0]).await);
    proxy.shutdown().await;
}

/// Serves echo, but the first instance dies shortly after becoming ready.
async fn crash_once_worker(ctx: WorkerContext, first: bool) -> anyhow::Result<()> {
    let service = ServiceAgent::new(ctx);
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    if !first {
        return service.serve(listener, echo).await;
    }
    tokio::select! {
        result = service.serve(listener, echo) => result,
        _ = tokio::time::sleep(Duration::from_millis(300)) => anyhow::bail!("simulated crash"),
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_crashed_worker_is_replaced() {
    let starts = Arc::new(AtomicUsize::new(0));
    let entry = {
        let starts = Arc::clone(&starts);
        WorkerEntry::new(move |ctx| {
            let first = starts.fetch_add(1, Ordering::SeqCst) == 0;
            crash_once_worker(ctx, first)
        })
    };

    let proxy = Proxy::start(ProxyConfig::new(entry).min_workers(1)).unwrap();
    proxy.ready().await;
    let original = proxy.workers()[0].id;

    let replaced = wait_until(|| {
        let workers = proxy.workers();
        workers.len() == 1 && workers[0].id != original && workers[0].backend_address.is_some()
    })
    .await;
    assert!(replaced, "workers: {:?}", proxy.workers());
    assert_eq!(starts.load(Ordering::SeqCst), 2);

    // the replacement serves traffic
    drop(connected_client(proxy.local_addr()).await);
    proxy.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_check_workers_prunes_down_to_floor() {
    let proxy = Proxy::start(ProxyConfig::new(echo_entry()).min_workers(1).max_workers(3)).unwrap();
    proxy.ready().await;

    let mut clients = Vec::new();
    for _ in 0..3 {
        clients.push(connected_client(proxy.local_addr()).await);
    }
    assert_eq!(proxy.worker_count(), 3);
    assert_eq!(proxy.connection_distribution(), vec![1, 1, 1]);

    // busy workers are never pruned
    assert_eq!(proxy.check_workers().await, 0);

    clients.clear();
    assert!(wait_until(|| proxy.connection_distribution() == vec![0, 0, 0]).await);

    assert_eq!(proxy.check_workers().await, 2);
    assert_eq!(proxy.worker_count(), 1);
    assert_eq!(proxy.check_workers().await, 0);

    // pruned workers exit without dragging the pool below the floor
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(proxy.worker_count(), 1);
    proxy.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_periodic_pruning() {
    let config = ProxyConfig::new(echo_entry())
        .max_workers(2)
        .workers_checking_interval(Duration::from_millis(50));
    let proxy = Proxy::start(config).unwrap();
    proxy.ready().await;

    let client = connected_client(proxy.local_addr()).await;
    assert_eq!(proxy.worker_count(), 1);
    drop(client);

    assert!(wait_until(|| proxy.worker_count() == 0).await);
    proxy.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_invalid_bounds_fail_start() {
    let err = Proxy::start(ProxyConfig::new(echo_entry()).worker_count(0))
        .err()
        .unwrap();
    assert!(matches!(err, ProxyError::Config(ConfigError::WorkerCount(0))));

    let err = Proxy::start(ProxyConfig::new(echo_entry()).max_workers(0))
        .err()
        .unwrap();
    assert!(matches!(err, ProxyError::Config(ConfigError::MaxWorkers(0))));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_shutdown_twice() {
    let proxy = Proxy::start(ProxyConfig::new(echo_entry()).worker_count(1)).unwrap();
    proxy.ready().await;

    let first = proxy.shutdown().await;
    assert_eq!(first.len(), 1);
    assert!(first[0].result.is_ok());
    assert_eq!(proxy.worker_count(), 0);

    let second = proxy.shutdown().await;
    assert!(second.is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_shutdown_timeout_is_reported() {
    // never serves, never answers terminate
    let entry = WorkerEntry::new(|_ctx| std::future::pending());
    let config = ProxyConfig::new(entry)
        .min_workers(1)
        .shutdown_timeout(Duration::from_millis(200));
    let proxy = Proxy::start(config).unwrap();
    assert!(wait_until(|| proxy.worker_count() == 1).await);

    let outcomes = proxy.shutdown().await;
    assert_eq!(outcomes.len(), 1);
    assert!(matches!(
        outcomes[0].result,
        Err(ProxyError::ShutdownTimeout { .. })
    ));
    assert_eq!(proxy.worker_count(), 0);
}

async fn failing_worker(_ctx: WorkerContext) -> anyhow::Result<()> {
    anyhow::bail!("cannot start")
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_failing_worker_drops_client() {
    let entry = WorkerEntry::new(failing_worker);
    let proxy = Proxy::start(ProxyConfig::new(entry).max_workers(1)).unwrap();
    proxy.ready().await;

    let mut client = TcpStream::connect(proxy.local_addr()).await.unwrap();
    let mut buf = [0u8; 1];
    let read = tokio::time::timeout(WAIT_LIMIT, client.read(&mut buf))
        .await
        .expect("client was not dropped");
    assert!(matches!(read, Ok(0) | Err(_)));

    assert!(wait_until(|| proxy.worker_count() == 0).await);
    assert!(proxy.shutdown().await.is_empty());
}

/// Replies to the first byte with the client addresses the proxy recorded.
async fn address_reporting_worker(ctx: WorkerContext) -> anyhow::Result<()> {
    let service = ServiceAgent::new(ctx);
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let handler_service = service.clone();
    service
        .serve(listener, move |stream| report_address(handler_service.clone(), stream))
        .await
}

async fn report_address(service: ServiceAgent, mut stream: SocketStream) {
    // the bridge is fully set up once a byte has crossed it
    let mut first = [0u8; 1];
    if stream.read_exact(&mut first).await.is_err() {
        return;
    }
    let reply = match service.proxy_address_info(&stream).await {
        Ok(Some(info)) => format!("{} {}\n", info.local, info.remote),
        Ok(None) => "none\n".to_string(),
        Err(err) => format!("error {err}\n"),
    };
    let _ = stream.write_all(reply.as_bytes()).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_worker_learns_client_address() {
    let entry = WorkerEntry::new(address_reporting_worker);
    let proxy = Proxy::start(ProxyConfig::new(entry).min_workers(1)).unwrap();
    proxy.ready().await;

    let mut client = TcpStream::connect(proxy.local_addr()).await.unwrap();
    client.write_all(b"?").await.unwrap();
    let mut reply = String::new();
    tokio::time::timeout(WAIT_LIMIT, async {
        let mut buf = [0u8; 128];
        while !reply.ends_with('\n') {
            let n = client.read(&mut buf).await.unwrap();
            assert_ne!(n, 0, "connection closed early: {reply:?}");
            reply.push_str(std::str::from_utf8(&buf[..n]).unwrap());
        }
    })
    .await
    .expect("no address reply");

    let expected = format!(
        "{} {}\n",
        proxy.local_addr(),
        client.local_addr().unwrap()
    );
    assert_eq!(reply, expected);
    proxy.shutdown().await;
}

type SeenStates = Arc<std::sync::Mutex<Vec<ServiceState>>>;

/// Serves nothing; records the state seen once termination is requested.
async fn wait_for_terminate(ctx: WorkerContext, seen: SeenStates) -> anyhow::Result<()> {
    let service = ServiceAgent::new(ctx);
    service.terminated().await;
    seen.lock().unwrap().push(service.state());
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_terminated_without_serve() {
    let states = SeenStates::default();
    let entry = {
        let states = Arc::clone(&states);
        WorkerEntry::new(move |ctx| wait_for_terminate(ctx, Arc::clone(&states)))
    };
    let proxy = Proxy::start(ProxyConfig::new(entry).min_workers(1)).unwrap();
    assert!(wait_until(|| proxy.worker_count() == 1).await);

    let outcomes = proxy.shutdown().await;
    assert_eq!(outcomes.len(), 1);
    assert!(outcomes[0].result.is_ok());
    assert_eq!(*states.lock().unwrap(), vec![ServiceState::Terminating]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_floor_gives_up_on_a_worker_that_never_starts() {
    let starts = Arc::new(AtomicUsize::new(0));
    let entry = {
        let starts = Arc::clone(&starts);
        WorkerEntry::new(move |ctx| {
            starts.fetch_add(1, Ordering::SeqCst);
            failing_worker(ctx)
        })
    };

    let proxy = Proxy::start(ProxyConfig::new(entry).min_workers(1)).unwrap();
    tokio::time::timeout(WAIT_LIMIT, proxy.ready())
        .await
        .expect("proxy never became ready");
    assert_eq!(starts.load(Ordering::SeqCst), MAX_FLOOR_SPAWN_FAILURES);

    // exits of the failed workers do not start another round
    tokio::time::sleep(Duration::from_millis(500)).await;
    assert_eq!(starts.load(Ordering::SeqCst), MAX_FLOOR_SPAWN_FAILURES);
    assert_eq!(proxy.worker_count(), 0);

    assert!(proxy.shutdown().await.is_empty());
}

/// Fails until `MAX_FLOOR_SPAWN_FAILURES` earlier starts have failed, then serves echo.
async fn slow_to_start_worker(ctx: WorkerContext, start: usize) -> anyhow::Result<()> {
    if start < MAX_FLOOR_SPAWN_FAILURES {
        anyhow::bail!("not yet");
    }
    echo_worker(ctx).await
}

fn slow_to_start_entry(starts: &Arc<AtomicUsize>) -> WorkerEntry {
    let starts = Arc::clone(starts);
    WorkerEntry::new(move |ctx| {
        let start = starts.fetch_add(1, Ordering::SeqCst);
        slow_to_start_worker(ctx, start)
    })
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_check_workers_retries_the_floor() {
    let starts = Arc::new(AtomicUsize::new(0));
    let proxy = Proxy::start(ProxyConfig::new(slow_to_start_entry(&starts)).min_workers(1)).unwrap();
    proxy.ready().await;
    assert_eq!(proxy.worker_count(), 0);

    assert_eq!(proxy.check_workers().await, 0);
    let workers = proxy.workers();
    assert_eq!(workers.len(), 1, "{workers:?}");
    assert!(workers[0].backend_address.is_some());
    assert_eq!(starts.load(Ordering::SeqCst), MAX_FLOOR_SPAWN_FAILURES + 1);

    drop(connected_client(proxy.local_addr()).await);
    proxy.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_periodic_check_retries_the_floor() {
    let starts = Arc::new(AtomicUsize::new(0));
    let config = ProxyConfig::new(slow_to_start_entry(&starts))
        .min_workers(1)
        .workers_checking_interval(Duration::from_millis(50));
    let proxy = Proxy::start(config).unwrap();
    proxy.ready().await;

    let recovered = wait_until(|| {
        let workers = proxy.workers();
        workers.len() == 1 && workers[0].backend_address.is_some()
    })
    .await;
    assert!(recovered, "workers: {:?}", proxy.workers());
    assert_eq!(starts.load(Ordering::SeqCst), MAX_FLOOR_SPAWN_FAILURES + 1);
    proxy.shutdown().await;
}

/// Reads the first five bytes, then drains to the end and keeps the socket open.
async fn lingering_worker(ctx: WorkerContext, seen: Arc<AtomicBool>) -> anyhow::Result<()> {
    let service = ServiceAgent::new(ctx);
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    service
        .serve(listener, move |stream| linger_after_end(stream, Arc::clone(&seen)))
        .await
}

async fn linger_after_end(mut stream: SocketStream, seen: Arc<AtomicBool>) {
    let mut first = [0u8; 5];
    if stream.read_exact(&mut first).await.is_err() {
        return;
    }
    seen.store(true, Ordering::SeqCst);
    let mut rest = Vec::new();
    let _ = stream.read_to_end(&mut rest).await;
    tokio::time::sleep(Duration::from_secs(30)).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_client_close_releases_a_lingering_backend() {
    let seen = Arc::new(AtomicBool::new(false));
    let entry = {
        let seen = Arc::clone(&seen);
        WorkerEntry::new(move |ctx| lingering_worker(ctx, Arc::clone(&seen)))
    };
    let config = ProxyConfig::new(entry)
        .min_workers(1)
        .half_close_linger(Duration::from_millis(200));
    let proxy = Proxy::start(config).unwrap();
    proxy.ready().await;

    let mut client = TcpStream::connect(proxy.local_addr()).await.unwrap();
    client.write_all(b"hello").await.unwrap();
    assert!(wait_until(|| seen.load(Ordering::SeqCst)).await);
    assert_eq!(proxy.connection_distribution(), vec![1]);

    drop(client);
    assert!(
        wait_until(|| proxy.connection_distribution() == vec![0]).await,
        "distribution: {:?}",
        proxy.connection_distribution()
    );
    proxy.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_pool_stays_sorted_under_concurrent_admissions() {
    let proxy = Proxy::start(ProxyConfig::new(echo_entry()).max_workers(3)).unwrap();
    proxy.ready().await;
    let addr = proxy.local_addr();

    let mut clients = JoinSet::new();
    for i in 0..24u64 {
        clients.spawn(async move {
            let client = connected_client(addr).await;
            tokio::time::sleep(Duration::from_millis(10 * (i % 5))).await;
            drop(client);
        });
    }

    while !clients.is_empty() {
        let distribution = proxy.connection_distribution();
        assert!(distribution.is_sorted(), "unsorted pool: {distribution:?}");
        assert!(distribution.len() <= 3, "pool above cap: {distribution:?}");
        tokio::select! {
            Some(joined) = clients.join_next() => joined.unwrap(),
            _ = tokio::time::sleep(Duration::from_millis(1)) => {}
        }
    }

    let settled = wait_until(|| proxy.connection_distribution().iter().all(|&n| n == 0)).await;
    assert!(settled, "distribution: {:?}", proxy.connection_distribution());
    assert!(proxy.connection_distribution().is_sorted());
    proxy.shutdown().await;
}

/// Pool maintenance driven by the scheduler, and pipes flowing pool -> tunnel
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tapline_core::connection_pool::{ConnectionPool, PoolConfig};
use tapline_core::pipe::{ClientPipe, ReceiveTimeouts, ServerPipe};
use tapline_core::scheduler::Scheduler;
use tapline_core::tunnel::{TunnelMode, TunnelOptions, TunnelRelay};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

async fn create_test_connection() -> (TcpStream, TcpStream) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (client, server) = tokio::join!(TcpStream::connect(addr), listener.accept());
    (client.unwrap(), server.unwrap().0)
}

fn fast_scheduler() -> Scheduler {
    Scheduler::new(&tapline_config::Scheduler {
        periodic_tick_ms: 10,
        debounce_tick_ms: 5,
    })
}

#[tokio::test]
async fn test_registered_scavenger_evicts_aged_pipes() {
    let scheduler = fast_scheduler();
    let pool = Arc::new(ConnectionPool::new(PoolConfig {
        pooled_lifetime: Duration::from_millis(50),
        scavenge_interval: Duration::from_millis(20),
        ..Default::default()
    }));
    pool.register_scavenger(&scheduler);

    let (local, mut peer) = create_test_connection().await;
    assert!(pool.pool_or_close_pipe(ServerPipe::new(local, "http:aged.test:80")));
    assert_eq!(pool.stats().total_pipes, 1);

    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(pool.stats().total_pipes, 0);
    assert_eq!(pool.stats().keys, 0);

    // Evicted pipes are closed
    let mut buf = [0u8; 1];
    assert_eq!(peer.read(&mut buf).await.unwrap(), 0);
    scheduler.shutdown();
}

#[tokio::test]
async fn test_scavenger_does_not_outlive_pool() {
    let scheduler = fast_scheduler();
    let pool = Arc::new(ConnectionPool::new(PoolConfig {
        scavenge_interval: Duration::from_millis(10),
        ..Default::default()
    }));
    pool.register_scavenger(&scheduler);
    drop(pool);

    // The registered task holds only a weak reference and keeps ticking harmlessly
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(scheduler.periodic().len(), 1);
}

#[tokio::test]
async fn test_debounced_pool_clear() {
    let scheduler = fast_scheduler();
    let pool = Arc::new(ConnectionPool::new(PoolConfig::default()));
    let clears = Arc::new(AtomicUsize::new(0));

    for _ in 0..3 {
        let (local, _peer) = create_test_connection().await;
        pool.pool_or_close_pipe(ServerPipe::new(local, "http:burst.test:80"));
    }

    // A burst of clear requests collapses into one
    for _ in 0..5 {
        let pool = pool.clone();
        let clears = clears.clone();
        scheduler.schedule_work("pool-clear", Duration::from_millis(20), move || {
            clears.fetch_add(1, Ordering::SeqCst);
            pool.clear();
        });
    }

    tokio::time::sleep(Duration::from_millis(150)).await;
    assert_eq!(clears.load(Ordering::SeqCst), 1);
    assert_eq!(pool.stats().total_pipes, 0);
}

#[tokio::test]
async fn test_pooled_pipe_reused_for_tunnel() {
    let pool = ConnectionPool::new(PoolConfig::default());
    let key = "https:reuse.test:443";

    let (upstream, mut origin) = create_test_connection().await;
    let mut server = ServerPipe::new(upstream, key);
    server.mark_used();
    let server_id = server.id();
    assert!(pool.pool_or_close_pipe(server));

    let mut reused = pool.take_pipe(key, 0).expect("pooled pipe");
    assert_eq!(reused.id(), server_id);
    reused.mark_used();
    assert_eq!(reused.use_count(), 2);
    reused.marry_to_client_pipe();

    let (mut browser, accepted) = create_test_connection().await;
    let client = ClientPipe::new(accepted, ReceiveTimeouts::default());
    let relay = TunnelRelay::start(
        client,
        reused,
        TunnelMode::Streaming,
        TunnelOptions::default(),
        None,
    )
    .unwrap();

    browser.write_all(b"through").await.unwrap();
    let mut buf = [0u8; 7];
    origin.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"through");

    drop(browser);
    let stats = relay.wait().await;
    assert_eq!(stats.egress_bytes, 7);
}

//! Transport core of an intercepting HTTP(S) proxy
//!
//! Connection pipes, server-connection pooling, chunked-body decoding, blind
//! tunnels and background scheduling, plus a CONNECT front end tying them
//! together.

pub mod buffer;
pub mod chunked;
pub mod connection_pool;
pub mod pipe;
pub mod process;
pub mod proxy;
pub mod scheduler;
pub mod tls;
pub mod tunnel;

pub use buffer::{BufferError, GrowableReadBuffer};
pub use chunked::{ChunkDecoder, ChunkError, ChunkState};
pub use connection_pool::{ConnectionPool, PoolConfig, PoolStats};
pub use pipe::{ClientPipe, ConnectionPipe, PipeRole, ReceiveTimeouts, ReusePolicy, ServerPipe};
pub use process::{ProcessInfo, ProcessLookup};
pub use proxy::{ProxyError, ProxyHandler};
pub use scheduler::Scheduler;
pub use tls::{CertificateProvider, HandshakeError, TlsOptions};
pub use tunnel::{TunnelHandle, TunnelMode, TunnelOptions, TunnelRelay, TunnelStats};

use futures::StreamExt;
use futures::stream::FuturesUnordered;
use prometheus::Registry;
use std::net::SocketAddr;
use std::sync::Arc;
use tapline_config::Config;
use tokio::net::TcpListener;
use tokio::signal;
use tracing::{error, info};

pub async fn run_proxy(
    config: Config,
    registry: Option<Registry>,
) -> Result<(), Box<dyn std::error::Error>> {
    let config = Arc::new(config);

    let scheduler = Scheduler::new(&config.scheduler_or_default());
    let pool_config = PoolConfig::from(&config.pool_or_default());
    let pool = Arc::new(match registry.as_ref() {
        Some(reg) => ConnectionPool::with_metrics(pool_config, reg)?,
        None => ConnectionPool::new(pool_config),
    });
    pool.register_scavenger(&scheduler);

    let handler = ProxyHandler::new(config.clone(), pool.clone(), registry.as_ref())?
        .with_process_lookup(process::platform_lookup());

    let mut listeners: Vec<TcpListener> = Vec::new();
    for addr_str in &config.listen_addrs {
        let addr: SocketAddr = addr_str.parse()?;
        info!("Starting listener on {}", addr);
        listeners.push(TcpListener::bind(addr).await?);
    }

    info!("Proxy started, waiting for connections...");

    loop {
        let mut accepts = FuturesUnordered::new();
        for listener in &listeners {
            accepts.push(listener.accept());
        }

        tokio::select! {
            _ = signal::ctrl_c() => {
                info!("Received shutdown signal");
                break;
            }
            Some(result) = accepts.next() => {
                match result {
                    Ok((socket, addr)) => {
                        let handler = handler.clone();
                        tokio::spawn(async move {
                            handler.handle_connection(socket, addr).await;
                        });
                    }
                    Err(e) => {
                        error!("Accept error: {}", e);
                    }
                }
            }
        }
    }

    info!("Shutting down proxy");
    scheduler.shutdown();
    pool.clear();
    Ok(())
}

//! CONNECT front end
//!
//! Reads one request head per client. `CONNECT host:port` is answered with a
//! synthesized `200 Connection Established` and blind-tunnelled to the target;
//! every other method gets `501 Not Implemented`.

use crate::buffer::GrowableReadBuffer;
use crate::connection_pool::ConnectionPool;
use crate::pipe::{ClientPipe, ReceiveTimeouts, ServerPipe};
use crate::process::{NoProcessLookup, ProcessLookup};
use crate::tunnel::{TunnelMetrics, TunnelMode, TunnelOptions, TunnelRelay, TunnelStats};
use prometheus::{IntCounterVec, IntGauge, Opts, Registry};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tapline_config::Config;
use thiserror::Error;
use tokio::io;
use tokio::net::TcpStream;
use tracing::{debug, error, info, warn};

/// Largest request head accepted from a client
pub const MAX_HEAD_SIZE: usize = 32 * 1024;
const READ_CHUNK_SIZE: usize = 4096;

pub const CONNECT_ESTABLISHED: &[u8] =
    b"HTTP/1.1 200 Connection Established\r\nProxy-Agent: tapline\r\n\r\n";
const BAD_REQUEST: &[u8] =
    b"HTTP/1.1 400 Bad Request\r\nContent-Length: 0\r\nConnection: close\r\n\r\n";
const NOT_IMPLEMENTED: &[u8] =
    b"HTTP/1.1 501 Not Implemented\r\nContent-Length: 0\r\nConnection: close\r\n\r\n";
const BAD_GATEWAY: &[u8] =
    b"HTTP/1.1 502 Bad Gateway\r\nContent-Length: 0\r\nConnection: close\r\n\r\n";

#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
    #[error("client closed before sending a request")]
    ClientClosed,
    #[error("request head exceeds {0} bytes")]
    HeadTooLarge(usize),
    #[error("malformed request line")]
    MalformedRequest,
    #[error("unsupported method {0}")]
    UnsupportedMethod(String),
    #[error("invalid CONNECT target {0}")]
    InvalidTarget(String),
    #[error("failed to connect to {target}: {source}")]
    Upstream {
        target: String,
        #[source]
        source: io::Error,
    },
}

impl ProxyError {
    /// Errors caused by the peer rather than by the proxy
    fn is_client_error(&self) -> bool {
        match self {
            ProxyError::Io(e) => matches!(
                e.kind(),
                io::ErrorKind::TimedOut
                    | io::ErrorKind::ConnectionReset
                    | io::ErrorKind::BrokenPipe
                    | io::ErrorKind::UnexpectedEof
            ),
            ProxyError::Upstream { .. } => false,
            _ => true,
        }
    }
}

/// Target of a CONNECT request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectTarget {
    pub host: String,
    pub port: u16,
}

impl ConnectTarget {
    /// `host:port`, bracketing IPv6 literals
    pub fn authority(&self) -> String {
        if self.host.contains(':') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }

    pub fn pool_key(&self) -> String {
        format!("https:{}", self.authority())
    }
}

/// Returns the offset just past the blank line ending a request head
pub fn find_head_end(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n").map(|i| i + 4)
}

/// Splits the request line into method and target
pub fn parse_request_line(head: &[u8]) -> Result<(&str, &str), ProxyError> {
    let line_end = head
        .windows(2)
        .position(|w| w == b"\r\n")
        .ok_or(ProxyError::MalformedRequest)?;
    let line = std::str::from_utf8(&head[..line_end]).map_err(|_| ProxyError::MalformedRequest)?;

    let mut parts = line.split(' ').filter(|p| !p.is_empty());
    match (parts.next(), parts.next(), parts.next(), parts.next()) {
        (Some(method), Some(target), Some(version), None) if version.starts_with("HTTP/1.") => {
            Ok((method, target))
        }
        _ => Err(ProxyError::MalformedRequest),
    }
}

/// Parses `host:port` or `[v6]:port`
pub fn parse_connect_target(target: &str) -> Result<ConnectTarget, ProxyError> {
    let invalid = || ProxyError::InvalidTarget(target.to_string());

    let (host, port) = if let Some(rest) = target.strip_prefix('[') {
        let (host, port) = rest.split_once("]:").ok_or_else(invalid)?;
        (host, port)
    } else {
        let (host, port) = target.rsplit_once(':').ok_or_else(invalid)?;
        if host.contains(':') {
            return Err(invalid());
        }
        (host, port)
    };

    let port: u16 = port.parse().map_err(|_| invalid())?;
    if host.is_empty() || port == 0 {
        return Err(invalid());
    }

    Ok(ConnectTarget {
        host: host.to_ascii_lowercase(),
        port,
    })
}

struct ProxyMetrics {
    connections_total: IntCounterVec,
    connections_active: IntGauge,
}

impl ProxyMetrics {
    fn new(registry: &Registry) -> Result<Self, prometheus::Error> {
        let connections_total = IntCounterVec::new(
            Opts::new(
                "tapline_connections_total",
                "Total number of client connections handled",
            ),
            &["status"],
        )?;
        let connections_active = IntGauge::new(
            "tapline_connections_active",
            "Number of currently active client connections",
        )?;

        registry.register(Box::new(connections_total.clone()))?;
        registry.register(Box::new(connections_active.clone()))?;

        Ok(Self {
            connections_total,
            connections_active,
        })
    }
}

/// Per-connection handler shared by all accept loops
#[derive(Clone)]
pub struct ProxyHandler {
    config: Arc<Config>,
    pool: Arc<ConnectionPool>,
    process_lookup: Arc<dyn ProcessLookup>,
    metrics: Option<Arc<ProxyMetrics>>,
    tunnel_metrics: Option<Arc<TunnelMetrics>>,
}

impl ProxyHandler {
    pub fn new(
        config: Arc<Config>,
        pool: Arc<ConnectionPool>,
        registry: Option<&Registry>,
    ) -> Result<Self, prometheus::Error> {
        let (metrics, tunnel_metrics) = match registry {
            Some(r) => (
                Some(Arc::new(ProxyMetrics::new(r)?)),
                Some(Arc::new(TunnelMetrics::new(r)?)),
            ),
            None => (None, None),
        };

        Ok(Self {
            config,
            pool,
            process_lookup: Arc::new(NoProcessLookup),
            metrics,
            tunnel_metrics,
        })
    }

    /// Uses `lookup` to attribute clients to local processes
    pub fn with_process_lookup(mut self, lookup: Arc<dyn ProcessLookup>) -> Self {
        self.process_lookup = lookup;
        self
    }

    pub async fn handle_connection(&self, stream: TcpStream, client_addr: SocketAddr) {
        let peer = client_addr.to_string();
        let start_time = std::time::Instant::now();

        if let Some(ref metrics) = self.metrics {
            metrics.connections_active.inc();
        }

        debug!(peer, "New connection");

        let client = ClientPipe::new(stream, ReceiveTimeouts::from(&self.config.timeouts));
        let result = self.process_connection(client).await;
        let duration = start_time.elapsed().as_secs_f64();

        if let Some(ref metrics) = self.metrics {
            metrics.connections_active.dec();
            let status = if result.is_ok() { "success" } else { "failure" };
            metrics.connections_total.with_label_values(&[status]).inc();
        }

        match result {
            Ok(stats) => info!(
                peer,
                ingress = stats.ingress_bytes,
                egress = stats.egress_bytes,
                duration_secs = %duration,
                "Connection completed"
            ),
            Err(e) if e.is_client_error() => {
                debug!(peer, error = %e, duration_secs = %duration, "Client request rejected")
            }
            Err(e @ ProxyError::Upstream { .. }) => {
                warn!(peer, error = %e, duration_secs = %duration, "Upstream unreachable")
            }
            Err(e) => error!(peer, error = %e, duration_secs = %duration, "Connection error"),
        }
    }

    async fn process_connection(&self, mut client: ClientPipe) -> Result<TunnelStats, ProxyError> {
        let attribute_remote = self
            .config
            .process
            .as_ref()
            .is_some_and(|p| p.attribute_remote_clients);
        if let Some(process) = client
            .attribute_process(self.process_lookup.clone(), attribute_remote)
            .await
            .cloned()
        {
            debug!(pipe = client.id(), process = %process, "Client attributed");
        }

        let head = read_head(&mut client).await?;
        let (method, target) = match parse_request_line(&head) {
            Ok(parts) => parts,
            Err(e) => {
                reject(&mut client, BAD_REQUEST).await;
                return Err(e);
            }
        };

        if !method.eq_ignore_ascii_case("CONNECT") {
            let method = method.to_string();
            reject(&mut client, NOT_IMPLEMENTED).await;
            return Err(ProxyError::UnsupportedMethod(method));
        }

        let target = match parse_connect_target(target) {
            Ok(target) => target,
            Err(e) => {
                reject(&mut client, BAD_REQUEST).await;
                return Err(e);
            }
        };
        client.mark_used();

        // Idle pipes are pooled by the keep-alive exchange layer; a tunnel consumes its pipe
        let pid = client.process().map_or(0, |p| p.pid);
        let mut server = match self.pool.take_pipe(&target.pool_key(), pid) {
            Some(server) => server,
            None => {
                let connect_timeout = Duration::from_secs(self.config.timeouts.connect);
                match ServerPipe::connect(&target.authority(), target.pool_key(), connect_timeout)
                    .await
                {
                    Ok(server) => server,
                    Err(source) => {
                        reject(&mut client, BAD_GATEWAY).await;
                        return Err(ProxyError::Upstream {
                            target: target.authority(),
                            source,
                        });
                    }
                }
            }
        };
        server.mark_used();
        // A blind tunnel consumes the connection
        server.marry_to_client_pipe();

        info!(
            client = client.id(),
            server = server.id(),
            target = %target.authority(),
            "Opening CONNECT tunnel"
        );

        let relay = TunnelRelay::start(
            client,
            server,
            TunnelMode::Blocked,
            TunnelOptions::from(&self.config.timeouts),
            self.tunnel_metrics.clone(),
        )?;
        relay
            .handle()
            .begin_response_streaming(Some(CONNECT_ESTABLISHED.to_vec()));
        Ok(relay.wait().await)
    }
}

/// Reads up to the end of the request head, putting back anything after it
async fn read_head(client: &mut ClientPipe) -> Result<Vec<u8>, ProxyError> {
    let mut head = GrowableReadBuffer::with_limit(MAX_HEAD_SIZE);
    let mut chunk = [0u8; READ_CHUNK_SIZE];

    loop {
        let n = client.receive(&mut chunk).await?;
        if n == 0 {
            client.end();
            return Err(if head.is_empty() {
                ProxyError::ClientClosed
            } else {
                ProxyError::MalformedRequest
            });
        }
        if head.write(&chunk[..n]).is_err() {
            reject(client, BAD_REQUEST).await;
            return Err(ProxyError::HeadTooLarge(MAX_HEAD_SIZE));
        }

        if let Some(end) = find_head_end(head.as_slice()) {
            let pipelined = head.split_off_tail(end);
            client.put_back(&pipelined);
            return Ok(head.into_vec());
        }
    }
}

async fn reject(client: &mut ClientPipe, response: &[u8]) {
    if let Err(e) = client.send(response).await {
        debug!(pipe = client.id(), error = %e, "Failed to send error response");
    }
    client.end();
}

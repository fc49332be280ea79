//! Blind tunnel between a client pipe and a server pipe
//!
//! Each direction runs as its own tokio task reading and forwarding
//! sequentially. The first direction to see end of stream, an error, or an idle
//! timeout closes the tunnel; the other pump is cancelled at its next await
//! point. The owner parks in [`TunnelRelay::wait`] until then and closes both
//! pipes.

use crate::pipe::{ClientPipe, ConnectionPipe, PipeStream, ServerPipe};
use parking_lot::Mutex;
use prometheus::{Histogram, HistogramOpts, IntCounter, IntCounterVec, IntGauge, Opts, Registry};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tokio::io::{self, AsyncReadExt, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, info, warn};

const COPY_BUFFER_SIZE: usize = 16 * 1024;

/// When remote-to-client pumping starts
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TunnelMode {
    /// Both directions pump immediately (upgraded connections)
    Streaming,
    /// Remote-to-client waits for [`TunnelHandle::begin_response_streaming`],
    /// so the proxy can answer a CONNECT first
    Blocked,
}

/// Per-tunnel settings
#[derive(Debug, Clone, Default)]
pub struct TunnelOptions {
    /// Close after this long without data in one direction
    pub idle_timeout: Option<Duration>,
}

impl From<&tapline_config::Timeouts> for TunnelOptions {
    fn from(timeouts: &tapline_config::Timeouts) -> Self {
        Self {
            idle_timeout: (timeouts.tunnel_idle > 0)
                .then(|| Duration::from_secs(timeouts.tunnel_idle)),
        }
    }
}

/// Prometheus metrics shared by all tunnels
pub struct TunnelMetrics {
    bytes: IntCounterVec,
    tunnels_total: IntCounter,
    tunnels_active: IntGauge,
    duration: Histogram,
}

impl TunnelMetrics {
    pub fn new(registry: &Registry) -> Result<Self, prometheus::Error> {
        let bytes = IntCounterVec::new(
            Opts::new(
                "tapline_tunnel_bytes_total",
                "Bytes relayed through tunnels per direction",
            ),
            &["direction"],
        )?;
        let tunnels_total = IntCounter::new("tapline_tunnels_total", "Total tunnels opened")?;
        let tunnels_active =
            IntGauge::new("tapline_tunnels_active", "Number of currently open tunnels")?;
        let duration = Histogram::with_opts(
            HistogramOpts::new("tapline_tunnel_duration_seconds", "Tunnel lifetime")
                .buckets(vec![0.1, 0.5, 1.0, 5.0, 15.0, 60.0, 300.0, 1800.0]),
        )?;

        registry.register(Box::new(bytes.clone()))?;
        registry.register(Box::new(tunnels_total.clone()))?;
        registry.register(Box::new(tunnels_active.clone()))?;
        registry.register(Box::new(duration.clone()))?;

        Ok(Self {
            bytes,
            tunnels_total,
            tunnels_active,
            duration,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Direction {
    /// client to remote
    Egress,
    /// remote to client
    Ingress,
}

impl Direction {
    fn as_str(&self) -> &'static str {
        match self {
            Direction::Egress => "egress",
            Direction::Ingress => "ingress",
        }
    }
}

struct TunnelShared {
    id: u64,
    closed: AtomicBool,
    close_tx: watch::Sender<bool>,
    streaming: AtomicBool,
    streaming_tx: watch::Sender<bool>,
    preamble: Mutex<Option<Vec<u8>>>,
    ingress: AtomicU64,
    egress: AtomicU64,
    counters: Option<(IntCounter, IntCounter)>,
}

impl TunnelShared {
    fn close(&self) -> bool {
        if self.closed.swap(true, Ordering::AcqRel) {
            return false;
        }
        debug!(tunnel = self.id, "Closing tunnel");
        self.close_tx.send_replace(true);
        true
    }

    fn record(&self, direction: Direction, n: usize) {
        let (total, counter) = match direction {
            Direction::Egress => (&self.egress, self.counters.as_ref().map(|c| &c.0)),
            Direction::Ingress => (&self.ingress, self.counters.as_ref().map(|c| &c.1)),
        };
        total.fetch_add(n as u64, Ordering::Relaxed);
        if let Some(counter) = counter {
            counter.inc_by(n as u64);
        }
    }
}

/// Cloneable control handle for a running tunnel
#[derive(Clone)]
pub struct TunnelHandle {
    shared: Arc<TunnelShared>,
}

impl TunnelHandle {
    /// Closes both directions; returns true only for the call that closed it
    pub fn close_tunnel(&self) -> bool {
        self.shared.close()
    }

    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::Acquire)
    }

    /// Starts remote-to-client pumping in [`TunnelMode::Blocked`] tunnels
    ///
    /// `preamble` is written to the client first. Returns false if streaming
    /// already started.
    pub fn begin_response_streaming(&self, preamble: Option<Vec<u8>>) -> bool {
        if self.shared.streaming.swap(true, Ordering::AcqRel) {
            return false;
        }
        *self.shared.preamble.lock() = preamble;
        self.shared.streaming_tx.send_replace(true);
        true
    }

    /// Bytes relayed from remote to client
    pub fn ingress_bytes(&self) -> u64 {
        self.shared.ingress.load(Ordering::Relaxed)
    }

    /// Bytes relayed from client to remote
    pub fn egress_bytes(&self) -> u64 {
        self.shared.egress.load(Ordering::Relaxed)
    }
}

/// Totals reported when a tunnel finishes
#[derive(Debug, Clone, Copy)]
pub struct TunnelStats {
    pub ingress_bytes: u64,
    pub egress_bytes: u64,
    pub duration: Duration,
}

type PumpHalves = (ReadHalf<PipeStream>, WriteHalf<PipeStream>);

/// Owner of a running tunnel and its two pipes
pub struct TunnelRelay {
    handle: TunnelHandle,
    client: ConnectionPipe,
    remote: ConnectionPipe,
    egress_pump: Option<JoinHandle<PumpHalves>>,
    ingress_pump: Option<JoinHandle<PumpHalves>>,
    started: Instant,
    metrics: Option<Arc<TunnelMetrics>>,
}

impl TunnelRelay {
    /// Starts pumping between `client` and `remote`
    ///
    /// Bytes the client pipe holds in its put-back buffer are sent to the
    /// remote before anything read from the socket. Must be called within a
    /// tokio runtime.
    pub fn start(
        client: ClientPipe,
        remote: ServerPipe,
        mode: TunnelMode,
        options: TunnelOptions,
        metrics: Option<Arc<TunnelMetrics>>,
    ) -> io::Result<Self> {
        let (mut client, pending) = client.into_parts();
        let mut remote = remote.into_inner();

        let (client_stream, remote_stream) = match (client.take_stream(), remote.take_stream()) {
            (Some(c), Some(r)) => (c, r),
            (c, r) => {
                // Put back whichever side was still open so it closes with its pipe
                if let Some(c) = c {
                    client.restore_stream(c);
                }
                if let Some(r) = r {
                    remote.restore_stream(r);
                }
                client.end();
                remote.end();
                return Err(io::Error::new(
                    io::ErrorKind::NotConnected,
                    "tunnel endpoint already closed",
                ));
            }
        };

        let (close_tx, _) = watch::channel(false);
        let (streaming_tx, _) = watch::channel(mode == TunnelMode::Streaming);
        let counters = metrics.as_ref().map(|m| {
            (
                m.bytes.with_label_values(&[Direction::Egress.as_str()]),
                m.bytes.with_label_values(&[Direction::Ingress.as_str()]),
            )
        });
        let shared = Arc::new(TunnelShared {
            id: client.id(),
            closed: AtomicBool::new(false),
            close_tx,
            streaming: AtomicBool::new(mode == TunnelMode::Streaming),
            streaming_tx,
            preamble: Mutex::new(None),
            ingress: AtomicU64::new(0),
            egress: AtomicU64::new(0),
            counters,
        });

        let (client_read, client_write) = io::split(client_stream);
        let (remote_read, remote_write) = io::split(remote_stream);

        let egress_pump = tokio::spawn(pump(
            client_read,
            remote_write,
            Direction::Egress,
            pending,
            shared.clone(),
            options.idle_timeout,
        ));
        let ingress_pump = tokio::spawn(pump(
            remote_read,
            client_write,
            Direction::Ingress,
            Vec::new(),
            shared.clone(),
            options.idle_timeout,
        ));

        if let Some(ref m) = metrics {
            m.tunnels_total.inc();
            m.tunnels_active.inc();
        }
        debug!(
            tunnel = shared.id,
            client = client.id(),
            remote = remote.id(),
            mode = ?mode,
            "Tunnel started"
        );

        Ok(Self {
            handle: TunnelHandle { shared },
            client,
            remote,
            egress_pump: Some(egress_pump),
            ingress_pump: Some(ingress_pump),
            started: Instant::now(),
            metrics,
        })
    }

    pub fn handle(&self) -> TunnelHandle {
        self.handle.clone()
    }

    /// Parks until the tunnel closes, then closes both pipes
    pub async fn wait(mut self) -> TunnelStats {
        let mut closed = self.handle.shared.close_tx.subscribe();
        // Only fails if the sender is dropped, and `self` holds it
        let _ = closed.wait_for(|closed| *closed).await;

        let egress = join_pump(self.egress_pump.take()).await;
        let ingress = join_pump(self.ingress_pump.take()).await;
        match (egress, ingress) {
            (Some((client_read, remote_write)), Some((remote_read, client_write))) => {
                self.client.restore_stream(client_read.unsplit(client_write));
                self.remote.restore_stream(remote_read.unsplit(remote_write));
            }
            // A lost half drops its socket with the pump task
            _ => warn!(tunnel = self.handle.shared.id, "Tunnel pump did not complete cleanly"),
        }
        self.client.end();
        self.remote.end();

        let stats = TunnelStats {
            ingress_bytes: self.handle.ingress_bytes(),
            egress_bytes: self.handle.egress_bytes(),
            duration: self.started.elapsed(),
        };
        if let Some(ref m) = self.metrics {
            m.tunnels_active.dec();
            m.duration.observe(stats.duration.as_secs_f64());
        }
        info!(
            tunnel = self.handle.shared.id,
            ingress = stats.ingress_bytes,
            egress = stats.egress_bytes,
            duration_ms = stats.duration.as_millis() as u64,
            "Tunnel closed"
        );
        stats
    }
}

impl Drop for TunnelRelay {
    fn drop(&mut self) {
        // Dropped without wait(): pumps exit and their halves close the sockets
        if self.egress_pump.is_some() {
            self.handle.close_tunnel();
            if let Some(ref m) = self.metrics {
                m.tunnels_active.dec();
            }
        }
    }
}

async fn join_pump(pump: Option<JoinHandle<PumpHalves>>) -> Option<PumpHalves> {
    match pump?.await {
        Ok(halves) => Some(halves),
        Err(e) => {
            warn!(error = %e, "Tunnel pump task failed");
            None
        }
    }
}

async fn pump(
    mut from: ReadHalf<PipeStream>,
    mut to: WriteHalf<PipeStream>,
    direction: Direction,
    pending: Vec<u8>,
    shared: Arc<TunnelShared>,
    idle_timeout: Option<Duration>,
) -> PumpHalves {
    let mut closed = shared.close_tx.subscribe();

    let result = tokio::select! {
        result = relay(&mut from, &mut to, direction, pending, &shared, idle_timeout) => result,
        _ = closed.wait_for(|closed| *closed) => Ok(()),
    };

    match result {
        Ok(()) => debug!(tunnel = shared.id, direction = direction.as_str(), "Tunnel direction finished"),
        Err(e) => debug!(
            tunnel = shared.id,
            direction = direction.as_str(),
            error = %e,
            "Tunnel direction failed"
        ),
    }
    shared.close();
    (from, to)
}

async fn relay(
    from: &mut ReadHalf<PipeStream>,
    to: &mut WriteHalf<PipeStream>,
    direction: Direction,
    pending: Vec<u8>,
    shared: &TunnelShared,
    idle_timeout: Option<Duration>,
) -> io::Result<()> {
    if direction == Direction::Ingress {
        let mut streaming = shared.streaming_tx.subscribe();
        if streaming.wait_for(|started| *started).await.is_err() {
            return Ok(());
        }
        let preamble = shared.preamble.lock().take();
        if let Some(preamble) = preamble {
            to.write_all(&preamble).await?;
            to.flush().await?;
        }
    }

    if !pending.is_empty() {
        to.write_all(&pending).await?;
        to.flush().await?;
        shared.record(direction, pending.len());
    }

    let mut buf = vec![0u8; COPY_BUFFER_SIZE];
    loop {
        let n = match idle_timeout {
            Some(limit) => timeout(limit, from.read(&mut buf))
                .await
                .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "tunnel idle"))??,
            None => from.read(&mut buf).await?,
        };
        if n == 0 {
            return Ok(());
        }
        to.write_all(&buf[..n]).await?;
        to.flush().await?;
        shared.record(direction, n);
    }
}

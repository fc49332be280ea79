//! Byte-stream pipes to clients and servers
//!
//! A [`ConnectionPipe`] exclusively owns one socket, optionally wrapped in TLS.
//! [`ClientPipe`] adds the put-back buffer, process attribution, adaptive
//! receive timeouts and the server-role handshake. [`ServerPipe`] adds
//! connecting, the client-role handshake and reuse-policy tightening.

use crate::connection_pool::process_scoped_key;
use crate::process::{ProcessInfo, ProcessLookup};
use crate::tls::{self, CertificateProvider, HandshakeError, TlsOptions};
use futures::FutureExt;
use rustls::ClientConfig;
use rustls::pki_types::ServerName;
use rustls::sign::CertifiedKey;
use std::net::{IpAddr, SocketAddr};
use std::ops::{Deref, DerefMut};
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::task::{Context, Poll};
use std::time::Instant;
use tokio::io::{self, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf};
use tokio::net::{TcpStream, lookup_host};
use tokio::time::{Duration, timeout};
use tokio_rustls::{TlsAcceptor, TlsConnector};
use tracing::{debug, info, warn};

static NEXT_PIPE_ID: AtomicU64 = AtomicU64::new(1);

const CERTIFICATE_FAILURE_RESPONSE: &[u8] = b"HTTP/1.0 502 Unable to generate certificate\r\n\
Connection: close\r\n\
Content-Type: text/plain\r\n\
\r\n\
The proxy could not obtain a certificate for this host.\r\n";

/// Which side of the proxy a pipe faces
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipeRole {
    Client,
    Server,
}

impl PipeRole {
    #[inline]
    pub fn as_str(&self) -> &'static str {
        match self {
            PipeRole::Client => "client",
            PipeRole::Server => "server",
        }
    }
}

/// Restriction on returning a pipe to the pool, least to most restrictive
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub enum ReusePolicy {
    #[default]
    NoRestrictions,
    MarriedToClientProcess,
    MarriedToClientPipe,
    NoReuse,
}

impl ReusePolicy {
    /// Returns whether a pipe with this policy may be pooled at all
    #[inline]
    pub fn allows_pooling(&self) -> bool {
        matches!(
            self,
            ReusePolicy::NoRestrictions | ReusePolicy::MarriedToClientProcess
        )
    }
}

/// Transport under a pipe
pub(crate) enum PipeStream {
    Plain(TcpStream),
    ServerTls(Box<tokio_rustls::server::TlsStream<TcpStream>>),
    ClientTls(Box<tokio_rustls::client::TlsStream<TcpStream>>),
}

impl PipeStream {
    fn tcp(&self) -> &TcpStream {
        match self {
            PipeStream::Plain(s) => s,
            PipeStream::ServerTls(s) => s.get_ref().0,
            PipeStream::ClientTls(s) => s.get_ref().0,
        }
    }

    fn is_secure(&self) -> bool {
        !matches!(self, PipeStream::Plain(_))
    }
}

impl AsyncRead for PipeStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            PipeStream::Plain(s) => Pin::new(s).poll_read(cx, buf),
            PipeStream::ServerTls(s) => Pin::new(s.as_mut()).poll_read(cx, buf),
            PipeStream::ClientTls(s) => Pin::new(s.as_mut()).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for PipeStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            PipeStream::Plain(s) => Pin::new(s).poll_write(cx, buf),
            PipeStream::ServerTls(s) => Pin::new(s.as_mut()).poll_write(cx, buf),
            PipeStream::ClientTls(s) => Pin::new(s.as_mut()).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            PipeStream::Plain(s) => Pin::new(s).poll_flush(cx),
            PipeStream::ServerTls(s) => Pin::new(s.as_mut()).poll_flush(cx),
            PipeStream::ClientTls(s) => Pin::new(s.as_mut()).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            PipeStream::Plain(s) => Pin::new(s).poll_shutdown(cx),
            PipeStream::ServerTls(s) => Pin::new(s.as_mut()).poll_shutdown(cx),
            PipeStream::ClientTls(s) => Pin::new(s.as_mut()).poll_shutdown(cx),
        }
    }
}

fn not_connected() -> io::Error {
    io::Error::new(io::ErrorKind::NotConnected, "pipe is closed")
}

/// Bidirectional byte stream over one socket
pub struct ConnectionPipe {
    id: u64,
    role: PipeRole,
    stream: Option<PipeStream>,
    local_addr: Option<SocketAddr>,
    remote_addr: Option<SocketAddr>,
    use_count: u32,
    created_at: Instant,
    last_pooled: Option<Instant>,
    pool_key: String,
    reuse_policy: ReusePolicy,
}

impl std::fmt::Debug for ConnectionPipe {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionPipe")
            .field("id", &self.id)
            .field("role", &self.role)
            .field("open", &self.stream.is_some())
            .field("remote_addr", &self.remote_addr)
            .field("pool_key", &self.pool_key)
            .field("reuse_policy", &self.reuse_policy)
            .finish()
    }
}

impl ConnectionPipe {
    pub fn new(role: PipeRole, stream: TcpStream) -> Self {
        let local_addr = stream.local_addr().ok();
        let remote_addr = stream.peer_addr().ok();
        Self {
            id: NEXT_PIPE_ID.fetch_add(1, Ordering::Relaxed),
            role,
            stream: Some(PipeStream::Plain(stream)),
            local_addr,
            remote_addr,
            use_count: 0,
            created_at: Instant::now(),
            last_pooled: None,
            pool_key: String::new(),
            reuse_policy: ReusePolicy::default(),
        }
    }

    #[inline]
    pub fn id(&self) -> u64 {
        self.id
    }

    #[inline]
    pub fn role(&self) -> PipeRole {
        self.role
    }

    #[inline]
    pub fn is_connected(&self) -> bool {
        self.stream.is_some()
    }

    pub fn is_secure(&self) -> bool {
        self.stream.as_ref().is_some_and(PipeStream::is_secure)
    }

    pub fn local_port(&self) -> Option<u16> {
        self.local_addr.map(|a| a.port())
    }

    pub fn remote_addr(&self) -> Option<SocketAddr> {
        self.remote_addr
    }

    #[inline]
    pub fn use_count(&self) -> u32 {
        self.use_count
    }

    /// Counts one more exchange carried by this pipe
    pub fn mark_used(&mut self) {
        self.use_count = self.use_count.saturating_add(1);
    }

    #[inline]
    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    #[inline]
    pub fn last_pooled(&self) -> Option<Instant> {
        self.last_pooled
    }

    pub(crate) fn stamp_pooled(&mut self, at: Instant) {
        self.last_pooled = Some(at);
    }

    #[inline]
    pub fn pool_key(&self) -> &str {
        &self.pool_key
    }

    pub fn set_pool_key(&mut self, key: impl Into<String>) {
        self.pool_key = key.into();
    }

    #[inline]
    pub fn reuse_policy(&self) -> ReusePolicy {
        self.reuse_policy
    }

    /// Raises the reuse policy; a looser policy than the current one is ignored
    pub fn tighten_reuse_policy(&mut self, policy: ReusePolicy) {
        self.reuse_policy = self.reuse_policy.max(policy);
    }

    /// Reads into `buf`; `Ok(0)` means the peer closed in an orderly way
    pub async fn receive(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let stream = self.stream.as_mut().ok_or_else(not_connected)?;
        stream.read(buf).await
    }

    /// Writes all of `bytes` and flushes
    pub async fn send(&mut self, bytes: &[u8]) -> io::Result<()> {
        let stream = self.stream.as_mut().ok_or_else(not_connected)?;
        stream.write_all(bytes).await?;
        stream.flush().await
    }

    /// Non-blocking probe for readable data
    ///
    /// Probe failures count as "available" so the next `receive` reports the
    /// real error. A peer close also counts, since the next read returns 0.
    pub fn has_data_available(&self) -> bool {
        let Some(stream) = self.stream.as_ref() else {
            return true;
        };
        let mut probe = [0u8; 1];
        match stream.tcp().peek(&mut probe).now_or_never() {
            Some(Ok(_)) | Some(Err(_)) => true,
            None => false,
        }
    }

    /// Half-closes gracefully (TLS close_notify, TCP FIN), then closes
    pub async fn shutdown(&mut self) {
        if let Some(stream) = self.stream.as_mut()
            && let Err(e) = stream.shutdown().await
        {
            debug!(pipe = self.id, error = %e, "Pipe shutdown failed");
        }
        self.end();
    }

    /// Closes the pipe; calling it again does nothing
    pub fn end(&mut self) {
        if let Some(stream) = self.stream.take() {
            debug!(
                pipe = self.id,
                role = self.role.as_str(),
                uses = self.use_count,
                "Closing pipe"
            );
            drop(stream);
        }
    }

    pub(crate) fn take_stream(&mut self) -> Option<PipeStream> {
        self.stream.take()
    }

    pub(crate) fn restore_stream(&mut self, stream: PipeStream) {
        self.stream = Some(stream);
    }

    fn take_plain(&mut self) -> Result<TcpStream, HandshakeError> {
        match self.stream.take() {
            Some(PipeStream::Plain(tcp)) => Ok(tcp),
            Some(other) => {
                self.stream = Some(other);
                Err(HandshakeError::NotPlain)
            }
            None => Err(HandshakeError::NotPlain),
        }
    }
}

/// Receive timeouts of a client pipe
#[derive(Debug, Clone, Copy)]
pub struct ReceiveTimeouts {
    /// Wait for the first byte of a new exchange
    pub first_byte: Duration,
    /// Wait between reads once an exchange is underway
    pub mid_read: Duration,
}

impl Default for ReceiveTimeouts {
    fn default() -> Self {
        Self {
            first_byte: Duration::from_secs(60),
            mid_read: Duration::from_secs(15),
        }
    }
}

impl From<&tapline_config::Timeouts> for ReceiveTimeouts {
    fn from(t: &tapline_config::Timeouts) -> Self {
        Self {
            first_byte: Duration::from_secs(t.first_byte),
            mid_read: Duration::from_secs(t.mid_read),
        }
    }
}

fn is_loopback(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => v4.is_loopback(),
        IpAddr::V6(v6) => v6
            .to_ipv4_mapped()
            .map_or(v6.is_loopback(), |v4| v4.is_loopback()),
    }
}

/// Pipe facing a client of the proxy
pub struct ClientPipe {
    pipe: ConnectionPipe,
    put_back: Vec<u8>,
    process: Option<ProcessInfo>,
    timeouts: ReceiveTimeouts,
    awaiting_first_byte: bool,
}

impl ClientPipe {
    pub fn new(stream: TcpStream, timeouts: ReceiveTimeouts) -> Self {
        Self {
            pipe: ConnectionPipe::new(PipeRole::Client, stream),
            put_back: Vec::new(),
            process: None,
            timeouts,
            awaiting_first_byte: true,
        }
    }

    /// Stashes bytes that belong to the next exchange
    ///
    /// They are returned by the next `receive` ahead of any socket data.
    pub fn put_back(&mut self, bytes: &[u8]) {
        if bytes.is_empty() {
            return;
        }
        debug!(pipe = self.pipe.id, bytes = bytes.len(), "Stashing pipelined bytes");
        self.put_back.splice(0..0, bytes.iter().copied());
    }

    #[inline]
    pub fn has_put_back(&self) -> bool {
        !self.put_back.is_empty()
    }

    /// Re-arms the long first-byte timeout for the next exchange
    pub fn begin_new_exchange(&mut self) {
        self.awaiting_first_byte = true;
    }

    pub fn current_timeout(&self) -> Duration {
        if self.awaiting_first_byte {
            self.timeouts.first_byte
        } else {
            self.timeouts.mid_read
        }
    }

    /// Reads stashed bytes first, then the socket under the current timeout
    pub async fn receive(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if !self.put_back.is_empty() {
            let n = buf.len().min(self.put_back.len());
            buf[..n].copy_from_slice(&self.put_back[..n]);
            self.put_back.drain(..n);
            if n > 0 {
                self.awaiting_first_byte = false;
            }
            return Ok(n);
        }

        let limit = self.current_timeout();
        let n = timeout(limit, self.pipe.receive(buf))
            .await
            .map_err(|_| {
                io::Error::new(
                    io::ErrorKind::TimedOut,
                    format!("client pipe idle for {:?}", limit),
                )
            })??;
        if n > 0 {
            self.awaiting_first_byte = false;
        }
        Ok(n)
    }

    pub fn has_data_available(&self) -> bool {
        !self.put_back.is_empty() || self.pipe.has_data_available()
    }

    pub fn process(&self) -> Option<&ProcessInfo> {
        self.process.as_ref()
    }

    /// Attributes the pipe to the local process that opened it
    ///
    /// Non-loopback peers are skipped unless `attribute_remote_clients` is set;
    /// their port says nothing about local processes.
    pub async fn attribute_process(
        &mut self,
        lookup: Arc<dyn ProcessLookup>,
        attribute_remote_clients: bool,
    ) -> Option<&ProcessInfo> {
        let peer = self.pipe.remote_addr?;
        if !is_loopback(peer.ip()) && !attribute_remote_clients {
            return None;
        }

        let port = peer.port();
        match tokio::task::spawn_blocking(move || lookup.owning_process(port)).await {
            Ok(found) => self.process = found,
            Err(e) => warn!(pipe = self.pipe.id, error = %e, "Process lookup task failed"),
        }
        self.process.as_ref()
    }

    /// Terminates TLS from the client using a certificate for `host`
    ///
    /// When the provider has no certificate, a 502 response is written in the
    /// clear and the pipe is closed without attempting the handshake. Every
    /// failure is logged and closes the pipe.
    pub async fn secure_client_pipe(
        &mut self,
        host: &str,
        provider: &dyn CertificateProvider,
        options: &TlsOptions,
    ) -> Result<(), HandshakeError> {
        let Some(certificate) = provider.certificate_for_host(host) else {
            warn!(pipe = self.pipe.id, host, "No certificate for host, refusing handshake");
            if let Err(e) = self.pipe.send(CERTIFICATE_FAILURE_RESPONSE).await {
                debug!(pipe = self.pipe.id, error = %e, "Failed to send 502 to client");
            }
            self.pipe.end();
            return Err(HandshakeError::NoCertificate(host.to_string()));
        };

        self.secure_client_pipe_direct(host, certificate, options).await
    }

    /// Terminates TLS from the client with an already resolved certificate
    pub async fn secure_client_pipe_direct(
        &mut self,
        host: &str,
        certificate: Arc<CertifiedKey>,
        options: &TlsOptions,
    ) -> Result<(), HandshakeError> {
        let result = self.accept_tls(host, certificate, options).await;
        if let Err(e) = &result {
            warn!(pipe = self.pipe.id, host, error = %e, "Client TLS handshake failed");
            self.pipe.end();
        }
        result
    }

    async fn accept_tls(
        &mut self,
        host: &str,
        certificate: Arc<CertifiedKey>,
        options: &TlsOptions,
    ) -> Result<(), HandshakeError> {
        if self.has_put_back() {
            return Err(HandshakeError::PendingData);
        }
        let config = tls::server_config(certificate, options)?;
        let tcp = self.pipe.take_plain()?;

        let limit = self.timeouts.first_byte;
        let stream = timeout(limit, TlsAcceptor::from(config).accept(tcp))
            .await
            .map_err(|_| HandshakeError::TimedOut)??;

        let alpn = stream
            .get_ref()
            .1
            .alpn_protocol()
            .map(|p| String::from_utf8_lossy(p).into_owned());
        info!(pipe = self.pipe.id, host, alpn = ?alpn, "Secured client pipe");

        self.pipe
            .restore_stream(PipeStream::ServerTls(Box::new(stream)));
        self.awaiting_first_byte = true;
        Ok(())
    }

    /// Splits into the underlying pipe and any unread put-back bytes
    pub fn into_parts(self) -> (ConnectionPipe, Vec<u8>) {
        (self.pipe, self.put_back)
    }
}

impl Deref for ClientPipe {
    type Target = ConnectionPipe;

    fn deref(&self) -> &ConnectionPipe {
        &self.pipe
    }
}

impl DerefMut for ClientPipe {
    fn deref_mut(&mut self) -> &mut ConnectionPipe {
        &mut self.pipe
    }
}

/// Pipe facing an origin or upstream server
pub struct ServerPipe {
    pipe: ConnectionPipe,
    connected_at: Instant,
    married_pid: Option<u32>,
}

impl ServerPipe {
    /// Wraps an established connection
    pub fn new(stream: TcpStream, pool_key: impl Into<String>) -> Self {
        let mut pipe = ConnectionPipe::new(PipeRole::Server, stream);
        pipe.set_pool_key(pool_key);
        Self {
            connected_at: pipe.created_at(),
            pipe,
            married_pid: None,
        }
    }

    /// Resolves `target` (host:port) and connects within `connect_timeout`
    pub async fn connect(
        target: &str,
        pool_key: impl Into<String>,
        connect_timeout: Duration,
    ) -> io::Result<Self> {
        debug!("Resolving target address: {}", target);
        let addr = lookup_host(target)
            .await?
            .next()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "Failed to resolve target"))?;

        debug!("Connecting to target: {}", addr);
        let stream = timeout(connect_timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| {
                io::Error::new(io::ErrorKind::TimedOut, format!("connect to {} timed out", addr))
            })??;
        Ok(Self::new(stream, pool_key))
    }

    #[inline]
    pub fn connected_at(&self) -> Instant {
        self.connected_at
    }

    #[inline]
    pub fn married_pid(&self) -> Option<u32> {
        self.married_pid
    }

    /// Restricts reuse to requests from process `pid`
    ///
    /// The pool key gains the process prefix so only that process finds it.
    pub fn marry_to_client_process(&mut self, pid: u32) {
        if self.married_pid.is_none() && pid != 0 {
            let scoped = process_scoped_key(pid, self.pipe.pool_key());
            self.pipe.set_pool_key(scoped);
            self.married_pid = Some(pid);
        }
        self.pipe
            .tighten_reuse_policy(ReusePolicy::MarriedToClientProcess);
    }

    /// Restricts the pipe to the client connection it serves; it is never pooled
    pub fn marry_to_client_pipe(&mut self) {
        self.pipe
            .tighten_reuse_policy(ReusePolicy::MarriedToClientPipe);
    }

    /// Performs a client-role TLS handshake with `host` over the existing socket
    pub async fn secure_existing_connection(
        &mut self,
        host: &str,
        config: Arc<ClientConfig>,
        handshake_timeout: Duration,
    ) -> Result<(), HandshakeError> {
        let result = self.connect_tls(host, config, handshake_timeout).await;
        if let Err(e) = &result {
            warn!(pipe = self.pipe.id, host, error = %e, "Server TLS handshake failed");
            self.pipe.end();
        }
        result
    }

    async fn connect_tls(
        &mut self,
        host: &str,
        config: Arc<ClientConfig>,
        handshake_timeout: Duration,
    ) -> Result<(), HandshakeError> {
        let server_name = ServerName::try_from(host.to_string())
            .map_err(|_| HandshakeError::InvalidServerName(host.to_string()))?;
        let tcp = self.pipe.take_plain()?;

        let stream = timeout(handshake_timeout, TlsConnector::from(config).connect(server_name, tcp))
            .await
            .map_err(|_| HandshakeError::TimedOut)??;

        debug!(pipe = self.pipe.id, host, "Secured server pipe");
        self.pipe
            .restore_stream(PipeStream::ClientTls(Box::new(stream)));
        Ok(())
    }

    pub fn into_inner(self) -> ConnectionPipe {
        self.pipe
    }
}

impl Deref for ServerPipe {
    type Target = ConnectionPipe;

    fn deref(&self) -> &ConnectionPipe {
        &self.pipe
    }
}

impl DerefMut for ServerPipe {
    fn deref_mut(&mut self) -> &mut ConnectionPipe {
        &mut self.pipe
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    async fn create_test_connection() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let client_fut = TcpStream::connect(addr);
        let server_fut = listener.accept();

        let (client_result, server_result) = tokio::join!(client_fut, server_fut);

        (client_result.unwrap(), server_result.unwrap().0)
    }

    #[test]
    fn test_reuse_policy_ordering() {
        assert!(ReusePolicy::NoRestrictions < ReusePolicy::MarriedToClientProcess);
        assert!(ReusePolicy::MarriedToClientProcess < ReusePolicy::MarriedToClientPipe);
        assert!(ReusePolicy::MarriedToClientPipe < ReusePolicy::NoReuse);
        assert!(ReusePolicy::MarriedToClientProcess.allows_pooling());
        assert!(!ReusePolicy::MarriedToClientPipe.allows_pooling());
    }

    #[test]
    fn test_loopback_detection() {
        assert!(is_loopback("127.0.0.1".parse().unwrap()));
        assert!(is_loopback("::1".parse().unwrap()));
        assert!(is_loopback("::ffff:127.0.0.1".parse().unwrap()));
        assert!(!is_loopback("10.1.2.3".parse().unwrap()));
    }

    #[tokio::test]
    async fn test_send_receive_and_end() {
        let (a, b) = create_test_connection().await;
        let mut server = ServerPipe::new(a, "http:example.com:80");
        let mut peer = ConnectionPipe::new(PipeRole::Client, b);

        server.send(b"ping").await.unwrap();
        let mut buf = [0u8; 16];
        let n = peer.receive(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"ping");

        server.end();
        server.end();
        assert!(!server.is_connected());
        assert_eq!(peer.receive(&mut buf).await.unwrap(), 0);

        let err = server.send(b"late").await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::NotConnected);
    }

    #[tokio::test]
    async fn test_has_data_available() {
        let (a, b) = create_test_connection().await;
        let mut writer = ConnectionPipe::new(PipeRole::Server, a);
        let reader = ConnectionPipe::new(PipeRole::Client, b);

        assert!(!reader.has_data_available());
        writer.send(b"x").await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(reader.has_data_available());
    }

    #[tokio::test]
    async fn test_peer_close_reports_data_available() {
        let (a, b) = create_test_connection().await;
        let reader = ConnectionPipe::new(PipeRole::Server, a);
        assert!(!reader.has_data_available());

        drop(b);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(reader.has_data_available());
        assert!(reader.is_connected());
    }

    #[tokio::test]
    async fn test_closed_pipe_reports_data_available() {
        let (a, _b) = create_test_connection().await;
        let mut pipe = ConnectionPipe::new(PipeRole::Server, a);
        pipe.end();
        assert!(pipe.has_data_available());
    }

    #[tokio::test]
    async fn test_put_back_replayed_first() {
        let (a, b) = create_test_connection().await;
        let mut client = ClientPipe::new(a, ReceiveTimeouts::default());
        let mut peer = ConnectionPipe::new(PipeRole::Server, b);

        peer.send(b"socket").await.unwrap();
        client.put_back(b"GET /b");
        client.put_back(b"xx");
        assert!(client.has_data_available());

        let mut buf = [0u8; 4];
        let n = client.receive(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"xxGE");
        let n = client.receive(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"T /b");

        let mut buf = [0u8; 16];
        let n = client.receive(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"socket");
    }

    #[tokio::test]
    async fn test_adaptive_timeout() {
        let (a, b) = create_test_connection().await;
        let timeouts = ReceiveTimeouts {
            first_byte: Duration::from_secs(30),
            mid_read: Duration::from_millis(100),
        };
        let mut client = ClientPipe::new(a, timeouts);
        let mut peer = ConnectionPipe::new(PipeRole::Server, b);

        assert_eq!(client.current_timeout(), Duration::from_secs(30));
        peer.send(b"G").await.unwrap();
        let mut buf = [0u8; 8];
        client.receive(&mut buf).await.unwrap();
        assert_eq!(client.current_timeout(), Duration::from_millis(100));

        // Mid-read: nothing more arrives, short timeout fires
        let err = client.receive(&mut buf).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::TimedOut);

        client.begin_new_exchange();
        assert_eq!(client.current_timeout(), Duration::from_secs(30));
    }

    struct FixedLookup;

    impl ProcessLookup for FixedLookup {
        fn owning_process(&self, local_port: u16) -> Option<ProcessInfo> {
            Some(ProcessInfo {
                pid: local_port as u32,
                name: "browser".to_string(),
            })
        }
    }

    #[tokio::test]
    async fn test_attribute_loopback_client() {
        let (client_side, proxy_side) = create_test_connection().await;
        let client_port = client_side.local_addr().unwrap().port();
        let mut pipe = ClientPipe::new(proxy_side, ReceiveTimeouts::default());

        let info = pipe.attribute_process(Arc::new(FixedLookup), false).await.cloned();
        assert_eq!(info.unwrap().pid, client_port as u32);
        assert_eq!(pipe.process().unwrap().name, "browser");
    }

    #[tokio::test]
    async fn test_marry_to_client_process() {
        let (a, _b) = create_test_connection().await;
        let mut server = ServerPipe::new(a, "https:example.com:443");

        server.marry_to_client_process(4242);
        assert_eq!(server.pool_key(), "pid4242*https:example.com:443");
        assert_eq!(server.reuse_policy(), ReusePolicy::MarriedToClientProcess);

        // A second marriage does not double-prefix
        server.marry_to_client_process(7);
        assert_eq!(server.pool_key(), "pid4242*https:example.com:443");

        server.marry_to_client_pipe();
        assert_eq!(server.reuse_policy(), ReusePolicy::MarriedToClientPipe);

        // Policies never loosen
        server.tighten_reuse_policy(ReusePolicy::NoRestrictions);
        assert_eq!(server.reuse_policy(), ReusePolicy::MarriedToClientPipe);
    }

    #[tokio::test]
    async fn test_missing_certificate_sends_502() {
        let (a, b) = create_test_connection().await;
        let mut client = ClientPipe::new(a, ReceiveTimeouts::default());
        let mut browser = ConnectionPipe::new(PipeRole::Server, b);

        let provider = |_: &str| -> Option<Arc<CertifiedKey>> { None };
        let result = client
            .secure_client_pipe("nocert.example", &provider, &TlsOptions::default())
            .await;
        assert!(matches!(result, Err(HandshakeError::NoCertificate(_))));
        assert!(!client.is_connected());

        let mut response = Vec::new();
        let mut buf = [0u8; 256];
        loop {
            let n = browser.receive(&mut buf).await.unwrap();
            if n == 0 {
                break;
            }
            response.extend_from_slice(&buf[..n]);
        }
        assert!(response.starts_with(b"HTTP/1.0 502"));
    }
}

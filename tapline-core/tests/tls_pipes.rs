/// TLS handshakes on client and server pipes against real rustls peers
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer, ServerName};
use rustls::sign::CertifiedKey;
use rustls::{ClientConfig, RootCertStore};
use std::sync::Arc;
use std::time::Duration;
use tapline_config::TlsProtocol;
use tapline_core::pipe::{ClientPipe, ReceiveTimeouts, ServerPipe};
use tapline_core::tls::{self, HandshakeError, TlsOptions};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_rustls::{TlsAcceptor, TlsConnector};

struct TestCertificate {
    der: CertificateDer<'static>,
    key: Arc<CertifiedKey>,
}

fn self_signed(host: &str) -> TestCertificate {
    let key_pair = rcgen::KeyPair::generate().unwrap();
    let cert = rcgen::CertificateParams::new(vec![host.to_string()])
        .unwrap()
        .self_signed(&key_pair)
        .unwrap();
    let der = cert.der().clone();

    let provider = rustls::crypto::aws_lc_rs::default_provider();
    let signing_key = provider
        .key_provider
        .load_private_key(PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(
            key_pair.serialize_der(),
        )))
        .unwrap();

    TestCertificate {
        key: Arc::new(CertifiedKey::new(vec![der.clone()], signing_key)),
        der,
    }
}

fn client_config(trusted: &CertificateDer<'static>) -> Arc<ClientConfig> {
    let mut roots = RootCertStore::empty();
    roots.add(trusted.clone()).unwrap();
    let mut config = ClientConfig::builder()
        .with_root_certificates(roots)
        .with_no_client_auth();
    config.alpn_protocols = vec![b"http/1.1".to_vec()];
    Arc::new(config)
}

async fn create_test_connection() -> (TcpStream, TcpStream) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (client, server) = tokio::join!(TcpStream::connect(addr), listener.accept());
    (client.unwrap(), server.unwrap().0)
}

#[tokio::test]
async fn test_secure_client_pipe_with_provider() {
    let cert = self_signed("localhost");
    let (browser, accepted) = create_test_connection().await;
    let trusted = client_config(&cert.der);

    let browser_task = tokio::spawn(async move {
        let name = ServerName::try_from("localhost").unwrap();
        let mut tls = TlsConnector::from(trusted).connect(name, browser).await.unwrap();
        assert_eq!(tls.get_ref().1.alpn_protocol(), Some(&b"http/1.1"[..]));
        tls.write_all(b"GET / HTTP/1.1\r\n\r\n").await.unwrap();
        let mut reply = [0u8; 2];
        tls.read_exact(&mut reply).await.unwrap();
        reply
    });

    let key = cert.key.clone();
    let provider = move |host: &str| (host == "localhost").then(|| key.clone());

    let mut client = ClientPipe::new(accepted, ReceiveTimeouts::default());
    client
        .secure_client_pipe("localhost", &provider, &TlsOptions::default())
        .await
        .unwrap();
    assert!(client.is_secure());

    let mut buf = [0u8; 64];
    let n = client.receive(&mut buf).await.unwrap();
    assert_eq!(&buf[..n], b"GET / HTTP/1.1\r\n\r\n");
    client.send(b"ok").await.unwrap();

    assert_eq!(&browser_task.await.unwrap(), b"ok");
}

#[tokio::test]
async fn test_client_handshake_failure_ends_pipe() {
    let cert = self_signed("localhost");
    let (mut browser, accepted) = create_test_connection().await;

    // Not a ClientHello
    browser.write_all(b"GET / HTTP/1.1\r\n\r\n").await.unwrap();

    let mut client = ClientPipe::new(accepted, ReceiveTimeouts::default());
    let result = client
        .secure_client_pipe_direct("localhost", cert.key.clone(), &TlsOptions::default())
        .await;

    assert!(result.is_err());
    assert!(!client.is_connected());
}

#[tokio::test]
async fn test_pending_put_back_refuses_handshake() {
    let cert = self_signed("localhost");
    let (_browser, accepted) = create_test_connection().await;

    let mut client = ClientPipe::new(accepted, ReceiveTimeouts::default());
    client.put_back(b"\x16\x03\x01");
    let result = client
        .secure_client_pipe_direct("localhost", cert.key.clone(), &TlsOptions::default())
        .await;

    assert!(matches!(result, Err(HandshakeError::PendingData)));
    assert!(!client.is_connected());
}

#[tokio::test]
async fn test_protocol_gap_leaves_nothing_negotiable() {
    let cert = self_signed("localhost");
    let (_browser, accepted) = create_test_connection().await;

    let options = TlsOptions {
        protocols: vec![TlsProtocol::Tls10, TlsProtocol::Tls12, TlsProtocol::Tls13],
        request_client_certificate: false,
    };
    let mut client = ClientPipe::new(accepted, ReceiveTimeouts::default());
    let result = client
        .secure_client_pipe_direct("localhost", cert.key.clone(), &options)
        .await;

    assert!(matches!(result, Err(HandshakeError::NoUsableProtocol)));
    assert!(!client.is_connected());
}

#[tokio::test]
async fn test_optional_client_certificate_request() {
    let cert = self_signed("localhost");
    let (browser, accepted) = create_test_connection().await;
    let trusted = client_config(&cert.der);

    // Client offers no certificate; the request is optional
    let browser_task = tokio::spawn(async move {
        let name = ServerName::try_from("localhost").unwrap();
        let mut tls = TlsConnector::from(trusted).connect(name, browser).await.unwrap();
        tls.write_all(b"x").await.unwrap();
    });

    let options = TlsOptions {
        request_client_certificate: true,
        ..TlsOptions::default()
    };
    let mut client = ClientPipe::new(accepted, ReceiveTimeouts::default());
    client
        .secure_client_pipe_direct("localhost", cert.key.clone(), &options)
        .await
        .unwrap();

    let mut buf = [0u8; 1];
    assert_eq!(client.receive(&mut buf).await.unwrap(), 1);
    browser_task.await.unwrap();
}

#[tokio::test]
async fn test_secure_existing_server_connection() {
    let cert = self_signed("localhost");
    let origin = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let origin_addr = origin.local_addr().unwrap();
    let acceptor = TlsAcceptor::from(tls::server_config(cert.key.clone(), &TlsOptions::default()).unwrap());

    tokio::spawn(async move {
        let (socket, _) = origin.accept().await.unwrap();
        let mut tls = acceptor.accept(socket).await.unwrap();
        let mut buf = [0u8; 4];
        tls.read_exact(&mut buf).await.unwrap();
        tls.write_all(&buf).await.unwrap();
        tls.flush().await.unwrap();
    });

    let mut server = ServerPipe::connect(
        &origin_addr.to_string(),
        "https:localhost:443",
        Duration::from_secs(5),
    )
    .await
    .unwrap();
    server
        .secure_existing_connection("localhost", client_config(&cert.der), Duration::from_secs(5))
        .await
        .unwrap();
    assert!(server.is_secure());

    server.send(b"echo").await.unwrap();
    let mut buf = [0u8; 4];
    let mut read = 0;
    while read < buf.len() {
        let n = server.receive(&mut buf[read..]).await.unwrap();
        assert!(n > 0);
        read += n;
    }
    assert_eq!(&buf, b"echo");
}

#[tokio::test]
async fn test_untrusted_server_certificate_ends_pipe() {
    let cert = self_signed("localhost");
    let stranger = self_signed("localhost");
    let origin = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let origin_addr = origin.local_addr().unwrap();
    let acceptor = TlsAcceptor::from(tls::server_config(cert.key.clone(), &TlsOptions::default()).unwrap());

    tokio::spawn(async move {
        let (socket, _) = origin.accept().await.unwrap();
        let _ = acceptor.accept(socket).await;
    });

    let mut server = ServerPipe::connect(&origin_addr.to_string(), "https:localhost:443", Duration::from_secs(5))
        .await
        .unwrap();
    let result = server
        .secure_existing_connection("localhost", client_config(&stranger.der), Duration::from_secs(5))
        .await;

    assert!(result.is_err());
    assert!(!server.is_connected());
}

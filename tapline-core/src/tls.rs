//! TLS helpers for pipes secured by the proxy
//!
//! Builds rustls server/client configurations for [`ClientPipe`] and
//! [`ServerPipe`] handshakes and narrows the configured protocol set to one
//! without gaps.
//!
//! [`ClientPipe`]: crate::pipe::ClientPipe
//! [`ServerPipe`]: crate::pipe::ServerPipe

use rustls::client::danger::HandshakeSignatureValid;
use rustls::crypto::CryptoProvider;
use rustls::pki_types::{CertificateDer, UnixTime};
use rustls::server::danger::{ClientCertVerified, ClientCertVerifier};
use rustls::server::{ClientHello, ResolvesServerCert};
use rustls::sign::CertifiedKey;
use rustls::{DigitallySignedStruct, DistinguishedName, ServerConfig, SignatureScheme};
use rustls::{SupportedProtocolVersion, version};
use std::io;
use std::sync::Arc;
use tapline_config::TlsProtocol;
use thiserror::Error;

/// ALPN identifier offered to clients
pub const ALPN_HTTP11: &[u8] = b"http/1.1";

#[derive(Debug, Error)]
pub enum HandshakeError {
    #[error("no certificate available for {0}")]
    NoCertificate(String),
    #[error("configured TLS protocols leave no version this build can negotiate")]
    NoUsableProtocol,
    #[error("pipe is closed or already secured")]
    NotPlain,
    #[error("unread client bytes pending before the handshake")]
    PendingData,
    #[error("invalid server name {0}")]
    InvalidServerName(String),
    #[error("TLS configuration error: {0}")]
    Config(#[from] rustls::Error),
    #[error("TLS handshake timed out")]
    TimedOut,
    #[error("TLS handshake failed: {0}")]
    Io(#[from] io::Error),
}

/// Source of leaf certificates for hosts the proxy impersonates
pub trait CertificateProvider: Send + Sync {
    fn certificate_for_host(&self, host: &str) -> Option<Arc<CertifiedKey>>;
}

impl<F> CertificateProvider for F
where
    F: Fn(&str) -> Option<Arc<CertifiedKey>> + Send + Sync,
{
    fn certificate_for_host(&self, host: &str) -> Option<Arc<CertifiedKey>> {
        self(host)
    }
}

/// Options for server-role handshakes on client pipes
#[derive(Debug, Clone)]
pub struct TlsOptions {
    pub protocols: Vec<TlsProtocol>,
    pub request_client_certificate: bool,
}

impl Default for TlsOptions {
    fn default() -> Self {
        Self {
            protocols: vec![TlsProtocol::Tls12, TlsProtocol::Tls13],
            request_client_certificate: false,
        }
    }
}

impl From<&tapline_config::Tls> for TlsOptions {
    fn from(tls: &tapline_config::Tls) -> Self {
        Self {
            protocols: tls.protocols.clone(),
            request_client_certificate: tls.request_client_certificate,
        }
    }
}

/// Narrows `enabled` to the run of consecutive versions starting at the lowest
///
/// Some peers fail when the offered versions have a gap (e.g. TLS 1.0 and 1.2
/// without 1.1), so everything above the first gap is dropped.
pub fn contiguous_protocols(enabled: &[TlsProtocol]) -> Vec<TlsProtocol> {
    let mut sorted = enabled.to_vec();
    sorted.sort_unstable();
    sorted.dedup();

    let mut out: Vec<TlsProtocol> = Vec::with_capacity(sorted.len());
    for protocol in sorted {
        if let Some(last) = out.last()
            && protocol as u8 != *last as u8 + 1
        {
            break;
        }
        out.push(protocol);
    }
    out
}

/// Maps protocols to the versions rustls implements
pub fn rustls_versions(protocols: &[TlsProtocol]) -> Vec<&'static SupportedProtocolVersion> {
    protocols
        .iter()
        .filter_map(|p| match p {
            TlsProtocol::Tls12 => Some(&version::TLS12),
            TlsProtocol::Tls13 => Some(&version::TLS13),
            _ => None,
        })
        .collect()
}

fn crypto_provider() -> Arc<CryptoProvider> {
    CryptoProvider::get_default()
        .cloned()
        .unwrap_or_else(|| Arc::new(rustls::crypto::aws_lc_rs::default_provider()))
}

#[derive(Debug)]
struct SingleCertResolver(Arc<CertifiedKey>);

impl ResolvesServerCert for SingleCertResolver {
    fn resolve(&self, _client_hello: ClientHello<'_>) -> Option<Arc<CertifiedKey>> {
        Some(self.0.clone())
    }
}

/// Requests a client certificate without requiring or validating one
#[derive(Debug)]
struct OptionalClientCertificate {
    provider: Arc<CryptoProvider>,
}

impl ClientCertVerifier for OptionalClientCertificate {
    fn offer_client_auth(&self) -> bool {
        true
    }

    fn client_auth_mandatory(&self) -> bool {
        false
    }

    fn root_hint_subjects(&self) -> &[DistinguishedName] {
        &[]
    }

    fn verify_client_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _now: UnixTime,
    ) -> Result<ClientCertVerified, rustls::Error> {
        Ok(ClientCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.provider
            .signature_verification_algorithms
            .supported_schemes()
    }
}

/// Builds the server config used to terminate TLS from a client
pub fn server_config(
    certificate: Arc<CertifiedKey>,
    options: &TlsOptions,
) -> Result<Arc<ServerConfig>, HandshakeError> {
    let versions = rustls_versions(&contiguous_protocols(&options.protocols));
    if versions.is_empty() {
        return Err(HandshakeError::NoUsableProtocol);
    }

    let provider = crypto_provider();
    let builder = ServerConfig::builder_with_provider(provider.clone())
        .with_protocol_versions(&versions)?;

    let builder = if options.request_client_certificate {
        builder.with_client_cert_verifier(Arc::new(OptionalClientCertificate { provider }))
    } else {
        builder.with_no_client_auth()
    };

    let mut config = builder.with_cert_resolver(Arc::new(SingleCertResolver(certificate)));
    config.alpn_protocols = vec![ALPN_HTTP11.to_vec()];
    Ok(Arc::new(config))
}

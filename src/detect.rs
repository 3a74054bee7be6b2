//! Protocol detection by probing a container's published port.
//!
//! The probe first attempts a TLS handshake offering `h2` and `http/1.1`
//! over ALPN.  A completed handshake is HTTPS when the server picked an HTTP
//! protocol or answers an HTTP request over the session, and TLS otherwise.
//! If the handshake fails, a fresh plaintext connection is sent a `HEAD`
//! request: an HTTP status line means HTTP, anything else (banner, silence,
//! reset) means raw TCP.  A port that refuses or times out the TCP connect
//! is `Unknown`.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use log::{debug, warn};
use rustls::pki_types::ServerName;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_rustls::TlsConnector;

use crate::types::Protocol;

#[async_trait]
pub trait Detect: Send + Sync {
    /// Classify the service listening at `addr` (`host:port`). Never fails;
    /// anything undecidable is [`Protocol::Unknown`].
    async fn detect(&self, addr: &str) -> Protocol;
}

pub struct ProbeDetector {
    timeout: Duration,
    tls: Option<TlsConnector>,
}

impl ProbeDetector {
    /// `timeout` bounds each individual step (connect, handshake, read).
    pub fn new(timeout: Duration) -> Self {
        let tls = match tls_connector() {
            Ok(c) => Some(c),
            Err(e) => {
                warn!("TLS probing disabled: {}", e);
                None
            }
        };
        Self { timeout, tls }
    }

    async fn connect(&self, addr: &str) -> Option<TcpStream> {
        match timeout(self.timeout, TcpStream::connect(addr)).await {
            Ok(Ok(stream)) => Some(stream),
            Ok(Err(e)) => {
                debug!("Probe connect to {} failed: {}", addr, e);
                None
            }
            Err(_) => {
                debug!("Probe connect to {} timed out", addr);
                None
            }
        }
    }

    /// `Some(Https | Tls)` if the endpoint completes a TLS handshake.
    async fn probe_tls(&self, stream: TcpStream, host: &str) -> Option<Protocol> {
        let connector = self.tls.as_ref()?;
        let server_name = ServerName::try_from(host.to_owned()).ok()?;
        let mut tls = match timeout(self.timeout, connector.connect(server_name, stream)).await {
            Ok(Ok(tls)) => tls,
            Ok(Err(e)) => {
                debug!("TLS handshake with {} failed: {}", host, e);
                return None;
            }
            Err(_) => return None,
        };

        let alpn = tls.get_ref().1.alpn_protocol().map(<[u8]>::to_vec);
        if matches!(alpn.as_deref(), Some(b"h2") | Some(b"http/1.1")) {
            return Some(Protocol::Https);
        }
        if self.speaks_http(&mut tls, host).await {
            Some(Protocol::Https)
        } else {
            Some(Protocol::Tls)
        }
    }

    async fn speaks_http<S>(&self, stream: &mut S, host: &str) -> bool
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let request = format!("HEAD / HTTP/1.1\r\nHost: {}\r\nConnection: close\r\n\r\n", host);
        if timeout(self.timeout, stream.write_all(request.as_bytes()))
            .await
            .map_or(true, |r| r.is_err())
        {
            return false;
        }

        let mut buf = [0u8; 16];
        let mut filled = 0;
        while filled < STATUS_PREFIX.len() {
            match timeout(self.timeout, stream.read(&mut buf[filled..])).await {
                Ok(Ok(0)) | Ok(Err(_)) | Err(_) => break,
                Ok(Ok(n)) => filled += n,
            }
        }
        is_http_status_line(&buf[..filled])
    }
}

#[async_trait]
impl Detect for ProbeDetector {
    async fn detect(&self, addr: &str) -> Protocol {
        let host = match addr.rsplit_once(':') {
            Some((host, _)) => host.trim_start_matches('[').trim_end_matches(']'),
            None => return Protocol::Unknown,
        };

        let Some(stream) = self.connect(addr).await else {
            return Protocol::Unknown;
        };
        if let Some(protocol) = self.probe_tls(stream, host).await {
            debug!("Detected {} at {}", protocol, addr);
            return protocol;
        }

        // The failed handshake consumed the first connection.
        let Some(mut stream) = self.connect(addr).await else {
            return Protocol::Unknown;
        };
        let protocol = if self.speaks_http(&mut stream, host).await {
            Protocol::Http
        } else {
            Protocol::Tcp
        };
        debug!("Detected {} at {}", protocol, addr);
        protocol
    }
}

const STATUS_PREFIX: &[u8] = b"HTTP/1.";

fn is_http_status_line(bytes: &[u8]) -> bool {
    bytes.len() >= STATUS_PREFIX.len() && bytes.starts_with(STATUS_PREFIX)
}

fn tls_connector() -> Result<TlsConnector, rustls::Error> {
    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let mut config = rustls::ClientConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()?
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(AcceptAnyCert))
        .with_no_client_auth();
    config.alpn_protocols = vec![b"h2".to_vec(), b"http/1.1".to_vec()];
    Ok(TlsConnector::from(Arc::new(config)))
}

// Containers serve self-signed certificates; only the handshake shape matters.
#[derive(Debug)]
struct AcceptAnyCert;

impl rustls::client::danger::ServerCertVerifier for AcceptAnyCert {
    fn verify_server_cert(
        &self,
        _end_entity: &rustls::pki_types::CertificateDer<'_>,
        _intermediates: &[rustls::pki_types::CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: rustls::pki_types::UnixTime,
    ) -> Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &rustls::pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &rustls::pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        rustls::crypto::ring::default_provider()
            .signature_verification_algorithms
            .supported_schemes()
    }
}

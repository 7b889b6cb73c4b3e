use async_trait::async_trait;
use rustls::crypto::{ring, CryptoProvider};
use rustls::pki_types::CertificateDer;
use rustls::server::WebPkiClientVerifier;
use rustls::{ClientConfig, RootCertStore, ServerConfig};
use sha2::{Digest, Sha256};
use std::fmt::Write as _;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio_rustls::server::TlsStream;
use tokio_rustls::TlsAcceptor;

use crate::pki::{CertificateBundle, ClientIdentity, PemCertificate};

pub type Result<T> = std::result::Result<T, TransportError>;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("TLS configuration failed: {0}")]
    Tls(#[from] rustls::Error),
    #[error("Client verifier setup failed: {0}")]
    Verifier(#[from] rustls::server::VerifierBuilderError),
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("TLS handshake failed: {0}")]
    Handshake(#[source] io::Error),
    #[error("TLS handshake timed out after {0:?}")]
    HandshakeTimeout(Duration),
}

#[async_trait]
pub trait AsyncStream: AsyncRead + AsyncWrite + Send + Sync + Unpin {
    async fn close(&mut self) -> io::Result<()>;
    fn peer_addr(&self) -> io::Result<SocketAddr>;
    /// SHA-256 of the peer's leaf certificate, hex encoded. `None` for plain
    /// TCP.
    fn peer_fingerprint(&self) -> Option<String>;
}

// --- Listener ---

/// TCP listener that optionally upgrades accepted sockets to mutual TLS.
///
/// [`Listener::accept`] only takes the socket; the handshake happens in
/// [`Incoming::establish`] so that a slow peer cannot stall the accept loop.
pub struct Listener {
    listener: TcpListener,
    acceptor: Option<TlsAcceptor>,
    handshake_timeout: Option<Duration>,
}

impl Listener {
    pub async fn bind(
        addr: &str,
        acceptor: Option<TlsAcceptor>,
        handshake_timeout: Option<Duration>,
    ) -> io::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        Ok(Self {
            listener,
            acceptor,
            handshake_timeout,
        })
    }

    pub async fn accept(&self) -> io::Result<Incoming> {
        let (stream, peer) = self.listener.accept().await?;
        Ok(Incoming {
            stream,
            peer,
            acceptor: self.acceptor.clone(),
            handshake_timeout: self.handshake_timeout,
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn is_secure(&self) -> bool {
        self.acceptor.is_some()
    }
}

/// An accepted socket that has not been through the TLS handshake yet.
pub struct Incoming {
    stream: TcpStream,
    peer: SocketAddr,
    acceptor: Option<TlsAcceptor>,
    handshake_timeout: Option<Duration>,
}

impl Incoming {
    pub fn peer_addr(&self) -> SocketAddr {
        self.peer
    }

    /// Run the TLS handshake, if any, bounded by the listener's handshake
    /// timeout.
    pub async fn establish(self) -> Result<Box<dyn AsyncStream>> {
        let Some(acceptor) = self.acceptor else {
            return Ok(Box::new(TcpAsyncStream {
                stream: self.stream,
            }));
        };

        let handshake = acceptor.accept(self.stream);
        let stream = match self.handshake_timeout {
            Some(limit) => tokio::time::timeout(limit, handshake)
                .await
                .map_err(|_| TransportError::HandshakeTimeout(limit))?,
            None => handshake.await,
        }
        .map_err(TransportError::Handshake)?;

        Ok(Box::new(TlsAsyncStream { stream }))
    }
}

/// Whether the accept loop should keep going after `err`.
pub fn is_transient(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::Interrupted
            | io::ErrorKind::WouldBlock
            | io::ErrorKind::TimedOut
    ) || is_descriptor_exhaustion(err)
}

/// ENFILE or EMFILE. Retrying right away would spin, so callers back off.
pub fn is_descriptor_exhaustion(err: &io::Error) -> bool {
    matches!(err.raw_os_error(), Some(23) | Some(24))
}

// --- TCP ---

pub struct TcpAsyncStream {
    stream: TcpStream,
}

impl AsyncRead for TcpAsyncStream {
    fn poll_read(
        mut self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
        buf: &mut tokio::io::ReadBuf<'_>,
    ) -> std::task::Poll<io::Result<()>> {
        std::pin::Pin::new(&mut self.stream).poll_read(cx, buf)
    }
}

impl AsyncWrite for TcpAsyncStream {
    fn poll_write(
        mut self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
        buf: &[u8],
    ) -> std::task::Poll<io::Result<usize>> {
        std::pin::Pin::new(&mut self.stream).poll_write(cx, buf)
    }

    fn poll_flush(
        mut self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<io::Result<()>> {
        std::pin::Pin::new(&mut self.stream).poll_flush(cx)
    }

    fn poll_shutdown(
        mut self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<io::Result<()>> {
        std::pin::Pin::new(&mut self.stream).poll_shutdown(cx)
    }
}

#[async_trait]
impl AsyncStream for TcpAsyncStream {
    async fn close(&mut self) -> io::Result<()> {
        use tokio::io::AsyncWriteExt;
        self.stream.shutdown().await
    }

    fn peer_addr(&self) -> io::Result<SocketAddr> {
        self.stream.peer_addr()
    }

    fn peer_fingerprint(&self) -> Option<String> {
        None
    }
}

// --- TLS ---

pub struct TlsAsyncStream {
    stream: TlsStream<TcpStream>,
}

impl AsyncRead for TlsAsyncStream {
    fn poll_read(
        mut self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
        buf: &mut tokio::io::ReadBuf<'_>,
    ) -> std::task::Poll<io::Result<()>> {
        std::pin::Pin::new(&mut self.stream).poll_read(cx, buf)
    }
}

impl AsyncWrite for TlsAsyncStream {
    fn poll_write(
        mut self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
        buf: &[u8],
    ) -> std::task::Poll<io::Result<usize>> {
        std::pin::Pin::new(&mut self.stream).poll_write(cx, buf)
    }

    fn poll_flush(
        mut self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<io::Result<()>> {
        std::pin::Pin::new(&mut self.stream).poll_flush(cx)
    }

    fn poll_shutdown(
        mut self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<io::Result<()>> {
        std::pin::Pin::new(&mut self.stream).poll_shutdown(cx)
    }
}

#[async_trait]
impl AsyncStream for TlsAsyncStream {
    async fn close(&mut self) -> io::Result<()> {
        use tokio::io::AsyncWriteExt;
        self.stream.shutdown().await
    }

    fn peer_addr(&self) -> io::Result<SocketAddr> {
        let (tcp_stream, _) = self.stream.get_ref();
        tcp_stream.peer_addr()
    }

    fn peer_fingerprint(&self) -> Option<String> {
        let (_, connection) = self.stream.get_ref();
        connection
            .peer_certificates()
            .and_then(|chain| chain.first())
            .map(fingerprint)
    }
}

// --- TLS helpers ---

/// Hex-encoded SHA-256 of a DER certificate.
pub fn fingerprint(cert: &CertificateDer<'_>) -> String {
    let digest = Sha256::digest(cert.as_ref());
    let mut hex = String::with_capacity(digest.len() * 2);
    for byte in digest.iter() {
        let _ = write!(hex, "{byte:02x}");
    }
    hex
}

/// ring with the hub's suite and group allow-list: AES-GCM with ECDHE over
/// P-256 only.
pub fn crypto_provider() -> CryptoProvider {
    let mut provider = ring::default_provider();
    provider.cipher_suites = vec![
        ring::cipher_suite::TLS13_AES_256_GCM_SHA384,
        ring::cipher_suite::TLS13_AES_128_GCM_SHA256,
        ring::cipher_suite::TLS_ECDHE_ECDSA_WITH_AES_256_GCM_SHA384,
        ring::cipher_suite::TLS_ECDHE_ECDSA_WITH_AES_128_GCM_SHA256,
    ];
    provider.kx_groups = vec![ring::kx_group::SECP256R1];
    provider
}

const PROTOCOL_VERSIONS: &[&rustls::SupportedProtocolVersion] =
    &[&rustls::version::TLS13, &rustls::version::TLS12];

fn root_store(root: &PemCertificate) -> Result<Arc<RootCertStore>> {
    let mut roots = RootCertStore::empty();
    roots.add(root.der().clone())?;
    Ok(Arc::new(roots))
}

/// Server side of mutual TLS: present the server certificate and require a
/// client certificate chaining to the bundle's root.
pub fn server_tls_config(bundle: &CertificateBundle) -> Result<Arc<ServerConfig>> {
    let provider = Arc::new(crypto_provider());
    let verifier =
        WebPkiClientVerifier::builder_with_provider(root_store(&bundle.root)?, provider.clone())
            .build()?;

    let config = ServerConfig::builder_with_provider(provider)
        .with_protocol_versions(PROTOCOL_VERSIONS)?
        .with_client_cert_verifier(verifier)
        .with_single_cert(vec![bundle.server.der().clone()], bundle.server_key.der())?;
    Ok(Arc::new(config))
}

pub fn build_tls_acceptor(bundle: &CertificateBundle) -> Result<TlsAcceptor> {
    Ok(TlsAcceptor::from(server_tls_config(bundle)?))
}

/// Client side of mutual TLS: trust only the hub root and present the
/// identity's certificate.
pub fn client_tls_config(identity: &ClientIdentity) -> Result<Arc<ClientConfig>> {
    let config = ClientConfig::builder_with_provider(Arc::new(crypto_provider()))
        .with_protocol_versions(PROTOCOL_VERSIONS)?
        .with_root_certificates(root_store(&identity.root)?)
        .with_client_auth_cert(vec![identity.certificate.der().clone()], identity.key.der())?;
    Ok(Arc::new(config))
}

/// Client config that trusts `root` but presents no certificate.
pub fn anonymous_client_tls_config(root: &PemCertificate) -> Result<Arc<ClientConfig>> {
    let config = ClientConfig::builder_with_provider(Arc::new(crypto_provider()))
        .with_protocol_versions(PROTOCOL_VERSIONS)?
        .with_root_certificates(root_store(root)?)
        .with_no_client_auth();
    Ok(Arc::new(config))
}

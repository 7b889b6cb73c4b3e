//! Certificate material for mutual TLS.
//!
//! The hub is its own certificate authority: at startup it issues a root and
//! signs one server and one client certificate with it, or loads a bundle
//! that was provisioned earlier. See [`issue_bundle`] and [`provision`].

mod authority;
pub mod store;

pub use authority::{
    discover_host, issue_bundle, verify_client_certificate, verify_server_certificate,
    HostIdentity, VALIDITY_DAYS,
};

use crate::config::TlsConfig;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use std::fmt;
use std::path::PathBuf;
use thiserror::Error;
use tracing::info;

#[derive(Debug, Error)]
pub enum CertError {
    #[error("Certificate generation failed: {0}")]
    Generation(#[from] rcgen::Error),
    #[error("Serial number generation failed: {0}")]
    Serial(rand::Error),
    #[error("I/O error on {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Invalid PEM: {0}")]
    InvalidPem(String),
    #[error("Invalid server name: {0}")]
    InvalidServerName(String),
    #[error("Certificate rejected: {0}")]
    Rejected(#[from] rustls::Error),
    #[error("Verifier setup failed: {0}")]
    Verifier(#[from] rustls::server::VerifierBuilderError),
}

/// A certificate kept both as DER and as its PEM text.
#[derive(Debug, Clone)]
pub struct PemCertificate {
    der: CertificateDer<'static>,
    pem: String,
}

impl PemCertificate {
    fn new(der: CertificateDer<'static>, pem: String) -> Self {
        Self { der, pem }
    }

    /// Parse the first certificate in `pem`.
    pub fn from_pem(pem: String) -> Result<Self, CertError> {
        let mut reader = pem.as_bytes();
        let der = rustls_pemfile::certs(&mut reader)
            .next()
            .ok_or_else(|| CertError::InvalidPem("no certificate block".to_string()))?
            .map_err(|e| CertError::InvalidPem(e.to_string()))?;
        Ok(Self { der, pem })
    }

    pub fn der(&self) -> &CertificateDer<'static> {
        &self.der
    }

    pub fn pem(&self) -> &str {
        &self.pem
    }
}

/// A PKCS#8 / SEC1 private key kept both as DER and as its PEM text.
pub struct PemPrivateKey {
    der: PrivateKeyDer<'static>,
    pem: String,
}

impl PemPrivateKey {
    fn from_key_pair(key: &rcgen::KeyPair) -> Self {
        Self {
            der: PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(key.serialize_der())),
            pem: key.serialize_pem(),
        }
    }

    pub fn from_pem(pem: String) -> Result<Self, CertError> {
        let mut reader = pem.as_bytes();
        let der = rustls_pemfile::private_key(&mut reader)
            .map_err(|e| CertError::InvalidPem(e.to_string()))?
            .ok_or_else(|| CertError::InvalidPem("no private key block".to_string()))?;
        Ok(Self { der, pem })
    }

    pub fn der(&self) -> PrivateKeyDer<'static> {
        self.der.clone_key()
    }

    pub fn pem(&self) -> &str {
        &self.pem
    }
}

impl Clone for PemPrivateKey {
    fn clone(&self) -> Self {
        Self {
            der: self.der.clone_key(),
            pem: self.pem.clone(),
        }
    }
}

impl fmt::Debug for PemPrivateKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("PemPrivateKey(..)")
    }
}

/// Everything the hub needs for mutual TLS.
///
/// `server` and `client` are both signed by `root` and share its validity
/// window. The root private key is not part of the bundle.
#[derive(Debug, Clone)]
pub struct CertificateBundle {
    pub root: PemCertificate,
    pub server: PemCertificate,
    pub server_key: PemPrivateKey,
    pub client: PemCertificate,
    pub client_key: PemPrivateKey,
}

impl CertificateBundle {
    pub fn client_identity(&self) -> ClientIdentity {
        ClientIdentity {
            root: self.root.clone(),
            certificate: self.client.clone(),
            key: self.client_key.clone(),
        }
    }
}

/// What a peer needs to connect: the root to trust and its own certificate.
#[derive(Debug, Clone)]
pub struct ClientIdentity {
    pub root: PemCertificate,
    pub certificate: PemCertificate,
    pub key: PemPrivateKey,
}

/// Obtain the hub's certificate bundle according to `config`.
///
/// Loads from `cert_dir` when `reuse_existing` is set and a bundle is there;
/// otherwise issues a new one for this host and writes it out if `persist`
/// is set.
pub fn provision(config: &TlsConfig) -> Result<CertificateBundle, CertError> {
    if config.reuse_existing && store::bundle_exists(&config.cert_dir) {
        info!(dir = %config.cert_dir.display(), "Loading existing certificates");
        return store::load_bundle(&config.cert_dir);
    }

    let host = discover_host();
    let host_hint = config.host_hint.clone().unwrap_or(host.hostname);
    let addresses = if config.subject_alt_ips.is_empty() {
        host.addresses
    } else {
        config.subject_alt_ips.clone()
    };

    let bundle = issue_bundle(&host_hint, &addresses)?;
    if config.persist {
        store::write_bundle(&bundle, &config.cert_dir)?;
    }
    Ok(bundle)
}

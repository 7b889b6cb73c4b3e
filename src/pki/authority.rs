use rand::rngs::OsRng;
use rand::RngCore;
use rcgen::{
    BasicConstraints, Certificate, CertificateParams, DistinguishedName, DnType,
    ExtendedKeyUsagePurpose, IsCa, KeyPair, KeyUsagePurpose, SerialNumber,
    PKCS_ECDSA_P256_SHA256,
};
use rustls::client::danger::ServerCertVerifier;
use rustls::client::WebPkiServerVerifier;
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::server::danger::ClientCertVerifier;
use rustls::server::WebPkiClientVerifier;
use rustls::RootCertStore;
use std::net::{IpAddr, Ipv4Addr, UdpSocket};
use std::sync::Arc;
use time::{Duration, OffsetDateTime};
use tracing::{debug, info};

use super::{CertError, CertificateBundle, PemCertificate, PemPrivateKey};

/// Lifetime shared by the root and every certificate it signs.
pub const VALIDITY_DAYS: i64 = 365;

const SERIAL_BYTES: usize = 16;

/// Transient issuer. The root key lives only as long as this value.
struct Authority {
    organization: String,
    certificate: Certificate,
    key: KeyPair,
    not_before: OffsetDateTime,
    not_after: OffsetDateTime,
}

impl Authority {
    fn new(organization: &str) -> Result<Self, CertError> {
        let not_before = OffsetDateTime::now_utc();
        let not_after = not_before + Duration::days(VALIDITY_DAYS);

        let key = KeyPair::generate_for(&PKCS_ECDSA_P256_SHA256)?;
        let mut params = CertificateParams::default();
        params.serial_number = Some(random_serial()?);
        params.distinguished_name = subject(organization, "Root CA");
        params.not_before = not_before;
        params.not_after = not_after;
        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        params.key_usages = vec![KeyUsagePurpose::KeyCertSign, KeyUsagePurpose::KeyEncipherment];
        let certificate = params.self_signed(&key)?;

        Ok(Self {
            organization: organization.to_string(),
            certificate,
            key,
            not_before,
            not_after,
        })
    }

    fn issue(
        &self,
        mut params: CertificateParams,
        common_name: &str,
        usage: ExtendedKeyUsagePurpose,
    ) -> Result<(PemCertificate, PemPrivateKey), CertError> {
        let key = KeyPair::generate_for(&PKCS_ECDSA_P256_SHA256)?;
        params.serial_number = Some(random_serial()?);
        params.distinguished_name = subject(&self.organization, common_name);
        params.not_before = self.not_before;
        params.not_after = self.not_after;
        params.is_ca = IsCa::ExplicitNoCa;
        params.extended_key_usages = vec![usage];
        let certificate = params.signed_by(&key, &self.certificate, &self.key)?;

        Ok((
            PemCertificate::new(certificate.der().clone(), certificate.pem()),
            PemPrivateKey::from_key_pair(&key),
        ))
    }

    fn root(&self) -> PemCertificate {
        PemCertificate::new(self.certificate.der().clone(), self.certificate.pem())
    }
}

/// Issue a fresh root plus a server and a client certificate signed by it.
///
/// The server certificate names `subject_alt_ips`, or `host_hint` as a DNS
/// name when no address is given. Any failure is final; nothing is retried.
pub fn issue_bundle(host_hint: &str, subject_alt_ips: &[IpAddr]) -> Result<CertificateBundle, CertError> {
    let authority = Authority::new(host_hint)?;

    let names: Vec<String> = if subject_alt_ips.is_empty() {
        vec![host_hint.to_string()]
    } else {
        subject_alt_ips.iter().map(ToString::to_string).collect()
    };
    debug!(?names, "Issuing server certificate");

    let mut server_params = CertificateParams::new(names)?;
    server_params.key_usages = vec![
        KeyUsagePurpose::DigitalSignature,
        KeyUsagePurpose::KeyEncipherment,
    ];
    let (server, server_key) = authority.issue(
        server_params,
        "Certificate",
        ExtendedKeyUsagePurpose::ServerAuth,
    )?;

    let mut client_params = CertificateParams::default();
    client_params.key_usages = vec![KeyUsagePurpose::DigitalSignature];
    let (client, client_key) = authority.issue(
        client_params,
        "ClientCert",
        ExtendedKeyUsagePurpose::ClientAuth,
    )?;

    info!(host = host_hint, "Issued certificate bundle");
    Ok(CertificateBundle {
        root: authority.root(),
        server,
        server_key,
        client,
        client_key,
    })
}

fn subject(organization: &str, common_name: &str) -> DistinguishedName {
    let mut name = DistinguishedName::new();
    name.push(DnType::OrganizationName, organization);
    name.push(DnType::CommonName, common_name);
    name
}

fn random_serial() -> Result<SerialNumber, CertError> {
    let mut bytes = [0u8; SERIAL_BYTES];
    OsRng.try_fill_bytes(&mut bytes).map_err(CertError::Serial)?;
    // Keep the DER integer positive.
    bytes[0] &= 0x7f;
    Ok(SerialNumber::from_slice(&bytes))
}

/// Hostname and outward-facing addresses of this machine.
#[derive(Debug, Clone)]
pub struct HostIdentity {
    pub hostname: String,
    pub addresses: Vec<IpAddr>,
}

pub fn discover_host() -> HostIdentity {
    let hostname = hostname::get()
        .ok()
        .and_then(|name| name.into_string().ok())
        .filter(|name| !name.is_empty())
        .unwrap_or_else(|| "localhost".to_string());

    HostIdentity {
        hostname,
        addresses: primary_ipv4().map(IpAddr::V4).into_iter().collect(),
    }
}

// Connecting a UDP socket sends nothing; it only asks the kernel which local
// address would route outward.
fn primary_ipv4() -> Option<Ipv4Addr> {
    let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0)).ok()?;
    socket.connect((Ipv4Addr::new(8, 8, 8, 8), 80)).ok()?;
    match socket.local_addr().ok()?.ip() {
        IpAddr::V4(ip) if !ip.is_loopback() && !ip.is_unspecified() => Some(ip),
        _ => None,
    }
}

fn root_store(root: &CertificateDer<'static>) -> Result<Arc<RootCertStore>, CertError> {
    let mut roots = RootCertStore::empty();
    roots.add(root.clone())?;
    Ok(Arc::new(roots))
}

/// Check that `leaf` chains to `root` and is valid for `server_name` as a
/// TLS server certificate.
pub fn verify_server_certificate(
    leaf: &CertificateDer<'_>,
    root: &CertificateDer<'static>,
    server_name: &str,
) -> Result<(), CertError> {
    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let verifier = WebPkiServerVerifier::builder_with_provider(root_store(root)?, provider).build()?;
    let name = ServerName::try_from(server_name.to_string())
        .map_err(|_| CertError::InvalidServerName(server_name.to_string()))?;
    verifier.verify_server_cert(leaf, &[], &name, &[], UnixTime::now())?;
    Ok(())
}

/// Check that `leaf` chains to `root` and is usable for client authentication.
pub fn verify_client_certificate(
    leaf: &CertificateDer<'_>,
    root: &CertificateDer<'static>,
) -> Result<(), CertError> {
    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let verifier = WebPkiClientVerifier::builder_with_provider(root_store(root)?, provider).build()?;
    verifier.verify_client_cert(leaf, &[], UnixTime::now())?;
    Ok(())
}

//! On-disk layout of the certificate bundle (PEM files in one directory).

use std::fs;
use std::io::Write;
use std::path::Path;
use tracing::info;

use super::{
    verify_client_certificate, CertError, CertificateBundle, ClientIdentity, PemCertificate,
    PemPrivateKey,
};

pub const SERVER_CERT_FILE: &str = "server.pem";
pub const SERVER_KEY_FILE: &str = "server.key";
pub const CLIENT_CERT_FILE: &str = "client.pem";
pub const CLIENT_KEY_FILE: &str = "client.key";
pub const CA_CERT_FILE: &str = "ca.pem";
/// Same content as [`CA_CERT_FILE`], kept for peers that look for this name.
pub const ROOT_CERT_FILE: &str = "root.pem";

pub fn write_bundle(bundle: &CertificateBundle, dir: &Path) -> Result<(), CertError> {
    fs::create_dir_all(dir).map_err(|source| CertError::Io {
        path: dir.to_path_buf(),
        source,
    })?;

    write_file(dir, SERVER_CERT_FILE, bundle.server.pem(), false)?;
    write_file(dir, SERVER_KEY_FILE, bundle.server_key.pem(), true)?;
    write_file(dir, CLIENT_CERT_FILE, bundle.client.pem(), false)?;
    write_file(dir, CLIENT_KEY_FILE, bundle.client_key.pem(), true)?;
    write_file(dir, CA_CERT_FILE, bundle.root.pem(), false)?;
    write_file(dir, ROOT_CERT_FILE, bundle.root.pem(), false)?;

    info!(dir = %dir.display(), "Wrote certificate bundle");
    Ok(())
}

/// True when every file [`load_bundle`] needs is present.
pub fn bundle_exists(dir: &Path) -> bool {
    [SERVER_CERT_FILE, SERVER_KEY_FILE, CLIENT_CERT_FILE, CLIENT_KEY_FILE]
        .iter()
        .all(|name| dir.join(name).is_file())
        && root_path(dir).is_some()
}

/// Read a bundle written by [`write_bundle`]. Fails if the client certificate
/// does not chain to the stored root.
pub fn load_bundle(dir: &Path) -> Result<CertificateBundle, CertError> {
    let identity = load_client_identity(dir)?;
    verify_client_certificate(identity.certificate.der(), identity.root.der())?;
    Ok(CertificateBundle {
        root: identity.root,
        server: read_certificate(dir, SERVER_CERT_FILE)?,
        server_key: read_key(dir, SERVER_KEY_FILE)?,
        client: identity.certificate,
        client_key: identity.key,
    })
}

/// Load the root, client certificate and client key a peer connects with.
pub fn load_client_identity(dir: &Path) -> Result<ClientIdentity, CertError> {
    let root_name = root_path(dir)
        .and_then(|path| path.file_name().map(|n| n.to_string_lossy().into_owned()))
        .unwrap_or_else(|| CA_CERT_FILE.to_string());

    Ok(ClientIdentity {
        root: read_certificate(dir, &root_name)?,
        certificate: read_certificate(dir, CLIENT_CERT_FILE)?,
        key: read_key(dir, CLIENT_KEY_FILE)?,
    })
}

fn root_path(dir: &Path) -> Option<std::path::PathBuf> {
    [CA_CERT_FILE, ROOT_CERT_FILE]
        .iter()
        .map(|name| dir.join(name))
        .find(|path| path.is_file())
}

fn read_certificate(dir: &Path, name: &str) -> Result<PemCertificate, CertError> {
    let pem = read_file(dir, name)?;
    PemCertificate::from_pem(pem)
        .map_err(|e| CertError::InvalidPem(format!("{}: {e}", dir.join(name).display())))
}

fn read_key(dir: &Path, name: &str) -> Result<PemPrivateKey, CertError> {
    let pem = read_file(dir, name)?;
    PemPrivateKey::from_pem(pem)
        .map_err(|e| CertError::InvalidPem(format!("{}: {e}", dir.join(name).display())))
}

fn read_file(dir: &Path, name: &str) -> Result<String, CertError> {
    let path = dir.join(name);
    fs::read_to_string(&path).map_err(|source| CertError::Io { path, source })
}

fn write_file(dir: &Path, name: &str, contents: &str, private: bool) -> Result<(), CertError> {
    let path = dir.join(name);
    let mut options = fs::OpenOptions::new();
    options.write(true).create(true).truncate(true);
    #[cfg(unix)]
    if private {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }
    #[cfg(not(unix))]
    let _ = private;

    options
        .open(&path)
        .and_then(|mut file| file.write_all(contents.as_bytes()))
        .map_err(|source| CertError::Io { path, source })
}

//! One-time server key generation
//!
//! The proxy terminates TLS with a self-signed certificate generated on first
//! start and reused afterwards. Operators replace the PEM files in `data/` to
//! install a real certificate; regeneration only happens if the certificate
//! file is missing.

use std::os::unix::fs::OpenOptionsExt;
use std::path::Path;

use rcgen::{CertificateParams, DistinguishedName, DnType, KeyPair};
use time::{Duration, OffsetDateTime};
use tracing::info;

use crate::config::InstallLayout;
use crate::{Error, Result};

/// Two years, matching the lifetime operators expect before rotation
const VALIDITY: Duration = Duration::days(730);

/// Backdate the certificate so clock skew between the server and clients
/// does not make a fresh certificate unusable
const BACKDATE: Duration = Duration::hours(48);

/// Ensure the server certificate and key exist, generating a self-signed
/// pair if the certificate file is missing. Never overwrites existing files.
pub fn ensure_server_keys(layout: &InstallLayout) -> Result<()> {
    let cert_path = layout.tls_cert();
    if cert_path.exists() {
        return Ok(());
    }

    info!(cert = %cert_path.display(), "generating self-signed server certificate");
    let (cert_pem, key_pem) = generate_self_signed()?;
    write_private(&cert_path, cert_pem.as_bytes())?;
    write_private(&layout.tls_key(), key_pem.as_bytes())?;
    Ok(())
}

fn generate_self_signed() -> Result<(String, String)> {
    let key_pair = KeyPair::generate().map_err(|e| Error::tls(e.to_string()))?;

    let mut params = CertificateParams::new(vec!["localhost".to_string()])
        .map_err(|e| Error::tls(e.to_string()))?;
    let mut name = DistinguishedName::new();
    name.push(DnType::CommonName, "localhost");
    params.distinguished_name = name;

    let now = OffsetDateTime::now_utc();
    params.not_before = now - BACKDATE;
    params.not_after = now + VALIDITY;

    let cert = params
        .self_signed(&key_pair)
        .map_err(|e| Error::tls(e.to_string()))?;
    Ok((cert.pem(), key_pair.serialize_pem()))
}

fn write_private(path: &Path, contents: &[u8]) -> Result<()> {
    use std::io::Write;

    let mut file = std::fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .mode(0o600)
        .open(path)?;
    file.write_all(contents)?;
    Ok(())
}

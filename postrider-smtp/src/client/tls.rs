//! Client TLS configuration for STARTTLS upgrades.
//!
//! With a configured PEM certificate/key pair the sender authenticates
//! itself, and the same certificate file seeds the root pool the remote
//! chain is verified against. Without one, [`default_connector`] builds an
//! anonymous client over the system trust roots for opportunistic
//! upgrades. Session resumption is disabled; protocol floor is TLS 1.2
//! (the rustls default).

use std::{fs::File, io::BufReader, path::Path, sync::Arc};

use tokio_rustls::TlsConnector;
use tokio_rustls::rustls::pki_types::{CertificateDer, PrivateKeyDer};
use tokio_rustls::rustls::{ClientConfig, RootCertStore, client::Resumption};

use super::error::{ClientError, Result};

/// Build a [`TlsConnector`] from a PEM certificate chain and private key.
///
/// # Errors
///
/// Returns [`ClientError::Tls`] when either file is unreadable or does not
/// contain usable PEM material.
pub fn connector(certificate: &Path, private_key: &Path) -> Result<TlsConnector> {
    let certs = load_certs(certificate)?;
    let key = load_key(private_key)?;

    let mut roots = RootCertStore::empty();
    for cert in &certs {
        roots
            .add(cert.clone())
            .map_err(|e| ClientError::Tls(format!("can't add root certificate: {e}")))?;
    }

    let mut config = ClientConfig::builder()
        .with_root_certificates(roots)
        .with_client_auth_cert(certs, key)
        .map_err(|e| ClientError::Tls(format!("invalid client certificate: {e}")))?;
    config.resumption = Resumption::disabled();

    Ok(TlsConnector::from(Arc::new(config)))
}

/// Build a [`TlsConnector`] without a client identity: system trust roots
/// only, for senders with no certificate configured.
#[must_use]
pub fn default_connector() -> TlsConnector {
    let mut roots = RootCertStore::empty();

    let certs = rustls_native_certs::load_native_certs();
    for cert in certs.certs {
        let _ = roots.add(cert);
    }
    if !certs.errors.is_empty() {
        tracing::warn!(?certs.errors, "Some certificates could not be loaded");
    }

    let mut config = ClientConfig::builder()
        .with_root_certificates(roots)
        .with_no_client_auth();
    config.resumption = Resumption::disabled();

    TlsConnector::from(Arc::new(config))
}

fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>> {
    let file = File::open(path)
        .map_err(|e| ClientError::Tls(format!("can't read certificate {}: {e}", path.display())))?;
    let certs = rustls_pemfile::certs(&mut BufReader::new(file))
        .collect::<std::io::Result<Vec<_>>>()
        .map_err(|e| ClientError::Tls(format!("can't parse certificate {}: {e}", path.display())))?;
    if certs.is_empty() {
        return Err(ClientError::Tls(format!(
            "no certificates in {}",
            path.display()
        )));
    }
    Ok(certs)
}

fn load_key(path: &Path) -> Result<PrivateKeyDer<'static>> {
    let file = File::open(path)
        .map_err(|e| ClientError::Tls(format!("can't read private key {}: {e}", path.display())))?;
    rustls_pemfile::private_key(&mut BufReader::new(file))
        .map_err(|e| ClientError::Tls(format!("can't parse private key {}: {e}", path.display())))?
        .ok_or_else(|| ClientError::Tls(format!("no private key in {}", path.display())))
}

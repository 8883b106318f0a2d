//! TLS setup for the embedded servers.

use std::path::PathBuf;
use std::sync::Arc;

use rustls::ServerConfig;
use rustls::pki_types::pem::PemObject;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use tokio_rustls::TlsAcceptor;

use crate::{Error, Result};

/// PEM files backing a TLS listener.
#[derive(Debug, Clone)]
pub struct TlsFiles {
    pub certificate: PathBuf,
    pub private_key: PathBuf,
}

/// Install aws-lc-rs as the process-wide rustls provider.
///
/// The HTTP client is built without a provider of its own, so this must run
/// before the first client is created. Calling it again is harmless.
pub fn install_crypto_provider() {
    let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();
}

/// Build a TLS acceptor from a PEM certificate chain and private key.
pub fn load_acceptor(files: &TlsFiles) -> Result<TlsAcceptor> {
    let certs = CertificateDer::pem_file_iter(&files.certificate)
        .map_err(|e| Error::tls(format!("{}: {}", files.certificate.display(), e)))?
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| Error::tls(format!("{}: {}", files.certificate.display(), e)))?;
    if certs.is_empty() {
        return Err(Error::tls(format!(
            "{}: no certificate found",
            files.certificate.display()
        )));
    }
    let key = PrivateKeyDer::from_pem_file(&files.private_key)
        .map_err(|e| Error::tls(format!("{}: {}", files.private_key.display(), e)))?;

    let provider = Arc::new(rustls::crypto::aws_lc_rs::default_provider());
    let mut config = ServerConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()?
        .with_no_client_auth()
        .with_single_cert(certs, key)?;
    config.alpn_protocols = vec![b"h2".to_vec(), b"http/1.1".to_vec()];

    Ok(TlsAcceptor::from(Arc::new(config)))
}

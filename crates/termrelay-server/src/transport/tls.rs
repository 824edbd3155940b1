//! TLS setup for `wss://`.

use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use termrelay_core::{RelayError, RelayResult};
use tokio_rustls::TlsAcceptor;

/// Load a PEM certificate chain and private key into a TLS acceptor.
pub fn load_tls_acceptor(cert_path: &Path, key_path: &Path) -> RelayResult<TlsAcceptor> {
    let cert_pem = std::fs::read(cert_path).map_err(|e| {
        RelayError::Config(format!("cannot read cert {}: {e}", cert_path.display()))
    })?;
    let key_pem = std::fs::read(key_path)
        .map_err(|e| RelayError::Config(format!("cannot read key {}: {e}", key_path.display())))?;

    let certs: Vec<CertificateDer<'static>> = rustls_pemfile::certs(&mut &cert_pem[..])
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| RelayError::Config(format!("invalid certificate PEM: {e}")))?;
    if certs.is_empty() {
        return Err(RelayError::Config(format!(
            "no certificates found in {}",
            cert_path.display()
        )));
    }
    let key: PrivateKeyDer<'static> = rustls_pemfile::private_key(&mut &key_pem[..])
        .map_err(|e| RelayError::Config(format!("invalid key PEM: {e}")))?
        .ok_or_else(|| RelayError::Config("no private key found in PEM".into()))?;

    let mut config = rustls::ServerConfig::builder_with_provider(Arc::new(
        rustls::crypto::ring::default_provider(),
    ))
    .with_safe_default_protocol_versions()
    .map_err(|e| RelayError::Config(format!("TLS setup failed: {e}")))?
    .with_no_client_auth()
    .with_single_cert(certs, key)
    .map_err(|e| RelayError::Config(format!("TLS setup failed: {e}")))?;

    // WebSocket upgrades are plain HTTP/1.1.
    config.alpn_protocols = vec![b"http/1.1".to_vec()];

    Ok(TlsAcceptor::from(Arc::new(config)))
}

/// Generate a self-signed certificate for development use in `dir`.
///
/// Returns `(cert_path, key_path)`.
pub fn generate_self_signed_cert(dir: &Path) -> RelayResult<(PathBuf, PathBuf)> {
    std::fs::create_dir_all(dir)?;
    let cert_path = dir.join("cert.pem");
    let key_path = dir.join("key.pem");

    let mut params = rcgen::CertificateParams::new(vec![
        "localhost".to_string(),
        "127.0.0.1".to_string(),
        "::1".to_string(),
    ])
    .map_err(|e| RelayError::Other(format!("certificate params: {e}")))?;
    params.distinguished_name = rcgen::DistinguishedName::new();
    params
        .distinguished_name
        .push(rcgen::DnType::CommonName, "termrelay dev cert");

    let key_pair =
        rcgen::KeyPair::generate().map_err(|e| RelayError::Other(format!("key generation: {e}")))?;
    let cert = params
        .self_signed(&key_pair)
        .map_err(|e| RelayError::Other(format!("self-signing: {e}")))?;

    std::fs::write(&cert_path, cert.pem())?;
    std::fs::write(&key_path, key_pair.serialize_pem())?;

    Ok((cert_path, key_path))
}

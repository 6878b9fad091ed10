use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result, anyhow, ensure};
use rustls::crypto::ring;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::{ClientConfig, RootCertStore, ServerConfig};
use rustls_pemfile::{certs, pkcs8_private_keys, rsa_private_keys};
use tokio_rustls::{TlsAcceptor, TlsConnector};
use tracing::warn;

/// Connector for `https` upstreams, trusting the system roots.
pub fn build_connector() -> Result<TlsConnector> {
    let provider = ring::default_provider();
    let builder = ClientConfig::builder_with_provider(provider.into());
    let builder = builder.with_safe_default_protocol_versions()?;

    let mut root_store = RootCertStore::empty();
    match rustls_native_certs::load_native_certs() {
        Ok(certs) => {
            let (_, ignored) = root_store.add_parsable_certificates(certs);
            if ignored > 0 {
                warn!(ignored, "ignored {ignored} invalid system trust anchors");
            }
        }
        Err(err) => {
            warn!(error = %err, "failed to load system trust anchors");
        }
    }
    ensure!(
        !root_store.is_empty(),
        "no trust anchors available; install system certificates to reach an https upstream"
    );

    let mut config = builder
        .with_root_certificates(Arc::new(root_store))
        .with_no_client_auth();
    config.alpn_protocols = vec![b"http/1.1".to_vec()];
    Ok(TlsConnector::from(Arc::new(config)))
}

/// Acceptor for `scheme = "https"` listeners.
pub fn build_acceptor(cert_path: &Path, key_path: &Path) -> Result<TlsAcceptor> {
    let certs = load_certs(cert_path)?;
    ensure!(
        !certs.is_empty(),
        "no certificates found in {}",
        cert_path.display()
    );
    let key = load_key(key_path)?;
    let provider = ring::default_provider();
    let mut config = ServerConfig::builder_with_provider(provider.into())
        .with_safe_default_protocol_versions()?
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|e| anyhow!("failed to build server config: {e}"))?;
    config.alpn_protocols = vec![b"http/1.1".to_vec()];
    Ok(TlsAcceptor::from(Arc::new(config)))
}

fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>> {
    let data = std::fs::read(path)
        .with_context(|| format!("failed to read certs from {}", path.display()))?;
    let mut reader = std::io::BufReader::new(&data[..]);
    certs(&mut reader)
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| anyhow!("failed to parse certs: {e}"))
}

fn load_key(path: &Path) -> Result<PrivateKeyDer<'static>> {
    let data = std::fs::read(path)
        .with_context(|| format!("failed to read key from {}", path.display()))?;
    let mut reader = std::io::BufReader::new(&data[..]);
    if let Some(key) = pkcs8_private_keys(&mut reader).next() {
        let key = key.map_err(|e| anyhow!("failed to parse pkcs8 key: {e}"))?;
        return Ok(PrivateKeyDer::Pkcs8(key));
    }

    let mut reader = std::io::BufReader::new(&data[..]);
    if let Some(key) = rsa_private_keys(&mut reader).next() {
        let key = key.map_err(|e| anyhow!("failed to parse rsa key: {e}"))?;
        return Ok(PrivateKeyDer::from(key));
    }

    Err(anyhow!("no valid private key found in {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn acceptor_reports_missing_files() {
        let err = build_acceptor(Path::new("/nonexistent/cert.pem"), Path::new("/nonexistent/key.pem"))
            .err()
            .unwrap();
        assert!(err.to_string().contains("failed to read certs"), "{err}");
    }

    #[test]
    fn key_without_pem_blocks_is_rejected() -> anyhow::Result<()> {
        let mut file = tempfile::NamedTempFile::new()?;
        writeln!(file, "not a key")?;
        let err = load_key(file.path()).unwrap_err();
        assert!(err.to_string().contains("no valid private key"), "{err}");
        Ok(())
    }
}

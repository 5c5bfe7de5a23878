//! TLS configuration for the client-facing side of the proxy
//!
//! Certificates come from the configuration (filesystem paths or remote
//! sources, already loaded into PEM bytes). The acceptor is handed to each
//! proxy connection to upgrade the client socket after the `'S'` reply.

use std::io::BufReader;
use std::sync::Arc;

use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::ServerConfig;
use tokio_rustls::TlsAcceptor;
use tracing::warn;

use crate::config::CertificateConfig;
use crate::error::{Error, Result};

/// Builds an acceptor from the configured certificate list. rustls serves a
/// single certificate chain; extra entries are ignored with a warning.
pub fn build_acceptor(certificates: &[CertificateConfig]) -> Result<TlsAcceptor> {
    let first = certificates
        .first()
        .ok_or_else(|| Error::Tls("no certificates configured".to_string()))?;
    if certificates.len() > 1 {
        warn!(
            "{} certificates configured, only the first is served",
            certificates.len()
        );
    }
    acceptor_from_pem(&first.cert_pem, &first.key_pem)
}

pub fn acceptor_from_pem(cert_pem: &[u8], key_pem: &[u8]) -> Result<TlsAcceptor> {
    let mut cert_reader = BufReader::new(cert_pem);
    let certs: Vec<CertificateDer<'static>> = rustls_pemfile::certs(&mut cert_reader)
        .collect::<std::result::Result<_, _>>()
        .map_err(|e| Error::Tls(format!("read certificate: {e}")))?;
    if certs.is_empty() {
        return Err(Error::Tls("no certificate found in cert file".to_string()));
    }

    let mut key_reader = BufReader::new(key_pem);
    let key: PrivateKeyDer<'static> = rustls_pemfile::private_key(&mut key_reader)
        .map_err(|e| Error::Tls(format!("read private key: {e}")))?
        .ok_or_else(|| Error::Tls("no private key found in key file".to_string()))?;

    let server_config = ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|e| Error::Tls(format!("tls configuration: {e}")))?;
    Ok(TlsAcceptor::from(Arc::new(server_config)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn acceptor_from_generated_pem() {
        rustls::crypto::ring::default_provider()
            .install_default()
            .ok();
        let cert = rcgen::generate_simple_self_signed(vec!["localhost".to_string()]).unwrap();
        let cert_pem = cert.cert.pem();
        let key_pem = cert.key_pair.serialize_pem();
        acceptor_from_pem(cert_pem.as_bytes(), key_pem.as_bytes()).unwrap();
    }

    #[test]
    fn empty_certificate_list_is_rejected() {
        assert!(build_acceptor(&[]).is_err());
    }

    #[test]
    fn garbage_pem_is_rejected() {
        assert!(acceptor_from_pem(b"not pem", b"not pem").is_err());
    }
}

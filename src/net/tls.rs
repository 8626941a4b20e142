//! mTLS context construction and peer fingerprint extraction.
//!
//! Server contexts require and verify a client certificate against the
//! configured CA. Client contexts verify the server's certificate against
//! the same CA but explicitly skip the hostname/SAN check: KeyMesh nodes
//! authorize each other by certificate fingerprint, not by DNS name, so a
//! mismatch between the configured `addr` and the certificate's subject
//! name is expected and must not fail the handshake.

use std::sync::Arc;

use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName, UnixTime};
use rustls::server::WebPkiClientVerifier;
use rustls::{ClientConfig, RootCertStore, ServerConfig};
use sha2::{Digest, Sha256};

use crate::error::TlsError;

pub fn load_certs(path: &std::path::Path) -> Result<Vec<CertificateDer<'static>>, TlsError> {
    let bytes = std::fs::read(path)?;
    let mut reader = std::io::BufReader::new(bytes.as_slice());
    rustls_pemfile::certs(&mut reader)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| TlsError::Config(format!("failed to parse certs in {}: {e}", path.display())))
}

pub fn load_private_key(path: &std::path::Path) -> Result<PrivateKeyDer<'static>, TlsError> {
    let bytes = std::fs::read(path)?;
    let mut reader = std::io::BufReader::new(bytes.as_slice());
    if let Some(key) = rustls_pemfile::pkcs8_private_keys(&mut reader)
        .next()
        .transpose()
        .map_err(|e| TlsError::Config(e.to_string()))?
    {
        return Ok(PrivateKeyDer::Pkcs8(key));
    }
    let mut reader = std::io::BufReader::new(bytes.as_slice());
    if let Some(key) = rustls_pemfile::rsa_private_keys(&mut reader)
        .next()
        .transpose()
        .map_err(|e| TlsError::Config(e.to_string()))?
    {
        return Ok(PrivateKeyDer::Pkcs1(key));
    }
    Err(TlsError::Config(format!(
        "no supported private key found in {}",
        path.display()
    )))
}

fn root_store(ca_cert_path: &std::path::Path) -> Result<RootCertStore, TlsError> {
    let mut store = RootCertStore::empty();
    for cert in load_certs(ca_cert_path)? {
        store
            .add(cert)
            .map_err(|e| TlsError::Config(format!("invalid CA certificate: {e}")))?;
    }
    Ok(store)
}

/// CA-verified client cert required; hostname check is irrelevant for
/// client certificates so no special handling is needed on this side.
pub fn build_server_config(
    ca_cert: &std::path::Path,
    cert: &std::path::Path,
    key: &std::path::Path,
) -> Result<Arc<ServerConfig>, TlsError> {
    let roots = Arc::new(root_store(ca_cert)?);
    let client_verifier = WebPkiClientVerifier::builder(roots)
        .build()
        .map_err(|e| TlsError::Config(format!("failed to build client verifier: {e}")))?;

    let mut config = ServerConfig::builder()
        .with_client_cert_verifier(client_verifier)
        .with_single_cert(load_certs(cert)?, load_private_key(key)?)
        .map_err(|e| TlsError::Config(e.to_string()))?;
    config.alpn_protocols = vec![b"keymesh/1".to_vec()];
    Ok(Arc::new(config))
}

pub fn build_client_config(
    ca_cert: &std::path::Path,
    cert: &std::path::Path,
    key: &std::path::Path,
) -> Result<Arc<ClientConfig>, TlsError> {
    let roots = root_store(ca_cert)?;
    let verifier = Arc::new(NoHostnameVerifier::new(roots)?);

    let mut config = ClientConfig::builder()
        .dangerous()
        .with_custom_certificate_verifier(verifier)
        .with_client_auth_cert(load_certs(cert)?, load_private_key(key)?)
        .map_err(|e| TlsError::Config(e.to_string()))?;
    config.alpn_protocols = vec![b"keymesh/1".to_vec()];
    Ok(Arc::new(config))
}

/// A name we pass to rustls purely to satisfy its API surface — KeyMesh
/// does not authorize by DNS name, so the actual value is irrelevant as
/// long as the verifier below ignores name-mismatch failures.
pub fn placeholder_server_name() -> ServerName<'static> {
    ServerName::try_from("keymesh-peer").expect("static literal is a valid server name")
}

/// Wraps rustls's standard chain verifier but treats a name mismatch as
/// success: the chain must still lead to a trusted CA, only the hostname
/// binding is dropped, matching the "authorize by fingerprint, not DNS"
/// design.
#[derive(Debug)]
struct NoHostnameVerifier {
    inner: Arc<dyn rustls::client::danger::ServerCertVerifier>,
}

impl NoHostnameVerifier {
    fn new(roots: RootCertStore) -> Result<Self, TlsError> {
        let inner = rustls::client::WebPkiServerVerifier::builder(Arc::new(roots))
            .build()
            .map_err(|e| TlsError::Config(format!("failed to build server verifier: {e}")))?;
        Ok(Self { inner })
    }
}

impl rustls::client::danger::ServerCertVerifier for NoHostnameVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        intermediates: &[CertificateDer<'_>],
        server_name: &ServerName<'_>,
        ocsp_response: &[u8],
        now: UnixTime,
    ) -> Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        match self
            .inner
            .verify_server_cert(end_entity, intermediates, server_name, ocsp_response, now)
        {
            Ok(verified) => Ok(verified),
            Err(rustls::Error::InvalidCertificate(rustls::CertificateError::NotValidForName)) => {
                Ok(rustls::client::danger::ServerCertVerified::assertion())
            }
            Err(rustls::Error::InvalidCertificate(
                rustls::CertificateError::NotValidForNameContext { .. },
            )) => Ok(rustls::client::danger::ServerCertVerified::assertion()),
            Err(other) => Err(other),
        }
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        self.inner.verify_tls12_signature(message, cert, dss)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        self.inner.verify_tls13_signature(message, cert, dss)
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        self.inner.supported_verify_schemes()
    }
}

/// Fingerprint of the connection's peer (end-entity) certificate, if one
/// was presented. Works for both server- and client-side connections:
/// both expose `peer_certificates()` on the underlying rustls connection.
pub fn peer_fingerprint(peer_certificates: Option<&[CertificateDer<'_>]>) -> Option<String> {
    let certs = peer_certificates?;
    let end_entity = certs.first()?;
    Some(fingerprint_of_der(end_entity.as_ref()))
}

/// `"sha256:" + lowercase_hex(sha256(der_cert))`.
pub fn fingerprint_of_der(der: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(der);
    let digest = hasher.finalize();
    let hex: String = digest.iter().map(|b| format!("{b:02x}")).collect();
    format!("sha256:{hex}")
}

/// Case-insensitive, trim-insensitive whitelist membership check.
pub fn fingerprint_in_whitelist(fingerprint: &str, whitelist: &[String]) -> bool {
    let needle = fingerprint.trim().to_lowercase();
    whitelist
        .iter()
        .any(|w| w.trim().to_lowercase() == needle)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fingerprint_format_matches_contract() {
        let der = b"not a real certificate, just bytes for the test";
        let fp = fingerprint_of_der(der);
        assert!(fp.starts_with("sha256:"));
        assert_eq!(fp.len(), "sha256:".len() + 64);
    }

    #[test]
    fn whitelist_match_is_case_and_trim_insensitive() {
        let list = vec!["  SHA256:AABB  ".to_string()];
        assert!(fingerprint_in_whitelist("sha256:aabb", &list));
        assert!(!fingerprint_in_whitelist("sha256:ccdd", &list));
    }
}

use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::{ClientConfig, RootCertStore, ServerConfig};
use rustls_pemfile::{certs, private_key};
use std::io::Cursor;
use std::path::Path;

use crate::TunnelError;

fn read_pem(path: &Path, what: &str) -> Result<String, TunnelError> {
    std::fs::read_to_string(path).map_err(|e| {
        TunnelError::Certificate(format!("Failed to open {} file {:?}: {}", what, path, e))
    })
}

/// Load certificates from PEM content string
pub fn load_certs_from_pem(pem_content: &str) -> Result<Vec<CertificateDer<'static>>, TunnelError> {
    let mut cursor = Cursor::new(pem_content.as_bytes());
    let certs = certs(&mut cursor)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| TunnelError::Certificate(format!("Failed to parse certificates: {}", e)))?;
    if certs.is_empty() {
        return Err(TunnelError::Certificate(
            "No certificate found in PEM content".to_string(),
        ));
    }
    Ok(certs)
}

/// Load a private key from PEM content string
pub fn load_private_key_from_pem(pem_content: &str) -> Result<PrivateKeyDer<'static>, TunnelError> {
    let mut cursor = Cursor::new(pem_content.as_bytes());
    private_key(&mut cursor)
        .map_err(|e| TunnelError::Certificate(format!("Failed to parse private key: {}", e)))?
        .ok_or_else(|| TunnelError::Certificate("No private key found in PEM content".to_string()))
}

/// Load the ingress TLS config from certificate and key files.
///
/// Public clients are not asked for certificates; the broker only needs the
/// handshake to learn the SNI.
pub fn load_server_config(cert_path: &Path, key_path: &Path) -> Result<ServerConfig, TunnelError> {
    let cert_pem = read_pem(cert_path, "cert")?;
    let key_pem = read_pem(key_path, "key")?;
    load_server_config_from_pem(&cert_pem, &key_pem)
}

/// Same as [`load_server_config`], from PEM content strings
pub fn load_server_config_from_pem(
    cert_pem: &str,
    key_pem: &str,
) -> Result<ServerConfig, TunnelError> {
    let certs = load_certs_from_pem(cert_pem)?;
    let key = load_private_key_from_pem(key_pem)?;

    ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|e| TunnelError::Tls(format!("Failed to build server config: {}", e)))
}

/// Client TLS config trusting only the given CA certificates
pub fn load_client_config_from_pem(ca_pem: &str) -> Result<ClientConfig, TunnelError> {
    let mut root_store = RootCertStore::empty();
    for cert in load_certs_from_pem(ca_pem)? {
        root_store.add(cert).map_err(|e| {
            TunnelError::Certificate(format!("Failed to add CA certificate: {}", e))
        })?;
    }

    Ok(ClientConfig::builder()
        .with_root_certificates(root_store)
        .with_no_client_auth())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_pem_is_rejected() {
        assert!(matches!(
            load_certs_from_pem(""),
            Err(TunnelError::Certificate(_))
        ));
        assert!(matches!(
            load_private_key_from_pem("not a key"),
            Err(TunnelError::Certificate(_))
        ));
    }

    #[test]
    fn test_missing_files_are_reported() {
        let err = load_server_config(
            Path::new("/nonexistent/udig/cert.pem"),
            Path::new("/nonexistent/udig/key.pem"),
        )
        .unwrap_err();
        assert!(err.to_string().contains("cert.pem"));
    }
}

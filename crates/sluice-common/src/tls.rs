use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::{verify_tls12_signature, verify_tls13_signature, CryptoProvider};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName, UnixTime};
use rustls::{ClientConfig, DigitallySignedStruct, RootCertStore, ServerConfig, SignatureScheme};
use rustls_pemfile::{certs, private_key};
use std::io::Cursor;
use std::path::Path;
use std::sync::Arc;

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

fn load_root_store_from_pem(pem_content: &str) -> Result<RootCertStore, TunnelError> {
    let ca_certs = load_certs_from_pem(pem_content)?;
    let mut root_store = RootCertStore::empty();
    for cert in ca_certs {
        root_store.add(cert).map_err(|e| {
            TunnelError::Certificate(format!("Failed to add CA certificate: {}", e))
        })?;
    }
    Ok(root_store)
}

/// Load server TLS config for the public listener from PEM content
///
/// Clients are not asked for certificates; tunnel clients authenticate with
/// their authtoken inside the control protocol.
pub fn load_server_config_from_pem(
    cert_pem: &str,
    key_pem: &str,
) -> Result<ServerConfig, TunnelError> {
    let certs = load_certs_from_pem(cert_pem)?;
    let key = load_private_key_from_pem(key_pem)?;

    let mut config = ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|e| TunnelError::Tls(format!("Failed to build server config: {}", e)))?;

    // The listener speaks HTTP/1.1 only (control upgrades depend on it)
    config.alpn_protocols = vec![b"http/1.1".to_vec()];

    Ok(config)
}

/// Load server TLS config from certificate and key files
pub fn load_server_config(cert_path: &Path, key_path: &Path) -> Result<ServerConfig, TunnelError> {
    let cert_pem = read_pem(cert_path, "cert")?;
    let key_pem = read_pem(key_path, "key")?;
    load_server_config_from_pem(&cert_pem, &key_pem)
}

/// Load client TLS config trusting `ca_pem`, or the bundled web PKI roots
/// when no CA is given
pub fn load_client_config_from_pem(ca_pem: Option<&str>) -> Result<ClientConfig, TunnelError> {
    let root_store = match ca_pem {
        Some(pem) => load_root_store_from_pem(pem)?,
        None => {
            let mut roots = RootCertStore::empty();
            roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
            roots
        }
    };

    let config = ClientConfig::builder()
        .with_root_certificates(root_store)
        .with_no_client_auth();

    Ok(config)
}

/// Load client TLS config from an optional CA file
pub fn load_client_config(ca_path: Option<&Path>) -> Result<ClientConfig, TunnelError> {
    match ca_path {
        Some(path) => {
            let pem = read_pem(path, "CA")?;
            load_client_config_from_pem(Some(&pem))
        }
        None => load_client_config_from_pem(None),
    }
}

/// Accepts any certificate chain while still checking handshake signatures
#[derive(Debug)]
struct SkipServerVerification(Arc<CryptoProvider>);

impl ServerCertVerifier for SkipServerVerification {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls12_signature(message, cert, dss, &self.0.signature_verification_algorithms)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls13_signature(message, cert, dss, &self.0.signature_verification_algorithms)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.0.signature_verification_algorithms.supported_schemes()
    }
}

/// Client TLS config for dialing a local HTTPS service
///
/// Trusts the web PKI roots, or any certificate at all when `skip_verify`
/// is set (local services commonly run on self-signed certificates).
pub fn upstream_client_config(skip_verify: bool) -> Result<ClientConfig, TunnelError> {
    let mut config = if skip_verify {
        let provider = Arc::new(rustls::crypto::ring::default_provider());
        ClientConfig::builder()
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(SkipServerVerification(provider)))
            .with_no_client_auth()
    } else {
        load_client_config_from_pem(None)?
    };

    // Requests are relayed as raw HTTP/1.1 bytes
    config.alpn_protocols = vec![b"http/1.1".to_vec()];
    Ok(config)
}

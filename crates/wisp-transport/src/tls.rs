//! TLS upgrade
//!
//! The protocol negotiates TLS in-band: the client reads the server's INFO
//! on the plain TCP stream, and only then wraps the same stream in TLS.
//! [`upgrade`] performs that wrap.

use std::sync::Arc;

use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName};
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;
use tracing::{debug, info, warn};

use crate::error::{Result, TransportError};

/// Certificate verification mode
#[derive(Debug, Clone, Default)]
pub enum CertVerification {
    /// Skip certificate verification (testing only)
    SkipVerification,
    /// Use system root certificates
    #[default]
    SystemRoots,
    /// Use custom root certificates (DER)
    CustomRoots(Vec<Vec<u8>>),
}

/// Client certificate and key (DER)
#[derive(Debug, Clone)]
pub struct ClientCert {
    pub cert_chain: Vec<Vec<u8>>,
    pub key: Vec<u8>,
}

/// TLS configuration for the upgrade
#[derive(Debug, Clone, Default)]
pub struct TlsConfig {
    pub cert_verification: CertVerification,
    pub client_cert: Option<ClientCert>,
}

impl TlsConfig {
    pub fn has_client_cert(&self) -> bool {
        self.client_cert.is_some()
    }
}

/// Wrap an established TCP stream in TLS
pub async fn upgrade(
    stream: TcpStream,
    host: &str,
    config: &TlsConfig,
) -> Result<tokio_rustls::client::TlsStream<TcpStream>> {
    let client_config = build_client_config(config)?;
    let connector = TlsConnector::from(Arc::new(client_config));
    let server_name = ServerName::try_from(host.to_string())
        .map_err(|e| TransportError::TlsFailed(format!("invalid server name: {e}")))?;

    let tls = connector
        .connect(server_name, stream)
        .await
        .map_err(|e| TransportError::TlsFailed(e.to_string()))?;

    info!("tls established with {}", host);
    Ok(tls)
}

fn build_client_config(config: &TlsConfig) -> Result<rustls::ClientConfig> {
    let builder = match &config.cert_verification {
        CertVerification::SkipVerification => {
            // WARNING: vulnerable to MITM - testing only
            warn!("tls certificate verification disabled");
            rustls::ClientConfig::builder()
                .dangerous()
                .with_custom_certificate_verifier(Arc::new(SkipServerVerification))
        }
        CertVerification::SystemRoots => {
            let mut root_store = rustls::RootCertStore::empty();
            let cert_result = rustls_native_certs::load_native_certs();
            for err in &cert_result.errors {
                debug!("certificate loading error: {}", err);
            }
            for cert in cert_result.certs {
                if let Err(e) = root_store.add(cert) {
                    debug!("failed to add system cert: {}", e);
                }
            }
            if root_store.is_empty() {
                return Err(TransportError::TlsFailed(
                    "no root certificates available".to_string(),
                ));
            }
            rustls::ClientConfig::builder().with_root_certificates(root_store)
        }
        CertVerification::CustomRoots(certs) => {
            let mut root_store = rustls::RootCertStore::empty();
            for cert_der in certs {
                let cert = CertificateDer::from(cert_der.clone());
                if let Err(e) = root_store.add(cert) {
                    warn!("failed to add custom cert: {}", e);
                }
            }
            if root_store.is_empty() {
                return Err(TransportError::TlsFailed(
                    "no valid custom certificates provided".to_string(),
                ));
            }
            rustls::ClientConfig::builder().with_root_certificates(root_store)
        }
    };

    let client_config = match &config.client_cert {
        Some(client_cert) => {
            let chain: Vec<CertificateDer<'static>> = client_cert
                .cert_chain
                .iter()
                .map(|der| CertificateDer::from(der.clone()))
                .collect();
            let key = PrivateKeyDer::try_from(client_cert.key.clone())
                .map_err(|e| TransportError::TlsFailed(format!("invalid private key: {e}")))?;
            builder
                .with_client_auth_cert(chain, key)
                .map_err(|e| TransportError::TlsFailed(e.to_string()))?
        }
        None => builder.with_no_client_auth(),
    };

    Ok(client_config)
}

#[derive(Debug)]
struct SkipServerVerification;

impl rustls::client::danger::ServerCertVerifier for SkipServerVerification {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: rustls::pki_types::UnixTime,
    ) -> std::result::Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> std::result::Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> std::result::Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        vec![
            rustls::SignatureScheme::RSA_PKCS1_SHA256,
            rustls::SignatureScheme::ECDSA_NISTP256_SHA256,
            rustls::SignatureScheme::RSA_PKCS1_SHA384,
            rustls::SignatureScheme::ECDSA_NISTP384_SHA384,
            rustls::SignatureScheme::RSA_PKCS1_SHA512,
            rustls::SignatureScheme::ECDSA_NISTP521_SHA512,
            rustls::SignatureScheme::RSA_PSS_SHA256,
            rustls::SignatureScheme::RSA_PSS_SHA384,
            rustls::SignatureScheme::RSA_PSS_SHA512,
            rustls::SignatureScheme::ED25519,
        ]
    }
}

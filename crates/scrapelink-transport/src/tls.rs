//! TLS credential construction

use crate::{TransportError, TransportResult};
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;

/// Credential material for a TLS channel
///
/// Missing paths fall back to defaults: no trust collection means the
/// webpki root set, no cert chain/key pair means no client authentication.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TlsSettings {
    pub cert_chain_path: Option<String>,
    pub private_key_path: Option<String>,
    pub trust_cert_collection_path: Option<String>,
}

impl TlsSettings {
    /// Build settings from possibly-empty paths, empty meaning "not supplied"
    pub fn from_paths(cert_chain: &str, private_key: &str, trust_collection: &str) -> Self {
        fn non_empty(path: &str) -> Option<String> {
            (!path.is_empty()).then(|| path.to_string())
        }

        Self {
            cert_chain_path: non_empty(cert_chain),
            private_key_path: non_empty(private_key),
            trust_cert_collection_path: non_empty(trust_collection),
        }
    }

    /// True when any credential path was supplied
    pub fn has_material(&self) -> bool {
        self.cert_chain_path.is_some()
            || self.private_key_path.is_some()
            || self.trust_cert_collection_path.is_some()
    }

    /// Build a rustls connector from these settings
    pub fn build_connector(&self) -> TransportResult<tokio_rustls::TlsConnector> {
        crate::ensure_crypto_provider();

        let mut roots = rustls::RootCertStore::empty();

        match &self.trust_cert_collection_path {
            Some(path) => {
                for cert in load_certs(Path::new(path))? {
                    roots.add(cert).map_err(|e| {
                        TransportError::ConfigurationError(format!("Invalid root cert: {}", e))
                    })?;
                }
            }
            None => roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned()),
        }

        let builder = rustls::ClientConfig::builder().with_root_certificates(roots);

        let client_crypto = match (&self.cert_chain_path, &self.private_key_path) {
            (Some(cert_path), Some(key_path)) => {
                let certs = load_certs(Path::new(cert_path))?;
                let key = load_private_key(Path::new(key_path))?;
                builder
                    .with_client_auth_cert(certs, key)
                    .map_err(|e| TransportError::TlsError(format!("Invalid cert/key: {}", e)))?
            }
            (None, None) => builder.with_no_client_auth(),
            _ => {
                return Err(TransportError::ConfigurationError(
                    "Cert chain and private key must be supplied together".to_string(),
                ))
            }
        };

        Ok(tokio_rustls::TlsConnector::from(Arc::new(client_crypto)))
    }
}

/// Transport security for a channel
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum TlsMode {
    #[default]
    Plaintext,
    Tls(TlsSettings),
}

impl TlsMode {
    pub fn is_tls(&self) -> bool {
        matches!(self, TlsMode::Tls(_))
    }

    /// Short description for connection logs
    pub fn desc(&self) -> &'static str {
        match self {
            TlsMode::Plaintext => "plaintext",
            TlsMode::Tls(settings) if settings.cert_chain_path.is_some() => "TLS (mutual)",
            TlsMode::Tls(_) => "TLS",
        }
    }
}

// Helper functions for loading certificates

fn load_certs(path: &Path) -> TransportResult<Vec<CertificateDer<'static>>> {
    let file = File::open(path)
        .map_err(|e| TransportError::TlsError(format!("Failed to open cert file: {}", e)))?;
    let mut reader = BufReader::new(file);

    rustls_pemfile::certs(&mut reader)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| TransportError::TlsError(format!("Failed to parse certs: {}", e)))
}

fn load_private_key(path: &Path) -> TransportResult<PrivateKeyDer<'static>> {
    let file = File::open(path)
        .map_err(|e| TransportError::TlsError(format!("Failed to open key file: {}", e)))?;
    let mut reader = BufReader::new(file);

    rustls_pemfile::private_key(&mut reader)
        .map_err(|e| TransportError::TlsError(format!("Failed to parse key: {}", e)))?
        .ok_or_else(|| TransportError::TlsError("No private key found".to_string()))
}

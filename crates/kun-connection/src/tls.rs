//! TLS configuration for the backend, peer and frontend listeners

use crate::transport::TransportError;
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::CryptoProvider;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName, UnixTime};
use rustls::server::WebPkiClientVerifier;
use rustls::{ClientConfig, DigitallySignedStruct, RootCertStore, ServerConfig, SignatureScheme};
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use tokio_rustls::{TlsAcceptor, TlsConnector};
use tracing::warn;

/// How a TLS listener treats client certificates
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClientAuthMode {
    /// Do not ask for a client certificate
    #[default]
    Request,
    /// A client certificate is mandatory
    Require,
    /// Verify a client certificate when one is presented
    VerifyIfGiven,
    /// A client certificate is mandatory and must chain to the configured roots
    RequireAndVerify,
}

impl ClientAuthMode {
    pub const ALLOWED: [&'static str; 4] =
        ["request", "require", "verify_if_given", "require_and_verify"];

    pub fn as_str(&self) -> &'static str {
        match self {
            ClientAuthMode::Request => "request",
            ClientAuthMode::Require => "require",
            ClientAuthMode::VerifyIfGiven => "verify_if_given",
            ClientAuthMode::RequireAndVerify => "require_and_verify",
        }
    }
}

impl FromStr for ClientAuthMode {
    type Err = TransportError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "request" => Ok(ClientAuthMode::Request),
            "require" => Ok(ClientAuthMode::Require),
            "verify_if_given" => Ok(ClientAuthMode::VerifyIfGiven),
            "require_and_verify" => Ok(ClientAuthMode::RequireAndVerify),
            other => Err(TransportError::TlsError(format!(
                "unknown client auth mode {:?}, expected one of {}",
                other,
                Self::ALLOWED.join(", ")
            ))),
        }
    }
}

/// Server-side TLS material
#[derive(Debug, Clone)]
pub struct ServerTlsConfig {
    pub cert_file: PathBuf,
    pub key_file: PathBuf,
    pub client_ca_files: Vec<PathBuf>,
    pub client_auth: ClientAuthMode,
}

impl ServerTlsConfig {
    pub fn new(cert_file: impl Into<PathBuf>, key_file: impl Into<PathBuf>) -> Self {
        Self {
            cert_file: cert_file.into(),
            key_file: key_file.into(),
            client_ca_files: Vec::new(),
            client_auth: ClientAuthMode::Request,
        }
    }

    pub fn with_client_auth(mut self, mode: ClientAuthMode, ca_files: Vec<PathBuf>) -> Self {
        self.client_auth = mode;
        self.client_ca_files = ca_files;
        self
    }

    pub fn build(&self) -> Result<Arc<ServerConfig>, TransportError> {
        let certs = load_certs(&self.cert_file)?;
        let key = load_private_key(&self.key_file)?;
        let provider = crypto_provider();

        let builder = ServerConfig::builder_with_provider(provider.clone())
            .with_safe_default_protocol_versions()
            .map_err(|e| TransportError::TlsError(e.to_string()))?;

        let builder = match self.client_auth {
            ClientAuthMode::Request => builder.with_no_client_auth(),
            mode => {
                let roots = Arc::new(load_root_store(&self.client_ca_files)?);
                if roots.is_empty() {
                    return Err(TransportError::TlsError(format!(
                        "client auth mode {} needs at least one root CA file",
                        mode.as_str()
                    )));
                }
                let verifier = WebPkiClientVerifier::builder_with_provider(roots, provider);
                let verifier = if mode == ClientAuthMode::VerifyIfGiven {
                    verifier.allow_unauthenticated()
                } else {
                    verifier
                };
                let verifier = verifier
                    .build()
                    .map_err(|e| TransportError::TlsError(e.to_string()))?;
                builder.with_client_cert_verifier(verifier)
            }
        };

        let config = builder
            .with_single_cert(certs, key)
            .map_err(|e| TransportError::TlsError(format!("Invalid cert/key: {}", e)))?;

        Ok(Arc::new(config))
    }

    pub fn acceptor(&self) -> Result<TlsAcceptor, TransportError> {
        Ok(TlsAcceptor::from(self.build()?))
    }
}

/// Client-side TLS material
#[derive(Debug, Clone, Default)]
pub struct ClientTlsConfig {
    /// Trusted roots; the bundled web PKI roots are used when empty
    pub root_ca_files: Vec<PathBuf>,
    pub cert_file: Option<PathBuf>,
    pub key_file: Option<PathBuf>,
    /// Skip server certificate verification (INSECURE - only for testing!)
    pub insecure_skip_verify: bool,
}

impl ClientTlsConfig {
    pub fn build(&self) -> Result<Arc<ClientConfig>, TransportError> {
        let provider = crypto_provider();
        let builder = ClientConfig::builder_with_provider(provider)
            .with_safe_default_protocol_versions()
            .map_err(|e| TransportError::TlsError(e.to_string()))?;

        let builder = if self.insecure_skip_verify {
            warn!("TLS server certificate verification is disabled");
            builder
                .dangerous()
                .with_custom_certificate_verifier(SkipVerification::new())
        } else {
            let roots = if self.root_ca_files.is_empty() {
                let mut roots = RootCertStore::empty();
                roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
                roots
            } else {
                load_root_store(&self.root_ca_files)?
            };
            builder.with_root_certificates(roots)
        };

        let config = match (&self.cert_file, &self.key_file) {
            (Some(cert), Some(key)) => builder
                .with_client_auth_cert(load_certs(cert)?, load_private_key(key)?)
                .map_err(|e| TransportError::TlsError(format!("Invalid client cert/key: {}", e)))?,
            (None, None) => builder.with_no_client_auth(),
            _ => {
                return Err(TransportError::TlsError(
                    "client certificate and key must be given together".to_string(),
                ))
            }
        };

        Ok(Arc::new(config))
    }

    pub fn connector(&self) -> Result<TlsConnector, TransportError> {
        Ok(TlsConnector::from(self.build()?))
    }
}

fn crypto_provider() -> Arc<CryptoProvider> {
    Arc::new(rustls::crypto::ring::default_provider())
}

pub fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>, TransportError> {
    let file = File::open(path).map_err(|e| {
        TransportError::TlsError(format!("Failed to open cert file {}: {}", path.display(), e))
    })?;
    let mut reader = BufReader::new(file);

    let certs = rustls_pemfile::certs(&mut reader)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| TransportError::TlsError(format!("Failed to parse certs: {}", e)))?;

    if certs.is_empty() {
        return Err(TransportError::TlsError(format!(
            "No certificates found in {}",
            path.display()
        )));
    }

    Ok(certs)
}

pub fn load_private_key(path: &Path) -> Result<PrivateKeyDer<'static>, TransportError> {
    let file = File::open(path).map_err(|e| {
        TransportError::TlsError(format!("Failed to open key file {}: {}", path.display(), e))
    })?;
    let mut reader = BufReader::new(file);

    rustls_pemfile::private_key(&mut reader)
        .map_err(|e| TransportError::TlsError(format!("Failed to parse key: {}", e)))?
        .ok_or_else(|| TransportError::TlsError("No private key found".to_string()))
}

fn load_root_store(files: &[PathBuf]) -> Result<RootCertStore, TransportError> {
    let mut roots = RootCertStore::empty();
    for file in files {
        for cert in load_certs(file)? {
            roots
                .add(cert)
                .map_err(|e| TransportError::TlsError(format!("Invalid root cert: {}", e)))?;
        }
    }
    Ok(roots)
}

// Certificate verifier that skips verification (INSECURE - only for testing!)
#[derive(Debug)]
struct SkipVerification;

impl SkipVerification {
    fn new() -> Arc<Self> {
        Arc::new(Self)
    }
}

impl ServerCertVerifier for SkipVerification {
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
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        rustls::crypto::ring::default_provider()
            .signature_verification_algorithms
            .supported_schemes()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_self_signed(dir: &Path) -> (PathBuf, PathBuf) {
        let cert = rcgen::generate_simple_self_signed(vec!["localhost".to_string()]).unwrap();
        let cert_path = dir.join("server.crt");
        let key_path = dir.join("server.key");
        File::create(&cert_path)
            .unwrap()
            .write_all(cert.cert.pem().as_bytes())
            .unwrap();
        File::create(&key_path)
            .unwrap()
            .write_all(cert.key_pair.serialize_pem().as_bytes())
            .unwrap();
        (cert_path, key_path)
    }

    #[test]
    fn test_client_auth_mode_parse() {
        assert_eq!(
            "request".parse::<ClientAuthMode>().unwrap(),
            ClientAuthMode::Request
        );
        assert_eq!(
            "REQUIRE_AND_VERIFY".parse::<ClientAuthMode>().unwrap(),
            ClientAuthMode::RequireAndVerify
        );
        assert!("sometimes".parse::<ClientAuthMode>().is_err());
        for name in ClientAuthMode::ALLOWED {
            assert_eq!(name.parse::<ClientAuthMode>().unwrap().as_str(), name);
        }
    }

    #[test]
    fn test_server_config_from_pem_files() {
        let dir = tempfile::tempdir().unwrap();
        let (cert, key) = write_self_signed(dir.path());

        let config = ServerTlsConfig::new(&cert, &key);
        assert!(config.build().is_ok());
    }

    #[test]
    fn test_verify_mode_needs_roots() {
        let dir = tempfile::tempdir().unwrap();
        let (cert, key) = write_self_signed(dir.path());

        let config = ServerTlsConfig::new(&cert, &key)
            .with_client_auth(ClientAuthMode::RequireAndVerify, Vec::new());
        assert!(config.build().is_err());

        let config = ServerTlsConfig::new(&cert, &key)
            .with_client_auth(ClientAuthMode::VerifyIfGiven, vec![cert.clone()]);
        assert!(config.build().is_ok());
    }

    #[test]
    fn test_missing_files() {
        let result = load_certs(Path::new("/nonexistent/server.crt"));
        assert!(matches!(result, Err(TransportError::TlsError(_))));
    }

    #[test]
    fn test_client_cert_pairing() {
        let config = ClientTlsConfig {
            cert_file: Some(PathBuf::from("client.crt")),
            ..Default::default()
        };
        assert!(config.build().is_err());

        let insecure = ClientTlsConfig {
            insecure_skip_verify: true,
            ..Default::default()
        };
        assert!(insecure.build().is_ok());
    }
}

//! TLS context construction from PEM credentials
//!
//! Builds a rustls client configuration that trusts only the supplied CA
//! bundle and presents the supplied certificate/key pair for mutual
//! authentication. There is no server side here, so no peer certificate is
//! ever requested from anyone connecting to us.

use crate::config::{ConfigError, CredentialPaths};
use rumqttc::{TlsConfiguration, Transport as RumqttcTransport};
use rustls::crypto::ring::{default_provider, sign::any_supported_type};
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::{ClientConfig, RootCertStore, SignatureScheme};
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tracing::debug;

const KEY_PAIR_PROBE: &[u8] = b"heartrate-mqtt key pair probe";

/// Errors raised while turning PEM material into a TLS context
#[derive(Debug, Error)]
pub enum CertificateError {
    #[error("No certificates found in {0}")]
    NoCertificates(String),
    #[error("Malformed PEM in {what}: {source}")]
    MalformedPem {
        what: String,
        #[source]
        source: std::io::Error,
    },
    #[error("Invalid CA certificate: {0}")]
    InvalidRootCertificate(#[source] rustls::Error),
    #[error("Invalid client certificate: {0}")]
    InvalidClientCertificate(#[source] webpki::Error),
    #[error("No private key found in client key file")]
    NoPrivateKey,
    #[error("Unsupported private key: {0}")]
    UnsupportedKey(#[source] rustls::Error),
    #[error("Client certificate does not match private key")]
    KeyMismatch,
    #[error("TLS configuration rejected: {0}")]
    Rejected(#[source] rustls::Error),
}

/// Raw PEM contents of the three credential files
#[derive(Clone)]
pub struct CredentialBundle {
    root_ca: Vec<u8>,
    client_cert: Vec<u8>,
    client_key: Vec<u8>,
}

impl std::fmt::Debug for CredentialBundle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CredentialBundle")
            .field("root_ca_bytes", &self.root_ca.len())
            .field("client_cert_bytes", &self.client_cert.len())
            .field("client_key", &"<redacted>")
            .finish()
    }
}

impl CredentialBundle {
    /// Read the CA bundle, client certificate and client key from disk
    pub fn load(root_ca: &Path, client_cert: &Path, client_key: &Path) -> Result<Self, ConfigError> {
        Ok(Self {
            root_ca: read_credential(root_ca)?,
            client_cert: read_credential(client_cert)?,
            client_key: read_credential(client_key)?,
        })
    }

    /// Read the bundle from configured paths
    pub fn from_paths(paths: &CredentialPaths) -> Result<Self, ConfigError> {
        Self::load(&paths.root_ca, &paths.client_cert, &paths.client_key)
    }

    /// Build a bundle from in-memory PEM contents
    pub fn from_pem(root_ca: Vec<u8>, client_cert: Vec<u8>, client_key: Vec<u8>) -> Self {
        Self {
            root_ca,
            client_cert,
            client_key,
        }
    }
}

fn read_credential(path: &Path) -> Result<Vec<u8>, ConfigError> {
    std::fs::read(path).map_err(|source| ConfigError::CredentialRead {
        path: PathBuf::from(path),
        source,
    })
}

/// Validated TLS client configuration, ready to hand to the broker session
#[derive(Clone)]
pub struct TlsContext {
    config: Arc<ClientConfig>,
    root_count: usize,
    client_chain: Vec<CertificateDer<'static>>,
}

impl std::fmt::Debug for TlsContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TlsContext")
            .field("root_count", &self.root_count)
            .field("client_chain_len", &self.client_chain.len())
            .finish()
    }
}

impl TlsContext {
    /// Load credentials from disk and build the context in one step
    pub fn load(paths: &CredentialPaths) -> Result<Self, crate::error::AppError> {
        let bundle = CredentialBundle::from_paths(paths)?;
        Ok(Self::from_bundle(&bundle)?)
    }

    /// Parse and validate a credential bundle
    ///
    /// Nothing is returned unless every certificate parses and the private
    /// key belongs to the leaf certificate.
    pub fn from_bundle(bundle: &CredentialBundle) -> Result<Self, CertificateError> {
        let roots = parse_certificates(&bundle.root_ca, "CA bundle")?;
        let mut root_store = RootCertStore::empty();
        for cert in roots {
            root_store
                .add(cert)
                .map_err(CertificateError::InvalidRootCertificate)?;
        }
        let root_count = root_store.len();

        let client_chain = parse_certificates(&bundle.client_cert, "client certificate")?;
        let client_key = parse_private_key(&bundle.client_key)?;
        verify_key_pair(&client_chain[0], &client_key)?;

        let config = ClientConfig::builder()
            .with_root_certificates(root_store)
            .with_client_auth_cert(client_chain.clone(), client_key)
            .map_err(CertificateError::Rejected)?;

        debug!(
            root_count,
            chain_len = client_chain.len(),
            "TLS context built"
        );

        Ok(Self {
            config: Arc::new(config),
            root_count,
            client_chain,
        })
    }

    /// Number of trust anchors parsed from the CA bundle
    pub fn root_count(&self) -> usize {
        self.root_count
    }

    /// Certificate chain presented to the broker, leaf first
    pub fn client_chain(&self) -> &[CertificateDer<'static>] {
        &self.client_chain
    }

    /// Wrap the context as a rumqttc TLS transport
    pub fn into_transport(self) -> RumqttcTransport {
        RumqttcTransport::tls_with_config(TlsConfiguration::Rustls(self.config))
    }
}

fn parse_certificates(
    pem: &[u8],
    what: &str,
) -> Result<Vec<CertificateDer<'static>>, CertificateError> {
    let mut reader = BufReader::new(pem);
    let certs = rustls_pemfile::certs(&mut reader)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|source| CertificateError::MalformedPem {
            what: what.to_string(),
            source,
        })?;

    if certs.is_empty() {
        return Err(CertificateError::NoCertificates(what.to_string()));
    }
    Ok(certs)
}

fn parse_private_key(pem: &[u8]) -> Result<PrivateKeyDer<'static>, CertificateError> {
    let mut reader = BufReader::new(pem);
    rustls_pemfile::private_key(&mut reader)
        .map_err(|source| CertificateError::MalformedPem {
            what: "client key".to_string(),
            source,
        })?
        .ok_or(CertificateError::NoPrivateKey)
}

/// Sign a probe with the private key and check it against the leaf's public key
fn verify_key_pair(
    leaf: &CertificateDer<'_>,
    key: &PrivateKeyDer<'_>,
) -> Result<(), CertificateError> {
    let end_entity = webpki::EndEntityCert::try_from(leaf)
        .map_err(CertificateError::InvalidClientCertificate)?;

    let signing_key = any_supported_type(key).map_err(CertificateError::UnsupportedKey)?;
    let algorithms = default_provider().signature_verification_algorithms;
    let offered: Vec<SignatureScheme> = algorithms.mapping.iter().map(|(s, _)| *s).collect();

    let signer = signing_key
        .choose_scheme(&offered)
        .ok_or(CertificateError::KeyMismatch)?;
    let scheme = signer.scheme();
    let signature = signer
        .sign(KEY_PAIR_PROBE)
        .map_err(CertificateError::UnsupportedKey)?;

    let candidates = algorithms
        .mapping
        .iter()
        .find(|(s, _)| *s == scheme)
        .map(|(_, algs)| *algs)
        .unwrap_or_default();

    if candidates
        .iter()
        .any(|alg| end_entity.verify_signature(*alg, KEY_PAIR_PROBE, &signature).is_ok())
    {
        Ok(())
    } else {
        Err(CertificateError::KeyMismatch)
    }
}

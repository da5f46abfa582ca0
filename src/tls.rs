//! TLS context construction from key store and trust store material
//!
//! Everything here is local file work and runs before any network call. A
//! failure is a [`SecurityConfigError`], which the supervisor never retries.

use crate::config::{StoreSection, TlsSection};
use p12_keystore::KeyStore;
use rustls_pemfile::{certs, pkcs8_private_keys};
use std::fmt;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, warn};

pub const DEFAULT_KEY_STORE_TYPE: &str = "PKCS12";
pub const DEFAULT_TRUST_STORE_TYPE: &str = "PEM";
pub const DEFAULT_MANAGER_ALGORITHM: &str = "PKIX";

/// Key and trust manager algorithm names accepted for compatibility with
/// existing deployments. Verification itself is always PKIX path building.
const SUPPORTED_ALGORITHMS: &[&str] = &["PKIX", "SunX509", "X509", "IbmX509", "NewSunX509"];

/// TLS configuration errors
#[derive(Debug, Error)]
pub enum SecurityConfigError {
    #[error("{0} is required when TLS is enabled")]
    MissingField(&'static str),

    #[error("cannot read {}: {source}", path.display())]
    Unreadable {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("{} is not a valid {store_type} store: {reason}", path.display())]
    InvalidStore {
        path: PathBuf,
        store_type: String,
        reason: String,
    },

    #[error("unsupported {role} store type '{store_type}'")]
    UnsupportedStoreType {
        role: &'static str,
        store_type: String,
    },

    #[error("unsupported TLS protocol '{0}'")]
    UnsupportedProtocol(String),

    #[error("unsupported {role} manager algorithm '{algorithm}'")]
    UnsupportedAlgorithm {
        role: &'static str,
        algorithm: String,
    },
}

/// TLS protocol version
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TlsProtocol {
    TlsV12,
    TlsV13,
    /// Highest version both sides support
    Tls,
}

impl TlsProtocol {
    pub fn parse(name: &str) -> Result<Self, SecurityConfigError> {
        match name.trim().to_ascii_uppercase().as_str() {
            "" | "TLSV1.2" => Ok(TlsProtocol::TlsV12),
            "TLSV1.3" => Ok(TlsProtocol::TlsV13),
            "TLS" => Ok(TlsProtocol::Tls),
            _ => Err(SecurityConfigError::UnsupportedProtocol(name.to_string())),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TlsProtocol::TlsV12 => "TLSv1.2",
            TlsProtocol::TlsV13 => "TLSv1.3",
            TlsProtocol::Tls => "TLS",
        }
    }
}

/// Client certificate and private key presented to the broker
#[derive(Clone)]
pub enum ClientIdentity {
    /// DER-encoded PKCS#12 archive
    Pkcs12 { der: Vec<u8>, password: String },
    /// PEM certificate chain and PKCS#8 private key
    Pem { cert_pem: Vec<u8>, key_pem: Vec<u8> },
}

impl fmt::Debug for ClientIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ClientIdentity::Pkcs12 { der, .. } => f
                .debug_struct("Pkcs12")
                .field("der_len", &der.len())
                .finish_non_exhaustive(),
            ClientIdentity::Pem { cert_pem, .. } => f
                .debug_struct("Pem")
                .field("cert_len", &cert_pem.len())
                .finish_non_exhaustive(),
        }
    }
}

/// Ready-to-use TLS material, independent of any connection
#[derive(Debug, Clone)]
pub struct TlsContext {
    pub protocol: TlsProtocol,
    pub identity: ClientIdentity,
    /// PEM bundle of trusted CA certificates
    pub trust_chain_pem: Option<String>,
    pub key_manager_algorithm: String,
    pub trust_manager_algorithm: String,
}

/// Builds a [`TlsContext`] from the `[tls]` configuration table
pub struct TlsContextBuilder;

impl TlsContextBuilder {
    pub fn build(section: &TlsSection) -> Result<TlsContext, SecurityConfigError> {
        let protocol = TlsProtocol::parse(&section.protocol)?;
        let key_manager_algorithm = validate_algorithm("key", &section.key_store)?;
        let trust_manager_algorithm = validate_algorithm("trust", &section.trust_store)?;

        let key_path = section
            .key_store
            .path
            .as_deref()
            .ok_or(SecurityConfigError::MissingField("tls.key_store.path"))?;
        let key_password = section
            .key_store
            .password
            .as_deref()
            .filter(|p| !p.is_empty())
            .ok_or(SecurityConfigError::MissingField("tls.key_store.password"))?;
        let trust_path = section
            .trust_store
            .path
            .as_deref()
            .ok_or(SecurityConfigError::MissingField("tls.trust_store.path"))?;

        let identity = load_identity(&section.key_store, key_path, key_password)?;
        let trust_chain_pem = load_trust_chain(&section.trust_store, trust_path)?;

        debug!(
            protocol = protocol.as_str(),
            key_store = %key_path.display(),
            trust_store = %trust_path.display(),
            "TLS context built"
        );

        Ok(TlsContext {
            protocol,
            identity,
            trust_chain_pem: Some(trust_chain_pem),
            key_manager_algorithm,
            trust_manager_algorithm,
        })
    }
}

fn validate_algorithm(
    role: &'static str,
    store: &StoreSection,
) -> Result<String, SecurityConfigError> {
    let algorithm = store
        .algorithm
        .as_deref()
        .filter(|a| !a.trim().is_empty())
        .unwrap_or(DEFAULT_MANAGER_ALGORITHM);

    SUPPORTED_ALGORITHMS
        .iter()
        .find(|known| known.eq_ignore_ascii_case(algorithm))
        .map(|known| known.to_string())
        .ok_or_else(|| SecurityConfigError::UnsupportedAlgorithm {
            role,
            algorithm: algorithm.to_string(),
        })
}

fn read_store(path: &Path) -> Result<Vec<u8>, SecurityConfigError> {
    std::fs::read(path).map_err(|source| SecurityConfigError::Unreadable {
        path: path.to_path_buf(),
        source,
    })
}

fn invalid_store(path: &Path, store_type: &str, reason: impl Into<String>) -> SecurityConfigError {
    SecurityConfigError::InvalidStore {
        path: path.to_path_buf(),
        store_type: store_type.to_string(),
        reason: reason.into(),
    }
}

fn load_identity(
    store: &StoreSection,
    path: &Path,
    password: &str,
) -> Result<ClientIdentity, SecurityConfigError> {
    let store_type = store
        .store_type
        .as_deref()
        .unwrap_or(DEFAULT_KEY_STORE_TYPE)
        .to_ascii_uppercase();

    match store_type.as_str() {
        "PKCS12" | "P12" => {
            let der = read_store(path)?;
            // Checks the MAC with the password and decrypts every bag
            let archive = KeyStore::from_pkcs12(&der, password)
                .map_err(|e| invalid_store(path, "PKCS12", format!("cannot open archive: {e}")))?;
            if archive.private_key_chain().is_none() {
                return Err(invalid_store(path, "PKCS12", "no private key entry"));
            }
            Ok(ClientIdentity::Pkcs12 {
                der,
                password: password.to_string(),
            })
        }
        "PEM" => {
            let pem = read_store(path)?;

            let chain = certs(&mut BufReader::new(pem.as_slice()))
                .map_err(|e| invalid_store(path, "PEM", e.to_string()))?;
            if chain.is_empty() {
                return Err(invalid_store(path, "PEM", "no certificates found"));
            }

            let keys = pkcs8_private_keys(&mut BufReader::new(pem.as_slice()))
                .map_err(|e| invalid_store(path, "PEM", e.to_string()))?;
            if keys.is_empty() {
                return Err(invalid_store(path, "PEM", "no PKCS#8 private key found"));
            }

            Ok(ClientIdentity::Pem {
                cert_pem: pem.clone(),
                key_pem: pem,
            })
        }
        _ => Err(SecurityConfigError::UnsupportedStoreType {
            role: "key",
            store_type,
        }),
    }
}

fn load_trust_chain(store: &StoreSection, path: &Path) -> Result<String, SecurityConfigError> {
    let store_type = store
        .store_type
        .as_deref()
        .unwrap_or(DEFAULT_TRUST_STORE_TYPE)
        .to_ascii_uppercase();

    if store_type != "PEM" {
        return Err(SecurityConfigError::UnsupportedStoreType {
            role: "trust",
            store_type,
        });
    }

    if store.password.as_deref().is_some_and(|p| !p.is_empty()) {
        warn!("tls.trust_store.password is ignored for PEM trust stores");
    }

    let pem = read_store(path)?;
    let chain = certs(&mut BufReader::new(pem.as_slice()))
        .map_err(|e| invalid_store(path, "PEM", e.to_string()))?;
    if chain.is_empty() {
        return Err(invalid_store(path, "PEM", "no certificates found"));
    }

    String::from_utf8(pem).map_err(|_| invalid_store(path, "PEM", "not valid UTF-8"))
}
